//! Reference resolution and class hierarchy queries.
//!
//! The search policies direct how lookup walks the hierarchy more than what
//! kind of member is wanted: `Direct` and `Static` both look at direct
//! methods, but `Static` walks up the super chain while `Direct` stays in
//! the named class, matching the VM's resolution semantics per invoke kind.

use rustc_hash::FxHashMap;

use crate::ir::{DexContext, FieldId, MethodId, Opcode, Scope, TypeId};

/// Type of method search to perform.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MethodSearch {
    /// invoke-direct: private and init methods, in the named class only.
    Direct,
    /// invoke-static: direct methods, up the hierarchy.
    Static,
    /// invoke-virtual / invoke-super: virtual methods, up the hierarchy.
    Virtual,
    /// invoke-interface: virtual methods, up the hierarchy and across the
    /// transitively implemented interface set.
    InterfaceVirtual,
    /// Virtual first, then direct.
    Any,
}

/// Map an invoke opcode to its search policy.
pub fn search_for_invoke(op: Opcode) -> MethodSearch {
    match op {
        Opcode::InvokeDirect => MethodSearch::Direct,
        Opcode::InvokeStatic => MethodSearch::Static,
        Opcode::InvokeVirtual | Opcode::InvokeSuper => MethodSearch::Virtual,
        Opcode::InvokeInterface => MethodSearch::InterfaceVirtual,
        _ => panic!("search_for_invoke: {op:?} is not an invoke"),
    }
}

/// A per-caller resolution cache: ref to def.
pub type MethodRefCache = FxHashMap<MethodId, MethodId>;

/// Resolve a method reference to its unique definition, or `None` when the
/// declaring class or the definition is unknown.
pub fn resolve_method(
    ctx: &DexContext,
    scope: &Scope,
    mref: MethodId,
    search: MethodSearch,
) -> Option<MethodId> {
    let data = ctx.method(mref);
    match search {
        MethodSearch::Direct => {
            let cls = scope.class(data.class)?;
            cls.find_dmethod(ctx, data.name, data.proto).map(|m| m.method())
        }
        MethodSearch::Static => walk_supers(scope, data.class, |cls| {
            cls.find_dmethod(ctx, data.name, data.proto).map(|m| m.method())
        }),
        MethodSearch::Virtual => walk_supers(scope, data.class, |cls| {
            cls.find_vmethod(ctx, data.name, data.proto).map(|m| m.method())
        }),
        MethodSearch::InterfaceVirtual => {
            let found = walk_supers(scope, data.class, |cls| {
                cls.find_vmethod(ctx, data.name, data.proto).map(|m| m.method())
            });
            if found.is_some() {
                return found;
            }
            // Breadth-first over the transitively implemented interfaces.
            let mut queue: Vec<TypeId> = Vec::new();
            let mut seen: Vec<TypeId> = Vec::new();
            collect_interfaces(scope, data.class, &mut queue, &mut seen);
            while let Some(intf) = queue.pop() {
                if let Some(cls) = scope.class(intf) {
                    if let Some(m) = cls.find_vmethod(ctx, data.name, data.proto) {
                        return Some(m.method());
                    }
                    for &i in cls.interfaces() {
                        if !seen.contains(&i) {
                            seen.push(i);
                            queue.push(i);
                        }
                    }
                }
            }
            None
        }
        MethodSearch::Any => resolve_method(ctx, scope, mref, MethodSearch::Virtual)
            .or_else(|| resolve_method(ctx, scope, mref, MethodSearch::Direct)),
    }
}

/// Resolve with a per-caller cache. First resolution wins; hits skip the
/// hierarchy walk entirely.
pub fn resolve_method_cached(
    ctx: &DexContext,
    scope: &Scope,
    mref: MethodId,
    search: MethodSearch,
    cache: &mut MethodRefCache,
) -> Option<MethodId> {
    if let Some(&def) = cache.get(&mref) {
        return Some(def);
    }
    let def = resolve_method(ctx, scope, mref, search)?;
    cache.insert(mref, def);
    Some(def)
}

/// Which field lists a field lookup searches.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FieldSearch {
    Static,
    Instance,
    Any,
}

/// Resolve a field reference to its definition, walking the super chain.
pub fn resolve_field(
    ctx: &DexContext,
    scope: &Scope,
    fref: FieldId,
    search: FieldSearch,
) -> Option<FieldId> {
    let data = ctx.field(fref);
    walk_supers(scope, data.class, |cls| {
        let found = match search {
            FieldSearch::Static => cls.sfields().iter().find(|f| {
                let d = ctx.field(f.field());
                d.name == data.name && d.ty == data.ty
            }),
            FieldSearch::Instance => cls.ifields().iter().find(|f| {
                let d = ctx.field(f.field());
                d.name == data.name && d.ty == data.ty
            }),
            FieldSearch::Any => cls.find_field(ctx, data.name, data.ty),
        };
        found.map(|f| f.field())
    })
}

fn walk_supers<R>(
    scope: &Scope,
    start: TypeId,
    mut f: impl FnMut(&crate::ir::DexClass) -> Option<R>,
) -> Option<R> {
    let mut cur = Some(start);
    while let Some(ty) = cur {
        let cls = scope.class(ty)?;
        if let Some(r) = f(cls) {
            return Some(r);
        }
        cur = cls.super_class();
    }
    None
}

fn collect_interfaces(scope: &Scope, start: TypeId, queue: &mut Vec<TypeId>, seen: &mut Vec<TypeId>) {
    let mut cur = Some(start);
    while let Some(ty) = cur {
        let Some(cls) = scope.class(ty) else { break };
        for &i in cls.interfaces() {
            if !seen.contains(&i) {
                seen.push(i);
                queue.push(i);
            }
        }
        cur = cls.super_class();
    }
}

/// True iff `parent` appears on `child`'s super chain (reflexively).
pub fn is_subclass(scope: &Scope, parent: TypeId, child: TypeId) -> bool {
    let mut cur = Some(child);
    while let Some(ty) = cur {
        if ty == parent {
            return true;
        }
        match scope.class(ty) {
            Some(cls) => cur = cls.super_class(),
            None => return false,
        }
    }
    false
}

/// Whether a cast of a value of type `ty` to `base` is guaranteed to
/// succeed. Extends the subtype walk across arrays and transitively across
/// implemented interfaces; missing class information answers `false`.
pub fn check_cast(ctx: &DexContext, scope: &Scope, ty: TypeId, base: TypeId) -> bool {
    if ty == base {
        return true;
    }
    if ctx.is_array(ty) {
        if ctx.is_array(base) {
            let comp = ctx.array_component(ty).unwrap();
            let comp_base = ctx.array_component(base).unwrap();
            if !ctx.is_primitive(comp)
                && !ctx.is_primitive(comp_base)
                && check_cast(ctx, scope, comp, comp_base)
            {
                return true;
            }
        }
        return base == ctx.known().object;
    }
    let Some(cls) = scope.class(ty) else {
        return false;
    };
    if let Some(sup) = cls.super_class() {
        if check_cast(ctx, scope, sup, base) {
            return true;
        }
    }
    cls.interfaces()
        .iter()
        .any(|&intf| check_cast(ctx, scope, intf, base))
}

/// Statically evaluate an `instance-of`/`check-cast` of a value whose best
/// known type is `src` against `test`. `Some(1)` means the check always
/// succeeds (modulo null), `Some(0)` that it always fails, `None` that the
/// outcome is unknown.
pub fn evaluate_type_check(
    ctx: &DexContext,
    scope: &Scope,
    src: TypeId,
    test: TypeId,
) -> Option<i32> {
    if test == src {
        return Some(1);
    }
    if test == ctx.known().object {
        return Some(1);
    }

    let test_cls = scope.class(test)?;
    let src_cls = scope.class(src)?;

    // Only internal definitions are set in stone; SDK classes may differ at
    // runtime.
    if test_cls.is_external() || src_cls.is_external() {
        return None;
    }

    // Class vs class only; interfaces can be implemented anywhere below.
    if !test_cls.is_interface() && !src_cls.is_interface() {
        if check_cast(ctx, scope, src, test) {
            return Some(1);
        } else if !check_cast(ctx, scope, test, src) {
            return Some(0);
        }
        return None;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AccessFlags, DexClass, MethodDef};

    /// A tiny hierarchy: Base <- Mid <- Leaf, Mid implements Iface.
    fn hierarchy(ctx: &DexContext) -> Scope {
        let mut scope = Scope::new();
        let object = ctx.known().object;
        let base = ctx.get_or_make_type("Lcom/example/Base;");
        let mid = ctx.get_or_make_type("Lcom/example/Mid;");
        let leaf = ctx.get_or_make_type("Lcom/example/Leaf;");
        let iface = ctx.get_or_make_type("Lcom/example/Iface;");

        let mut object_cls = DexClass::new(object, None, AccessFlags::PUBLIC);
        object_cls.set_external();
        scope.add_class(object_cls);

        let mut base_cls = DexClass::new(base, Some(object), AccessFlags::PUBLIC);
        let base_foo = ctx.make_method("Lcom/example/Base;", "foo", &[], "V");
        base_cls.add_method(ctx, MethodDef::new(base_foo, AccessFlags::PUBLIC));
        scope.add_class(base_cls);

        let mut iface_cls = DexClass::new(
            iface,
            Some(object),
            AccessFlags::PUBLIC | AccessFlags::INTERFACE,
        );
        let iface_bar = ctx.make_method("Lcom/example/Iface;", "bar", &[], "V");
        iface_cls.add_method(
            ctx,
            MethodDef::new(iface_bar, AccessFlags::PUBLIC | AccessFlags::ABSTRACT),
        );
        scope.add_class(iface_cls);

        let mut mid_cls = DexClass::new(mid, Some(base), AccessFlags::PUBLIC);
        mid_cls.add_interface(iface);
        scope.add_class(mid_cls);

        scope.add_class(DexClass::new(leaf, Some(mid), AccessFlags::PUBLIC));
        scope
    }

    #[test]
    fn virtual_resolution_walks_supers() {
        let ctx = DexContext::new();
        let scope = hierarchy(&ctx);
        // A ref to Leaf.foo resolves to the definition on Base.
        let leaf_foo = ctx.make_method("Lcom/example/Leaf;", "foo", &[], "V");
        let base_foo = ctx.make_method("Lcom/example/Base;", "foo", &[], "V");
        assert_eq!(
            resolve_method(&ctx, &scope, leaf_foo, MethodSearch::Virtual),
            Some(base_foo)
        );
        // Direct search does not walk.
        assert_eq!(
            resolve_method(&ctx, &scope, leaf_foo, MethodSearch::Direct),
            None
        );
    }

    #[test]
    fn interface_resolution_searches_implemented_set() {
        let ctx = DexContext::new();
        let scope = hierarchy(&ctx);
        let leaf_bar = ctx.make_method("Lcom/example/Leaf;", "bar", &[], "V");
        let iface_bar = ctx.make_method("Lcom/example/Iface;", "bar", &[], "V");
        assert_eq!(
            resolve_method(&ctx, &scope, leaf_bar, MethodSearch::InterfaceVirtual),
            Some(iface_bar)
        );
        assert_eq!(
            resolve_method(&ctx, &scope, leaf_bar, MethodSearch::Virtual),
            None
        );
    }

    #[test]
    fn resolution_cache_hits() {
        let ctx = DexContext::new();
        let scope = hierarchy(&ctx);
        let leaf_foo = ctx.make_method("Lcom/example/Leaf;", "foo", &[], "V");
        let mut cache = MethodRefCache::default();
        let first =
            resolve_method_cached(&ctx, &scope, leaf_foo, MethodSearch::Virtual, &mut cache);
        assert!(first.is_some());
        assert_eq!(cache.len(), 1);
        let second =
            resolve_method_cached(&ctx, &scope, leaf_foo, MethodSearch::Virtual, &mut cache);
        assert_eq!(first, second);
    }

    #[test]
    fn subtype_and_cast_checks() {
        let ctx = DexContext::new();
        let scope = hierarchy(&ctx);
        let base = ctx.get_or_make_type("Lcom/example/Base;");
        let mid = ctx.get_or_make_type("Lcom/example/Mid;");
        let leaf = ctx.get_or_make_type("Lcom/example/Leaf;");
        let iface = ctx.get_or_make_type("Lcom/example/Iface;");

        assert!(is_subclass(&scope, base, leaf));
        assert!(!is_subclass(&scope, leaf, base));
        assert!(check_cast(&ctx, &scope, leaf, iface));
        assert!(check_cast(&ctx, &scope, mid, base));
        assert!(!check_cast(&ctx, &scope, base, mid));

        // Arrays: [Leaf castable to [Base and to Object.
        let leaf_arr = ctx.make_array_type(leaf);
        let base_arr = ctx.make_array_type(base);
        assert!(check_cast(&ctx, &scope, leaf_arr, base_arr));
        assert!(check_cast(&ctx, &scope, leaf_arr, ctx.known().object));
        let int_arr = ctx.get_or_make_type("[I");
        assert!(!check_cast(&ctx, &scope, int_arr, base_arr));
    }

    #[test]
    fn evaluate_type_check_ladder() {
        let ctx = DexContext::new();
        let scope = hierarchy(&ctx);
        let base = ctx.get_or_make_type("Lcom/example/Base;");
        let mid = ctx.get_or_make_type("Lcom/example/Mid;");
        let leaf = ctx.get_or_make_type("Lcom/example/Leaf;");
        let unrelated = ctx.get_or_make_type("Lcom/example/Other;");

        // Trivially true.
        assert_eq!(evaluate_type_check(&ctx, &scope, leaf, leaf), Some(1));
        assert_eq!(
            evaluate_type_check(&ctx, &scope, leaf, ctx.known().object),
            Some(1)
        );
        // Subtype: always true.
        assert_eq!(evaluate_type_check(&ctx, &scope, leaf, base), Some(1));
        // Supertype: could go either way.
        assert_eq!(evaluate_type_check(&ctx, &scope, base, mid), None);
        // Unknown class: no answer.
        assert_eq!(evaluate_type_check(&ctx, &scope, leaf, unrelated), None);
    }
}
