//! The reference checker.
//!
//! Answers whether a type, method or field (and its transitive type
//! obligations: super chain, interfaces, array elements, proto types)
//! is resolvable in the context of a particular store and a minimum-SDK
//! descriptor. Decisions are cached per entity; entries are write-once,
//! and a second computation must agree with the first.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::entities::{FieldId, MethodId, TypeId};
use crate::ir::insn::Payload;
use crate::ir::{DexClass, DexContext, IrCode, Scope};

/// Which store each internal type lives in. Store 0 is the root store;
/// every store may reference the root and itself.
#[derive(Default)]
pub struct StoreIndex {
    store_of: FxHashMap<TypeId, usize>,
}

impl StoreIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, ty: TypeId, store: usize) {
        self.store_of.insert(ty, store);
    }

    pub fn store_of(&self, ty: TypeId) -> Option<usize> {
        self.store_of.get(&ty).copied()
    }

    /// Whether code placed in `from` may reference `ty`.
    pub fn accessible(&self, ty: TypeId, from: usize) -> bool {
        match self.store_of(ty) {
            Some(store) => store == 0 || store == from,
            // Unassigned types carry no store constraint.
            None => true,
        }
    }
}

/// The signatures available at the configured minimum SDK level.
#[derive(Default)]
pub struct MinSdkApi {
    types: FxHashSet<TypeId>,
    methods: FxHashSet<MethodId>,
    fields: FxHashSet<FieldId>,
}

impl MinSdkApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, ty: TypeId) {
        self.types.insert(ty);
    }

    pub fn add_method(&mut self, m: MethodId) {
        self.methods.insert(m);
    }

    pub fn add_field(&mut self, f: FieldId) {
        self.fields.insert(f);
    }

    pub fn has_type(&self, ty: TypeId) -> bool {
        self.types.contains(&ty)
    }

    pub fn has_method(&self, m: MethodId) -> bool {
        self.methods.contains(&m)
    }

    pub fn has_field(&self, f: FieldId) -> bool {
        self.fields.contains(&f)
    }
}

/// A write-once decision cache. The first writer wins; later writers must
/// agree.
struct DecisionCache<K> {
    map: Mutex<FxHashMap<K, bool>>,
}

impl<K: std::hash::Hash + Eq + Copy> DecisionCache<K> {
    fn new() -> Self {
        Self {
            map: Mutex::new(FxHashMap::default()),
        }
    }

    fn get(&self, key: K) -> Option<bool> {
        self.map.lock().get(&key).copied()
    }

    fn put(&self, key: K, value: bool) -> bool {
        let mut map = self.map.lock();
        match map.get(&key) {
            Some(&existing) => {
                assert_eq!(existing, value, "conflicting cached decisions");
                existing
            }
            None => {
                map.insert(key, value);
                value
            }
        }
    }
}

/// All references occurring in one method body.
pub struct CodeRefs {
    pub types: Vec<TypeId>,
    pub methods: Vec<MethodId>,
    pub fields: Vec<FieldId>,
}

impl CodeRefs {
    pub fn new(code: &IrCode) -> Self {
        let mut refs = Self {
            types: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
        };
        for insn in code.insns() {
            match insn.payload() {
                Payload::Type(t) => refs.types.push(t),
                Payload::Method(m) => refs.methods.push(m),
                Payload::Field(f) => refs.fields.push(f),
                Payload::Literal(_) | Payload::String(_) | Payload::None => {}
            }
        }
        refs
    }
}

/// The checker. All functions are thread-safe.
pub struct RefChecker<'a> {
    ctx: &'a DexContext,
    scope: &'a Scope,
    stores: &'a StoreIndex,
    store_idx: usize,
    min_sdk: &'a MinSdkApi,
    type_cache: DecisionCache<TypeId>,
    method_cache: DecisionCache<MethodId>,
    field_cache: DecisionCache<FieldId>,
}

impl<'a> RefChecker<'a> {
    pub fn new(
        ctx: &'a DexContext,
        scope: &'a Scope,
        stores: &'a StoreIndex,
        store_idx: usize,
        min_sdk: &'a MinSdkApi,
    ) -> Self {
        Self {
            ctx,
            scope,
            stores,
            store_idx,
            min_sdk,
            type_cache: DecisionCache::new(),
            method_cache: DecisionCache::new(),
            field_cache: DecisionCache::new(),
        }
    }

    pub fn check_type(&self, ty: TypeId) -> bool {
        if let Some(decision) = self.type_cache.get(ty) {
            return decision;
        }
        let decision = self.check_type_uncached(ty);
        self.type_cache.put(ty, decision)
    }

    fn check_type_uncached(&self, ty: TypeId) -> bool {
        let ty = self.ctx.element_type_if_array(ty);
        if self.ctx.is_primitive(ty) {
            return true;
        }
        match self.scope.class(ty) {
            Some(cls) if !cls.is_external() => {
                if !self.stores.accessible(ty, self.store_idx) {
                    return false;
                }
                if let Some(sup) = cls.super_class() {
                    if !self.check_type(sup) {
                        return false;
                    }
                }
                cls.interfaces().iter().all(|&i| self.check_type(i))
            }
            _ => self.min_sdk.has_type(ty),
        }
    }

    pub fn check_method(&self, method: MethodId) -> bool {
        if let Some(decision) = self.method_cache.get(method) {
            return decision;
        }
        let decision = self.check_method_uncached(method);
        self.method_cache.put(method, decision)
    }

    fn check_method_uncached(&self, method: MethodId) -> bool {
        let data = self.ctx.method(method);
        if !self.check_type(data.class) {
            return false;
        }
        let proto = self.ctx.proto(data.proto);
        if !self.check_type(proto.rtype) || !proto.args.iter().all(|&a| self.check_type(a)) {
            return false;
        }
        let resolvable = crate::resolver::resolve_method(
            self.ctx,
            self.scope,
            method,
            crate::resolver::MethodSearch::Any,
        )
        .is_some();
        resolvable || self.min_sdk.has_method(method)
    }

    pub fn check_field(&self, field: FieldId) -> bool {
        if let Some(decision) = self.field_cache.get(field) {
            return decision;
        }
        let decision = self.check_field_uncached(field);
        self.field_cache.put(field, decision)
    }

    fn check_field_uncached(&self, field: FieldId) -> bool {
        let data = self.ctx.field(field);
        if !self.check_type(data.class) || !self.check_type(data.ty) {
            return false;
        }
        let resolvable = crate::resolver::resolve_field(
            self.ctx,
            self.scope,
            field,
            crate::resolver::FieldSearch::Any,
        )
        .is_some();
        resolvable || self.min_sdk.has_field(field)
    }

    /// Check the class itself plus its member signatures and method code.
    /// No cache for the class: a definition is typically checked once.
    pub fn check_class(&self, cls: &DexClass) -> bool {
        if !self.check_type(cls.ty()) {
            return false;
        }
        if !cls.all_fields().all(|f| self.check_field(f.field())) {
            return false;
        }
        cls.all_methods().all(|m| {
            if !self.check_method(m.method()) {
                return false;
            }
            m.with_code(|code| self.check_code_refs(&CodeRefs::new(code)))
                .unwrap_or(true)
        })
    }

    pub fn check_code_refs(&self, refs: &CodeRefs) -> bool {
        refs.types.iter().all(|&t| self.check_type(t))
            && refs.methods.iter().all(|&m| self.check_method(m))
            && refs.fields.iter().all(|&f| self.check_field(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AccessFlags, DexClass};

    #[test]
    fn internal_types_check_through_their_supers() {
        let ctx = DexContext::new();
        let mut scope = Scope::new();
        let object = ctx.known().object;
        let a = ctx.get_or_make_type("Lcom/example/A;");
        let b = ctx.get_or_make_type("Lcom/example/B;");

        let mut obj_cls = DexClass::new(object, None, AccessFlags::PUBLIC);
        obj_cls.set_external();
        scope.add_class(obj_cls);
        scope.add_class(DexClass::new(a, Some(object), AccessFlags::PUBLIC));
        scope.add_class(DexClass::new(b, Some(a), AccessFlags::PUBLIC));

        let stores = StoreIndex::new();
        let mut min_sdk = MinSdkApi::new();
        min_sdk.add_type(object);

        let checker = RefChecker::new(&ctx, &scope, &stores, 0, &min_sdk);
        assert!(checker.check_type(b));
        // Cached second query agrees.
        assert!(checker.check_type(b));

        // A type whose super is not in the SDK fails.
        let orphan = ctx.get_or_make_type("Lcom/example/Orphan;");
        let missing_super = ctx.get_or_make_type("Lcom/example/Missing;");
        let mut scope2 = Scope::new();
        scope2.add_class(DexClass::new(orphan, Some(missing_super), AccessFlags::PUBLIC));
        let checker2 = RefChecker::new(&ctx, &scope2, &stores, 0, &min_sdk);
        assert!(!checker2.check_type(orphan));
    }

    #[test]
    fn store_assignment_gates_cross_references() {
        let ctx = DexContext::new();
        let mut scope = Scope::new();
        let object = ctx.known().object;
        let mut obj_cls = DexClass::new(object, None, AccessFlags::PUBLIC);
        obj_cls.set_external();
        scope.add_class(obj_cls);

        let a = ctx.get_or_make_type("Lcom/example/A;");
        scope.add_class(DexClass::new(a, Some(object), AccessFlags::PUBLIC));

        let mut stores = StoreIndex::new();
        stores.assign(a, 2);
        let mut min_sdk = MinSdkApi::new();
        min_sdk.add_type(object);

        // From store 2 the type is fine; from store 1 it is not.
        let same = RefChecker::new(&ctx, &scope, &stores, 2, &min_sdk);
        assert!(same.check_type(a));
        let other = RefChecker::new(&ctx, &scope, &stores, 1, &min_sdk);
        assert!(!other.check_type(a));
    }
}
