//! Scope traversals.
//!
//! Higher-order walks over the classes, methods, fields and opcodes of a
//! [`Scope`], with parallel and accumulating variants. The parallel walks
//! partition the class list over a rayon pool; per-method closures get
//! exclusive access to the body they are handed and may intern new
//! entities, but must not add or remove classes or methods.

use rayon::prelude::*;

use crate::ir::class::{DexClass, FieldDef, MethodDef};
use crate::ir::insn::Insn;
use crate::ir::{IrCode, Scope};

pub fn classes(scope: &Scope, mut f: impl FnMut(&DexClass)) {
    for cls in scope.classes() {
        f(cls);
    }
}

pub fn methods(scope: &Scope, mut f: impl FnMut(&DexClass, &MethodDef)) {
    for cls in scope.classes() {
        for method in cls.all_methods() {
            f(cls, method);
        }
    }
}

pub fn fields(scope: &Scope, mut f: impl FnMut(&DexClass, &FieldDef)) {
    for cls in scope.classes() {
        for field in cls.all_fields() {
            f(cls, field);
        }
    }
}

/// Walk every instruction of every method body in the scope.
pub fn opcodes(scope: &Scope, mut f: impl FnMut(&MethodDef, &Insn)) {
    methods(scope, |_, method| {
        method.with_code(|code| {
            for insn in code.insns() {
                f(method, insn);
            }
        });
    });
}

/// Walk the methods that have a body, handing out the body itself.
pub fn code(scope: &Scope, mut f: impl FnMut(&MethodDef, &mut IrCode)) {
    methods(scope, |_, method| {
        method.with_code(|code| f(method, code));
    });
}

pub mod parallel {
    use super::*;

    /// Run `f` over every class, in parallel.
    pub fn classes(scope: &Scope, f: impl Fn(&DexClass) + Sync) {
        scope.classes().collect::<Vec<_>>().par_iter().for_each(|cls| f(cls));
    }

    /// Run `f` over every method, in parallel by class.
    pub fn methods(scope: &Scope, f: impl Fn(&DexClass, &MethodDef) + Sync) {
        classes(scope, |cls| {
            for method in cls.all_methods() {
                f(cls, method);
            }
        });
    }

    /// Run `f` over every field, in parallel by class.
    pub fn fields(scope: &Scope, f: impl Fn(&DexClass, &FieldDef) + Sync) {
        classes(scope, |cls| {
            for field in cls.all_fields() {
                f(cls, field);
            }
        });
    }

    /// Run `f` over every method and merge the returned values with the
    /// associative `merge`.
    pub fn methods_reduce<T, F, M>(scope: &Scope, f: F, merge: M, identity: T) -> T
    where
        T: Send + Sync + Clone,
        F: Fn(&DexClass, &MethodDef) -> T + Sync,
        M: Fn(T, T) -> T + Sync + Send,
    {
        scope
            .classes()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|cls| {
                let mut acc = identity.clone();
                for method in cls.all_methods() {
                    acc = merge(acc, f(cls, method));
                }
                acc
            })
            .reduce(|| identity.clone(), &merge)
    }

    /// Run `f` over every method body, in parallel.
    pub fn code(scope: &Scope, f: impl Fn(&MethodDef, &mut IrCode) + Sync) {
        methods(scope, |_, method| {
            method.with_code(|code| f(method, code));
        });
    }

    /// Run `f` over every instruction of every body, in parallel by class.
    pub fn opcodes(scope: &Scope, f: impl Fn(&MethodDef, &Insn) + Sync) {
        methods(scope, |_, method| {
            method.with_code(|code| {
                for insn in code.insns() {
                    f(method, insn);
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::*;
    use crate::ir::{AccessFlags, DexClass, DexContext, MethodDef};

    fn scope_with_methods(ctx: &DexContext, count: usize) -> Scope {
        let mut scope = Scope::new();
        let ty = ctx.get_or_make_type("Lcom/example/Many;");
        let mut cls = DexClass::new(ty, Some(ctx.known().object), AccessFlags::PUBLIC);
        for i in 0..count {
            let m = ctx.make_method("Lcom/example/Many;", &format!("m{i}"), &[], "V");
            let mut b = CodeBuilder::new(0);
            b.push(return_void());
            cls.add_method(
                ctx,
                MethodDef::new(m, AccessFlags::PUBLIC | AccessFlags::STATIC).with_code_body(b.build()),
            );
        }
        scope.add_class(cls);
        scope
    }

    #[test]
    fn sequential_and_parallel_counts_agree() {
        let ctx = DexContext::new();
        let scope = scope_with_methods(&ctx, 17);

        let mut sequential = 0usize;
        methods(&scope, |_, _| sequential += 1);

        let parallel = parallel::methods_reduce(&scope, |_, _| 1usize, |a, b| a + b, 0);
        assert_eq!(sequential, 17);
        assert_eq!(parallel, 17);
    }

    #[test]
    fn opcode_walk_sees_all_instructions() {
        let ctx = DexContext::new();
        let scope = scope_with_methods(&ctx, 3);
        let mut count = 0usize;
        opcodes(&scope, |_, _| count += 1);
        assert_eq!(count, 3);
    }
}
