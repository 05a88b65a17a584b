//! The core transformation primitives.

pub mod branch_reduce;
pub mod check_casts;
pub mod constprop;
pub mod dce;
pub mod gotos;
pub mod peephole;
pub mod throw_prop;

use rustc_hash::FxHashSet;

use crate::analysis::constprop::ConstantPropagation;
use crate::ir::entities::MethodId;
use crate::ir::{DexContext, IrCode, Scope};

pub use dce::LocalDce;
pub use peephole::PeepholeOptimizer;

/// The standard cleanup after a rewrite: constant propagation (with branch
/// folding) followed by local DCE. The analyzer chain is selected for
/// `method` when the caller knows which one is being shrunk, so
/// initializer and constructor bodies keep their field tracking.
pub fn shrink(
    ctx: &DexContext,
    scope: &Scope,
    pure_methods: &FxHashSet<MethodId>,
    method: Option<MethodId>,
    code: &mut IrCode,
) {
    code.build_cfg();
    {
        let cfg = code.cfg();
        let analysis = match method {
            Some(m) => ConstantPropagation::for_method(ctx, scope, m),
            None => ConstantPropagation::new(ctx, scope),
        };
        let fixpoint = analysis.run(cfg);
        constprop::Transform::apply(&analysis, &fixpoint, code.cfg_mut());
    }
    let dce = LocalDce::new(ctx, scope, pure_methods);
    dce.run_on_cfg(code.cfg_mut());
    code.clear_cfg(None);
}
