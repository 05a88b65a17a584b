//! Evaluation of `instance-of` and `check-cast` against inferred types.
//!
//! Type inference yields the best known declared type of the tested
//! register; the hierarchy then decides the check statically where it can.
//! Always-true instance-ofs whose boolean flows only through moves into a
//! single zero-test become a null test of the original register;
//! always-false ones pin the result to zero. Always-true check-casts
//! become plain moves. After rewriting, the method is re-shrunk (constant
//! propagation plus local DCE) to sweep the residue.

use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::reaching_defs::{compute_def_use_chains, ReachingDefinitions};
use crate::analysis::type_inference::TypeInference;
use crate::cfg::{CfgMutation, ControlFlowGraph};
use crate::ir::entities::{InsnUid, MethodId, TypeId};
use crate::ir::insn::{Insn, Opcode};
use crate::ir::{DexContext, IrCode, Scope};
use crate::opt::shrink;
use crate::resolver::evaluate_type_check;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Stats {
    pub always_true_instance_ofs: usize,
    pub branch_tests_rewritten: usize,
    pub always_false_instance_ofs: usize,
    pub check_casts_removed: usize,
    pub always_false_check_casts: usize,
    pub redundant_casts_removed: usize,
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, rhs: Self) {
        self.always_true_instance_ofs += rhs.always_true_instance_ofs;
        self.branch_tests_rewritten += rhs.branch_tests_rewritten;
        self.always_false_instance_ofs += rhs.always_false_instance_ofs;
        self.check_casts_removed += rhs.check_casts_removed;
        self.always_false_check_casts += rhs.always_false_check_casts;
        self.redundant_casts_removed += rhs.redundant_casts_removed;
    }
}

/// The signature context of the method being rewritten. The method
/// reference, when the driver has one, selects the analyzer chain of the
/// cleanup shrink.
#[derive(Clone, Copy)]
pub struct MethodContext<'a> {
    pub is_static: bool,
    pub declaring: TypeId,
    pub args: &'a [TypeId],
    pub method: Option<MethodId>,
}

pub struct EvaluateTypeChecks<'a> {
    ctx: &'a DexContext,
    scope: &'a Scope,
    pure_methods: &'a FxHashSet<MethodId>,
}

impl<'a> EvaluateTypeChecks<'a> {
    pub fn new(
        ctx: &'a DexContext,
        scope: &'a Scope,
        pure_methods: &'a FxHashSet<MethodId>,
    ) -> Self {
        Self {
            ctx,
            scope,
            pure_methods,
        }
    }

    pub fn optimize(&self, method: MethodContext<'_>, code: &mut IrCode) -> Stats {
        let mut has_instance_of = false;
        let mut has_check_cast = false;
        for insn in code.insns() {
            match insn.opcode() {
                Opcode::InstanceOf => has_instance_of = true,
                Opcode::CheckCast => has_check_cast = true,
                _ => {}
            }
        }
        let mut stats = Stats::default();
        if has_instance_of {
            let changed = self.evaluate_instance_ofs(method, code, &mut stats);
            if changed {
                shrink(self.ctx, self.scope, self.pure_methods, method.method, code);
            }
        }
        if has_check_cast {
            let changed = self.evaluate_check_casts(method, code, &mut stats);
            stats.redundant_casts_removed = self.remove_redundant_casts(code);
            if changed || stats.redundant_casts_removed > 0 {
                shrink(self.ctx, self.scope, self.pure_methods, method.method, code);
            }
        }
        stats
    }

    fn run_inference(
        &self,
        cfg: &ControlFlowGraph,
        method: MethodContext<'_>,
    ) -> crate::analysis::TypeInferenceResult {
        TypeInference::new(self.ctx, self.scope).run(
            cfg,
            method.is_static,
            method.declaring,
            method.args,
            &FxHashMap::default(),
        )
    }

    fn evaluate_instance_ofs(
        &self,
        method: MethodContext<'_>,
        code: &mut IrCode,
        stats: &mut Stats,
    ) -> bool {
        code.build_cfg();
        let mut changed = false;
        let mut true_modulo_null: Vec<InsnUid> = Vec::new();
        {
            let cfg = code.cfg();
            let inference_result = self.run_inference(cfg, method);
            let mut mutation = CfgMutation::new();
            for loc in cfg.insn_locs() {
                let insn = cfg.insn_at(loc);
                if insn.opcode() != Opcode::InstanceOf {
                    continue;
                }
                let Some(state) = inference_result.environment_before(insn.uid()) else {
                    continue;
                };
                let Some(src_ty) = state.get_dex_type(insn.src(0)) else {
                    continue;
                };
                let Some(eval) =
                    evaluate_type_check(self.ctx, self.scope, src_ty, insn.type_ref())
                else {
                    continue;
                };
                if eval == 1 {
                    trace!("instance-of always succeeds (or null input)");
                    true_modulo_null.push(insn.uid());
                    stats.always_true_instance_ofs += 1;
                    continue;
                }
                debug_assert_eq!(eval, 0);
                let Some(pseudo) = cfg.move_result_of(loc) else {
                    continue;
                };
                let dest = cfg.insn_at(pseudo).dest();
                let mut konst = Insn::new(Opcode::Const);
                konst.set_dest(dest).set_literal(0);
                mutation.insert_after(cfg.insn_at(pseudo).uid(), vec![konst]);
                stats.always_false_instance_ofs += 1;
                changed = true;
            }
            mutation.flush(code.cfg_mut());
        }
        if self.rewrite_true_instance_ofs(code.cfg_mut(), &true_modulo_null, stats) {
            changed = true;
        }
        code.clear_cfg(None);
        changed
    }

    /// An always-true instance-of is a null check in disguise. When its
    /// boolean flows only through moves into a single `if-eqz`/`if-nez`,
    /// test the object register directly; the dead instance-of is left to
    /// the following shrink.
    fn rewrite_true_instance_ofs(
        &self,
        cfg: &mut ControlFlowGraph,
        true_modulo_null: &[InsnUid],
        stats: &mut Stats,
    ) -> bool {
        if true_modulo_null.is_empty() {
            return false;
        }
        let chains = compute_def_use_chains(cfg, &ReachingDefinitions::plain());
        let mut mutation = CfgMutation::new();
        let mut rewrites: Vec<(InsnUid, crate::ir::Reg)> = Vec::new();
        for &uid in true_modulo_null {
            let Some(loc) = cfg.find_insn(uid) else { continue };
            let Some(pseudo) = cfg.move_result_of(loc) else {
                continue;
            };
            let Some(terminal) = self.single_terminal_use(cfg, &chains, cfg.insn_at(pseudo).uid())
            else {
                continue;
            };
            let Some(terminal_loc) = cfg.find_insn(terminal) else {
                continue;
            };
            let terminal_op = cfg.insn_at(terminal_loc).opcode();
            if terminal_op != Opcode::IfEqz && terminal_op != Opcode::IfNez {
                continue;
            }
            // The object register may be overwritten between here and the
            // branch; keep an unclobbered copy in a temp.
            let src = cfg.insn_at(loc).src(0);
            let temp = cfg.allocate_temp();
            let mut copy = Insn::new(Opcode::MoveObject);
            copy.set_dest(temp).set_src(0, src);
            mutation.insert_before(uid, vec![copy]);
            rewrites.push((terminal, temp));
        }
        let any = !rewrites.is_empty();
        mutation.flush(cfg);
        for (terminal, temp) in rewrites {
            let loc = cfg.find_insn(terminal).expect("branch vanished mid-rewrite");
            cfg.insn_at_mut(loc).set_src(0, temp);
            stats.branch_tests_rewritten += 1;
        }
        any
    }

    /// Walk the def-use chain from `start` through moves to the only
    /// consumer, or `None` when the value fans out, loops, or feeds a
    /// non-move.
    fn single_terminal_use(
        &self,
        cfg: &ControlFlowGraph,
        chains: &crate::analysis::DefUseChains,
        start: InsnUid,
    ) -> Option<InsnUid> {
        let mut seen = FxHashSet::default();
        let mut current = start;
        loop {
            if !seen.insert(current) {
                // The chain loops.
                return None;
            }
            let uses = chains.uses_of(current);
            if uses.is_empty() {
                return Some(current);
            }
            if uses.len() > 1 {
                // The value fans out; not a simple chain.
                return None;
            }
            let op = cfg.find_insn(current).map(|l| cfg.insn_at(l).opcode())?;
            if !op.is_move() && !op.is_move_result_pseudo() {
                // Something other than a move consumes and re-produces the
                // value; give up.
                return None;
            }
            current = uses[0].insn;
        }
    }

    fn evaluate_check_casts(
        &self,
        method: MethodContext<'_>,
        code: &mut IrCode,
        stats: &mut Stats,
    ) -> bool {
        code.build_cfg();
        let mut changed = false;
        {
            let cfg = code.cfg();
            let inference_result = self.run_inference(cfg, method);
            let mut mutation = CfgMutation::new();
            for loc in cfg.insn_locs() {
                let insn = cfg.insn_at(loc);
                if insn.opcode() != Opcode::CheckCast {
                    continue;
                }
                let Some(state) = inference_result.environment_before(insn.uid()) else {
                    continue;
                };
                let Some(src_ty) = state.get_dex_type(insn.src(0)) else {
                    continue;
                };
                let Some(eval) =
                    evaluate_type_check(self.ctx, self.scope, src_ty, insn.type_ref())
                else {
                    continue;
                };
                let Some(pseudo) = cfg.move_result_of(loc) else {
                    continue;
                };
                let dest = cfg.insn_at(pseudo).dest();
                if eval == 0 {
                    // A prior rewrite may already pin the register.
                    if let Some(next) = cfg.next_insn_in_block(pseudo) {
                        let next_insn = cfg.insn_at(next);
                        if next_insn.opcode() == Opcode::Const && next_insn.dest() == dest {
                            continue;
                        }
                    }
                    let mut konst = Insn::new(Opcode::Const);
                    konst.set_dest(dest).set_literal(0);
                    mutation.insert_after(cfg.insn_at(pseudo).uid(), vec![konst]);
                    stats.always_false_check_casts += 1;
                    changed = true;
                    continue;
                }
                debug_assert_eq!(eval, 1);
                trace!("check-cast always succeeds; rewriting to a move");
                let mut mv = Insn::new(Opcode::MoveObject);
                mv.set_dest(dest).set_src(0, insn.src(0));
                mutation.replace(insn.uid(), vec![mv]);
                stats.check_casts_removed += 1;
                changed = true;
            }
            let cfg = code.cfg_mut();
            mutation.flush(cfg);
        }
        code.clear_cfg(None);
        changed
    }

    /// The windowed rule: a check-cast directly after an invoke whose
    /// declared return type already satisfies the cast is redundant.
    fn remove_redundant_casts(&self, code: &mut IrCode) -> usize {
        code.build_cfg();
        let mut removed = 0;
        {
            let cfg = code.cfg();
            let mut mutation = CfgMutation::new();
            for block in cfg.blocks() {
                let insns: Vec<&Insn> = cfg.block_insns(block).collect();
                for window in insns.windows(4) {
                    let [invoke, move_result, cast, pseudo] = window else {
                        unreachable!()
                    };
                    if !invoke.opcode().is_invoke()
                        || move_result.opcode() != Opcode::MoveResultObject
                        || cast.opcode() != Opcode::CheckCast
                        || pseudo.opcode() != Opcode::MoveResultPseudoObject
                    {
                        continue;
                    }
                    if move_result.dest() != cast.src(0) || pseudo.dest() != cast.src(0) {
                        continue;
                    }
                    let rtype = self
                        .ctx
                        .proto(self.ctx.method(invoke.method_ref()).proto)
                        .rtype;
                    if crate::resolver::check_cast(self.ctx, self.scope, rtype, cast.type_ref()) {
                        mutation.remove(cast.uid());
                        removed += 1;
                    }
                }
            }
            let cfg = code.cfg_mut();
            mutation.flush(cfg);
        }
        code.clear_cfg(None);
        removed
    }
}
