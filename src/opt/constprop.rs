//! The constant-propagation transform.
//!
//! Consumes the analysis of [`crate::analysis::constprop`]: materializes
//! registers the analysis proved constant, and replaces conditionals whose
//! outcome is decided (exactly one outgoing edge leads to a reachable
//! state) with unconditional transfers. Unreachable blocks are left for
//! the following dead-code sweep.

use log::trace;

use crate::analysis::constprop::ConstantPropagation;
use crate::analysis::fixpoint::{AbstractDomain, FixpointAnalyzer, FixpointIterator};
use crate::cfg::{CfgMutation, ControlFlowGraph, EdgeKind};
use crate::ir::insn::{Insn, Opcode};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Stats {
    pub materialized_consts: usize,
    pub branches_removed: usize,
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, rhs: Self) {
        self.materialized_consts += rhs.materialized_consts;
        self.branches_removed += rhs.branches_removed;
    }
}

pub struct Transform;

impl Transform {
    /// Apply the results of `analysis` (already run to `fixpoint`) to the
    /// graph.
    pub fn apply(
        analysis: &ConstantPropagation<'_>,
        fixpoint: &FixpointIterator<ConstantPropagation<'_>>,
        cfg: &mut ControlFlowGraph,
    ) -> Stats {
        let mut stats = Stats::default();
        stats.materialized_consts = Self::materialize_consts(analysis, fixpoint, cfg);
        stats.branches_removed = Self::fold_branches(analysis, fixpoint, cfg);
        stats
    }

    /// Replace side-effect-free computations whose results are known with
    /// constant loads.
    fn materialize_consts(
        analysis: &ConstantPropagation<'_>,
        fixpoint: &FixpointIterator<ConstantPropagation<'_>>,
        cfg: &mut ControlFlowGraph,
    ) -> usize {
        let mut mutation = CfgMutation::new();
        let mut count = 0;
        for block in cfg.blocks() {
            let mut env = fixpoint.entry_state_at(block);
            if env.is_bottom() {
                continue;
            }
            for insn in cfg.block_insns(block) {
                analysis.analyze_insn(insn, &mut env);
                let op = insn.opcode();
                let replaceable = op == Opcode::Move
                    || op.is_cmp()
                    || op.is_binop_lit()
                    || op.is_binop()
                    || op.is_unop();
                if !replaceable || op.dest_is_wide() {
                    continue;
                }
                let dest = insn.dest();
                if let Some(c) = env.get(dest).constant() {
                    trace!("materializing constant {c} into v{dest}");
                    let mut konst = Insn::new(Opcode::Const);
                    konst.set_dest(dest).set_literal(c);
                    mutation.replace(insn.uid(), vec![konst]);
                    count += 1;
                }
            }
        }
        mutation.flush(cfg);
        count
    }

    /// Rewrite conditionals and switches with a decided outcome into
    /// gotos, removing the dead edges.
    fn fold_branches(
        analysis: &ConstantPropagation<'_>,
        fixpoint: &FixpointIterator<ConstantPropagation<'_>>,
        cfg: &mut ControlFlowGraph,
    ) -> usize {
        let mut to_fold = Vec::new();
        for block in cfg.blocks() {
            let Some(last) = cfg.last_insn(block) else {
                continue;
            };
            let op = last.opcode();
            if !op.is_conditional_branch() && op != Opcode::Switch {
                continue;
            }
            let exit = fixpoint.exit_state_at(block);
            if exit.is_bottom() {
                continue;
            }
            let outgoing: Vec<_> = cfg
                .succ_edges(block)
                .iter()
                .copied()
                .filter(|&e| {
                    let kind = cfg.edge(e).kind;
                    kind.is_branch() || kind == EdgeKind::Goto
                })
                .collect();
            let live: Vec<_> = outgoing
                .iter()
                .copied()
                .filter(|&e| !analysis.analyze_edge(cfg, e, &exit).is_bottom())
                .collect();
            if live.len() == 1 && outgoing.len() > 1 {
                to_fold.push((block, live[0]));
            }
        }
        let count = to_fold.len();
        for (block, keep) in to_fold {
            trace!("folding decided branch in {block}");
            cfg.replace_branch_with_goto(block, keep);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::*;
    use crate::ir::{DexContext, Opcode, Scope};

    #[test]
    fn folds_constant_addition() {
        let ctx = DexContext::new();
        let scope = Scope::new();

        // v0 = 2; v1 = v0 + 3; return v1
        let mut b = CodeBuilder::new(2);
        b.push(const_insn(0, 2));
        b.push(binop_lit(Opcode::AddIntLit, 1, 0, 3));
        b.push(return_value(1));
        let mut code = b.build();

        code.build_cfg();
        let analysis = ConstantPropagation::new(&ctx, &scope);
        let fixpoint = analysis.run(code.cfg());
        let stats = Transform::apply(&analysis, &fixpoint, code.cfg_mut());
        code.clear_cfg(None);

        assert_eq!(stats.materialized_consts, 1);
        let insns: Vec<_> = code.insns().collect();
        assert_eq!(insns[1].opcode(), Opcode::Const);
        assert_eq!(insns[1].literal(), 5);
    }

    #[test]
    fn folds_decided_branch() {
        let ctx = DexContext::new();
        let scope = Scope::new();

        // v0 = 0; if-nez v0 -> taken; fallthrough returns.
        let mut b = CodeBuilder::new(1);
        let taken = b.fresh_label();
        b.push(const_insn(0, 0));
        b.branch(if_insn(Opcode::IfNez, &[0]), taken);
        b.push(return_void());
        b.label(taken);
        b.push(return_void());
        let mut code = b.build();

        code.build_cfg();
        let analysis = ConstantPropagation::new(&ctx, &scope);
        let fixpoint = analysis.run(code.cfg());
        let stats = Transform::apply(&analysis, &fixpoint, code.cfg_mut());
        code.cfg_mut().remove_unreachable_blocks();
        code.clear_cfg(None);

        assert_eq!(stats.branches_removed, 1);
        assert_eq!(opcodes_of(&code), vec![Opcode::Const, Opcode::ReturnVoid]);
    }
}
