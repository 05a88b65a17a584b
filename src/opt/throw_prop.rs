//! Throw propagation.
//!
//! When an invoked method provably never returns (every path in the
//! callee throws or loops; the caller supplies the predicate), everything
//! after the call site is dead. The code following the invoke is replaced
//! by `const 0; throw` unless the walk forward through gotos already
//! reaches a throw, an unreachable, or a loop.

use log::trace;
use rustc_hash::FxHashSet;

use crate::cfg::{ControlFlowGraph, EdgeKind, InsnLoc};
use crate::ir::insn::{Insn, Opcode, Reg};
use crate::ir::{DexContext, IrCode};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Stats {
    pub throws_inserted: usize,
}

pub struct ThrowPropagator<'a> {
    ctx: &'a DexContext,
    /// One temp is enough per method; every inserted throw reuses it.
    reg: Option<Reg>,
}

impl<'a> ThrowPropagator<'a> {
    pub fn new(ctx: &'a DexContext) -> Self {
        Self { ctx, reg: None }
    }

    /// Truncate dead continuations after invokes that `never_returns`
    /// accepts.
    pub fn run(
        &mut self,
        code: &mut IrCode,
        never_returns: &dyn Fn(&Insn) -> bool,
    ) -> Stats {
        code.build_cfg();
        let mut stats = Stats::default();
        let cfg = code.cfg_mut();
        for loc in cfg.insn_locs() {
            // Mutation below never invalidates earlier snapshot entries:
            // splitting only moves instructions into fresh blocks behind
            // the current one.
            let Some(loc) = revalidate(cfg, loc) else {
                continue;
            };
            let insn = cfg.insn_at(loc);
            if !insn.opcode().is_invoke() || !never_returns(insn) {
                continue;
            }
            if self.try_apply(cfg, loc) {
                stats.throws_inserted += 1;
            }
        }
        cfg.remove_unreachable_blocks();
        cfg.recompute_registers_size();
        code.clear_cfg(None);
        stats
    }

    fn try_apply(&mut self, cfg: &mut ControlFlowGraph, loc: InsnLoc) -> bool {
        if !self.prepare_block(cfg, loc) {
            return false;
        }
        self.insert_throw(cfg, loc.block);
        true
    }

    /// Returns false when there is no point in rewriting (the code after
    /// the invoke already throws or never terminates); otherwise makes
    /// the invoke the last instruction of its block.
    fn prepare_block(&self, cfg: &mut ControlFlowGraph, loc: InsnLoc) -> bool {
        if self.will_throw_or_not_terminate(cfg, loc) {
            return false;
        }
        let last = cfg
            .block_insns(loc.block)
            .last()
            .expect("invoke's block has instructions");
        let is_last = {
            let insn = cfg.insn_at(loc);
            // The move-result still belongs to the call site.
            last.uid() == insn.uid()
                || cfg
                    .move_result_of(loc)
                    .map_or(false, |mr| cfg.insn_at(mr).uid() == last.uid())
        };
        if !is_last {
            trace!("splitting block after non-returning invoke");
            cfg.split_block(loc);
        }
        true
    }

    /// Walk forward from `loc` through gotos. True when execution
    /// provably ends in a throw, an unreachable, a loop, or a benign
    /// exception-construction prologue.
    fn will_throw_or_not_terminate(&self, cfg: &ControlFlowGraph, loc: InsnLoc) -> bool {
        let mut visited: FxHashSet<crate::ir::InsnUid> = FxHashSet::default();
        visited.insert(cfg.insn_at(loc).uid());
        let mut it = loc;
        loop {
            let Some(next) = cfg.next_following_gotos(it) else {
                // Dead end or a goto cycle of empty blocks.
                return true;
            };
            it = next;
            let insn = cfg.insn_at(it);
            if !visited.insert(insn.uid()) {
                // We found a loop.
                return true;
            }
            match insn.opcode() {
                Opcode::Const
                | Opcode::ConstString
                | Opcode::Move
                | Opcode::Nop
                | Opcode::NewInstance
                | Opcode::MoveResultObject
                | Opcode::MoveResultPseudoObject => {}
                Opcode::InvokeDirect => {
                    // Constructing the exception about to be thrown.
                    let data = self.ctx.method(insn.method_ref());
                    let init = self.ctx.get_string("<init>");
                    if Some(data.name) != init
                        || data.class != self.ctx.known().runtime_exception
                    {
                        return false;
                    }
                }
                Opcode::Throw | Opcode::Unreachable => return true,
                _ => return false,
            }
        }
    }

    fn insert_throw(&mut self, cfg: &mut ControlFlowGraph, block: crate::ir::Block) {
        let reg = *self.reg.get_or_insert_with(|| cfg.allocate_temp());
        let new_block = cfg.create_block();
        let mut konst = Insn::new(Opcode::Const);
        konst.set_dest(reg).set_literal(0);
        let mut thr = Insn::new(Opcode::Throw);
        thr.set_src(0, reg);
        cfg.push_back(new_block, vec![konst, thr]);
        // The replacement block answers to the same handlers.
        cfg.copy_succ_edges_of_type(block, new_block, EdgeKind::is_throw);
        let goto = cfg
            .goto_edge(block)
            .expect("non-terminal block has a goto edge");
        cfg.set_edge_target(goto, new_block);
    }
}

fn revalidate(cfg: &ControlFlowGraph, loc: InsnLoc) -> Option<InsnLoc> {
    let insn = cfg
        .block_items(loc.block)
        .get(loc.index)
        .and_then(|item| item.insn())?;
    cfg.find_insn(insn.uid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::*;

    #[test]
    fn truncates_after_non_returning_invoke() {
        let ctx = DexContext::new();
        let fail = ctx.make_method("Lcom/example/Preconditions;", "fail", &[], "V");

        let mut b = CodeBuilder::new(2);
        b.push(invoke_static(fail, &[]));
        b.push(const_insn(0, 1));
        b.push(const_insn(1, 2));
        b.push(return_value(0));
        let mut code = b.build();

        let mut prop = ThrowPropagator::new(&ctx);
        let stats = prop.run(&mut code, &|insn| insn.method_ref() == fail);
        assert_eq!(stats.throws_inserted, 1);
        assert_eq!(
            opcodes_of(&code),
            vec![Opcode::InvokeStatic, Opcode::Const, Opcode::Throw]
        );
    }

    #[test]
    fn leaves_existing_throws_alone() {
        let ctx = DexContext::new();
        let fail = ctx.make_method("Lcom/example/Preconditions;", "fail", &[], "V");

        let mut b = CodeBuilder::new(1);
        b.push(invoke_static(fail, &[]));
        b.push(const_insn(0, 0));
        b.push(throw(0));
        let mut code = b.build();

        let mut prop = ThrowPropagator::new(&ctx);
        let stats = prop.run(&mut code, &|insn| insn.method_ref() == fail);
        assert_eq!(stats.throws_inserted, 0);
        assert_eq!(
            opcodes_of(&code),
            vec![Opcode::InvokeStatic, Opcode::Const, Opcode::Throw]
        );
    }
}
