//! Goto folding.
//!
//! Repeatedly merges a block whose only transfer is an unconditional goto
//! into its target, when the target has exactly one predecessor and does
//! not itself fall through implicitly (it ends in a goto or has no normal
//! successors). The check is conservative; `ControlFlowGraph::simplify`
//! picks up the chains other passes leave behind.

use log::trace;

use crate::ir::IrCode;

/// Fold goto chains in `code`. Returns the number of gotos removed.
pub fn fold_gotos(code: &mut IrCode) -> usize {
    code.build_cfg();
    let cfg = code.cfg_mut();
    let mut removed = 0;
    loop {
        let mut candidate = None;
        for block in cfg.blocks() {
            let Some(goto) = cfg.goto_edge(block) else {
                continue;
            };
            if !cfg.branch_edges(block).is_empty() {
                continue;
            }
            let target = cfg.edge(goto).dst;
            if target == block || target == cfg.entry_block() {
                continue;
            }
            if cfg.pred_edges(target).len() != 1 {
                continue;
            }
            // The target must not fall through implicitly: it either
            // transfers with its own goto or ends the method.
            let target_has_branch = !cfg.branch_edges(target).is_empty();
            if target_has_branch {
                continue;
            }
            if !cfg.same_throw_edges(block, target) {
                continue;
            }
            candidate = Some((block, target, goto));
            break;
        }
        let Some((block, target, goto)) = candidate else {
            break;
        };
        trace!("folding goto from {block} into {target}");
        cfg.merge_into(block, target, goto);
        removed += 1;
    }
    code.clear_cfg(None);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::*;
    use crate::ir::Opcode;

    #[test]
    fn merges_a_goto_chain() {
        // A: goto B; B: goto C; C: return.
        let mut b = CodeBuilder::new(1);
        let lb = b.fresh_label();
        let lc = b.fresh_label();
        b.push(const_insn(0, 1));
        b.goto(lb);
        b.label(lc);
        b.push(return_value(0));
        b.label(lb);
        b.goto(lc);
        let mut code = b.build();

        let removed = fold_gotos(&mut code);
        assert!(removed >= 1);
        assert_eq!(opcodes_of(&code), vec![Opcode::Const, Opcode::Return]);
        // No explicit goto survives; the blocks are one straight line.
        code.build_cfg();
        assert_eq!(code.cfg().num_blocks(), 1);
        code.clear_cfg(None);
    }

    #[test]
    fn does_not_merge_shared_targets() {
        // Two predecessors jump to the same return block.
        let mut b = CodeBuilder::new(1);
        let shared = b.fresh_label();
        b.push(load_param(0));
        b.branch(if_insn(Opcode::IfEqz, &[0]), shared);
        b.goto(shared);
        b.label(shared);
        b.push(return_void());
        let mut code = b.build();

        let removed = fold_gotos(&mut code);
        assert_eq!(removed, 0);
    }
}
