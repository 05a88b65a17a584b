//! CFG construction from the linear item list.
//!
//! Leaders are the first instruction, every label, every instruction
//! following a branch or terminator, every try-region boundary, and the
//! first instruction after the `LoadParam*` prelude (the entry block holds
//! only the parameter bindings).

use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashMap;

use crate::cfg::{BlockData, BlockItem, ControlFlowGraph, EdgeKind};
use crate::ir::code::{CatchHandlers, Item};
use crate::ir::entities::{Block, Label, TryId};
use crate::ir::insn::Opcode;

enum Term {
    /// Block falls through to the next block in input order.
    Fallthrough,
    /// Explicit goto to a label.
    Goto(Label),
    /// Conditional branch; carries the taken label.
    Cond(Label),
    /// Switch; one (case key, label) per case, default falls through.
    Switch(Vec<(i64, Label)>),
    /// Return, throw or unreachable: no normal successor.
    Terminal,
}

struct PendingBlock {
    block: Block,
    term: Term,
    try_region: Option<TryId>,
}

impl ControlFlowGraph {
    /// Build the CFG for a linear item list.
    pub(crate) fn build(
        items: Vec<Item>,
        catches: &PrimaryMap<TryId, CatchHandlers>,
        registers_size: u32,
    ) -> Self {
        let mut cfg = ControlFlowGraph {
            blocks: PrimaryMap::new(),
            edges: PrimaryMap::new(),
            entry: Block::from_u32(0),
            exit: None,
            registers_size,
        };

        let mut pending: Vec<PendingBlock> = Vec::new();
        let mut label_to_block: FxHashMap<Label, Block> = FxHashMap::default();
        let mut try_stack: Vec<TryId> = Vec::new();

        let mut current = cfg.blocks.push(BlockData::default());
        cfg.entry = current;
        pending.push(PendingBlock {
            block: current,
            term: Term::Fallthrough,
            try_region: None,
        });
        // Whether the next instruction must open a fresh block.
        let mut at_boundary = false;
        // Entry-block handling: true while only LoadParam* have been seen.
        let mut in_param_prelude = true;

        let open_block =
            |cfg: &mut ControlFlowGraph, pending: &mut Vec<PendingBlock>, try_stack: &[TryId]| {
                let block = cfg.blocks.push(BlockData::default());
                pending.push(PendingBlock {
                    block,
                    term: Term::Fallthrough,
                    try_region: try_stack.last().copied(),
                });
                block
            };

        for item in items {
            match item {
                Item::Label(label) => {
                    if at_boundary || !cfg.blocks[current].items.is_empty() {
                        current = open_block(&mut cfg, &mut pending, &try_stack);
                        at_boundary = false;
                    }
                    let prev = label_to_block.insert(label, current);
                    assert!(prev.is_none(), "label {label} defined twice");
                    in_param_prelude = false;
                }
                Item::TryStart(tid) => {
                    try_stack.push(tid);
                    if at_boundary || !cfg.blocks[current].items.is_empty() {
                        current = open_block(&mut cfg, &mut pending, &try_stack);
                        at_boundary = false;
                    } else {
                        pending.last_mut().unwrap().try_region = try_stack.last().copied();
                    }
                    in_param_prelude = false;
                }
                Item::TryEnd(tid) => {
                    let top = try_stack.pop();
                    assert_eq!(top, Some(tid), "mismatched try region markers");
                    if at_boundary || !cfg.blocks[current].items.is_empty() {
                        current = open_block(&mut cfg, &mut pending, &try_stack);
                        at_boundary = false;
                    } else {
                        pending.last_mut().unwrap().try_region = try_stack.last().copied();
                    }
                    in_param_prelude = false;
                }
                Item::Position(pos) => {
                    if at_boundary {
                        current = open_block(&mut cfg, &mut pending, &try_stack);
                        at_boundary = false;
                    }
                    cfg.blocks[current].items.push(BlockItem::Position(pos));
                }
                Item::SourceBlock(sb) => {
                    if at_boundary {
                        current = open_block(&mut cfg, &mut pending, &try_stack);
                        at_boundary = false;
                    }
                    cfg.blocks[current].items.push(BlockItem::SourceBlock(sb));
                }
                Item::Insn(insn) => {
                    let op = insn.opcode();
                    let leaves_prelude = in_param_prelude
                        && !op.is_load_param()
                        && cfg.blocks[current].items.iter().any(|it| it.insn().is_some());
                    if at_boundary || leaves_prelude {
                        current = open_block(&mut cfg, &mut pending, &try_stack);
                        at_boundary = false;
                    }
                    in_param_prelude = in_param_prelude && op.is_load_param();
                    assert!(
                        !op.is_branch(),
                        "branch {op:?} must be an Item::Branch with targets"
                    );
                    if op.is_terminator() {
                        pending.last_mut().unwrap().term = Term::Terminal;
                        at_boundary = true;
                    }
                    cfg.blocks[current].items.push(BlockItem::Insn(insn));
                }
                Item::Branch { insn, targets } => {
                    let op = insn.opcode();
                    let leaves_prelude = in_param_prelude
                        && cfg.blocks[current].items.iter().any(|it| it.insn().is_some());
                    if at_boundary || leaves_prelude {
                        current = open_block(&mut cfg, &mut pending, &try_stack);
                        at_boundary = false;
                    }
                    in_param_prelude = false;
                    match op {
                        Opcode::Goto => {
                            assert_eq!(targets.len(), 1);
                            // The goto lives on as an edge only.
                            pending.last_mut().unwrap().term = Term::Goto(targets[0].label);
                        }
                        Opcode::Switch => {
                            let cases = targets
                                .iter()
                                .map(|t| {
                                    (
                                        t.case_key.expect("switch target without case key"),
                                        t.label,
                                    )
                                })
                                .collect();
                            pending.last_mut().unwrap().term = Term::Switch(cases);
                            cfg.blocks[current].items.push(BlockItem::Insn(insn));
                        }
                        _ => {
                            assert!(op.is_conditional_branch(), "unexpected branch item {op:?}");
                            assert_eq!(targets.len(), 1);
                            pending.last_mut().unwrap().term = Term::Cond(targets[0].label);
                            cfg.blocks[current].items.push(BlockItem::Insn(insn));
                        }
                    }
                    at_boundary = true;
                }
            }
        }
        assert!(try_stack.is_empty(), "unterminated try region");

        // Edge pass.
        let resolve = |label: Label| -> Block {
            *label_to_block
                .get(&label)
                .unwrap_or_else(|| panic!("branch to undefined {label}"))
        };
        for (i, pb) in pending.iter().enumerate() {
            let next = pending.get(i + 1).map(|p| p.block);
            match &pb.term {
                Term::Fallthrough => {
                    if let Some(next) = next {
                        cfg.add_edge(pb.block, next, EdgeKind::Goto);
                    } else {
                        assert!(
                            cfg.blocks[pb.block].items.is_empty(),
                            "method falls off the end of the item list"
                        );
                    }
                }
                Term::Goto(label) => {
                    cfg.add_edge(pb.block, resolve(*label), EdgeKind::Goto);
                }
                Term::Cond(label) => {
                    cfg.add_edge(pb.block, resolve(*label), EdgeKind::Branch { case_key: None });
                    let next = next.expect("conditional branch at the end of the method");
                    cfg.add_edge(pb.block, next, EdgeKind::Goto);
                }
                Term::Switch(cases) => {
                    for &(key, label) in cases {
                        cfg.add_edge(
                            pb.block,
                            resolve(label),
                            EdgeKind::Branch {
                                case_key: Some(key),
                            },
                        );
                    }
                    let next = next.expect("switch at the end of the method");
                    cfg.add_edge(pb.block, next, EdgeKind::Goto);
                }
                Term::Terminal => {}
            }
            // Exceptional edges: every instruction of a block inside a try
            // region may transfer to each handler of the nearest enclosing
            // try, in handler order.
            if let Some(tid) = pb.try_region {
                if cfg.blocks[pb.block].items.iter().any(|it| it.insn().is_some()) {
                    for &(catch_type, handler) in &catches[tid].handlers {
                        cfg.add_edge(
                            pb.block,
                            resolve(handler),
                            EdgeKind::Throw { catch_type },
                        );
                    }
                }
            }
        }

        cfg.assert_move_result_adjacency();
        cfg
    }

    fn assert_move_result_adjacency(&self) {
        for block in self.blocks() {
            let insns: Vec<&crate::ir::Insn> = self.block_insns(block).collect();
            for (i, insn) in insns.iter().enumerate() {
                let op = insn.opcode();
                if op.has_move_result_pseudo() {
                    let next = insns.get(i + 1).map(|n| n.opcode());
                    assert!(
                        next.map_or(false, |n| n.is_move_result_pseudo()),
                        "{op:?} must be immediately followed by its MoveResultPseudo*"
                    );
                }
                if op.is_move_result_any() {
                    assert!(
                        i > 0 && insns[i - 1].opcode().has_move_result_any(),
                        "{op:?} without an adjacent producer"
                    );
                }
            }
        }
    }
}
