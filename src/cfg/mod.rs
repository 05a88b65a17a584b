//! The editable control flow graph.
//!
//! A CFG owns a set of blocks, each a maximal straight-line item sequence.
//! Explicit `goto` instructions do not exist in graph form: unconditional
//! transfers are `Goto` edges, materialized back into instructions only at
//! linearization. Conditional branches and switches keep their instruction
//! as the last item of the block, with `Branch` edges carrying the taken
//! targets (and the case key, for switches). Exceptional flow is `Throw`
//! edges, one per catch handler of the enclosing try region, in handler
//! order with a catch-all last.
//!
//! Every mutation primitive preserves the structural invariants: at most
//! one `Goto` edge per block, `MoveResult*` adjacency to its producer, and
//! wide pairs never split across a block boundary.

mod build;
mod linearize;
mod mutation;

pub use linearize::{Chain, LinearizationStrategy, ProfileGuidedLinearization};
pub use mutation::CfgMutation;

use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashSet;

use crate::ir::code::{Position, SourceBlock};
pub use crate::ir::entities::EdgeId;
use crate::ir::entities::{Block, InsnUid, TypeId};
use crate::ir::insn::{Insn, Opcode, Reg};

/// The type of a CFG edge.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EdgeKind {
    /// Unconditional transfer; exactly one per non-terminal block.
    Goto,
    /// Taken edge of a conditional, or one edge per switch case.
    Branch { case_key: Option<i64> },
    /// Exceptional transfer to a catch handler. `None` is a catch-all.
    Throw { catch_type: Option<TypeId> },
    /// Connects returns to the computed exit block; carries no control
    /// transfer and is invisible to linearization.
    Ghost,
}

impl EdgeKind {
    pub fn is_throw(self) -> bool {
        matches!(self, EdgeKind::Throw { .. })
    }

    pub fn is_branch(self) -> bool {
        matches!(self, EdgeKind::Branch { .. })
    }
}

/// An edge between two blocks.
#[derive(Copy, Clone, Debug)]
pub struct Edge {
    pub src: Block,
    pub dst: Block,
    pub kind: EdgeKind,
}

/// One element of a block's item list.
#[derive(Clone, Debug)]
pub enum BlockItem {
    Insn(Insn),
    Position(Position),
    SourceBlock(SourceBlock),
}

impl BlockItem {
    pub fn insn(&self) -> Option<&Insn> {
        match self {
            BlockItem::Insn(insn) => Some(insn),
            _ => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct BlockData {
    pub(crate) items: Vec<BlockItem>,
    pub(crate) preds: Vec<EdgeId>,
    pub(crate) succs: Vec<EdgeId>,
    pub(crate) dead: bool,
    pub(crate) ghost: bool,
}

/// The position of an instruction inside a CFG: a block and an item index.
///
/// Positions are invalidated by mutation of the containing block; use
/// [`CfgMutation`] to batch edits while iterating.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct InsnLoc {
    pub block: Block,
    pub index: usize,
}

/// The control flow graph of one method body.
pub struct ControlFlowGraph {
    pub(crate) blocks: PrimaryMap<Block, BlockData>,
    pub(crate) edges: PrimaryMap<EdgeId, Edge>,
    pub(crate) entry: Block,
    pub(crate) exit: Option<Block>,
    pub(crate) registers_size: u32,
}

impl ControlFlowGraph {
    // ---------------- queries ----------------

    pub fn entry_block(&self) -> Block {
        self.entry
    }

    /// The computed exit block; present after `calculate_exit_block`.
    pub fn exit_block(&self) -> Option<Block> {
        self.exit
    }

    pub fn registers_size(&self) -> u32 {
        self.registers_size
    }

    /// All live blocks, in id order. Ghost exit blocks are included once
    /// created; dead blocks are not.
    pub fn blocks(&self) -> Vec<Block> {
        self.blocks
            .keys()
            .filter(|&b| !self.blocks[b].dead)
            .collect()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.keys().filter(|&b| !self.blocks[b].dead).count()
    }

    pub fn block_items(&self, block: Block) -> &[BlockItem] {
        &self.blocks[block].items
    }

    /// The instructions of `block`, in order.
    pub fn block_insns(&self, block: Block) -> impl Iterator<Item = &Insn> {
        self.blocks[block].items.iter().filter_map(BlockItem::insn)
    }

    pub fn first_insn(&self, block: Block) -> Option<&Insn> {
        self.block_insns(block).next()
    }

    pub fn last_insn(&self, block: Block) -> Option<&Insn> {
        self.blocks[block]
            .items
            .iter()
            .rev()
            .find_map(BlockItem::insn)
    }

    pub fn edge(&self, edge: EdgeId) -> Edge {
        self.edges[edge]
    }

    pub fn succ_edges(&self, block: Block) -> &[EdgeId] {
        &self.blocks[block].succs
    }

    pub fn pred_edges(&self, block: Block) -> &[EdgeId] {
        &self.blocks[block].preds
    }

    pub fn succs(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.blocks[block].succs.iter().map(|&e| self.edges[e].dst)
    }

    pub fn preds(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.blocks[block].preds.iter().map(|&e| self.edges[e].src)
    }

    /// The unique successor edge of the given kind, if any.
    pub fn get_succ_edge_of_type(&self, block: Block, pred: impl Fn(EdgeKind) -> bool) -> Option<EdgeId> {
        self.blocks[block]
            .succs
            .iter()
            .copied()
            .find(|&e| pred(self.edges[e].kind))
    }

    /// The block's goto (fallthrough) edge.
    pub fn goto_edge(&self, block: Block) -> Option<EdgeId> {
        self.get_succ_edge_of_type(block, |k| k == EdgeKind::Goto)
    }

    pub fn branch_edges(&self, block: Block) -> Vec<EdgeId> {
        self.blocks[block]
            .succs
            .iter()
            .copied()
            .filter(|&e| self.edges[e].kind.is_branch())
            .collect()
    }

    pub fn throw_edges(&self, block: Block) -> Vec<EdgeId> {
        self.blocks[block]
            .succs
            .iter()
            .copied()
            .filter(|&e| self.edges[e].kind.is_throw())
            .collect()
    }

    /// Find an instruction by identity. Linear scan, as mutation does not
    /// maintain a location index.
    pub fn find_insn(&self, uid: InsnUid) -> Option<InsnLoc> {
        for block in self.blocks.keys() {
            if self.blocks[block].dead {
                continue;
            }
            for (index, item) in self.blocks[block].items.iter().enumerate() {
                if let Some(insn) = item.insn() {
                    if insn.uid() == uid {
                        return Some(InsnLoc { block, index });
                    }
                }
            }
        }
        None
    }

    pub fn insn_at(&self, loc: InsnLoc) -> &Insn {
        self.blocks[loc.block].items[loc.index]
            .insn()
            .expect("InsnLoc does not point at an instruction")
    }

    pub fn insn_at_mut(&mut self, loc: InsnLoc) -> &mut Insn {
        match &mut self.blocks[loc.block].items[loc.index] {
            BlockItem::Insn(insn) => insn,
            _ => panic!("InsnLoc does not point at an instruction"),
        }
    }

    /// A snapshot of the locations of all instructions, in block/item
    /// order. Valid until the next mutation.
    pub fn insn_locs(&self) -> Vec<InsnLoc> {
        let mut locs = Vec::new();
        for block in self.blocks() {
            for (index, item) in self.blocks[block].items.iter().enumerate() {
                if item.insn().is_some() {
                    locs.push(InsnLoc { block, index });
                }
            }
        }
        locs
    }

    /// Iterate over all instructions.
    pub fn insns(&self) -> impl Iterator<Item = &Insn> {
        self.blocks
            .keys()
            .filter(|&b| !self.blocks[b].dead)
            .flat_map(|b| self.blocks[b].items.iter())
            .filter_map(BlockItem::insn)
    }

    pub fn count_opcodes(&self) -> usize {
        self.insns().count()
    }

    /// The next instruction within the block, skipping non-instruction
    /// items.
    pub fn next_insn_in_block(&self, loc: InsnLoc) -> Option<InsnLoc> {
        let items = &self.blocks[loc.block].items;
        for index in loc.index + 1..items.len() {
            if items[index].insn().is_some() {
                return Some(InsnLoc { block: loc.block, index });
            }
        }
        None
    }

    /// The first instruction reached from `loc` by walking forward through
    /// goto-only transfers, transparently crossing empty blocks. Bounded by
    /// a visited set; returns `None` if the walk loops back or falls off
    /// the graph.
    pub fn next_following_gotos(&self, loc: InsnLoc) -> Option<InsnLoc> {
        if let Some(next) = self.next_insn_in_block(loc) {
            return Some(next);
        }
        let mut visited = FxHashSet::default();
        visited.insert(loc.block);
        let mut block = loc.block;
        loop {
            let goto = self.goto_edge(block)?;
            block = self.edges[goto].dst;
            if !visited.insert(block) {
                return None;
            }
            if let Some((index, _)) = self.blocks[block]
                .items
                .iter()
                .enumerate()
                .find(|(_, item)| item.insn().is_some())
            {
                return Some(InsnLoc { block, index });
            }
        }
    }

    /// The `MoveResult*` consuming the result of the producer at `loc`.
    ///
    /// Producers and their move-results are never separated by a block
    /// boundary, so only the same block is searched.
    pub fn move_result_of(&self, loc: InsnLoc) -> Option<InsnLoc> {
        let insn = self.insn_at(loc);
        if !insn.opcode().has_move_result_any() {
            return None;
        }
        let next = self.next_insn_in_block(loc)?;
        if self.insn_at(next).opcode().is_move_result_any() {
            Some(next)
        } else {
            None
        }
    }

    /// The leading `LoadParam*` instructions of the entry block.
    pub fn param_insns(&self) -> Vec<&Insn> {
        self.block_insns(self.entry)
            .take_while(|insn| insn.opcode().is_load_param())
            .collect()
    }

    // ---------------- mutation primitives ----------------

    pub fn create_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    pub fn add_edge(&mut self, src: Block, dst: Block, kind: EdgeKind) -> EdgeId {
        match kind {
            EdgeKind::Goto => {
                assert!(
                    self.goto_edge(src).is_none(),
                    "{src} already has a goto edge"
                );
            }
            EdgeKind::Throw { catch_type } => {
                for &e in &self.blocks[src].succs {
                    if let EdgeKind::Throw { catch_type: other } = self.edges[e].kind {
                        assert_ne!(
                            other, catch_type,
                            "{src} already has a throw edge for this catch type"
                        );
                        assert!(
                            other.is_some(),
                            "catch-all throw edge must stay last on {src}"
                        );
                    }
                }
            }
            _ => {}
        }
        let edge = self.edges.push(Edge { src, dst, kind });
        self.blocks[src].succs.push(edge);
        self.blocks[dst].preds.push(edge);
        edge
    }

    pub fn set_edge_target(&mut self, edge: EdgeId, new_dst: Block) {
        let old_dst = self.edges[edge].dst;
        self.blocks[old_dst].preds.retain(|&e| e != edge);
        self.edges[edge].dst = new_dst;
        self.blocks[new_dst].preds.push(edge);
    }

    pub fn remove_edge(&mut self, edge: EdgeId) {
        let Edge { src, dst, .. } = self.edges[edge];
        self.blocks[src].succs.retain(|&e| e != edge);
        self.blocks[dst].preds.retain(|&e| e != edge);
    }

    /// Copy all successor edges of `src` matching `pred` onto `dst`,
    /// preserving order.
    pub fn copy_succ_edges_of_type(
        &mut self,
        src: Block,
        dst: Block,
        pred: impl Fn(EdgeKind) -> bool,
    ) {
        let to_copy: Vec<Edge> = self.blocks[src]
            .succs
            .iter()
            .map(|&e| self.edges[e])
            .filter(|e| pred(e.kind))
            .collect();
        for e in to_copy {
            self.add_edge(dst, e.dst, e.kind);
        }
    }

    /// Allocate a fresh (narrow) temporary register.
    pub fn allocate_temp(&mut self) -> Reg {
        let reg = self.registers_size;
        self.registers_size += 1;
        reg
    }

    /// Allocate a fresh wide temporary register pair; returns the first
    /// register.
    pub fn allocate_wide_temp(&mut self) -> Reg {
        let reg = self.registers_size;
        self.registers_size += 2;
        reg
    }

    /// Append instructions to the end of `block` (before no terminator:
    /// the caller is responsible for the block having none).
    pub fn push_back(&mut self, block: Block, insns: Vec<Insn>) {
        debug_assert!(
            self.last_insn(block).map_or(true, |i| !i.opcode().is_terminator()
                && !i.opcode().is_conditional_branch()),
            "cannot append after a terminator in {block}"
        );
        self.blocks[block]
            .items
            .extend(insns.into_iter().map(BlockItem::Insn));
    }

    /// Insert instructions immediately before the instruction at `loc`.
    pub fn insert_before(&mut self, loc: InsnLoc, insns: Vec<Insn>) {
        debug_assert!(self.blocks[loc.block].items[loc.index].insn().is_some());
        let items = &mut self.blocks[loc.block].items;
        items.splice(loc.index..loc.index, insns.into_iter().map(BlockItem::Insn));
    }

    /// Insert instructions immediately after the instruction at `loc`.
    ///
    /// Insertion after a result producer lands after its `MoveResult*`,
    /// preserving adjacency.
    pub fn insert_after(&mut self, loc: InsnLoc, insns: Vec<Insn>) {
        let mut at = loc.index + 1;
        if self.insn_at(loc).opcode().has_move_result_any() {
            if let Some(mr) = self.move_result_of(loc) {
                at = mr.index + 1;
            }
        }
        let items = &mut self.blocks[loc.block].items;
        items.splice(at..at, insns.into_iter().map(BlockItem::Insn));
    }

    /// Replace the instruction at `loc` with a sequence. A result producer
    /// is replaced together with its `MoveResult*`.
    pub fn replace_insns(&mut self, loc: InsnLoc, insns: Vec<Insn>) {
        let mut end = loc.index + 1;
        if self.insn_at(loc).opcode().has_move_result_any() {
            if let Some(mr) = self.move_result_of(loc) {
                end = mr.index + 1;
            }
        }
        let items = &mut self.blocks[loc.block].items;
        items.splice(loc.index..end, insns.into_iter().map(BlockItem::Insn));
    }

    /// Remove the instruction at `loc`. A result producer takes its
    /// `MoveResult*` with it. Branches cannot be removed this way; use
    /// `replace_branch_with_goto`.
    pub fn remove_insn(&mut self, loc: InsnLoc) {
        let op = self.insn_at(loc).opcode();
        assert!(
            !op.is_branch(),
            "remove_insn cannot remove a branch; rewrite its edges instead"
        );
        if op.has_move_result_any() {
            if let Some(mr) = self.move_result_of(loc) {
                self.blocks[loc.block].items.remove(mr.index);
            }
        }
        self.blocks[loc.block].items.remove(loc.index);
    }

    /// Replace the conditional branch or switch terminating `block` with an
    /// unconditional transfer along `keep`. All other branch edges and the
    /// old goto edge are removed; `keep` becomes the goto edge.
    pub fn replace_branch_with_goto(&mut self, block: Block, keep: EdgeId) {
        let last = self
            .blocks[block]
            .items
            .iter()
            .rposition(|item| item.insn().is_some())
            .expect("block has no terminator");
        let op = self.blocks[block].items[last].insn().unwrap().opcode();
        assert!(
            op.is_conditional_branch() || op == Opcode::Switch,
            "{block} does not end in a conditional branch or switch"
        );
        self.blocks[block].items.remove(last);
        let dst = self.edges[keep].dst;
        let to_remove: Vec<EdgeId> = self.blocks[block]
            .succs
            .iter()
            .copied()
            .filter(|&e| {
                let kind = self.edges[e].kind;
                kind.is_branch() || kind == EdgeKind::Goto
            })
            .collect();
        for e in to_remove {
            self.remove_edge(e);
        }
        self.add_edge(block, dst, EdgeKind::Goto);
    }

    /// Split `block` after the instruction at `loc`. The tail items move to
    /// a new block, which inherits the outgoing edges; `block` gets a goto
    /// to the new block and keeps a copy of its throw edges.
    pub fn split_block(&mut self, loc: InsnLoc) -> Block {
        // Adjacency: never split between a producer and its move-result.
        let mut split_at = loc.index + 1;
        if self.insn_at(loc).opcode().has_move_result_any() {
            if let Some(mr) = self.move_result_of(loc) {
                split_at = mr.index + 1;
            }
        }
        let new_block = self.create_block();
        let tail: Vec<BlockItem> = self.blocks[loc.block].items.split_off(split_at);
        self.blocks[new_block].items = tail;

        // Outgoing edges move to the tail; throw edges are duplicated, as
        // both halves stay in the same try region.
        let succs: Vec<EdgeId> = self.blocks[loc.block].succs.clone();
        for e in succs {
            let edge = self.edges[e];
            if edge.kind.is_throw() {
                self.add_edge(new_block, edge.dst, edge.kind);
            } else {
                self.blocks[loc.block].succs.retain(|&x| x != e);
                self.edges[e].src = new_block;
                self.blocks[new_block].succs.push(e);
            }
        }
        self.add_edge(loc.block, new_block, EdgeKind::Goto);
        new_block
    }

    /// Remove blocks unreachable from the entry. Returns the number of
    /// instructions removed with them.
    pub fn remove_unreachable_blocks(&mut self) -> usize {
        let mut reachable = FxHashSet::default();
        let mut stack = vec![self.entry];
        while let Some(block) = stack.pop() {
            if !reachable.insert(block) {
                continue;
            }
            for &e in &self.blocks[block].succs {
                stack.push(self.edges[e].dst);
            }
        }
        let mut removed_insns = 0;
        let all: Vec<Block> = self.blocks.keys().collect();
        for block in all {
            if reachable.contains(&block) || self.blocks[block].dead {
                continue;
            }
            removed_insns += self.block_insns(block).count();
            let edges: Vec<EdgeId> = self.blocks[block]
                .succs
                .iter()
                .chain(self.blocks[block].preds.iter())
                .copied()
                .collect();
            for e in edges {
                self.remove_edge(e);
            }
            self.blocks[block].items.clear();
            self.blocks[block].dead = true;
        }
        removed_insns
    }

    /// Recompute the register count from the registers actually used.
    pub fn recompute_registers_size(&mut self) {
        let mut max_end = 0;
        for insn in self.insns() {
            if let Some(dest) = insn.dest_opt() {
                max_end = max_end.max(dest + insn.dest_width());
            }
            for i in 0..insn.srcs_size() {
                let src = insn.src(i);
                if src != crate::ir::RESULT_REGISTER {
                    max_end = max_end.max(src + insn.src_width(i));
                }
            }
        }
        self.registers_size = max_end;
    }

    /// Merge chains of blocks made trivially joinable by earlier mutation:
    /// a goto edge to a block with a single predecessor and no other
    /// non-throw in-edges folds the target into its source. Unreachable
    /// blocks are swept first.
    pub fn simplify(&mut self) {
        self.remove_unreachable_blocks();
        loop {
            let mut merged = false;
            for block in self.blocks() {
                if self.blocks[block].ghost {
                    continue;
                }
                let Some(goto) = self.goto_edge(block) else {
                    continue;
                };
                // Only a pure goto transfer can be folded: no branch out of
                // this block.
                if !self.branch_edges(block).is_empty() {
                    continue;
                }
                let target = self.edges[goto].dst;
                if target == block || target == self.entry {
                    continue;
                }
                if self.blocks[target].preds.len() != 1 || self.blocks[target].ghost {
                    continue;
                }
                // Both halves must agree on exceptional flow to merge.
                if !self.same_throw_edges(block, target) {
                    continue;
                }
                self.merge_into(block, target, goto);
                merged = true;
                break;
            }
            if !merged {
                break;
            }
        }
    }

    pub(crate) fn same_throw_edges(&self, a: Block, b: Block) -> bool {
        let sig = |block: Block| -> Vec<(Option<TypeId>, Block)> {
            self.throw_edges(block)
                .iter()
                .map(|&e| match self.edges[e].kind {
                    EdgeKind::Throw { catch_type } => (catch_type, self.edges[e].dst),
                    _ => unreachable!(),
                })
                .collect()
        };
        // A block with no instructions that can throw carries no throw
        // edges; folding it into a try region is still sound when it is
        // empty of throwing potential, but we stay conservative.
        sig(a) == sig(b)
    }

    pub(crate) fn merge_into(&mut self, block: Block, target: Block, goto: EdgeId) {
        self.remove_edge(goto);
        let items = std::mem::take(&mut self.blocks[target].items);
        self.blocks[block].items.extend(items);
        let succs: Vec<EdgeId> = self.blocks[target].succs.clone();
        for e in succs {
            let edge = self.edges[e];
            if edge.kind.is_throw() {
                // Already present on `block` per the merge precondition.
                self.remove_edge(e);
            } else {
                self.blocks[target].succs.retain(|&x| x != e);
                self.edges[e].src = block;
                self.blocks[block].succs.push(e);
            }
        }
        self.blocks[target].dead = true;
    }

    /// Compute (or recompute) the exit block. With a single block ending in
    /// a return or throw that block is the exit; otherwise a ghost exit
    /// block is created and every terminal block gets a ghost edge to it.
    pub fn calculate_exit_block(&mut self) {
        if let Some(exit) = self.exit {
            if self.blocks[exit].ghost {
                let preds: Vec<EdgeId> = self.blocks[exit].preds.clone();
                for e in preds {
                    self.remove_edge(e);
                }
                self.blocks[exit].dead = true;
            }
            self.exit = None;
        }
        let terminal: Vec<Block> = self
            .blocks()
            .into_iter()
            .filter(|&b| {
                !self.blocks[b].ghost
                    && self.succ_edges(b).iter().all(|&e| self.edges[e].kind.is_throw())
            })
            .collect();
        match terminal.len() {
            0 => {}
            1 => self.exit = Some(terminal[0]),
            _ => {
                let ghost = self.create_block();
                self.blocks[ghost].ghost = true;
                for b in terminal {
                    self.add_edge(b, ghost, EdgeKind::Ghost);
                }
                self.exit = Some(ghost);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::*;
    use crate::ir::{IrCode, Opcode, TypeId};

    fn straight_line() -> IrCode {
        let mut b = CodeBuilder::new(2);
        b.push(load_param(0));
        b.push(const_insn(1, 7));
        b.push(return_value(1));
        b.build()
    }

    #[test]
    fn straight_line_makes_two_blocks() {
        let mut code = straight_line();
        code.build_cfg();
        let cfg = code.cfg();
        // The entry holds only the parameter bindings.
        assert_eq!(cfg.num_blocks(), 2);
        let entry = cfg.entry_block();
        let params = cfg.param_insns();
        assert_eq!(params.len(), 1);
        assert_eq!(cfg.block_insns(entry).count(), 1);
        let succ: Vec<Block> = cfg.succs(entry).collect();
        assert_eq!(succ.len(), 1);
        assert_eq!(cfg.block_insns(succ[0]).count(), 2);
        code.clear_cfg(None);
        assert_eq!(
            opcodes_of(&code),
            vec![Opcode::LoadParam, Opcode::Const, Opcode::Return]
        );
    }

    #[test]
    fn conditional_gets_branch_and_goto_edges() {
        let mut b = CodeBuilder::new(1);
        let taken = b.fresh_label();
        b.push(load_param(0));
        b.branch(if_insn(Opcode::IfEqz, &[0]), taken);
        b.push(return_void());
        b.label(taken);
        b.push(return_void());
        let mut code = b.build();

        code.build_cfg();
        let cfg = code.cfg();
        let branch_block = cfg
            .blocks()
            .into_iter()
            .find(|&bb| cfg.last_insn(bb).map(|i| i.opcode()) == Some(Opcode::IfEqz))
            .unwrap();
        assert_eq!(cfg.branch_edges(branch_block).len(), 1);
        assert!(cfg.goto_edge(branch_block).is_some());
        code.clear_cfg(None);
    }

    #[test]
    fn switch_edges_carry_case_keys() {
        let mut b = CodeBuilder::new(1);
        let one = b.fresh_label();
        let two = b.fresh_label();
        b.push(load_param(0));
        b.switch(0, &[(1, one), (2, two)]);
        b.push(return_void());
        b.label(one);
        b.push(return_void());
        b.label(two);
        b.push(return_void());
        let mut code = b.build();

        code.build_cfg();
        {
            let cfg = code.cfg();
            let switch_block = cfg
                .blocks()
                .into_iter()
                .find(|&bb| cfg.last_insn(bb).map(|i| i.opcode()) == Some(Opcode::Switch))
                .unwrap();
            let mut keys: Vec<Option<i64>> = cfg
                .branch_edges(switch_block)
                .iter()
                .map(|&e| match cfg.edge(e).kind {
                    EdgeKind::Branch { case_key } => case_key,
                    _ => unreachable!(),
                })
                .collect();
            keys.sort();
            assert_eq!(keys, vec![Some(1), Some(2)]);
            assert!(cfg.goto_edge(switch_block).is_some());
        }
        // Round trip preserves the switch and its targets.
        code.clear_cfg(None);
        code.build_cfg();
        let cfg = code.cfg();
        let switch_block = cfg
            .blocks()
            .into_iter()
            .find(|&bb| cfg.last_insn(bb).map(|i| i.opcode()) == Some(Opcode::Switch))
            .unwrap();
        assert_eq!(cfg.branch_edges(switch_block).len(), 2);
        code.clear_cfg(None);
    }

    #[test]
    fn try_region_adds_throw_edges() {
        let ctx = crate::ir::DexContext::new();
        let npe = ctx.get_or_make_type("Ljava/lang/NullPointerException;");
        let callee = ctx.make_method("Lcom/example/X;", "f", &[], "V");

        let mut b = CodeBuilder::new(2);
        let handler = b.fresh_label();
        let catch_all = b.fresh_label();
        let tid = b.add_catch(vec![(Some(npe), handler), (None, catch_all)]);
        b.try_start(tid);
        b.push(invoke_static(callee, &[]));
        b.try_end(tid);
        b.push(return_void());
        b.label(handler);
        b.push(return_void());
        b.label(catch_all);
        b.push(return_void());
        let mut code = b.build();

        code.build_cfg();
        {
            let cfg = code.cfg();
            let invoke_block = cfg
                .blocks()
                .into_iter()
                .find(|&bb| {
                    cfg.block_insns(bb)
                        .any(|i| i.opcode() == Opcode::InvokeStatic)
                })
                .unwrap();
            let throws = cfg.throw_edges(invoke_block);
            assert_eq!(throws.len(), 2);
            let kinds: Vec<Option<TypeId>> = throws
                .iter()
                .map(|&e| match cfg.edge(e).kind {
                    EdgeKind::Throw { catch_type } => catch_type,
                    _ => unreachable!(),
                })
                .collect();
            // Handler order is preserved; the catch-all comes last.
            assert_eq!(kinds, vec![Some(npe), None]);
        }
        code.clear_cfg(None);
        // Round trip keeps the try region.
        code.build_cfg();
        let cfg = code.cfg();
        let invoke_block = cfg
            .blocks()
            .into_iter()
            .find(|&bb| {
                cfg.block_insns(bb)
                    .any(|i| i.opcode() == Opcode::InvokeStatic)
            })
            .unwrap();
        assert_eq!(cfg.throw_edges(invoke_block).len(), 2);
        code.clear_cfg(None);
    }

    #[test]
    fn round_trip_is_isomorphic() {
        let mut b = CodeBuilder::new(2);
        let loop_head = b.fresh_label();
        let done = b.fresh_label();
        b.push(load_param(0));
        b.push(const_insn(1, 0));
        b.label(loop_head);
        b.branch(if_insn(Opcode::IfLez, &[0]), done);
        b.push(binop_lit(Opcode::AddIntLit, 0, 0, -1));
        b.goto(loop_head);
        b.label(done);
        b.push(return_value(1));
        let mut code = b.build();

        code.build_cfg();
        let shape = |cfg: &ControlFlowGraph| {
            let mut blocks: Vec<(usize, usize, usize)> = cfg
                .blocks()
                .into_iter()
                .map(|bb| {
                    (
                        cfg.block_insns(bb).count(),
                        cfg.succ_edges(bb).len(),
                        cfg.pred_edges(bb).len(),
                    )
                })
                .collect();
            blocks.sort();
            blocks
        };
        let first = shape(code.cfg());
        let first_insns = code.cfg().count_opcodes();
        code.clear_cfg(None);
        code.build_cfg();
        let second = shape(code.cfg());
        let second_insns = code.cfg().count_opcodes();
        code.clear_cfg(None);
        assert_eq!(first, second);
        assert_eq!(first_insns, second_insns);
    }

    #[test]
    fn split_block_moves_tail_and_edges() {
        let mut code = straight_line();
        code.build_cfg();
        let cfg = code.cfg_mut();
        let loc = cfg
            .insn_locs()
            .into_iter()
            .find(|&l| cfg.insn_at(l).opcode() == Opcode::Const)
            .unwrap();
        let before_blocks = cfg.num_blocks();
        let new_block = cfg.split_block(loc);
        assert_eq!(cfg.num_blocks(), before_blocks + 1);
        assert_eq!(cfg.block_insns(new_block).count(), 1);
        assert_eq!(
            cfg.first_insn(new_block).unwrap().opcode(),
            Opcode::Return
        );
        // The old block now transfers to the tail.
        let goto = cfg.goto_edge(loc.block).unwrap();
        assert_eq!(cfg.edge(goto).dst, new_block);
        code.clear_cfg(None);
        assert_eq!(
            opcodes_of(&code),
            vec![Opcode::LoadParam, Opcode::Const, Opcode::Return]
        );
    }

    #[test]
    fn next_following_gotos_crosses_empty_blocks() {
        let mut b = CodeBuilder::new(1);
        let hop = b.fresh_label();
        let end = b.fresh_label();
        b.push(const_insn(0, 1));
        b.goto(hop);
        b.label(end);
        b.push(return_value(0));
        b.label(hop);
        b.goto(end);
        let mut code = b.build();

        code.build_cfg();
        let cfg = code.cfg();
        let start = cfg
            .insn_locs()
            .into_iter()
            .find(|&l| cfg.insn_at(l).opcode() == Opcode::Const)
            .unwrap();
        let next = cfg.next_following_gotos(start).unwrap();
        assert_eq!(cfg.insn_at(next).opcode(), Opcode::Return);
        code.clear_cfg(None);
    }

    #[test]
    fn next_following_gotos_detects_loops() {
        let mut b = CodeBuilder::new(1);
        let head = b.fresh_label();
        b.push(const_insn(0, 1));
        b.label(head);
        b.goto(head);
        let mut code = b.build();

        code.build_cfg();
        let cfg = code.cfg();
        let start = cfg
            .insn_locs()
            .into_iter()
            .find(|&l| cfg.insn_at(l).opcode() == Opcode::Const)
            .unwrap();
        assert_eq!(cfg.next_following_gotos(start), None);
        code.clear_cfg(None);
    }

    #[test]
    fn exit_block_postdominates_returns() {
        let mut b = CodeBuilder::new(1);
        let other = b.fresh_label();
        b.push(load_param(0));
        b.branch(if_insn(Opcode::IfEqz, &[0]), other);
        b.push(return_void());
        b.label(other);
        b.push(return_void());
        let mut code = b.build();

        code.build_cfg();
        let cfg = code.cfg_mut();
        assert_eq!(cfg.exit_block(), None);
        cfg.calculate_exit_block();
        let exit = cfg.exit_block().expect("ghost exit created");
        assert_eq!(cfg.pred_edges(exit).len(), 2);
        assert!(cfg
            .pred_edges(exit)
            .iter()
            .all(|&e| cfg.edge(e).kind == EdgeKind::Ghost));
        code.clear_cfg(None);
        // The ghost block never reaches the linear form.
        assert_eq!(
            opcodes_of(&code)
                .iter()
                .filter(|&&op| op == Opcode::ReturnVoid)
                .count(),
            2
        );
    }

    #[test]
    fn remove_unreachable_blocks_counts_insns() {
        let mut b = CodeBuilder::new(1);
        let dead = b.fresh_label();
        let live = b.fresh_label();
        b.push(const_insn(0, 1));
        b.goto(live);
        b.label(dead);
        b.push(const_insn(0, 2));
        b.push(const_insn(0, 3));
        b.push(return_void());
        b.label(live);
        b.push(return_value(0));
        let mut code = b.build();

        code.build_cfg();
        let removed = code.cfg_mut().remove_unreachable_blocks();
        assert_eq!(removed, 3);
        code.clear_cfg(None);
        assert_eq!(opcodes_of(&code), vec![Opcode::Const, Opcode::Return]);
    }

    #[test]
    fn allocate_temp_and_recompute_registers() {
        let mut code = straight_line();
        code.build_cfg();
        let cfg = code.cfg_mut();
        assert_eq!(cfg.registers_size(), 2);
        let t = cfg.allocate_temp();
        assert_eq!(t, 2);
        assert_eq!(cfg.registers_size(), 3);
        // Nothing uses the temp, so a recompute shrinks back.
        cfg.recompute_registers_size();
        assert_eq!(cfg.registers_size(), 2);
        code.clear_cfg(None);
    }
}
