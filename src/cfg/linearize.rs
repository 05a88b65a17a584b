//! CFG linearization.
//!
//! Serialization visits blocks in a caller-supplied order; the default is
//! reverse postorder grouped into fallthrough chains. Fallthrough edges the
//! chosen order breaks become explicit gotos; try regions are re-derived
//! from the throw-edge signature of consecutive blocks.

use std::sync::atomic::{AtomicUsize, Ordering};

use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::cfg::{BlockItem, ControlFlowGraph, EdgeKind};
use crate::ir::code::{BranchTarget, CatchHandlers, Item};
use crate::ir::entities::{Block, Label, TryId, TypeId};
use crate::ir::insn::{Insn, Opcode};

/// A maximal sequence of blocks joined by fallthrough-only edges.
pub struct Chain {
    pub blocks: Vec<Block>,
}

impl Chain {
    /// The first source block annotation found in the chain.
    pub fn first_source_block<'a>(
        &self,
        cfg: &'a ControlFlowGraph,
    ) -> Option<&'a crate::ir::SourceBlock> {
        self.blocks.iter().find_map(|&b| {
            cfg.block_items(b).iter().find_map(|item| match item {
                BlockItem::SourceBlock(sb) => Some(sb),
                _ => None,
            })
        })
    }
}

/// A block-ordering policy for serialization.
pub trait LinearizationStrategy {
    /// Produce the emission order from the fallthrough chains, which are
    /// given in reverse-postorder of their heads. Every block must appear
    /// exactly once; intra-chain order must be preserved.
    fn order(&self, cfg: &ControlFlowGraph, chains: Vec<Chain>) -> Vec<Block>;
}

/// Defers chains that profiling marks cold to the tail of the method.
///
/// A chain is cold iff the first source block in it has an appearance rate
/// below the threshold in the selected interaction profile, or carries no
/// data at all. The entry chain is never deferred.
pub struct ProfileGuidedLinearization {
    pub interaction: usize,
    pub low_appearance_threshold: f32,
    deferred_blocks: AtomicUsize,
    total_blocks: AtomicUsize,
}

impl ProfileGuidedLinearization {
    pub fn new(interaction: usize, low_appearance_threshold: f32) -> Self {
        Self {
            interaction,
            low_appearance_threshold,
            deferred_blocks: AtomicUsize::new(0),
            total_blocks: AtomicUsize::new(0),
        }
    }

    fn chain_is_cold(&self, cfg: &ControlFlowGraph, chain: &Chain) -> bool {
        if chain.blocks.contains(&cfg.entry_block()) {
            return false;
        }
        match chain.first_source_block(cfg) {
            Some(sb) => match sb.val(self.interaction) {
                Some(val) => val <= self.low_appearance_threshold,
                None => true,
            },
            None => true,
        }
    }

    pub fn num_deferred_blocks(&self) -> usize {
        self.deferred_blocks.load(Ordering::Relaxed)
    }

    pub fn num_total_blocks(&self) -> usize {
        self.total_blocks.load(Ordering::Relaxed)
    }
}

impl LinearizationStrategy for ProfileGuidedLinearization {
    fn order(&self, cfg: &ControlFlowGraph, chains: Vec<Chain>) -> Vec<Block> {
        let mut main_order = Vec::new();
        let mut deferred = Vec::new();
        for chain in chains {
            if self.chain_is_cold(cfg, &chain) {
                deferred.extend(chain.blocks);
            } else {
                main_order.extend(chain.blocks);
            }
        }
        if !main_order.is_empty() {
            self.deferred_blocks.fetch_add(deferred.len(), Ordering::Relaxed);
        }
        self.total_blocks
            .fetch_add(main_order.len() + deferred.len(), Ordering::Relaxed);
        main_order.extend(deferred);
        main_order
    }
}

impl ControlFlowGraph {
    /// Reverse postorder over the blocks reachable from the entry,
    /// following all non-ghost edges.
    pub fn reverse_postorder(&self) -> Vec<Block> {
        enum Visit {
            Pre(Block),
            Post(Block),
        }
        let mut visited = rustc_hash::FxHashSet::default();
        let mut postorder = Vec::new();
        let mut stack = vec![Visit::Pre(self.entry)];
        while let Some(v) = stack.pop() {
            match v {
                Visit::Pre(block) => {
                    if !visited.insert(block) {
                        continue;
                    }
                    stack.push(Visit::Post(block));
                    for &e in self.blocks[block].succs.iter().rev() {
                        if self.edges[e].kind != EdgeKind::Ghost {
                            let dst = self.edges[e].dst;
                            if !visited.contains(&dst) {
                                stack.push(Visit::Pre(dst));
                            }
                        }
                    }
                }
                Visit::Post(block) => postorder.push(block),
            }
        }
        postorder.reverse();
        postorder
    }

    /// Group the reachable blocks into fallthrough chains, in
    /// reverse-postorder of chain heads.
    pub fn chains(&self) -> Vec<Chain> {
        let rpo = self.reverse_postorder();
        let mut chained: FxHashMap<Block, ()> = FxHashMap::default();
        let mut chains = Vec::new();
        for &head in &rpo {
            if chained.contains_key(&head) {
                continue;
            }
            let mut blocks = vec![head];
            chained.insert(head, ());
            let mut cur = head;
            loop {
                let Some(goto) = self.goto_edge(cur) else { break };
                let target = self.edges[goto].dst;
                if chained.contains_key(&target)
                    || target == self.entry
                    || self.blocks[target].preds.len() != 1
                {
                    break;
                }
                chained.insert(target, ());
                blocks.push(target);
                cur = target;
            }
            chains.push(Chain { blocks });
        }
        chains
    }

    /// Serialize the CFG to a linear item list. Consumes the graph.
    ///
    /// Returns the items, the rebuilt catch-handler table, the next free
    /// label number, and the register count.
    pub(crate) fn linearize(
        mut self,
        strategy: Option<&dyn LinearizationStrategy>,
    ) -> (Vec<Item>, PrimaryMap<TryId, CatchHandlers>, u32, u32) {
        let chains = self.chains();
        let order: Vec<Block> = match strategy {
            Some(s) => s.order(&self, chains),
            None => chains.into_iter().flat_map(|c| c.blocks).collect(),
        };
        let order: Vec<Block> = order
            .into_iter()
            .filter(|&b| !self.blocks[b].ghost)
            .collect();
        debug_assert_eq!(order.first(), Some(&self.entry));

        let index_of: FxHashMap<Block, usize> =
            order.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        // Label assignment: branch and throw targets always; goto targets
        // only when the transfer cannot fall through.
        let mut labels: FxHashMap<Block, Label> = FxHashMap::default();
        let mut next_label = 0u32;
        let mut label_of = |block: Block, labels: &mut FxHashMap<Block, Label>| -> Label {
            *labels.entry(block).or_insert_with(|| {
                let l = Label::from_u32(next_label);
                next_label += 1;
                l
            })
        };
        for (i, &block) in order.iter().enumerate() {
            for &e in &self.blocks[block].succs {
                let edge = self.edges[e];
                match edge.kind {
                    EdgeKind::Branch { .. } | EdgeKind::Throw { .. } => {
                        label_of(edge.dst, &mut labels);
                    }
                    EdgeKind::Goto => {
                        if index_of.get(&edge.dst) != Some(&(i + 1)) {
                            label_of(edge.dst, &mut labels);
                        }
                    }
                    EdgeKind::Ghost => {}
                }
            }
        }

        // Try-region signatures.
        let throw_sig = |cfg: &ControlFlowGraph, block: Block| -> Vec<(Option<TypeId>, Block)> {
            cfg.throw_edges(block)
                .iter()
                .map(|&e| match cfg.edges[e].kind {
                    EdgeKind::Throw { catch_type } => (catch_type, cfg.edges[e].dst),
                    _ => unreachable!(),
                })
                .collect()
        };

        let mut items = Vec::new();
        let mut catches: PrimaryMap<TryId, CatchHandlers> = PrimaryMap::new();
        let mut open_try: Option<(TryId, Vec<(Option<TypeId>, Block)>)> = None;

        for (i, &block) in order.iter().enumerate() {
            let sig = throw_sig(&self, block);
            let changed = open_try.as_ref().map(|(_, s)| s != &sig).unwrap_or(!sig.is_empty());
            if changed {
                if let Some((tid, _)) = open_try.take() {
                    items.push(Item::TryEnd(tid));
                }
                if !sig.is_empty() {
                    let handlers = CatchHandlers {
                        handlers: sig
                            .iter()
                            .map(|&(ty, target)| (ty, label_of(target, &mut labels)))
                            .collect(),
                    };
                    let tid = catches.push(handlers);
                    items.push(Item::TryStart(tid));
                    open_try = Some((tid, sig));
                }
            }

            if let Some(&label) = labels.get(&block) {
                items.push(Item::Label(label));
            }

            let block_items = std::mem::take(&mut self.blocks[block].items);
            let mut tail_branch: Option<Insn> = None;
            let n = block_items.len();
            for (j, item) in block_items.into_iter().enumerate() {
                match item {
                    BlockItem::Insn(insn) => {
                        let op = insn.opcode();
                        if j + 1 == n && (op.is_conditional_branch() || op == Opcode::Switch) {
                            tail_branch = Some(insn);
                        } else {
                            items.push(Item::Insn(insn));
                        }
                    }
                    BlockItem::Position(pos) => items.push(Item::Position(pos)),
                    BlockItem::SourceBlock(sb) => items.push(Item::SourceBlock(sb)),
                }
            }

            if let Some(insn) = tail_branch {
                let mut targets: SmallVec<[BranchTarget; 2]> = SmallVec::new();
                for &e in &self.blocks[block].succs {
                    let edge = self.edges[e];
                    if let EdgeKind::Branch { case_key } = edge.kind {
                        targets.push(BranchTarget {
                            case_key,
                            label: label_of(edge.dst, &mut labels),
                        });
                    }
                }
                assert!(!targets.is_empty(), "branch block without branch edges");
                items.push(Item::Branch { insn, targets });
            }

            // Fallthrough repair: materialize the goto when the target is
            // not the next emitted block.
            if let Some(goto) = self.goto_edge(block) {
                let target = self.edges[goto].dst;
                if index_of.get(&target) != Some(&(i + 1)) {
                    let label = label_of(target, &mut labels);
                    let mut targets: SmallVec<[BranchTarget; 2]> = SmallVec::new();
                    targets.push(BranchTarget {
                        case_key: None,
                        label,
                    });
                    items.push(Item::Branch {
                        insn: Insn::new(Opcode::Goto),
                        targets,
                    });
                }
            }
        }
        if let Some((tid, _)) = open_try.take() {
            items.push(Item::TryEnd(tid));
        }

        (items, catches, next_label, self.registers_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::*;
    use crate::ir::SourceBlock;

    fn source_block(id: u32, rate: f32) -> SourceBlock {
        let mut sb = SourceBlock::new(id);
        sb.appearances.push(Some(rate));
        sb
    }

    /// A conditional with a hot fallthrough and a cold taken side.
    fn profiled_method() -> crate::ir::IrCode {
        let mut b = CodeBuilder::new(2);
        let cold = b.fresh_label();
        b.push(load_param(0));
        b.source_block(source_block(0, 0.9));
        b.branch(if_insn(Opcode::IfEqz, &[0]), cold);
        b.source_block(source_block(1, 0.9));
        b.push(const_insn(1, 10));
        b.push(return_value(1));
        b.label(cold);
        b.source_block(source_block(2, 0.01));
        b.push(const_insn(1, 20));
        b.push(return_value(1));
        b.build()
    }

    #[test]
    fn chains_group_fallthrough_runs() {
        let mut code = profiled_method();
        code.build_cfg();
        let chains = code.cfg().chains();
        // Every block appears exactly once across the chains.
        let total: usize = chains.iter().map(|c| c.blocks.len()).sum();
        assert_eq!(total, code.cfg().num_blocks());
        code.clear_cfg(None);
    }

    #[test]
    fn cold_chains_are_deferred_to_the_tail() {
        let mut code = profiled_method();
        code.build_cfg();
        let strategy = ProfileGuidedLinearization::new(0, 0.05);
        code.clear_cfg(Some(&strategy));
        assert!(strategy.num_deferred_blocks() >= 1);
        assert_eq!(strategy.num_total_blocks(), 4);

        // The cold arm's constant is now last in the linear order.
        let consts: Vec<i64> = code
            .insns()
            .filter(|i| i.opcode() == Opcode::Const)
            .map(|i| i.literal())
            .collect();
        assert_eq!(consts, vec![10, 20]);
        // Behavior is unchanged: rebuilding still yields both returns.
        code.build_cfg();
        assert_eq!(
            code.cfg()
                .insns()
                .filter(|i| i.opcode() == Opcode::Return)
                .count(),
            2
        );
        code.clear_cfg(None);
    }

    #[test]
    fn blocks_without_profile_data_count_as_cold() {
        let mut b = CodeBuilder::new(1);
        let other = b.fresh_label();
        b.push(load_param(0));
        b.source_block(source_block(0, 0.9));
        b.branch(if_insn(Opcode::IfEqz, &[0]), other);
        b.push(return_void());
        b.label(other);
        // No source block here at all.
        b.push(return_void());
        let mut code = b.build();

        code.build_cfg();
        let strategy = ProfileGuidedLinearization::new(0, 0.05);
        code.clear_cfg(Some(&strategy));
        assert!(strategy.num_deferred_blocks() >= 1);
    }
}
