//! The forward monotone fixpoint framework.
//!
//! A client provides an abstract domain and a transfer function over blocks
//! and edges; the iterator runs them to a fixed point over the weak
//! topological ordering of the CFG. Inner components are stabilized with
//! `widen_with`, which defaults to `join_with`; the domains in this crate
//! are all of finite height, so plain joins already terminate.

use rustc_hash::FxHashMap;

use crate::analysis::wto::{WeakTopologicalOrder, WtoComponent};
use crate::cfg::{ControlFlowGraph, EdgeKind};
use crate::ir::entities::{Block, EdgeId};

/// A complete lattice element.
pub trait AbstractDomain: Clone {
    fn bottom() -> Self;
    fn top() -> Self;
    fn is_bottom(&self) -> bool;
    fn is_top(&self) -> bool;
    fn leq(&self, other: &Self) -> bool;
    fn join_with(&mut self, other: &Self);
    fn meet_with(&mut self, other: &Self);

    /// Extrapolation operator for domains of infinite height; must be an
    /// upper bound. The default is the join, which suffices for finite
    /// domains.
    fn widen_with(&mut self, other: &Self) {
        self.join_with(other);
    }
}

/// The transfer functions of a forward analysis.
pub trait FixpointAnalyzer {
    type Domain: AbstractDomain;

    /// Apply the whole block to `state`, mutating it in place from the
    /// entry state to the exit state.
    fn analyze_block(&self, cfg: &ControlFlowGraph, block: Block, state: &mut Self::Domain);

    /// Refine the state crossing a typed edge. The default carries the
    /// source's exit state through unchanged.
    fn analyze_edge(
        &self,
        cfg: &ControlFlowGraph,
        edge: EdgeId,
        exit_state_at_source: &Self::Domain,
    ) -> Self::Domain {
        let _ = (cfg, edge);
        exit_state_at_source.clone()
    }
}

/// The result of running an analysis: per-block entry and exit states.
pub struct FixpointIterator<A: FixpointAnalyzer> {
    entry_states: FxHashMap<Block, A::Domain>,
    exit_states: FxHashMap<Block, A::Domain>,
}

impl<A: FixpointAnalyzer> FixpointIterator<A> {
    /// Run `analyzer` over `cfg` starting from `init` at the entry block.
    pub fn run(cfg: &ControlFlowGraph, analyzer: &A, init: A::Domain) -> Self {
        let wto = WeakTopologicalOrder::new(cfg);
        let mut this = Self {
            entry_states: FxHashMap::default(),
            exit_states: FxHashMap::default(),
        };
        for component in wto.components() {
            this.analyze_component(cfg, analyzer, &init, component);
        }
        this
    }

    /// The state on entry to `block`; bottom if the block was never
    /// reached.
    pub fn entry_state_at(&self, block: Block) -> A::Domain {
        self.entry_states
            .get(&block)
            .cloned()
            .unwrap_or_else(A::Domain::bottom)
    }

    /// The state on exit from `block`; bottom if the block was never
    /// reached.
    pub fn exit_state_at(&self, block: Block) -> A::Domain {
        self.exit_states
            .get(&block)
            .cloned()
            .unwrap_or_else(A::Domain::bottom)
    }

    /// Consume the iterator, yielding the (entry, exit) state maps.
    pub fn into_states(
        self,
    ) -> (
        FxHashMap<Block, A::Domain>,
        FxHashMap<Block, A::Domain>,
    ) {
        (self.entry_states, self.exit_states)
    }

    fn collect_entry(
        &self,
        cfg: &ControlFlowGraph,
        analyzer: &A,
        init: &A::Domain,
        block: Block,
    ) -> A::Domain {
        let mut state = if block == cfg.entry_block() {
            init.clone()
        } else {
            A::Domain::bottom()
        };
        for &edge in cfg.pred_edges(block) {
            if cfg.edge(edge).kind == EdgeKind::Ghost {
                continue;
            }
            let src = cfg.edge(edge).src;
            if let Some(exit) = self.exit_states.get(&src) {
                if !exit.is_bottom() {
                    let refined = analyzer.analyze_edge(cfg, edge, exit);
                    state.join_with(&refined);
                }
            }
        }
        state
    }

    fn analyze_vertex(
        &mut self,
        cfg: &ControlFlowGraph,
        analyzer: &A,
        init: &A::Domain,
        block: Block,
    ) {
        let entry = self.collect_entry(cfg, analyzer, init, block);
        let mut exit = entry.clone();
        if !exit.is_bottom() {
            analyzer.analyze_block(cfg, block, &mut exit);
        }
        self.entry_states.insert(block, entry);
        self.exit_states.insert(block, exit);
    }

    fn analyze_component(
        &mut self,
        cfg: &ControlFlowGraph,
        analyzer: &A,
        init: &A::Domain,
        component: &WtoComponent,
    ) {
        match component {
            WtoComponent::Vertex(block) => self.analyze_vertex(cfg, analyzer, init, *block),
            WtoComponent::Component { head, components } => {
                self.analyze_vertex(cfg, analyzer, init, *head);
                loop {
                    for sub in components {
                        self.analyze_component(cfg, analyzer, init, sub);
                    }
                    let new_entry = self.collect_entry(cfg, analyzer, init, *head);
                    let old_entry = &self.entry_states[head];
                    if new_entry.leq(old_entry) {
                        break;
                    }
                    let mut widened = old_entry.clone();
                    widened.widen_with(&new_entry);
                    let mut exit = widened.clone();
                    if !exit.is_bottom() {
                        analyzer.analyze_block(cfg, *head, &mut exit);
                    }
                    self.entry_states.insert(*head, widened);
                    self.exit_states.insert(*head, exit);
                }
            }
        }
    }
}
