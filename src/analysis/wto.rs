//! Weak topological ordering.
//!
//! Bourdoncle's hierarchical decomposition of the CFG into nested strongly
//! connected components. The fixpoint iterator stabilizes each component
//! before moving on, which gives fast convergence on reducible graphs and
//! guaranteed termination on any graph.

use rustc_hash::FxHashMap;

use crate::cfg::{ControlFlowGraph, EdgeKind};
use crate::ir::entities::Block;

/// One element of a weak topological ordering.
pub enum WtoComponent {
    Vertex(Block),
    /// A strongly connected component: its head, then the nested ordering
    /// of the rest of the component.
    Component {
        head: Block,
        components: Vec<WtoComponent>,
    },
}

/// A weak topological ordering of the blocks reachable from the entry.
pub struct WeakTopologicalOrder {
    components: Vec<WtoComponent>,
}

struct Builder<'a> {
    cfg: &'a ControlFlowGraph,
    dfn: FxHashMap<Block, u32>,
    stack: Vec<Block>,
    num: u32,
}

impl<'a> Builder<'a> {
    fn succs(&self, block: Block) -> Vec<Block> {
        self.cfg
            .succ_edges(block)
            .iter()
            .filter(|&&e| self.cfg.edge(e).kind != EdgeKind::Ghost)
            .map(|&e| self.cfg.edge(e).dst)
            .collect()
    }

    fn visit(&mut self, vertex: Block, partition: &mut Vec<WtoComponent>) -> u32 {
        self.stack.push(vertex);
        self.num += 1;
        self.dfn.insert(vertex, self.num);
        let mut head = self.num;
        let mut loop_ = false;
        for succ in self.succs(vertex) {
            let min = match self.dfn.get(&succ).copied().unwrap_or(0) {
                0 => self.visit(succ, partition),
                n => n,
            };
            if min <= head {
                head = min;
                loop_ = true;
            }
        }
        if head == *self.dfn.get(&vertex).unwrap() {
            self.dfn.insert(vertex, u32::MAX);
            let mut element = self.stack.pop().unwrap();
            if loop_ {
                while element != vertex {
                    self.dfn.insert(element, 0);
                    element = self.stack.pop().unwrap();
                }
                partition.insert(0, self.component(vertex));
            } else {
                partition.insert(0, WtoComponent::Vertex(vertex));
            }
        }
        head
    }

    fn component(&mut self, head: Block) -> WtoComponent {
        let mut partition = Vec::new();
        for succ in self.succs(head) {
            if self.dfn.get(&succ).copied().unwrap_or(0) == 0 {
                self.visit(succ, &mut partition);
            }
        }
        WtoComponent::Component {
            head,
            components: partition,
        }
    }
}

impl WeakTopologicalOrder {
    pub fn new(cfg: &ControlFlowGraph) -> Self {
        let mut builder = Builder {
            cfg,
            dfn: FxHashMap::default(),
            stack: Vec::new(),
            num: 0,
        };
        let mut components = Vec::new();
        builder.visit(cfg.entry_block(), &mut components);
        Self { components }
    }

    pub fn components(&self) -> &[WtoComponent] {
        &self.components
    }

    /// Visit every block in ordering order, ignoring the nesting.
    pub fn visit_depth_first(&self, mut f: impl FnMut(Block)) {
        fn walk(components: &[WtoComponent], f: &mut impl FnMut(Block)) {
            for c in components {
                match c {
                    WtoComponent::Vertex(b) => f(*b),
                    WtoComponent::Component { head, components } => {
                        f(*head);
                        walk(components, f);
                    }
                }
            }
        }
        walk(&self.components, &mut f);
    }
}
