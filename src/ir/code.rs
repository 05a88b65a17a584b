//! Method bodies.
//!
//! A body is a register count plus an ordered linear list of items:
//! instructions, branches with explicit targets, labels, try-region
//! markers, source positions and source blocks. Passes that need control
//! flow build a [`ControlFlowGraph`] over the list; while the CFG is built
//! the linear list is empty and the CFG is authoritative. `clear_cfg`
//! serializes the graph back into the list, applying a linearization
//! strategy.

use cranelift_entity::PrimaryMap;
use smallvec::SmallVec;

use crate::cfg::{ControlFlowGraph, LinearizationStrategy};
use crate::ir::entities::{Label, StringId, TryId, TypeId};
use crate::ir::insn::Insn;

/// An explicit branch target. `case_key` is present on switch case edges.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BranchTarget {
    pub case_key: Option<i64>,
    pub label: Label,
}

/// A source position marker.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Position {
    pub file: Option<StringId>,
    pub line: u32,
}

/// A profiling source block: a stable id plus one appearance rate per
/// interaction profile (absent where the profile had no data).
#[derive(Clone, PartialEq, Debug)]
pub struct SourceBlock {
    pub id: u32,
    pub appearances: SmallVec<[Option<f32>; 2]>,
}

impl SourceBlock {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            appearances: SmallVec::new(),
        }
    }

    /// The appearance rate in the given interaction profile.
    pub fn val(&self, interaction: usize) -> Option<f32> {
        self.appearances.get(interaction).copied().flatten()
    }
}

/// The ordered catch handlers of one try region; a catch-all handler has no
/// type filter and must come last.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct CatchHandlers {
    pub handlers: Vec<(Option<TypeId>, Label)>,
}

/// One element of the linear item list.
#[derive(Clone, Debug)]
pub enum Item {
    Insn(Insn),
    /// A goto, conditional branch, or switch, with its explicit targets.
    /// Conditionals carry the taken target; switches one target per case.
    Branch {
        insn: Insn,
        targets: SmallVec<[BranchTarget; 2]>,
    },
    Label(Label),
    TryStart(TryId),
    TryEnd(TryId),
    Position(Position),
    SourceBlock(SourceBlock),
}

impl Item {
    /// The instruction inside this item, if it is one.
    pub fn insn(&self) -> Option<&Insn> {
        match self {
            Item::Insn(insn) | Item::Branch { insn, .. } => Some(insn),
            _ => None,
        }
    }
}

/// A method body.
pub struct IrCode {
    registers_size: u32,
    items: Vec<Item>,
    catches: PrimaryMap<TryId, CatchHandlers>,
    next_label: u32,
    cfg: Option<ControlFlowGraph>,
}

impl IrCode {
    pub fn new(registers_size: u32) -> Self {
        Self {
            registers_size,
            items: Vec::new(),
            catches: PrimaryMap::new(),
            next_label: 0,
            cfg: None,
        }
    }

    pub fn registers_size(&self) -> u32 {
        self.registers_size
    }

    pub fn set_registers_size(&mut self, regs: u32) {
        self.registers_size = regs;
    }

    pub fn fresh_label(&mut self) -> Label {
        let label = Label::from_u32(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn add_catch(&mut self, handlers: CatchHandlers) -> TryId {
        assert!(
            handlers
                .handlers
                .iter()
                .enumerate()
                .all(|(i, (ty, _))| ty.is_some() || i + 1 == handlers.handlers.len()),
            "catch-all handler must be last"
        );
        self.catches.push(handlers)
    }

    pub fn catch_handlers(&self, id: TryId) -> &CatchHandlers {
        &self.catches[id]
    }

    pub fn push(&mut self, item: Item) {
        assert!(self.cfg.is_none(), "linear list is not authoritative while a CFG is built");
        self.items.push(item);
    }

    pub fn push_insn(&mut self, insn: Insn) {
        self.push(Item::Insn(insn));
    }

    pub fn items(&self) -> &[Item] {
        assert!(self.cfg.is_none(), "linear list is not authoritative while a CFG is built");
        &self.items
    }

    /// Iterate over the instructions of the linear list.
    pub fn insns(&self) -> impl Iterator<Item = &Insn> {
        self.items().iter().filter_map(Item::insn)
    }

    pub fn count_opcodes(&self) -> usize {
        self.insns().count()
    }

    pub fn has_cfg(&self) -> bool {
        self.cfg.is_some()
    }

    /// Build the (editable) control flow graph from the linear list.
    pub fn build_cfg(&mut self) {
        assert!(self.cfg.is_none(), "CFG already built");
        let items = std::mem::take(&mut self.items);
        let cfg = ControlFlowGraph::build(items, &self.catches, self.registers_size);
        self.cfg = Some(cfg);
    }

    pub fn cfg(&self) -> &ControlFlowGraph {
        self.cfg.as_ref().expect("no CFG built for this body")
    }

    pub fn cfg_mut(&mut self) -> &mut ControlFlowGraph {
        self.cfg.as_mut().expect("no CFG built for this body")
    }

    /// Serialize the CFG back into the linear list and drop it.
    pub fn clear_cfg(&mut self, strategy: Option<&dyn LinearizationStrategy>) {
        let cfg = self.cfg.take().expect("no CFG built for this body");
        let (items, catches, next_label, registers_size) = cfg.linearize(strategy);
        self.items = items;
        self.catches = catches;
        self.next_label = next_label;
        self.registers_size = registers_size;
    }
}

/// RAII guard that builds a CFG on creation and linearizes it back on drop.
pub struct ScopedCfg<'a> {
    code: &'a mut IrCode,
}

impl<'a> ScopedCfg<'a> {
    pub fn new(code: &'a mut IrCode) -> Self {
        code.build_cfg();
        Self { code }
    }

    pub fn code(&mut self) -> &mut IrCode {
        self.code
    }
}

impl std::ops::Deref for ScopedCfg<'_> {
    type Target = ControlFlowGraph;

    fn deref(&self) -> &ControlFlowGraph {
        self.code.cfg()
    }
}

impl std::ops::DerefMut for ScopedCfg<'_> {
    fn deref_mut(&mut self) -> &mut ControlFlowGraph {
        self.code.cfg_mut()
    }
}

impl Drop for ScopedCfg<'_> {
    fn drop(&mut self) {
        self.code.clear_cfg(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::*;
    use crate::ir::Opcode;

    #[test]
    fn exactly_one_representation_is_authoritative() {
        let mut b = CodeBuilder::new(1);
        b.push(const_insn(0, 1));
        b.push(return_value(0));
        let mut code = b.build();

        assert!(!code.has_cfg());
        code.build_cfg();
        assert!(code.has_cfg());
        code.clear_cfg(None);
        assert!(!code.has_cfg());
        assert_eq!(code.count_opcodes(), 2);
    }

    #[test]
    #[should_panic]
    fn reading_the_list_with_a_built_cfg_panics() {
        let mut b = CodeBuilder::new(1);
        b.push(return_void());
        let mut code = b.build();
        code.build_cfg();
        let _ = code.items();
    }

    #[test]
    fn scoped_cfg_builds_and_clears() {
        let mut b = CodeBuilder::new(1);
        b.push(const_insn(0, 3));
        b.push(return_value(0));
        let mut code = b.build();

        {
            let mut cfg = ScopedCfg::new(&mut code);
            let loc = cfg
                .insn_locs()
                .into_iter()
                .find(|&l| cfg.insn_at(l).opcode() == Opcode::Const)
                .unwrap();
            cfg.insn_at_mut(loc).set_literal(9);
        }
        assert!(!code.has_cfg());
        let konst = code
            .insns()
            .find(|i| i.opcode() == Opcode::Const)
            .unwrap();
        assert_eq!(konst.literal(), 9);
    }
}
