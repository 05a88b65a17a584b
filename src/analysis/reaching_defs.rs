//! Reaching definitions and derived def-use chains.
//!
//! A forward fixpoint over per-register sets of defining instructions. The
//! plain variant treats every assignment as a distinct definition; the
//! move-aware variant propagates the definitions of a move's source, so a
//! chain of moves does not introduce new definitions.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::analysis::fixpoint::{AbstractDomain, FixpointAnalyzer, FixpointIterator};
use crate::cfg::ControlFlowGraph;
use crate::ir::entities::{Block, InsnUid};
use crate::ir::insn::{Insn, Reg, RESULT_REGISTER};

/// The definitions reaching a register: a set of instructions, or top when
/// the tracking gave up.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Defs {
    /// A (possibly empty) set of defining instructions, kept sorted.
    Set(SmallVec<[InsnUid; 2]>),
    Top,
}

impl Defs {
    pub fn none() -> Self {
        Defs::Set(SmallVec::new())
    }

    pub fn single(uid: InsnUid) -> Self {
        let mut v = SmallVec::new();
        v.push(uid);
        Defs::Set(v)
    }

    pub fn is_top(&self) -> bool {
        matches!(self, Defs::Top)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Defs::Set(s) if s.is_empty())
    }

    pub fn elements(&self) -> &[InsnUid] {
        match self {
            Defs::Set(s) => s,
            Defs::Top => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.elements().len()
    }

    fn union_with(&mut self, other: &Self) {
        match (&mut *self, other) {
            (Defs::Top, _) | (_, Defs::Top) => *self = Defs::Top,
            (Defs::Set(a), Defs::Set(b)) => {
                for &uid in b {
                    if let Err(pos) = a.binary_search(&uid) {
                        a.insert(pos, uid);
                    }
                }
            }
        }
    }
}

/// The per-register reaching-definition environment. Registers without an
/// entry have no reaching definitions.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct DefsEnvironment {
    regs: FxHashMap<Reg, Defs>,
    unreachable: bool,
}

impl DefsEnvironment {
    pub fn get(&self, reg: Reg) -> Defs {
        self.regs.get(&reg).cloned().unwrap_or_else(Defs::none)
    }

    pub fn set(&mut self, reg: Reg, defs: Defs) {
        self.regs.insert(reg, defs);
    }
}

impl AbstractDomain for DefsEnvironment {
    fn bottom() -> Self {
        Self {
            regs: FxHashMap::default(),
            unreachable: true,
        }
    }

    fn top() -> Self {
        Self::default()
    }

    fn is_bottom(&self) -> bool {
        self.unreachable
    }

    fn is_top(&self) -> bool {
        !self.unreachable && self.regs.is_empty()
    }

    fn leq(&self, other: &Self) -> bool {
        if self.unreachable {
            return true;
        }
        if other.unreachable {
            return false;
        }
        // Subset order, pointwise.
        self.regs.iter().all(|(reg, defs)| match defs {
            Defs::Top => other.get(*reg).is_top(),
            Defs::Set(set) => match other.get(*reg) {
                Defs::Top => true,
                Defs::Set(oset) => set.iter().all(|uid| oset.binary_search(uid).is_ok()),
            },
        })
    }

    fn join_with(&mut self, other: &Self) {
        if other.unreachable {
            return;
        }
        if self.unreachable {
            *self = other.clone();
            return;
        }
        for (reg, defs) in &other.regs {
            match self.regs.get_mut(reg) {
                Some(mine) => mine.union_with(defs),
                None => {
                    self.regs.insert(*reg, defs.clone());
                }
            }
        }
    }

    fn meet_with(&mut self, other: &Self) {
        if self.unreachable {
            return;
        }
        if other.unreachable {
            *self = Self::bottom();
            return;
        }
        self.regs.retain(|reg, defs| {
            let other_defs = other.get(*reg);
            match (&mut *defs, other_defs) {
                (Defs::Top, o) => {
                    *defs = o;
                    !defs.is_empty()
                }
                (_, Defs::Top) => true,
                (Defs::Set(a), Defs::Set(b)) => {
                    a.retain(|uid| b.binary_search(uid).is_ok());
                    !a.is_empty()
                }
            }
        });
    }
}

/// The analysis, in plain or move-aware flavor.
pub struct ReachingDefinitions {
    move_aware: bool,
}

impl ReachingDefinitions {
    pub fn plain() -> Self {
        Self { move_aware: false }
    }

    pub fn move_aware() -> Self {
        Self { move_aware: true }
    }

    pub fn analyze_insn(&self, insn: &Insn, env: &mut DefsEnvironment) {
        let op = insn.opcode();
        if self.move_aware {
            if op.is_move() {
                let defs = env.get(insn.src(0));
                env.set(insn.dest(), defs);
                return;
            }
            if op.is_move_result_any() {
                let defs = env.get(RESULT_REGISTER);
                env.set(insn.dest(), defs);
                return;
            }
        }
        if let Some(dest) = insn.dest_opt() {
            env.set(dest, Defs::single(insn.uid()));
        }
        if op.has_move_result_any() {
            env.set(RESULT_REGISTER, Defs::single(insn.uid()));
        }
    }

    pub fn run(&self, cfg: &ControlFlowGraph) -> FixpointIterator<Self> {
        FixpointIterator::run(cfg, self, DefsEnvironment::top())
    }
}

impl FixpointAnalyzer for ReachingDefinitions {
    type Domain = DefsEnvironment;

    fn analyze_block(&self, cfg: &ControlFlowGraph, block: Block, state: &mut DefsEnvironment) {
        for insn in cfg.block_insns(block) {
            self.analyze_insn(insn, state);
        }
    }
}

/// A use: an instruction and the index of the source operand.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Use {
    pub insn: InsnUid,
    pub src_index: usize,
}

/// Def-use and use-def chains, derived from one analysis run plus a
/// re-walk of the instructions.
#[derive(Default)]
pub struct DefUseChains {
    pub def_uses: FxHashMap<InsnUid, Vec<Use>>,
    pub use_defs: FxHashMap<Use, Defs>,
}

impl DefUseChains {
    /// The uses of the value(s) defined by `def`.
    pub fn uses_of(&self, def: InsnUid) -> &[Use] {
        self.def_uses.get(&def).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Compute def-use chains over `cfg`.
pub fn compute_def_use_chains(cfg: &ControlFlowGraph, analysis: &ReachingDefinitions) -> DefUseChains {
    let fixpoint = analysis.run(cfg);
    let mut chains = DefUseChains::default();
    for block in cfg.blocks() {
        let mut env = fixpoint.entry_state_at(block);
        for insn in cfg.block_insns(block) {
            for i in 0..insn.srcs_size() {
                let defs = env.get(insn.src(i));
                let use_ = Use {
                    insn: insn.uid(),
                    src_index: i,
                };
                for &def in defs.elements() {
                    chains.def_uses.entry(def).or_default().push(use_);
                }
                chains.use_defs.insert(use_, defs);
            }
            analysis.analyze_insn(insn, &mut env);
        }
    }
    chains
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defs_union_and_order() {
        let a = InsnUid::from_u32(1);
        let b = InsnUid::from_u32(2);
        let mut d = Defs::single(b);
        d.union_with(&Defs::single(a));
        assert_eq!(d.elements(), &[a, b]);
        d.union_with(&Defs::single(a));
        assert_eq!(d.len(), 2);
        d.union_with(&Defs::Top);
        assert!(d.is_top());
    }

    #[test]
    fn environment_join_is_union() {
        let a = InsnUid::from_u32(1);
        let b = InsnUid::from_u32(2);
        let mut e1 = DefsEnvironment::top();
        e1.set(0, Defs::single(a));
        let mut e2 = DefsEnvironment::top();
        e2.set(0, Defs::single(b));
        e2.set(1, Defs::single(b));
        e1.join_with(&e2);
        assert_eq!(e1.get(0).len(), 2);
        assert_eq!(e1.get(1).len(), 1);
        assert!(e1.leq(&e1.clone()));
    }
}
