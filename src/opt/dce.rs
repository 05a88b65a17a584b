//! Local dead-code elimination.
//!
//! A backward liveness fixpoint over a bit vector of registers plus one
//! "result" bit for the implicit result register. Instructions that are
//! neither live nor side-effecting are removed; `MoveResult*` pseudos go
//! away together with their producer. Invokes of methods in the
//! caller-supplied pure set are kept only if their result is live.

use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cfg::ControlFlowGraph;
use crate::ir::entities::{Block, InsnUid, MethodId};
use crate::ir::insn::{Insn, Opcode};
use crate::ir::{DexContext, IrCode, Scope};
use crate::resolver::{self, search_for_invoke};

/// A fixed-width bit vector of register liveness; the last bit is the
/// implicit result register.
#[derive(Clone, PartialEq, Eq)]
struct LiveSet {
    words: Vec<u64>,
    bits: usize,
}

impl LiveSet {
    fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
            bits,
        }
    }

    fn test(&self, bit: usize) -> bool {
        debug_assert!(bit < self.bits);
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.bits);
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    fn reset(&mut self, bit: usize) {
        debug_assert!(bit < self.bits);
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    fn union_with(&mut self, other: &Self) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= b;
        }
    }
}

/// Per-run statistics, merged across methods by the caller.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Stats {
    pub dead_instructions: usize,
    pub unreachable_instructions: usize,
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, rhs: Self) {
        self.dead_instructions += rhs.dead_instructions;
        self.unreachable_instructions += rhs.unreachable_instructions;
    }
}

pub struct LocalDce<'a> {
    ctx: &'a DexContext,
    scope: &'a Scope,
    pure_methods: &'a FxHashSet<MethodId>,
}

impl<'a> LocalDce<'a> {
    pub fn new(
        ctx: &'a DexContext,
        scope: &'a Scope,
        pure_methods: &'a FxHashSet<MethodId>,
    ) -> Self {
        Self {
            ctx,
            scope,
            pure_methods,
        }
    }

    /// Run over a linear body, building and clearing the CFG.
    pub fn run(&self, code: &mut IrCode) -> Stats {
        code.build_cfg();
        let stats = self.run_on_cfg(code.cfg_mut());
        code.clear_cfg(None);
        stats
    }

    /// Run over an already-built CFG.
    pub fn run_on_cfg(&self, cfg: &mut ControlFlowGraph) -> Stats {
        let regs = cfg.registers_size() as usize;
        let result_bit = regs;
        let mut rpo = cfg.reverse_postorder();
        rpo.reverse();
        let postorder = rpo;

        let mut liveness: FxHashMap<Block, LiveSet> = postorder
            .iter()
            .map(|&b| (b, LiveSet::new(regs + 1)))
            .collect();

        // Iterate the backward liveness analysis to a fixed point,
        // collecting the dead instructions of the final round.
        let mut dead: Vec<InsnUid> = Vec::new();
        loop {
            let mut changed = false;
            dead.clear();
            for &block in &postorder {
                let prev = liveness[&block].clone();
                let mut live = LiveSet::new(regs + 1);
                for &e in cfg.succ_edges(block) {
                    let target = cfg.edge(e).dst;
                    if target == block {
                        live.union_with(&prev);
                    } else if let Some(succ_live) = liveness.get(&target) {
                        live.union_with(succ_live);
                    }
                }
                let insns: Vec<&Insn> = cfg.block_insns(block).collect();
                for insn in insns.into_iter().rev() {
                    if self.is_required(insn, &live, result_bit) {
                        update_liveness(insn, &mut live, result_bit);
                    } else if !insn.opcode().is_move_result_pseudo() {
                        // Pseudos disappear with their producer.
                        dead.push(insn.uid());
                    }
                }
                if live != prev {
                    changed = true;
                }
                liveness.insert(block, live);
            }
            if !changed {
                break;
            }
        }

        let mut stats = Stats::default();
        let mut seen = FxHashSet::default();
        for &uid in &dead {
            if !seen.insert(uid) {
                continue;
            }
            if let Some(loc) = cfg.find_insn(uid) {
                trace!("removing dead instruction {:?}", cfg.insn_at(loc).opcode());
                cfg.remove_insn(loc);
                stats.dead_instructions += 1;
            }
        }
        stats.unreachable_instructions = cfg.remove_unreachable_blocks();
        cfg.recompute_registers_size();
        stats
    }

    /// An instruction is required iff it has observable side effects or
    /// its destination (or the result bit, for result producers) is live.
    fn is_required(&self, insn: &Insn, live: &LiveSet, result_bit: usize) -> bool {
        let op = insn.opcode();
        if op.side_effects() {
            if op.is_invoke() {
                if !self.is_pure(insn) {
                    return true;
                }
                return live.test(result_bit);
            }
            return true;
        }
        if let Some(dest) = insn.dest_opt() {
            return live.test(dest as usize);
        }
        if op == Opcode::FilledNewArray || op.has_move_result_pseudo() {
            // These deliver their value through the result slot but are
            // not inherently live the way invokes are.
            return live.test(result_bit);
        }
        false
    }

    fn is_pure(&self, insn: &Insn) -> bool {
        let mref = insn.method_ref();
        if self.pure_methods.contains(&mref) {
            return true;
        }
        match resolver::resolve_method(
            self.ctx,
            self.scope,
            mref,
            search_for_invoke(insn.opcode()),
        ) {
            Some(def) => self.pure_methods.contains(&def),
            None => false,
        }
    }
}

fn update_liveness(insn: &Insn, live: &mut LiveSet, result_bit: usize) {
    // The destination is killed before the sources are read.
    if let Some(dest) = insn.dest_opt() {
        live.reset(dest as usize);
    }
    let op = insn.opcode();
    if op.is_invoke() || op == Opcode::FilledNewArray || op.has_move_result_pseudo() {
        live.reset(result_bit);
    }
    for i in 0..insn.srcs_size() {
        live.set(insn.src(i) as usize);
    }
    if op.is_move_result_any() {
        live.set(result_bit);
    }
}

/// The minimal pure-method set; the driver extends it.
pub fn default_pure_methods(ctx: &DexContext) -> FxHashSet<MethodId> {
    let mut pure = FxHashSet::default();
    pure.insert(ctx.known().class_get_simple_name);
    pure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::*;
    use crate::ir::{AccessFlags, DexClass, MethodDef, Opcode};

    fn empty_scope() -> Scope {
        Scope::new()
    }

    #[test]
    fn removes_dead_constant_and_pure_call() {
        let ctx = DexContext::new();
        let mut scope = Scope::new();

        // class X with a static pure() method.
        let x_ty = ctx.get_or_make_type("Lcom/example/X;");
        let pure_ref = ctx.make_method("Lcom/example/X;", "pure", &[], "I");
        let mut x_cls = DexClass::new(x_ty, Some(ctx.known().object), AccessFlags::PUBLIC);
        x_cls.add_method(
            &ctx,
            MethodDef::new(pure_ref, AccessFlags::PUBLIC | AccessFlags::STATIC),
        );
        scope.add_class(x_cls);

        let mut pure = FxHashSet::default();
        pure.insert(pure_ref);

        // v0 = const 42; v1 = X.pure(); return-void
        let mut b = CodeBuilder::new(2);
        b.push(const_insn(0, 42));
        b.push(invoke_static(pure_ref, &[]));
        b.push(move_result(1));
        b.push(return_void());
        let mut code = b.build();

        let dce = LocalDce::new(&ctx, &scope, &pure);
        let stats = dce.run(&mut code);

        assert_eq!(opcodes_of(&code), vec![Opcode::ReturnVoid]);
        assert_eq!(stats.dead_instructions, 3);
        assert_eq!(code.registers_size(), 0);
    }

    #[test]
    fn keeps_impure_invokes() {
        let ctx = DexContext::new();
        let scope = empty_scope();
        let pure = FxHashSet::default();
        let m = ctx.make_method("Lcom/example/Y;", "sideEffect", &[], "V");

        let mut b = CodeBuilder::new(1);
        b.push(const_insn(0, 7));
        b.push(invoke_static(m, &[]));
        b.push(return_void());
        let mut code = b.build();

        LocalDce::new(&ctx, &scope, &pure).run(&mut code);
        assert_eq!(
            opcodes_of(&code),
            vec![Opcode::InvokeStatic, Opcode::ReturnVoid]
        );
    }

    #[test]
    fn keeps_live_chains() {
        let ctx = DexContext::new();
        let scope = empty_scope();
        let pure = FxHashSet::default();

        // v0 = const 1; v1 = move v0; return v1
        let mut b = CodeBuilder::new(2);
        b.push(const_insn(0, 1));
        b.push(move_insn(1, 0));
        b.push(return_value(1));
        let mut code = b.build();

        LocalDce::new(&ctx, &scope, &pure).run(&mut code);
        assert_eq!(
            opcodes_of(&code),
            vec![Opcode::Const, Opcode::Move, Opcode::Return]
        );
    }

    #[test]
    fn dce_is_idempotent() {
        let ctx = DexContext::new();
        let scope = empty_scope();
        let pure = FxHashSet::default();

        let mut b = CodeBuilder::new(3);
        b.push(const_insn(0, 1));
        b.push(const_insn(1, 2));
        b.push(binop(Opcode::AddInt, 2, 0, 1));
        b.push(return_void());
        let mut code = b.build();

        let dce = LocalDce::new(&ctx, &scope, &pure);
        dce.run(&mut code);
        let after_once = opcodes_of(&code);
        let stats = dce.run(&mut code);
        assert_eq!(opcodes_of(&code), after_once);
        assert_eq!(stats.dead_instructions, 0);
    }
}
