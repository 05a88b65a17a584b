//! Boolean branch reduction.
//!
//! Two rewrites over use-def chains:
//!
//! - diamond folding: `v ? const 1 : const 0` into the same register on
//!   both sides of a two-armed conditional collapses to a move (or
//!   `xor 1`) of `v`, or to `instance-of v, Object` when `v` is a
//!   reference and the diamond owns all predecessors of the join;
//! - xor reduction: a chain of `xor v, 1` feeding a zero-test collapses,
//!   inverting the test when the negation count is odd.

use log::trace;

use crate::analysis::fixpoint::FixpointIterator;
use crate::analysis::reaching_defs::{Defs, ReachingDefinitions};
use crate::cfg::{ControlFlowGraph, EdgeId, InsnLoc};
use crate::ir::entities::{Block, InsnUid, TypeId};
use crate::ir::insn::{Insn, Opcode, Reg};
use crate::ir::{DexContext, IrCode};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Stats {
    pub boolean_branches_removed: usize,
    pub object_branches_removed: usize,
    pub xors_reduced: usize,
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, rhs: Self) {
        self.boolean_branches_removed += rhs.boolean_branches_removed;
        self.object_branches_removed += rhs.object_branches_removed;
        self.xors_reduced += rhs.xors_reduced;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum SourceKind {
    None,
    Boolean,
    Object,
    Unknown,
}

impl SourceKind {
    fn combine(self, other: SourceKind) -> SourceKind {
        use SourceKind::*;
        match (self, other) {
            (None, x) | (x, None) => x,
            (a, b) if a == b => a,
            _ => Unknown,
        }
    }
}

/// Classifies register sources through move-aware reaching definitions.
struct Analyzer<'a> {
    ctx: &'a DexContext,
    is_static: bool,
    args: &'a [TypeId],
    defs: Option<FixpointIterator<ReachingDefinitions>>,
}

impl<'a> Analyzer<'a> {
    fn new(ctx: &'a DexContext, is_static: bool, args: &'a [TypeId]) -> Self {
        Self {
            ctx,
            is_static,
            args,
            defs: None,
        }
    }

    fn defs_at(&mut self, cfg: &ControlFlowGraph, loc: InsnLoc, src: Reg) -> Defs {
        let analysis = ReachingDefinitions::move_aware();
        if self.defs.is_none() {
            self.defs = Some(analysis.run(cfg));
        }
        let fixpoint = self.defs.as_ref().unwrap();
        let mut env = fixpoint.entry_state_at(loc.block);
        let target = cfg.insn_at(loc).uid();
        for insn in cfg.block_insns(loc.block) {
            if insn.uid() == target {
                break;
            }
            analysis.analyze_insn(insn, &mut env);
        }
        env.get(src)
    }

    fn classify_type(&self, ty: TypeId) -> SourceKind {
        if self.ctx.is_boolean(ty) {
            SourceKind::Boolean
        } else if self.ctx.is_object(ty) {
            SourceKind::Object
        } else {
            SourceKind::Unknown
        }
    }

    /// What kind of value flows into `src` at `loc`.
    fn classify(&mut self, cfg: &ControlFlowGraph, loc: InsnLoc, src: Reg) -> SourceKind {
        let defs = self.defs_at(cfg, loc, src);
        if defs.is_top() || defs.is_empty() {
            return SourceKind::Unknown;
        }
        let mut result = SourceKind::None;
        for &def in defs.elements() {
            let Some(def_loc) = cfg.find_insn(def) else {
                return SourceKind::Unknown;
            };
            let insn = cfg.insn_at(def_loc);
            let kind = match insn.opcode() {
                Opcode::IgetBoolean
                | Opcode::AgetBoolean
                | Opcode::SgetBoolean
                | Opcode::InstanceOf => SourceKind::Boolean,
                Opcode::ConstString
                | Opcode::ConstClass
                | Opcode::NewInstance
                | Opcode::NewArray
                | Opcode::FilledNewArray
                | Opcode::IgetObject
                | Opcode::AgetObject
                | Opcode::SgetObject
                | Opcode::CheckCast
                | Opcode::LoadParamObject => SourceKind::Object,
                Opcode::LoadParam => {
                    // Position among the parameter bindings selects the
                    // signature slot; `this` occupies the first.
                    let params = cfg.param_insns();
                    let index = params
                        .iter()
                        .position(|p| p.uid() == def)
                        .expect("load-param outside the prelude");
                    let arg_index = if self.is_static { index } else { index - 1 };
                    match self.args.get(arg_index) {
                        Some(&ty) => self.classify_type(ty),
                        None => SourceKind::Unknown,
                    }
                }
                op if op.is_invoke() => {
                    let proto = self.ctx.proto(self.ctx.method(insn.method_ref()).proto);
                    self.classify_type(proto.rtype)
                }
                _ => return SourceKind::Unknown,
            };
            result = result.combine(kind);
        }
        result
    }

    /// Walk a chain of `xor v, 1` definitions down to its root. Returns
    /// the root location and the negation count, or `None` when the root
    /// is not a boolean.
    fn boolean_root(
        &mut self,
        cfg: &ControlFlowGraph,
        start: InsnLoc,
    ) -> Option<(InsnLoc, usize)> {
        let mut negations = 0usize;
        let mut it = start;
        loop {
            let defs = self.defs_at(cfg, it, cfg.insn_at(it).src(0));
            if defs.is_top() || defs.len() != 1 {
                break;
            }
            let def = defs.elements()[0];
            let Some(def_loc) = cfg.find_insn(def) else {
                break;
            };
            let def_insn = cfg.insn_at(def_loc);
            if def_insn.opcode() != Opcode::XorIntLit || def_insn.literal() != 1 {
                break;
            }
            it = def_loc;
            negations += 1;
        }
        if self.classify(cfg, it, cfg.insn_at(it).src(0)) != SourceKind::Boolean {
            return None;
        }
        Some((it, negations))
    }
}

pub struct ReduceBooleanBranches<'a> {
    ctx: &'a DexContext,
    is_static: bool,
    args: &'a [TypeId],
    stats: Stats,
}

impl<'a> ReduceBooleanBranches<'a> {
    pub fn new(ctx: &'a DexContext, is_static: bool, args: &'a [TypeId]) -> Self {
        Self {
            ctx,
            is_static,
            args,
            stats: Stats::default(),
        }
    }

    /// One round of both rewrites; returns the statistics. Callers that
    /// want a fixed point re-run while the counters move.
    pub fn run(&mut self, code: &mut IrCode) -> Stats {
        code.build_cfg();
        self.reduce_diamonds(code.cfg_mut());
        self.reduce_xors(code.cfg_mut());
        code.clear_cfg(None);
        self.stats
    }

    fn reduce_diamonds(&mut self, cfg: &mut ControlFlowGraph) -> bool {
        struct Reduction {
            branch: InsnUid,
            block: Block,
            replacement: Vec<Insn>,
            goto_edge: EdgeId,
            join: Block,
        }
        let mut analyzer = Analyzer::new(self.ctx, self.is_static, self.args);
        let mut reductions: Vec<Reduction> = Vec::new();
        for block in cfg.blocks() {
            let Some(last) = cfg.last_insn(block) else {
                continue;
            };
            let op = last.opcode();
            if op != Opcode::IfEqz && op != Opcode::IfNez {
                continue;
            }
            let Some(goto_edge) = cfg.goto_edge(block) else {
                continue;
            };
            let branch_edges = cfg.branch_edges(block);
            if branch_edges.len() != 1 {
                continue;
            }
            let branch_edge = branch_edges[0];
            let goto_target = cfg.edge(goto_edge).dst;
            let branch_target = cfg.edge(branch_edge).dst;

            let arm_exit = |b: Block| -> Option<Block> {
                if !cfg.branch_edges(b).is_empty() {
                    return None;
                }
                cfg.goto_edge(b).map(|e| cfg.edge(e).dst)
            };
            let (Some(join_a), Some(join_b)) = (arm_exit(goto_target), arm_exit(branch_target))
            else {
                continue;
            };
            if join_a != join_b {
                continue;
            }
            let join = join_a;

            let singleton_const = |b: Block| -> Option<&Insn> {
                let mut insns = cfg.block_insns(b);
                let first = insns.next()?;
                if insns.next().is_some() || first.opcode() != Opcode::Const {
                    return None;
                }
                Some(first)
            };
            let (Some(goto_const), Some(branch_const)) =
                (singleton_const(goto_target), singleton_const(branch_target))
            else {
                continue;
            };
            let dest = goto_const.dest();
            if branch_const.dest() != dest {
                continue;
            }
            let (g, t) = (goto_const.literal(), branch_const.literal());
            if (g | t) != 1 || (g & t) != 0 {
                continue;
            }
            let branch_literal = t;

            let src = last.src(0);
            let last_uid = last.uid();
            let last_loc = cfg.find_insn(last_uid).unwrap();
            let kind = analyzer.classify(cfg, last_loc, src);
            let full_removal =
                cfg.pred_edges(goto_target).len() + cfg.pred_edges(branch_target).len() == 2;

            let mut replacement = Vec::new();
            match kind {
                SourceKind::Boolean => {
                    // `if-eqz` with 0 on the taken side reads the value
                    // straight through; the other pairings negate.
                    if (op == Opcode::IfEqz) == (branch_literal == 0) {
                        let mut mv = Insn::new(Opcode::Move);
                        mv.set_dest(dest).set_src(0, src);
                        replacement.push(mv);
                    } else {
                        let mut xor = Insn::new(Opcode::XorIntLit);
                        xor.set_dest(dest).set_src(0, src).set_literal(1);
                        replacement.push(xor);
                    }
                    self.stats.boolean_branches_removed += 1;
                }
                SourceKind::Object if full_removal => {
                    let mut iof = Insn::new(Opcode::InstanceOf);
                    iof.set_type(self.ctx.known().object).set_src(0, src);
                    replacement.push(iof);
                    let mut pseudo = Insn::new(Opcode::MoveResultPseudo);
                    pseudo.set_dest(dest);
                    replacement.push(pseudo);
                    if (op == Opcode::IfEqz) != (branch_literal == 0) {
                        let mut xor = Insn::new(Opcode::XorIntLit);
                        xor.set_dest(dest).set_src(0, dest).set_literal(1);
                        replacement.push(xor);
                    }
                    self.stats.object_branches_removed += 1;
                }
                _ => continue,
            }
            reductions.push(Reduction {
                branch: last_uid,
                block,
                replacement,
                goto_edge,
                join,
            });
        }
        if reductions.is_empty() {
            return false;
        }
        for r in reductions {
            trace!("folding boolean diamond in {}", r.block);
            let loc = cfg.find_insn(r.branch).expect("diamond branch vanished");
            for e in cfg.branch_edges(r.block) {
                cfg.remove_edge(e);
            }
            cfg.replace_insns(loc, r.replacement);
            cfg.set_edge_target(r.goto_edge, r.join);
        }
        cfg.simplify();
        true
    }

    fn reduce_xors(&mut self, cfg: &mut ControlFlowGraph) -> bool {
        struct Reduction {
            insn: InsnUid,
            /// Invert or demote the instruction; see `apply` below.
            odd: bool,
            temp: Reg,
        }
        let mut analyzer = Analyzer::new(self.ctx, self.is_static, self.args);
        let mut reductions: Vec<Reduction> = Vec::new();
        let mut inserts: Vec<(InsnUid, Insn)> = Vec::new();
        for loc in cfg.insn_locs() {
            let insn = cfg.insn_at(loc);
            let uid = insn.uid();
            let op = insn.opcode();
            let is_not = op == Opcode::XorIntLit && insn.literal() == 1;
            if op != Opcode::IfEqz && op != Opcode::IfNez && !is_not {
                continue;
            }
            let Some((root, negations)) = analyzer.boolean_root(cfg, loc) else {
                continue;
            };
            if negations == 0 {
                continue;
            }
            let root_src = cfg.insn_at(root).src(0);
            let root_uid = cfg.insn_at(root).uid();
            let temp = cfg.allocate_temp();
            let mut copy = Insn::new(Opcode::Move);
            copy.set_dest(temp).set_src(0, root_src);
            inserts.push((root_uid, copy));
            reductions.push(Reduction {
                insn: uid,
                odd: negations % 2 == 1,
                temp,
            });
            self.stats.xors_reduced += 1;
        }
        if reductions.is_empty() {
            return false;
        }
        let mut mutation = crate::cfg::CfgMutation::new();
        for (at, insn) in inserts {
            mutation.insert_before(at, vec![insn]);
        }
        mutation.flush(cfg);
        for r in reductions {
            let loc = cfg.find_insn(r.insn).expect("xor chain endpoint vanished");
            let op = cfg.insn_at(loc).opcode();
            if op == Opcode::XorIntLit {
                if r.odd {
                    // An odd chain ending in another negation is the root
                    // value itself.
                    let dest = cfg.insn_at(loc).dest();
                    let mut mv = Insn::new(Opcode::Move);
                    mv.set_dest(dest).set_src(0, r.temp);
                    cfg.replace_insns(loc, vec![mv]);
                } else {
                    cfg.insn_at_mut(loc).set_src(0, r.temp);
                }
            } else {
                let insn = cfg.insn_at_mut(loc);
                insn.set_src(0, r.temp);
                if r.odd {
                    let inverted = insn.opcode().invert_conditional_branch();
                    insn.set_opcode(inverted);
                }
            }
        }
        true
    }
}
