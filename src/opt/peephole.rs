//! Peephole rewriting.
//!
//! A static catalog of rules, each a (pattern, replacement, optional
//! predicate) triple. Patterns are sequences of abstract instruction
//! matchers constrained with symbolic registers, strings, literals, types
//! and fields; a symbol binds on first sight and requires equality after.
//! Matching never crosses a block boundary. Replacements substitute the
//! bound symbols and evaluate compile-time directives (string
//! concatenation, lengths, log2 of a power-of-two literal).
//!
//! On a failure at the second position of a pattern, matching retries the
//! same instruction from the start; any other failure just moves on. The
//! sweep trades a bounded number of missed matches for a single linear
//! scan per rule.

use log::trace;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::ir::entities::{FieldId, MethodId, StringId, TypeId};
use crate::ir::insn::{Insn, Opcode, Reg};
use crate::ir::{DexContext, IrCode, Scope};
use crate::resolver::{self, FieldSearch};

/// A symbolic register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RegSym {
    A,
    B,
    C,
    D,
    E,
}

/// A symbolic string, or a replacement directive producing one.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum StrSym {
    A,
    B,
    /// Matches only the empty string.
    Empty,
    /// Directives: render the bound literal A as a string.
    BooleanAToString,
    CharAToString,
    IntAToString,
    /// Directive: concatenate strings A and B.
    ConcatAB,
    /// Directives: concatenate string A with a rendered literal A.
    ConcatStringAIntA,
    ConcatStringACharA,
    ConcatStringABooleanA,
    /// Directive: the simple name of type A.
    TypeAGetSimpleName,
}

/// A symbolic literal, or a replacement directive producing one.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum LitSym {
    A,
    /// Directive: 1 iff strings A and B are the same interned handle.
    CompareStringsAB,
    /// Directive: the UTF-16 length of string A.
    LengthStringA,
    /// Binds any literal; the replacement emits its log2. Guarded by a
    /// power-of-two predicate.
    MulDivToShiftLog2,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum TypeSym {
    A,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum FieldSym {
    A,
}

/// The payload constraint of one pattern element.
#[derive(Clone, Debug)]
pub enum PatKind {
    None,
    /// An exact interned method reference.
    Method(MethodId),
    String(StrSym),
    Literal(LitSym),
    Type(TypeSym),
    Field(FieldSym),
    /// Replacement only: re-emit a copy of the n-th matched instruction.
    Copy(usize),
}

/// One abstract instruction matcher / replacement template.
#[derive(Clone, Debug)]
pub struct PatInsn {
    pub opcodes: SmallVec<[Opcode; 4]>,
    pub srcs: SmallVec<[RegSym; 3]>,
    pub dest: Option<RegSym>,
    pub kind: PatKind,
}

impl PatInsn {
    fn new(opcodes: &[Opcode], srcs: &[RegSym], dest: Option<RegSym>, kind: PatKind) -> Self {
        Self {
            opcodes: SmallVec::from_slice(opcodes),
            srcs: SmallVec::from_slice(srcs),
            dest,
            kind,
        }
    }

    fn copy_matched(index: usize) -> Self {
        Self {
            opcodes: SmallVec::new(),
            srcs: SmallVec::new(),
            dest: None,
            kind: PatKind::Copy(index),
        }
    }
}

/// Context handed to rule predicates.
pub struct PredicateContext<'a> {
    pub ctx: &'a DexContext,
    pub scope: &'a Scope,
}

type Predicate = fn(&Matcher<'_>, &PredicateContext<'_>) -> bool;

/// A rewrite rule.
pub struct Pattern {
    pub name: &'static str,
    pub match_: Vec<PatInsn>,
    pub replace: Vec<PatInsn>,
    pub predicate: Option<Predicate>,
}

impl Pattern {
    fn new(name: &'static str, match_: Vec<PatInsn>, replace: Vec<PatInsn>) -> Self {
        Self {
            name,
            match_,
            replace,
            predicate: None,
        }
    }

    fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

/// Matching state for one pattern.
pub struct Matcher<'p> {
    pattern: &'p Pattern,
    match_index: usize,
    matched: Vec<Insn>,
    regs: FxHashMap<RegSym, Reg>,
    strings: FxHashMap<StrSym, StringId>,
    literals: FxHashMap<LitSym, i64>,
    types: FxHashMap<TypeSym, TypeId>,
    fields: FxHashMap<FieldSym, FieldId>,
}

impl<'p> Matcher<'p> {
    fn new(pattern: &'p Pattern) -> Self {
        Self {
            pattern,
            match_index: 0,
            matched: Vec::new(),
            regs: FxHashMap::default(),
            strings: FxHashMap::default(),
            literals: FxHashMap::default(),
            types: FxHashMap::default(),
            fields: FxHashMap::default(),
        }
    }

    fn reset(&mut self) {
        self.match_index = 0;
        self.matched.clear();
        self.regs.clear();
        self.strings.clear();
        self.literals.clear();
        self.types.clear();
        self.fields.clear();
    }

    pub fn matched_literal(&self, sym: LitSym) -> Option<i64> {
        self.literals.get(&sym).copied()
    }

    /// Feed one instruction; returns true when the whole pattern has
    /// matched (and the predicate, if any, accepted).
    fn try_match(&mut self, pctx: &PredicateContext<'_>, insn: &Insn) -> bool {
        if !self.match_one(pctx.ctx, self.match_index, insn) {
            // The sweep heuristic: only a failure at the second element
            // retries the current instruction against the first.
            let retry = self.match_index == 1;
            self.reset();
            if !(retry && self.match_one(pctx.ctx, 0, insn)) {
                self.reset();
                return false;
            }
        }
        self.matched.push(insn.duplicate());
        self.match_index += 1;
        let done = self.match_index == self.pattern.match_.len();
        if done {
            if let Some(pred) = self.pattern.predicate {
                if !pred(self, pctx) {
                    self.reset();
                    return false;
                }
            }
        }
        done
    }

    fn match_one(&mut self, ctx: &DexContext, index: usize, insn: &Insn) -> bool {
        let pat = &self.pattern.match_[index];
        if !pat.opcodes.contains(&insn.opcode()) {
            return false;
        }
        if pat.srcs.len() != insn.srcs_size() || pat.dest.is_some() != insn.has_dest() {
            return false;
        }
        if let Some(dest_sym) = pat.dest {
            if !bind(&mut self.regs, dest_sym, insn.dest()) {
                return false;
            }
        }
        for (i, &sym) in pat.srcs.iter().enumerate() {
            if !bind(&mut self.regs, sym, insn.src(i)) {
                return false;
            }
        }
        match &pat.kind {
            PatKind::None => true,
            PatKind::Method(m) => insn.method_ref() == *m,
            PatKind::String(StrSym::Empty) => ctx.string(insn.string()).is_empty(),
            PatKind::String(sym) => bind(&mut self.strings, *sym, insn.string()),
            PatKind::Literal(sym) => bind(&mut self.literals, *sym, insn.literal()),
            PatKind::Type(sym) => bind(&mut self.types, *sym, insn.type_ref()),
            PatKind::Field(sym) => bind(&mut self.fields, *sym, insn.field_ref()),
            PatKind::Copy(_) => panic!("Copy is a replacement-only kind"),
        }
    }

    /// Materialize the replacement sequence for a completed match.
    fn replacements(&self, ctx: &DexContext) -> Vec<Insn> {
        assert_eq!(self.match_index, self.pattern.match_.len());
        let mut out = Vec::with_capacity(self.pattern.replace.len());
        for template in &self.pattern.replace {
            if let PatKind::Copy(index) = template.kind {
                out.push(self.matched[index].duplicate());
                continue;
            }
            assert_eq!(template.opcodes.len(), 1, "replacement needs a unique opcode");
            let mut insn = Insn::new(template.opcodes[0]);
            if let Some(dest_sym) = template.dest {
                insn.set_dest(self.regs[&dest_sym]);
            }
            for (i, sym) in template.srcs.iter().enumerate() {
                insn.set_src(i, self.regs[sym]);
            }
            match &template.kind {
                PatKind::None => {}
                PatKind::Method(m) => {
                    insn.set_method(*m);
                }
                PatKind::String(sym) => {
                    let s = self.render_string(ctx, *sym);
                    insn.set_string(s);
                }
                PatKind::Literal(sym) => {
                    let value = self.render_literal(ctx, *sym);
                    insn.set_literal(value);
                }
                PatKind::Type(sym) => {
                    insn.set_type(self.types[sym]);
                }
                PatKind::Field(sym) => {
                    insn.set_field(self.fields[sym]);
                }
                PatKind::Copy(_) => unreachable!(),
            }
            out.push(insn);
        }
        out
    }

    fn render_string(&self, ctx: &DexContext, sym: StrSym) -> StringId {
        match sym {
            StrSym::A => self.strings[&StrSym::A],
            StrSym::B => self.strings[&StrSym::B],
            StrSym::Empty => ctx.get_or_make_string(""),
            StrSym::BooleanAToString => {
                let b = self.literals[&LitSym::A] != 0;
                ctx.get_or_make_string(if b { "true" } else { "false" })
            }
            StrSym::CharAToString => {
                let c = char::from_u32(self.literals[&LitSym::A] as u32).unwrap_or('\u{fffd}');
                ctx.get_or_make_string(&c.to_string())
            }
            StrSym::IntAToString => {
                ctx.get_or_make_string(&(self.literals[&LitSym::A] as i32).to_string())
            }
            StrSym::ConcatAB => {
                let a = ctx.string(self.strings[&StrSym::A]);
                let b = ctx.string(self.strings[&StrSym::B]);
                ctx.get_or_make_string(&format!("{a}{b}"))
            }
            StrSym::ConcatStringAIntA => {
                let a = ctx.string(self.strings[&StrSym::A]);
                let i = self.literals[&LitSym::A] as i32;
                ctx.get_or_make_string(&format!("{a}{i}"))
            }
            StrSym::ConcatStringACharA => {
                let a = ctx.string(self.strings[&StrSym::A]);
                let c = char::from_u32(self.literals[&LitSym::A] as u32).unwrap_or('\u{fffd}');
                ctx.get_or_make_string(&format!("{a}{c}"))
            }
            StrSym::ConcatStringABooleanA => {
                let a = ctx.string(self.strings[&StrSym::A]);
                let b = self.literals[&LitSym::A] != 0;
                ctx.get_or_make_string(&format!("{a}{b}"))
            }
            StrSym::TypeAGetSimpleName => {
                let desc = ctx.type_descriptor(self.types[&TypeSym::A]);
                ctx.get_or_make_string(simple_name(&desc))
            }
        }
    }

    fn render_literal(&self, ctx: &DexContext, sym: LitSym) -> i64 {
        match sym {
            LitSym::A => self.literals[&LitSym::A],
            LitSym::CompareStringsAB => {
                (self.strings[&StrSym::A] == self.strings[&StrSym::B]) as i64
            }
            LitSym::LengthStringA => {
                let s = ctx.string(self.strings[&StrSym::A]);
                s.encode_utf16().count() as i64
            }
            LitSym::MulDivToShiftLog2 => {
                let lit = self.literals[&LitSym::MulDivToShiftLog2];
                debug_assert!(lit > 0 && (lit & (lit - 1)) == 0);
                lit.trailing_zeros() as i64
            }
        }
    }
}

fn bind<K: std::hash::Hash + Eq, V: PartialEq + Copy>(
    map: &mut FxHashMap<K, V>,
    sym: K,
    value: V,
) -> bool {
    match map.get(&sym) {
        Some(&bound) => bound == value,
        None => {
            map.insert(sym, value);
            true
        }
    }
}

/// `Lcom/foo/Bar;` -> `Bar`.
fn simple_name(descriptor: &str) -> &str {
    let body = descriptor
        .strip_prefix('L')
        .and_then(|s| s.strip_suffix(';'))
        .unwrap_or(descriptor);
    body.rsplit('/').next().unwrap_or(body)
}

// ---------------------------------------------------------------- catalog

use PatKind as K;
use RegSym::{A, B, C, D};

fn const_string(sym: StrSym) -> PatInsn {
    PatInsn::new(&[Opcode::ConstString], &[], None, K::String(sym))
}

fn move_result_pseudo_object(dest: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::MoveResultPseudoObject], &[], Some(dest), K::None)
}

fn move_result_pseudo(dest: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::MoveResultPseudo], &[], Some(dest), K::None)
}

fn move_result_object(dest: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::MoveResultObject], &[], Some(dest), K::None)
}

fn move_result(dest: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::MoveResult], &[], Some(dest), K::None)
}

fn move_object(dest: RegSym, src: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::MoveObject], &[src], Some(dest), K::None)
}

fn move_plain(dest: RegSym, src: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::Move], &[src], Some(dest), K::None)
}

fn const_literal(dest: RegSym, sym: LitSym) -> PatInsn {
    PatInsn::new(&[Opcode::Const], &[], Some(dest), K::Literal(sym))
}

fn invoke_direct1(method: MethodId, this: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::InvokeDirect], &[this], None, K::Method(method))
}

fn invoke_direct2(method: MethodId, this: RegSym, arg: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::InvokeDirect], &[this, arg], None, K::Method(method))
}

fn invoke_virtual1(method: MethodId, this: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::InvokeVirtual], &[this], None, K::Method(method))
}

fn invoke_virtual2(method: MethodId, this: RegSym, arg: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::InvokeVirtual], &[this, arg], None, K::Method(method))
}

fn invoke_static1(method: MethodId, arg: RegSym) -> PatInsn {
    PatInsn::new(&[Opcode::InvokeStatic], &[arg], None, K::Method(method))
}

fn string_patterns(ctx: &DexContext) -> Vec<Pattern> {
    let known = ctx.known();
    vec![
        // new StringBuilder().append("...") => new StringBuilder("...")
        Pattern::new(
            "Coalesce_InitVoid_AppendString",
            vec![
                invoke_direct1(known.sb_init, A),
                const_string(StrSym::A),
                move_result_pseudo_object(B),
                invoke_virtual2(known.sb_append_string, A, B),
                move_result_object(A),
            ],
            vec![
                const_string(StrSym::A),
                move_result_pseudo_object(B),
                invoke_direct2(known.sb_init_string, A, B),
            ],
        ),
        // sb.append("A").append("B") => sb.append("AB")
        Pattern::new(
            "Coalesce_AppendString_AppendString",
            vec![
                const_string(StrSym::A),
                move_result_pseudo_object(B),
                invoke_virtual2(known.sb_append_string, A, B),
                move_result_object(C),
                const_string(StrSym::B),
                move_result_pseudo_object(D),
                invoke_virtual2(known.sb_append_string, C, D),
                move_result_object(RegSym::E),
            ],
            vec![
                const_string(StrSym::ConcatAB),
                move_result_pseudo_object(B),
                invoke_virtual2(known.sb_append_string, A, B),
                const_string(StrSym::A), // maybe dead
                move_result_pseudo_object(B),
                move_object(C, A), // maybe dead
                const_string(StrSym::B), // maybe dead
                move_result_pseudo_object(D),
                move_object(RegSym::E, C), // maybe dead
            ],
        ),
        Pattern::new(
            "Coalesce_AppendString_AppendString_WithoutMoveResult",
            vec![
                const_string(StrSym::A),
                move_result_pseudo_object(B),
                invoke_virtual2(known.sb_append_string, A, B),
                move_result_object(C),
                const_string(StrSym::B),
                move_result_pseudo_object(D),
                invoke_virtual2(known.sb_append_string, C, D),
            ],
            vec![
                const_string(StrSym::ConcatAB),
                move_result_pseudo_object(B),
                invoke_virtual2(known.sb_append_string, A, B),
                const_string(StrSym::A), // maybe dead
                move_result_pseudo_object(B),
                move_object(C, A), // maybe dead
                const_string(StrSym::B), // maybe dead
                move_result_pseudo_object(D),
            ],
        ),
        // "hello".length() => 5
        Pattern::new(
            "CompileTime_StringLength",
            vec![
                const_string(StrSym::A),
                move_result_pseudo_object(A),
                invoke_virtual1(known.string_length, A),
                move_result(B),
            ],
            vec![
                const_string(StrSym::A), // maybe dead
                move_result_pseudo_object(A),
                const_literal(B, LitSym::LengthStringA),
            ],
        ),
        // sb.append("") => sb
        Pattern::new(
            "Remove_AppendEmptyString",
            vec![
                const_string(StrSym::Empty),
                move_result_pseudo_object(B),
                invoke_virtual2(known.sb_append_string, A, B),
                move_result_object(C),
            ],
            vec![
                const_string(StrSym::Empty), // maybe dead
                move_result_pseudo_object(B),
                move_object(C, A),
            ],
        ),
        Pattern::new(
            "Remove_AppendEmptyString_WithoutMoveResult",
            vec![
                const_string(StrSym::Empty),
                move_result_pseudo_object(B),
                invoke_virtual2(known.sb_append_string, A, B),
            ],
            vec![
                const_string(StrSym::Empty), // maybe dead
                move_result_pseudo_object(B),
            ],
        ),
        // "a".equals("b") => false
        Pattern::new(
            "CompileTime_StringCompare",
            vec![
                const_string(StrSym::A),
                move_result_pseudo_object(A),
                const_string(StrSym::B),
                move_result_pseudo_object(B),
                invoke_virtual2(known.string_equals, A, B),
                move_result(C),
            ],
            vec![
                const_string(StrSym::A), // maybe dead
                move_result_pseudo_object(A),
                const_string(StrSym::B), // maybe dead
                move_result_pseudo_object(B),
                const_literal(C, LitSym::CompareStringsAB),
            ],
        ),
        // String.valueOf(true) => "true"
        Pattern::new(
            "Replace_ValueOfBoolean",
            vec![
                const_literal(A, LitSym::A),
                invoke_static1(known.string_valueof_boolean, A),
                move_result_object(B),
            ],
            vec![
                const_literal(A, LitSym::A), // maybe dead
                const_string(StrSym::BooleanAToString),
                move_result_pseudo_object(B),
            ],
        ),
        Pattern::new(
            "Replace_ValueOfChar",
            vec![
                const_literal(A, LitSym::A),
                invoke_static1(known.string_valueof_char, A),
                move_result_object(B),
            ],
            vec![
                const_literal(A, LitSym::A), // maybe dead
                const_string(StrSym::CharAToString),
                move_result_pseudo_object(B),
            ],
        ),
        Pattern::new(
            "Replace_ValueOfInt",
            vec![
                const_literal(A, LitSym::A),
                invoke_static1(known.string_valueof_int, A),
                move_result_object(B),
            ],
            vec![
                const_literal(A, LitSym::A), // maybe dead
                const_string(StrSym::IntAToString),
                move_result_pseudo_object(B),
            ],
        ),
    ]
}

fn func_patterns(ctx: &DexContext) -> Vec<Pattern> {
    let known = ctx.known();
    vec![
        // Foo.class.getSimpleName() => "Foo"
        Pattern::new(
            "Remove_LangClass_GetSimpleName",
            vec![
                PatInsn::new(&[Opcode::ConstClass], &[], None, K::Type(TypeSym::A)),
                move_result_pseudo_object(A),
                PatInsn::new(
                    &[
                        Opcode::InvokeVirtual,
                        Opcode::InvokeSuper,
                        Opcode::InvokeDirect,
                        Opcode::InvokeStatic,
                        Opcode::InvokeInterface,
                    ],
                    &[A],
                    None,
                    K::Method(known.class_get_simple_name),
                ),
                move_result_object(B),
            ],
            vec![
                PatInsn::copy_matched(0), // const-class, maybe dead
                move_result_pseudo_object(A),
                const_string(StrSym::TypeAGetSimpleName),
                move_result_pseudo_object(B),
            ],
        ),
    ]
}

fn power_of_two_literal(matcher: &Matcher<'_>, _pctx: &PredicateContext<'_>) -> bool {
    match matcher.matched_literal(LitSym::MulDivToShiftLog2) {
        Some(lit) => lit > 0 && (lit & (lit - 1)) == 0,
        None => false,
    }
}

fn arith_patterns(_ctx: &DexContext) -> Vec<Pattern> {
    vec![
        // x + 0 => x
        Pattern::new(
            "Arith_AddLit_0",
            vec![PatInsn::new(
                &[Opcode::AddIntLit],
                &[A],
                Some(B),
                K::Literal(LitSym::A),
            )],
            vec![move_plain(B, A)],
        )
        .with_predicate(|m, _| m.matched_literal(LitSym::A) == Some(0)),
        // x * 1 => x
        Pattern::new(
            "Arith_MulLit_1",
            vec![PatInsn::new(
                &[Opcode::MulIntLit],
                &[A],
                Some(B),
                K::Literal(LitSym::A),
            )],
            vec![move_plain(B, A)],
        )
        .with_predicate(|m, _| m.matched_literal(LitSym::A) == Some(1)),
        // x * -1 => -x
        Pattern::new(
            "Arith_MulLit_Neg1",
            vec![PatInsn::new(
                &[Opcode::MulIntLit],
                &[A],
                Some(B),
                K::Literal(LitSym::A),
            )],
            vec![PatInsn::new(&[Opcode::NegInt], &[A], Some(B), K::None)],
        )
        .with_predicate(|m, _| m.matched_literal(LitSym::A) == Some(-1)),
        // x * 2^n => x << n
        Pattern::new(
            "Arith_MulLit_Power2",
            vec![PatInsn::new(
                &[Opcode::MulIntLit],
                &[A],
                Some(B),
                K::Literal(LitSym::MulDivToShiftLog2),
            )],
            vec![PatInsn::new(
                &[Opcode::ShlIntLit],
                &[A],
                Some(B),
                K::Literal(LitSym::MulDivToShiftLog2),
            )],
        )
        .with_predicate(power_of_two_literal),
        // x / 2^n => x >> n
        Pattern::new(
            "Arith_DivLit_Power2",
            vec![PatInsn::new(
                &[Opcode::DivIntLit],
                &[A],
                Some(B),
                K::Literal(LitSym::MulDivToShiftLog2),
            )],
            vec![PatInsn::new(
                &[Opcode::ShrIntLit],
                &[A],
                Some(B),
                K::Literal(LitSym::MulDivToShiftLog2),
            )],
        )
        .with_predicate(power_of_two_literal),
    ]
}

fn nop_patterns(_ctx: &DexContext) -> Vec<Pattern> {
    vec![
        Pattern::new(
            "Remove_Nop",
            vec![PatInsn::new(&[Opcode::Nop], &[], None, K::None)],
            vec![],
        ),
        // move vA, vA
        Pattern::new(
            "Remove_SelfMove",
            vec![PatInsn::new(&[Opcode::Move], &[A], Some(A), K::None)],
            vec![],
        ),
        Pattern::new(
            "Remove_SelfMoveObject",
            vec![PatInsn::new(&[Opcode::MoveObject], &[A], Some(A), K::None)],
            vec![],
        ),
    ]
}

fn field_not_volatile(matcher: &Matcher<'_>, pctx: &PredicateContext<'_>) -> bool {
    let Some(&fref) = matcher.fields.get(&FieldSym::A) else {
        return false;
    };
    let Some(field) = resolver::resolve_field(pctx.ctx, pctx.scope, fref, FieldSearch::Any)
    else {
        return false;
    };
    let data = pctx.ctx.field(field);
    let Some(cls) = pctx.scope.class(data.class) else {
        return false;
    };
    match cls.all_fields().find(|f| f.field() == field) {
        Some(def) => !def.access().is_volatile(),
        None => false,
    }
}

fn putget_patterns(_ctx: &DexContext) -> Vec<Pattern> {
    const NARROW_IPUT: &[Opcode] = &[
        Opcode::Iput,
        Opcode::IputBoolean,
        Opcode::IputByte,
        Opcode::IputChar,
        Opcode::IputShort,
    ];
    const NARROW_IGET: &[Opcode] = &[
        Opcode::Iget,
        Opcode::IgetBoolean,
        Opcode::IgetByte,
        Opcode::IgetChar,
        Opcode::IgetShort,
    ];
    const NARROW_SPUT: &[Opcode] = &[
        Opcode::Sput,
        Opcode::SputBoolean,
        Opcode::SputByte,
        Opcode::SputChar,
        Opcode::SputShort,
    ];
    const NARROW_SGET: &[Opcode] = &[
        Opcode::Sget,
        Opcode::SgetBoolean,
        Opcode::SgetByte,
        Opcode::SgetChar,
        Opcode::SgetShort,
    ];
    const NARROW_APUT: &[Opcode] = &[
        Opcode::Aput,
        Opcode::AputBoolean,
        Opcode::AputByte,
        Opcode::AputChar,
        Opcode::AputShort,
    ];
    const NARROW_AGET: &[Opcode] = &[
        Opcode::Aget,
        Opcode::AgetBoolean,
        Opcode::AgetByte,
        Opcode::AgetChar,
        Opcode::AgetShort,
    ];
    vec![
        // iput v; iget into w  =>  iput v; move w, v
        Pattern::new(
            "Replace_PutGet",
            vec![
                PatInsn::new(NARROW_IPUT, &[A, B], None, K::Field(FieldSym::A)),
                PatInsn::new(NARROW_IGET, &[B], None, K::Field(FieldSym::A)),
                move_result_pseudo(C),
            ],
            vec![PatInsn::copy_matched(0), move_plain(C, A)],
        )
        .with_predicate(field_not_volatile),
        Pattern::new(
            "Replace_PutGet_Object",
            vec![
                PatInsn::new(&[Opcode::IputObject], &[A, B], None, K::Field(FieldSym::A)),
                PatInsn::new(&[Opcode::IgetObject], &[B], None, K::Field(FieldSym::A)),
                move_result_pseudo_object(C),
            ],
            vec![PatInsn::copy_matched(0), move_object(C, A)],
        )
        .with_predicate(field_not_volatile),
        Pattern::new(
            "Replace_StaticPutGet",
            vec![
                PatInsn::new(NARROW_SPUT, &[A], None, K::Field(FieldSym::A)),
                PatInsn::new(NARROW_SGET, &[], None, K::Field(FieldSym::A)),
                move_result_pseudo(B),
            ],
            vec![PatInsn::copy_matched(0), move_plain(B, A)],
        )
        .with_predicate(field_not_volatile),
        Pattern::new(
            "Replace_StaticPutGet_Object",
            vec![
                PatInsn::new(&[Opcode::SputObject], &[A], None, K::Field(FieldSym::A)),
                PatInsn::new(&[Opcode::SgetObject], &[], None, K::Field(FieldSym::A)),
                move_result_pseudo_object(B),
            ],
            vec![PatInsn::copy_matched(0), move_object(B, A)],
        )
        .with_predicate(field_not_volatile),
        // aput v, arr, idx; aget arr, idx  =>  aput; move w, v
        Pattern::new(
            "Replace_AputAget",
            vec![
                PatInsn::new(NARROW_APUT, &[A, B, C], None, K::None),
                PatInsn::new(NARROW_AGET, &[B, C], None, K::None),
                move_result_pseudo(D),
            ],
            vec![PatInsn::copy_matched(0), move_plain(D, A)],
        ),
    ]
}

fn all_patterns(ctx: &DexContext) -> Vec<Pattern> {
    let mut all = string_patterns(ctx);
    all.extend(arith_patterns(ctx));
    all.extend(func_patterns(ctx));
    all.extend(nop_patterns(ctx));
    all.extend(putget_patterns(ctx));
    all
}

// ---------------------------------------------------------------- driver

#[derive(Clone, Default, Debug)]
pub struct Stats {
    pub matches: usize,
    pub instructions_removed: usize,
    pub instructions_inserted: usize,
    /// Match count per rule name.
    pub per_rule: FxHashMap<&'static str, usize>,
}

impl Stats {
    pub fn merge(&mut self, other: Stats) {
        self.matches += other.matches;
        self.instructions_removed += other.instructions_removed;
        self.instructions_inserted += other.instructions_inserted;
        for (name, n) in other.per_rule {
            *self.per_rule.entry(name).or_default() += n;
        }
    }
}

/// The peephole rewriter: the catalog instantiated against a context.
pub struct PeepholeOptimizer<'a> {
    ctx: &'a DexContext,
    scope: &'a Scope,
    patterns: Vec<Pattern>,
}

impl<'a> PeepholeOptimizer<'a> {
    pub fn new(ctx: &'a DexContext, scope: &'a Scope) -> Self {
        Self::with_disabled(ctx, scope, &[])
    }

    /// Instantiate the catalog, skipping rules named in `disabled`.
    pub fn with_disabled(ctx: &'a DexContext, scope: &'a Scope, disabled: &[&str]) -> Self {
        let patterns = all_patterns(ctx)
            .into_iter()
            .filter(|p| !disabled.contains(&p.name))
            .collect();
        Self {
            ctx,
            scope,
            patterns,
        }
    }

    /// Apply every rule to the method body, one rule at a time so rules
    /// can match the same shapes without interfering.
    pub fn run(&self, code: &mut IrCode) -> Stats {
        code.build_cfg();
        let stats = self.run_on_cfg(code);
        code.clear_cfg(None);
        stats
    }

    fn run_on_cfg(&self, code: &mut IrCode) -> Stats {
        let pctx = PredicateContext {
            ctx: self.ctx,
            scope: self.scope,
        };
        let mut stats = Stats::default();
        for pattern in &self.patterns {
            let cfg = code.cfg_mut();
            // (block, matched item indices, replacement)
            let mut edits: Vec<(crate::ir::Block, Vec<usize>, Vec<Insn>)> = Vec::new();
            for block in cfg.blocks() {
                // Patterns do not span blocks: reset at each boundary.
                let mut matcher = Matcher::new(pattern);
                let mut indices: Vec<usize> = Vec::new();
                for (index, item) in cfg.block_items(block).iter().enumerate() {
                    let Some(insn) = item.insn() else { continue };
                    let done = matcher.try_match(&pctx, insn);
                    // Keep the matched-window indices in sync with the
                    // matcher, including the retry-at-second path, where
                    // the current instruction restarts the window.
                    match matcher.match_index {
                        0 => indices.clear(),
                        1 => {
                            indices.clear();
                            indices.push(index);
                        }
                        _ => indices.push(index),
                    }
                    if done {
                        trace!("peephole rule {} matched", pattern.name);
                        let replacement = matcher.replacements(self.ctx);
                        edits.push((block, std::mem::take(&mut indices), replacement));
                        matcher.reset();
                    }
                }
            }
            for (block, indices, replacement) in edits.into_iter().rev() {
                stats.matches += 1;
                *stats.per_rule.entry(pattern.name).or_default() += 1;
                stats.instructions_removed += indices.len();
                stats.instructions_inserted += replacement.len();
                cfg.splice_items(block, &indices, replacement);
            }
        }
        stats
    }
}

impl crate::cfg::ControlFlowGraph {
    /// Remove the items at `indices` (ascending) and insert `replacement`
    /// at the position of the first removed item.
    pub(crate) fn splice_items(
        &mut self,
        block: crate::ir::Block,
        indices: &[usize],
        replacement: Vec<Insn>,
    ) {
        debug_assert!(indices.windows(2).all(|w| w[0] < w[1]));
        let first = indices[0];
        for &index in indices.iter().rev() {
            self.blocks[block].items.remove(index);
        }
        let items = &mut self.blocks[block].items;
        items.splice(
            first..first,
            replacement.into_iter().map(crate::cfg::BlockItem::Insn),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::{self, opcodes_of, CodeBuilder};

    fn run_peephole(ctx: &DexContext, code: &mut IrCode) -> Stats {
        let scope = Scope::new();
        PeepholeOptimizer::new(ctx, &scope).run(code)
    }

    #[test]
    fn removes_empty_append() {
        let ctx = DexContext::new();
        let known = ctx.known();
        let empty = ctx.get_or_make_string("");

        // v0 = new StringBuilder(); v1 = ""; v0.append(v1); return v0
        let mut b = CodeBuilder::new(3);
        b.push(testutil::new_instance(known.string_builder));
        b.push(testutil::move_result_pseudo_object(0));
        b.push(testutil::invoke_direct(known.sb_init, &[0]));
        b.push(testutil::const_string(empty));
        b.push(testutil::move_result_pseudo_object(1));
        b.push(testutil::invoke_virtual(known.sb_append_string, &[0, 1]));
        b.push(testutil::move_result_object(2));
        b.push(testutil::return_object(2));
        let mut code = b.build();

        let stats = run_peephole(&ctx, &mut code);
        assert_eq!(stats.per_rule.get("Remove_AppendEmptyString"), Some(&1));
        // The append invoke is gone; the builder flows through a move.
        let ops = opcodes_of(&code);
        assert!(!ops.contains(&Opcode::InvokeVirtual));
        assert!(ops.contains(&Opcode::MoveObject));
    }

    #[test]
    fn folds_string_length() {
        let ctx = DexContext::new();
        let hello = ctx.get_or_make_string("hello");

        let mut b = CodeBuilder::new(2);
        b.push(testutil::const_string(hello));
        b.push(testutil::move_result_pseudo_object(0));
        b.push(testutil::invoke_virtual(ctx.known().string_length, &[0]));
        b.push(testutil::move_result(1));
        b.push(testutil::return_value(1));
        let mut code = b.build();

        run_peephole(&ctx, &mut code);
        let folded = code
            .insns()
            .find(|i| i.opcode() == Opcode::Const)
            .expect("length folded to a constant");
        assert_eq!(folded.literal(), 5);
        assert_eq!(folded.dest(), 1);
    }

    #[test]
    fn folds_string_equals_on_interned_handles() {
        let ctx = DexContext::new();
        let foo = ctx.get_or_make_string("foo");
        let bar = ctx.get_or_make_string("bar");

        let mut b = CodeBuilder::new(3);
        b.push(testutil::const_string(foo));
        b.push(testutil::move_result_pseudo_object(0));
        b.push(testutil::const_string(bar));
        b.push(testutil::move_result_pseudo_object(1));
        b.push(testutil::invoke_virtual(ctx.known().string_equals, &[0, 1]));
        b.push(testutil::move_result(2));
        b.push(testutil::return_value(2));
        let mut code = b.build();

        run_peephole(&ctx, &mut code);
        let folded = code
            .insns()
            .find(|i| i.opcode() == Opcode::Const && i.dest_opt() == Some(2))
            .expect("comparison folded");
        assert_eq!(folded.literal(), 0);
    }

    #[test]
    fn strength_reduces_multiplication() {
        let ctx = DexContext::new();

        let mut b = CodeBuilder::new(2);
        b.push(testutil::load_param(0));
        b.push(testutil::binop_lit(Opcode::MulIntLit, 1, 0, 8));
        b.push(testutil::return_value(1));
        let mut code = b.build();

        let stats = run_peephole(&ctx, &mut code);
        assert_eq!(stats.per_rule.get("Arith_MulLit_Power2"), Some(&1));
        let shifted = code
            .insns()
            .find(|i| i.opcode() == Opcode::ShlIntLit)
            .expect("mul became shl");
        assert_eq!(shifted.literal(), 3);
    }

    #[test]
    fn mul_by_three_is_left_alone() {
        let ctx = DexContext::new();

        let mut b = CodeBuilder::new(2);
        b.push(testutil::load_param(0));
        b.push(testutil::binop_lit(Opcode::MulIntLit, 1, 0, 3));
        b.push(testutil::return_value(1));
        let mut code = b.build();

        let stats = run_peephole(&ctx, &mut code);
        assert_eq!(stats.matches, 0);
    }

    #[test]
    fn removes_self_move_and_nop() {
        let ctx = DexContext::new();

        let mut b = CodeBuilder::new(1);
        b.push(testutil::load_param(0));
        b.push(crate::ir::Insn::new(Opcode::Nop));
        b.push(testutil::move_insn(0, 0));
        b.push(testutil::return_value(0));
        let mut code = b.build();

        run_peephole(&ctx, &mut code);
        assert_eq!(
            opcodes_of(&code),
            vec![Opcode::LoadParam, Opcode::Return]
        );
    }

    #[test]
    fn forwards_aput_aget() {
        let ctx = DexContext::new();
        let int_array = ctx.get_or_make_type("[I");

        // arr[idx] = v; w = arr[idx]
        let mut b = CodeBuilder::new(5);
        b.push(testutil::load_param(0)); // value
        b.push(testutil::load_param(1)); // index
        b.push(testutil::const_insn(2, 4));
        b.push(testutil::new_array(2, int_array));
        b.push(testutil::move_result_pseudo_object(3));
        b.push(testutil::aput(0, 3, 1));
        b.push(testutil::aget(3, 1));
        b.push(testutil::move_result_pseudo(4));
        b.push(testutil::return_value(4));
        let mut code = b.build();

        let stats = run_peephole(&ctx, &mut code);
        assert_eq!(stats.per_rule.get("Replace_AputAget"), Some(&1));
        let ops = opcodes_of(&code);
        assert_eq!(ops.iter().filter(|&&op| op == Opcode::Aget).count(), 0);
        assert!(ops.contains(&Opcode::Move));
    }

    #[test]
    fn forwards_iput_iget_on_non_volatile_fields() {
        use crate::ir::{AccessFlags, DexClass, FieldDef};

        let ctx = DexContext::new();
        let mut scope = Scope::new();
        let holder = ctx.get_or_make_type("Lcom/example/Holder;");
        let field = ctx.make_field("Lcom/example/Holder;", "value", "I");
        let volatile_field = ctx.make_field("Lcom/example/Holder;", "vvalue", "I");
        let mut cls = DexClass::new(holder, Some(ctx.known().object), AccessFlags::PUBLIC);
        cls.add_field(FieldDef::new(field, AccessFlags::PUBLIC));
        cls.add_field(FieldDef::new(
            volatile_field,
            AccessFlags::PUBLIC | AccessFlags::VOLATILE,
        ));
        scope.add_class(cls);

        let build = |f| {
            let mut b = CodeBuilder::new(3);
            b.push(testutil::load_param(0)); // value
            b.push(testutil::load_param_object(1)); // holder
            b.push(testutil::iput(f, 0, 1));
            b.push(testutil::iget(f, 1));
            b.push(testutil::move_result_pseudo(2));
            b.push(testutil::return_value(2));
            b.build()
        };

        let opt = PeepholeOptimizer::new(&ctx, &scope);
        let mut code = build(field);
        let stats = opt.run(&mut code);
        assert_eq!(stats.per_rule.get("Replace_PutGet"), Some(&1));
        let ops = opcodes_of(&code);
        assert!(!ops.contains(&Opcode::Iget));
        assert!(ops.contains(&Opcode::Move));

        // Volatile fields keep the reload.
        let mut volatile_code = build(volatile_field);
        let stats = opt.run(&mut volatile_code);
        assert_eq!(stats.matches, 0);
        assert!(opcodes_of(&volatile_code).contains(&Opcode::Iget));
    }

    #[test]
    fn peephole_reaches_a_fixed_point() {
        let ctx = DexContext::new();

        let mut b = CodeBuilder::new(2);
        b.push(testutil::load_param(0));
        b.push(testutil::binop_lit(Opcode::MulIntLit, 1, 0, 4));
        b.push(testutil::return_value(1));
        let mut code = b.build();

        let scope = Scope::new();
        let opt = PeepholeOptimizer::new(&ctx, &scope);
        let mut rounds = 0;
        loop {
            let stats = opt.run(&mut code);
            rounds += 1;
            if stats.matches == 0 {
                break;
            }
            assert!(rounds < 10, "peephole did not reach a fixed point");
        }
        assert!(opcodes_of(&code).contains(&Opcode::ShlIntLit));
    }
}
