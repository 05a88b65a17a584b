//! Intraprocedural constant propagation.
//!
//! The per-register value is a sum of the signed-constant domain (numbers;
//! for references, the constant 0 is null), an object value carrying
//! nullness and singleton identity, and an abstract pointer to a tracked
//! local array. A configurable chain of sub-analyzers interprets each
//! instruction: they run in order and the first one that claims the
//! instruction terminates propagation for it. Conditional branches refine
//! the environment on their outgoing edges.

use rustc_hash::FxHashMap;

use crate::analysis::domains::{
    ConstantArrayDomain, ConstantHeap, HeapPointer, Nullness, ScdBinop, SignInterval,
    SignedConstantDomain, SingletonObjectDomain,
};
use crate::analysis::fixpoint::{AbstractDomain, FixpointAnalyzer, FixpointIterator};
use crate::cfg::{ControlFlowGraph, EdgeKind};
use crate::ir::entities::{Block, EdgeId, FieldId, MethodId, TypeId};
use crate::ir::insn::{Insn, Opcode, Reg, RESULT_REGISTER};
use crate::ir::{DexContext, Scope};
use crate::resolver::{self, FieldSearch, MethodSearch};

use SignedConstantDomain as Scd;

/// A reference value about which something is known.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ObjectValue {
    pub nullness: Nullness,
    pub singleton: SingletonObjectDomain,
}

impl ObjectValue {
    pub fn not_null() -> Self {
        Self {
            nullness: Nullness::NotNull,
            singleton: SingletonObjectDomain::Top,
        }
    }

    pub fn singleton(field: FieldId) -> Self {
        Self {
            nullness: Nullness::NotNull,
            singleton: SingletonObjectDomain::Value(field),
        }
    }
}

/// The value of one register.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ConstantValue {
    Bottom,
    Signed(SignedConstantDomain),
    Object(ObjectValue),
    /// A tracked local array; the pointer is the allocating instruction.
    Pointer(HeapPointer),
    Top,
}

impl ConstantValue {
    pub fn constant(self) -> Option<i64> {
        match self {
            ConstantValue::Signed(s) => s.constant(),
            _ => None,
        }
    }

    pub fn singleton(self) -> Option<FieldId> {
        match self {
            ConstantValue::Object(o) => match o.singleton {
                SingletonObjectDomain::Value(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn pointer(self) -> Option<HeapPointer> {
        match self {
            ConstantValue::Pointer(p) => Some(p),
            _ => None,
        }
    }

    fn normalized(self) -> Self {
        match self {
            ConstantValue::Signed(s) if s.is_bottom() => ConstantValue::Bottom,
            ConstantValue::Signed(s) if s.is_top() => ConstantValue::Top,
            ConstantValue::Object(o) if o.nullness == Nullness::Bottom => ConstantValue::Bottom,
            ConstantValue::Object(o)
                if o.nullness == Nullness::Top && o.singleton.is_top() =>
            {
                ConstantValue::Top
            }
            v => v,
        }
    }
}

impl AbstractDomain for ConstantValue {
    fn bottom() -> Self {
        ConstantValue::Bottom
    }

    fn top() -> Self {
        ConstantValue::Top
    }

    fn is_bottom(&self) -> bool {
        *self == ConstantValue::Bottom
    }

    fn is_top(&self) -> bool {
        *self == ConstantValue::Top
    }

    fn leq(&self, other: &Self) -> bool {
        use ConstantValue::*;
        match (*self, *other) {
            (Bottom, _) => true,
            (_, Top) => true,
            (_, Bottom) | (Top, _) => false,
            (Signed(a), Signed(b)) => a.leq(&b),
            (Object(a), Object(b)) => a.nullness.leq(&b.nullness) && a.singleton.leq(&b.singleton),
            // The null constant is a reference value of unknown identity.
            (Signed(Scd::Constant(0)), Object(o)) => {
                Nullness::IsNull.leq(&o.nullness) && o.singleton.is_top()
            }
            _ => false,
        }
    }

    fn join_with(&mut self, other: &Self) {
        use ConstantValue::*;
        let joined = match (*self, *other) {
            (Bottom, v) | (v, Bottom) => v,
            (Top, _) | (_, Top) => Top,
            (Signed(mut a), Signed(b)) => {
                a.join_with(&b);
                Signed(a)
            }
            (Object(mut a), Object(b)) => {
                a.nullness.join_with(&b.nullness);
                a.singleton.join_with(&b.singleton);
                Object(a)
            }
            (Signed(Scd::Constant(0)), Object(o)) | (Object(o), Signed(Scd::Constant(0))) => {
                let mut nullness = o.nullness;
                nullness.join_with(&Nullness::IsNull);
                Object(ObjectValue {
                    nullness,
                    singleton: SingletonObjectDomain::Top,
                })
            }
            _ => Top,
        };
        *self = joined.normalized();
    }

    fn meet_with(&mut self, other: &Self) {
        use ConstantValue::*;
        let met = match (*self, *other) {
            (Bottom, _) | (_, Bottom) => Bottom,
            (Top, v) | (v, Top) => v,
            (Signed(mut a), Signed(b)) => {
                a.meet_with(&b);
                Signed(a)
            }
            (Object(mut a), Object(b)) => {
                a.nullness.meet_with(&b.nullness);
                a.singleton.meet_with(&b.singleton);
                if a.singleton.is_bottom() {
                    Bottom
                } else {
                    Object(a)
                }
            }
            (Object(o), Signed(s)) | (Signed(s), Object(o)) => {
                // A comparison against zero narrows nullness; other
                // numeric constraints say nothing about a reference.
                if s == Scd::Constant(0) {
                    let mut nullness = o.nullness;
                    nullness.meet_with(&Nullness::IsNull);
                    if nullness == Nullness::Bottom || nullness == Nullness::Uninitialized {
                        Bottom
                    } else {
                        Object(ObjectValue {
                            nullness,
                            singleton: o.singleton,
                        })
                    }
                } else if !s.leq(&Scd::Interval(SignInterval::Nez)) {
                    Object(o)
                } else {
                    let mut nullness = o.nullness;
                    nullness.meet_with(&Nullness::NotNull);
                    if nullness == Nullness::Bottom || nullness == Nullness::Uninitialized {
                        Bottom
                    } else {
                        Object(ObjectValue {
                            nullness,
                            singleton: o.singleton,
                        })
                    }
                }
            }
            (Pointer(p), Pointer(q)) if p == q => Pointer(p),
            (Pointer(p), Signed(s)) | (Signed(s), Pointer(p)) => {
                // A fresh array is never null.
                if s == Scd::Constant(0) {
                    Bottom
                } else {
                    Pointer(p)
                }
            }
            _ => Bottom,
        };
        *self = met.normalized();
    }
}

/// The whole-method environment: registers, tracked fields, and the heap.
#[derive(Clone, Debug)]
pub struct ConstantEnvironment {
    regs: crate::analysis::domains::RegEnvironment<ConstantValue>,
    fields: FxHashMap<FieldId, ConstantValue>,
    heap: ConstantHeap,
}

impl ConstantEnvironment {
    pub fn get(&self, reg: Reg) -> ConstantValue {
        self.regs.get(reg)
    }

    pub fn set(&mut self, reg: Reg, value: ConstantValue) {
        self.regs.set(reg, value.normalized());
    }

    pub fn get_field(&self, field: FieldId) -> ConstantValue {
        self.fields
            .get(&field)
            .copied()
            .unwrap_or(ConstantValue::Top)
    }

    pub fn set_field(&mut self, field: FieldId, value: ConstantValue) {
        if value.is_top() {
            self.fields.remove(&field);
        } else {
            self.fields.insert(field, value);
        }
    }

    pub fn clear_field_environment(&mut self) {
        self.fields.clear();
    }

    pub fn heap(&self) -> &ConstantHeap {
        &self.heap
    }

    /// Bind a fresh tracked array to `reg`.
    pub fn new_heap_value(&mut self, reg: Reg, ptr: HeapPointer, array: ConstantArrayDomain) {
        self.heap.set(ptr, array);
        self.set(reg, ConstantValue::Pointer(ptr));
    }

    /// The array pointed to by `reg`, or top when untracked.
    pub fn get_pointee(&self, reg: Reg) -> ConstantArrayDomain {
        match self.get(reg).pointer() {
            Some(ptr) => self.heap.get(ptr),
            None => ConstantArrayDomain::Top,
        }
    }

    pub fn set_array_binding(&mut self, reg: Reg, index: i64, value: SignedConstantDomain) {
        if let Some(ptr) = self.get(reg).pointer() {
            let mut array = self.heap.get(ptr);
            array.set(index, value);
            self.heap.set(ptr, array);
        }
    }

    /// Widen the array pointed to by `reg` to top: it escaped.
    pub fn set_escaped(&mut self, reg: Reg) {
        if let Some(ptr) = self.get(reg).pointer() {
            self.heap.escape(ptr);
        }
    }

    pub fn set_to_bottom(&mut self) {
        self.regs.set_to_bottom();
        self.fields.clear();
    }
}

impl AbstractDomain for ConstantEnvironment {
    fn bottom() -> Self {
        Self {
            regs: crate::analysis::domains::RegEnvironment::bottom(),
            fields: FxHashMap::default(),
            heap: ConstantHeap::default(),
        }
    }

    fn top() -> Self {
        Self {
            regs: crate::analysis::domains::RegEnvironment::top(),
            fields: FxHashMap::default(),
            heap: ConstantHeap::default(),
        }
    }

    fn is_bottom(&self) -> bool {
        self.regs.is_bottom()
    }

    fn is_top(&self) -> bool {
        self.regs.is_top() && self.fields.is_empty()
    }

    fn leq(&self, other: &Self) -> bool {
        if self.is_bottom() {
            return true;
        }
        if other.is_bottom() {
            return false;
        }
        self.regs.leq(&other.regs)
            && other
                .fields
                .iter()
                .all(|(f, v)| self.get_field(*f).leq(v))
            && self.heap.leq(&other.heap)
    }

    fn join_with(&mut self, other: &Self) {
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = other.clone();
            return;
        }
        self.regs.join_with(&other.regs);
        self.fields.retain(|f, v| {
            match other.fields.get(f) {
                Some(ov) => {
                    v.join_with(ov);
                    !v.is_top()
                }
                None => false,
            }
        });
        self.heap.join_with(&other.heap);
    }

    fn meet_with(&mut self, other: &Self) {
        if self.is_bottom() {
            return;
        }
        if other.is_bottom() {
            self.set_to_bottom();
            return;
        }
        self.regs.meet_with(&other.regs);
        for (f, ov) in &other.fields {
            let mut v = self.get_field(*f);
            v.meet_with(ov);
            self.set_field(*f, v);
        }
    }
}

/// One member of the analyzer chain. Returns true iff it claimed the
/// instruction, terminating propagation for it.
pub trait SubAnalyzer: Sync {
    fn analyze(
        &self,
        ctx: &DexContext,
        scope: &Scope,
        insn: &Insn,
        env: &mut ConstantEnvironment,
    ) -> bool;
}

// ---------------------------------------------------------------- primitive

/// Constant loading, moves, move-results, compare folding and
/// literal-operand arithmetic; claims everything else with a default that
/// widens the written register.
pub struct PrimitiveAnalyzer;

impl PrimitiveAnalyzer {
    fn analyze_default(insn: &Insn, env: &mut ConstantEnvironment) -> bool {
        if insn.opcode().is_load_param() {
            return true;
        }
        if let Some(dest) = insn.dest_opt() {
            env.set(dest, ConstantValue::Top);
            if insn.opcode().dest_is_wide() {
                env.set(dest + 1, ConstantValue::Top);
            }
        } else if insn.opcode().has_move_result_any() {
            env.set(RESULT_REGISTER, ConstantValue::Top);
        }
        true
    }

    fn analyze_compare(insn: &Insn, env: &mut ConstantEnvironment) -> bool {
        let left = env.get(insn.src(0)).constant();
        let right = env.get(insn.src(1)).constant();
        let (Some(l), Some(r)) = (left, right) else {
            env.set(insn.dest(), ConstantValue::Top);
            return true;
        };
        let op = insn.opcode();
        let result = match op {
            Opcode::CmpLong => (l > r) as i64 - (l < r) as i64,
            Opcode::CmplFloat | Opcode::CmpgFloat => {
                let (lf, rf) = (f32::from_bits(l as u32), f32::from_bits(r as u32));
                if lf.is_nan() || rf.is_nan() {
                    // The l-biased compare answers -1 on NaN, the g-biased 1.
                    if op == Opcode::CmplFloat {
                        -1
                    } else {
                        1
                    }
                } else {
                    (lf > rf) as i64 - (lf < rf) as i64
                }
            }
            Opcode::CmplDouble | Opcode::CmpgDouble => {
                let (ld, rd) = (f64::from_bits(l as u64), f64::from_bits(r as u64));
                if ld.is_nan() || rd.is_nan() {
                    if op == Opcode::CmplDouble {
                        -1
                    } else {
                        1
                    }
                } else {
                    (ld > rd) as i64 - (ld < rd) as i64
                }
            }
            _ => unreachable!(),
        };
        env.set(insn.dest(), ConstantValue::Signed(Scd::Constant(result)));
        true
    }

    fn analyze_binop_lit(insn: &Insn, env: &mut ConstantEnvironment) -> bool {
        let op = match insn.opcode() {
            Opcode::AddIntLit => ScdBinop::Add,
            Opcode::RsubIntLit => ScdBinop::Rsub,
            Opcode::MulIntLit => ScdBinop::Mul,
            Opcode::DivIntLit => ScdBinop::Div,
            Opcode::RemIntLit => ScdBinop::Rem,
            Opcode::AndIntLit => ScdBinop::And,
            Opcode::OrIntLit => ScdBinop::Or,
            Opcode::XorIntLit => ScdBinop::Xor,
            Opcode::ShlIntLit => ScdBinop::Shl,
            Opcode::ShrIntLit => ScdBinop::Shr,
            Opcode::UshrIntLit => ScdBinop::Ushr,
            _ => unreachable!(),
        };
        let lhs = match env.get(insn.src(0)) {
            ConstantValue::Signed(s) => s,
            ConstantValue::Bottom => Scd::Bottom,
            _ => Scd::Top,
        };
        let result = Scd::apply_binop(op, lhs, Scd::Constant(insn.literal()), false);
        env.set(insn.dest(), ConstantValue::Signed(result));
        true
    }
}

impl SubAnalyzer for PrimitiveAnalyzer {
    fn analyze(
        &self,
        _ctx: &DexContext,
        _scope: &Scope,
        insn: &Insn,
        env: &mut ConstantEnvironment,
    ) -> bool {
        let op = insn.opcode();
        match op {
            Opcode::Const | Opcode::ConstWide => {
                env.set(
                    insn.dest(),
                    ConstantValue::Signed(Scd::Constant(insn.literal())),
                );
                true
            }
            // Freshly produced references are never null.
            Opcode::NewInstance
            | Opcode::NewArray
            | Opcode::FilledNewArray
            | Opcode::ConstString
            | Opcode::ConstClass => {
                env.set(
                    RESULT_REGISTER,
                    ConstantValue::Object(ObjectValue::not_null()),
                );
                true
            }
            _ if op.is_move() => {
                let v = env.get(insn.src(0));
                env.set(insn.dest(), v);
                true
            }
            _ if op.is_move_result_any() => {
                let v = env.get(RESULT_REGISTER);
                env.set(insn.dest(), v);
                true
            }
            _ if op.is_cmp() => Self::analyze_compare(insn, env),
            _ if op.is_binop_lit() => Self::analyze_binop_lit(insn, env),
            _ => Self::analyze_default(insn, env),
        }
    }
}

// ---------------------------------------------------------------- escapes

/// Widens the heap slot of any reference that escapes: stored into a
/// field, written through `aput-object`, or passed to a call.
pub struct HeapEscapeAnalyzer;

impl SubAnalyzer for HeapEscapeAnalyzer {
    fn analyze(
        &self,
        _ctx: &DexContext,
        _scope: &Scope,
        insn: &Insn,
        env: &mut ConstantEnvironment,
    ) -> bool {
        let op = insn.opcode();
        if op == Opcode::AputObject || op == Opcode::SputObject || op == Opcode::IputObject {
            env.set_escaped(insn.src(0));
        }
        if op.is_invoke() || op == Opcode::FilledNewArray {
            for i in 0..insn.srcs_size() {
                env.set_escaped(insn.src(i));
            }
        }
        false
    }
}

// ---------------------------------------------------------------- arrays

/// Tracks freshly allocated primitive arrays of known length and their
/// element values at known indices.
pub struct LocalArrayAnalyzer;

impl SubAnalyzer for LocalArrayAnalyzer {
    fn analyze(
        &self,
        _ctx: &DexContext,
        _scope: &Scope,
        insn: &Insn,
        env: &mut ConstantEnvironment,
    ) -> bool {
        let op = insn.opcode();
        match op {
            Opcode::NewArray => {
                let Some(length) = env.get(insn.src(0)).constant() else {
                    return false;
                };
                env.new_heap_value(
                    RESULT_REGISTER,
                    insn.uid(),
                    ConstantArrayDomain::new(length),
                );
                true
            }
            Opcode::FillArrayData => {
                // Not modeled; the array contents become unknown.
                env.set_escaped(insn.src(0));
                false
            }
            _ if op.is_aget() && op != Opcode::AgetObject => {
                let Some(index) = env.get(insn.src(1)).constant() else {
                    return false;
                };
                let array = env.get_pointee(insn.src(0));
                env.set(
                    RESULT_REGISTER,
                    ConstantValue::Signed(array.get(index)).normalized(),
                );
                true
            }
            _ if op.is_aput() && op != Opcode::AputObject => {
                match env.get(insn.src(2)).constant() {
                    Some(index) => {
                        let value = match env.get(insn.src(0)) {
                            ConstantValue::Signed(s) => s,
                            _ => Scd::Top,
                        };
                        env.set_array_binding(insn.src(1), index, value);
                        true
                    }
                    None => {
                        // A write at an unknown index poisons the whole
                        // tracked array.
                        env.set_escaped(insn.src(1));
                        false
                    }
                }
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------- clinit

/// Used only when analyzing a class initializer: static fields of the
/// class being initialized are tracked in the environment.
pub struct ClinitFieldAnalyzer {
    pub class_under_init: TypeId,
}

impl SubAnalyzer for ClinitFieldAnalyzer {
    fn analyze(
        &self,
        ctx: &DexContext,
        scope: &Scope,
        insn: &Insn,
        env: &mut ConstantEnvironment,
    ) -> bool {
        let op = insn.opcode();
        if op.is_sget() {
            let Some(field) = resolver::resolve_field(ctx, scope, insn.field_ref(), FieldSearch::Static)
            else {
                return false;
            };
            if ctx.field(field).class == self.class_under_init {
                let v = env.get_field(field);
                env.set(RESULT_REGISTER, v);
                return true;
            }
        } else if op.is_sput() {
            let Some(field) = resolver::resolve_field(ctx, scope, insn.field_ref(), FieldSearch::Static)
            else {
                return false;
            };
            if ctx.field(field).class == self.class_under_init {
                let v = env.get(insn.src(0));
                env.set_field(field, v);
                return true;
            }
        } else if op == Opcode::InvokeStatic {
            // A static call back into the class under initialization can
            // write any of its static fields.
            if ctx.method(insn.method_ref()).class == self.class_under_init {
                env.clear_field_environment();
            }
        }
        false
    }
}

/// Analogous to [`ClinitFieldAnalyzer`] for instance constructors:
/// instance fields of the object under construction are tracked.
pub struct InitFieldAnalyzer {
    pub class_under_init: TypeId,
}

impl SubAnalyzer for InitFieldAnalyzer {
    fn analyze(
        &self,
        ctx: &DexContext,
        scope: &Scope,
        insn: &Insn,
        env: &mut ConstantEnvironment,
    ) -> bool {
        let op = insn.opcode();
        if op.is_iget() {
            let Some(field) =
                resolver::resolve_field(ctx, scope, insn.field_ref(), FieldSearch::Instance)
            else {
                return false;
            };
            if ctx.field(field).class == self.class_under_init {
                let v = env.get_field(field);
                env.set(RESULT_REGISTER, v);
                return true;
            }
        } else if op.is_iput() {
            let Some(field) =
                resolver::resolve_field(ctx, scope, insn.field_ref(), FieldSearch::Instance)
            else {
                return false;
            };
            if ctx.field(field).class == self.class_under_init {
                let v = env.get(insn.src(0));
                env.set_field(field, v);
                return true;
            }
        }
        false
    }
}

// ---------------------------------------------------------------- enums

/// Recognizes reads of enum constants as singleton objects and folds
/// `Enum.equals` over them.
pub struct EnumFieldAnalyzer;

impl SubAnalyzer for EnumFieldAnalyzer {
    fn analyze(
        &self,
        ctx: &DexContext,
        scope: &Scope,
        insn: &Insn,
        env: &mut ConstantEnvironment,
    ) -> bool {
        let op = insn.opcode();
        if op == Opcode::SgetObject {
            let Some(field) = resolver::resolve_field(ctx, scope, insn.field_ref(), FieldSearch::Static)
            else {
                return false;
            };
            let data = ctx.field(field);
            let Some(cls) = scope.class(data.class) else {
                return false;
            };
            let Some(def) = cls.sfields().iter().find(|f| f.field() == field) else {
                return false;
            };
            if !def.access().is_enum() {
                return false;
            }
            // Each enum constant is a unique object held in a static final
            // field of the enum class.
            env.set(RESULT_REGISTER, ConstantValue::Object(ObjectValue::singleton(field)));
            return true;
        }
        if op == Opcode::InvokeVirtual {
            let Some(method) =
                resolver::resolve_method(ctx, scope, insn.method_ref(), MethodSearch::Virtual)
            else {
                return false;
            };
            if method != ctx.known().enum_equals {
                return false;
            }
            let (Some(left), Some(right)) = (
                env.get(insn.src(0)).singleton(),
                env.get(insn.src(1)).singleton(),
            ) else {
                return false;
            };
            env.set(
                RESULT_REGISTER,
                ConstantValue::Signed(Scd::Constant((left == right) as i64)),
            );
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------- booleans

/// Recognizes `Boolean.TRUE`/`Boolean.FALSE` as singletons and folds
/// `Boolean.valueOf` / `booleanValue` through them.
pub struct BoxedBooleanAnalyzer;

impl SubAnalyzer for BoxedBooleanAnalyzer {
    fn analyze(
        &self,
        ctx: &DexContext,
        _scope: &Scope,
        insn: &Insn,
        env: &mut ConstantEnvironment,
    ) -> bool {
        let op = insn.opcode();
        let known = ctx.known();
        if op == Opcode::SgetObject {
            let field = insn.field_ref();
            if field != known.boolean_true && field != known.boolean_false {
                return false;
            }
            env.set(RESULT_REGISTER, ConstantValue::Object(ObjectValue::singleton(field)));
            return true;
        }
        if op.is_invoke() {
            let method = insn.method_ref();
            if method == known.boolean_valueof {
                let Some(c) = env.get(insn.src(0)).constant() else {
                    return false;
                };
                let field = if c == 0 {
                    known.boolean_false
                } else {
                    known.boolean_true
                };
                env.set(RESULT_REGISTER, ConstantValue::Object(ObjectValue::singleton(field)));
                return true;
            }
            if method == known.boolean_booleanvalue {
                let Some(f) = env.get(insn.src(0)).singleton() else {
                    return false;
                };
                if f == known.boolean_false {
                    env.set(RESULT_REGISTER, ConstantValue::Signed(Scd::Constant(0)));
                    return true;
                }
                if f == known.boolean_true {
                    env.set(RESULT_REGISTER, ConstantValue::Signed(Scd::Constant(1)));
                    return true;
                }
                return false;
            }
        }
        false
    }
}

// ---------------------------------------------------------------- driver

/// The intraprocedural constant propagation analysis: an analyzer chain
/// run to a fixpoint with branch-edge refinement.
pub struct ConstantPropagation<'a> {
    ctx: &'a DexContext,
    scope: &'a Scope,
    analyzers: Vec<Box<dyn SubAnalyzer + 'a>>,
}

impl<'a> ConstantPropagation<'a> {
    /// The default chain: enum and boxed-boolean singletons, local arrays,
    /// escapes, then the primitive analyzer, which claims everything left.
    pub fn new(ctx: &'a DexContext, scope: &'a Scope) -> Self {
        Self::with_analyzers(
            ctx,
            scope,
            vec![
                Box::new(EnumFieldAnalyzer),
                Box::new(BoxedBooleanAnalyzer),
                Box::new(LocalArrayAnalyzer),
                Box::new(HeapEscapeAnalyzer),
                Box::new(PrimitiveAnalyzer),
            ],
        )
    }

    /// The chain for a specific method. Class initializers additionally
    /// track the static fields of their class, instance constructors the
    /// instance fields of `this`; everything else gets the default chain.
    pub fn for_method(ctx: &'a DexContext, scope: &'a Scope, method: MethodId) -> Self {
        let data = ctx.method(method);
        let name = ctx.string(data.name);
        let chain = Self::new(ctx, scope);
        match &*name {
            "<clinit>" => chain.prepend(Box::new(ClinitFieldAnalyzer {
                class_under_init: data.class,
            })),
            "<init>" => chain.prepend(Box::new(InitFieldAnalyzer {
                class_under_init: data.class,
            })),
            _ => chain,
        }
    }

    /// A minimal chain folding only primitive constants.
    pub fn primitive_only(ctx: &'a DexContext, scope: &'a Scope) -> Self {
        Self::with_analyzers(ctx, scope, vec![Box::new(PrimitiveAnalyzer)])
    }

    pub fn with_analyzers(
        ctx: &'a DexContext,
        scope: &'a Scope,
        analyzers: Vec<Box<dyn SubAnalyzer + 'a>>,
    ) -> Self {
        Self {
            ctx,
            scope,
            analyzers,
        }
    }

    /// Prepend an analyzer, giving it the first claim.
    pub fn prepend(mut self, analyzer: Box<dyn SubAnalyzer + 'a>) -> Self {
        self.analyzers.insert(0, analyzer);
        self
    }

    pub fn analyze_insn(&self, insn: &Insn, env: &mut ConstantEnvironment) {
        if env.is_bottom() {
            return;
        }
        for analyzer in &self.analyzers {
            if analyzer.analyze(self.ctx, self.scope, insn, env) {
                return;
            }
        }
    }

    pub fn run(&self, cfg: &ControlFlowGraph) -> FixpointIterator<Self> {
        FixpointIterator::run(cfg, self, ConstantEnvironment::top())
    }
}

impl FixpointAnalyzer for ConstantPropagation<'_> {
    type Domain = ConstantEnvironment;

    fn analyze_block(&self, cfg: &ControlFlowGraph, block: Block, state: &mut ConstantEnvironment) {
        for insn in cfg.block_insns(block) {
            self.analyze_insn(insn, state);
        }
    }

    fn analyze_edge(
        &self,
        cfg: &ControlFlowGraph,
        edge: EdgeId,
        exit_state_at_source: &ConstantEnvironment,
    ) -> ConstantEnvironment {
        let mut env = exit_state_at_source.clone();
        let e = cfg.edge(edge);
        let Some(last) = cfg.last_insn(e.src) else {
            return env;
        };
        let op = last.opcode();
        if op.is_conditional_branch() {
            let is_taken = e.kind.is_branch();
            analyze_if(last, &mut env, is_taken);
        } else if op == Opcode::Switch {
            if let EdgeKind::Branch {
                case_key: Some(key),
            } = e.kind
            {
                let mut v = env.get(last.src(0));
                v.meet_with(&ConstantValue::Signed(Scd::Constant(key)));
                if v.is_bottom() {
                    env.set_to_bottom();
                } else {
                    env.set(last.src(0), v);
                }
            }
        }
        env
    }
}

/// Narrow the environment along one side of a conditional. When the
/// refined value is bottom the whole state goes to bottom, marking the
/// successor unreachable.
fn analyze_if(insn: &Insn, env: &mut ConstantEnvironment, is_taken: bool) {
    if env.is_bottom() {
        return;
    }
    // Inverting the untaken side means only the "taken" sense of each
    // opcode needs handling.
    let op = if is_taken {
        insn.opcode()
    } else {
        insn.opcode().invert_conditional_branch()
    };
    let left = env.get(insn.src(0));
    let right = if insn.srcs_size() > 1 {
        env.get(insn.src(1))
    } else {
        ConstantValue::Signed(Scd::Constant(0))
    };

    let meet_both = |env: &mut ConstantEnvironment, left: ConstantValue, right: ConstantValue| {
        let mut refined = left;
        refined.meet_with(&right);
        if refined.is_bottom() {
            env.set_to_bottom();
            return;
        }
        env.set(insn.src(0), refined);
        if insn.srcs_size() > 1 {
            env.set(insn.src(1), refined);
        }
    };
    let meet_interval = |env: &mut ConstantEnvironment, left: ConstantValue, i: SignInterval| {
        let mut refined = left;
        refined.meet_with(&ConstantValue::Signed(Scd::Interval(i)));
        if refined.is_bottom() {
            env.set_to_bottom();
        } else {
            env.set(insn.src(0), refined);
        }
    };

    match op {
        Opcode::IfEq | Opcode::IfEqz => meet_both(env, left, right),
        Opcode::IfNe | Opcode::IfNez => {
            if runtime_equals(left, right) {
                env.set_to_bottom();
            } else if op == Opcode::IfNez {
                meet_interval(env, left, SignInterval::Nez);
            }
        }
        Opcode::IfLt => {
            if runtime_leq(right, left) {
                env.set_to_bottom();
            }
        }
        Opcode::IfGt => {
            if runtime_leq(left, right) {
                env.set_to_bottom();
            }
        }
        Opcode::IfGe => {
            if runtime_lt(left, right) {
                env.set_to_bottom();
            }
        }
        Opcode::IfLe => {
            if runtime_lt(right, left) {
                env.set_to_bottom();
            }
        }
        Opcode::IfLtz => meet_interval(env, left, SignInterval::Ltz),
        Opcode::IfGtz => meet_interval(env, left, SignInterval::Gtz),
        Opcode::IfGez => meet_interval(env, left, SignInterval::Gez),
        Opcode::IfLez => meet_interval(env, left, SignInterval::Lez),
        _ => panic!("analyze_if: expected a conditional branch, got {op:?}"),
    }
}

fn runtime_equals(left: ConstantValue, right: ConstantValue) -> bool {
    match (left.constant(), right.constant()) {
        (Some(a), Some(b)) => a == b,
        _ => match (left.singleton(), right.singleton()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn runtime_leq(left: ConstantValue, right: ConstantValue) -> bool {
    match (left.constant(), right.constant()) {
        (Some(a), Some(b)) => a <= b,
        _ => false,
    }
}

fn runtime_lt(left: ConstantValue, right: ConstantValue) -> bool {
    match (left.constant(), right.constant()) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::testutil::*;

    #[test]
    fn branch_edges_refine_intervals() {
        let ctx = DexContext::new();
        let scope = Scope::new();

        // if-gtz v0: the taken side knows v0 > 0, the fallthrough v0 <= 0.
        let mut b = CodeBuilder::new(1);
        let taken = b.fresh_label();
        b.push(load_param(0));
        b.branch(if_insn(Opcode::IfGtz, &[0]), taken);
        b.push(return_void());
        b.label(taken);
        b.push(return_void());
        let mut code = b.build();

        code.build_cfg();
        let cfg = code.cfg();
        let analysis = ConstantPropagation::primitive_only(&ctx, &scope);
        let fixpoint = analysis.run(cfg);

        let branch_block = cfg
            .blocks()
            .into_iter()
            .find(|&bb| cfg.last_insn(bb).map(|i| i.opcode()) == Some(Opcode::IfGtz))
            .unwrap();
        let branch_edge = cfg.branch_edges(branch_block)[0];
        let goto_edge = cfg.goto_edge(branch_block).unwrap();
        let exit = fixpoint.exit_state_at(branch_block);

        let taken_env = analysis.analyze_edge(cfg, branch_edge, &exit);
        assert_eq!(
            taken_env.get(0),
            ConstantValue::Signed(Scd::Interval(SignInterval::Gtz))
        );
        let fall_env = analysis.analyze_edge(cfg, goto_edge, &exit);
        assert_eq!(
            fall_env.get(0),
            ConstantValue::Signed(Scd::Interval(SignInterval::Lez))
        );
        code.clear_cfg(None);
    }

    #[test]
    fn decided_branch_bottoms_the_dead_edge() {
        let ctx = DexContext::new();
        let scope = Scope::new();

        let mut b = CodeBuilder::new(1);
        let taken = b.fresh_label();
        b.push(const_insn(0, 5));
        b.branch(if_insn(Opcode::IfLez, &[0]), taken);
        b.push(return_void());
        b.label(taken);
        b.push(return_void());
        let mut code = b.build();

        code.build_cfg();
        let cfg = code.cfg();
        let analysis = ConstantPropagation::primitive_only(&ctx, &scope);
        let fixpoint = analysis.run(cfg);

        let branch_block = cfg
            .blocks()
            .into_iter()
            .find(|&bb| cfg.last_insn(bb).map(|i| i.opcode()) == Some(Opcode::IfLez))
            .unwrap();
        let branch_edge = cfg.branch_edges(branch_block)[0];
        let exit = fixpoint.exit_state_at(branch_block);
        let taken_env = analysis.analyze_edge(cfg, branch_edge, &exit);
        assert!(taken_env.is_bottom());
        code.clear_cfg(None);
    }

    #[test]
    fn clinit_chain_tracks_static_fields_of_the_class() {
        use crate::ir::{AccessFlags, DexClass, FieldDef};

        let ctx = DexContext::new();
        let mut scope = Scope::new();
        let c_ty = ctx.get_or_make_type("Lcom/example/C;");
        let field = ctx.make_field("Lcom/example/C;", "F", "I");
        let mut cls = DexClass::new(c_ty, Some(ctx.known().object), AccessFlags::PUBLIC);
        cls.add_field(FieldDef::new(
            field,
            AccessFlags::PRIVATE | AccessFlags::STATIC,
        ));
        scope.add_class(cls);
        let clinit = ctx.make_method("Lcom/example/C;", "<clinit>", &[], "V");

        // F = 7; v1 = F; return v1
        let mut b = CodeBuilder::new(2);
        b.push(const_insn(0, 7));
        b.push(sput(field, 0));
        b.push(sget(field));
        b.push(move_result_pseudo(1));
        b.push(return_value(1));
        let mut code = b.build();

        code.build_cfg();
        let analysis = ConstantPropagation::for_method(&ctx, &scope, clinit);
        let fixpoint = analysis.run(code.cfg());
        let block = code.cfg().blocks().pop().unwrap();
        assert_eq!(fixpoint.exit_state_at(block).get(1).constant(), Some(7));

        // Without the initializer context the read stays unknown.
        let plain = ConstantPropagation::new(&ctx, &scope);
        let fixpoint = plain.run(code.cfg());
        assert_eq!(fixpoint.exit_state_at(block).get(1).constant(), None);
        code.clear_cfg(None);
    }

    #[test]
    fn clinit_chain_widens_fields_on_reentrant_static_calls() {
        use crate::ir::{AccessFlags, DexClass, FieldDef, MethodDef};

        let ctx = DexContext::new();
        let mut scope = Scope::new();
        let c_ty = ctx.get_or_make_type("Lcom/example/C;");
        let field = ctx.make_field("Lcom/example/C;", "F", "I");
        let helper = ctx.make_method("Lcom/example/C;", "helper", &[], "V");
        let mut cls = DexClass::new(c_ty, Some(ctx.known().object), AccessFlags::PUBLIC);
        cls.add_field(FieldDef::new(
            field,
            AccessFlags::PRIVATE | AccessFlags::STATIC,
        ));
        cls.add_method(
            &ctx,
            MethodDef::new(helper, AccessFlags::PRIVATE | AccessFlags::STATIC),
        );
        scope.add_class(cls);
        let clinit = ctx.make_method("Lcom/example/C;", "<clinit>", &[], "V");

        // F = 7; C.helper() may write F; v1 = F is unknown again.
        let mut b = CodeBuilder::new(2);
        b.push(const_insn(0, 7));
        b.push(sput(field, 0));
        b.push(invoke_static(helper, &[]));
        b.push(sget(field));
        b.push(move_result_pseudo(1));
        b.push(return_value(1));
        let mut code = b.build();

        code.build_cfg();
        let analysis = ConstantPropagation::for_method(&ctx, &scope, clinit);
        let fixpoint = analysis.run(code.cfg());
        let block = code.cfg().blocks().pop().unwrap();
        assert_eq!(fixpoint.exit_state_at(block).get(1).constant(), None);
        code.clear_cfg(None);
    }

    #[test]
    fn init_chain_tracks_instance_fields_of_this() {
        use crate::ir::{AccessFlags, DexClass, FieldDef};

        let ctx = DexContext::new();
        let mut scope = Scope::new();
        let d_ty = ctx.get_or_make_type("Lcom/example/D;");
        let field = ctx.make_field("Lcom/example/D;", "g", "I");
        let mut cls = DexClass::new(d_ty, Some(ctx.known().object), AccessFlags::PUBLIC);
        cls.add_field(FieldDef::new(field, AccessFlags::PRIVATE));
        scope.add_class(cls);
        let init = ctx.make_method("Lcom/example/D;", "<init>", &[], "V");

        // this.g = 5; v2 = this.g; return v2
        let mut b = CodeBuilder::new(3);
        b.push(load_param_object(0));
        b.push(const_insn(1, 5));
        b.push(iput(field, 1, 0));
        b.push(iget(field, 0));
        b.push(move_result_pseudo(2));
        b.push(return_value(2));
        let mut code = b.build();

        code.build_cfg();
        let analysis = ConstantPropagation::for_method(&ctx, &scope, init);
        let fixpoint = analysis.run(code.cfg());
        let block = code.cfg().blocks().pop().unwrap();
        assert_eq!(fixpoint.exit_state_at(block).get(2).constant(), Some(5));
        code.clear_cfg(None);
    }

    #[test]
    fn local_arrays_fold_known_elements() {
        let ctx = DexContext::new();
        let scope = Scope::new();
        let int_array = ctx.get_or_make_type("[I");

        // a = new int[2]; a[0] = 7; v = a[0]; also a[1] reads as 0.
        let mut b = CodeBuilder::new(6);
        b.push(const_insn(0, 2)); // length
        b.push(const_insn(1, 0)); // index 0
        b.push(const_insn(2, 7)); // value
        b.push(new_array(0, int_array));
        b.push(move_result_pseudo_object(3));
        b.push(aput(2, 3, 1));
        b.push(aget(3, 1));
        b.push(move_result_pseudo(4));
        b.push(return_value(4));
        let mut code = b.build();

        code.build_cfg();
        let analysis = ConstantPropagation::new(&ctx, &scope);
        let fixpoint = analysis.run(code.cfg());
        let block = *code.cfg().blocks().first().unwrap();
        let exit = fixpoint.exit_state_at(block);
        assert_eq!(exit.get(4).constant(), Some(7));
        code.clear_cfg(None);
    }
}
