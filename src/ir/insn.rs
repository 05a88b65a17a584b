//! IR instructions.
//!
//! An instruction is an opcode, an ordered list of source registers, an
//! optional destination register and at most one payload (literal, string,
//! type, field reference or method reference). The opcode fixes which
//! payload kind and destination shape are legal; the fluent setters assert
//! this at construction time.
//!
//! Instructions that produce a value through the implicit result register
//! (invokes, filled-new-array, and the "type-tested loads": field/array
//! gets, const-string/class, check-cast, instance-of, array-length,
//! new-instance, new-array) have no destination of their own; the following
//! `MoveResult*` or `MoveResultPseudo*` instruction names the register.

use std::sync::atomic::{AtomicU32, Ordering};

use smallvec::SmallVec;

use crate::ir::entities::{FieldId, InsnUid, MethodId, StringId, TypeId};

/// A virtual register index. Wide values occupy `(r, r + 1)`.
pub type Reg = u32;

/// The implicit result pseudo-register used by the analyses.
pub const RESULT_REGISTER: Reg = Reg::MAX;

static NEXT_UID: AtomicU32 = AtomicU32::new(0);

fn fresh_uid() -> InsnUid {
    InsnUid::from_u32(NEXT_UID.fetch_add(1, Ordering::Relaxed))
}

/// The opcode set.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[allow(missing_docs)]
pub enum Opcode {
    Nop,

    // Parameter-binding pseudo-instructions at method entry.
    LoadParam,
    LoadParamObject,
    LoadParamWide,

    Const,
    ConstWide,
    ConstString,
    ConstClass,

    Move,
    MoveObject,
    MoveWide,
    MoveResult,
    MoveResultObject,
    MoveResultWide,
    MoveResultPseudo,
    MoveResultPseudoObject,
    MoveResultPseudoWide,
    MoveException,

    ReturnVoid,
    Return,
    ReturnObject,
    ReturnWide,

    MonitorEnter,
    MonitorExit,

    CheckCast,
    InstanceOf,
    ArrayLength,

    NewInstance,
    NewArray,
    FilledNewArray,
    FillArrayData,

    Throw,
    Goto,
    Switch,
    Unreachable,

    IfEq,
    IfNe,
    IfLt,
    IfGe,
    IfGt,
    IfLe,
    IfEqz,
    IfNez,
    IfLtz,
    IfGez,
    IfGtz,
    IfLez,

    CmplFloat,
    CmpgFloat,
    CmplDouble,
    CmpgDouble,
    CmpLong,

    Aget,
    AgetWide,
    AgetObject,
    AgetBoolean,
    AgetByte,
    AgetChar,
    AgetShort,
    Aput,
    AputWide,
    AputObject,
    AputBoolean,
    AputByte,
    AputChar,
    AputShort,

    Iget,
    IgetWide,
    IgetObject,
    IgetBoolean,
    IgetByte,
    IgetChar,
    IgetShort,
    Iput,
    IputWide,
    IputObject,
    IputBoolean,
    IputByte,
    IputChar,
    IputShort,

    Sget,
    SgetWide,
    SgetObject,
    SgetBoolean,
    SgetByte,
    SgetChar,
    SgetShort,
    Sput,
    SputWide,
    SputObject,
    SputBoolean,
    SputByte,
    SputChar,
    SputShort,

    InvokeVirtual,
    InvokeSuper,
    InvokeDirect,
    InvokeStatic,
    InvokeInterface,

    NegInt,
    NotInt,
    NegLong,
    NotLong,
    NegFloat,
    NegDouble,

    AddInt,
    SubInt,
    MulInt,
    DivInt,
    RemInt,
    AndInt,
    OrInt,
    XorInt,
    ShlInt,
    ShrInt,
    UshrInt,

    AddLong,
    SubLong,
    MulLong,
    DivLong,
    RemLong,
    AndLong,
    OrLong,
    XorLong,
    ShlLong,
    ShrLong,
    UshrLong,

    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    RemFloat,

    AddDouble,
    SubDouble,
    MulDouble,
    DivDouble,
    RemDouble,

    // Literal-operand integer arithmetic. `RsubIntLit` computes
    // `literal - src`.
    AddIntLit,
    RsubIntLit,
    MulIntLit,
    DivIntLit,
    RemIntLit,
    AndIntLit,
    OrIntLit,
    XorIntLit,
    ShlIntLit,
    ShrIntLit,
    UshrIntLit,
}

/// Which payload kind an opcode carries.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PayloadKind {
    None,
    Literal,
    String,
    Type,
    Field,
    Method,
}

impl Opcode {
    pub fn is_load_param(self) -> bool {
        matches!(
            self,
            Opcode::LoadParam | Opcode::LoadParamObject | Opcode::LoadParamWide
        )
    }

    pub fn is_const(self) -> bool {
        matches!(
            self,
            Opcode::Const | Opcode::ConstWide | Opcode::ConstString | Opcode::ConstClass
        )
    }

    pub fn is_move(self) -> bool {
        matches!(self, Opcode::Move | Opcode::MoveObject | Opcode::MoveWide)
    }

    pub fn is_move_result(self) -> bool {
        matches!(
            self,
            Opcode::MoveResult | Opcode::MoveResultObject | Opcode::MoveResultWide
        )
    }

    pub fn is_move_result_pseudo(self) -> bool {
        matches!(
            self,
            Opcode::MoveResultPseudo
                | Opcode::MoveResultPseudoObject
                | Opcode::MoveResultPseudoWide
        )
    }

    pub fn is_move_result_any(self) -> bool {
        self.is_move_result() || self.is_move_result_pseudo()
    }

    pub fn is_return(self) -> bool {
        matches!(
            self,
            Opcode::ReturnVoid | Opcode::Return | Opcode::ReturnObject | Opcode::ReturnWide
        )
    }

    pub fn is_invoke(self) -> bool {
        matches!(
            self,
            Opcode::InvokeVirtual
                | Opcode::InvokeSuper
                | Opcode::InvokeDirect
                | Opcode::InvokeStatic
                | Opcode::InvokeInterface
        )
    }

    pub fn is_conditional_branch(self) -> bool {
        matches!(
            self,
            Opcode::IfEq
                | Opcode::IfNe
                | Opcode::IfLt
                | Opcode::IfGe
                | Opcode::IfGt
                | Opcode::IfLe
                | Opcode::IfEqz
                | Opcode::IfNez
                | Opcode::IfLtz
                | Opcode::IfGez
                | Opcode::IfGtz
                | Opcode::IfLez
        )
    }

    /// Conditional tests against zero (one source register).
    pub fn is_zero_test(self) -> bool {
        matches!(
            self,
            Opcode::IfEqz
                | Opcode::IfNez
                | Opcode::IfLtz
                | Opcode::IfGez
                | Opcode::IfGtz
                | Opcode::IfLez
        )
    }

    pub fn is_branch(self) -> bool {
        self.is_conditional_branch() || matches!(self, Opcode::Goto | Opcode::Switch)
    }

    /// Ends a block unconditionally: control never falls through.
    pub fn is_terminator(self) -> bool {
        self.is_return()
            || matches!(
                self,
                Opcode::Throw | Opcode::Goto | Opcode::Switch | Opcode::Unreachable
            )
    }

    pub fn is_aget(self) -> bool {
        matches!(
            self,
            Opcode::Aget
                | Opcode::AgetWide
                | Opcode::AgetObject
                | Opcode::AgetBoolean
                | Opcode::AgetByte
                | Opcode::AgetChar
                | Opcode::AgetShort
        )
    }

    pub fn is_aput(self) -> bool {
        matches!(
            self,
            Opcode::Aput
                | Opcode::AputWide
                | Opcode::AputObject
                | Opcode::AputBoolean
                | Opcode::AputByte
                | Opcode::AputChar
                | Opcode::AputShort
        )
    }

    pub fn is_iget(self) -> bool {
        matches!(
            self,
            Opcode::Iget
                | Opcode::IgetWide
                | Opcode::IgetObject
                | Opcode::IgetBoolean
                | Opcode::IgetByte
                | Opcode::IgetChar
                | Opcode::IgetShort
        )
    }

    pub fn is_iput(self) -> bool {
        matches!(
            self,
            Opcode::Iput
                | Opcode::IputWide
                | Opcode::IputObject
                | Opcode::IputBoolean
                | Opcode::IputByte
                | Opcode::IputChar
                | Opcode::IputShort
        )
    }

    pub fn is_sget(self) -> bool {
        matches!(
            self,
            Opcode::Sget
                | Opcode::SgetWide
                | Opcode::SgetObject
                | Opcode::SgetBoolean
                | Opcode::SgetByte
                | Opcode::SgetChar
                | Opcode::SgetShort
        )
    }

    pub fn is_sput(self) -> bool {
        matches!(
            self,
            Opcode::Sput
                | Opcode::SputWide
                | Opcode::SputObject
                | Opcode::SputBoolean
                | Opcode::SputByte
                | Opcode::SputChar
                | Opcode::SputShort
        )
    }

    pub fn is_cmp(self) -> bool {
        matches!(
            self,
            Opcode::CmplFloat
                | Opcode::CmpgFloat
                | Opcode::CmplDouble
                | Opcode::CmpgDouble
                | Opcode::CmpLong
        )
    }

    pub fn is_binop_lit(self) -> bool {
        matches!(
            self,
            Opcode::AddIntLit
                | Opcode::RsubIntLit
                | Opcode::MulIntLit
                | Opcode::DivIntLit
                | Opcode::RemIntLit
                | Opcode::AndIntLit
                | Opcode::OrIntLit
                | Opcode::XorIntLit
                | Opcode::ShlIntLit
                | Opcode::ShrIntLit
                | Opcode::UshrIntLit
        )
    }

    /// Whether a real `MoveResult*` may follow this instruction.
    pub fn has_move_result(self) -> bool {
        self.is_invoke() || self == Opcode::FilledNewArray
    }

    /// Whether a `MoveResultPseudo*` must follow this instruction.
    pub fn has_move_result_pseudo(self) -> bool {
        matches!(
            self,
            Opcode::ConstString
                | Opcode::ConstClass
                | Opcode::CheckCast
                | Opcode::InstanceOf
                | Opcode::ArrayLength
                | Opcode::NewInstance
                | Opcode::NewArray
        ) || self.is_aget()
            || self.is_iget()
            || self.is_sget()
    }

    pub fn has_move_result_any(self) -> bool {
        self.has_move_result() || self.has_move_result_pseudo()
    }

    /// Whether instructions with this opcode write a destination register
    /// directly (rather than through the result register).
    pub fn has_dest(self) -> bool {
        match self {
            Opcode::Const | Opcode::ConstWide => true,
            Opcode::MoveException => true,
            _ => {
                self.is_load_param()
                    || self.is_move()
                    || self.is_move_result_any()
                    || self.is_cmp()
                    || self.is_binop_lit()
                    || self.is_unop()
                    || self.is_binop()
            }
        }
    }

    pub fn is_unop(self) -> bool {
        matches!(
            self,
            Opcode::NegInt
                | Opcode::NotInt
                | Opcode::NegLong
                | Opcode::NotLong
                | Opcode::NegFloat
                | Opcode::NegDouble
        )
    }

    pub fn is_binop(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            AddInt
                | SubInt
                | MulInt
                | DivInt
                | RemInt
                | AndInt
                | OrInt
                | XorInt
                | ShlInt
                | ShrInt
                | UshrInt
                | AddLong
                | SubLong
                | MulLong
                | DivLong
                | RemLong
                | AndLong
                | OrLong
                | XorLong
                | ShlLong
                | ShrLong
                | UshrLong
                | AddFloat
                | SubFloat
                | MulFloat
                | DivFloat
                | RemFloat
                | AddDouble
                | SubDouble
                | MulDouble
                | DivDouble
                | RemDouble
        )
    }

    /// Whether the destination register (direct or via the following
    /// move-result) holds a wide value.
    pub fn dest_is_wide(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            ConstWide
                | MoveWide
                | MoveResultWide
                | MoveResultPseudoWide
                | LoadParamWide
                | NegLong
                | NotLong
                | NegDouble
                | AddLong
                | SubLong
                | MulLong
                | DivLong
                | RemLong
                | AndLong
                | OrLong
                | XorLong
                | ShlLong
                | ShrLong
                | UshrLong
                | AddDouble
                | SubDouble
                | MulDouble
                | DivDouble
                | RemDouble
        )
    }

    /// Instructions with observable side effects, which dead-code
    /// elimination must keep regardless of liveness.
    pub fn side_effects(self) -> bool {
        self.is_return()
            || self.is_branch()
            || self.is_invoke()
            || self.is_aput()
            || self.is_iput()
            || self.is_sput()
            || self.is_load_param()
            || matches!(
                self,
                Opcode::MonitorEnter
                    | Opcode::MonitorExit
                    | Opcode::CheckCast
                    | Opcode::FillArrayData
                    | Opcode::Throw
                    | Opcode::Unreachable
            )
    }

    /// The payload kind instructions with this opcode carry.
    pub fn payload_kind(self) -> PayloadKind {
        use Opcode::*;
        match self {
            Const | ConstWide => PayloadKind::Literal,
            ConstString => PayloadKind::String,
            ConstClass | CheckCast | InstanceOf | NewInstance | NewArray | FilledNewArray => {
                PayloadKind::Type
            }
            _ if self.is_iget() || self.is_iput() || self.is_sget() || self.is_sput() => {
                PayloadKind::Field
            }
            _ if self.is_invoke() => PayloadKind::Method,
            _ if self.is_binop_lit() => PayloadKind::Literal,
            _ => PayloadKind::None,
        }
    }

    /// The opposite sense of a conditional branch.
    pub fn invert_conditional_branch(self) -> Opcode {
        match self {
            Opcode::IfEq => Opcode::IfNe,
            Opcode::IfNe => Opcode::IfEq,
            Opcode::IfLt => Opcode::IfGe,
            Opcode::IfGe => Opcode::IfLt,
            Opcode::IfGt => Opcode::IfLe,
            Opcode::IfLe => Opcode::IfGt,
            Opcode::IfEqz => Opcode::IfNez,
            Opcode::IfNez => Opcode::IfEqz,
            Opcode::IfLtz => Opcode::IfGez,
            Opcode::IfGez => Opcode::IfLtz,
            Opcode::IfGtz => Opcode::IfLez,
            Opcode::IfLez => Opcode::IfGtz,
            _ => panic!("invert_conditional_branch: {self:?} is not a conditional branch"),
        }
    }
}

/// The at-most-one payload of an instruction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Payload {
    None,
    Literal(i64),
    String(StringId),
    Type(TypeId),
    Field(FieldId),
    Method(MethodId),
}

/// An IR instruction.
#[derive(Clone, Debug)]
pub struct Insn {
    uid: InsnUid,
    op: Opcode,
    srcs: SmallVec<[Reg; 2]>,
    dest: Option<Reg>,
    payload: Payload,
}

impl Insn {
    pub fn new(op: Opcode) -> Self {
        Self {
            uid: fresh_uid(),
            op,
            srcs: SmallVec::new(),
            dest: None,
            payload: Payload::None,
        }
    }

    /// A deep copy with a fresh identity.
    pub fn duplicate(&self) -> Self {
        Self {
            uid: fresh_uid(),
            op: self.op,
            srcs: self.srcs.clone(),
            dest: self.dest,
            payload: self.payload,
        }
    }

    pub fn uid(&self) -> InsnUid {
        self.uid
    }

    pub fn opcode(&self) -> Opcode {
        self.op
    }

    pub fn set_opcode(&mut self, op: Opcode) -> &mut Self {
        debug_assert_eq!(
            self.op.payload_kind(),
            op.payload_kind(),
            "opcode change must preserve the payload kind"
        );
        self.op = op;
        self
    }

    pub fn srcs(&self) -> &[Reg] {
        &self.srcs
    }

    pub fn srcs_size(&self) -> usize {
        self.srcs.len()
    }

    pub fn src(&self, i: usize) -> Reg {
        self.srcs[i]
    }

    pub fn set_src(&mut self, i: usize, reg: Reg) -> &mut Self {
        if i == self.srcs.len() {
            self.srcs.push(reg);
        } else {
            self.srcs[i] = reg;
        }
        self
    }

    pub fn set_srcs(&mut self, regs: &[Reg]) -> &mut Self {
        self.srcs = SmallVec::from_slice(regs);
        self
    }

    pub fn dest(&self) -> Reg {
        self.dest.expect("instruction has no destination")
    }

    pub fn dest_opt(&self) -> Option<Reg> {
        self.dest
    }

    pub fn has_dest(&self) -> bool {
        self.dest.is_some()
    }

    pub fn set_dest(&mut self, reg: Reg) -> &mut Self {
        assert!(
            self.op.has_dest(),
            "{:?} does not take a destination register",
            self.op
        );
        self.dest = Some(reg);
        self
    }

    pub fn set_literal(&mut self, literal: i64) -> &mut Self {
        assert_eq!(self.op.payload_kind(), PayloadKind::Literal, "{:?}", self.op);
        self.payload = Payload::Literal(literal);
        self
    }

    pub fn set_string(&mut self, s: StringId) -> &mut Self {
        assert_eq!(self.op.payload_kind(), PayloadKind::String, "{:?}", self.op);
        self.payload = Payload::String(s);
        self
    }

    pub fn set_type(&mut self, ty: TypeId) -> &mut Self {
        assert_eq!(self.op.payload_kind(), PayloadKind::Type, "{:?}", self.op);
        self.payload = Payload::Type(ty);
        self
    }

    pub fn set_field(&mut self, field: FieldId) -> &mut Self {
        assert_eq!(self.op.payload_kind(), PayloadKind::Field, "{:?}", self.op);
        self.payload = Payload::Field(field);
        self
    }

    pub fn set_method(&mut self, method: MethodId) -> &mut Self {
        assert_eq!(self.op.payload_kind(), PayloadKind::Method, "{:?}", self.op);
        self.payload = Payload::Method(method);
        self
    }

    pub fn payload(&self) -> Payload {
        self.payload
    }

    pub fn literal(&self) -> i64 {
        match self.payload {
            Payload::Literal(v) => v,
            _ => panic!("{:?} carries no literal", self.op),
        }
    }

    pub fn string(&self) -> StringId {
        match self.payload {
            Payload::String(s) => s,
            _ => panic!("{:?} carries no string", self.op),
        }
    }

    pub fn type_ref(&self) -> TypeId {
        match self.payload {
            Payload::Type(t) => t,
            _ => panic!("{:?} carries no type", self.op),
        }
    }

    pub fn field_ref(&self) -> FieldId {
        match self.payload {
            Payload::Field(f) => f,
            _ => panic!("{:?} carries no field", self.op),
        }
    }

    pub fn method_ref(&self) -> MethodId {
        match self.payload {
            Payload::Method(m) => m,
            _ => panic!("{:?} carries no method", self.op),
        }
    }

    /// The width in registers of source `i` (1, or 2 for wide operands).
    pub fn src_width(&self, i: usize) -> u32 {
        use Opcode::*;
        let wide = match self.op {
            MoveWide | ReturnWide => true,
            CmpLong | CmplDouble | CmpgDouble => true,
            AputWide => i == 0,
            NegLong | NotLong | NegDouble => true,
            AddLong | SubLong | MulLong | DivLong | RemLong | AndLong | OrLong | XorLong => true,
            // Shift amounts are int even for long shifts.
            ShlLong | ShrLong | UshrLong => i == 0,
            AddDouble | SubDouble | MulDouble | DivDouble | RemDouble => true,
            IputWide | SputWide => i == 0,
            _ => false,
        };
        if wide {
            2
        } else {
            1
        }
    }

    /// The width in registers of the destination, if any.
    pub fn dest_width(&self) -> u32 {
        if self.op.dest_is_wide() {
            2
        } else {
            1
        }
    }
}

// Identity is the uid; two structurally equal instructions are still
// distinct program points.
impl PartialEq for Insn {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}
impl Eq for Insn {}

impl std::hash::Hash for Insn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_validates_payload_kind() {
        let mut insn = Insn::new(Opcode::Const);
        insn.set_dest(0).set_literal(42);
        assert_eq!(insn.literal(), 42);
        assert_eq!(insn.dest(), 0);
    }

    #[test]
    #[should_panic]
    fn wrong_payload_kind_panics() {
        let mut insn = Insn::new(Opcode::Const);
        insn.set_type(TypeId::from_u32(0));
    }

    #[test]
    #[should_panic]
    fn dest_on_destless_opcode_panics() {
        let mut insn = Insn::new(Opcode::Throw);
        insn.set_dest(0);
    }

    #[test]
    fn uids_are_unique() {
        let a = Insn::new(Opcode::Nop);
        let b = Insn::new(Opcode::Nop);
        assert_ne!(a.uid(), b.uid());
        let c = a.duplicate();
        assert_ne!(a.uid(), c.uid());
    }

    #[test]
    fn result_shape_predicates() {
        assert!(Opcode::InvokeStatic.has_move_result());
        assert!(!Opcode::InvokeStatic.has_move_result_pseudo());
        assert!(Opcode::Sget.has_move_result_pseudo());
        assert!(Opcode::InstanceOf.has_move_result_pseudo());
        assert!(!Opcode::Const.has_move_result_any());
        assert!(Opcode::Const.has_dest());
        assert!(!Opcode::Sget.has_dest());
    }

    #[test]
    fn branch_inversion_is_involutive() {
        let all = [
            Opcode::IfEq,
            Opcode::IfNe,
            Opcode::IfLt,
            Opcode::IfGe,
            Opcode::IfGt,
            Opcode::IfLe,
            Opcode::IfEqz,
            Opcode::IfNez,
            Opcode::IfLtz,
            Opcode::IfGez,
            Opcode::IfGtz,
            Opcode::IfLez,
        ];
        for op in all {
            assert_eq!(op.invert_conditional_branch().invert_conditional_branch(), op);
        }
    }
}
