//! Helpers for building method bodies in tests.
//!
//! Not part of the public surface proper; integration tests and the unit
//! tests of the passes assemble inputs with these instead of a parser.

use smallvec::SmallVec;

use crate::ir::code::{BranchTarget, CatchHandlers, IrCode, Item};
use crate::ir::entities::{FieldId, Label, MethodId, StringId, TryId, TypeId};
use crate::ir::insn::{Insn, Opcode, Reg};

pub fn const_insn(dest: Reg, literal: i64) -> Insn {
    let mut insn = Insn::new(Opcode::Const);
    insn.set_dest(dest).set_literal(literal);
    insn
}

pub fn const_wide(dest: Reg, literal: i64) -> Insn {
    let mut insn = Insn::new(Opcode::ConstWide);
    insn.set_dest(dest).set_literal(literal);
    insn
}

pub fn const_string(s: StringId) -> Insn {
    let mut insn = Insn::new(Opcode::ConstString);
    insn.set_string(s);
    insn
}

pub fn move_result_pseudo_object(dest: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::MoveResultPseudoObject);
    insn.set_dest(dest);
    insn
}

pub fn move_result_pseudo(dest: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::MoveResultPseudo);
    insn.set_dest(dest);
    insn
}

pub fn move_result(dest: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::MoveResult);
    insn.set_dest(dest);
    insn
}

pub fn move_result_object(dest: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::MoveResultObject);
    insn.set_dest(dest);
    insn
}

pub fn move_insn(dest: Reg, src: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::Move);
    insn.set_dest(dest).set_src(0, src);
    insn
}

pub fn move_object(dest: Reg, src: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::MoveObject);
    insn.set_dest(dest).set_src(0, src);
    insn
}

pub fn load_param(dest: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::LoadParam);
    insn.set_dest(dest);
    insn
}

pub fn load_param_object(dest: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::LoadParamObject);
    insn.set_dest(dest);
    insn
}

pub fn load_param_wide(dest: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::LoadParamWide);
    insn.set_dest(dest);
    insn
}

pub fn invoke(op: Opcode, method: MethodId, srcs: &[Reg]) -> Insn {
    let mut insn = Insn::new(op);
    insn.set_method(method).set_srcs(srcs);
    insn
}

pub fn invoke_static(method: MethodId, srcs: &[Reg]) -> Insn {
    invoke(Opcode::InvokeStatic, method, srcs)
}

pub fn invoke_virtual(method: MethodId, srcs: &[Reg]) -> Insn {
    invoke(Opcode::InvokeVirtual, method, srcs)
}

pub fn invoke_direct(method: MethodId, srcs: &[Reg]) -> Insn {
    invoke(Opcode::InvokeDirect, method, srcs)
}

pub fn new_instance(ty: TypeId) -> Insn {
    let mut insn = Insn::new(Opcode::NewInstance);
    insn.set_type(ty);
    insn
}

pub fn new_array(len_src: Reg, ty: TypeId) -> Insn {
    let mut insn = Insn::new(Opcode::NewArray);
    insn.set_type(ty).set_src(0, len_src);
    insn
}

pub fn instance_of(src: Reg, ty: TypeId) -> Insn {
    let mut insn = Insn::new(Opcode::InstanceOf);
    insn.set_type(ty).set_src(0, src);
    insn
}

pub fn check_cast(src: Reg, ty: TypeId) -> Insn {
    let mut insn = Insn::new(Opcode::CheckCast);
    insn.set_type(ty).set_src(0, src);
    insn
}

pub fn sget_object(field: FieldId) -> Insn {
    let mut insn = Insn::new(Opcode::SgetObject);
    insn.set_field(field);
    insn
}

pub fn sget(field: FieldId) -> Insn {
    let mut insn = Insn::new(Opcode::Sget);
    insn.set_field(field);
    insn
}

pub fn sput(field: FieldId, value: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::Sput);
    insn.set_field(field).set_src(0, value);
    insn
}

pub fn iget(field: FieldId, obj: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::Iget);
    insn.set_field(field).set_src(0, obj);
    insn
}

pub fn iput(field: FieldId, value: Reg, obj: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::Iput);
    insn.set_field(field).set_srcs(&[value, obj]);
    insn
}

pub fn aput(value: Reg, array: Reg, index: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::Aput);
    insn.set_srcs(&[value, array, index]);
    insn
}

pub fn aget(array: Reg, index: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::Aget);
    insn.set_srcs(&[array, index]);
    insn
}

pub fn unop(op: Opcode, dest: Reg, src: Reg) -> Insn {
    let mut insn = Insn::new(op);
    insn.set_dest(dest).set_src(0, src);
    insn
}

pub fn binop(op: Opcode, dest: Reg, a: Reg, b: Reg) -> Insn {
    let mut insn = Insn::new(op);
    insn.set_dest(dest).set_srcs(&[a, b]);
    insn
}

pub fn binop_lit(op: Opcode, dest: Reg, src: Reg, literal: i64) -> Insn {
    let mut insn = Insn::new(op);
    insn.set_dest(dest).set_src(0, src).set_literal(literal);
    insn
}

pub fn xor_lit1(dest: Reg, src: Reg) -> Insn {
    binop_lit(Opcode::XorIntLit, dest, src, 1)
}

pub fn return_void() -> Insn {
    Insn::new(Opcode::ReturnVoid)
}

pub fn return_value(src: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::Return);
    insn.set_src(0, src);
    insn
}

pub fn return_object(src: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::ReturnObject);
    insn.set_src(0, src);
    insn
}

pub fn throw(src: Reg) -> Insn {
    let mut insn = Insn::new(Opcode::Throw);
    insn.set_src(0, src);
    insn
}

pub fn if_insn(op: Opcode, srcs: &[Reg]) -> Insn {
    let mut insn = Insn::new(op);
    insn.set_srcs(srcs);
    insn
}

/// A linear-list builder over [`IrCode`].
pub struct CodeBuilder {
    code: IrCode,
}

impl CodeBuilder {
    pub fn new(registers_size: u32) -> Self {
        Self {
            code: IrCode::new(registers_size),
        }
    }

    pub fn fresh_label(&mut self) -> Label {
        self.code.fresh_label()
    }

    pub fn add_catch(&mut self, handlers: Vec<(Option<TypeId>, Label)>) -> TryId {
        self.code.add_catch(CatchHandlers { handlers })
    }

    pub fn push(&mut self, insn: Insn) -> &mut Self {
        self.code.push_insn(insn);
        self
    }

    pub fn label(&mut self, label: Label) -> &mut Self {
        self.code.push(Item::Label(label));
        self
    }

    pub fn try_start(&mut self, id: TryId) -> &mut Self {
        self.code.push(Item::TryStart(id));
        self
    }

    pub fn try_end(&mut self, id: TryId) -> &mut Self {
        self.code.push(Item::TryEnd(id));
        self
    }

    pub fn source_block(&mut self, sb: crate::ir::SourceBlock) -> &mut Self {
        self.code.push(Item::SourceBlock(sb));
        self
    }

    /// A goto or conditional branch to `target`.
    pub fn branch(&mut self, insn: Insn, target: Label) -> &mut Self {
        let mut targets: SmallVec<[BranchTarget; 2]> = SmallVec::new();
        targets.push(BranchTarget {
            case_key: None,
            label: target,
        });
        self.code.push(Item::Branch { insn, targets });
        self
    }

    pub fn goto(&mut self, target: Label) -> &mut Self {
        self.branch(Insn::new(Opcode::Goto), target)
    }

    /// A switch on `src` with the given (case key, target) pairs.
    pub fn switch(&mut self, src: Reg, cases: &[(i64, Label)]) -> &mut Self {
        let mut insn = Insn::new(Opcode::Switch);
        insn.set_src(0, src);
        let targets: SmallVec<[BranchTarget; 2]> = cases
            .iter()
            .map(|&(key, label)| BranchTarget {
                case_key: Some(key),
                label,
            })
            .collect();
        self.code.push(Item::Branch { insn, targets });
        self
    }

    pub fn build(self) -> IrCode {
        self.code
    }
}

/// The opcode sequence of a linear body, for structural assertions.
pub fn opcodes_of(code: &IrCode) -> Vec<Opcode> {
    code.insns().map(|insn| insn.opcode()).collect()
}
