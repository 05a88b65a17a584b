//! The in-memory IR model: interned entities, classes, annotations,
//! instructions and method bodies.

pub mod annotation;
pub mod class;
pub mod code;
pub mod context;
pub mod entities;
pub mod insn;
pub mod testutil;
pub mod types;

pub use annotation::{Annotation, AnnotationSet, EncodedValue, Visibility};
pub use class::{AccessFlags, DexClass, FieldDef, MethodDef, Scope};
pub use code::{BranchTarget, CatchHandlers, IrCode, Item, Position, ScopedCfg, SourceBlock};
pub use context::{DexContext, FieldData, MethodData, ProtoData, WellKnown};
pub use entities::{
    Block, ClassId, EdgeId, FieldId, InsnUid, Label, MethodId, ProtoId, StringId, TryId, TypeId,
};
pub use insn::{Insn, Opcode, Payload, PayloadKind, Reg, RESULT_REGISTER};
