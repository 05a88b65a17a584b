//! IR entity references.
//!
//! Cross-references between IR entities are not Rust references; the class
//! and method graphs are cyclic through interfaces and overriding, so every
//! entity lives in an arena owned by either the [`DexContext`] interner or a
//! [`Scope`], and the references are compact `u32` indices into those
//! arenas. There is a separate index type for each entity, so we don't lose
//! type safety.
//!
//! [`DexContext`]: crate::ir::DexContext
//! [`Scope`]: crate::ir::Scope

use cranelift_entity::entity_impl;

/// An opaque reference to an interned string literal.
///
/// Two `StringId`s are equal iff the strings they denote are equal.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringId(u32);
entity_impl!(StringId, "str");

/// An opaque reference to an interned type descriptor.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);
entity_impl!(TypeId, "type");

/// An opaque reference to an interned method signature: a return type plus
/// an ordered parameter type list.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtoId(u32);
entity_impl!(ProtoId, "proto");

/// An opaque reference to an interned field reference (class, name, type).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(u32);
entity_impl!(FieldId, "field");

/// An opaque reference to an interned method reference (class, name, proto).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(u32);
entity_impl!(MethodId, "method");

/// An opaque reference to a class definition in a [`Scope`].
///
/// [`Scope`]: crate::ir::Scope
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);
entity_impl!(ClassId, "class");

/// An opaque reference to a basic block in a control flow graph.
///
/// While the order is stable, it is arbitrary and does not necessarily
/// resemble the layout order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an edge in a control flow graph.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(u32);
entity_impl!(EdgeId, "edge");

/// A branch target marker in the linear instruction stream.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);
entity_impl!(Label, "label");

/// A catch-handler list attached to a try region in the linear stream.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TryId(u32);
entity_impl!(TryId, "try");

/// A stable identity for an instruction, preserved across CFG mutation.
///
/// Instruction objects move between blocks and lists as passes edit a
/// method; the uid is the handle analyses key their maps by. Uids are drawn
/// from a process-wide counter and are never reused.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnUid(u32);
entity_impl!(InsnUid, "insn");
