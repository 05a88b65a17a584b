//! Intraprocedural analysis and rewriting for a register-based bytecode IR.
//!
//! `dexlift` is the core an optimizing bytecode rewriter is built around:
//! an interned IR model of classes, fields, methods and instructions; an
//! editable control flow graph over method bodies; a monotone fixpoint
//! framework with the type-inference, constant-propagation and
//! reaching-definitions analyses layered on it; and the local
//! transformation primitives that passes compose: dead-code elimination,
//! peephole rewriting, type-check evaluation, goto folding, throw
//! propagation and boolean branch reduction.
//!
//! Parsing and encoding of the on-disk archive format, configuration, and
//! whole-program passes live with the driver; this crate consumes an
//! already-constructed [`ir::Scope`] and hands mutations back through the
//! same model.

pub mod analysis;
pub mod cfg;
pub mod ir;
pub mod opt;
pub mod pass;
pub mod refchecker;
pub mod resolver;
pub mod walkers;

pub use ir::{DexContext, IrCode, Scope};
pub use pass::PassManager;
