//! Dataflow analyses: the fixpoint framework, the abstract domains, and
//! the concrete analyses layered on them.

pub mod constprop;
pub mod domains;
pub mod fixpoint;
pub mod reaching_defs;
pub mod type_inference;
pub mod wto;

pub use constprop::{ConstantEnvironment, ConstantPropagation, ConstantValue};
pub use domains::{
    ConstantArrayDomain, ConstantHeap, DexTypeDomain, HeapPointer, IntType, IrType, Nullness,
    RegEnvironment, SignInterval, SignedConstantDomain, SingletonObjectDomain,
};
pub use fixpoint::{AbstractDomain, FixpointAnalyzer, FixpointIterator};
pub use reaching_defs::{compute_def_use_chains, DefUseChains, Defs, ReachingDefinitions, Use};
pub use type_inference::{TypeEnvironment, TypeInference, TypeInferenceResult};
pub use wto::{WeakTopologicalOrder, WtoComponent};
