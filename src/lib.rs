//! danica: the instruction-semantics and memory-abstraction core of a
//! concolic x86-64 binary-analysis platform.
//!
//! Decoded instructions come in from an external decoder; this crate
//! computes their exact register, flag, and memory effects, concretely
//! or over unresolved solver expressions, and raises typed
//! concretization requests when a computation needs a single concrete
//! value the constraint set has not pinned yet.

pub mod concolic;
pub mod instruction;
pub mod state;

pub use concolic::{executor, ConstraintSet, CpuExecutor, Value};
pub use state::{ConcreteMemory, CpuState, MemoryBackend, SymbolicMemory};
