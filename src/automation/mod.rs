//! In-flight automation support: the per-task phase machine and the failure
//! classifier the execution path consults after every error.

pub mod classifier;
pub mod phase;
pub mod tracker;

pub use classifier::{classify, ExecutionError, ExecutionStrategy, FailureSignal, FailureType};
pub use phase::{ApplicationPhase, PhaseTransition};
pub use tracker::{InMemoryPhaseStore, PhaseError, PhaseStore, PhaseTracker, ProgressUpdate};
