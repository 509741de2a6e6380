//! Commonly used types and traits

pub use crate::context::Context;
pub use crate::error::WorkflowError;
pub use crate::markers::{FileMarkerStore, MarkerStore, MemoryMarkerStore};
pub use crate::sequencer::StepSequencer;
pub use crate::step::{FnStep, Step, StepName};
