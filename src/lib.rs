//! # halfmap-filter
//!
//! Resumable local filtering of cryo-EM half-maps with the external
//! SIDESPLITTER program.
//!
//! A job converts the two half-maps (and an optional mask) into a scratch
//! directory, runs the filter there and registers the two filtered
//! half-maps. Each of the three steps records a completion marker, so a job
//! that failed part-way resumes from the failing step.
//!
//! ## Features
//!
//! - **Resumable**: [`StepSequencer`] persists completion per step name
//! - **Async First**: steps and external programs run on `tokio`
//! - **MRC I/O**: [`mrc`] reads the common voxel modes and writes float32
//! - **Mask handling**: [`convert::materialize_mask`] clamps to `[0, 1]`
//!   and resamples to the half-map box
//! - **Error Handling**: structured errors with `thiserror`
//!
//! ## Quick Start
//!
//! ```rust
//! use halfmap_filter::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), WorkflowError> {
//! let mut sequencer = StepSequencer::new(MemoryMarkerStore::default());
//! sequencer
//!     .register("load", FnStep::new(|ctx: &mut Context| {
//!         ctx.insert("data", "half-map".to_string());
//!         Ok(())
//!     }))?
//!     .register("check", FnStep::new(|ctx: &mut Context| {
//!         match ctx.get::<String>("data") {
//!             Some(_) => Ok(()),
//!             None => Err(WorkflowError::StepError {
//!                 step_name: "check".into(),
//!                 details: "nothing loaded".to_string(),
//!             }),
//!         }
//!     }))?;
//!
//! let mut ctx = Context::new();
//! let report = sequencer.run(&mut ctx).await?;
//! assert_eq!(report.executed.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Filtering a pair of half-maps
//!
//! ```rust,no_run
//! use halfmap_filter::Config;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), halfmap_filter::WorkflowError> {
//! let config = Config::from_file(std::path::Path::new("config.yaml"))?;
//! let job = config.build_job()?;
//! let outputs = job.run().await?;
//! for volume in outputs.iter() {
//!     println!("{} -> {}", volume.label, volume.path.display());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! ```rust
//! use halfmap_filter::WorkflowError;
//!
//! fn report(error: &WorkflowError) {
//!     match error {
//!         WorkflowError::ExternalProcess { program, exit_code, .. } => {
//!             eprintln!("{program} exited with {exit_code:?}");
//!         }
//!         WorkflowError::Conversion(e) => eprintln!("Bad input: {e}"),
//!         _ => eprintln!("Error: {error}"),
//!     }
//! }
//! ```

mod context;
mod error;
mod markers;
mod sequencer;
mod step;

pub mod config;
pub mod convert;
pub mod invoker;
pub mod mrc;
pub mod plugin;
pub mod prelude;
pub mod protocol;

pub use config::Config;
pub use context::Context;
pub use error::{ConversionError, WorkflowError};
pub use invoker::{ArgumentMap, ExternalTool, ToolEnviron};
pub use markers::{FileMarkerStore, MarkerStore, MemoryMarkerStore, MARKERS_FILENAME};
pub use plugin::ToolPlugin;
pub use protocol::{
    FileLayout, FilterInputs, FilteredOutputPair, HalfMapPair, LocalFilterJob, MaskInput,
    OutputVolume, Reconstruction, RefinementResult, RunParameters, SourceRelation, Summary,
};
pub use sequencer::{RunReport, StepSequencer};
pub use step::{FnStep, Step, StepName};
