//! Ordered, resumable step execution.

use crate::context::Context;
use crate::error::WorkflowError;
use crate::markers::MarkerStore;
use crate::step::{Step, StepName};
use std::fmt;
use tracing::{info, warn};

/// Runs registered steps in order, each at most once across restarts.
///
/// Completion is tracked per step name in a [`MarkerStore`]. A step whose
/// marker is already set is skipped; a failing step halts the run without
/// setting its marker, so the next [`resume`](StepSequencer::resume) picks up
/// exactly there.
///
/// # Examples
///
/// ```
/// use halfmap_filter::{Context, FnStep, MemoryMarkerStore, StepSequencer};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), halfmap_filter::WorkflowError> {
/// let mut sequencer = StepSequencer::new(MemoryMarkerStore::default());
/// sequencer
///     .register("first", FnStep::new(|_: &mut Context| Ok(())))?
///     .register("second", FnStep::new(|_: &mut Context| Ok(())))?;
///
/// let mut ctx = Context::new();
/// let report = sequencer.run(&mut ctx).await?;
/// assert_eq!(report.executed.len(), 2);
///
/// let report = sequencer.resume(&mut ctx).await?;
/// assert!(report.executed.is_empty());
/// assert_eq!(report.skipped.len(), 2);
/// # Ok(())
/// # }
/// ```
pub struct StepSequencer<M> {
    steps: Vec<StepEntry>,
    markers: M,
}

struct StepEntry {
    name: StepName,
    step: Box<dyn Step>,
}

/// What a single [`StepSequencer::run`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Steps whose action ran to completion during this call.
    pub executed: Vec<StepName>,
    /// Steps skipped because an earlier call had already completed them.
    pub skipped: Vec<StepName>,
}

impl RunReport {
    /// `true` when every step had already been completed before this call.
    pub fn was_noop(&self) -> bool {
        self.executed.is_empty()
    }
}

impl<M> fmt::Debug for StepSequencer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSequencer")
            .field("steps", &self.step_names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<M> StepSequencer<M> {
    /// Creates an empty sequencer backed by `markers`.
    pub fn new(markers: M) -> Self {
        Self {
            steps: Vec::new(),
            markers,
        }
    }

    /// Appends a step. Nothing runs until [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// [`WorkflowError::DuplicateStep`] if `name` is already registered, since
    /// two steps sharing one marker could never both run.
    pub fn register<S: Step + 'static>(
        &mut self,
        name: impl Into<StepName>,
        step: S,
    ) -> Result<&mut Self, WorkflowError> {
        let name = name.into();
        if self.steps.iter().any(|entry| entry.name == name) {
            return Err(WorkflowError::DuplicateStep(name));
        }
        self.steps.push(StepEntry {
            name,
            step: Box::new(step),
        });
        Ok(self)
    }

    /// Registered step names, in execution order.
    pub fn step_names(&self) -> impl Iterator<Item = &StepName> {
        self.steps.iter().map(|entry| &entry.name)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

impl<M: MarkerStore> StepSequencer<M> {
    /// Returns `true` if the step's completion marker is set.
    pub fn is_complete(&self, name: &StepName) -> Result<bool, WorkflowError> {
        self.markers.is_complete(name)
    }

    /// Clears every completion marker so the next run starts from the first step.
    pub fn reset(&mut self) -> Result<(), WorkflowError> {
        info!("Clearing {} step markers", self.steps.len());
        self.markers.clear()
    }

    /// Executes every step not yet marked complete, in registration order.
    ///
    /// Stops at the first failing step and returns its error; the markers of
    /// earlier steps stay set.
    pub async fn run(&mut self, ctx: &mut Context) -> Result<RunReport, WorkflowError> {
        let mut report = RunReport::default();

        for entry in &self.steps {
            if self.markers.is_complete(&entry.name)? {
                info!("Step '{}' already completed, skipping", entry.name);
                report.skipped.push(entry.name.clone());
                continue;
            }

            info!("Step '{}' started", entry.name);
            match entry.step.execute(ctx).await {
                Ok(()) => {
                    self.markers.mark_complete(&entry.name)?;
                    info!("Step '{}' completed successfully", entry.name);
                    report.executed.push(entry.name.clone());
                }
                Err(e) => {
                    warn!("Step '{}' failed: {}", entry.name, e);
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// Continues a run after a failure or restart.
    ///
    /// Same as [`run`](Self::run); completed steps are recognised purely from
    /// the persisted markers, so calling this repeatedly is harmless.
    pub async fn resume(&mut self, ctx: &mut Context) -> Result<RunReport, WorkflowError> {
        let completed = self
            .steps
            .iter()
            .map(|entry| self.markers.is_complete(&entry.name))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|done| *done)
            .count();
        info!(
            "Resuming with {}/{} steps already completed",
            completed,
            self.steps.len()
        );
        self.run(ctx).await
    }
}
