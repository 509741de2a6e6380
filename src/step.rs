//! Step trait and related types.

use crate::context::Context;
use crate::error::WorkflowError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Name of a pipeline step, e.g. `convertInputStep`.
///
/// Step names double as the keys of persisted completion markers, so they
/// must stay stable between a run and its resume.
///
/// # Examples
///
/// ```
/// use halfmap_filter::StepName;
///
/// let name = StepName::new("convertInputStep");
/// assert_eq!(name.as_str(), "convertInputStep");
///
/// let name: StepName = "runFilterStep".into();
/// assert_eq!(name.to_string(), "runFilterStep");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepName(String);

impl StepName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as written to the marker file.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A unit of work run by the [`StepSequencer`](crate::StepSequencer).
///
/// A step either completes fully (`Ok`) or is treated as not having run at
/// all (`Err`); the sequencer only records completion after `Ok`.
///
/// # Examples
///
/// ```
/// use halfmap_filter::{Context, Step, WorkflowError};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct TouchStep;
///
/// #[async_trait]
/// impl Step for TouchStep {
///     async fn execute(&self, ctx: &mut Context) -> Result<(), WorkflowError> {
///         ctx.insert("touched", true);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Runs the step to completion, or fails without leaving partial results
    /// the next attempt depends on.
    async fn execute(&self, ctx: &mut Context) -> Result<(), WorkflowError>;
}

/// Adapts a synchronous closure into a [`Step`].
///
/// # Examples
///
/// ```
/// use halfmap_filter::{Context, FnStep, MemoryMarkerStore, StepSequencer};
///
/// let mut sequencer = StepSequencer::new(MemoryMarkerStore::default());
/// sequencer
///     .register("hello", FnStep::new(|ctx: &mut Context| {
///         ctx.insert("greeting", "hi".to_string());
///         Ok(())
///     }))
///     .expect("unique name");
/// ```
pub struct FnStep<F> {
    action: F,
}

impl<F> FnStep<F>
where
    F: Fn(&mut Context) -> Result<(), WorkflowError> + Send + Sync,
{
    /// Wraps `action`.
    pub fn new(action: F) -> Self {
        Self { action }
    }
}

impl<F> Debug for FnStep<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(&mut Context) -> Result<(), WorkflowError> + Send + Sync,
{
    async fn execute(&self, ctx: &mut Context) -> Result<(), WorkflowError> {
        (self.action)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_name() {
        let name = StepName::new("test");
        assert_eq!(name.as_str(), "test");

        let name: StepName = "test".into();
        assert_eq!(name, "test");
    }

    #[test]
    fn test_step_name_serializes_as_string() {
        let name = StepName::new("createOutputStep");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"createOutputStep\"");
    }

    #[tokio::test]
    async fn test_fn_step_runs_closure() {
        let step = FnStep::new(|ctx: &mut Context| {
            ctx.insert("ran", true);
            Ok(())
        });
        let mut ctx = Context::new();
        step.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.get::<bool>("ran"), Some(&true));
    }
}
