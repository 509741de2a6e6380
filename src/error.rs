//! Error types for conversion, invocation and step sequencing.

use crate::step::StepName;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while materializing volumes and masks as MRC files.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConversionError {
    /// The source volume could not be opened or read.
    #[error("cannot read volume '{}': {source}", path.display())]
    Unreadable {
        /// Location of the source volume.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The destination file could not be written.
    #[error("cannot write volume '{}': {source}", path.display())]
    Unwritable {
        /// Location of the destination file.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a volume this crate understands.
    #[error("invalid MRC header in '{}': {reason}", path.display())]
    InvalidHeader {
        /// Location of the offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// A mask could not be brought to the requested dimension.
    #[error("cannot resample '{}' from {from:?} to {to}^3", path.display())]
    DimensionMismatch {
        /// Location of the mask.
        path: PathBuf,
        /// Source dimensions (x, y, z).
        from: (usize, usize, usize),
        /// Requested cubic dimension.
        to: usize,
    },
}

/// Errors that can occur while running a filter job.
///
/// Every variant is fatal for the current run: the sequencer stops at the
/// failing step and leaves its completion marker unset, so a later
/// [`resume`](crate::StepSequencer::resume) re-attempts exactly that step.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A step failed for a reason not covered by the other variants.
    #[error("Step failed: {step_name}, details: {details}")]
    StepError {
        /// The name of the step that failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
    },

    /// Input or mask conversion failed.
    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// The external program could not be started or exited with a non-zero status.
    #[error("External program '{program}' failed: {details}")]
    ExternalProcess {
        /// Program that was launched.
        program: String,
        /// Exit code when the process ran to completion.
        exit_code: Option<i32>,
        /// Human readable description of the failure.
        details: String,
    },

    /// An expected output file is missing or unreadable after a successful exit.
    #[error("Expected output '{}' is missing: {details}", path.display())]
    MissingOutput {
        /// Output file location.
        path: PathBuf,
        /// Why the file was rejected.
        details: String,
    },

    /// Two steps were registered under the same name.
    #[error("Duplicate step name: {0}")]
    DuplicateStep(StepName),

    /// Completion markers or the output registry could not be read or written.
    #[error("Marker store error at '{}': {details}", path.display())]
    Marker {
        /// File backing the store.
        path: PathBuf,
        /// Details about the failure.
        details: String,
    },

    /// The run configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl WorkflowError {
    /// Exit code of the external program, if this error came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            WorkflowError::ExternalProcess { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = WorkflowError::StepError {
            step_name: StepName::new("test_step"),
            details: "test error".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Step failed: test_step, details: test error"
        );

        let error = WorkflowError::ExternalProcess {
            program: "sidesplitter".to_string(),
            exit_code: Some(1),
            details: "exit status 1".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "External program 'sidesplitter' failed: exit status 1"
        );
        assert_eq!(error.exit_code(), Some(1));
    }

    #[test]
    fn test_conversion_error_wraps() {
        let conversion = ConversionError::DimensionMismatch {
            path: PathBuf::from("mask.mrc"),
            from: (64, 64, 32),
            to: 60,
        };
        let error: WorkflowError = conversion.into();
        assert!(matches!(error, WorkflowError::Conversion(_)));
        assert_eq!(
            error.to_string(),
            "Conversion failed: cannot resample 'mask.mrc' from (64, 64, 32) to 60^3"
        );
        assert_eq!(error.exit_code(), None);
    }
}
