//! Persisted step completion markers.

use crate::error::WorkflowError;
use crate::step::StepName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Default filename for completion markers under a run directory.
pub const MARKERS_FILENAME: &str = "steps.json";

/// Storage for the "this step already completed" flags.
///
/// Implementations must make [`mark_complete`](MarkerStore::mark_complete)
/// durable before returning, since the sequencer moves on to the next step
/// right after it.
pub trait MarkerStore: Send + Sync {
    /// Returns `true` if `step` was marked complete by an earlier run.
    fn is_complete(&self, step: &StepName) -> Result<bool, WorkflowError>;

    /// Records that `step` completed.
    fn mark_complete(&mut self, step: &StepName) -> Result<(), WorkflowError>;

    /// Forgets every marker, so the next run starts from scratch.
    fn clear(&mut self) -> Result<(), WorkflowError>;
}

/// Markers kept only in memory. Mostly useful in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryMarkerStore {
    completed: BTreeSet<StepName>,
}

impl MemoryMarkerStore {
    /// Names of the steps marked complete so far.
    pub fn completed(&self) -> impl Iterator<Item = &StepName> {
        self.completed.iter()
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn is_complete(&self, step: &StepName) -> Result<bool, WorkflowError> {
        Ok(self.completed.contains(step))
    }

    fn mark_complete(&mut self, step: &StepName) -> Result<(), WorkflowError> {
        self.completed.insert(step.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), WorkflowError> {
        self.completed.clear();
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MarkerFile {
    completed_steps: BTreeSet<StepName>,
}

/// Markers stored as JSON in a file, typically `<run dir>/steps.json`.
///
/// The file is rewritten through a sibling temp file and a rename so a crash
/// mid-write never leaves a truncated marker file behind.
#[derive(Debug)]
pub struct FileMarkerStore {
    path: PathBuf,
    state: MarkerFile,
}

impl FileMarkerStore {
    /// Opens the store at `path`, loading existing markers if the file exists.
    #[instrument(level = "trace", skip(path))]
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WorkflowError> {
        let path = path.into();
        let state = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| marker_error(&path, e))?;
            serde_json::from_slice(&bytes).map_err(|e| marker_error(&path, e))?
        } else {
            MarkerFile::default()
        };
        debug!(
            path = %path.display(),
            completed = state.completed_steps.len(),
            "Loaded step markers"
        );
        Ok(Self { path, state })
    }

    /// Opens `<run_dir>/steps.json`.
    pub fn in_dir(run_dir: &Path) -> Result<Self, WorkflowError> {
        Self::open(run_dir.join(MARKERS_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), WorkflowError> {
        let json =
            serde_json::to_vec_pretty(&self.state).map_err(|e| marker_error(&self.path, e))?;
        write_atomic(&self.path, &json).map_err(|e| marker_error(&self.path, e))
    }
}

impl MarkerStore for FileMarkerStore {
    fn is_complete(&self, step: &StepName) -> Result<bool, WorkflowError> {
        Ok(self.state.completed_steps.contains(step))
    }

    fn mark_complete(&mut self, step: &StepName) -> Result<(), WorkflowError> {
        self.state.completed_steps.insert(step.clone());
        self.save()
    }

    fn clear(&mut self) -> Result<(), WorkflowError> {
        self.state.completed_steps.clear();
        self.save()
    }
}

/// Writes `bytes` to `path` via a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn marker_error(path: &Path, err: impl std::fmt::Display) -> WorkflowError {
    WorkflowError::Marker {
        path: path.to_path_buf(),
        details: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let mut store = MemoryMarkerStore::default();
        let step = StepName::new("convertInputStep");
        assert!(!store.is_complete(&step).unwrap());
        store.mark_complete(&step).unwrap();
        assert!(store.is_complete(&step).unwrap());
        store.clear().unwrap();
        assert_eq!(store.completed().count(), 0);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let step = StepName::new("runFilterStep");
        {
            let mut store = FileMarkerStore::in_dir(dir.path()).unwrap();
            store.mark_complete(&step).unwrap();
        }
        let store = FileMarkerStore::in_dir(dir.path()).unwrap();
        assert!(store.is_complete(&step).unwrap());
        assert!(!store.is_complete(&StepName::new("createOutputStep")).unwrap());
        assert!(!dir.path().join("steps.json.tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MARKERS_FILENAME);
        std::fs::write(&path, b"not json").unwrap();
        let err = FileMarkerStore::open(path).unwrap_err();
        assert!(matches!(err, WorkflowError::Marker { .. }));
    }

    #[test]
    fn test_missing_file_means_nothing_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMarkerStore::in_dir(&dir.path().join("nested")).unwrap();
        assert!(!store.is_complete(&StepName::new("any")).unwrap());
    }
}
