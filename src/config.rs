//! Run configuration files.

use crate::error::WorkflowError;
use crate::plugin::ToolPlugin;
use crate::protocol::{FileLayout, FilterInputs, HalfMapPair, LocalFilterJob, MaskInput, RefinementResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Configuration for one filter job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The refinement whose half-maps are filtered
    pub reconstruction: ReconstructionConfig,

    /// Optional mask location
    #[serde(default)]
    pub mask: Option<String>,

    /// Output the SNR-weighted spectrum instead of matching the input spectrum
    #[serde(default)]
    pub snr_weighting: bool,

    /// OpenMP threads for the filter
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Directory holding scratch files, markers and the output registry
    pub run_dir: PathBuf,

    #[serde(default)]
    pub tool: ToolConfig,

    #[serde(default)]
    pub layout: FileLayout,
}

/// Upstream refinement description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    /// Identifier recorded on the outputs' provenance links
    #[serde(default = "default_reconstruction_id")]
    pub id: String,

    /// First half-map, optionally with a `:mrc` suffix
    pub half1: String,

    /// Second half-map
    pub half2: String,

    /// Å/pixel; read from the half-map header when omitted
    #[serde(default)]
    pub sampling_rate: Option<f64>,
}

/// Where the filter binary is installed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Tool home; defaults to `SIDESPLITTER_HOME` and friends
    #[serde(default)]
    pub home: Option<PathBuf>,
}

fn default_threads() -> usize {
    1
}

fn default_reconstruction_id() -> String {
    "refinement".to_string()
}

impl Config {
    /// Loads a YAML or JSON file, chosen by extension (YAML otherwise).
    pub fn from_file(path: &Path) -> Result<Self, WorkflowError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::Configuration(format!("cannot read '{}': {e}", path.display()))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, WorkflowError> {
        serde_yaml::from_str(yaml).map_err(|e| WorkflowError::Configuration(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, WorkflowError> {
        serde_json::from_str(json).map_err(|e| WorkflowError::Configuration(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String, WorkflowError> {
        serde_yaml::to_string(self).map_err(|e| WorkflowError::Configuration(e.to_string()))
    }

    /// A commented-out-free example to start from.
    pub fn sample() -> Self {
        Self {
            reconstruction: ReconstructionConfig {
                id: "auto-refine".to_string(),
                half1: "Refine3D/job001/run_half1_class001_unfil.mrc".to_string(),
                half2: "Refine3D/job001/run_half2_class001_unfil.mrc".to_string(),
                sampling_rate: None,
            },
            mask: Some("MaskCreate/job002/mask.mrc".to_string()),
            snr_weighting: false,
            threads: default_threads(),
            run_dir: PathBuf::from("LocalFilter/job003"),
            tool: ToolConfig::default(),
            layout: FileLayout::default(),
        }
    }

    /// Checks values that need no file access.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.threads == 0 {
            return Err(WorkflowError::Configuration(
                "threads must be at least 1".to_string(),
            ));
        }
        if self.run_dir.as_os_str().is_empty() {
            return Err(WorkflowError::Configuration("run_dir must be set".to_string()));
        }
        if matches!(self.reconstruction.sampling_rate, Some(rate) if rate <= 0.0) {
            return Err(WorkflowError::Configuration(
                "sampling_rate must be positive".to_string(),
            ));
        }

        let layout = &self.layout;
        let names = [
            &layout.half1,
            &layout.half2,
            &layout.mask,
            &layout.out_half1,
            &layout.out_half2,
        ];
        if names.iter().any(|n| n.is_empty()) {
            return Err(WorkflowError::Configuration(
                "layout file names must not be empty".to_string(),
            ));
        }
        for (i, a) in names.iter().enumerate() {
            if names[i + 1..].contains(a) {
                return Err(WorkflowError::Configuration(format!(
                    "layout file name '{a}' is used twice"
                )));
            }
        }
        Ok(())
    }

    /// Tool location from the config, else from the environment.
    pub fn plugin(&self) -> ToolPlugin {
        match &self.tool.home {
            Some(home) => ToolPlugin::with_home(home),
            None => ToolPlugin::from_env(),
        }
    }

    /// Reads the input headers and assembles the job.
    pub fn build_job(&self) -> Result<LocalFilterJob, WorkflowError> {
        self.validate()?;
        let rec = &self.reconstruction;
        let reconstruction = RefinementResult {
            id: rec.id.clone(),
            half_maps: HalfMapPair::from_locations(&rec.half1, &rec.half2, rec.sampling_rate)?,
        };
        let mask = self
            .mask
            .as_deref()
            .map(MaskInput::from_location)
            .transpose()?;
        let inputs = FilterInputs::new(Arc::new(reconstruction), mask, self.snr_weighting, self.threads)?;
        Ok(LocalFilterJob::new(
            inputs,
            self.layout.clone(),
            self.run_dir.clone(),
            self.plugin().tool(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = Config::from_yaml(
            r#"
reconstruction:
  half1: a.mrc
  half2: b.mrc
run_dir: out
"#,
        )
        .unwrap();
        assert_eq!(config.threads, 1);
        assert!(!config.snr_weighting);
        assert_eq!(config.mask, None);
        assert_eq!(config.reconstruction.id, "refinement");
        assert_eq!(config.layout, FileLayout::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_sample_round_trips_through_yaml() {
        let sample = Config::sample();
        let yaml = sample.to_yaml().unwrap();
        assert_eq!(Config::from_yaml(&yaml).unwrap(), sample);
    }

    #[test]
    fn test_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(
            &path,
            r#"{"reconstruction": {"half1": "a.mrc", "half2": "b.mrc"}, "run_dir": "x", "threads": 8}"#,
        )
        .unwrap();
        assert_eq!(Config::from_file(&path).unwrap().threads, 8);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::sample();
        config.threads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::sample();
        config.layout.out_half1 = config.layout.half1.clone();
        assert!(config.validate().is_err());

        let mut config = Config::sample();
        config.reconstruction.sampling_rate = Some(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_job_reports_missing_half_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::sample();
        config.reconstruction.half1 = dir.path().join("nope.mrc").display().to_string();
        config.run_dir = dir.path().join("job");
        let err = config.build_job().unwrap_err();
        assert!(matches!(err, WorkflowError::Conversion(_)));
    }
}
