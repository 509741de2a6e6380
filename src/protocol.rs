//! The local-filter job: typed inputs, the convert/run/collect steps and the
//! registered outputs.

use crate::context::Context;
use crate::convert::{image_path, materialize_mask, materialize_volume};
use crate::error::WorkflowError;
use crate::invoker::{ArgumentMap, ExternalTool};
use crate::markers::{write_atomic, FileMarkerStore};
use crate::mrc::MrcHeader;
use crate::sequencer::StepSequencer;
use crate::step::Step;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

/// Step names; they key the persisted completion markers.
pub const CONVERT_STEP: &str = "convertInputStep";
pub const RUN_STEP: &str = "runFilterStep";
pub const COLLECT_STEP: &str = "createOutputStep";

/// Registry file listing the outputs of a finished run.
pub const OUTPUTS_FILENAME: &str = "outputs.json";

/// Scratch subdirectory the filter runs in.
pub const SCRATCH_DIR: &str = "extra";

const OUTPUTS_KEY: &str = "outputs";

/// Two half-maps reconstructed from disjoint halves of the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalfMapPair {
    pub half1: PathBuf,
    pub half2: PathBuf,
    /// Å per pixel.
    pub sampling_rate: f64,
    /// Cubic box edge in pixels.
    pub dimension: usize,
}

impl HalfMapPair {
    /// Reads the dimension (and, unless given, the sampling rate) from the
    /// header of the first half-map.
    ///
    /// Locations may carry a format suffix such as `:mrc`.
    pub fn from_locations(
        half1: &str,
        half2: &str,
        sampling_rate: Option<f64>,
    ) -> Result<Self, WorkflowError> {
        let half1 = image_path(half1);
        let half2 = image_path(half2);
        let header = MrcHeader::read(&half1)?;
        let dimension = header.cubic_dimension().ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "half-map '{}' is not cubic: {:?}",
                half1.display(),
                header.dims
            ))
        })?;
        if !half2.is_file() {
            return Err(WorkflowError::Configuration(format!(
                "half-map '{}' does not exist",
                half2.display()
            )));
        }
        Ok(Self {
            half1,
            half2,
            sampling_rate: sampling_rate.unwrap_or(header.voxel_size[0] as f64),
            dimension,
        })
    }
}

/// An upstream reconstruction whose half-maps get filtered.
pub trait Reconstruction: Send + Sync + fmt::Debug {
    /// Identifier used for provenance links.
    fn id(&self) -> &str;

    fn half_maps(&self) -> &HalfMapPair;

    fn sampling_rate(&self) -> f64 {
        self.half_maps().sampling_rate
    }

    fn dimension(&self) -> usize {
        self.half_maps().dimension
    }
}

/// A finished refinement job, as described in a run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementResult {
    pub id: String,
    pub half_maps: HalfMapPair,
}

impl Reconstruction for RefinementResult {
    fn id(&self) -> &str {
        &self.id
    }

    fn half_maps(&self) -> &HalfMapPair {
        &self.half_maps
    }
}

/// Optional mask restricting the filter to a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskInput {
    pub path: PathBuf,
    /// Edge of the mask box; may differ from the half-maps.
    pub dimension: usize,
}

impl MaskInput {
    pub fn from_location(location: &str) -> Result<Self, WorkflowError> {
        let path = image_path(location);
        let header = MrcHeader::read(&path)?;
        Ok(Self {
            path,
            dimension: header.dims.0,
        })
    }
}

/// Everything the caller chooses for one job.
#[derive(Debug, Clone)]
pub struct FilterInputs {
    reconstruction: Arc<dyn Reconstruction>,
    mask: Option<MaskInput>,
    snr_weighting: bool,
    threads: usize,
}

impl FilterInputs {
    /// Bundles the job inputs.
    ///
    /// Only the thread count is checked; the half-maps and mask were already
    /// read when their descriptions were built.
    pub fn new(
        reconstruction: Arc<dyn Reconstruction>,
        mask: Option<MaskInput>,
        snr_weighting: bool,
        threads: usize,
    ) -> Result<Self, WorkflowError> {
        if threads == 0 {
            return Err(WorkflowError::Configuration(
                "thread count must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            reconstruction,
            mask,
            snr_weighting,
            threads,
        })
    }

    pub fn reconstruction(&self) -> &dyn Reconstruction {
        self.reconstruction.as_ref()
    }

    pub fn mask(&self) -> Option<&MaskInput> {
        self.mask.as_ref()
    }

    pub fn snr_weighting(&self) -> bool {
        self.snr_weighting
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

/// Names of the files in the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLayout {
    pub half1: String,
    pub half2: String,
    pub mask: String,
    /// Names the filter gives its outputs.
    pub out_half1: String,
    pub out_half2: String,
}

impl Default for FileLayout {
    fn default() -> Self {
        Self {
            half1: "half1_unfil.mrc".to_string(),
            half2: "half2_unfil.mrc".to_string(),
            mask: "mask.mrc".to_string(),
            out_half1: "half1_unfil_sidesplitter.mrc".to_string(),
            out_half2: "half2_unfil_sidesplitter.mrc".to_string(),
        }
    }
}

/// The filter's arguments for one job, relative to the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParameters {
    pub half1: String,
    pub half2: String,
    pub mask: Option<String>,
    pub snr_weighting: bool,
    pub threads: usize,
}

impl RunParameters {
    fn new(inputs: &FilterInputs, layout: &FileLayout) -> Self {
        Self {
            half1: layout.half1.clone(),
            half2: layout.half2.clone(),
            mask: inputs.mask().map(|_| layout.mask.clone()),
            snr_weighting: inputs.snr_weighting(),
            threads: inputs.threads(),
        }
    }

    /// `--v1 <half1> --v2 <half2> [--mask <mask>] [--spectrum ]`
    pub fn argument_map(&self) -> ArgumentMap {
        let mut args = ArgumentMap::new();
        args.insert("--v1", basename(&self.half1))
            .insert("--v2", basename(&self.half2));
        if let Some(mask) = &self.mask {
            args.insert("--mask", basename(mask));
        }
        if self.snr_weighting {
            args.switch("--spectrum");
        }
        args
    }
}

fn basename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// A registered output volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputVolume {
    pub label: String,
    pub path: PathBuf,
    pub sampling_rate: f64,
    pub dimension: usize,
    /// Id of the reconstruction this volume was derived from.
    pub derived_from: String,
}

/// The two filtered half-maps of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredOutputPair {
    pub half1: OutputVolume,
    pub half2: OutputVolume,
}

impl FilteredOutputPair {
    pub fn iter(&self) -> impl Iterator<Item = &OutputVolume> {
        [&self.half1, &self.half2].into_iter()
    }
}

/// Provenance edge from an upstream object to a registered output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRelation {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputRegistry {
    outputs: FilteredOutputPair,
    relations: Vec<SourceRelation>,
}

/// Whether a job has produced its outputs yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Summary {
    Ready,
    NotReady,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Summary::Ready => write!(f, "Created locally filtered half-maps."),
            Summary::NotReady => write!(f, "Output is not ready"),
        }
    }
}

#[derive(Debug)]
struct RunPlan {
    inputs: FilterInputs,
    layout: FileLayout,
    run_dir: PathBuf,
    params: RunParameters,
}

impl RunPlan {
    fn scratch(&self) -> PathBuf {
        self.run_dir.join(SCRATCH_DIR)
    }

    fn scratch_file(&self, name: &str) -> PathBuf {
        self.scratch().join(name)
    }

    fn registry_path(&self) -> PathBuf {
        self.run_dir.join(OUTPUTS_FILENAME)
    }
}

/// Converts the half-maps (and mask) into the scratch directory.
#[derive(Debug)]
struct ConvertInputStep {
    plan: Arc<RunPlan>,
}

#[async_trait]
impl Step for ConvertInputStep {
    async fn execute(&self, _ctx: &mut Context) -> Result<(), WorkflowError> {
        let plan = self.plan.clone();
        tokio::task::spawn_blocking(move || -> Result<(), WorkflowError> {
            let half_maps = plan.inputs.reconstruction().half_maps();
            if let Some(mask) = plan.inputs.mask() {
                materialize_mask(
                    &mask.path,
                    &plan.scratch_file(&plan.layout.mask),
                    Some(half_maps.dimension),
                )?;
            }
            materialize_volume(&half_maps.half1, &plan.scratch_file(&plan.layout.half1))?;
            materialize_volume(&half_maps.half2, &plan.scratch_file(&plan.layout.half2))?;
            Ok(())
        })
        .await
        .map_err(|e| WorkflowError::StepError {
            step_name: CONVERT_STEP.into(),
            details: e.to_string(),
        })?
    }
}

/// Runs the filter binary in the scratch directory.
#[derive(Debug)]
struct RunFilterStep {
    plan: Arc<RunPlan>,
    tool: ExternalTool,
}

#[async_trait]
impl Step for RunFilterStep {
    async fn execute(&self, _ctx: &mut Context) -> Result<(), WorkflowError> {
        let args = self.plan.params.argument_map();
        self.tool
            .invoke(&args, &self.plan.scratch(), self.plan.params.threads)
            .await
    }
}

/// Checks the filter outputs and registers them.
#[derive(Debug)]
struct CreateOutputStep {
    plan: Arc<RunPlan>,
}

impl CreateOutputStep {
    fn output(&self, label: &str, name: &str) -> Result<OutputVolume, WorkflowError> {
        let path = self.plan.scratch_file(name);
        let header = MrcHeader::read_complete(&path).map_err(|e| WorkflowError::MissingOutput {
            path: path.clone(),
            details: e.to_string(),
        })?;
        let reconstruction = self.plan.inputs.reconstruction();
        Ok(OutputVolume {
            label: label.to_string(),
            path,
            sampling_rate: reconstruction.sampling_rate(),
            dimension: header.dims.0,
            derived_from: reconstruction.id().to_string(),
        })
    }
}

#[async_trait]
impl Step for CreateOutputStep {
    async fn execute(&self, ctx: &mut Context) -> Result<(), WorkflowError> {
        let outputs = FilteredOutputPair {
            half1: self.output("Filtered half-map 1", &self.plan.layout.out_half1)?,
            half2: self.output("Filtered half-map 2", &self.plan.layout.out_half2)?,
        };
        let relations = outputs
            .iter()
            .map(|vol| SourceRelation {
                source: vol.derived_from.clone(),
                target: vol.label.clone(),
            })
            .collect();

        let registry = OutputRegistry {
            outputs: outputs.clone(),
            relations,
        };
        let path = self.plan.registry_path();
        let json = serde_json::to_vec_pretty(&registry).map_err(|e| WorkflowError::Marker {
            path: path.clone(),
            details: e.to_string(),
        })?;
        write_atomic(&path, &json).map_err(|e| WorkflowError::Marker {
            path: path.clone(),
            details: e.to_string(),
        })?;

        info!("Registered {} and {}", outputs.half1.label, outputs.half2.label);
        ctx.insert(OUTPUTS_KEY, outputs);
        Ok(())
    }
}

/// Filters the half-maps of one reconstruction, resumably.
///
/// Files live under `run_dir`: converted inputs and the filter outputs in
/// `extra/`, completion markers in `steps.json`, the registered outputs in
/// `outputs.json`.
#[derive(Debug)]
pub struct LocalFilterJob {
    plan: Arc<RunPlan>,
    tool: ExternalTool,
}

impl LocalFilterJob {
    pub fn new(
        inputs: FilterInputs,
        layout: FileLayout,
        run_dir: impl Into<PathBuf>,
        tool: ExternalTool,
    ) -> Self {
        let run_dir = run_dir.into();
        let params = RunParameters::new(&inputs, &layout);
        let tool = tool.with_log_file(run_dir.join("run.log"));
        Self {
            plan: Arc::new(RunPlan {
                inputs,
                layout,
                run_dir,
                params,
            }),
            tool,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.plan.run_dir
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.plan.scratch()
    }

    pub fn run_parameters(&self) -> &RunParameters {
        &self.plan.params
    }

    /// A sequencer with the convert, run and collect steps registered,
    /// backed by the markers in the run directory.
    pub fn sequencer(&self) -> Result<StepSequencer<FileMarkerStore>, WorkflowError> {
        let mut sequencer = StepSequencer::new(FileMarkerStore::in_dir(&self.plan.run_dir)?);
        sequencer
            .register(
                CONVERT_STEP,
                ConvertInputStep {
                    plan: self.plan.clone(),
                },
            )?
            .register(
                RUN_STEP,
                RunFilterStep {
                    plan: self.plan.clone(),
                    tool: self.tool.clone(),
                },
            )?
            .register(
                COLLECT_STEP,
                CreateOutputStep {
                    plan: self.plan.clone(),
                },
            )?;
        Ok(sequencer)
    }

    /// Runs every step not yet completed and returns the registered outputs.
    #[instrument(level = "info", skip(self), fields(run_dir = %self.plan.run_dir.display()))]
    pub async fn run(&self) -> Result<FilteredOutputPair, WorkflowError> {
        std::fs::create_dir_all(self.plan.scratch()).map_err(|e| {
            WorkflowError::Configuration(format!(
                "cannot create '{}': {e}",
                self.plan.scratch().display()
            ))
        })?;
        let mut sequencer = self.sequencer()?;
        let mut ctx = Context::new();
        let report = sequencer.run(&mut ctx).await?;
        info!(
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "Filter job finished"
        );
        self.collect(&mut ctx)
    }

    /// Continues after a failure; completed steps are skipped.
    pub async fn resume(&self) -> Result<FilteredOutputPair, WorkflowError> {
        info!("Resuming filter job in {}", self.plan.run_dir.display());
        self.run().await
    }

    /// The registered outputs, if the job has finished.
    pub fn outputs(&self) -> Result<Option<FilteredOutputPair>, WorkflowError> {
        Ok(self.load_registry()?.map(|registry| registry.outputs))
    }

    /// Provenance edges recorded for the outputs.
    pub fn relations(&self) -> Result<Vec<SourceRelation>, WorkflowError> {
        Ok(self
            .load_registry()?
            .map(|registry| registry.relations)
            .unwrap_or_default())
    }

    fn load_registry(&self) -> Result<Option<OutputRegistry>, WorkflowError> {
        let path = self.plan.registry_path();
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
            .map(Some)
            .map_err(|details| WorkflowError::Marker { path, details })
    }

    /// Forgets completed steps and registered outputs so the next run
    /// starts again from conversion. Scratch files are left in place and
    /// overwritten by that run.
    pub fn reset(&self) -> Result<(), WorkflowError> {
        self.sequencer()?.reset()?;
        let registry = self.plan.registry_path();
        if registry.exists() {
            std::fs::remove_file(&registry).map_err(|e| WorkflowError::Marker {
                path: registry.clone(),
                details: e.to_string(),
            })?;
        }
        info!("Reset filter job in {}", self.plan.run_dir.display());
        Ok(())
    }

    pub fn summary(&self) -> Summary {
        match self.outputs() {
            Ok(Some(_)) => Summary::Ready,
            _ => Summary::NotReady,
        }
    }

    fn collect(&self, ctx: &mut Context) -> Result<FilteredOutputPair, WorkflowError> {
        if let Some(outputs) = ctx.remove::<FilteredOutputPair>(OUTPUTS_KEY) {
            return Ok(outputs);
        }
        self.outputs()?.ok_or_else(|| WorkflowError::MissingOutput {
            path: self.plan.registry_path(),
            details: "collect step is marked complete but no outputs are registered".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::ToolEnviron;
    use crate::mrc::Volume;

    fn reconstruction(dir: &Path, dim: usize) -> Arc<dyn Reconstruction> {
        let half1 = dir.join("run_half1_class001.mrc");
        let half2 = dir.join("run_half2_class001.mrc");
        Volume::filled(dim, 3.0, 0.1).write(&half1).unwrap();
        Volume::filled(dim, 3.0, 0.2).write(&half2).unwrap();
        let location1 = format!("{}:mrc", half1.display());
        let location2 = format!("{}:mrc", half2.display());
        Arc::new(RefinementResult {
            id: "auto-refine".to_string(),
            half_maps: HalfMapPair::from_locations(&location1, &location2, None).unwrap(),
        })
    }

    #[test]
    fn test_half_maps_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let rec = reconstruction(dir.path(), 8);
        assert_eq!(rec.dimension(), 8);
        assert!((rec.sampling_rate() - 3.0).abs() < 1e-4);
        assert!(rec.half_maps().half1.ends_with("run_half1_class001.mrc"));
    }

    #[test]
    fn test_argument_map_without_mask() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = FilterInputs::new(reconstruction(dir.path(), 4), None, false, 1).unwrap();
        let params = RunParameters::new(&inputs, &FileLayout::default());
        assert_eq!(
            params.argument_map().to_string(),
            "--v1 half1_unfil.mrc --v2 half2_unfil.mrc"
        );
    }

    #[test]
    fn test_argument_map_with_mask_and_spectrum() {
        let dir = tempfile::tempdir().unwrap();
        let mask_path = dir.path().join("mask.mrc");
        Volume::filled(4, 3.0, 1.0).write(&mask_path).unwrap();
        let mask = MaskInput::from_location(mask_path.to_str().unwrap()).unwrap();
        let inputs =
            FilterInputs::new(reconstruction(dir.path(), 4), Some(mask), true, 2).unwrap();
        let params = RunParameters::new(&inputs, &FileLayout::default());
        assert_eq!(
            params.argument_map().to_string(),
            "--v1 half1_unfil.mrc --v2 half2_unfil.mrc --mask mask.mrc --spectrum "
        );
        assert_eq!(params.threads, 2);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = FilterInputs::new(reconstruction(dir.path(), 4), None, false, 0).unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }

    #[test]
    fn test_non_cubic_half_map_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let half = dir.path().join("slab.mrc");
        Volume::new((4, 4, 2), 1.0, vec![0.0; 32])
            .unwrap()
            .write(&half)
            .unwrap();
        let location = half.to_str().unwrap();
        let err = HalfMapPair::from_locations(location, location, Some(1.0)).unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }

    #[test]
    fn test_summary_before_run() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = FilterInputs::new(reconstruction(dir.path(), 4), None, false, 1).unwrap();
        let job = LocalFilterJob::new(
            inputs,
            FileLayout::default(),
            dir.path().join("job"),
            ExternalTool::new("sidesplitter", ToolEnviron::new()),
        );
        assert_eq!(job.summary(), Summary::NotReady);
        assert_eq!(job.summary().to_string(), "Output is not ready");
        assert!(job.outputs().unwrap().is_none());

        let sequencer = job.sequencer().unwrap();
        let names: Vec<_> = sequencer.step_names().map(|n| n.as_str()).collect();
        assert_eq!(names, vec![CONVERT_STEP, RUN_STEP, COLLECT_STEP]);
    }
}
