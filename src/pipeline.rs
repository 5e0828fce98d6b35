use image::{DynamicImage, GrayImage};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use anyhow::{Context, Result};
use tracing::debug;

use crate::models::Candidate;

/// Data that flows through the pipeline.
/// Before candidate extraction there is a single item holding the current
/// stage image; afterwards each item represents one circle candidate.
#[derive(Clone)]
pub struct PipelineData {
    /// Stage image (grayscale/binary), or a crop around the candidate
    pub image: DynamicImage,

    /// The frame the run started from (shared efficiently via Arc)
    pub original: Arc<DynamicImage>,

    /// Grayscale reduction of the original, set by the grayscale stage
    pub gray: Option<Arc<GrayImage>>,

    /// Binary marker mask after morphological shaping
    pub mask: Option<Arc<GrayImage>>,

    /// Candidate circle (None until candidate extraction)
    pub candidate: Option<Candidate>,

    /// Diagnostics recorded by the steps (e.g. "circularity", "brightness")
    pub metadata: HashMap<String, MetadataValue>,
}

/// Metadata value types
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Bool(bool),
    Float(f32),
    Int(i64),
}

impl PipelineData {
    /// Create PipelineData for a full image
    pub fn from_image(image: DynamicImage) -> Self {
        let original = Arc::new(image.clone());
        Self {
            image,
            original,
            gray: None,
            mask: None,
            candidate: None,
            metadata: HashMap::new(),
        }
    }

    /// Derive a per-candidate item from a stage item
    pub fn for_candidate(&self, image: DynamicImage, candidate: Candidate) -> Self {
        Self {
            image,
            original: self.original.clone(),
            gray: self.gray.clone(),
            mask: self.mask.clone(),
            candidate: Some(candidate),
            metadata: self.metadata.clone(),
        }
    }

    /// Replace the stage image, keeping everything else
    pub fn with_image(mut self, image: DynamicImage) -> Self {
        self.image = image;
        self
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: MetadataValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Get metadata as float
    pub fn get_float(&self, key: &str) -> Option<f32> {
        match self.metadata.get(key) {
            Some(MetadataValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get metadata as bool
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.metadata.get(key) {
            Some(MetadataValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Grayscale image, failing if the grayscale stage has not run yet
    pub fn require_gray(&self) -> Result<&Arc<GrayImage>> {
        self.gray
            .as_ref()
            .context("grayscale stage must run before this step")
    }

    /// Marker mask, failing if the shaping stage has not run yet
    pub fn require_mask(&self) -> Result<&Arc<GrayImage>> {
        self.mask
            .as_ref()
            .context("morphological shaping must run before this step")
    }
}

/// Debug configuration for pipeline execution
#[derive(Clone, Debug)]
pub struct DebugConfig {
    /// Root directory for debug outputs; each run gets its own subdirectory
    pub output_dir: PathBuf,
}

/// Context available to all pipeline steps
#[derive(Clone)]
pub struct PipelineContext {
    pub run_id: u64,
    pub debug: Option<DebugConfig>,
}

impl PipelineContext {
    fn run_dir(&self) -> Option<PathBuf> {
        self.debug
            .as_ref()
            .map(|d| d.output_dir.join(format!("run-{:06}", self.run_id)))
    }
}

/// Trait that all pipeline steps must implement
pub trait PipelineStep: Send + Sync {
    /// Process data and return transformed data
    /// Steps can split data (1 → many), filter (many → fewer), or transform (many → many)
    fn process(&self, data: Vec<PipelineData>, context: &PipelineContext) -> Result<Vec<PipelineData>>;

    /// Human-readable name for this step (used in logs and debug directories)
    fn name(&self) -> &str;
}

/// Composable pipeline builder
pub struct Pipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
    debug: Option<DebugConfig>,
    runs: AtomicU64,
}

impl Pipeline {
    /// Create a new empty pipeline
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            debug: None,
            runs: AtomicU64::new(0),
        }
    }

    /// Enable debug mode with output directory
    /// The directory must be empty or non-existent
    pub fn with_debug(mut self, output_dir: PathBuf) -> Result<Self> {
        if output_dir.exists() {
            let entries = std::fs::read_dir(&output_dir)?;
            if entries.count() > 0 {
                return Err(anyhow::anyhow!(
                    "Debug directory is not empty: {}",
                    output_dir.display()
                ));
            }
        } else {
            std::fs::create_dir_all(&output_dir)?;
        }

        self.debug = Some(DebugConfig { output_dir });
        Ok(self)
    }

    /// Add a processing step to the pipeline
    pub fn add_step(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Helper method to add a step from a Box (for convenience)
    pub fn add_step_boxed(mut self, step: Box<dyn PipelineStep>) -> Self {
        self.steps.push(Arc::from(step));
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Number of runs started so far
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Run the pipeline sequentially on an input image.
    /// Safe to call from several threads at once; every run is independent.
    pub fn run(&self, input: DynamicImage) -> Result<Vec<PipelineData>> {
        let context = PipelineContext {
            run_id: self.runs.fetch_add(1, Ordering::Relaxed) + 1,
            debug: self.debug.clone(),
        };

        if let Some(run_dir) = context.run_dir() {
            let input_dir = run_dir.join("00_input");
            std::fs::create_dir_all(&input_dir)?;
            input
                .save(input_dir.join("01.png"))
                .map_err(|e| anyhow::anyhow!("Failed to save debug input: {}", e))?;
        }

        // Start with a single PipelineData containing the full image
        let mut data = vec![PipelineData::from_image(input)];

        for (step_idx, step) in self.steps.iter().enumerate() {
            let step_name = step.name();
            let before = data.len();
            data = step
                .process(data, &context)
                .with_context(|| format!("step '{}' failed", step_name))?;
            debug!(run = context.run_id, step = step_name, before, after = data.len(), "pipeline step");

            if let Some(run_dir) = context.run_dir() {
                save_step_outputs(&run_dir, step_idx, step_name, &data)?;
            }
        }

        Ok(data)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn save_step_outputs(run_dir: &std::path::Path, step_idx: usize, step_name: &str, data: &[PipelineData]) -> Result<()> {
    let step_dir_name = format!("{:02}_{}", step_idx + 1, step_name.to_lowercase().replace(' ', "_"));
    let step_dir = run_dir.join(&step_dir_name);
    std::fs::create_dir_all(&step_dir)?;

    for (idx, item) in data.iter().enumerate() {
        let output_path = step_dir.join(format!("{:02}.png", idx + 1));
        item.image
            .save(&output_path)
            .map_err(|e| anyhow::anyhow!("Failed to save debug image: {}", e))?;
    }

    debug!("saved {} debug images to {}", data.len(), step_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Split;

    impl PipelineStep for Split {
        fn process(&self, data: Vec<PipelineData>, _context: &PipelineContext) -> Result<Vec<PipelineData>> {
            let mut out = Vec::new();
            for item in data {
                for i in 0..3 {
                    let candidate = Candidate { x: i as f32, y: 0.0, radius: 1.0 };
                    out.push(item.for_candidate(item.image.clone(), candidate));
                }
            }
            Ok(out)
        }

        fn name(&self) -> &str {
            "Split Three"
        }
    }

    struct Fail;

    impl PipelineStep for Fail {
        fn process(&self, _data: Vec<PipelineData>, _context: &PipelineContext) -> Result<Vec<PipelineData>> {
            anyhow::bail!("boom")
        }

        fn name(&self) -> &str {
            "Fail"
        }
    }

    #[test]
    fn steps_run_in_order_and_split() -> Result<()> {
        let pipeline = Pipeline::new().add_step(Arc::new(Split));
        let out = pipeline.run(DynamicImage::new_luma8(4, 4))?;
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].candidate.map(|c| c.x), Some(2.0));
        assert_eq!(pipeline.runs(), 1);
        Ok(())
    }

    #[test]
    fn step_errors_name_the_step() {
        let pipeline = Pipeline::new().add_step_boxed(Box::new(Fail));
        let err = pipeline.run(DynamicImage::new_luma8(4, 4)).err().unwrap();
        assert!(format!("{err:#}").contains("step 'Fail' failed"));
    }

    #[test]
    fn debug_outputs_are_written_per_run() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let pipeline = Pipeline::new()
            .add_step(Arc::new(Split))
            .with_debug(dir.path().join("dump"))?;
        pipeline.run(DynamicImage::new_luma8(4, 4))?;
        pipeline.run(DynamicImage::new_luma8(4, 4))?;

        let run2 = dir.path().join("dump/run-000002");
        assert!(run2.join("00_input/01.png").exists());
        assert!(run2.join("01_split_three/03.png").exists());
        Ok(())
    }

    #[test]
    fn debug_dir_must_be_empty() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::write(dir.path().join("junk.txt"), "x")?;
        assert!(Pipeline::new().with_debug(dir.path().to_path_buf()).is_err());
        Ok(())
    }
}
