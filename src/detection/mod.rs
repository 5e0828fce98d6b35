pub mod preprocessing;
pub mod enclosing;
pub mod contours;
pub mod hough;
pub mod validate;
pub mod steps;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use image::DynamicImage;
use tracing::{debug, warn};

use crate::config::{DetectionConfig, Strategy};
use crate::detection::contours::ShapeFilter;
use crate::detection::hough::HoughParams;
use crate::models::{Circle, DetectionResult, Frame};
use crate::pipeline::Pipeline;

/// Frame to validated circles. Shared by every session; runs are independent.
pub struct DetectionPipeline {
    pipeline: Pipeline,
    strategy: Strategy,
    next_id: AtomicU64,
}

impl DetectionPipeline {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let mut pipeline = build_pipeline(config);
        if let Some(dir) = &config.debug_dir {
            pipeline = pipeline.with_debug(dir.clone())?;
        }
        Ok(Self {
            pipeline,
            strategy: config.strategy,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.pipeline.step_names()
    }

    /// Run every stage on `frame`. Never panics on bad input; failures come
    /// back as an error result.
    pub fn detect(&self, frame: &Frame) -> DetectionResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        match self.find_circles(frame) {
            Ok(circles) => {
                debug!(id, frame = frame.sequence, circles = circles.len(), "detection finished");
                DetectionResult::success(id, frame, circles)
            }
            Err(e) => {
                warn!(id, frame = frame.sequence, "detection failed: {:#}", e);
                DetectionResult::error(id, frame, format!("{:#}", e))
            }
        }
    }

    fn find_circles(&self, frame: &Frame) -> Result<Vec<Circle>> {
        let input = DynamicImage::ImageRgb8(frame.image.clone());
        let items = self.pipeline.run(input)?;
        Ok(items
            .iter()
            .filter_map(|item| item.candidate.and_then(|c| c.to_circle()))
            .collect())
    }
}

/// Build the stage list for `config`
pub fn build_pipeline(config: &DetectionConfig) -> Pipeline {
    use crate::detection::steps::*;

    let mut pipeline = Pipeline::new()
        .add_step(Arc::new(GrayscaleStep))
        .add_step(Arc::new(MedianFilterStep { radius: config.median_radius }))
        .add_step(Arc::new(DarkThresholdStep {
            contrast_gain: config.contrast_gain,
            cutoff: config.dark_cutoff,
        }))
        .add_step(Arc::new(ClosingStep { radius: config.closing_radius }));

    pipeline = match config.strategy {
        Strategy::Contour => pipeline.add_step(Arc::new(ContourCandidateStep {
            filter: ShapeFilter {
                min_area: config.min_area,
                min_circularity: config.min_circularity,
            },
        })),
        Strategy::Hough => pipeline.add_step(Arc::new(HoughCandidateStep {
            params: HoughParams {
                min_radius: config.min_radius,
                max_radius: config.max_radius,
                min_center_distance: config.min_center_distance,
                min_votes: config.min_votes,
            },
        })),
    };

    if config.validate {
        pipeline = pipeline.add_step(Arc::new(RingValidationStep { validator: config.validator }));
    }

    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_follows_strategy() {
        let contour = build_pipeline(&DetectionConfig::default());
        assert_eq!(
            contour.step_names(),
            vec![
                "Grayscale Conversion",
                "Median Filter",
                "Dark Threshold",
                "Morphological Closing",
                "Contour Candidates",
                "Ring Validation",
            ]
        );

        let hough = build_pipeline(&DetectionConfig {
            strategy: Strategy::Hough,
            validate: false,
            ..DetectionConfig::default()
        });
        assert_eq!(hough.step_names().last(), Some(&"Hough Candidates"));
        assert_eq!(hough.step_names().len(), 5);
    }

    #[test]
    fn empty_frame_is_an_error_result() -> Result<()> {
        let detector = DetectionPipeline::new(&DetectionConfig::default())?;
        let result = detector.detect(&Frame::new(1, image::RgbImage::new(0, 0)));
        assert!(!result.is_success());
        assert!(result.message.unwrap_or_default().contains("empty"));
        Ok(())
    }

    #[test]
    fn result_ids_increase() -> Result<()> {
        let detector = DetectionPipeline::new(&DetectionConfig::default())?;
        let frame = Frame::new(1, image::RgbImage::from_pixel(32, 32, image::Rgb([255, 255, 255])));
        let a = detector.detect(&frame);
        let b = detector.detect(&frame);
        assert!(b.id > a.id);
        assert!(a.is_success() && a.circles.is_empty());
        Ok(())
    }
}
