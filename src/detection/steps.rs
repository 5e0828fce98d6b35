use crate::pipeline::{PipelineData, PipelineStep, PipelineContext, MetadataValue};
use crate::detection::{preprocessing, contours, hough};
use crate::detection::contours::ShapeFilter;
use crate::detection::hough::HoughParams;
use crate::detection::validate::{RingValidator, Verdict};
use crate::models::Candidate;
use anyhow::Result;
use image::{DynamicImage, GrayImage};
use std::sync::Arc;
use tracing::debug;

/// Padding around a candidate when cropping its debug image
const CANDIDATE_PADDING: u32 = 10;

fn crop_candidate(gray: &GrayImage, candidate: &Candidate) -> DynamicImage {
    match candidate.bounds(CANDIDATE_PADDING, gray.width(), gray.height()) {
        Some((x, y, w, h)) => {
            DynamicImage::ImageLuma8(image::imageops::crop_imm(gray, x, y, w, h).to_image())
        }
        None => DynamicImage::new_luma8(1, 1),
    }
}

/// Convert image to grayscale
pub struct GrayscaleStep;

impl PipelineStep for GrayscaleStep {
    fn process(&self, data: Vec<PipelineData>, _context: &PipelineContext) -> Result<Vec<PipelineData>> {
        let mut result = Vec::new();
        for mut item in data {
            let (width, height) = (item.image.width(), item.image.height());
            if width == 0 || height == 0 {
                anyhow::bail!("cannot process an empty {}x{} frame", width, height);
            }
            let gray = Arc::new(preprocessing::to_grayscale(&item.image));
            item.gray = Some(gray.clone());
            result.push(item.with_image(DynamicImage::ImageLuma8((*gray).clone())));
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        "Grayscale Conversion"
    }
}

/// Rank (median) filter
pub struct MedianFilterStep {
    pub radius: u32,
}

impl PipelineStep for MedianFilterStep {
    fn process(&self, data: Vec<PipelineData>, _context: &PipelineContext) -> Result<Vec<PipelineData>> {
        let mut result = Vec::new();
        for item in data {
            let gray = item.image.to_luma8();
            let filtered = preprocessing::suppress_noise(&gray, self.radius);
            result.push(item.with_image(DynamicImage::ImageLuma8(filtered)));
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        "Median Filter"
    }
}

/// Threshold dark pixels into a binary marker mask
pub struct DarkThresholdStep {
    pub contrast_gain: f32,
    pub cutoff: u8,
}

impl PipelineStep for DarkThresholdStep {
    fn process(&self, data: Vec<PipelineData>, _context: &PipelineContext) -> Result<Vec<PipelineData>> {
        let mut result = Vec::new();
        for item in data {
            let gray = item.image.to_luma8();
            let dark = preprocessing::isolate_dark(&gray, self.contrast_gain, self.cutoff);
            result.push(item.with_image(DynamicImage::ImageLuma8(dark)));
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        "Dark Threshold"
    }
}

/// Dilate then erode the mask; the result becomes the shared marker mask
pub struct ClosingStep {
    pub radius: u8,
}

impl PipelineStep for ClosingStep {
    fn process(&self, data: Vec<PipelineData>, _context: &PipelineContext) -> Result<Vec<PipelineData>> {
        let mut result = Vec::new();
        for mut item in data {
            let mask = item.image.to_luma8();
            let closed = Arc::new(preprocessing::close_gaps(&mask, self.radius));
            item.mask = Some(closed.clone());
            result.push(item.with_image(DynamicImage::ImageLuma8((*closed).clone())));
        }
        Ok(result)
    }

    fn name(&self) -> &str {
        "Morphological Closing"
    }
}

/// External contours filtered by area and circularity - splits one mask into many candidates
pub struct ContourCandidateStep {
    pub filter: ShapeFilter,
}

impl PipelineStep for ContourCandidateStep {
    fn process(&self, data: Vec<PipelineData>, _context: &PipelineContext) -> Result<Vec<PipelineData>> {
        let mut result = Vec::new();

        for item in data {
            let mask = item.require_mask()?.clone();
            let gray = item.require_gray()?.clone();

            for found in contours::find_candidates(&mask, &self.filter) {
                let crop = crop_candidate(&gray, &found.circle);
                let candidate_data = item
                    .for_candidate(crop, found.circle)
                    .with_metadata("area", MetadataValue::Float(found.shape.area as f32))
                    .with_metadata("perimeter", MetadataValue::Float(found.shape.perimeter as f32))
                    .with_metadata("circularity", MetadataValue::Float(found.shape.circularity() as f32));
                result.push(candidate_data);
            }
        }

        Ok(result)
    }

    fn name(&self) -> &str {
        "Contour Candidates"
    }
}

/// Circle transform over the marker mask - splits one mask into many candidates
pub struct HoughCandidateStep {
    pub params: HoughParams,
}

impl PipelineStep for HoughCandidateStep {
    fn process(&self, data: Vec<PipelineData>, _context: &PipelineContext) -> Result<Vec<PipelineData>> {
        let mut result = Vec::new();

        for item in data {
            let mask = item.require_mask()?.clone();
            let gray = item.require_gray()?.clone();

            for found in hough::find_circles(&mask, &self.params) {
                let crop = crop_candidate(&gray, &found.candidate);
                let candidate_data = item
                    .for_candidate(crop, found.candidate)
                    .with_metadata("votes", MetadataValue::Int(found.votes as i64));
                result.push(candidate_data);
            }
        }

        Ok(result)
    }

    fn name(&self) -> &str {
        "Hough Candidates"
    }
}

/// Keep only candidates whose boundary is a dark, complete ring
pub struct RingValidationStep {
    pub validator: RingValidator,
}

impl PipelineStep for RingValidationStep {
    fn process(&self, data: Vec<PipelineData>, context: &PipelineContext) -> Result<Vec<PipelineData>> {
        let mut result = Vec::new();

        for item in data {
            let Some(candidate) = item.candidate else {
                anyhow::bail!("ring validation needs candidates; run an extraction step first");
            };
            let gray = item.require_gray()?.clone();
            let mask = item.require_mask()?.clone();

            match self.validator.check(&gray, &mask, &candidate) {
                Verdict::Accepted { brightness, coverage, refit_error } => {
                    let accepted = item
                        .with_metadata("valid", MetadataValue::Bool(true))
                        .with_metadata("brightness", MetadataValue::Float(brightness))
                        .with_metadata("coverage", MetadataValue::Float(coverage))
                        .with_metadata("refit_error", MetadataValue::Float(refit_error));
                    result.push(accepted);
                }
                rejected => {
                    debug!(run = context.run_id, x = candidate.x, y = candidate.y, r = candidate.radius, verdict = ?rejected, "candidate rejected");
                }
            }
        }

        Ok(result)
    }

    fn name(&self) -> &str {
        "Ring Validation"
    }
}
