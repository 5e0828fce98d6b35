//! Geometric validation of a single circle candidate.
//!
//! The validator walks `samples` points around the claimed boundary. Each
//! point is snapped radially to the nearest marker pixel of the shaped mask
//! within a search band. A candidate is accepted when
//!
//! 1. the mean grayscale brightness at the boundary points is below
//!    `dark_threshold`,
//! 2. enough of the in-bounds points found marker pixels (`min_coverage`), and
//! 3. the enclosing circle refitted through the found points stays within
//!    `max_refit_error` (relative to the claimed radius) of the claim.
//!
//! Sample points outside the image are left out of every average.

use image::GrayImage;

use crate::detection::enclosing::min_enclosing_circle;
use crate::models::Candidate;

#[derive(Debug, Clone, Copy)]
pub struct RingValidator {
    pub samples: u32,
    pub dark_threshold: f32,
    pub min_coverage: f32,
    pub max_refit_error: f32,
}

impl Default for RingValidator {
    fn default() -> Self {
        Self {
            samples: 32,
            dark_threshold: 80.0,
            min_coverage: 0.8,
            max_refit_error: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Accepted { brightness: f32, coverage: f32, refit_error: f32 },
    /// Every sample point fell outside the image.
    NoSamples,
    TooBright { brightness: f32 },
    Incomplete { coverage: f32 },
    RefitMismatch { refit_error: f32 },
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }
}

/// Radial search band around the claimed boundary, in pixels.
pub fn search_band(radius: f32) -> f32 {
    (radius * 0.1).max(3.0)
}

impl RingValidator {
    pub fn check(&self, gray: &GrayImage, mask: &GrayImage, candidate: &Candidate) -> Verdict {
        let (width, height) = gray.dimensions();
        let inside = |x: f32, y: f32| x >= 0.0 && y >= 0.0 && (x as u32) < width && (y as u32) < height;
        let band = search_band(candidate.radius);

        let mut brightness_sum = 0.0f32;
        let mut in_bounds = 0u32;
        let mut hits: Vec<(f64, f64)> = Vec::new();

        for i in 0..self.samples.max(1) {
            let angle = i as f32 / self.samples.max(1) as f32 * std::f32::consts::TAU;
            let (cos, sin) = (angle.cos(), angle.sin());
            let px = candidate.x + candidate.radius * cos;
            let py = candidate.y + candidate.radius * sin;
            if !inside(px, py) {
                continue;
            }
            in_bounds += 1;

            let snapped = snap_to_mask(mask, candidate, cos, sin, band);
            let (bx, by) = snapped.unwrap_or((px, py));
            brightness_sum += gray.get_pixel(bx as u32, by as u32)[0] as f32;
            if let Some((hx, hy)) = snapped {
                hits.push((hx as f64, hy as f64));
            }
        }

        if in_bounds == 0 {
            return Verdict::NoSamples;
        }

        let brightness = brightness_sum / in_bounds as f32;
        if brightness >= self.dark_threshold {
            return Verdict::TooBright { brightness };
        }

        let coverage = hits.len() as f32 / in_bounds as f32;
        if coverage < self.min_coverage {
            return Verdict::Incomplete { coverage };
        }

        let refit_error = match min_enclosing_circle(&hits) {
            Some(fit) => {
                let dc = ((fit.x - candidate.x as f64).powi(2) + (fit.y - candidate.y as f64).powi(2)).sqrt();
                let dr = (fit.radius - candidate.radius as f64).abs();
                ((dc + dr) / candidate.radius.max(1.0) as f64) as f32
            }
            None => f32::INFINITY,
        };
        if refit_error > self.max_refit_error {
            return Verdict::RefitMismatch { refit_error };
        }

        Verdict::Accepted { brightness, coverage, refit_error }
    }
}

/// Nearest mask foreground pixel along the ray through the claimed boundary
/// point, searching outwards from the boundary in alternating steps.
fn snap_to_mask(mask: &GrayImage, candidate: &Candidate, cos: f32, sin: f32, band: f32) -> Option<(f32, f32)> {
    let (width, height) = mask.dimensions();
    let steps = band.ceil() as i32;
    for offset in 0..=steps {
        for sign in [1, -1] {
            if offset == 0 && sign < 0 {
                continue;
            }
            let r = candidate.radius + (sign * offset) as f32;
            if r < 0.0 {
                continue;
            }
            let x = candidate.x + r * cos;
            let y = candidate.y + r * sin;
            if x < 0.0 || y < 0.0 || x as u32 >= width || y as u32 >= height {
                continue;
            }
            if mask.get_pixel(x as u32, y as u32)[0] > 0 {
                return Some((x, y));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn ring_images(size: u32, cx: f32, cy: f32, inner: f32, outer: f32, ring: u8, background: u8) -> (GrayImage, GrayImage) {
        let on_ring = |x: u32, y: u32| {
            let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
            d >= inner && d <= outer
        };
        let gray = GrayImage::from_fn(size, size, |x, y| Luma([if on_ring(x, y) { ring } else { background }]));
        let mask = GrayImage::from_fn(size, size, |x, y| Luma([if on_ring(x, y) { 255 } else { 0 }]));
        (gray, mask)
    }

    #[test]
    fn dark_complete_ring_is_accepted() {
        let (gray, mask) = ring_images(200, 100.0, 100.0, 34.0, 40.0, 20, 220);
        let candidate = Candidate { x: 100.0, y: 100.0, radius: 40.0 };
        let verdict = RingValidator::default().check(&gray, &mask, &candidate);
        assert!(verdict.is_accepted(), "{verdict:?}");
    }

    #[test]
    fn bright_boundary_is_rejected_even_with_perfect_shape() {
        // The mask says "ring" everywhere on the boundary, but the pixels are
        // mid-gray (150) against a threshold of 80.
        let (gray, mask) = ring_images(200, 100.0, 100.0, 34.0, 40.0, 150, 220);
        let candidate = Candidate { x: 100.0, y: 100.0, radius: 40.0 };
        match RingValidator::default().check(&gray, &mask, &candidate) {
            Verdict::TooBright { brightness } => assert!((brightness - 150.0).abs() < 1e-3),
            other => panic!("expected TooBright, got {other:?}"),
        }
    }

    #[test]
    fn half_ring_is_incomplete() {
        let (mut gray, mut mask) = ring_images(200, 100.0, 100.0, 34.0, 40.0, 20, 20);
        for y in 0..200 {
            for x in 0..100 {
                mask.put_pixel(x, y, Luma([0]));
                gray.put_pixel(x, y, Luma([20]));
            }
        }
        let candidate = Candidate { x: 100.0, y: 100.0, radius: 40.0 };
        let verdict = RingValidator::default().check(&gray, &mask, &candidate);
        assert!(matches!(verdict, Verdict::Incomplete { .. }), "{verdict:?}");
    }

    #[test]
    fn off_center_claim_fails_tight_refit() {
        let (gray, mask) = ring_images(200, 100.0, 100.0, 34.0, 40.0, 20, 220);
        let validator = RingValidator { max_refit_error: 0.03, ..RingValidator::default() };
        // Every ray still lands on the ring, but the found points describe a
        // circle a few pixels away from the claim.
        let candidate = Candidate { x: 104.0, y: 100.0, radius: 40.0 };
        let verdict = validator.check(&gray, &mask, &candidate);
        assert!(matches!(verdict, Verdict::RefitMismatch { .. }), "{verdict:?}");
    }

    #[test]
    fn out_of_bounds_samples_are_excluded() {
        // Ring centered on the left edge: half the samples fall outside.
        let (gray, mask) = ring_images(120, 0.0, 60.0, 34.0, 40.0, 20, 220);
        let candidate = Candidate { x: 0.0, y: 60.0, radius: 40.0 };
        let verdict = RingValidator { max_refit_error: 1.0, ..RingValidator::default() }
            .check(&gray, &mask, &candidate);
        match verdict {
            Verdict::Accepted { brightness, coverage, .. } => {
                assert!(brightness < 80.0);
                assert!(coverage >= 0.8);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn candidate_entirely_outside_has_no_samples() {
        let gray = GrayImage::new(10, 10);
        let candidate = Candidate { x: 500.0, y: 500.0, radius: 5.0 };
        assert_eq!(RingValidator::default().check(&gray, &gray, &candidate), Verdict::NoSamples);
    }
}
