//! Gradient circle transform over a binary marker mask.
//!
//! Every edge pixel votes for centers along its gradient line (both
//! directions, so inner and outer ring edges agree) for each radius in the
//! configured range. Peaks are taken in descending vote order and must keep
//! `min_center_distance` from every accepted center. Votes smear over a
//! wide area, so each peak is refined to the nearby point whose edges agree
//! best on one distance; that distance becomes the radius.

use image::GrayImage;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

use crate::models::Candidate;

#[derive(Debug, Clone, Copy)]
pub struct HoughParams {
    pub min_radius: u32,
    pub max_radius: u32,
    pub min_center_distance: f32,
    pub min_votes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoughCircle {
    pub candidate: Candidate,
    pub votes: u32,
}

// Sobel response of a 0/255 step is up to 1020; anything above a quarter of
// that is a mask boundary.
const EDGE_MAGNITUDE: f32 = 255.0;

/// Half-width of the square searched around an accumulator peak.
const REFINE_WINDOW: u32 = 5;

struct Edge {
    x: f32,
    y: f32,
    dx: f32,
    dy: f32,
}

fn edges(mask: &GrayImage) -> Vec<Edge> {
    let gx = horizontal_sobel(mask);
    let gy = vertical_sobel(mask);
    let mut out = Vec::new();
    for (x, y, px) in gx.enumerate_pixels() {
        let dx = px[0] as f32;
        let dy = gy.get_pixel(x, y)[0] as f32;
        let magnitude = (dx * dx + dy * dy).sqrt();
        if magnitude > EDGE_MAGNITUDE {
            out.push(Edge {
                x: x as f32,
                y: y as f32,
                dx: dx / magnitude,
                dy: dy / magnitude,
            });
        }
    }
    out
}

/// Find circles in `mask`, strongest first.
pub fn find_circles(mask: &GrayImage, params: &HoughParams) -> Vec<HoughCircle> {
    let (width, height) = mask.dimensions();
    if width == 0 || height == 0 || params.min_radius == 0 || params.max_radius < params.min_radius {
        return Vec::new();
    }

    let edges = edges(mask);
    let accumulator = vote(&edges, width, height, params);
    let smoothed = box_sum(&accumulator, width, height);

    let mut peaks: Vec<(u32, u32, u32)> = Vec::new();
    for y in 0..height {
        for x in 0..width {
            let v = smoothed[(y * width + x) as usize];
            if v >= params.min_votes && is_local_max(&smoothed, width, height, x, y) {
                peaks.push((v, x, y));
            }
        }
    }
    // Strongest first; raster order breaks ties so the result is reproducible.
    peaks.sort_by(|a, b| b.0.cmp(&a.0).then(a.2.cmp(&b.2)).then(a.1.cmp(&b.1)));

    let mut accepted: Vec<HoughCircle> = Vec::new();
    for (votes, x, y) in peaks {
        let Some(candidate) = refine_center(&edges, x, y, width, height, params) else {
            continue;
        };
        let too_close = accepted.iter().any(|c| {
            let ddx = c.candidate.x - candidate.x;
            let ddy = c.candidate.y - candidate.y;
            (ddx * ddx + ddy * ddy).sqrt() < params.min_center_distance
        });
        if !too_close {
            accepted.push(HoughCircle { candidate, votes });
        }
    }
    accepted
}

/// Point within `REFINE_WINDOW` of the peak with the strongest radial edge
/// support. Ties keep the first point in raster order.
fn refine_center(edges: &[Edge], x: u32, y: u32, width: u32, height: u32, params: &HoughParams) -> Option<Candidate> {
    let mut best: Option<(u32, Candidate)> = None;
    for ny in y.saturating_sub(REFINE_WINDOW)..=(y + REFINE_WINDOW).min(height - 1) {
        for nx in x.saturating_sub(REFINE_WINDOW)..=(x + REFINE_WINDOW).min(width - 1) {
            let (cx, cy) = (nx as f32, ny as f32);
            let Some((support, radius)) = best_radius(edges, cx, cy, params) else {
                continue;
            };
            if best.is_none_or(|(s, _)| support > s) {
                best = Some((support, Candidate { x: cx, y: cy, radius }));
            }
        }
    }
    best.map(|(_, candidate)| candidate)
}

fn vote(edges: &[Edge], width: u32, height: u32, params: &HoughParams) -> Vec<u32> {
    let mut acc = vec![0u32; (width * height) as usize];
    for edge in edges {
        for r in params.min_radius..=params.max_radius {
            let r = r as f32;
            for sign in [1.0f32, -1.0] {
                let cx = (edge.x + sign * r * edge.dx).round();
                let cy = (edge.y + sign * r * edge.dy).round();
                if cx >= 0.0 && cy >= 0.0 && (cx as u32) < width && (cy as u32) < height {
                    acc[(cy as u32 * width + cx as u32) as usize] += 1;
                }
            }
        }
    }
    acc
}

fn box_sum(acc: &[u32], width: u32, height: u32) -> Vec<u32> {
    let mut out = vec![0u32; acc.len()];
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0;
            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    sum += acc[(ny * width + nx) as usize];
                }
            }
            out[(y * width + x) as usize] = sum;
        }
    }
    out
}

/// Strictly greater than neighbours already visited in raster order, not
/// smaller than the ones after it, so a plateau yields exactly one peak.
fn is_local_max(values: &[u32], width: u32, height: u32, x: u32, y: u32) -> bool {
    let v = values[(y * width + x) as usize];
    for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
        for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
            if (nx, ny) == (x, y) {
                continue;
            }
            let n = values[(ny * width + nx) as usize];
            let before = (ny, nx) < (y, x);
            if (before && n >= v) || (!before && n > v) {
                return false;
            }
        }
    }
    true
}

/// Radius with the most edge support around `(cx, cy)`, with that support.
/// Ties go to the larger radius, which is the outer edge of a ring.
fn best_radius(edges: &[Edge], cx: f32, cy: f32, params: &HoughParams) -> Option<(u32, f32)> {
    let span = (params.max_radius - params.min_radius + 1) as usize;
    let mut histogram = vec![0u32; span];
    for edge in edges {
        let d = ((edge.x - cx).powi(2) + (edge.y - cy).powi(2)).sqrt().round() as u32;
        if d >= params.min_radius && d <= params.max_radius {
            histogram[(d - params.min_radius) as usize] += 1;
        }
    }

    let mut best: Option<(u32, usize)> = None;
    for i in 0..span {
        let support = histogram[i]
            + if i > 0 { histogram[i - 1] } else { 0 }
            + if i + 1 < span { histogram[i + 1] } else { 0 };
        if support > 0 && best.is_none_or(|(s, _)| support >= s) {
            best = Some((support, i));
        }
    }
    best.map(|(support, i)| (support, (params.min_radius + i as u32) as f32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn ring_mask(width: u32, height: u32, rings: &[(f32, f32, f32, f32)]) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let inside = rings.iter().any(|&(cx, cy, inner, outer)| {
                let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
                d >= inner && d <= outer
            });
            Luma([if inside { 255 } else { 0 }])
        })
    }

    fn params() -> HoughParams {
        HoughParams {
            min_radius: 20,
            max_radius: 60,
            min_center_distance: 30.0,
            min_votes: 100,
        }
    }

    #[test]
    fn finds_single_ring() {
        let mask = ring_mask(200, 200, &[(100.0, 90.0, 34.0, 40.0)]);
        let found = find_circles(&mask, &params());
        assert_eq!(found.len(), 1, "{found:?}");
        let c = found[0].candidate;
        assert!((c.x - 100.0).abs() <= 1.0);
        assert!((c.y - 90.0).abs() <= 1.0);
        assert!((c.radius - 40.0).abs() <= 2.0, "radius {}", c.radius);
    }

    #[test]
    fn finds_two_separate_rings() {
        let mask = ring_mask(300, 150, &[(70.0, 75.0, 28.0, 34.0), (220.0, 75.0, 40.0, 46.0)]);
        let found = find_circles(&mask, &params());
        assert_eq!(found.len(), 2, "{found:?}");
        let mut circles: Vec<Candidate> = found.iter().map(|c| c.candidate).collect();
        circles.sort_by(|a, b| a.x.total_cmp(&b.x));
        for (c, (x, radius)) in circles.iter().zip([(70.0, 34.0), (220.0, 46.0)]) {
            assert!((c.x - x).abs() <= 1.0, "{c:?}");
            assert!((c.y - 75.0).abs() <= 1.0, "{c:?}");
            assert!((c.radius - radius).abs() <= 1.0, "{c:?}");
        }
    }

    #[test]
    fn small_ring_center_is_not_biased_toward_origin() {
        // Smeared votes put the raw peak a few pixels up and left of center.
        let mask = ring_mask(160, 160, &[(80.0, 80.0, 28.0, 34.0)]);
        let found = find_circles(&mask, &params());
        let c = found[0].candidate;
        assert_eq!((c.x, c.y, c.radius), (80.0, 80.0, 34.0), "{found:?}");
    }

    #[test]
    fn empty_mask_has_no_circles() {
        let mask = GrayImage::new(100, 100);
        assert!(find_circles(&mask, &params()).is_empty());
    }

    #[test]
    fn repeated_runs_agree() {
        let mask = ring_mask(200, 200, &[(100.0, 100.0, 30.0, 36.0)]);
        assert_eq!(find_circles(&mask, &params()), find_circles(&mask, &params()));
    }
}
