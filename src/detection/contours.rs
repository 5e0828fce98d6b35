use image::GrayImage;
use imageproc::contours::{BorderType, find_contours};
use imageproc::geometry::arc_length;
use imageproc::point::Point;

use crate::detection::enclosing::min_enclosing_circle;
use crate::models::Candidate;

/// Area and perimeter of one closed contour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeMetrics {
    pub area: f64,
    pub perimeter: f64,
}

impl ShapeMetrics {
    pub fn of(points: &[Point<i32>]) -> Self {
        Self {
            area: polygon_area(points),
            perimeter: arc_length(points, true),
        }
    }

    /// 4π·area/perimeter², 1.0 for a perfect circle.
    pub fn circularity(&self) -> f64 {
        if self.perimeter <= 0.0 {
            return 0.0;
        }
        4.0 * std::f64::consts::PI * self.area / (self.perimeter * self.perimeter)
    }
}

/// Minimum area / circularity gate applied to every external contour.
#[derive(Debug, Clone, Copy)]
pub struct ShapeFilter {
    pub min_area: f64,
    pub min_circularity: f64,
}

impl ShapeFilter {
    pub fn accepts(&self, shape: &ShapeMetrics) -> bool {
        shape.area >= self.min_area && shape.circularity() > self.min_circularity
    }
}

/// A contour that passed the shape filter, with its enclosing circle.
#[derive(Debug, Clone)]
pub struct ContourCandidate {
    pub shape: ShapeMetrics,
    pub circle: Candidate,
}

/// Outer borders that are not nested inside another foreground region.
pub fn external_contours(mask: &GrayImage) -> Vec<Vec<Point<i32>>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|c| c.points)
        .collect()
}

/// Extract circle candidates from a binary mask, in contour discovery order.
pub fn find_candidates(mask: &GrayImage, filter: &ShapeFilter) -> Vec<ContourCandidate> {
    external_contours(mask)
        .into_iter()
        .filter_map(|points| {
            let shape = ShapeMetrics::of(&points);
            if !filter.accepts(&shape) {
                return None;
            }
            let as_f64: Vec<(f64, f64)> = points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
            let fit = min_enclosing_circle(&as_f64)?;
            Some(ContourCandidate {
                shape,
                circle: Candidate {
                    x: fit.x as f32,
                    y: fit.y as f32,
                    radius: fit.radius as f32,
                },
            })
        })
        .collect()
}

/// Shoelace area of a closed polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0i64;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        twice += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    twice.abs() as f64 / 2.0
}
