use image::RgbImage;
use serde::Serialize;
use time::OffsetDateTime;

/// One decoded camera frame. Never mutated after it is published.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub image: RgbImage,
    pub captured_at: OffsetDateTime,
}

impl Frame {
    pub fn new(sequence: u64, image: RgbImage) -> Self {
        Self {
            sequence,
            image,
            captured_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// A validated marker detection in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Circle {
    pub center_x: u32,
    pub center_y: u32,
    pub radius: u32,
}

impl Circle {
    /// Builds a circle from floating point geometry, truncating like the
    /// integer report format. Returns `None` for non-positive radii or
    /// centers left of / above the image origin.
    pub fn from_f32(x: f32, y: f32, r: f32) -> Option<Self> {
        if !(x >= 0.0 && y >= 0.0 && r >= 1.0) {
            return None;
        }
        Some(Self {
            center_x: x as u32,
            center_y: y as u32,
            radius: r as u32,
        })
    }

    pub fn diameter(&self) -> u32 {
        self.radius * 2
    }
}

/// A candidate produced by the extraction stage, before validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
}

impl Candidate {
    pub fn to_circle(&self) -> Option<Circle> {
        Circle::from_f32(self.x, self.y, self.radius)
    }

    /// Bounding box `(min_x, min_y, width, height)` grown by `padding` and
    /// clamped to a `width` x `height` image.
    pub fn bounds(&self, padding: u32, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }
        let reach = self.radius + padding as f32;
        let min_x = (self.x - reach).floor().max(0.0) as u32;
        let min_y = (self.y - reach).floor().max(0.0) as u32;
        let max_x = ((self.x + reach).ceil().max(0.0) as u32).min(width - 1);
        let max_y = ((self.y + reach).ceil().max(0.0) as u32).min(height - 1);
        if min_x > max_x || min_y > max_y {
            return None;
        }
        Some((min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Success,
    Error,
}

/// Outcome of one pipeline run. Replaced as a whole in the detection cache.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub id: u64,
    pub status: DetectionStatus,
    pub circles: Vec<Circle>,
    pub message: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_sequence: u64,
    pub timestamp: OffsetDateTime,
}

impl DetectionResult {
    pub fn success(id: u64, frame: &Frame, circles: Vec<Circle>) -> Self {
        let message = circles
            .is_empty()
            .then(|| "no circle detected".to_string());
        Self {
            id,
            status: DetectionStatus::Success,
            circles,
            message,
            width: frame.width(),
            height: frame.height(),
            frame_sequence: frame.sequence,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn error(id: u64, frame: &Frame, message: impl Into<String>) -> Self {
        Self {
            id,
            status: DetectionStatus::Error,
            circles: Vec::new(),
            message: Some(message.into()),
            width: frame.width(),
            height: frame.height(),
            frame_sequence: frame.sequence,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DetectionStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circle_rejects_zero_radius() {
        assert!(Circle::from_f32(10.0, 10.0, 0.4).is_none());
        assert!(Circle::from_f32(-1.0, 10.0, 5.0).is_none());
        let c = Circle::from_f32(10.9, 20.2, 5.7).unwrap();
        assert_eq!((c.center_x, c.center_y, c.radius, c.diameter()), (10, 20, 5, 10));
    }

    #[test]
    fn candidate_bounds_are_clamped() {
        let c = Candidate { x: 5.0, y: 95.0, radius: 10.0 };
        let (x, y, w, h) = c.bounds(2, 100, 100).unwrap();
        assert_eq!((x, y), (0, 83));
        assert_eq!(x + w, 18);
        assert_eq!(y + h, 100);
    }

    #[test]
    fn empty_success_carries_message() {
        let frame = Frame::new(7, RgbImage::new(4, 3));
        let result = DetectionResult::success(1, &frame, Vec::new());
        assert!(result.is_success());
        assert_eq!(result.message.as_deref(), Some("no circle detected"));
        assert_eq!((result.width, result.height, result.frame_sequence), (4, 3, 7));
    }
}
