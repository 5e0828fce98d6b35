//! Overlay drawing and JPEG encoding for the live view.

use anyhow::{Result, anyhow};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut};

use crate::models::{Circle, DetectionResult, Frame};

pub const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const CENTER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const CENTER_RADIUS: i32 = 3;

/// Draw a 2 px outline and a filled center mark for every circle.
pub fn draw_circles(image: &mut RgbImage, circles: &[Circle]) {
    for circle in circles {
        let center = (circle.center_x as i32, circle.center_y as i32);
        let radius = circle.radius as i32;
        draw_hollow_circle_mut(image, center, radius, OUTLINE_COLOR);
        if radius > 1 {
            draw_hollow_circle_mut(image, center, radius - 1, OUTLINE_COLOR);
        }
        draw_filled_circle_mut(image, center, CENTER_RADIUS, CENTER_COLOR);
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// Copy `frame`, draw the circles of `detection` (if successful) and encode.
pub fn annotated_jpeg(frame: &Frame, detection: Option<&DetectionResult>, quality: u8) -> Result<Vec<u8>> {
    let mut canvas = frame.image.clone();
    if let Some(result) = detection.filter(|r| r.is_success()) {
        draw_circles(&mut canvas, &result.circles);
    }
    encode_jpeg(&canvas, quality)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outline_and_center_are_drawn() {
        let mut image = RgbImage::new(100, 100);
        let circle = Circle { center_x: 50, center_y: 50, radius: 20 };
        draw_circles(&mut image, &[circle]);

        assert_eq!(*image.get_pixel(70, 50), OUTLINE_COLOR);
        assert_eq!(*image.get_pixel(69, 50), OUTLINE_COLOR);
        assert_eq!(*image.get_pixel(50, 50), CENTER_COLOR);
        assert_eq!(*image.get_pixel(60, 50), Rgb([0, 0, 0]));
    }

    #[test]
    fn circles_past_the_edge_do_not_panic() {
        let mut image = RgbImage::new(40, 40);
        draw_circles(&mut image, &[Circle { center_x: 39, center_y: 0, radius: 60 }]);
    }

    #[test]
    fn jpeg_round_trips_dimensions() -> Result<()> {
        let frame = Frame::new(1, RgbImage::from_pixel(64, 48, Rgb([120, 120, 120])));
        let jpeg = annotated_jpeg(&frame, None, 80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg)?;
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
        Ok(())
    }
}
