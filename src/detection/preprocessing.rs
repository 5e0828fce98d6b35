use image::{DynamicImage, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::median_filter;
use imageproc::morphology::{dilate, erode};

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// Convert image to grayscale
pub fn to_grayscale(img: &DynamicImage) -> GrayImage {
    img.to_luma8()
}

/// Rank filter with a (2r+1)x(2r+1) window. Radius 0 is a no-op.
pub fn suppress_noise(img: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return img.clone();
    }
    median_filter(img, radius, radius)
}

/// Mark pixels darker than `cutoff` (after a saturating contrast gain) as
/// marker foreground.
pub fn isolate_dark(img: &GrayImage, contrast_gain: f32, cutoff: u8) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let scaled = (img.get_pixel(x, y)[0] as f32 * contrast_gain).round().clamp(0.0, 255.0);
        if scaled < cutoff as f32 {
            Luma([FOREGROUND])
        } else {
            Luma([BACKGROUND])
        }
    })
}

/// Closing: dilation followed by erosion with a square element of the given
/// radius. Bridges small gaps in the ring and drops isolated speckles.
pub fn close_gaps(mask: &GrayImage, radius: u8) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    let dilated = dilate(mask, Norm::LInf, radius);
    erode(&dilated, Norm::LInf, radius)
}
