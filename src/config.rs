//! Runtime configuration.
//!
//! Every component takes a plain struct with a `Default` impl. The `*Args`
//! types are the clap front end for the binary and convert into those structs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::detection::validate::RingValidator;

/// Candidate extraction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Strategy {
    /// External contours filtered by area and circularity, then enclosing-circle fit
    #[default]
    Contour,
    /// Gradient circle transform over the shaped mask
    Hough,
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub strategy: Strategy,
    pub median_radius: u32,
    pub contrast_gain: f32,
    pub dark_cutoff: u8,
    pub closing_radius: u8,
    // contour strategy
    pub min_area: f64,
    pub min_circularity: f64,
    // hough strategy
    pub min_radius: u32,
    pub max_radius: u32,
    pub min_votes: u32,
    pub min_center_distance: f32,
    pub validate: bool,
    pub validator: RingValidator,
    pub debug_dir: Option<PathBuf>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Contour,
            median_radius: 1,
            contrast_gain: 1.5,
            dark_cutoff: 60,
            closing_radius: 4,
            min_area: 500.0,
            min_circularity: 0.8,
            min_radius: 50,
            max_radius: 500,
            min_votes: 100,
            min_center_distance: 100.0,
            validate: true,
            validator: RingValidator::default(),
            debug_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub addr: SocketAddr,
    pub max_sessions: usize,
    pub max_line_length: usize,
    pub max_concurrent_detections: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 1991)),
            max_sessions: 64,
            max_line_length: 64 * 1024,
            max_concurrent_detections: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub addr: SocketAddr,
    pub path: String,
    pub max_viewers: usize,
    pub frame_interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 1992)),
            path: "/video".to_string(),
            max_viewers: 32,
            frame_interval: Duration::from_millis(40),
            jpeg_quality: 80,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub uri: String,
    /// Decoded frame size for ffmpeg sources
    pub width: u32,
    pub height: u32,
    /// Pacing between still-image frames
    pub interval: Duration,
    pub retry_delay: Duration,
    /// A pull that yields no frame for this long counts as failed
    pub read_timeout: Duration,
}

impl SourceConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            width: 1920,
            height: 1080,
            interval: Duration::from_millis(40),
            retry_delay: Duration::from_millis(500),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Pipeline tuning flags shared by `serve` and `detect`.
#[derive(Args, Debug, Clone)]
pub struct DetectionArgs {
    /// Candidate extraction strategy
    #[arg(long, value_enum, default_value_t = Strategy::Contour)]
    pub strategy: Strategy,

    /// Median filter radius (1 = 3x3 window, 0 disables)
    #[arg(long, default_value_t = 1)]
    pub median_radius: u32,

    /// Contrast gain applied before the dark threshold
    #[arg(long, default_value_t = 1.5)]
    pub contrast_gain: f32,

    /// Pixels darker than this (after gain) become marker candidates
    #[arg(long, default_value_t = 60)]
    pub dark_cutoff: u8,

    /// Closing radius in pixels (dilate then erode)
    #[arg(long, default_value_t = 4)]
    pub closing_radius: u8,

    /// Minimum contour area (contour strategy)
    #[arg(long, default_value_t = 500.0)]
    pub min_area: f64,

    /// Minimum circularity 4*pi*area/perimeter^2 (contour strategy)
    #[arg(long, default_value_t = 0.8)]
    pub min_circularity: f64,

    /// Minimum radius (hough strategy)
    #[arg(long, default_value_t = 50)]
    pub min_radius: u32,

    /// Maximum radius (hough strategy)
    #[arg(long, default_value_t = 500)]
    pub max_radius: u32,

    /// Minimum accumulator votes for a center (hough strategy)
    #[arg(long, default_value_t = 100)]
    pub min_votes: u32,

    /// Minimum distance between accepted centers (hough strategy)
    #[arg(long, default_value_t = 100.0)]
    pub min_center_distance: f32,

    /// Boundary points sampled by the validator
    #[arg(long, default_value_t = 32)]
    pub ring_samples: u32,

    /// Mean boundary brightness must stay below this
    #[arg(long, default_value_t = 80.0)]
    pub boundary_dark_threshold: f32,

    /// Fraction of boundary samples that must land on the marker
    #[arg(long, default_value_t = 0.8)]
    pub min_coverage: f32,

    /// Allowed relative error of the boundary refit
    #[arg(long, default_value_t = 0.1)]
    pub max_refit_error: f32,

    /// Skip the geometric validator
    #[arg(long)]
    pub no_validate: bool,

    /// Save every stage's images to this directory (must be empty)
    #[arg(long, value_name = "DIR")]
    pub debug_out: Option<PathBuf>,
}

impl From<DetectionArgs> for DetectionConfig {
    fn from(args: DetectionArgs) -> Self {
        Self {
            strategy: args.strategy,
            median_radius: args.median_radius,
            contrast_gain: args.contrast_gain,
            dark_cutoff: args.dark_cutoff,
            closing_radius: args.closing_radius,
            min_area: args.min_area,
            min_circularity: args.min_circularity,
            min_radius: args.min_radius,
            max_radius: args.max_radius,
            min_votes: args.min_votes,
            min_center_distance: args.min_center_distance,
            validate: !args.no_validate,
            validator: RingValidator {
                samples: args.ring_samples,
                dark_threshold: args.boundary_dark_threshold,
                min_coverage: args.min_coverage,
                max_refit_error: args.max_refit_error,
            },
            debug_dir: args.debug_out,
        }
    }
}

/// Network and source flags for `serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Video source: rtsp://, http(s)://, udp://, /dev/videoN, an image file or a directory of images
    #[arg(long, value_name = "URI")]
    pub source: String,

    /// Decoded frame width (ffmpeg sources)
    #[arg(long, default_value_t = 1920)]
    pub width: u32,

    /// Decoded frame height (ffmpeg sources)
    #[arg(long, default_value_t = 1080)]
    pub height: u32,

    /// Delay between still-image frames
    #[arg(long, default_value_t = 40)]
    pub source_interval_ms: u64,

    /// Delay before retrying a failed frame pull
    #[arg(long, default_value_t = 500)]
    pub retry_delay_ms: u64,

    /// Reconnect when the source delivers no frame for this long
    #[arg(long, default_value_t = 5000)]
    pub read_timeout_ms: u64,

    /// Command server bind address
    #[arg(long, default_value = "0.0.0.0:1991")]
    pub command_addr: SocketAddr,

    /// Maximum concurrent command sessions
    #[arg(long, default_value_t = 64)]
    pub max_sessions: usize,

    /// Maximum command line length in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    pub max_line_length: usize,

    /// Detections allowed to run at the same time
    #[arg(long, default_value_t = 1)]
    pub max_concurrent_detections: usize,

    /// Streaming server bind address
    #[arg(long, default_value = "0.0.0.0:1992")]
    pub stream_addr: SocketAddr,

    /// Streaming endpoint path
    #[arg(long, default_value = "/video")]
    pub stream_path: String,

    /// Maximum concurrent stream viewers
    #[arg(long, default_value_t = 32)]
    pub max_viewers: usize,

    /// Interval between stream parts
    #[arg(long, default_value_t = 40)]
    pub frame_interval_ms: u64,

    /// JPEG quality of the stream (1-100)
    #[arg(long, default_value_t = 80, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,
}

impl ServeArgs {
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            uri: self.source.clone(),
            width: self.width,
            height: self.height,
            interval: Duration::from_millis(self.source_interval_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms.max(1)),
        }
    }

    pub fn command_config(&self) -> CommandConfig {
        CommandConfig {
            addr: self.command_addr,
            max_sessions: self.max_sessions.max(1),
            max_line_length: self.max_line_length.max(1),
            max_concurrent_detections: self.max_concurrent_detections.max(1),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        let path = if self.stream_path.starts_with('/') {
            self.stream_path.clone()
        } else {
            format!("/{}", self.stream_path)
        };
        StreamConfig {
            addr: self.stream_addr,
            path,
            max_viewers: self.max_viewers.max(1),
            frame_interval: Duration::from_millis(self.frame_interval_ms.max(1)),
            jpeg_quality: self.jpeg_quality,
        }
    }
}
