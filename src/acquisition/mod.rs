//! Frame acquisition: pulls frames from a blocking source on a dedicated
//! thread and publishes them to the frame cache.

pub mod ffmpeg;
pub mod still;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::RgbImage;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::FrameCache;
use crate::config::SourceConfig;
use crate::models::Frame;

pub use ffmpeg::FfmpegSource;
pub use still::StillSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read frame: {0}")]
    Read(#[from] io::Error),
    #[error("failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no images found in {0:?}")]
    Empty(PathBuf),
    #[error("invalid frame geometry {width}x{height}")]
    Geometry { width: u32, height: u32 },
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("acquisition cancelled")]
    Cancelled,
}

/// A blocking pull source of decoded RGB frames.
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<RgbImage, SourceError>;

    /// Short description for logs.
    fn describe(&self) -> String;

    /// Called once before the first pull. Sources whose pulls can block for
    /// long should give up with `SourceError::Cancelled` once `token` fires.
    fn watch(&mut self, _token: &CancellationToken) {}
}

/// URI schemes handed to ffmpeg; anything else is treated as a path to still images.
pub fn is_stream_uri(uri: &str) -> bool {
    ["rtsp://", "rtsps://", "http://", "https://", "udp://", "/dev/video"]
        .iter()
        .any(|prefix| uri.starts_with(prefix))
}

/// Open the source described by `config`.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    if is_stream_uri(&config.uri) {
        let source = FfmpegSource::new(&config.uri, config.width, config.height)?.with_read_timeout(config.read_timeout);
        Ok(Box::new(source))
    } else {
        Ok(Box::new(StillSource::open(&config.uri, config.interval)?))
    }
}

/// Drives the frame cache from a source until cancelled.
pub struct AcquisitionLoop {
    source: Box<dyn FrameSource>,
    cache: Arc<FrameCache>,
    retry_delay: Duration,
}

impl AcquisitionLoop {
    pub fn new(source: Box<dyn FrameSource>, cache: Arc<FrameCache>, retry_delay: Duration) -> Self {
        Self {
            source,
            cache,
            retry_delay,
        }
    }

    /// Run on a named OS thread; the handle joins once `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || self.run(&token))
    }

    pub fn run(mut self, token: &CancellationToken) {
        let description = self.source.describe();
        self.source.watch(token);
        info!(source = %description, "acquisition started");

        let mut sequence = 0u64;
        let mut failures = 0u64;

        while !token.is_cancelled() {
            match self.source.next_frame() {
                Ok(image) => {
                    if failures > 0 {
                        info!(source = %description, failures, "source recovered");
                        failures = 0;
                    }
                    sequence += 1;
                    if sequence == 1 {
                        info!(width = image.width(), height = image.height(), "first frame received");
                    }
                    self.cache.publish(Frame::new(sequence, image));
                }
                Err(_) if token.is_cancelled() => break,
                Err(e) => {
                    failures += 1;
                    if failures == 1 {
                        warn!(source = %description, "frame pull failed: {}", e);
                    } else {
                        debug!(source = %description, failures, "frame pull failed: {}", e);
                    }
                    sleep_unless_cancelled(self.retry_delay, token);
                }
            }
        }

        info!(frames = sequence, "acquisition stopped");
    }
}

fn sleep_unless_cancelled(delay: Duration, token: &CancellationToken) {
    let deadline = Instant::now() + delay;
    while !token.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}
