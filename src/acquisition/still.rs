use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use image::{ImageFormat, ImageReader, RgbImage};

use super::{FrameSource, SourceError};

/// Cycles through one image file or every image in a directory, paced at a
/// fixed interval. Images are decoded once up front.
pub struct StillSource {
    path: PathBuf,
    frames: Vec<RgbImage>,
    index: usize,
    interval: Duration,
    last: Option<Instant>,
}

impl StillSource {
    pub fn open(path: impl AsRef<Path>, interval: Duration) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();

        let files = if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && ImageFormat::from_path(p).is_ok())
                .collect();
            files.sort();
            files
        } else {
            vec![path.clone()]
        };

        let frames = files.iter().map(|file| decode(file)).collect::<Result<Vec<_>, _>>()?;
        Self::from_frames(path, frames, interval)
    }

    pub fn from_frames(path: PathBuf, frames: Vec<RgbImage>, interval: Duration) -> Result<Self, SourceError> {
        if frames.is_empty() {
            return Err(SourceError::Empty(path));
        }
        if let Some(bad) = frames.iter().find(|f| f.width() == 0 || f.height() == 0) {
            return Err(SourceError::Geometry {
                width: bad.width(),
                height: bad.height(),
            });
        }
        Ok(Self {
            path,
            frames,
            index: 0,
            interval,
            last: None,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn decode(file: &Path) -> Result<RgbImage, SourceError> {
    let to_error = |source: image::ImageError| SourceError::Decode {
        path: file.to_path_buf(),
        source,
    };
    let image = ImageReader::open(file)
        .map_err(|e| to_error(e.into()))?
        .with_guessed_format()
        .map_err(|e| to_error(e.into()))?
        .decode()
        .map_err(to_error)?;
    Ok(image.to_rgb8())
}

impl FrameSource for StillSource {
    fn next_frame(&mut self) -> Result<RgbImage, SourceError> {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        self.last = Some(Instant::now());

        let frame = self.frames[self.index % self.frames.len()].clone();
        self.index = (self.index + 1) % self.frames.len();
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("{} still image(s) from {}", self.frames.len(), self.path.display())
    }
}
