//! Single-slot, last-write-wins stores shared between the acquisition thread,
//! command sessions and stream viewers.
//!
//! Both caches hold an immutable value behind an atomically swapped `Arc`.
//! Writers never wait for readers and readers never observe a partial value;
//! a superseded value is freed once its last reader drops it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;

use crate::models::{DetectionResult, Frame};

/// Holds the most recent decoded frame.
#[derive(Default)]
pub struct FrameCache {
    slot: ArcSwapOption<Frame>,
    published: AtomicU64,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame.
    pub fn publish(&self, frame: Frame) {
        self.slot.store(Some(Arc::new(frame)));
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// The current frame, or `None` before the first publish.
    pub fn snapshot(&self) -> Option<Arc<Frame>> {
        self.slot.load_full()
    }

    /// Number of frames published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Holds the most recent detection result.
#[derive(Default)]
pub struct DetectionCache {
    slot: ArcSwapOption<DetectionResult>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, result: Arc<DetectionResult>) {
        self.slot.store(Some(result));
    }

    /// `None` until the first detection completes.
    pub fn current(&self) -> Option<Arc<DetectionResult>> {
        self.slot.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Circle;
    use image::RgbImage;
    use std::thread;

    #[test]
    fn empty_cache_has_no_frame() {
        let cache = FrameCache::new();
        assert!(cache.snapshot().is_none());
        assert_eq!(cache.published(), 0);
    }

    #[test]
    fn publish_replaces_frame_but_keeps_old_snapshot_alive() {
        let cache = FrameCache::new();
        cache.publish(Frame::new(1, RgbImage::new(2, 2)));
        let first = cache.snapshot().unwrap();
        cache.publish(Frame::new(2, RgbImage::new(3, 3)));

        assert_eq!(first.sequence, 1);
        assert_eq!(first.width(), 2);
        assert_eq!(cache.snapshot().unwrap().sequence, 2);
        assert_eq!(cache.published(), 2);
    }

    #[test]
    fn readers_always_see_whole_frames() {
        let cache = Arc::new(FrameCache::new());
        let writer = {
            let cache = cache.clone();
            thread::spawn(move || {
                for seq in 1..=500u64 {
                    let side = (seq % 7 + 1) as u32;
                    let value = (seq % 251) as u8;
                    let image = RgbImage::from_pixel(side, side, image::Rgb([value; 3]));
                    cache.publish(Frame::new(seq, image));
                }
            })
        };

        for _ in 0..2000 {
            if let Some(frame) = cache.snapshot() {
                let side = (frame.sequence % 7 + 1) as u32;
                let value = (frame.sequence % 251) as u8;
                assert_eq!(frame.width(), side);
                assert!(frame.image.pixels().all(|p| p.0 == [value; 3]));
            }
        }
        writer.join().unwrap();
        assert_eq!(cache.snapshot().unwrap().sequence, 500);
    }

    #[test]
    fn detection_cache_last_update_wins() {
        let frames = FrameCache::new();
        frames.publish(Frame::new(1, RgbImage::new(10, 10)));
        let frame = frames.snapshot().unwrap();

        let cache = DetectionCache::new();
        assert!(cache.current().is_none());

        let circle = Circle { center_x: 5, center_y: 5, radius: 3 };
        cache.update(Arc::new(DetectionResult::success(1, &frame, vec![circle])));
        cache.update(Arc::new(DetectionResult::success(2, &frame, Vec::new())));

        let current = cache.current().unwrap();
        assert_eq!(current.id, 2);
        assert!(current.circles.is_empty());
    }
}
