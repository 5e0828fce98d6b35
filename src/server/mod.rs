pub mod command;
pub mod protocol;
pub mod stream;

use std::sync::Arc;

use crate::cache::{DetectionCache, FrameCache};
use crate::detection::DetectionPipeline;

pub use command::CommandServer;
pub use stream::StreamServer;

/// State shared by both servers. The caches are the only mutable parts.
pub struct ServerState {
    pub frames: Arc<FrameCache>,
    pub detections: Arc<DetectionCache>,
    pub detector: Arc<DetectionPipeline>,
}

impl ServerState {
    pub fn new(frames: Arc<FrameCache>, detections: Arc<DetectionCache>, detector: Arc<DetectionPipeline>) -> Arc<Self> {
        Arc::new(Self {
            frames,
            detections,
            detector,
        })
    }
}
