pub mod acquisition;
pub mod annotate;
pub mod cache;
pub mod config;
pub mod detection;
pub mod models;
pub mod pipeline;
pub mod server;

pub use cache::{DetectionCache, FrameCache};
pub use config::{CommandConfig, DetectionConfig, SourceConfig, Strategy, StreamConfig};
pub use detection::DetectionPipeline;
pub use models::{Circle, DetectionResult, DetectionStatus, Frame};
pub use pipeline::{DebugConfig, MetadataValue, Pipeline, PipelineContext, PipelineData, PipelineStep};
pub use server::{CommandServer, ServerState, StreamServer};
