//! MJPEG streaming server.
//!
//! Each viewer gets its own push loop reading the frame and detection caches.
//! Encoded parts are memoised per (frame, detection) snapshot pair so that
//! viewers watching the same frame share one JPEG encode.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arc_swap::ArcSwapOption;
use async_stream::stream;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::annotate;
use crate::config::StreamConfig;
use crate::models::{DetectionResult, Frame};
use crate::server::ServerState;

pub const BOUNDARY: &str = "frame";

/// Fixed route serving one annotated JPEG.
pub const STILL_PATH: &str = "/frame.jpg";

/// The stream path must be a plain absolute path distinct from `STILL_PATH`.
pub fn check_stream_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("stream path {path:?} must start with '/'");
    }
    if path.contains([':', '*', '{', '}']) {
        bail!("stream path {path:?} must not contain route parameters");
    }
    if path == STILL_PATH {
        bail!("stream path {path:?} is reserved for single frames");
    }
    Ok(())
}

/// Identity of the snapshots a part was drawn from. Holding the `Arc`s keeps
/// the pointers from being reused while the memo is alive.
struct PartKey {
    frame: Arc<Frame>,
    detection: Option<Arc<DetectionResult>>,
}

impl PartKey {
    fn matches(&self, frame: &Arc<Frame>, detection: Option<&Arc<DetectionResult>>) -> bool {
        let same_detection = match (&self.detection, detection) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        Arc::ptr_eq(&self.frame, frame) && same_detection
    }
}

struct EncodedPart {
    key: PartKey,
    /// Complete multipart chunk: boundary, headers, JPEG, trailing CRLF
    part: Bytes,
    /// The JPEG inside `part`
    jpeg: Bytes,
}

/// Wrap a JPEG in one multipart chunk.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut payload = Vec::with_capacity(header.len() + jpeg.len() + 2);
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

struct StreamState {
    shared: Arc<ServerState>,
    config: StreamConfig,
    memo: ArcSwapOption<EncodedPart>,
    viewers: Arc<Semaphore>,
    token: CancellationToken,
}

impl StreamState {
    /// Annotated encoding of the current frame, or `None` before the first frame.
    async fn current(&self) -> Result<Option<Arc<EncodedPart>>> {
        let Some(frame) = self.shared.frames.snapshot() else {
            return Ok(None);
        };
        let detection = self.shared.detections.current();

        if let Some(memo) = self.memo.load_full().filter(|m| m.key.matches(&frame, detection.as_ref())) {
            return Ok(Some(memo));
        }

        let key = PartKey {
            frame: frame.clone(),
            detection: detection.clone(),
        };
        let quality = self.config.jpeg_quality;
        let jpeg = tokio::task::spawn_blocking(move || annotate::annotated_jpeg(&frame, detection.as_deref(), quality))
            .await
            .context("encoder task failed")??;

        let part = multipart_part(&jpeg);
        let start = part.len() - jpeg.len() - 2;
        let encoded = Arc::new(EncodedPart {
            key,
            jpeg: part.slice(start..start + jpeg.len()),
            part,
        });
        self.memo.store(Some(encoded.clone()));
        Ok(Some(encoded))
    }
}

pub struct StreamServer {
    listener: TcpListener,
    config: StreamConfig,
    shared: Arc<ServerState>,
}

impl StreamServer {
    pub async fn bind(config: StreamConfig, shared: Arc<ServerState>) -> Result<Self> {
        check_stream_path(&config.path)?;
        let listener = TcpListener::bind(config.addr)
            .await
            .with_context(|| format!("failed to bind stream server on {}", config.addr))?;
        Ok(Self {
            listener,
            config,
            shared,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn router(config: StreamConfig, shared: Arc<ServerState>, token: CancellationToken) -> Router {
        let path = config.path.clone();
        let state = Arc::new(StreamState {
            shared,
            viewers: Arc::new(Semaphore::new(config.max_viewers)),
            config,
            memo: ArcSwapOption::empty(),
            token,
        });

        Router::new()
            .route(&path, get(video))
            .route(STILL_PATH, get(still))
            .fallback(not_found)
            .with_state(state)
    }

    /// Serve until `token` is cancelled; open streams end with it.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, path = %self.config.path, "stream server listening");
        let router = Self::router(self.config, self.shared, token.clone());
        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .context("stream server failed")?;
        info!("stream server stopped");
        Ok(())
    }
}

async fn video(State(state): State<Arc<StreamState>>) -> Response {
    let Ok(permit) = state.viewers.clone().try_acquire_owned() else {
        warn!("viewer limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many viewers\n").into_response();
    };

    let viewer = Uuid::new_v4();
    let parts = stream! {
        let _permit = permit;
        info!(%viewer, "viewer connected");
        let mut interval = tokio::time::interval(state.config.frame_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let cancelled = tokio::select! {
                _ = interval.tick() => false,
                _ = state.token.cancelled() => true,
            };
            if cancelled {
                break;
            }

            match state.current().await {
                Ok(Some(encoded)) => {
                    yield Ok::<Bytes, Infallible>(encoded.part.clone());
                }
                Ok(None) => {}
                Err(e) => warn!(%viewer, "failed to encode frame: {:#}", e),
            }
        }
        debug!(%viewer, "viewer stream finished");
    };

    (
        [
            (header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame"),
            (header::CACHE_CONTROL, "no-cache, private"),
            (header::PRAGMA, "no-cache"),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

/// One annotated JPEG of the current frame.
async fn still(State(state): State<Arc<StreamState>>) -> Response {
    match state.current().await {
        Ok(Some(encoded)) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache, private"),
            ],
            encoded.jpeg.clone(),
        )
            .into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("failed to encode frame: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "encode failed\n").into_response()
        }
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found\n").into_response()
}
