//! TCP command server. One task per session; detections run on the blocking
//! pool behind a small gate so concurrent requests queue instead of
//! oversubscribing the CPU.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::CommandConfig;
use crate::server::ServerState;
use crate::server::protocol::{self, Command, ErrorCode, Response};

pub struct CommandServer {
    listener: TcpListener,
    config: CommandConfig,
    state: Arc<ServerState>,
}

impl CommandServer {
    pub async fn bind(config: CommandConfig, state: Arc<ServerState>) -> Result<Self> {
        let listener = TcpListener::bind(config.addr)
            .await
            .with_context(|| format!("failed to bind command server on {}", config.addr))?;
        Ok(Self {
            listener,
            config,
            state,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept sessions until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "command server listening");

        let sessions = Arc::new(Semaphore::new(self.config.max_sessions));
        let detect_gate = Arc::new(Semaphore::new(self.config.max_concurrent_detections));

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = token.cancelled() => break,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let Ok(permit) = sessions.clone().try_acquire_owned() else {
                warn!(%peer, "session limit reached, rejecting connection");
                tokio::spawn(reject_busy(stream));
                continue;
            };

            let session = Session {
                state: self.state.clone(),
                detect_gate: detect_gate.clone(),
                max_line_length: self.config.max_line_length,
            };
            let span = info_span!("session", id = %Uuid::new_v4(), %peer);
            let token = token.clone();
            tokio::spawn(
                async move {
                    let _permit = permit;
                    info!("session opened");
                    match session.serve(stream, token).await {
                        Ok(()) => info!("session closed"),
                        Err(e) => info!("session ended: {}", e),
                    }
                }
                .instrument(span),
            );
        }

        info!("command server stopped");
        Ok(())
    }
}

async fn reject_busy(mut stream: TcpStream) {
    let response = Response::error(ErrorCode::ServerBusy, None, "too many concurrent sessions");
    if let Ok(line) = response.to_line() {
        let _ = stream.write_all(line.as_bytes()).await;
    }
    let _ = stream.shutdown().await;
}

enum Record {
    Line(Vec<u8>),
    /// A record longer than the line limit; its bytes were discarded.
    Oversized,
    Eof,
}

/// Read one `\n`-terminated record of at most `max_length` bytes. A partial
/// record at end of stream is dropped.
async fn read_record<R: AsyncBufRead + Unpin>(reader: &mut R, max_length: usize) -> io::Result<Record> {
    let mut buf = Vec::new();
    let limit = (max_length as u64).saturating_add(1);
    if (&mut *reader).take(limit).read_until(b'\n', &mut buf).await? == 0 {
        return Ok(Record::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        return Ok(Record::Line(buf));
    }
    if buf.len() <= max_length {
        return Ok(Record::Eof);
    }

    // Skip the rest of the oversized record.
    loop {
        buf.clear();
        if (&mut *reader).take(8192).read_until(b'\n', &mut buf).await? == 0 {
            return Ok(Record::Eof);
        }
        if buf.last() == Some(&b'\n') {
            return Ok(Record::Oversized);
        }
    }
}

struct Session {
    state: Arc<ServerState>,
    detect_gate: Arc<Semaphore>,
    max_line_length: usize,
}

impl Session {
    async fn serve(&self, stream: TcpStream, token: CancellationToken) -> io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            let record = tokio::select! {
                record = read_record(&mut reader, self.max_line_length) => record?,
                _ = token.cancelled() => return Ok(()),
            };

            let response = match record {
                Record::Eof => return Ok(()),
                Record::Oversized => {
                    Response::invalid_json(format!("line exceeds {} bytes", self.max_line_length))
                }
                Record::Line(bytes) => match std::str::from_utf8(&bytes) {
                    Err(e) => Response::invalid_json(format!("request is not UTF-8: {e}")),
                    Ok(text) => {
                        let text = text.trim();
                        if text.is_empty() {
                            continue;
                        }
                        debug!(request = text, "received");
                        self.handle(text).await
                    }
                },
            };

            let line = response.to_line().map_err(io::Error::other)?;
            write_half.write_all(line.as_bytes()).await?;
        }
    }

    async fn handle(&self, text: &str) -> Response {
        match protocol::parse_command(text) {
            Err(e) => Response::invalid_json(e),
            Ok(Command::Ping) => Response::pong(),
            Ok(Command::Unknown(name)) => Response::unknown_command(&name),
            Ok(Command::Detect(name)) => self.detect(&name).await,
        }
    }

    /// Run the pipeline on the newest frame. The blocking task owns the gate
    /// permit and commits its result even if this session goes away.
    async fn detect(&self, name: &str) -> Response {
        if self.state.frames.snapshot().is_none() {
            return Response::error(ErrorCode::NoFrame, Some(name), ErrorCode::NoFrame.to_string());
        }

        let permit = match self.detect_gate.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Response::error(ErrorCode::DetectionFailed, Some(name), "detector is shut down"),
        };
        // Take the snapshot after queueing so a waiting request sees the newest frame.
        let Some(frame) = self.state.frames.snapshot() else {
            return Response::error(ErrorCode::NoFrame, Some(name), ErrorCode::NoFrame.to_string());
        };

        let state = self.state.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let result = Arc::new(state.detector.detect(&frame));
            state.detections.update(result.clone());
            result
        });

        match task.await {
            Ok(result) => {
                info!(
                    frame = result.frame_sequence,
                    circles = result.circles.len(),
                    success = result.is_success(),
                    "detect"
                );
                Response::detection(name, &result)
            }
            Err(e) => {
                warn!("detection task failed: {}", e);
                Response::error(ErrorCode::DetectionFailed, Some(name), format!("detection task failed: {e}"))
            }
        }
    }
}
