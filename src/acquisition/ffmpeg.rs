use std::ffi::OsString;
use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbImage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{FrameSource, SourceError};

const PROGRAM: &str = "ffmpeg";

/// How often a waiting pull checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Decodes a network stream or capture device through an `ffmpeg` child
/// process emitting raw `rgb24` frames of a fixed size on stdout.
///
/// The child is spawned lazily and its stdout is drained by a reader thread,
/// so a pull can give up after `read_timeout`. When the pipe breaks or stalls
/// the child is killed and the next call spawns a fresh one, which is how
/// reconnects happen.
pub struct FfmpegSource {
    program: OsString,
    uri: String,
    width: u32,
    height: u32,
    read_timeout: Duration,
    token: Option<CancellationToken>,
    process: Option<Running>,
}

struct Running {
    child: Child,
    frames: Receiver<io::Result<Vec<u8>>>,
}

impl FfmpegSource {
    pub fn new(uri: &str, width: u32, height: u32) -> Result<Self, SourceError> {
        if width == 0 || height == 0 {
            return Err(SourceError::Geometry { width, height });
        }
        Ok(Self {
            program: OsString::from(PROGRAM),
            uri: uri.to_string(),
            width,
            height,
            read_timeout: Duration::from_secs(5),
            token: None,
            process: None,
        })
    }

    /// Longest wait for one frame before the child is restarted.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Run this executable instead of `ffmpeg` from `PATH`.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        if self.uri.starts_with("rtsp://") || self.uri.starts_with("rtsps://") {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-max_delay")
                .arg("0");
        } else if self.uri.starts_with("/dev/video") {
            cmd.arg("-f").arg("video4linux2");
        }

        cmd.arg("-i")
            .arg(&self.uri)
            .arg("-an")
            .arg("-vf")
            .arg(format!("scale={}:{}", self.width, self.height))
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::inherit());
        cmd
    }

    fn spawn(&mut self) -> Result<(), SourceError> {
        let spawn_error = |source: io::Error| SourceError::Spawn {
            program: self.program.to_string_lossy().into_owned(),
            source,
        };
        let mut child = self.command().spawn().map_err(spawn_error)?;
        let Some(stdout) = child.stdout.take() else {
            stop(&mut child);
            return Err(spawn_error(io::Error::other("stdout was not captured")));
        };

        let (sender, frames) = mpsc::sync_channel(0);
        let frame_len = self.frame_len();
        let reader = thread::Builder::new()
            .name("ffmpeg-reader".to_string())
            .spawn(move || read_frames(stdout, frame_len, sender));
        if let Err(e) = reader {
            stop(&mut child);
            return Err(spawn_error(e));
        }

        info!(uri = %self.uri, pid = child.id(), "ffmpeg started");
        self.process = Some(Running { child, frames });
        Ok(())
    }

    /// Kill the child; its reader thread ends on the closed pipe.
    fn shutdown(&mut self) {
        if let Some(mut running) = self.process.take() {
            stop(&mut running.child);
        }
    }

    fn wait_for_frame(&self, frames: &Receiver<io::Result<Vec<u8>>>) -> Result<Vec<u8>, SourceError> {
        let started = Instant::now();
        loop {
            match frames.recv_timeout(CANCEL_POLL) {
                Ok(Ok(bytes)) => return Ok(bytes),
                Ok(Err(e)) => return Err(SourceError::Read(e)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SourceError::Read(io::ErrorKind::UnexpectedEof.into()));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                        return Err(SourceError::Cancelled);
                    }
                    if started.elapsed() >= self.read_timeout {
                        return Err(SourceError::Timeout(self.read_timeout));
                    }
                }
            }
        }
    }
}

/// Reader thread body: one message per frame, ending after the first error
/// or once the source stops listening.
fn read_frames(mut stdout: ChildStdout, frame_len: usize, frames: SyncSender<io::Result<Vec<u8>>>) {
    loop {
        let mut buffer = vec![0u8; frame_len];
        let result = stdout.read_exact(&mut buffer).map(|()| buffer);
        let failed = result.is_err();
        if frames.send(result).is_err() || failed {
            return;
        }
    }
}

impl FrameSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<RgbImage, SourceError> {
        if self.process.is_none() {
            self.spawn()?;
        }
        let Some(running) = self.process.as_ref() else {
            return Err(SourceError::Read(io::ErrorKind::NotConnected.into()));
        };

        match self.wait_for_frame(&running.frames) {
            Ok(bytes) => RgbImage::from_raw(self.width, self.height, bytes).ok_or(SourceError::Geometry {
                width: self.width,
                height: self.height,
            }),
            Err(e) => {
                self.shutdown();
                Err(e)
            }
        }
    }

    fn describe(&self) -> String {
        format!("ffmpeg {} ({}x{})", self.uri, self.width, self.height)
    }

    fn watch(&mut self, token: &CancellationToken) {
        self.token = Some(token.clone());
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop(child: &mut Child) {
    let _ = child.kill();
    match child.wait() {
        Ok(status) => debug!(%status, "ffmpeg exited"),
        Err(e) => debug!("failed to reap ffmpeg: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_geometry_is_rejected() {
        assert!(matches!(
            FfmpegSource::new("rtsp://camera/stream", 0, 1080),
            Err(SourceError::Geometry { width: 0, height: 1080 })
        ));
    }

    #[test]
    fn rtsp_forces_tcp_transport() {
        let source = FfmpegSource::new("rtsp://camera/stream", 640, 480).unwrap();
        let cmd = source.command();
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        let at = args.iter().position(|a| a == "-rtsp_transport").unwrap();
        assert_eq!(args[at + 1], "tcp");
        assert!(args.contains(&"scale=640:480".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }
}
