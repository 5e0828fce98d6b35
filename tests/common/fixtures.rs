use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};
use ringwatch::{
    CommandConfig, CommandServer, DetectionCache, DetectionConfig, DetectionPipeline, Frame, FrameCache, ServerState,
    StreamConfig, StreamServer,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;

pub const RING_DARK: u8 = 20;
pub const BACKGROUND: u8 = 220;

/// Generous bound for one request; detection runs unoptimised in test builds.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// A dark ring `(cx, cy, inner, outer)` description.
#[derive(Debug, Clone, Copy)]
pub struct Ring {
    pub cx: f32,
    pub cy: f32,
    pub inner: f32,
    pub outer: f32,
}

impl Ring {
    pub const fn new(cx: f32, cy: f32, inner: f32, outer: f32) -> Self {
        Self { cx, cy, inner, outer }
    }

    fn contains(&self, x: u32, y: u32) -> bool {
        let d = ((x as f32 - self.cx).powi(2) + (y as f32 - self.cy).powi(2)).sqrt();
        d >= self.inner && d <= self.outer
    }
}

/// The marker used by most tests: centered in a 400x400 frame, radius 60, 8 px thick.
pub const CENTERED_RING: Ring = Ring::new(200.0, 200.0, 52.0, 60.0);

/// Bright background with the given dark rings.
pub fn ring_image(width: u32, height: u32, rings: &[Ring]) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        if rings.iter().any(|r| r.contains(x, y)) {
            Rgb([RING_DARK; 3])
        } else {
            Rgb([BACKGROUND; 3])
        }
    })
}

pub fn ring_frame(sequence: u64) -> Frame {
    Frame::new(sequence, ring_image(400, 400, &[CENTERED_RING]))
}

pub fn blank_frame(sequence: u64) -> Frame {
    Frame::new(sequence, RgbImage::from_pixel(400, 400, Rgb([BACKGROUND; 3])))
}

/// Sprinkle isolated black and white pixels over `image` (deterministic).
pub fn add_salt_and_pepper(image: &mut RgbImage, every: u32) {
    let mut state: u32 = 0x2545_f491;
    for pixel in image.pixels_mut() {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        if state % every == 0 {
            *pixel = if state & 0x100 == 0 { Rgb([0; 3]) } else { Rgb([255; 3]) };
        }
    }
}

/// Both servers on ephemeral localhost ports, sharing fresh caches.
/// Everything shuts down when the value is dropped.
pub struct TestServer {
    pub command_addr: SocketAddr,
    pub stream_addr: SocketAddr,
    pub frames: Arc<FrameCache>,
    pub detections: Arc<DetectionCache>,
    pub token: CancellationToken,
}

pub fn local_command_config() -> CommandConfig {
    CommandConfig {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..CommandConfig::default()
    }
}

pub fn local_stream_config() -> StreamConfig {
    StreamConfig {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        frame_interval: Duration::from_millis(10),
        ..StreamConfig::default()
    }
}

impl TestServer {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(local_command_config(), local_stream_config()).await
    }

    pub async fn start_with(command: CommandConfig, stream: StreamConfig) -> anyhow::Result<Self> {
        let frames = Arc::new(FrameCache::new());
        let detections = Arc::new(DetectionCache::new());
        let detector = Arc::new(DetectionPipeline::new(&DetectionConfig::default())?);
        let state = ServerState::new(frames.clone(), detections.clone(), detector);

        let command_server = CommandServer::bind(command, state.clone()).await?;
        let stream_server = StreamServer::bind(stream, state).await?;
        let command_addr = command_server.local_addr()?;
        let stream_addr = stream_server.local_addr()?;

        let token = CancellationToken::new();
        tokio::spawn(command_server.run(token.clone()));
        tokio::spawn(stream_server.run(token.clone()));

        Ok(Self {
            command_addr,
            stream_addr,
            frames,
            detections,
            token,
        })
    }

    pub fn publish(&self, frame: Frame) {
        self.frames.publish(frame);
    }

    pub async fn client(&self) -> anyhow::Result<Client> {
        Client::connect(self.command_addr).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Line-oriented command client.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// Next response line parsed as JSON; fails on EOF or timeout.
    pub async fn read_response(&mut self) -> anyhow::Result<Value> {
        let mut line = String::new();
        let n = tokio::time::timeout(REPLY_TIMEOUT, self.reader.read_line(&mut line)).await??;
        anyhow::ensure!(n > 0, "connection closed before a response arrived");
        anyhow::ensure!(line.ends_with('\n'), "response not newline terminated: {line:?}");
        Ok(serde_json::from_str(&line)?)
    }

    pub async fn request(&mut self, line: &str) -> anyhow::Result<Value> {
        self.send_raw(format!("{line}\n").as_bytes()).await?;
        self.read_response().await
    }

    /// True once the server has closed the connection.
    pub async fn is_closed(&mut self) -> anyhow::Result<bool> {
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(REPLY_TIMEOUT, self.reader.read(&mut buf)).await??;
        Ok(n == 0)
    }
}

/// Minimal HTTP/1.1 GET returning the open stream and the response head.
pub async fn http_get(addr: SocketAddr, path: &str) -> anyhow::Result<(TcpStream, String, Vec<u8>)> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut received = Vec::new();
    let head_end = read_until_contains(&mut stream, &mut received, b"\r\n\r\n").await?;
    let head = String::from_utf8_lossy(&received[..head_end]).into_owned();
    let rest = received[head_end + 4..].to_vec();
    Ok((stream, head, rest))
}

/// GET `path` and read a `Content-Length` delimited body.
pub async fn http_get_body(addr: SocketAddr, path: &str) -> anyhow::Result<(String, Vec<u8>)> {
    let (mut stream, head, mut body) = http_get(addr, path).await?;
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    while body.len() < length {
        read_more(&mut stream, &mut body).await?;
    }
    body.truncate(length);
    Ok((head, body))
}

/// Read from `stream` into `buffer` until `needle` appears; returns its offset.
pub async fn read_until_contains(stream: &mut TcpStream, buffer: &mut Vec<u8>, needle: &[u8]) -> anyhow::Result<usize> {
    loop {
        if let Some(at) = find(buffer, needle) {
            return Ok(at);
        }
        read_more(stream, buffer).await?;
    }
}

/// Append one read's worth of bytes to `buffer`; fails on EOF or timeout.
pub async fn read_more(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> anyhow::Result<()> {
    let mut chunk = [0u8; 8192];
    let n = tokio::time::timeout(REPLY_TIMEOUT, stream.read(&mut chunk)).await??;
    anyhow::ensure!(n > 0, "stream closed");
    buffer.extend_from_slice(&chunk[..n]);
    Ok(())
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
