use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::ImageReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ringwatch::acquisition::{self, AcquisitionLoop};
use ringwatch::config::{DetectionArgs, ServeArgs};
use ringwatch::server::protocol::Response;
use ringwatch::{CommandServer, DetectionCache, DetectionConfig, DetectionPipeline, Frame, FrameCache, ServerState, StreamServer};

#[derive(Parser)]
#[command(name = "ringwatch")]
#[command(about = "Detect dark ring markers in a live camera feed and serve the results")]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run acquisition, the command server and the stream server
    Serve {
        #[command(flatten)]
        serve: ServeArgs,

        #[command(flatten)]
        detection: DetectionArgs,
    },
    /// Detect circles in one image and print the response JSON
    Detect {
        /// Path to input image file
        #[arg(value_name = "IMAGE")]
        image_path: PathBuf,

        /// Pretty-print the JSON
        #[arg(long)]
        pretty: bool,

        #[command(flatten)]
        detection: DetectionArgs,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Mode::Serve { serve, detection } => run_server(serve, detection.into()).await,
        Mode::Detect {
            image_path,
            pretty,
            detection,
        } => detect_once(image_path, pretty, detection.into()),
    }
}

async fn run_server(args: ServeArgs, detection: DetectionConfig) -> Result<()> {
    let frames = Arc::new(FrameCache::new());
    let detections = Arc::new(DetectionCache::new());
    let detector = Arc::new(DetectionPipeline::new(&detection).context("failed to build detection pipeline")?);
    info!(strategy = ?detector.strategy(), steps = ?detector.step_names(), "detection pipeline ready");

    let state = ServerState::new(frames.clone(), detections, detector);
    let command = CommandServer::bind(args.command_config(), state.clone()).await?;
    let stream = StreamServer::bind(args.stream_config(), state).await?;

    let token = CancellationToken::new();
    let source_config = args.source_config();
    let source = acquisition::open_source(&source_config)
        .with_context(|| format!("failed to open source {}", source_config.uri))?;
    let acquisition = AcquisitionLoop::new(source, frames, source_config.retry_delay)
        .spawn(token.clone())
        .context("failed to start acquisition thread")?;

    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!("failed to listen for ctrl-c: {}", e),
        }
        shutdown.cancel();
    });

    // Either server stopping takes the whole process down.
    let (command_result, stream_result) = tokio::join!(
        async {
            let result = command.run(token.clone()).await;
            token.cancel();
            result
        },
        async {
            let result = stream.run(token.clone()).await;
            token.cancel();
            result
        }
    );

    tokio::task::spawn_blocking(move || acquisition.join())
        .await
        .context("failed to wait for acquisition thread")?
        .map_err(|_| anyhow::anyhow!("acquisition thread panicked"))?;

    command_result?;
    stream_result?;
    Ok(())
}

fn detect_once(image_path: PathBuf, pretty: bool, detection: DetectionConfig) -> Result<()> {
    info!("Loading image: {:?}", image_path);
    let img = ImageReader::open(&image_path)?
        .decode()
        .map_err(|e| anyhow::anyhow!("Failed to decode image: {}", e))?;
    info!("Image loaded: {}x{}", img.width(), img.height());

    let detector = DetectionPipeline::new(&detection)?;
    let result = detector.detect(&Frame::new(1, img.to_rgb8()));
    let response = Response::detection("detect", &result);

    let json = if pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    println!("{}", json);
    Ok(())
}
