//! rpi-webrtc-streamer: single-peer WebRTC camera streamer (spec.md §1).
//!
//! Wires the ten components together per spec.md §6 "Process-wide
//! singletons": Config → Encoder Wrapper → Session Proxy → Signaling.

mod config;
mod encoder;
mod error;
mod frame;
mod quality;
mod session;
mod signaling;
mod still;
mod webrtc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::error;

use config::ConfigRegistry;
use encoder::{DelayedReinitController, EncoderWrapper};
use error::StreamerError;
use quality::QualityController;
use session::SessionProxy;
use signaling::SignalingServer;

#[derive(Parser, Debug)]
#[command(name = "rpi-webrtc-streamer", about = "Single-peer WebRTC camera streamer")]
struct Cli {
    /// Path to the key=value config file.
    #[arg(long, default_value = "/etc/rpi-webrtc-streamer.conf")]
    config: PathBuf,

    /// Directory still captures are written to and scanned from.
    #[arg(long, default_value = "/tmp/still")]
    still_dir: PathBuf,

    /// Address the signaling WebSocket server binds to.
    #[arg(long, default_value = "0.0.0.0:8890")]
    listen: String,

    /// STUN server used for ICE gathering.
    #[arg(long, default_value = "stun:stun.l.google.com:19302")]
    stun_server: String,

    /// Identifier reported in response to a `request deviceid` command.
    #[arg(long, default_value = "rpi-webrtc-streamer-0")]
    device_id: String,

    /// Log filter, e.g. "info" or "rpi_webrtc_streamer=debug".
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Builds the camera/encoder graphs against `videotestsrc`/test JPEG
    /// sources instead of the hardware camera.
    #[arg(long)]
    test_mode: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cli.log_level.clone()))
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal error");
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), StreamerError> {
    gstreamer::init().map_err(|e| error::EncoderError::Gstreamer(e.to_string()))?;

    let config = Arc::new(ConfigRegistry::load(&cli.config)?);
    let encoder = Arc::new(EncoderWrapper::new(cli.test_mode));
    let quality = Arc::new(QualityController::new());
    let reinit = Arc::new(DelayedReinitController::new());
    let session = Arc::new(SessionProxy::new());

    // Still capture is mutually exclusive with the live encoder, sharing the
    // same `EncoderWrapper` handle to observe camera-busy state; it will be
    // dispatched from the signaling layer's `request deviceid`-style surface
    // once a still-capture command is added to the wire contract.
    let _still = Arc::new(still::StillCapture::new(
        Arc::clone(&encoder),
        &cli.still_dir,
        still_max_age(&config),
    ));

    let server = Arc::new(SignalingServer::new(
        Arc::clone(&session),
        Arc::clone(&config),
        Arc::clone(&encoder),
        Arc::clone(&quality),
        Arc::clone(&reinit),
        cli.device_id.clone(),
        cli.stun_server.clone(),
    ));

    tokio::spawn(reinit_tick_loop(Arc::clone(&reinit), Arc::clone(&encoder)));

    server
        .run(&cli.listen)
        .await
        .map_err(|e| match e.downcast::<std::io::Error>() {
            Ok(io_err) => StreamerError::PortBind(io_err),
            Err(other) => StreamerError::PortBind(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
        })
}

fn still_max_age(config: &ConfigRegistry) -> Duration {
    let secs = config.get_int("still_max_age_secs").unwrap_or(300);
    Duration::from_secs(secs.max(0) as u64)
}

/// Drives the Delayed-Reinit Controller's 100 ms debounce tick process-wide
/// (spec.md §4.4, §5). The per-peer `EncoderAdapter` instances created by the
/// signaling layer share this same `DelayedReinitController` and
/// `EncoderWrapper`, so one global tick suffices given the single-active-peer
/// invariant.
async fn reinit_tick_loop(reinit: Arc<DelayedReinitController>, encoder: Arc<EncoderWrapper>) {
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    loop {
        interval.tick().await;
        if let encoder::ReinitAction::ReinitNow(params) = reinit.tick() {
            if let Err(e) = encoder.reinit(params) {
                tracing::warn!(error = %e, "process-wide debounced reinit failed");
            }
        }
    }
}
