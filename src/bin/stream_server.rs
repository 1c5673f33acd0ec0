//! stream_server - serve a camera feed and simulated telemetry over HTTP
//!
//! This daemon:
//! 1. Opens its own camera source (independent of detectd)
//! 2. Applies the configured per-frame transform and JPEG-encodes frames
//! 3. Fans the multipart stream out to every connected viewer
//! 4. Serves simulated telemetry as JSON

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;

use dronewatch::{
    api::{ApiConfig, ApiServer},
    config::{StreamServerConfig, StreamTransform},
    open_source,
    stream::{
        spawn_producer, DetectAndAnnotate, FrameTransform, Passthrough, PlaceholderOverlay,
        StreamEncoder, StreamHub,
    },
    BackendRegistry, SimulatedTelemetry,
};

#[derive(Parser, Debug)]
#[command(name = "stream_server", about = "Serve a drone camera stream and telemetry")]
struct Args {
    /// JSON or TOML config file
    #[arg(long, value_name = "PATH", env = "DRONEWATCH_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = StreamServerConfig::load_from(args.config.as_deref())?;

    let transform: Box<dyn FrameTransform> = match cfg.transform {
        StreamTransform::Placeholder => Box::new(PlaceholderOverlay::new()),
        StreamTransform::Detect => {
            let detector = BackendRegistry::with_builtin().build(&cfg.detector)?;
            Box::new(DetectAndAnnotate::new(detector, cfg.confidence_threshold))
        }
        StreamTransform::Passthrough => Box::new(Passthrough),
    };
    let source = open_source(&cfg.source.source_config())
        .with_context(|| format!("open stream source {}", cfg.source.url))?;
    let encoder = StreamEncoder::new(source, transform, cfg.encoder_config());

    let hub = StreamHub::new(cfg.client_buffer);
    let producer = spawn_producer(hub.clone(), encoder)?;

    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
        ..ApiConfig::default()
    };
    let telemetry = SimulatedTelemetry::new(cfg.telemetry_location.clone());
    let api_handle = ApiServer::new(api_config, hub, telemetry).spawn()?;
    log::info!(
        "stream api listening on http://{} (feed at /processed_video_feed)",
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("stream_server waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping stream server...");
    let parts = producer.stop()?;
    api_handle.stop()?;
    log::info!("stream_server stopped after {} parts", parts);
    Ok(())
}
