//! detectd - drone camera detection daemon
//!
//! This daemon:
//! 1. Opens the configured camera source
//! 2. Runs every frame through the detector backend
//! 3. Appends surviving detections to the CSV detection log
//! 4. Optionally writes annotated preview snapshots
//!
//! Stop with Ctrl-C or by typing `q` on stdin; queued log rows are written
//! before the process exits.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;

use dronewatch::{
    config::DetectdConfig, open_source, BackendRegistry, DetectionLog, LogWriter, PipelineLoop,
    SnapshotDisplay, StopHandle,
};

#[derive(Parser, Debug)]
#[command(name = "detectd", about = "Detect objects in a drone camera feed and log them")]
struct Args {
    /// JSON or TOML config file
    #[arg(long, value_name = "PATH", env = "DRONEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// List the detector backends in this build and exit
    #[arg(long)]
    list_detectors: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let registry = BackendRegistry::with_builtin();
    if args.list_detectors {
        for name in registry.list() {
            println!("{}", name);
        }
        return Ok(());
    }

    let cfg = DetectdConfig::load_from(args.config.as_deref())?;
    log::info!(
        "detectd {} starting: source={}, log={}, detector={}",
        env!("CARGO_PKG_VERSION"),
        cfg.source.url,
        cfg.log_path.display(),
        cfg.detector.backend
    );

    let detector = registry.build(&cfg.detector)?;
    let source = open_source(&cfg.source.source_config())
        .with_context(|| format!("open camera source {}", cfg.source.url))?;
    let log = DetectionLog::initialize(&cfg.log_path)
        .with_context(|| format!("initialize detection log {}", cfg.log_path.display()))?;
    let writer = LogWriter::spawn(log)?;

    let stop = StopHandle::new();
    let mut pipeline = PipelineLoop::new(source, detector, writer.handle(), cfg.pipeline_config())
        .with_stop_handle(stop.clone());
    if let Some(path) = &cfg.preview_path {
        log::info!(
            "writing annotated preview to {} every {} frame(s)",
            path.display(),
            cfg.preview_every
        );
        pipeline =
            pipeline.with_display(Box::new(SnapshotDisplay::new(path).every(cfg.preview_every)));
    }

    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.stop()).expect("error setting Ctrl-C handler");
    }
    spawn_quit_listener(stop)?;

    log::info!("detectd running (Ctrl-C or 'q' + Enter to stop)");
    let outcome = pipeline.run();
    drop(pipeline);

    let summary = writer.shutdown()?;
    log::info!(
        "detection log closed: {} rows in {} batches at {}",
        summary.rows_written,
        summary.batches,
        summary.path.display()
    );

    let stats = outcome?;
    log::info!(
        "detectd stopped: {} frames, {} records, {} read failures, {} detection failures",
        stats.frames_processed,
        stats.records_written,
        stats.read_failures,
        stats.detection_failures
    );
    Ok(())
}

/// Stop the loop when the operator types `q`. EOF on stdin is ignored.
fn spawn_quit_listener(stop: StopHandle) -> Result<()> {
    std::thread::Builder::new()
        .name("stdin-quit".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().eq_ignore_ascii_case("q") {
                    log::info!("quit requested from stdin");
                    stop.stop();
                    break;
                }
            }
        })
        .context("spawn stdin listener")?;
    Ok(())
}
