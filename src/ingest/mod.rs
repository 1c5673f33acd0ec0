//! Frame ingestion sources.
//!
//! This module provides the origins frames are pulled from:
//! - MJPEG / JPEG snapshots over HTTP (network cameras, another stream server)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//! - Synthetic scenes (`stub://`, testing and demos)
//!
//! Live origins are wrapped in `LatestFrameSource`: a capture thread keeps a
//! depth-1 buffer filled so the consumer always receives the newest frame and
//! stale frames are dropped instead of queued.
//!
//! Sources report per-frame problems as `Error::ReadFailure` and never panic on
//! bad input. An origin that will never yield again reports `Error::SourceEnded`.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::frame::Frame;

mod latest;
pub mod mjpeg;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use latest::LatestFrameSource;
pub use mjpeg::MjpegSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// A video origin that yields frames on demand.
pub trait FrameSource: Send {
    /// Human-readable origin, used in logs.
    fn describe(&self) -> String;

    /// Frame rate the origin advertises, if any. Informational only.
    fn nominal_fps(&self) -> Option<f64> {
        None
    }

    /// Block until the next frame is available or the read fails.
    fn read_frame(&mut self) -> Result<Frame>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn nominal_fps(&self) -> Option<f64> {
        (**self).nominal_fps()
    }

    fn read_frame(&mut self) -> Result<Frame> {
        (**self).read_frame()
    }
}

/// Configuration for opening a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `http(s)://` MJPEG or snapshot URL, `/dev/videoN`, or `stub://name?...`.
    pub url: String,
    /// Longest a single read may block before it counts as a read failure.
    pub read_timeout: Duration,
    /// Requested frame width (devices and synthetic sources).
    pub width: u32,
    /// Requested frame height (devices and synthetic sources).
    pub height: u32,
    /// Decimate to at most this rate. 0 keeps the origin's cadence.
    pub target_fps: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            read_timeout: Duration::from_secs(5),
            width: 640,
            height: 480,
            target_fps: 0,
        }
    }
}

impl SourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// Open the origin named by `config.url`.
///
/// Fails with `Error::SourceUnavailable` when the origin cannot be reached or the
/// scheme is not supported by this build.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let url = config.url.trim();
    let source: Box<dyn FrameSource> = if url.starts_with("stub://") {
        Box::new(SyntheticSource::from_config(config)?)
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let camera = MjpegSource::open(config)?;
        Box::new(LatestFrameSource::spawn(camera, config.read_timeout)?)
    } else if is_device_path(url) {
        open_device(config)?
    } else {
        return Err(Error::source_unavailable(
            url,
            "unsupported origin; expected http(s)://, /dev/videoN or stub://",
        ));
    };

    match source.nominal_fps() {
        Some(fps) => log::info!("opened {} ({:.1} fps nominal)", source.describe(), fps),
        None => log::info!("opened {} (nominal fps unknown)", source.describe()),
    }
    Ok(source)
}

fn is_device_path(url: &str) -> bool {
    url.starts_with("/dev/video") || url.starts_with("v4l2://")
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let camera = V4l2Source::open(config)?;
    Ok(Box::new(LatestFrameSource::spawn(
        camera,
        config.read_timeout,
    )?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    Err(Error::source_unavailable(
        config.url.trim(),
        "local camera devices require the ingest-v4l2 feature",
    ))
}
