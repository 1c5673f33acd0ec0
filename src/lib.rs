//! dronewatch
//!
//! Real-time frame pipeline for a drone camera feed.
//!
//! # Architecture
//!
//! Two independent producers share the process but no mutable state:
//!
//! 1. **Detection pipeline** (`pipeline`): FrameSource → DetectorBackend →
//!    confidence filter → Annotator / DetectionLog → optional display sink.
//! 2. **Stream encoder** (`stream`): its own FrameSource → per-frame transform →
//!    JPEG → multipart parts fanned out to HTTP clients (`api`).
//!
//! The detection log is append-only CSV, written by a single owner thread.
//!
//! # Module Structure
//!
//! - `frame`: Frame and the bounded FrameBuffer used between threads
//! - `ingest`: Frame sources (MJPEG over HTTP, V4L2 devices, synthetic)
//! - `detect`: Detector backends and the registry that builds them
//! - `annotate`: Pure box/label rendering
//! - `log`: Detection records, the CSV log and its writer thread
//! - `pipeline`: The detection loop
//! - `stream`: JPEG multipart encoding and client fan-out
//! - `api`: HTTP endpoints (stream, telemetry, health)
//! - `config`: Daemon configuration (file, environment, validation)
//! - `display`: Sinks for annotated frames
//! - `telemetry`: Simulated position/attitude samples
//! - Core types: TimeBucket

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod display;
pub mod error;
mod font;
pub mod frame;
pub mod ingest;
pub mod log;
pub mod pipeline;
pub mod stream;
pub mod telemetry;

pub use annotate::Annotator;
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectorBackend};
pub use display::{DisplaySink, NullDisplay, SnapshotDisplay};
pub use error::{Error, Result};
pub use frame::{BufferRead, Frame, FrameBuffer, LATEST_FRAME_DEPTH};
pub use ingest::{open_source, FrameSource, SourceConfig};
pub use crate::log::{
    read_log, verify_log_with, DetectionLog, DetectionRecord, LogHandle, LogSink, LogSummary,
    LogWriter, LOG_HEADER,
};
pub use pipeline::{
    filter_detections, Clock, DetectionFailurePolicy, IterationOutcome, MonotonicClock,
    PipelineConfig, PipelineLoop, PipelineState, PipelineStats, StopHandle,
};
pub use stream::{
    spawn_producer, DetectAndAnnotate, EncoderConfig, FrameTransform, Passthrough,
    PlaceholderOverlay, StreamEncoder, StreamHub, Subscription, BOUNDARY, CONTENT_TYPE,
};
pub use telemetry::{SimulatedTelemetry, TelemetrySample};

// -------------------- Time Buckets --------------------

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Elapsed time since pipeline start, at one-second resolution, rendered as a
/// time of day (`HH:MM:SS`). Wraps at 24 hours.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeBucket {
    /// seconds into the (wrapped) day, always < 86400
    second_of_day: u32,
}

impl TimeBucket {
    pub fn from_elapsed(elapsed: Duration) -> Self {
        Self::from_secs(elapsed.as_secs())
    }

    pub fn from_secs(secs: u64) -> Self {
        TimeBucket {
            second_of_day: (secs % SECONDS_PER_DAY) as u32,
        }
    }

    pub fn hours(&self) -> u32 {
        self.second_of_day / 3600
    }

    pub fn minutes(&self) -> u32 {
        (self.second_of_day / 60) % 60
    }

    pub fn seconds(&self) -> u32 {
        self.second_of_day % 60
    }

    pub fn as_secs(&self) -> u32 {
        self.second_of_day
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}",
            self.hours(),
            self.minutes(),
            self.seconds()
        )
    }
}

impl FromStr for TimeBucket {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split(':');
        let mut field = |name: &str, max: u32| -> anyhow::Result<u32> {
            let raw = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("time bucket '{}' missing {}", s, name))?;
            if raw.len() != 2 {
                anyhow::bail!("time bucket '{}' has malformed {}", s, name);
            }
            let value: u32 = raw
                .parse()
                .map_err(|_| anyhow::anyhow!("time bucket '{}' has non-numeric {}", s, name))?;
            if value > max {
                anyhow::bail!("time bucket '{}' {} out of range", s, name);
            }
            Ok(value)
        };
        let h = field("hours", 23)?;
        let m = field("minutes", 59)?;
        let sec = field("seconds", 59)?;
        if parts.next().is_some() {
            anyhow::bail!("time bucket '{}' has trailing fields", s);
        }
        Ok(TimeBucket {
            second_of_day: h * 3600 + m * 60 + sec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_elapsed_as_time_of_day() {
        assert_eq!(TimeBucket::from_secs(0).to_string(), "00:00:00");
        assert_eq!(TimeBucket::from_secs(59).to_string(), "00:00:59");
        assert_eq!(TimeBucket::from_secs(3_723).to_string(), "01:02:03");
        assert_eq!(
            TimeBucket::from_elapsed(Duration::from_millis(61_999)).to_string(),
            "00:01:01"
        );
    }

    #[test]
    fn wraps_at_twenty_four_hours() {
        assert_eq!(TimeBucket::from_secs(SECONDS_PER_DAY).to_string(), "00:00:00");
        assert_eq!(
            TimeBucket::from_secs(SECONDS_PER_DAY + 3_661).to_string(),
            "01:01:01"
        );
    }

    #[test]
    fn parses_its_own_output() {
        for secs in [0u64, 1, 59, 60, 3_599, 3_600, 86_399] {
            let bucket = TimeBucket::from_secs(secs);
            let parsed: TimeBucket = bucket.to_string().parse().unwrap();
            assert_eq!(parsed, bucket);
        }
    }

    #[test]
    fn rejects_malformed_buckets() {
        for bad in ["", "1:02:03", "24:00:00", "00:60:00", "00:00:0x", "00:00:00:00"] {
            assert!(bad.parse::<TimeBucket>().is_err(), "accepted {:?}", bad);
        }
    }
}
