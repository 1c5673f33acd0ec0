//! The detection loop.
//!
//! Each iteration of `PipelineLoop`:
//! 1. reads a frame (on failure: wait `read_backoff`, retry next iteration)
//! 2. runs the detector
//! 3. keeps detections with `confidence >= confidence_threshold`
//! 4. annotates survivors onto a copy and presents it to the display sink
//! 5. stamps the frame with the elapsed-time bucket since the first iteration
//! 6. appends one log record per survivor
//!
//! The loop runs until its `StopHandle` fires. A log write failure halts it
//! with `Error::Persistence`; a detector failure is handled per
//! `DetectionFailurePolicy`. Read failures never stop the loop.

use serde::Deserialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::annotate::Annotator;
use crate::detect::{Detection, DetectorBackend};
use crate::display::DisplaySink;
use crate::error::{Error, Result};
use crate::ingest::FrameSource;
use crate::log::{DetectionRecord, LogHandle};
use crate::TimeBucket;

/// Slice used when sleeping so a stop request is noticed promptly.
const STOP_POLL: Duration = Duration::from_millis(50);

/// What to do when the detector returns an error for a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionFailurePolicy {
    /// Warn and move on to the next frame.
    #[default]
    Skip,
    /// Halt the loop with `Error::DetectionFailure`.
    Fatal,
}

impl FromStr for DetectionFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "fatal" => Ok(Self::Fatal),
            other => Err(anyhow::anyhow!(
                "unknown detection failure policy '{}'; expected skip or fatal",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub confidence_threshold: f32,
    pub read_backoff: Duration,
    pub detection_failure: DetectionFailurePolicy,
    /// Interval between health lines while `run` is active.
    pub stats_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.30,
            read_backoff: Duration::from_millis(500),
            detection_failure: DetectionFailurePolicy::Skip,
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Keep detections at or above `threshold`, preserving order.
pub fn filter_detections(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
    detections.retain(|det| det.confidence >= threshold);
    detections
}

/// Monotonic time source for time buckets.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cloneable request to stop a running loop. Takes effect between iterations,
/// so an append already in progress completes.
#[derive(Clone, Debug, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    /// Terminal.
    Stopped,
}

/// Result of one `PipelineLoop::step`.
#[derive(Clone, Debug, PartialEq)]
pub enum IterationOutcome {
    Processed {
        seq: u64,
        bucket: TimeBucket,
        detections: usize,
        survivors: usize,
    },
    /// The read failed; the backoff has already elapsed.
    ReadFailed,
    /// The detector failed and the frame was skipped.
    DetectionSkipped,
    Stopped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub read_failures: u64,
    pub detection_failures: u64,
    pub records_written: u64,
}

pub struct PipelineLoop {
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    log: LogHandle,
    display: Option<Box<dyn DisplaySink>>,
    annotator: Annotator,
    clock: Box<dyn Clock>,
    config: PipelineConfig,
    stop: StopHandle,
    state: PipelineState,
    started_at: Option<Instant>,
    stats: PipelineStats,
}

impl PipelineLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        log: LogHandle,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            detector,
            log,
            display: None,
            annotator: Annotator::default(),
            clock: Box::new(MonotonicClock),
            config,
            stop: StopHandle::new(),
            state: PipelineState::Running,
            started_at: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn with_display(mut self, display: Box<dyn DisplaySink>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Run a single iteration.
    pub fn step(&mut self) -> Result<IterationOutcome> {
        if self.state == PipelineState::Stopped || self.stop.is_stopped() {
            self.state = PipelineState::Stopped;
            return Ok(IterationOutcome::Stopped);
        }
        let started_at = *self.started_at.get_or_insert_with(|| self.clock.now());

        let read_start = Instant::now();
        let frame = match self.source.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.read_failures += 1;
                log::warn!(
                    "{}: {}; retrying in {:?}",
                    self.source.describe(),
                    err,
                    self.config.read_backoff
                );
                self.wait(self.config.read_backoff);
                return Ok(IterationOutcome::ReadFailed);
            }
        };
        let read_time = read_start.elapsed();

        let infer_start = Instant::now();
        let detections = match self.detector.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                self.stats.detection_failures += 1;
                match self.config.detection_failure {
                    DetectionFailurePolicy::Skip => {
                        log::warn!("frame {}: detection failed: {:#}", frame.seq(), err);
                        return Ok(IterationOutcome::DetectionSkipped);
                    }
                    DetectionFailurePolicy::Fatal => {
                        log::error!("frame {}: detection failed: {:#}", frame.seq(), err);
                        self.state = PipelineState::Stopped;
                        return Err(Error::DetectionFailure(format!("{:#}", err)));
                    }
                }
            }
        };
        let inference_time = infer_start.elapsed();
        let detection_count = detections.len();
        let survivors = filter_detections(detections, self.config.confidence_threshold);
        log::debug!(
            "frame {}: read {:?}, inference {:?}, {} detections, {} survivors",
            frame.seq(),
            read_time,
            inference_time,
            detection_count,
            survivors.len()
        );

        if let Some(display) = self.display.as_mut() {
            let annotated = self.annotator.annotate(&frame, &survivors);
            if let Err(err) = display.present(&annotated) {
                log::warn!("display sink failed: {:#}", err);
            }
        }

        let bucket =
            TimeBucket::from_elapsed(self.clock.now().saturating_duration_since(started_at));
        let records = DetectionRecord::for_frame(bucket, &survivors);
        if !records.is_empty() {
            let count = records.len() as u64;
            if let Err(err) = self.log.append(records) {
                log::error!("{}; halting detection loop", err);
                self.state = PipelineState::Stopped;
                return Err(err);
            }
            self.stats.records_written += count;
        }
        self.stats.frames_processed += 1;

        Ok(IterationOutcome::Processed {
            seq: frame.seq(),
            bucket,
            detections: detection_count,
            survivors: survivors.len(),
        })
    }

    /// Iterate until stopped. Returns the final counters.
    pub fn run(&mut self) -> Result<PipelineStats> {
        log::info!(
            "detection loop running: source={}, detector={}, threshold={:.2}",
            self.source.describe(),
            self.detector.name(),
            self.config.confidence_threshold
        );
        let mut last_health_log = Instant::now();
        loop {
            if self.step()? == IterationOutcome::Stopped {
                break;
            }
            if last_health_log.elapsed() >= self.config.stats_interval {
                self.log_health();
                last_health_log = Instant::now();
            }
        }
        self.log_health();
        log::info!("detection loop stopped");
        Ok(self.stats.clone())
    }

    fn log_health(&self) {
        log::info!(
            "frames={} records={} read_failures={} detection_failures={}",
            self.stats.frames_processed,
            self.stats.records_written,
            self.stats.read_failures,
            self.stats.detection_failures
        );
    }

    fn wait(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stop.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}
