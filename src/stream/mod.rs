//! Continuous frame-to-stream encoding.
//!
//! `StreamEncoder` pulls frames from its own source, applies a per-frame
//! `FrameTransform`, JPEG-encodes the result and wraps it as one part of a
//! `multipart/x-mixed-replace` body:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! \r\n
//! <jpeg bytes>\r\n
//! ```
//!
//! A single encoder feeds any number of HTTP clients through `StreamHub`.

use image::codecs::jpeg::JpegEncoder;
use image::Rgb;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::annotate::Annotator;
use crate::detect::{BoundingBox, DetectorBackend};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::pipeline::filter_detections;

mod hub;

/// Slice used when sleeping so a stop request is noticed promptly.
const STOP_POLL: Duration = Duration::from_millis(50);

pub use hub::{spawn_producer, ProducerHandle, StreamHub, Subscription};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wrap one JPEG image as a multipart part.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(frame.pixels().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(frame.image())?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// Transforms
// ----------------------------------------------------------------------------

/// Per-frame processing applied before encoding.
pub trait FrameTransform: Send {
    fn name(&self) -> &'static str;
    fn apply(&mut self, frame: Frame) -> Frame;
}

/// Draws one random green rectangle per frame, standing in for detections.
pub struct PlaceholderOverlay {
    rng: StdRng,
    painter: Annotator,
}

impl PlaceholderOverlay {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Reproducible rectangles, for tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            painter: Annotator {
                box_color: Rgb([0, 255, 0]),
                thickness: 2,
                ..Annotator::default()
            },
        }
    }

    /// Top-left in the upper-left quadrant, bottom-right in the lower-right one.
    fn random_box(&mut self, width: u32, height: u32) -> BoundingBox {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.rng.gen_range(0.0..=w / 2.0).floor();
        let y1 = self.rng.gen_range(0.0..=h / 2.0).floor();
        let x2 = self.rng.gen_range(w / 2.0..=w).floor();
        let y2 = self.rng.gen_range(h / 2.0..=h).floor();
        BoundingBox::new(x1, y1, x2, y2)
    }
}

impl Default for PlaceholderOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTransform for PlaceholderOverlay {
    fn name(&self) -> &'static str {
        "placeholder"
    }

    fn apply(&mut self, frame: Frame) -> Frame {
        let bbox = self.random_box(frame.width(), frame.height());
        let seq = frame.seq();
        let mut image = frame.into_image();
        self.painter.draw_box(&mut image, &bbox);
        Frame::new(image, seq)
    }
}

/// Runs a detector and draws the survivors, like the detection pipeline does.
/// Detector errors pass the frame through unannotated.
pub struct DetectAndAnnotate {
    detector: Box<dyn DetectorBackend>,
    annotator: Annotator,
    threshold: f32,
}

impl DetectAndAnnotate {
    pub fn new(detector: Box<dyn DetectorBackend>, threshold: f32) -> Self {
        Self {
            detector,
            annotator: Annotator::default(),
            threshold,
        }
    }
}

impl FrameTransform for DetectAndAnnotate {
    fn name(&self) -> &'static str {
        "detect"
    }

    fn apply(&mut self, frame: Frame) -> Frame {
        match self.detector.detect(&frame) {
            Ok(detections) => {
                let survivors = filter_detections(detections, self.threshold);
                self.annotator.annotate(&frame, &survivors)
            }
            Err(err) => {
                log::warn!("stream frame {}: detection failed: {:#}", frame.seq(), err);
                frame
            }
        }
    }
}

/// Leaves frames untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl FrameTransform for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn apply(&mut self, frame: Frame) -> Frame {
        frame
    }
}

// ----------------------------------------------------------------------------
// Encoder
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub jpeg_quality: u8,
    /// Consecutive read failures after which the stream ends.
    pub max_read_failures: u32,
    pub read_backoff: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            max_read_failures: 10,
            read_backoff: Duration::from_millis(500),
        }
    }
}

/// Produces multipart parts from a source. Also an `Iterator` over parts that
/// ends when the source does.
pub struct StreamEncoder {
    source: Box<dyn FrameSource>,
    transform: Box<dyn FrameTransform>,
    config: EncoderConfig,
    consecutive_failures: u32,
    finished: bool,
    parts_encoded: u64,
    stop: Arc<AtomicBool>,
}

impl StreamEncoder {
    pub fn new(
        source: Box<dyn FrameSource>,
        transform: Box<dyn FrameTransform>,
        config: EncoderConfig,
    ) -> Self {
        Self {
            source,
            transform,
            config,
            consecutive_failures: 0,
            finished: false,
            parts_encoded: 0,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that makes `next_frame` give up, including mid-backoff.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn describe(&self) -> String {
        format!("{} [{}]", self.source.describe(), self.transform.name())
    }

    /// Next frame from the source, retrying transient failures. `None` once
    /// the source has ended, failed too many times in a row, or the stop
    /// flag is set.
    pub fn next_frame(&mut self) -> Option<Frame> {
        while !self.finished && !self.is_stopped() {
            match self.source.read_frame() {
                Ok(frame) => {
                    self.consecutive_failures = 0;
                    return Some(frame);
                }
                Err(Error::SourceEnded) => {
                    log::info!("{}: source ended, closing stream", self.source.describe());
                    self.finished = true;
                }
                Err(err) => {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.config.max_read_failures.max(1) {
                        log::warn!(
                            "{}: {} consecutive read failures ({}), closing stream",
                            self.source.describe(),
                            self.consecutive_failures,
                            err
                        );
                        self.finished = true;
                    } else {
                        log::warn!("{}: {}", self.source.describe(), err);
                        self.wait(self.config.read_backoff);
                    }
                }
            }
        }
        None
    }

    /// Transform, encode and frame one image as a multipart part.
    pub fn encode(&mut self, frame: Frame) -> Result<Vec<u8>> {
        let frame = self.transform.apply(frame);
        let jpeg = encode_jpeg(&frame, self.config.jpeg_quality)?;
        self.parts_encoded += 1;
        Ok(multipart_part(&jpeg))
    }

    fn wait(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL));
        }
    }

    pub fn parts_encoded(&self) -> u64 {
        self.parts_encoded
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Iterator for StreamEncoder {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            let frame = self.next_frame()?;
            match self.encode(frame) {
                Ok(part) => return Some(part),
                Err(err) => log::warn!("stream encode failed: {}", err),
            }
        }
    }
}
