//! Synthetic frame source (`stub://`).
//!
//! Renders a deterministic scene: a dark gradient background with a bright
//! square bouncing horizontally across it. Useful for demos, for exercising the
//! motion detector and for tests that need frames without a camera.
//!
//! URL parameters (all optional):
//! - `fps`: pacing in frames per second, `0` for unpaced (default 15)
//! - `width`, `height`: frame size (default from `SourceConfig`)
//! - `frames`: stop after this many frames with `Error::SourceEnded`

use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};
use url::Url;

use super::{FrameSource, SourceConfig};
use crate::error::{Error, Result};
use crate::frame::Frame;

const DEFAULT_FPS: f64 = 15.0;

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    fps: f64,
    frame_limit: Option<u64>,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    /// Unpaced, unlimited scene of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            name: "stub://synthetic".to_string(),
            width: width.max(1),
            height: height.max(1),
            fps: 0.0,
            frame_limit: None,
            frame_count: 0,
            next_due: None,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let raw = config.url.trim();
        let url = Url::parse(raw).map_err(|err| Error::source_unavailable(raw, err))?;
        let mut source = Self::new(config.width, config.height).with_fps(DEFAULT_FPS);
        source.name = format!("stub://{}", url.host_str().unwrap_or("synthetic"));
        if config.target_fps > 0 {
            source.fps = config.target_fps as f64;
        }

        for (key, value) in url.query_pairs() {
            let invalid = |reason: &str| {
                Error::source_unavailable(raw, format!("{} '{}': {}", key, value, reason))
            };
            match key.as_ref() {
                "fps" => {
                    let fps: f64 = value.parse().map_err(|_| invalid("not a number"))?;
                    if !fps.is_finite() || fps < 0.0 {
                        return Err(invalid("must be >= 0"));
                    }
                    source.fps = fps;
                }
                "width" => {
                    source.width = parse_dimension(&value).ok_or_else(|| invalid("must be > 0"))?
                }
                "height" => {
                    source.height = parse_dimension(&value).ok_or_else(|| invalid("must be > 0"))?
                }
                "frames" => {
                    source.frame_limit =
                        Some(value.parse().map_err(|_| invalid("not an integer"))?)
                }
                _ => log::warn!("ignoring unknown stub source parameter '{}'", key),
            }
        }
        Ok(source)
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps.max(0.0);
        self
    }

    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    fn pace(&mut self) {
        if self.fps <= 0.0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / self.fps);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        // Fall back to "now" if we are more than one interval late.
        self.next_due = Some(due.max(now) + interval);
    }

    fn render(&self) -> RgbImage {
        let (w, h) = (self.width, self.height);
        let side = (h / 6).max(1).min(w);
        let travel = (w - side).max(1) as u64;
        // Bounce: 0..travel..0
        let phase = (self.frame_count * 8) % (2 * travel);
        let left = (if phase < travel { phase } else { 2 * travel - phase }) as u32;
        let top = (h - side.min(h)) / 2;

        RgbImage::from_fn(w, h, |x, y| {
            if x >= left && x < left + side && y >= top && y < top + side {
                Rgb([240, 240, 240])
            } else {
                let shade = (20 + (y * 40) / h.max(1)) as u8;
                Rgb([shade, shade, shade + 10])
            }
        })
    }
}

fn parse_dimension(raw: &str) -> Option<u32> {
    raw.parse().ok().filter(|v: &u32| *v > 0)
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} ({}x{} synthetic)", self.name, self.width, self.height)
    }

    fn nominal_fps(&self) -> Option<f64> {
        (self.fps > 0.0).then_some(self.fps)
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                return Err(Error::SourceEnded);
            }
        }
        self.pace();
        let image = self.render();
        self.frame_count += 1;
        Ok(Frame::new(image, self.frame_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> SourceConfig {
        SourceConfig::new(url)
    }

    #[test]
    fn url_parameters_override_defaults() {
        let source =
            SyntheticSource::from_config(&config("stub://cam?fps=0&width=64&height=48&frames=3"))
                .unwrap();
        assert_eq!((source.width, source.height), (64, 48));
        assert_eq!(source.frame_limit, Some(3));
        assert_eq!(source.nominal_fps(), None);
        assert!(source.describe().starts_with("stub://cam"));
    }

    #[test]
    fn defaults_to_paced_config_size() {
        let source = SyntheticSource::from_config(&config("stub://camera")).unwrap();
        assert_eq!((source.width, source.height), (640, 480));
        assert_eq!(source.nominal_fps(), Some(DEFAULT_FPS));
    }

    #[test]
    fn rejects_bad_parameters() {
        for url in ["stub://cam?fps=fast", "stub://cam?width=0", "stub://cam?frames=-1"] {
            assert!(
                matches!(
                    SyntheticSource::from_config(&config(url)),
                    Err(Error::SourceUnavailable { .. })
                ),
                "accepted {}",
                url
            );
        }
    }

    #[test]
    fn frame_limit_ends_source() {
        let mut source = SyntheticSource::new(32, 24).with_frame_limit(2);
        assert_eq!(source.read_frame().unwrap().seq(), 1);
        assert_eq!(source.read_frame().unwrap().seq(), 2);
        assert!(matches!(source.read_frame(), Err(Error::SourceEnded)));
    }

    #[test]
    fn scene_moves_between_frames() {
        let mut source = SyntheticSource::new(96, 48);
        let a = source.read_frame().unwrap();
        let b = source.read_frame().unwrap();
        assert_ne!(a.pixels(), b.pixels());
    }

    #[test]
    fn pacing_spaces_frames() {
        let mut source = SyntheticSource::new(8, 8).with_fps(50.0);
        let start = Instant::now();
        for _ in 0..3 {
            source.read_frame().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(35));
    }
}
