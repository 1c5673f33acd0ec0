use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// One scripted answer from the stub backend.
#[derive(Clone, Debug)]
pub enum StubStep {
    Detections(Vec<Detection>),
    Fail(String),
}

/// Stub backend for testing. Replays a fixed script of answers, one per frame,
/// then returns no detections (or loops, when built with `looping`).
pub struct StubBackend {
    script: VecDeque<StubStep>,
    replay: Vec<StubStep>,
    looping: bool,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(steps: Vec<StubStep>) -> Self {
        Self {
            script: steps.iter().cloned().collect(),
            replay: steps,
            looping: false,
            calls: 0,
        }
    }

    /// Convenience: every frame answers with the next detection list.
    pub fn from_frames(frames: Vec<Vec<Detection>>) -> Self {
        Self::scripted(frames.into_iter().map(StubStep::Detections).collect())
    }

    /// Restart the script from the top once it runs out.
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    /// Number of `detect` calls served.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls += 1;
        if self.script.is_empty() && self.looping {
            self.script = self.replay.iter().cloned().collect();
        }
        match self.script.pop_front() {
            Some(StubStep::Detections(detections)) => Ok(detections),
            Some(StubStep::Fail(reason)) => Err(anyhow!(reason)),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;
    use image::RgbImage;

    fn frame() -> Frame {
        Frame::new(RgbImage::new(8, 8), 1)
    }

    fn person() -> Detection {
        Detection::new(BoundingBox::new(1.0, 1.0, 4.0, 4.0), "person", 0.9)
    }

    #[test]
    fn replays_script_then_goes_quiet() {
        let mut backend = StubBackend::scripted(vec![
            StubStep::Detections(vec![person()]),
            StubStep::Fail("model crashed".into()),
        ]);

        assert_eq!(backend.detect(&frame()).unwrap(), vec![person()]);
        let err = backend.detect(&frame()).unwrap_err();
        assert!(err.to_string().contains("model crashed"));
        assert!(backend.detect(&frame()).unwrap().is_empty());
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn looping_script_restarts() {
        let mut backend = StubBackend::from_frames(vec![vec![person()], vec![]]).looping();
        let counts: Vec<usize> = (0..5)
            .map(|_| backend.detect(&frame()).unwrap().len())
            .collect();
        assert_eq!(counts, vec![1, 0, 1, 0, 1]);
    }
}
