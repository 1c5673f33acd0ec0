//! Display sinks for annotated frames.
//!
//! The pipeline hands every annotated frame to a `DisplaySink`. Headless
//! deployments use `NullDisplay`; `SnapshotDisplay` keeps a JPEG of the most
//! recent frame on disk for a preview page or `watch`-style viewer.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::frame::Frame;

pub trait DisplaySink: Send {
    fn present(&mut self, frame: &Frame) -> Result<()>;
}

/// Discards every frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn present(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }
}

/// Writes every `every`-th frame to `path` as JPEG.
///
/// The image is written next to the target and renamed over it, so readers
/// never observe a partially written file.
pub struct SnapshotDisplay {
    path: PathBuf,
    tmp_path: PathBuf,
    every: u64,
    quality: u8,
    seen: u64,
    written: u64,
}

impl SnapshotDisplay {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp_path: PathBuf::from(tmp),
            every: 1,
            quality: 80,
            seen: 0,
            written: 0,
        }
    }

    pub fn every(mut self, frames: u64) -> Self {
        self.every = frames.max(1);
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshots_written(&self) -> u64 {
        self.written
    }
}

impl DisplaySink for SnapshotDisplay {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        self.seen += 1;
        if (self.seen - 1) % self.every != 0 {
            return Ok(());
        }
        {
            let file = File::create(&self.tmp_path)
                .with_context(|| format!("create {}", self.tmp_path.display()))?;
            let mut out = BufWriter::new(file);
            JpegEncoder::new_with_quality(&mut out, self.quality)
                .encode_image(frame.image())
                .context("encode preview snapshot")?;
        }
        std::fs::rename(&self.tmp_path, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        self.written += 1;
        Ok(())
    }
}
