//! MJPEG-over-HTTP frame source.
//!
//! `MjpegSource` reads frames from a network camera or another stream server.
//! A `multipart/*` response is parsed as a continuous MJPEG feed; any other
//! response type is treated as a snapshot URL and polled once per frame.
//!
//! When the feed drops, the next read reconnects. Reads that fail in the
//! meantime surface as `Error::ReadFailure` so the caller's backoff applies.

use anyhow::{anyhow, Context};
use std::io::Read;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceConfig};
use crate::error::{Error, Result};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct MjpegSource {
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    target_fps: u32,
    last_frame_at: Option<Instant>,
    frame_count: u64,
    reconnects: u64,
}

enum HttpStream {
    Multipart(MjpegReader<Box<dyn Read + Send + Sync>>),
    Snapshot,
}

impl MjpegSource {
    /// Connect to `config.url`. The first connection must succeed.
    pub fn open(config: &SourceConfig) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.read_timeout)
            .timeout_read(config.read_timeout)
            .build();
        let mut source = Self {
            url: config.url.trim().to_string(),
            agent,
            stream: None,
            target_fps: config.target_fps,
            last_frame_at: None,
            frame_count: 0,
            reconnects: 0,
        };
        source
            .connect()
            .map_err(|err| Error::source_unavailable(&source.url, format!("{:#}", err)))?;
        Ok(source)
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        self.stream = Some(if content_type.contains("multipart") {
            HttpStream::Multipart(MjpegReader::new(response.into_reader()))
        } else {
            HttpStream::Snapshot
        });
        Ok(())
    }

    fn next_jpeg(&mut self) -> anyhow::Result<Vec<u8>> {
        if self.stream.is_none() {
            self.reconnects += 1;
            self.connect()?;
            log::info!("reconnected to {} (reconnect #{})", self.url, self.reconnects);
        }
        let result = match self.stream.as_mut() {
            Some(HttpStream::Multipart(reader)) => reader.read_next_jpeg(),
            Some(HttpStream::Snapshot) => fetch_snapshot(&self.agent, &self.url),
            None => Err(anyhow!("not connected")),
        };
        if result.is_err() {
            self.stream = None;
        }
        result
    }
}

impl FrameSource for MjpegSource {
    fn describe(&self) -> String {
        format!("mjpeg {}", self.url)
    }

    fn nominal_fps(&self) -> Option<f64> {
        (self.target_fps > 0).then_some(self.target_fps as f64)
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let min_interval = frame_interval(self.target_fps);
        loop {
            let jpeg = self
                .next_jpeg()
                .map_err(|err| Error::ReadFailure(format!("{:#}", err)))?;

            let now = Instant::now();
            if let Some(last) = self.last_frame_at {
                if now.duration_since(last) < min_interval {
                    continue;
                }
            }

            let image = decode_jpeg(&jpeg)?;
            self.frame_count += 1;
            self.last_frame_at = Some(now);
            return Ok(Frame::new(image, self.frame_count));
        }
    }
}

/// Splits a multipart MJPEG byte stream into JPEG images by SOI/EOI markers.
/// Part headers and boundaries between images are skipped.
pub(crate) struct MjpegReader<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> MjpegReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    pub(crate) fn read_next_jpeg(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> anyhow::Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

pub(crate) fn decode_jpeg(bytes: &[u8]) -> Result<image::RgbImage> {
    image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .map(|image| image.into_rgb8())
        .map_err(|err| Error::ReadFailure(format!("decode jpeg: {}", err)))
}

/// Byte range of the first complete JPEG (SOI through EOI) in `buffer`.
pub(crate) fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{codecs::jpeg::JpegEncoder, Rgb, RgbImage};
    use std::io::Cursor;

    fn jpeg_bytes(w: u32, h: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(w, h, Rgb([200, 40, 40]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 80)
            .encode_image(&image)
            .unwrap();
        out
    }

    fn multipart(parts: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(part);
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    #[test]
    fn finds_jpeg_between_markers() {
        let data = [0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x03];
        assert_eq!(find_jpeg_bounds(&data), Some((1, 7)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x00]), None);
        assert_eq!(find_jpeg_bounds(&[0x00, 0x01]), None);
    }

    #[test]
    fn splits_multipart_body_into_frames() {
        let first = jpeg_bytes(16, 8);
        let second = jpeg_bytes(8, 16);
        let body = multipart(&[first.clone(), second.clone()]);
        let mut reader = MjpegReader::new(Cursor::new(body));

        assert_eq!(reader.read_next_jpeg().unwrap(), first);
        assert_eq!(reader.read_next_jpeg().unwrap(), second);
        assert!(reader.read_next_jpeg().is_err());
    }

    #[test]
    fn decodes_jpeg_to_rgb() {
        let image = decode_jpeg(&jpeg_bytes(16, 8)).unwrap();
        assert_eq!(image.dimensions(), (16, 8));
    }

    #[test]
    fn corrupt_jpeg_is_a_read_failure() {
        let err = decode_jpeg(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]).unwrap_err();
        assert!(err.is_transient());
    }
}
