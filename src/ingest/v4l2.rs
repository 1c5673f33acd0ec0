//! V4L2 frame source.
//!
//! `V4l2Source` captures from a local device node (e.g. `/dev/video0`). It asks
//! the driver for packed RGB at the configured size and falls back to MJPG when
//! the device only offers compressed capture. Whatever the driver settles on is
//! decoded to RGB before it leaves this module.

use anyhow::Context;
use ouroboros::self_referencing;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;

use super::mjpeg::decode_jpeg;
use super::{FrameSource, SourceConfig};
use crate::error::{Error, Result};
use crate::frame::Frame;

const STREAM_BUFFERS: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PixelFormat {
    Rgb24,
    Mjpeg,
}

pub struct V4l2Source {
    device_path: String,
    state: DeviceState,
    format: PixelFormat,
    width: u32,
    height: u32,
    fps: Option<f64>,
    frame_count: u64,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn open(config: &SourceConfig) -> Result<Self> {
        let device_path = config
            .url
            .trim()
            .trim_start_matches("v4l2://")
            .to_string();
        Self::connect(&device_path, config)
            .map_err(|err| Error::source_unavailable(&device_path, format!("{:#}", err)))
    }

    fn connect(device_path: &str, config: &SourceConfig) -> anyhow::Result<Self> {
        let device = v4l::Device::with_path(device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;

        let mut requested = device.format().context("read v4l2 format")?;
        requested.width = config.width;
        requested.height = config.height;
        requested.fourcc = v4l::FourCC::new(b"RGB3");
        let active = match device.set_format(&requested) {
            Ok(format) if format.fourcc == v4l::FourCC::new(b"RGB3") => format,
            _ => {
                requested.fourcc = v4l::FourCC::new(b"MJPG");
                device
                    .set_format(&requested)
                    .context("device offers neither RGB3 nor MJPG capture")?
            }
        };
        let format = if active.fourcc == v4l::FourCC::new(b"RGB3") {
            PixelFormat::Rgb24
        } else if active.fourcc == v4l::FourCC::new(b"MJPG") {
            PixelFormat::Mjpeg
        } else {
            anyhow::bail!("unsupported v4l2 pixel format {}", active.fourcc);
        };

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("{}: failed to set fps: {}", device_path, err);
            }
        }
        let fps = device.params().ok().and_then(|params| {
            let interval = params.interval;
            (interval.numerator > 0)
                .then(|| interval.denominator as f64 / interval.numerator as f64)
        });

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "{}: capturing {}x{} {:?}",
            device_path,
            active.width,
            active.height,
            format
        );
        Ok(Self {
            device_path: device_path.to_string(),
            state,
            format,
            width: active.width,
            height: active.height,
            fps,
            frame_count: 0,
        })
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        format!("v4l2 {}", self.device_path)
    }

    fn nominal_fps(&self) -> Option<f64> {
        self.fps
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let bytes = self
            .state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| Error::ReadFailure(format!("capture v4l2 frame: {}", err)))?;

        self.frame_count += 1;
        match self.format {
            PixelFormat::Rgb24 => {
                let mut bytes = bytes;
                // drivers may hand back a padded buffer
                bytes.truncate((self.width * self.height * 3) as usize);
                Frame::from_rgb(bytes, self.width, self.height, self.frame_count)
            }
            PixelFormat::Mjpeg => Ok(Frame::new(decode_jpeg(&bytes)?, self.frame_count)),
        }
    }
}
