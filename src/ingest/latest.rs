use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::FrameSource;
use crate::error::{Error, Result};
use crate::frame::{BufferRead, Frame, FrameBuffer};

/// Pause between capture attempts after a failed read.
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Runs a live source on a capture thread and hands the consumer only the
/// newest frame.
///
/// Frames that arrive while the consumer is busy overwrite each other in a
/// depth-1 buffer. A read waits at most `read_timeout`; if no fresh frame shows
/// up in that window the read fails with `Error::ReadFailure` carrying the last
/// capture error, if any.
pub struct LatestFrameSource {
    description: String,
    nominal_fps: Option<f64>,
    read_timeout: Duration,
    buffer: Arc<FrameBuffer<Frame>>,
    last_error: Arc<Mutex<Option<String>>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl LatestFrameSource {
    pub fn spawn<S: FrameSource + 'static>(mut inner: S, read_timeout: Duration) -> Result<Self> {
        let description = inner.describe();
        let nominal_fps = inner.nominal_fps();
        let buffer = Arc::new(FrameBuffer::latest());
        let last_error = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let buffer = buffer.clone();
            let last_error = last_error.clone();
            let shutdown = shutdown.clone();
            let origin = description.clone();
            std::thread::Builder::new()
                .name("frame-capture".to_string())
                .spawn(move || {
                    while !shutdown.load(Ordering::SeqCst) {
                        match inner.read_frame() {
                            Ok(frame) => {
                                if !buffer.push(frame) {
                                    break;
                                }
                            }
                            Err(Error::SourceEnded) => {
                                log::info!("{}: source ended", origin);
                                break;
                            }
                            Err(err) => {
                                log::debug!("{}: capture failed: {}", origin, err);
                                if let Ok(mut slot) = last_error.lock() {
                                    *slot = Some(err.to_string());
                                }
                                std::thread::sleep(CAPTURE_RETRY_DELAY);
                            }
                        }
                    }
                    buffer.close();
                })
                .context("spawn frame capture thread")
                .map_err(|err| Error::source_unavailable(&description, format!("{:#}", err)))?
        };

        Ok(Self {
            description,
            nominal_fps,
            read_timeout,
            buffer,
            last_error,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Frames overwritten before the consumer read them.
    pub fn frames_dropped(&self) -> u64 {
        self.buffer.dropped()
    }
}

impl FrameSource for LatestFrameSource {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn nominal_fps(&self) -> Option<f64> {
        self.nominal_fps
    }

    fn read_frame(&mut self) -> Result<Frame> {
        match self.buffer.pop_timeout(self.read_timeout) {
            BufferRead::Item(frame) => Ok(frame),
            BufferRead::Closed => Err(Error::SourceEnded),
            BufferRead::TimedOut => {
                let cause = self
                    .last_error
                    .lock()
                    .ok()
                    .and_then(|mut slot| slot.take())
                    .unwrap_or_else(|| "no frame received".to_string());
                Err(Error::ReadFailure(format!(
                    "timed out after {:?}: {}",
                    self.read_timeout, cause
                )))
            }
        }
    }
}

impl Drop for LatestFrameSource {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.buffer.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
