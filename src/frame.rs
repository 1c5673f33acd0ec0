//! Frames and the bounded buffers they travel through.
//!
//! - `Frame`: one decoded RGB image plus its arrival order. Owned by whichever
//!   iteration read it; there is no `Clone`, copies are explicit (`Annotator`).
//! - `FrameBuffer`: bounded drop-oldest buffer with blocking reads. Depth 1 gives
//!   "latest frame wins" semantics for live sources; deeper buffers back the
//!   per-client stream queues.

use image::RgbImage;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Depth of the buffer between a live capture thread and its consumer.
pub const LATEST_FRAME_DEPTH: usize = 1;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

pub struct Frame {
    image: RgbImage,
    /// Arrival order within the producing source, starting at 1.
    seq: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from packed RGB8 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, seq: u64) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        let len = pixels.len();
        let image = RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
            Error::ReadFailure(format!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected, width, height, len
            ))
        })?;
        Ok(Self::new(image, seq))
    }

    /// Same capture identity, different pixels. Used to hand back annotated copies.
    pub fn with_image(&self, image: RgbImage) -> Self {
        Self {
            image,
            seq: self.seq,
            captured_at: self.captured_at,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer: bounded drop-oldest queue
// ----------------------------------------------------------------------------

/// Outcome of a blocking read from a `FrameBuffer`.
#[derive(Debug)]
pub enum BufferRead<T> {
    Item(T),
    TimedOut,
    Closed,
}

struct BufferState<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Bounded buffer shared between exactly one producer and one consumer.
///
/// `push` never blocks: when the buffer is full the oldest item is evicted.
/// Once closed, readers drain what is left and then observe `Closed`.
pub struct FrameBuffer<T = Frame> {
    state: Mutex<BufferState<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> FrameBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BufferState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Depth-1 buffer: the consumer only ever sees the newest item.
    pub fn latest() -> Self {
        Self::with_capacity(LATEST_FRAME_DEPTH)
    }

    fn lock(&self) -> MutexGuard<'_, BufferState<T>> {
        // A panicking holder cannot leave the queue structurally broken.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push an item, evicting the oldest on overflow. Returns false once closed.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        while state.items.len() >= self.capacity {
            state.items.pop_front();
            state.dropped += 1;
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Wait up to `timeout` for the next item.
    pub fn pop_timeout(&self, timeout: Duration) -> BufferRead<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return BufferRead::Item(item);
            }
            if state.closed {
                return BufferRead::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return BufferRead::TimedOut;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Take the next item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
