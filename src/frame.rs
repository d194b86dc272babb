//! Frames and the single-slot latest-frame buffer.
//!
//! - `Frame`: an RGB image with a per-stream monotonic number and capture time.
//! - `LatestFrame`: a one-slot buffer shared between the capture worker and the
//!   consumer loop. Writers overwrite; a frame that was never taken is counted as
//!   dropped. Readers receive a clone (`snapshot`) or take the slot (`take_timeout`).

use chrono::{DateTime, Utc};
use image::RgbImage;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonic per stream, assigned by the capture worker (first frame = 1).
    pub number: u64,
    pub captured_at: DateTime<Utc>,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(number: u64, image: RgbImage) -> Self {
        Self {
            number,
            captured_at: Utc::now(),
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

/// Why a `take_timeout` returned no frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotStatus {
    /// Nothing arrived before the timeout; the writer is still running.
    Empty,
    /// The writer closed the slot (end of stream or capture failure).
    Closed(Option<String>),
}

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    closed: bool,
    close_reason: Option<String>,
    published: u64,
    dropped: u64,
}

/// Single-slot frame buffer, `Mutex<Option<Frame>>` + `Condvar`.
#[derive(Default)]
pub struct LatestFrame {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the slot. Returns `true` when an untaken frame was replaced.
    pub fn publish(&self, frame: Frame) -> bool {
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let replaced = slot.frame.replace(frame).is_some();
        slot.published += 1;
        if replaced {
            slot.dropped += 1;
        }
        drop(slot);
        self.ready.notify_all();
        replaced
    }

    /// Mark end of stream. Pending frames can still be taken.
    pub fn close(&self, reason: Option<String>) {
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.closed = true;
        if slot.close_reason.is_none() {
            slot.close_reason = reason;
        }
        drop(slot);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().map(|slot| slot.closed).unwrap_or(true)
    }

    /// Wait up to `timeout` for a frame and take it out of the slot.
    pub fn take_timeout(&self, timeout: Duration) -> Result<Frame, SlotStatus> {
        let deadline = Instant::now() + timeout;
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(frame) = slot.frame.take() {
                return Ok(frame);
            }
            if slot.closed {
                return Err(SlotStatus::Closed(slot.close_reason.clone()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SlotStatus::Empty);
            }
            slot = match self.ready.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Clone of the current frame without consuming it.
    pub fn snapshot(&self) -> Option<Frame> {
        self.slot.lock().ok().and_then(|slot| slot.frame.clone())
    }

    /// Block until a frame newer than `after` is present, then clone it.
    pub fn wait_newer(&self, after: u64, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().ok()?;
        loop {
            if let Some(frame) = slot.frame.as_ref() {
                if frame.number > after {
                    return Some(frame.clone());
                }
            }
            if slot.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self.ready.wait_timeout(slot, deadline - now).ok()?.0;
        }
    }

    pub fn published(&self) -> u64 {
        self.slot.lock().map(|slot| slot.published).unwrap_or(0)
    }

    /// Frames overwritten before a reader took them.
    pub fn dropped(&self) -> u64 {
        self.slot.lock().map(|slot| slot.dropped).unwrap_or(0)
    }
}
