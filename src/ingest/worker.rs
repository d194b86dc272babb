use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::frame::{Frame, LatestFrame};

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Background thread that pulls images from a `FrameSource` into a
/// `LatestFrame` slot, numbering them 1, 2, 3, ...
///
/// The slot is closed when the source ends, fails repeatedly, or the worker
/// is stopped, so the consumer never waits on a dead stream.
pub struct CaptureWorker {
    stop: Arc<AtomicBool>,
    captured: Arc<AtomicU64>,
    slot: Arc<LatestFrame>,
    join: Option<JoinHandle<SourceStats>>,
    final_stats: Option<SourceStats>,
}

impl CaptureWorker {
    /// Connect `source` and start capturing. A connect failure is returned
    /// here, before any thread exists.
    pub fn spawn(mut source: Box<dyn FrameSource>, slot: Arc<LatestFrame>) -> Result<Self> {
        source.connect().context("open capture source")?;
        let stop = Arc::new(AtomicBool::new(false));
        let captured = Arc::new(AtomicU64::new(0));
        let join = {
            let stop = stop.clone();
            let captured = captured.clone();
            let slot = slot.clone();
            std::thread::Builder::new()
                .name("roadwatch-capture".to_string())
                .spawn(move || capture_loop(source, &slot, &stop, &captured))
                .context("spawn capture thread")?
        };
        Ok(Self {
            stop,
            captured,
            slot,
            join: Some(join),
            final_stats: None,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Source statistics, available once the worker has been joined.
    pub fn final_stats(&self) -> Option<&SourceStats> {
        self.final_stats.as_ref()
    }

    /// Signal the thread and wait up to `timeout` for it to exit. Returns
    /// false when the thread had to be detached.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        let Some(join) = self.join.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !join.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if !join.is_finished() {
            log::warn!(
                "capture thread did not exit within {:?}; detaching it",
                timeout
            );
            self.slot.close(Some("capture stopped".to_string()));
            return false;
        }
        match join.join() {
            Ok(stats) => {
                self.final_stats = Some(stats);
                true
            }
            Err(_) => {
                log::error!("capture thread panicked");
                self.slot.close(Some("capture thread panicked".to_string()));
                true
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.stop(DEFAULT_JOIN_TIMEOUT);
        }
    }
}

fn capture_loop(
    mut source: Box<dyn FrameSource>,
    slot: &LatestFrame,
    stop: &AtomicBool,
    captured: &AtomicU64,
) -> SourceStats {
    let mut number = 0u64;
    let mut failures = 0u32;
    let reason = loop {
        if stop.load(Ordering::SeqCst) {
            break None;
        }
        match source.next_image() {
            Ok(Some(image)) => {
                failures = 0;
                number += 1;
                captured.store(number, Ordering::Relaxed);
                if slot.publish(Frame::new(number, image)) {
                    log::debug!("frame {} replaced an unprocessed frame", number);
                }
            }
            Ok(None) => {
                log::info!("capture source reached end of stream after {} frames", number);
                break None;
            }
            Err(err) => {
                failures += 1;
                log::warn!("frame read failed ({}/{}): {:#}", failures, MAX_CONSECUTIVE_READ_FAILURES, err);
                if failures >= MAX_CONSECUTIVE_READ_FAILURES {
                    break Some(format!("{:#}", err));
                }
                std::thread::sleep(RETRY_BACKOFF);
            }
        }
    };
    if let Some(reason) = reason.as_deref() {
        log::error!("capture stopped: {}", reason);
    }
    slot.close(reason);
    source.stats()
}
