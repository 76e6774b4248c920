//! Synthetic test-pattern source
//!
//! Stands in for a camera: a dedicated data-flow thread pushes one
//! timestamped sample per frame interval into the source's flow point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::flow::{FlowEvent, FlowPoint};
use super::sample::{Caps, Sample};
use crate::error::{AppError, Result};

/// Media type announced by synthetic sources
pub const TEST_PATTERN_MEDIA_TYPE: &str = "application/x-test-pattern";

/// Frame generator pushing into a flow point
pub struct SyntheticSource {
    source_id: String,
    point: Arc<FlowPoint>,
    caps: Caps,
    running: Arc<AtomicBool>,
    produced: Arc<AtomicU64>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticSource {
    pub fn new(source_id: impl Into<String>, point: Arc<FlowPoint>, fps: u32, width: u32, height: u32) -> Self {
        Self {
            source_id: source_id.into(),
            point,
            caps: Caps::new(TEST_PATTERN_MEDIA_TYPE, width, height, fps.max(1)),
            running: Arc::new(AtomicBool::new(false)),
            produced: Arc::new(AtomicU64::new(0)),
            thread: Mutex::new(None),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn frames_produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Start the data-flow thread
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.point.set_caps(self.caps.clone());

        let point = self.point.clone();
        let running = self.running.clone();
        let produced = self.produced.clone();
        let source_id = self.source_id.clone();
        let interval = self.caps.frame_duration();

        let handle = thread::Builder::new()
            .name(format!("src-{}", self.source_id))
            .spawn(move || {
                let started = Instant::now();
                let mut sequence = 0u64;
                while running.load(Ordering::SeqCst) {
                    let pts = started.elapsed();
                    point.push(test_pattern(&source_id, sequence, pts, interval));
                    produced.fetch_add(1, Ordering::Relaxed);
                    sequence += 1;

                    // Sleep until the next frame slot, not a fixed interval
                    let next = interval * (sequence as u32);
                    if let Some(wait) = next.checked_sub(started.elapsed()) {
                        thread::sleep(wait);
                    }
                }
                point.push_event(FlowEvent::Eos);
                debug!("Source '{}' stopped after {} frames", source_id, sequence);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AppError::Internal(format!("failed to spawn source '{}': {}", self.source_id, e))
            })?;

        *self.thread.lock() = Some(handle);
        info!(
            "Source '{}' producing into '{}' ({})",
            self.source_id,
            self.point.name(),
            self.caps
        );
        Ok(())
    }

    /// Stop the data-flow thread and wait for it
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("Source '{}' thread panicked", self.source_id);
            }
        }
        info!("Source '{}' stopped", self.source_id);
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Header `VGL0`, source id, sequence and pts, padded to a frame-ish size
fn test_pattern(source_id: &str, sequence: u64, pts: Duration, duration: Duration) -> Sample {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(b"VGL0");
    buf.put_u64(sequence);
    buf.put_u64(pts.as_micros() as u64);
    buf.put_slice(source_id.as_bytes());
    buf.put_bytes((sequence % 251) as u8, 64usize.saturating_sub(buf.len()));
    Sample::new(buf.freeze(), pts, duration, sequence)
}
