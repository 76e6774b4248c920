//! Cancellable deferred callbacks
//!
//! All delayed work (stop-timer debounce, deferred disposal, retry backoff)
//! runs on one shared tokio runtime instead of a thread per timer. Callbacks
//! are executed on the blocking pool so they may take locks or join threads
//! without stalling the async workers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::AppError;

/// Handle to a single scheduled callback
///
/// Dropping the handle does not cancel the callback; call [`cancel`](Self::cancel).
#[derive(Debug)]
pub struct CancellableDelay {
    name: String,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl CancellableDelay {
    /// Cancel the callback
    ///
    /// Safe to call at any time. If the callback has already been handed to
    /// the blocking pool it re-checks the flag before running, so a cancel
    /// that races with the deadline still wins unless the callback body has
    /// already begun.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            trace!("Cancelled delayed task '{}'", self.name);
        }
        if !self.fired.load(Ordering::SeqCst) {
            self.task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the callback body has started
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Instant at which the callback is due
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Shared queue of delayed callbacks backed by a tokio runtime
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the calling context
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `callback` once after `delay` unless cancelled first
    pub fn schedule<F>(&self, name: impl Into<String>, delay: Duration, callback: F) -> CancellableDelay
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let cancelled = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + delay;

        let task = {
            let name = name.clone();
            let cancelled = cancelled.clone();
            let fired = fired.clone();
            self.handle.spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if cancelled.load(Ordering::SeqCst) {
                    debug!("Delayed task '{}' cancelled before firing", name);
                    return;
                }

                let job = tokio::task::spawn_blocking(move || {
                    // Last check: cancel may have landed while queued
                    if cancelled.load(Ordering::SeqCst) {
                        debug!("Delayed task '{}' cancelled while queued", name);
                        return;
                    }
                    fired.store(true, Ordering::SeqCst);
                    trace!("Delayed task '{}' firing", name);
                    callback();
                });
                if let Err(e) = job.await {
                    warn!("Delayed task panicked or was aborted: {}", e);
                }
            })
        };

        CancellableDelay {
            name,
            deadline,
            cancelled,
            fired,
            task,
        }
    }

    /// Run `callback` as soon as possible on a non-data-flow thread
    pub fn defer<F>(&self, name: impl Into<String>, callback: F) -> CancellableDelay
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(name, Duration::ZERO, callback)
    }
}

/// Replace the pending delay in `slot`, cancelling the previous one first
pub fn replace_delay(slot: &mut Option<CancellableDelay>, next: Option<CancellableDelay>) {
    if let Some(previous) = slot.take() {
        previous.cancel();
    }
    *slot = next;
}

/// Retry an async operation a fixed number of times with a fixed delay
///
/// Returns every error in attempt order when all attempts fail.
pub async fn retry_fixed<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    mut operation: F,
) -> std::result::Result<T, Vec<AppError>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, AppError>>,
{
    let mut errors = Vec::new();
    for attempt in 1..=attempts.max(1) {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                errors.push(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(errors)
}
