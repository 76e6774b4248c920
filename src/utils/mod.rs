//! Utility modules
//!
//! Deferred callbacks and log throttling shared by the graph, recorder and
//! signaling code.

pub mod delay;
pub mod throttle;

pub use delay::{replace_delay, retry_fixed, CancellableDelay, Scheduler};
pub use throttle::LogThrottler;
