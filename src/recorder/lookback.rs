//! Fixed-capacity lookback buffer

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{AppError, Result};

/// FIFO of the most recent `capacity` items
///
/// Pushing into a full buffer drops the oldest item. Items come back out in
/// arrival order.
#[derive(Debug)]
pub struct LookbackBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> LookbackBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Capacity for `fps` frames over `window`, rounded to whole frames
    pub fn for_window(fps: u32, window: Duration) -> Self {
        Self::new((fps as f64 * window.as_secs_f64()).round() as usize)
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back(item);
    }

    pub fn pop_oldest(&mut self) -> Result<T> {
        self.items.pop_front().ok_or(AppError::BufferUnderrun)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted by overflow since construction
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
