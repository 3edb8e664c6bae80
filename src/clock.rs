//! # Summary
//!
//! Lamport logical clock shared by every component of a process.
//!
//! A send attaches the current value and then advances it; a receive
//! advances the local value past whatever the sender attached. Both are
//! single atomic read-modify-write operations, so concurrent tasks never
//! observe the counter moving backwards.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Clock(AtomicU64);

impl Clock {
    pub fn new() -> Self {
        Clock::default()
    }

    /// Current value, without advancing.
    pub fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the value to attach to an outgoing message and advances the clock.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    /// Merges a received timestamp: local = max(local, received) + 1.
    /// Returns the new local value.
    pub fn observe(&self, received: u64) -> u64 {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            let next = std::cmp::max(current, received) + 1;
            match self.0.compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst) {
            | Ok(_) => return next,
            | Err(actual) => current = actual,
            }
        }
    }
}
