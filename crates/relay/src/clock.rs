//! Monotonic time source for the event loop

use std::time::Instant;

/// Source of "now" for timeouts, pacing and session activity
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

/// The process monotonic clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
