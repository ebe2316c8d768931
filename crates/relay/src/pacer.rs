//! Outbound token bucket
//!
//! Tokens are bytes. The bucket refills at the configured rate once per
//! loop wakeup and every tunnel send spends its full Echo payload size.

use std::time::Instant;

/// Default bucket size in bytes
pub const DEFAULT_BURST_BYTES: u32 = 4500;

/// Byte-based token bucket; a zero rate disables it
#[derive(Debug, Clone)]
pub struct RateLimiter {
    enabled: bool,
    tokens: f64,
    burst: f64,
    /// Bytes added per elapsed millisecond
    refill_per_ms: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a bucket refilling at `rate_kbps` kilobits per second and
    /// holding at most `burst_bytes`. The bucket starts full.
    pub fn new(rate_kbps: u32, burst_bytes: u32, now: Instant) -> Self {
        let burst = f64::from(burst_bytes);
        Self {
            enabled: rate_kbps > 0,
            tokens: burst,
            burst,
            refill_per_ms: f64::from(rate_kbps) * 1000.0 / 8.0 / 1000.0,
            last_refill: now,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Add tokens for the time elapsed since the previous refill
    pub fn refill(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }
        // A clock that went backwards only resets the reference point
        if let Some(elapsed) = now.checked_duration_since(self.last_refill) {
            let elapsed_ms = elapsed.as_micros() as f64 / 1000.0;
            self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.burst);
        }
        self.last_refill = now;
    }

    /// Spend `bytes` tokens if available
    pub fn allow_send(&mut self, bytes: usize) -> bool {
        if !self.enabled {
            return true;
        }
        let cost = bytes as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket
    pub fn available(&self) -> f64 {
        self.tokens
    }
}
