//! Token bucket guarding handshake admission.
//!
//! One bucket per listener. Tokens refill continuously at `rate` per
//! second up to `burst`; each admitted handshake costs one token.
//! Connections rejected here are closed without any response on the wire.

use std::time::Instant;

/// Continuous-refill token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Create a bucket admitting `rate_per_sec` sustained with `burst`
    /// headroom. Non-positive inputs fall back to sane minimums.
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        let rate = if rate_per_sec == 0 { 1 } else { rate_per_sec };
        let burst = if burst == 0 { rate } else { burst };
        Self {
            rate: f64::from(rate),
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last: Instant::now(),
        }
    }

    /// Take one token if available, refilling for the elapsed time first.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + dt * self.rate).min(self.burst);
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}
