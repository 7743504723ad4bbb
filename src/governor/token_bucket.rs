//! Lazily refilled token buckets for message and byte rate limiting.

use std::time::Instant;

/// A single token bucket. Starts full; refills continuously at `rate`
/// tokens per second up to `capacity`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    base_rate: f64,
    rate: f64,
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_second: f64, capacity: f64, now: Instant) -> Self {
        Self {
            capacity,
            base_rate: rate_per_second,
            rate: rate_per_second,
            available: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.available = (self.available + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Tokens on hand after refilling up to `now`.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.available
    }

    /// Cost actually charged for a request of `amount`. Requests larger than
    /// the bucket only need a full bucket.
    #[inline]
    fn charge(&self, amount: f64) -> f64 {
        amount.min(self.capacity)
    }

    fn has(&self, amount: f64) -> bool {
        self.available >= self.charge(amount)
    }

    fn take(&mut self, amount: f64) {
        self.available = (self.available - self.charge(amount)).max(0.0);
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Current refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Scale the refill rate to `fraction` of the configured rate. Tokens
    /// accrued so far are credited at the old rate first.
    pub fn set_rate_fraction(&mut self, fraction: f64, now: Instant) {
        self.refill(now);
        self.rate = self.base_rate * fraction;
    }
}

/// Message and byte buckets gated together.
///
/// A frame passes only if both enabled buckets can pay, and then both pay.
/// A disabled bucket always passes and is never charged.
#[derive(Debug, Clone)]
pub struct RateGate {
    messages: TokenBucket,
    bytes: TokenBucket,
    messages_enabled: bool,
    bytes_enabled: bool,
}

impl RateGate {
    pub fn new(
        messages_per_second: f64,
        message_burst: u32,
        bytes_per_second: u64,
        byte_burst: u64,
        now: Instant,
    ) -> Self {
        Self {
            messages: TokenBucket::new(messages_per_second, f64::from(message_burst), now),
            bytes: TokenBucket::new(bytes_per_second as f64, byte_burst as f64, now),
            messages_enabled: true,
            bytes_enabled: true,
        }
    }

    pub fn from_config(config: &crate::config::PipelineConfig, now: Instant) -> Self {
        let mut gate = Self::new(
            config.max_messages_per_second,
            config.max_burst_size,
            config.max_bytes_per_second,
            config.max_burst_bytes,
            now,
        );
        gate.messages_enabled = config.enable_rate_limiting;
        gate.bytes_enabled = config.enable_bytes_rate_limiting;
        gate
    }

    /// Consume `messages` message tokens and `bytes` byte tokens, all or
    /// nothing. Returns whether the tokens were taken.
    pub fn try_consume(&mut self, messages: u32, bytes: usize, now: Instant) -> bool {
        let messages = f64::from(messages);
        let bytes = bytes as f64;

        if self.messages_enabled {
            self.messages.refill(now);
            if !self.messages.has(messages) {
                return false;
            }
        }
        if self.bytes_enabled {
            self.bytes.refill(now);
            if !self.bytes.has(bytes) {
                return false;
            }
        }

        if self.messages_enabled {
            self.messages.take(messages);
        }
        if self.bytes_enabled {
            self.bytes.take(bytes);
        }
        true
    }

    /// Apply the adaptive fraction to both refill rates.
    pub fn set_rate_fraction(&mut self, fraction: f64, now: Instant) {
        self.messages.set_rate_fraction(fraction, now);
        self.bytes.set_rate_fraction(fraction, now);
    }

    pub fn available_messages(&mut self, now: Instant) -> f64 {
        self.messages.available(now)
    }

    pub fn available_bytes(&mut self, now: Instant) -> f64 {
        self.bytes.available(now)
    }

    pub fn message_rate(&self) -> f64 {
        self.messages.rate()
    }

    pub fn byte_rate(&self) -> f64 {
        self.bytes.rate()
    }
}
