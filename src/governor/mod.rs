//! Send-rate governance: token buckets, adaptive rate and backoff.
//!
//! The drain loop owns one of each; none of them is shared across threads.

pub mod backoff;
pub mod token_bucket;

pub use backoff::{BackoffController, BackoffDecision, MIN_BACKOFF};
pub use token_bucket::{RateGate, TokenBucket};

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::PipelineConfig;

/// Multiplicative increase / multiplicative decrease of the send rate.
///
/// Any backpressure observed during an adjustment interval lowers the rate
/// at the next boundary; a clean interval raises it. The rate is kept as a
/// fraction of `max_messages_per_second` so it can scale both buckets.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    enabled: bool,
    max_rate: f64,
    fraction: f64,
    min_fraction: f64,
    increase_factor: f64,
    decrease_factor: f64,
    interval: Duration,
    last_adjustment: Instant,
    /// Set by `observe_backpressure`, cleared at every adjustment
    backpressure: bool,
}

impl AdaptiveController {
    pub fn new(config: &PipelineConfig, now: Instant) -> Self {
        Self {
            enabled: config.enable_adaptive_rate,
            max_rate: config.max_messages_per_second,
            fraction: 1.0,
            min_fraction: config.min_rate_fraction.clamp(f64::MIN_POSITIVE, 1.0),
            increase_factor: config.rate_increase_factor,
            decrease_factor: config.rate_decrease_factor,
            interval: config.rate_adjustment_interval(),
            last_adjustment: now,
            backpressure: false,
        }
    }

    /// Record that the link pushed back during the current interval.
    #[inline]
    pub fn observe_backpressure(&mut self) {
        self.backpressure = true;
    }

    pub fn backpressure_observed(&self) -> bool {
        self.backpressure
    }

    /// Adjust at most once per interval. Returns the new fraction when it
    /// changed.
    pub fn maybe_adjust(&mut self, now: Instant) -> Option<f64> {
        if now.saturating_duration_since(self.last_adjustment) < self.interval {
            return None;
        }
        self.last_adjustment = now;
        let backpressure = std::mem::take(&mut self.backpressure);

        if !self.enabled {
            return None;
        }

        let previous = self.fraction;
        self.fraction = if backpressure {
            (self.fraction * self.decrease_factor).max(self.min_fraction)
        } else {
            (self.fraction * self.increase_factor).min(1.0)
        };

        if self.fraction == previous {
            return None;
        }

        if backpressure && self.fraction == self.min_fraction {
            info!("Send rate at floor: {:.1}/s", self.current_rate());
        } else {
            debug!(
                "Send rate {} to {:.1}/s ({:.0}%)",
                if backpressure { "lowered" } else { "raised" },
                self.current_rate(),
                self.fraction * 100.0
            );
        }
        Some(self.fraction)
    }

    /// Effective frames/s ceiling.
    #[inline]
    pub fn current_rate(&self) -> f64 {
        self.fraction * self.max_rate
    }

    /// Effective rate as a fraction of the configured maximum.
    #[inline]
    pub fn fraction(&self) -> f64 {
        self.fraction
    }
}
