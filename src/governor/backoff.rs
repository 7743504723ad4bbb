//! Exponential backoff with jitter for transport failures.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::PipelineConfig;

/// Shortest wait ever scheduled, regardless of jitter.
pub const MIN_BACKOFF: Duration = Duration::from_millis(50);

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Wait this long before trying again.
    Wait(Duration),
    /// Reconnect attempts exhausted.
    GiveUp,
}

/// Tracks consecutive failures and the current backoff window.
#[derive(Debug, Clone)]
pub struct BackoffController {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_percent: f64,
    max_attempts: u32,

    consecutive_failures: u32,
    /// Un-jittered wait of the latest failure
    current: Duration,
    until: Option<Instant>,
}

impl BackoffController {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            initial: Duration::from_secs_f64(config.initial_backoff_secs.max(0.0)),
            max: Duration::from_secs_f64(config.max_backoff_secs.max(0.0)),
            multiplier: config.backoff_multiplier.max(1.0),
            jitter_percent: config.reconnect_jitter_percent.clamp(0.0, 100.0),
            max_attempts: config.max_reconnect_attempts,
            consecutive_failures: 0,
            current: Duration::ZERO,
            until: None,
        }
    }

    /// Register a failure and schedule the next attempt.
    pub fn on_failure(&mut self, now: Instant) -> BackoffDecision {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.max_attempts > 0 && self.consecutive_failures > self.max_attempts {
            warn!(
                "Giving up after {} consecutive failures",
                self.consecutive_failures
            );
            self.until = None;
            return BackoffDecision::GiveUp;
        }

        self.advance();
        let wait = self.jittered(self.current);
        self.until = Some(now + wait);
        debug!(
            "Backoff #{}: waiting {:.2}s (base {:.2}s)",
            self.consecutive_failures,
            wait.as_secs_f64(),
            self.current.as_secs_f64()
        );
        BackoffDecision::Wait(wait)
    }

    /// Server asked us to slow down. Uses `retry_after` when given, otherwise
    /// the next step of the exponential schedule. Never gives up.
    pub fn on_rate_limited(&mut self, retry_after: Option<Duration>, now: Instant) -> Duration {
        let wait = match retry_after {
            Some(delay) => delay.max(MIN_BACKOFF),
            None => {
                self.advance();
                self.jittered(self.current)
            }
        };
        // Never shorten a wait that is already running.
        let until = now + wait;
        self.until = Some(self.until.map_or(until, |existing| existing.max(until)));
        debug!("Rate limited by server, pausing {:.2}s", wait.as_secs_f64());
        wait
    }

    fn advance(&mut self) {
        self.current = if self.current.is_zero() {
            self.initial
        } else {
            self.current.mul_f64(self.multiplier).min(self.max)
        };
    }

    fn jittered(&self, base: Duration) -> Duration {
        let secs = base.as_secs_f64();
        let spread = secs * self.jitter_percent / 100.0;
        let secs = if spread > 0.0 {
            rand::thread_rng().gen_range((secs - spread)..=(secs + spread))
        } else {
            secs
        };
        Duration::from_secs_f64(secs.max(0.0)).max(MIN_BACKOFF)
    }

    /// Reset after a successful connect or send.
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(
                "Backoff reset after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.current = Duration::ZERO;
        self.until = None;
    }

    /// Whether a wait is scheduled and still running at `now`.
    pub fn is_active(&self, now: Instant) -> bool {
        self.until.map_or(false, |until| now < until)
    }

    /// Whether no wait is running at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.until.map_or(true, |until| now >= until)
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now))
    }

    /// Forget the scheduled wait, keeping the failure streak.
    pub fn clear_wait(&mut self) {
        self.until = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Un-jittered base of the most recent wait.
    pub fn current(&self) -> Duration {
        self.current
    }
}
