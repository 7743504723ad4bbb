//! Pipeline configuration with tunable limits.

use std::time::Duration;

use serde::Deserialize;

use crate::error::OutboundError;

/// Configuration for the outbound pipeline.
///
/// Supplied once at construction and never mutated afterwards. Every field has
/// a default, so partial JSON documents deserialize cleanly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // --- Rate limiting ---
    /// Gate frames through the message token bucket (default: true)
    pub enable_rate_limiting: bool,
    /// Sustained frame rate ceiling (default: 50/s)
    pub max_messages_per_second: f64,
    /// Message bucket capacity (default: 20)
    pub max_burst_size: u32,
    /// Queue capacity across all priorities (default: 500)
    pub max_queue_length: usize,
    /// Drop non-critical messages older than this, 0 disables (default: 30s)
    pub message_timeout_secs: f64,
    /// Replace pending messages sharing (priority, key) (default: true)
    pub enable_coalescing: bool,
    /// Let Critical frames skip the token bucket (default: false)
    pub critical_bypass_rate_limit: bool,

    // --- Bandwidth ---
    /// Gate frames through the byte token bucket (default: true)
    pub enable_bytes_rate_limiting: bool,
    /// Sustained byte rate ceiling (default: 1 MiB/s)
    pub max_bytes_per_second: u64,
    /// Byte bucket capacity (default: 256 KiB)
    pub max_burst_bytes: u64,

    // --- Batching ---
    /// Combine messages into batch frames (default: true)
    pub enable_batching: bool,
    /// Messages per frame (default: 10)
    pub max_batch_messages: usize,
    /// Payload bytes per frame (default: 64 KiB)
    pub max_batch_bytes: usize,
    /// Longest a frame may stay open (default: 16ms)
    pub max_batch_interval_ms: u64,
    /// Send Critical messages as their own frame immediately (default: true)
    pub critical_bypass_batching: bool,

    // --- Downsampling ---
    /// Sample Normal/Low traffic when the queue is under pressure (default: true)
    pub enable_downsampling: bool,
    /// Keep 1 in N Low messages under pressure (default: 5)
    pub low_priority_sample_rate: u32,
    /// Keep 1 in N Normal messages under pressure (default: 2)
    pub normal_priority_sample_rate: u32,
    /// Queue fill ratio above which sampling kicks in (default: 0.7)
    pub queue_pressure_threshold: f64,

    // --- Adaptive rate ---
    /// Adjust the send rate from observed backpressure (default: true)
    pub enable_adaptive_rate: bool,
    /// Multiplier applied after a clean interval (default: 1.1)
    pub rate_increase_factor: f64,
    /// Multiplier applied after an interval with backpressure (default: 0.5)
    pub rate_decrease_factor: f64,
    /// Floor as a fraction of the maximum rate (default: 0.1)
    pub min_rate_fraction: f64,
    /// Seconds between rate adjustments (default: 1.0)
    pub rate_adjustment_interval_secs: f64,

    // --- Backoff ---
    /// First backoff wait (default: 1s)
    pub initial_backoff_secs: f64,
    /// Backoff ceiling (default: 60s)
    pub max_backoff_secs: f64,
    /// Growth per consecutive failure (default: 2.0)
    pub backoff_multiplier: f64,
    /// Send attempts before a non-critical message is dropped, 0 = unlimited (default: 5)
    pub max_retry_count: u32,
    /// Reconnect attempts before giving up, 0 = unlimited (default: 10)
    pub max_reconnect_attempts: u32,
    /// Randomize each backoff wait by +/- this percentage (default: 10)
    pub reconnect_jitter_percent: f64,
    /// Let Critical messages send during a backoff while the link is up (default: false)
    pub critical_bypass_backoff: bool,

    // --- Processing ---
    /// Drain loop period (default: 16ms, ~60 Hz)
    pub queue_process_interval_ms: u64,
    /// Seconds between metrics summaries, 0 disables (default: 5.0)
    pub metrics_interval_secs: f64,
    /// Frames buffered between the drain loop and the socket task (default: 64)
    pub outbound_channel_capacity: usize,
    /// Pipeline events buffered for the embedder (default: 256)
    pub event_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_rate_limiting: true,
            max_messages_per_second: 50.0,
            max_burst_size: 20,
            max_queue_length: 500,
            message_timeout_secs: 30.0,
            enable_coalescing: true,
            critical_bypass_rate_limit: false,

            enable_bytes_rate_limiting: true,
            max_bytes_per_second: 1_048_576,
            max_burst_bytes: 262_144,

            enable_batching: true,
            max_batch_messages: 10,
            max_batch_bytes: 65_536,
            max_batch_interval_ms: 16,
            critical_bypass_batching: true,

            enable_downsampling: true,
            low_priority_sample_rate: 5,
            normal_priority_sample_rate: 2,
            queue_pressure_threshold: 0.7,

            enable_adaptive_rate: true,
            rate_increase_factor: 1.1,
            rate_decrease_factor: 0.5,
            min_rate_fraction: 0.1,
            rate_adjustment_interval_secs: 1.0,

            initial_backoff_secs: 1.0,
            max_backoff_secs: 60.0,
            backoff_multiplier: 2.0,
            max_retry_count: 5,
            max_reconnect_attempts: 10,
            reconnect_jitter_percent: 10.0,
            critical_bypass_backoff: false,

            queue_process_interval_ms: 16,
            metrics_interval_secs: 5.0,
            outbound_channel_capacity: 64,
            event_channel_capacity: 256,
        }
    }
}

impl PipelineConfig {
    /// Create a new config builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Small frames, short batching window, Critical skips everything it can.
    /// Use this for interactive control surfaces.
    pub fn low_latency() -> Self {
        Self {
            max_messages_per_second: 120.0,
            max_burst_size: 60,
            max_batch_messages: 4,
            max_batch_interval_ms: 4,
            critical_bypass_rate_limit: true,
            critical_bypass_backoff: true,
            queue_process_interval_ms: 4,
            ..Default::default()
        }
    }

    /// Conservative limits for slow or metered uplinks.
    pub fn constrained_link() -> Self {
        Self {
            max_messages_per_second: 10.0,
            max_burst_size: 5,
            max_bytes_per_second: 65_536,
            max_burst_bytes: 32_768,
            max_batch_messages: 50,
            max_batch_bytes: 16_384,
            max_batch_interval_ms: 100,
            low_priority_sample_rate: 10,
            normal_priority_sample_rate: 3,
            queue_pressure_threshold: 0.5,
            ..Default::default()
        }
    }

    pub fn queue_process_interval(&self) -> Duration {
        Duration::from_millis(self.queue_process_interval_ms.max(1))
    }

    pub fn max_batch_interval(&self) -> Duration {
        Duration::from_millis(self.max_batch_interval_ms)
    }

    /// `None` when expiry is disabled.
    pub fn message_timeout(&self) -> Option<Duration> {
        (self.message_timeout_secs > 0.0).then(|| Duration::from_secs_f64(self.message_timeout_secs))
    }

    pub fn rate_adjustment_interval(&self) -> Duration {
        Duration::from_secs_f64(self.rate_adjustment_interval_secs.max(0.0))
    }

    /// `None` when periodic metrics are disabled.
    pub fn metrics_interval(&self) -> Option<Duration> {
        (self.metrics_interval_secs > 0.0).then(|| Duration::from_secs_f64(self.metrics_interval_secs))
    }

    /// Effective per-frame message limit.
    pub fn batch_limit(&self) -> usize {
        if self.enable_batching {
            self.max_batch_messages.max(1)
        } else {
            1
        }
    }

    /// Reject values that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<(), OutboundError> {
        fn invalid(msg: &str) -> Result<(), OutboundError> {
            Err(OutboundError::InvalidConfig(msg.to_string()))
        }

        let finite = [
            ("max_messages_per_second", self.max_messages_per_second),
            ("message_timeout_secs", self.message_timeout_secs),
            ("rate_increase_factor", self.rate_increase_factor),
            ("rate_adjustment_interval_secs", self.rate_adjustment_interval_secs),
            ("initial_backoff_secs", self.initial_backoff_secs),
            ("max_backoff_secs", self.max_backoff_secs),
            ("backoff_multiplier", self.backoff_multiplier),
            ("metrics_interval_secs", self.metrics_interval_secs),
        ];
        for (name, value) in finite {
            if !value.is_finite() || value < 0.0 {
                return Err(OutboundError::InvalidConfig(format!(
                    "{} must be finite and non-negative",
                    name
                )));
            }
        }

        if self.max_queue_length == 0 {
            return invalid("max_queue_length must be positive");
        }
        if !(self.max_messages_per_second > 0.0) {
            return invalid("max_messages_per_second must be positive");
        }
        if self.max_burst_size == 0 {
            return invalid("max_burst_size must be positive");
        }
        if self.enable_bytes_rate_limiting
            && (self.max_bytes_per_second == 0 || self.max_burst_bytes == 0)
        {
            return invalid("byte limits must be positive when byte rate limiting is on");
        }
        if self.max_batch_messages == 0 || self.max_batch_bytes == 0 {
            return invalid("batch limits must be positive");
        }
        if !(0.0..=1.0).contains(&self.queue_pressure_threshold) {
            return invalid("queue_pressure_threshold must be within [0, 1]");
        }
        if !(self.min_rate_fraction > 0.0 && self.min_rate_fraction <= 1.0) {
            return invalid("min_rate_fraction must be within (0, 1]");
        }
        if self.rate_increase_factor < 1.0 {
            return invalid("rate_increase_factor must be >= 1");
        }
        if !(self.rate_decrease_factor > 0.0 && self.rate_decrease_factor <= 1.0) {
            return invalid("rate_decrease_factor must be within (0, 1]");
        }
        if self.initial_backoff_secs < 0.0 || self.max_backoff_secs < self.initial_backoff_secs {
            return invalid("backoff bounds must satisfy 0 <= initial <= max");
        }
        if self.backoff_multiplier < 1.0 {
            return invalid("backoff_multiplier must be >= 1");
        }
        if !(0.0..=100.0).contains(&self.reconnect_jitter_percent) {
            return invalid("reconnect_jitter_percent must be within [0, 100]");
        }
        if self.outbound_channel_capacity == 0 || self.event_channel_capacity == 0 {
            return invalid("channel capacities must be positive");
        }
        Ok(())
    }
}

/// Builder pattern for PipelineConfig.
#[derive(Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Set the sustained frame rate and burst.
    pub fn message_rate(mut self, per_second: f64, burst: u32) -> Self {
        self.config.max_messages_per_second = per_second;
        self.config.max_burst_size = burst;
        self
    }

    /// Set the sustained byte rate and burst.
    pub fn byte_rate(mut self, per_second: u64, burst: u64) -> Self {
        self.config.max_bytes_per_second = per_second;
        self.config.max_burst_bytes = burst;
        self
    }

    /// Turn the token buckets on or off.
    pub fn rate_limiting(mut self, messages: bool, bytes: bool) -> Self {
        self.config.enable_rate_limiting = messages;
        self.config.enable_bytes_rate_limiting = bytes;
        self
    }

    /// Set the queue capacity.
    pub fn max_queue_length(mut self, len: usize) -> Self {
        self.config.max_queue_length = len;
        self
    }

    /// Set the message timeout in seconds (0 disables expiry).
    pub fn message_timeout_secs(mut self, secs: f64) -> Self {
        self.config.message_timeout_secs = secs;
        self
    }

    /// Enable or disable coalescing.
    pub fn coalescing(mut self, enable: bool) -> Self {
        self.config.enable_coalescing = enable;
        self
    }

    /// Enable or disable batching.
    pub fn batching(mut self, enable: bool) -> Self {
        self.config.enable_batching = enable;
        self
    }

    /// Set all three batch sealing limits.
    pub fn batch_limits(mut self, messages: usize, bytes: usize, interval_ms: u64) -> Self {
        self.config.max_batch_messages = messages;
        self.config.max_batch_bytes = bytes;
        self.config.max_batch_interval_ms = interval_ms;
        self
    }

    /// Configure downsampling.
    pub fn downsampling(mut self, enable: bool, normal_rate: u32, low_rate: u32, threshold: f64) -> Self {
        self.config.enable_downsampling = enable;
        self.config.normal_priority_sample_rate = normal_rate;
        self.config.low_priority_sample_rate = low_rate;
        self.config.queue_pressure_threshold = threshold;
        self
    }

    /// Configure adaptive rate control.
    pub fn adaptive_rate(mut self, enable: bool, increase: f64, decrease: f64, min_fraction: f64) -> Self {
        self.config.enable_adaptive_rate = enable;
        self.config.rate_increase_factor = increase;
        self.config.rate_decrease_factor = decrease;
        self.config.min_rate_fraction = min_fraction;
        self
    }

    /// Set the adaptive rate adjustment interval in seconds.
    pub fn rate_adjustment_interval_secs(mut self, secs: f64) -> Self {
        self.config.rate_adjustment_interval_secs = secs;
        self
    }

    /// Configure the backoff schedule.
    pub fn backoff(mut self, initial_secs: f64, max_secs: f64, multiplier: f64) -> Self {
        self.config.initial_backoff_secs = initial_secs;
        self.config.max_backoff_secs = max_secs;
        self.config.backoff_multiplier = multiplier;
        self
    }

    /// Set the backoff jitter percentage.
    pub fn jitter_percent(mut self, percent: f64) -> Self {
        self.config.reconnect_jitter_percent = percent;
        self
    }

    /// Set retry and reconnect limits (0 = unlimited).
    pub fn retry_limits(mut self, max_retry_count: u32, max_reconnect_attempts: u32) -> Self {
        self.config.max_retry_count = max_retry_count;
        self.config.max_reconnect_attempts = max_reconnect_attempts;
        self
    }

    /// Configure which stages Critical messages may skip.
    pub fn critical_bypass(mut self, batching: bool, rate_limit: bool, backoff: bool) -> Self {
        self.config.critical_bypass_batching = batching;
        self.config.critical_bypass_rate_limit = rate_limit;
        self.config.critical_bypass_backoff = backoff;
        self
    }

    /// Set the drain loop period in milliseconds.
    pub fn queue_process_interval_ms(mut self, ms: u64) -> Self {
        self.config.queue_process_interval_ms = ms;
        self
    }

    /// Set the metrics summary interval in seconds (0 disables).
    pub fn metrics_interval_secs(mut self, secs: f64) -> Self {
        self.config.metrics_interval_secs = secs;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}
