//! Pipeline counters and throughput snapshots.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::DropReason;
use crate::model::Priority;
use crate::pipeline::PipelineState;

/// Terminal drop counts keyed by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    pub queue_full: u64,
    pub expired: u64,
    pub downsampled: u64,
    pub retry_exhausted: u64,
    pub shutdown: u64,
}

impl DropCounters {
    pub fn record(&mut self, reason: DropReason) {
        *self.slot(reason) += 1;
    }

    pub fn record_many(&mut self, reason: DropReason, count: u64) {
        *self.slot(reason) += count;
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::QueueFull => self.queue_full,
            DropReason::Expired => self.expired,
            DropReason::Downsampled => self.downsampled,
            DropReason::RetryExhausted => self.retry_exhausted,
            DropReason::Shutdown => self.shutdown,
        }
    }

    pub fn total(&self) -> u64 {
        DropReason::ALL.iter().map(|r| self.get(*r)).sum()
    }

    fn slot(&mut self, reason: DropReason) -> &mut u64 {
        match reason {
            DropReason::QueueFull => &mut self.queue_full,
            DropReason::Expired => &mut self.expired,
            DropReason::Downsampled => &mut self.downsampled,
            DropReason::RetryExhausted => &mut self.retry_exhausted,
            DropReason::Shutdown => &mut self.shutdown,
        }
    }
}

/// Sliding one-second view of what went out on the wire.
#[derive(Debug)]
pub struct ThroughputWindow {
    window: Duration,
    samples: VecDeque<Sample>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    messages: usize,
    bytes: usize,
}

/// Per-window totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Throughput {
    pub frames: u64,
    pub messages: u64,
    pub bytes: u64,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(128),
        }
    }

    /// Record one frame.
    pub fn record(&mut self, now: Instant, messages: usize, bytes: usize) {
        self.samples.push_back(Sample {
            at: now,
            messages,
            bytes,
        });
        self.prune(now);
    }

    /// Totals over the trailing window ending at `now`.
    pub fn totals(&mut self, now: Instant) -> Throughput {
        self.prune(now);
        self.samples.iter().fold(Throughput::default(), |mut acc, s| {
            acc.frames += 1;
            acc.messages += s.messages as u64;
            acc.bytes += s.bytes as u64;
            acc
        })
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Drop count over a trailing window, fed from the cumulative drop total.
#[derive(Debug)]
pub struct DropWindow {
    window: Duration,
    last_total: u64,
    samples: VecDeque<(Instant, u64)>,
}

impl DropWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_total: 0,
            samples: VecDeque::new(),
        }
    }

    /// Attribute whatever `total` grew by since the last call to `now`.
    pub fn observe(&mut self, now: Instant, total: u64) {
        let delta = total.saturating_sub(self.last_total);
        self.last_total = total;
        if delta > 0 {
            self.samples.push_back((now, delta));
        }
        self.prune(now);
    }

    pub fn count(&mut self, now: Instant) -> u64 {
        self.prune(now);
        self.samples.iter().map(|(_, n)| n).sum()
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for DropWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Point-in-time snapshot published by the drain loop.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub state: PipelineState,

    // --- Throughput ---
    pub messages_sent_last_second: u64,
    pub bytes_sent_last_second: u64,
    pub frames_sent_last_second: u64,
    pub messages_sent_total: u64,
    pub frames_sent_total: u64,
    pub bytes_sent_total: u64,

    // --- Queue ---
    /// Pending messages indexed by `Priority::index()`
    pub queue_length: [usize; 4],
    pub queue_bytes: usize,
    /// Fill ratio, 0.0 - 1.0
    pub queue_pressure: f64,

    // --- Drops ---
    pub drops: DropCounters,
    pub messages_dropped_last_second: u64,
    /// Drops indexed by `Priority::index()`
    pub drops_by_priority: [u64; 4],
    pub coalesced_total: u64,
    /// Enqueue attempts indexed by `MessageKind::index()`
    pub enqueued_by_kind: [u64; 5],

    // --- Rate control ---
    /// Effective frames/s ceiling after adaptive adjustment
    pub current_rate: f64,
    /// Effective bytes/s ceiling after adaptive adjustment
    pub current_byte_rate: f64,
    pub available_message_tokens: f64,
    pub available_byte_tokens: f64,

    // --- Backoff ---
    pub backing_off: bool,
    pub current_backoff: Duration,
    pub backoff_remaining: Duration,
    pub consecutive_failures: u32,
    /// Backoff periods entered since start or the last reset
    pub backoff_count: u64,

    // --- Batching ---
    /// Mean messages per frame since start
    pub average_batch_size: f64,
    pub average_batch_bytes: f64,
    /// Share of sent messages that travelled in a multi-message frame
    pub batching_efficiency: f64,
}

impl PipelineMetrics {
    pub fn queue_len_total(&self) -> usize {
        self.queue_length.iter().sum()
    }

    pub fn queue_len(&self, priority: Priority) -> usize {
        self.queue_length[priority.index()]
    }
}

impl std::fmt::Display for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} msg/s, {} B/s, {} frames/s, queue={} ({:.0}%), drops={} ({}/s), rate={:.1}/s",
            self.messages_sent_last_second,
            self.bytes_sent_last_second,
            self.frames_sent_last_second,
            self.queue_len_total(),
            self.queue_pressure * 100.0,
            self.drops.total(),
            self.messages_dropped_last_second,
            self.current_rate,
        )?;
        if self.backing_off {
            write!(f, " [BACKOFF {:.1}s]", self.backoff_remaining.as_secs_f64())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_counters() {
        let mut drops = DropCounters::default();
        drops.record(DropReason::QueueFull);
        drops.record(DropReason::QueueFull);
        drops.record_many(DropReason::Downsampled, 4);

        assert_eq!(drops.get(DropReason::QueueFull), 2);
        assert_eq!(drops.get(DropReason::Downsampled), 4);
        assert_eq!(drops.get(DropReason::Expired), 0);
        assert_eq!(drops.total(), 6);
    }

    #[test]
    fn test_throughput_window_prunes() {
        let t0 = Instant::now();
        let mut window = ThroughputWindow::new(Duration::from_secs(1));

        window.record(t0, 3, 300);
        window.record(t0 + Duration::from_millis(500), 1, 100);

        let totals = window.totals(t0 + Duration::from_millis(900));
        assert_eq!(totals, Throughput { frames: 2, messages: 4, bytes: 400 });

        let totals = window.totals(t0 + Duration::from_millis(1200));
        assert_eq!(totals, Throughput { frames: 1, messages: 1, bytes: 100 });
    }

    #[test]
    fn test_drop_window_counts_growth() {
        let t0 = Instant::now();
        let mut window = DropWindow::new(Duration::from_secs(1));

        window.observe(t0, 3);
        window.observe(t0 + Duration::from_millis(400), 3);
        window.observe(t0 + Duration::from_millis(800), 5);
        assert_eq!(window.count(t0 + Duration::from_millis(900)), 5);
        assert_eq!(window.count(t0 + Duration::from_millis(1500)), 2);

        // Counter reset upstream.
        window.observe(t0 + Duration::from_millis(1600), 0);
        window.observe(t0 + Duration::from_millis(1700), 1);
        assert_eq!(window.count(t0 + Duration::from_millis(1700)), 3);
    }

    #[test]
    fn test_display() {
        let metrics = PipelineMetrics {
            messages_sent_last_second: 45,
            queue_length: [1, 2, 3, 4],
            queue_pressure: 0.5,
            current_rate: 25.0,
            ..Default::default()
        };
        let s = format!("{}", metrics);
        assert!(s.contains("45 msg/s"));
        assert!(s.contains("queue=10 (50%)"));
        assert!(!s.contains("BACKOFF"));
    }
}
