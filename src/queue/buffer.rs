//! Four-level priority queue with keyed coalescing and pressure sampling.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::config::PipelineConfig;
use crate::error::DropReason;
use crate::metrics::DropCounters;
use crate::model::{Message, Priority};

use super::pressure;
use super::sampler::Downsampler;

/// Result of handing a message to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended to its priority level.
    Accepted,
    /// Replaced a pending message with the same (priority, key) in place.
    Coalesced,
    /// Rejected; the message is gone.
    Dropped(DropReason),
    /// The pipeline has shut down.
    Closed,
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted | Self::Coalesced)
    }
}

/// Queue statistics for monitoring and debugging.
#[derive(Debug, Default, Clone)]
pub struct QueueStats {
    pub messages_enqueued: u64,
    pub messages_coalesced: u64,
    pub messages_dequeued: u64,
    pub messages_requeued: u64,
    pub drops: DropCounters,
    /// Drops indexed by `Priority::index()`
    pub drops_by_priority: [u64; 4],
    /// Admissions (including coalesced) indexed by `MessageKind::index()`
    pub enqueued_by_kind: [u64; 5],
}

impl QueueStats {
    pub fn record_drop(&mut self, reason: DropReason, priority: Priority) {
        self.drops.record(reason);
        self.drops_by_priority[priority.index()] += 1;
    }
}

struct Entry {
    message: Message,
    /// Already passed the sampler once (put back after a throttle or failed send).
    sampled: bool,
}

/// Pending outbound messages across four FIFO levels.
///
/// Levels hold slot ids; the slots map owns the messages. Coalescing swaps
/// the message inside an existing slot so the queue position is unchanged.
pub struct PriorityQueue {
    levels: [VecDeque<u64>; 4],
    slots: HashMap<u64, Entry>,
    /// Per-level key -> slot id for pending coalescable messages
    keyed: [HashMap<String, u64>; 4],
    next_id: u64,
    capacity: usize,
    coalescing: bool,
    sampling: bool,
    pressure_threshold: f64,
    timeout: Option<Duration>,
    sampler: Downsampler,
    queued_bytes: usize,
    stats: QueueStats,
}

impl PriorityQueue {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            levels: Default::default(),
            slots: HashMap::with_capacity(config.max_queue_length.min(4096)),
            keyed: Default::default(),
            next_id: 0,
            capacity: config.max_queue_length,
            coalescing: config.enable_coalescing,
            sampling: config.enable_downsampling,
            pressure_threshold: config.queue_pressure_threshold,
            timeout: config.message_timeout(),
            sampler: Downsampler::new(
                config.normal_priority_sample_rate,
                config.low_priority_sample_rate,
            ),
            queued_bytes: 0,
            stats: QueueStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len_of(&self, priority: Priority) -> usize {
        self.levels[priority.index()].len()
    }

    /// Pending messages indexed by `Priority::index()`.
    pub fn len_by_priority(&self) -> [usize; 4] {
        Priority::ALL.map(|p| self.len_of(p))
    }

    /// Sum of pending payload sizes.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Fill ratio, 0.0 - 1.0.
    pub fn pressure(&self) -> f64 {
        pressure::ratio(self.len(), self.capacity)
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut QueueStats {
        &mut self.stats
    }

    /// Admit a message, coalescing or evicting as needed.
    pub fn enqueue(&mut self, message: Message) -> EnqueueOutcome {
        let priority = message.priority();
        self.stats.enqueued_by_kind[message.kind().index()] += 1;

        if self.coalescing && message.is_coalescable() {
            if let Some(&id) = self.keyed[priority.index()].get(message.key()) {
                if let Some(entry) = self.slots.get_mut(&id) {
                    trace!("Coalescing message with key: {}", message.key());
                    self.queued_bytes -= entry.message.size_bytes();
                    self.queued_bytes += message.size_bytes();
                    entry.message = message;
                    entry.sampled = false;
                    self.stats.messages_coalesced += 1;
                    return EnqueueOutcome::Coalesced;
                }
            }
        }

        if self.len() >= self.capacity {
            match self.eviction_level(priority) {
                Some(victim_level) => self.evict_oldest(victim_level, priority),
                None => {
                    warn!(
                        "Queue full, dropping incoming message (priority: {}, key: {})",
                        priority,
                        message.key()
                    );
                    self.stats.record_drop(DropReason::QueueFull, priority);
                    return EnqueueOutcome::Dropped(DropReason::QueueFull);
                }
            }
        }

        self.push_back(message, false);
        self.stats.messages_enqueued += 1;
        EnqueueOutcome::Accepted
    }

    /// Next message to send, or `None` when every level is empty.
    ///
    /// Expired and downsampled messages met on the way are dropped and
    /// counted. Critical messages never expire; Critical and High are
    /// never sampled.
    pub fn drain_candidate(&mut self, now: Instant) -> Option<Message> {
        for priority in Priority::ALL {
            loop {
                let sampling = self.sampling && self.pressure() > self.pressure_threshold;
                let entry = match self.pop_front(priority) {
                    Some(entry) => entry,
                    None => break,
                };

                if self.is_expired(&entry.message, now) {
                    trace!(
                        "Dropping expired message (age: {:.1}s, priority: {}, key: {})",
                        entry.message.age(now).as_secs_f64(),
                        priority,
                        entry.message.key()
                    );
                    self.stats.record_drop(DropReason::Expired, priority);
                    continue;
                }

                if sampling && !entry.sampled && priority.is_sampled() && !self.sampler.keep(priority) {
                    trace!("Downsampled message (priority: {}, key: {})", priority, entry.message.key());
                    self.stats.record_drop(DropReason::Downsampled, priority);
                    continue;
                }

                self.stats.messages_dequeued += 1;
                return Some(entry.message);
            }
        }
        None
    }

    /// Next Critical message only. Critical never expires or gets sampled.
    pub fn drain_critical(&mut self) -> Option<Message> {
        let entry = self.pop_front(Priority::Critical)?;
        self.stats.messages_dequeued += 1;
        Some(entry.message)
    }

    /// Put messages back at the front of their levels, preserving their
    /// relative order. Used for throttled candidates and failed sends.
    ///
    /// A message whose key has a newer pending message is coalesced away.
    /// At capacity, strictly lower-priority messages are evicted first;
    /// otherwise the returning message itself is dropped.
    ///
    /// Returns how many messages were put back.
    pub fn requeue_front(&mut self, messages: Vec<Message>) -> usize {
        let mut restored = 0;
        for message in messages.into_iter().rev() {
            let priority = message.priority();

            if self.coalescing
                && message.is_coalescable()
                && self.keyed[priority.index()].contains_key(message.key())
            {
                self.stats.messages_coalesced += 1;
                continue;
            }

            if self.len() >= self.capacity {
                match self.lowest_nonempty_level() {
                    Some(lowest) if lowest > priority => self.evict_oldest(lowest, priority),
                    _ => {
                        warn!(
                            "Queue full, dropping returned message (priority: {}, key: {})",
                            priority,
                            message.key()
                        );
                        self.stats.record_drop(DropReason::QueueFull, priority);
                        continue;
                    }
                }
            }

            self.push_front(message);
            self.stats.messages_requeued += 1;
            restored += 1;
        }
        restored
    }

    /// Remove everything, counting each message under `reason`.
    pub fn drain_all(&mut self, reason: DropReason) -> usize {
        let mut dropped = 0;
        for priority in Priority::ALL {
            while self.pop_front(priority).is_some() {
                self.stats.record_drop(reason, priority);
                dropped += 1;
            }
        }
        self.sampler.reset();
        dropped
    }

    /// Zero the counters and restart the sampling pattern. Pending
    /// messages are untouched.
    pub fn reset_stats(&mut self) {
        self.stats = QueueStats::default();
        self.sampler.reset();
    }

    fn is_expired(&self, message: &Message, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => !message.priority().is_critical() && message.age(now) > timeout,
            None => false,
        }
    }

    /// Level to evict from so that `incoming` can be admitted.
    fn eviction_level(&self, incoming: Priority) -> Option<Priority> {
        self.lowest_nonempty_level().filter(|lowest| *lowest >= incoming)
    }

    fn lowest_nonempty_level(&self) -> Option<Priority> {
        Priority::ALL
            .into_iter()
            .rev()
            .find(|p| !self.levels[p.index()].is_empty())
    }

    fn evict_oldest(&mut self, level: Priority, incoming: Priority) {
        if let Some(victim) = self.pop_front(level) {
            warn!(
                "Dropping queued message to make room (priority: {} -> {}, key: {})",
                level,
                incoming,
                victim.message.key()
            );
            self.stats.record_drop(DropReason::QueueFull, level);
        }
    }

    fn push_back(&mut self, message: Message, sampled: bool) {
        let priority = message.priority();
        let id = self.insert_slot(message, sampled);
        self.levels[priority.index()].push_back(id);
    }

    fn push_front(&mut self, message: Message) {
        let priority = message.priority();
        let id = self.insert_slot(message, true);
        self.levels[priority.index()].push_front(id);
    }

    fn insert_slot(&mut self, message: Message, sampled: bool) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        if self.coalescing && message.is_coalescable() {
            self.keyed[message.priority().index()].insert(message.key().to_string(), id);
        }
        self.queued_bytes += message.size_bytes();
        self.slots.insert(id, Entry { message, sampled });
        id
    }

    fn pop_front(&mut self, priority: Priority) -> Option<Entry> {
        let id = self.levels[priority.index()].pop_front()?;
        let entry = self.slots.remove(&id)?;

        let index = &mut self.keyed[priority.index()];
        if index.get(entry.message.key()) == Some(&id) {
            index.remove(entry.message.key());
        }
        self.queued_bytes -= entry.message.size_bytes();
        Some(entry)
    }
}
