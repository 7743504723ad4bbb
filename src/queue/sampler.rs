//! Deterministic 1-in-N sampler for lower-priority traffic.

use crate::model::Priority;

/// Keeps exactly one of every `rate` eligible candidates per priority level.
///
/// Each level has its own monotonically increasing counter; a candidate is
/// kept iff `counter % rate == 0`, so the pattern depends only on position.
#[derive(Debug, Clone)]
pub struct Downsampler {
    counters: [u64; 4],
    normal_rate: u32,
    low_rate: u32,
}

impl Downsampler {
    pub fn new(normal_rate: u32, low_rate: u32) -> Self {
        Self {
            counters: [0; 4],
            normal_rate,
            low_rate,
        }
    }

    /// Sample rate for a level. 1 means keep everything.
    pub fn rate_for(&self, priority: Priority) -> u32 {
        match priority {
            Priority::Critical | Priority::High => 1,
            Priority::Normal => self.normal_rate.max(1),
            Priority::Low => self.low_rate.max(1),
        }
    }

    /// Advance the level's counter and decide whether this candidate survives.
    pub fn keep(&mut self, priority: Priority) -> bool {
        let rate = self.rate_for(priority);
        if rate <= 1 {
            return true;
        }
        let counter = &mut self.counters[priority.index()];
        let position = *counter;
        *counter = counter.wrapping_add(1);
        position % u64::from(rate) == 0
    }

    pub fn reset(&mut self) {
        self.counters = [0; 4];
    }
}
