//! Outbound Priority Queue
//!
//! Producers on any thread hand messages to a [`SharedQueue`]; the drain loop
//! is the only consumer.
//!
//! # Admission
//!
//! - A message whose (priority, key) is already pending replaces it in place
//! - At capacity, the oldest message of the lowest non-empty level is evicted
//!   as long as that level is not more important than the newcomer
//!
//! # Draining
//!
//! Levels drain Critical first, FIFO within a level. Expired messages are
//! dropped as they surface. When the fill ratio exceeds the pressure
//! threshold, Normal and Low traffic passes through a 1-in-N sampler.

pub mod buffer;
pub mod pressure;
pub mod sampler;

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::config::PipelineConfig;
use crate::model::Message;

pub use buffer::{EnqueueOutcome, PriorityQueue, QueueStats};
pub use pressure::QueuePressure;
pub use sampler::Downsampler;

/// Thread-safe handle around the priority queue.
///
/// Once closed, every enqueue returns [`EnqueueOutcome::Closed`].
pub struct SharedQueue {
    inner: Mutex<PriorityQueue>,
    closed: AtomicBool,
}

/// Queue occupancy at one instant.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub len_by_priority: [usize; 4],
    pub queued_bytes: usize,
    pub pressure: f64,
    pub stats: QueueStats,
}

impl SharedQueue {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            inner: Mutex::new(PriorityQueue::new(config)),
            closed: AtomicBool::new(false),
        }
    }

    /// Admit a message. Never blocks beyond the internal lock.
    pub fn enqueue(&self, message: Message) -> EnqueueOutcome {
        let mut queue = self.inner.lock();
        // Checked under the lock so nothing slips in after the final drain.
        if self.closed.load(Ordering::Acquire) {
            trace!("Queue closed, rejecting message with key: {}", message.key());
            return EnqueueOutcome::Closed;
        }
        queue.enqueue(message)
    }

    /// Exclusive access for the drain loop.
    pub fn lock(&self) -> MutexGuard<'_, PriorityQueue> {
        self.inner.lock()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reject all further enqueues.
    pub fn close(&self) {
        let _guard = self.inner.lock();
        self.closed.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let queue = self.inner.lock();
        QueueSnapshot {
            len_by_priority: queue.len_by_priority(),
            queued_bytes: queue.queued_bytes(),
            pressure: queue.pressure(),
            stats: queue.stats().clone(),
        }
    }
}
