use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::PipelineConfig;
use crate::model::{Frame, Message};

/// Result of offering a message to the builder.
#[derive(Debug)]
pub enum Offer {
    /// Held in the open frame.
    Buffered,
    /// A frame was sealed and must be sent (or held) by the caller.
    Sealed(Frame),
}

/// Accumulates drained messages into bounded frames.
///
/// A frame seals when it reaches `max_batch_messages`, when the next message
/// would push it past `max_batch_bytes`, or once it has been open for
/// `max_batch_interval`.
#[derive(Debug)]
pub struct BatchBuilder {
    max_messages: usize,
    max_bytes: usize,
    max_interval: Duration,
    critical_bypass: bool,

    pending: Vec<Message>,
    pending_bytes: usize,
    opened_at: Option<Instant>,
}

impl BatchBuilder {
    pub fn new(config: &PipelineConfig) -> Self {
        let max_messages = config.batch_limit();
        Self {
            max_messages,
            max_bytes: config.max_batch_bytes.max(1),
            max_interval: config.max_batch_interval(),
            critical_bypass: config.critical_bypass_batching,
            pending: Vec::with_capacity(max_messages),
            pending_bytes: 0,
            opened_at: None,
        }
    }

    /// Add a message, sealing whatever the limits require.
    pub fn offer(&mut self, message: Message, now: Instant) -> Offer {
        if self.critical_bypass && message.priority().is_critical() {
            trace!("Critical message bypasses batching (key: {})", message.key());
            return Offer::Sealed(Frame::single(message));
        }

        let mut sealed = None;
        let would_overflow = self.pending.len() + 1 > self.max_messages
            || self.pending_bytes + message.size_bytes() > self.max_bytes;
        if !self.pending.is_empty() && would_overflow {
            sealed = self.seal();
        }

        if self.pending.is_empty() {
            self.opened_at = Some(now);
        }
        self.pending_bytes += message.size_bytes();
        self.pending.push(message);

        if sealed.is_none() && self.pending.len() >= self.max_messages {
            sealed = self.seal();
        }

        match sealed {
            Some(frame) => Offer::Sealed(frame),
            None => Offer::Buffered,
        }
    }

    /// Seal the open frame if it has been open for the full interval.
    pub fn flush_if_stale(&mut self, now: Instant) -> Option<Frame> {
        let opened_at = self.opened_at?;
        if now.saturating_duration_since(opened_at) >= self.max_interval {
            self.seal()
        } else {
            None
        }
    }

    /// Seal the open frame regardless of age.
    pub fn flush(&mut self) -> Option<Frame> {
        self.seal()
    }

    /// Give back the open frame's messages unsealed, in order.
    pub fn take_pending(&mut self) -> Vec<Message> {
        self.opened_at = None;
        self.pending_bytes = 0;
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn seal(&mut self) -> Option<Frame> {
        if self.pending.is_empty() {
            return None;
        }
        let messages = std::mem::replace(&mut self.pending, Vec::with_capacity(self.max_messages));
        self.pending_bytes = 0;
        self.opened_at = None;
        trace!("Sealed frame with {} messages", messages.len());
        Some(Frame::seal(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, WireFrame};

    fn builder(messages: usize, bytes: usize, interval_ms: u64) -> BatchBuilder {
        let config = PipelineConfig::builder()
            .batch_limits(messages, bytes, interval_ms)
            .build();
        BatchBuilder::new(&config)
    }

    fn msg(n: usize, priority: Priority) -> Message {
        Message::from_json(format!(r#"{{"n":{}}}"#, n), priority, "").unwrap()
    }

    fn sealed(offer: Offer) -> Option<Frame> {
        match offer {
            Offer::Sealed(frame) => Some(frame),
            Offer::Buffered => None,
        }
    }

    #[test]
    fn test_count_limit() {
        let mut batch = builder(3, 65_536, 1000);
        let now = Instant::now();

        let mut frames: Vec<Frame> = (0..7)
            .filter_map(|n| sealed(batch.offer(msg(n, Priority::Normal), now)))
            .collect();
        frames.extend(batch.flush());

        let sizes: Vec<usize> = frames.iter().map(Frame::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_byte_limit_seals_before_overflow() {
        // Each payload is 7 bytes: {"n":0}
        let mut batch = builder(10, 20, 1000);
        let now = Instant::now();

        assert!(sealed(batch.offer(msg(0, Priority::Normal), now)).is_none());
        assert!(sealed(batch.offer(msg(1, Priority::Normal), now)).is_none());
        let frame = sealed(batch.offer(msg(2, Priority::Normal), now)).unwrap();

        assert_eq!(frame.len(), 2);
        assert!(frame.payload_bytes() <= 20);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_oversize_message_travels_alone() {
        let mut batch = builder(10, 5, 1000);
        let now = Instant::now();

        assert!(sealed(batch.offer(msg(0, Priority::Normal), now)).is_none());
        let frame = sealed(batch.offer(msg(1, Priority::Normal), now)).unwrap();
        assert_eq!(frame.len(), 1);
        assert!(!frame.is_batch());
    }

    #[test]
    fn test_stale_flush() {
        let mut batch = builder(10, 65_536, 16);
        let t0 = Instant::now();

        batch.offer(msg(0, Priority::Low), t0);
        batch.offer(msg(1, Priority::Low), t0 + Duration::from_millis(10));

        assert!(batch.flush_if_stale(t0 + Duration::from_millis(15)).is_none());
        let frame = batch.flush_if_stale(t0 + Duration::from_millis(16)).unwrap();
        assert_eq!(frame.len(), 2);
        assert!(batch.flush_if_stale(t0 + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_critical_bypass_keeps_batch() {
        let mut batch = builder(10, 65_536, 1000);
        let now = Instant::now();

        batch.offer(msg(0, Priority::Low), now);
        batch.offer(msg(1, Priority::Low), now);
        let frame = sealed(batch.offer(msg(2, Priority::Critical), now)).unwrap();

        assert_eq!(frame.len(), 1);
        assert_eq!(frame.top_priority(), Some(Priority::Critical));
        assert_eq!(batch.len(), 2);

        let wire = WireFrame::parse(frame.text()).unwrap();
        assert!(!wire.is_batch());
    }

    #[test]
    fn test_batching_disabled() {
        let config = PipelineConfig::builder().batching(false).build();
        let mut batch = BatchBuilder::new(&config);
        let now = Instant::now();

        for n in 0..3 {
            let frame = sealed(batch.offer(msg(n, Priority::Normal), now)).unwrap();
            assert_eq!(frame.len(), 1);
        }
    }

    #[test]
    fn test_take_pending_returns_in_order() {
        let mut batch = builder(10, 65_536, 1000);
        let now = Instant::now();
        for n in 0..3 {
            batch.offer(msg(n, Priority::Normal), now);
        }

        let pending = batch.take_pending();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[2].payload().get(), r#"{"n":2}"#);
        assert!(batch.is_empty());
        assert!(batch.flush_if_stale(now + Duration::from_secs(5)).is_none());
    }
}
