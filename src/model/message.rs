use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::OutboundError;

/// Importance of an outbound message. Lower discriminant drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    /// Command responses. Never downsampled, never expired, retried forever.
    Critical = 0,
    /// Registration and status updates. Never downsampled.
    High = 1,
    /// Most traffic. Downsampled under pressure.
    Normal = 2,
    /// Telemetry and frequent pulses. First to go.
    Low = 3,
}

impl Priority {
    /// All levels in drain order.
    pub const ALL: [Priority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::Critical)
    }

    /// Whether the pressure sampler may skip messages of this level.
    #[inline]
    pub const fn is_sampled(self) -> bool {
        matches!(self, Self::Normal | Self::Low)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification used for metrics and to pick a sensible default priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Generic,
    /// Reply to a remote command. Must not be lost.
    CommandResponse,
    /// Target/action registration. Coalesces well.
    Registration,
    /// High-frequency emitter pulse.
    EmitterPulse,
    /// Machine/instance info.
    InstanceInfo,
}

impl MessageKind {
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Generic => 0,
            Self::CommandResponse => 1,
            Self::Registration => 2,
            Self::EmitterPulse => 3,
            Self::InstanceInfo => 4,
        }
    }

    pub const fn default_priority(&self) -> Priority {
        match self {
            Self::CommandResponse => Priority::Critical,
            Self::Registration | Self::InstanceInfo => Priority::High,
            Self::Generic => Priority::Normal,
            Self::EmitterPulse => Priority::Low,
        }
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        Self::Generic
    }
}

/// A queued outbound envelope.
///
/// The payload is validated JSON and never changes after construction, so
/// clones share it.
#[derive(Debug, Clone)]
pub struct Message {
    key: String,
    priority: Priority,
    kind: MessageKind,
    payload: Arc<RawValue>,
    size_bytes: usize,
    enqueued_at: Instant,
    retry_count: u32,
}

impl Message {
    /// Build a message from an already serialized JSON envelope.
    pub fn from_json(
        payload: impl Into<String>,
        priority: Priority,
        key: impl Into<String>,
    ) -> Result<Self, OutboundError> {
        let raw = RawValue::from_string(payload.into())?;
        Ok(Self::from_raw(raw, priority, key.into()))
    }

    /// Serialize `value` into a message envelope.
    pub fn from_value<T: Serialize + ?Sized>(
        value: &T,
        priority: Priority,
        key: impl Into<String>,
    ) -> Result<Self, OutboundError> {
        let raw = serde_json::value::to_raw_value(value)?;
        Ok(Self::from_raw(raw, priority, key.into()))
    }

    fn from_raw(raw: Box<RawValue>, priority: Priority, key: String) -> Self {
        let size_bytes = raw.get().len();
        Self {
            key,
            priority,
            kind: MessageKind::Generic,
            payload: Arc::from(raw),
            size_bytes,
            enqueued_at: Instant::now(),
            retry_count: 0,
        }
    }

    /// Tag the message with a kind.
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Override the enqueue timestamp (replaying captured traffic, tests).
    pub fn enqueued_at_time(mut self, at: Instant) -> Self {
        self.enqueued_at = at;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the message participates in coalescing at all.
    #[inline]
    pub fn is_coalescable(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &RawValue {
        &self.payload
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Time spent waiting since enqueue.
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    pub(crate) fn record_retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::ALL.map(Priority::index), [0, 1, 2, 3]);
    }

    #[test]
    fn test_sampled_levels() {
        assert!(!Priority::Critical.is_sampled());
        assert!(!Priority::High.is_sampled());
        assert!(Priority::Normal.is_sampled());
        assert!(Priority::Low.is_sampled());
    }

    #[test]
    fn test_size_computed_from_payload() {
        let msg = Message::from_json(r#"{"id":"emitter-1","v":42}"#, Priority::Low, "emitter-1")
            .unwrap();
        assert_eq!(msg.size_bytes(), r#"{"id":"emitter-1","v":42}"#.len());
        assert_eq!(msg.retry_count(), 0);
        assert!(msg.is_coalescable());
    }

    #[test]
    fn test_invalid_json_rejected() {
        let err = Message::from_json("{not json", Priority::Normal, "").unwrap_err();
        assert!(matches!(err, OutboundError::ParseError(_)));
    }

    #[test]
    fn test_from_value() {
        let msg = Message::from_value(&serde_json::json!({"a": 1}), Priority::High, "").unwrap();
        assert_eq!(msg.payload().get(), r#"{"a":1}"#);
        assert!(!msg.is_coalescable());
    }

    #[test]
    fn test_kind_default_priority() {
        assert_eq!(MessageKind::CommandResponse.default_priority(), Priority::Critical);
        assert_eq!(MessageKind::EmitterPulse.default_priority(), Priority::Low);
        assert_eq!(MessageKind::Registration.default_priority(), Priority::High);
    }
}
