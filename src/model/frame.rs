//! Outbound frames and their wire representation.
//!
//! A frame carrying one message goes out unwrapped as a plain event so that
//! receivers without batch support keep working. Two or more messages are
//! wrapped in a single batch event.

use serde::{Deserialize, Serialize};

use super::message::{Message, Priority};

/// Event name of a single-message frame.
pub const EVENT_NAME: &str = "ws:m:event";

/// Event name of a multi-message frame.
pub const BATCH_EVENT_NAME: &str = "ws:m:event-batch";

/// A sealed, encoded frame ready for the transport.
///
/// The messages are kept alongside the encoded text so a failed send can be
/// split back into individual messages and requeued.
#[derive(Debug, Clone)]
pub struct Frame {
    messages: Vec<Message>,
    text: String,
}

impl Frame {
    /// Seal `messages` into a frame. An empty list yields an empty batch.
    pub fn seal(messages: Vec<Message>) -> Self {
        let text = encode(&messages);
        Self { messages, text }
    }

    /// Seal a single message (critical bypass path).
    pub fn single(message: Message) -> Self {
        Self::seal(vec![message])
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_batch(&self) -> bool {
        self.messages.len() > 1
    }

    /// Encoded JSON text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Bytes on the wire.
    pub fn total_bytes(&self) -> usize {
        self.text.len()
    }

    /// Sum of the member payload sizes.
    pub fn payload_bytes(&self) -> usize {
        self.messages.iter().map(Message::size_bytes).sum()
    }

    /// Highest priority among the members.
    pub fn top_priority(&self) -> Option<Priority> {
        self.messages.iter().map(Message::priority).min()
    }

    /// Whether every message in the frame is Critical.
    pub fn is_critical_only(&self) -> bool {
        !self.messages.is_empty() && self.messages.iter().all(|m| m.priority().is_critical())
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

fn encode(messages: &[Message]) -> String {
    let payload_len: usize = messages.iter().map(Message::size_bytes).sum();
    let mut out = String::with_capacity(payload_len + messages.len() + 48);

    if let [only] = messages {
        out.push_str(r#"{"event":""#);
        out.push_str(EVENT_NAME);
        out.push_str(r#"","data":"#);
        out.push_str(only.payload().get());
        out.push('}');
        return out;
    }

    out.push_str(r#"{"event":""#);
    out.push_str(BATCH_EVENT_NAME);
    out.push_str(r#"","data":["#);
    for (i, msg) in messages.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(msg.payload().get());
    }
    out.push_str("]}");
    out
}

/// Decoded form of a frame, for receivers and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub event: String,
    pub data: serde_json::Value,
}

impl WireFrame {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_batch(&self) -> bool {
        self.event == BATCH_EVENT_NAME
    }

    /// The envelopes carried by this frame, in send order.
    pub fn envelopes(&self) -> Vec<&serde_json::Value> {
        match (&self.data, self.is_batch()) {
            (serde_json::Value::Array(items), true) => items.iter().collect(),
            (value, _) => vec![value],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(json: &str) -> Message {
        Message::from_json(json, Priority::Normal, "").unwrap()
    }

    #[test]
    fn test_single_message_unwrapped() {
        let frame = Frame::single(msg(r#"{"id":1}"#));
        assert!(!frame.is_batch());
        assert_eq!(frame.text(), r#"{"event":"ws:m:event","data":{"id":1}}"#);

        let wire = WireFrame::parse(frame.text()).unwrap();
        assert_eq!(wire.event, EVENT_NAME);
        assert_eq!(wire.envelopes().len(), 1);
    }

    #[test]
    fn test_batch_wrapped() {
        let frame = Frame::seal(vec![msg(r#"{"id":1}"#), msg(r#"{"id":2}"#), msg("[3]")]);
        assert!(frame.is_batch());
        assert_eq!(frame.len(), 3);

        let wire = WireFrame::parse(frame.text()).unwrap();
        assert!(wire.is_batch());
        let envelopes = wire.envelopes();
        assert_eq!(envelopes.len(), 3);
        assert_eq!(envelopes[1]["id"], 2);
        assert_eq!(frame.total_bytes(), frame.text().len());
    }

    #[test]
    fn test_payload_bytes_and_priority() {
        let frame = Frame::seal(vec![
            Message::from_json(r#"{"a":1}"#, Priority::Low, "").unwrap(),
            Message::from_json(r#"{"b":2}"#, Priority::High, "").unwrap(),
        ]);
        assert_eq!(frame.payload_bytes(), 14);
        assert_eq!(frame.top_priority(), Some(Priority::High));
        assert!(!frame.is_critical_only());
    }

    #[test]
    fn test_critical_only() {
        let critical = || Message::from_json("{}", Priority::Critical, "").unwrap();
        assert!(Frame::single(critical()).is_critical_only());
        assert!(Frame::seal(vec![critical(), critical()]).is_critical_only());
        assert!(!Frame::seal(vec![critical(), msg("{}")]).is_critical_only());
        assert!(!Frame::seal(Vec::new()).is_critical_only());
    }
}
