//! End-to-end drain loop scenarios against an in-memory transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use forge_outbound::model::WireFrame;
use forge_outbound::{
    DropReason, Frame, Message, OutboundError, Pipeline, PipelineConfig, PipelineEvent,
    PipelineState, Priority, SharedQueue, Transport, TransportEvent, TrySendError,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct MockTransport {
    sent: Vec<Frame>,
    connects: usize,
}

impl Transport for MockTransport {
    fn try_send(&mut self, frame: Frame) -> Result<(), TrySendError> {
        self.sent.push(frame);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), OutboundError> {
        self.connects += 1;
        Ok(())
    }

    fn close(&mut self) {}
}

struct Harness {
    pipeline: Pipeline<MockTransport>,
    events: mpsc::Receiver<PipelineEvent>,
    t0: Instant,
}

impl Harness {
    fn connected(config: PipelineConfig) -> Self {
        let mut harness = Self::new(config);
        harness.pipeline.handle_event(TransportEvent::Connected, harness.t0);
        harness
    }

    fn new(config: PipelineConfig) -> Self {
        let t0 = Instant::now();
        let (tx, events) = mpsc::channel(1024);
        let queue = Arc::new(SharedQueue::new(&config));
        let mut pipeline = Pipeline::new(&config, queue, MockTransport::default(), t0).with_events(tx);
        pipeline.start(t0);
        Self { pipeline, events, t0 }
    }

    fn push(&self, payload: String, priority: Priority, key: &str) {
        let message = Message::from_json(payload, priority, key).unwrap();
        self.pipeline.queue().enqueue(message);
    }

    fn sent(&self) -> &[Frame] {
        &self.pipeline.transport().sent
    }

    fn sent_messages(&self) -> usize {
        self.sent().iter().map(Frame::len).sum()
    }

    fn drain_events(&mut self) -> Vec<PipelineEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

fn unthrottled() -> forge_outbound::PipelineConfigBuilder {
    PipelineConfig::builder()
        .rate_limiting(false, false)
        .jitter_percent(0.0)
}

#[test]
fn seven_messages_three_per_batch() {
    let mut h = Harness::connected(unthrottled().batch_limits(3, 65_536, 0).build());
    for n in 0..7 {
        h.push(format!(r#"{{"n":{}}}"#, n), Priority::Normal, "");
    }

    h.pipeline.tick(h.t0);

    let sizes: Vec<usize> = h.sent().iter().map(Frame::len).collect();
    assert_eq!(sizes, vec![3, 3, 1]);

    let first = WireFrame::parse(h.sent()[0].text()).unwrap();
    assert!(first.is_batch());
    assert_eq!(first.data[2]["n"], 2);

    let last = WireFrame::parse(h.sent()[2].text()).unwrap();
    assert!(!last.is_batch());
    assert_eq!(last.data["n"], 6);
}

#[test]
fn backoff_doubles_and_caps() {
    let config = unthrottled().backoff(1.0, 10.0, 2.0).retry_limits(5, 0).build();
    let mut h = Harness::new(config);
    let mut now = h.t0;

    let mut waits = Vec::new();
    for _ in 0..6 {
        h.pipeline.handle_event(TransportEvent::ConnectFailed("refused".into()), now);
        assert_eq!(h.pipeline.state(), PipelineState::Backoff);
        let wait = h
            .drain_events()
            .into_iter()
            .find_map(|e| match e {
                PipelineEvent::BackoffStarted { wait, .. } => Some(wait),
                _ => None,
            })
            .unwrap();
        waits.push(wait.as_secs_f64());

        now += wait;
        h.pipeline.tick(now);
        assert_eq!(h.pipeline.state(), PipelineState::Connecting);
    }

    assert_eq!(waits, vec![1.0, 2.0, 4.0, 8.0, 10.0, 10.0]);
    assert_eq!(h.pipeline.transport().connects, 7);
}

#[test]
fn critical_goes_first_under_low_flood() {
    let config = PipelineConfig::builder()
        .message_rate(10.0, 1)
        .batch_limits(10, 65_536, 16)
        .build();
    let mut h = Harness::connected(config);
    for n in 0..400 {
        h.push(format!(r#"{{"pulse":{}}}"#, n), Priority::Low, "");
    }
    h.push(r#"{"commandId":"abc"}"#.to_string(), Priority::Critical, "");

    h.pipeline.tick(h.t0);

    assert_eq!(h.sent().len(), 1);
    assert_eq!(h.sent()[0].top_priority(), Some(Priority::Critical));
    assert_eq!(h.sent()[0].len(), 1);
}

#[test]
fn critical_overtakes_held_low_frame() {
    let config = PipelineConfig::builder()
        .message_rate(10.0, 1)
        .batch_limits(10, 65_536, 16)
        .critical_bypass(true, true, false)
        .build();
    let mut h = Harness::connected(config);
    for n in 0..400 {
        h.push(format!(r#"{{"pulse":{}}}"#, n), Priority::Low, "");
    }

    h.pipeline.tick(h.t0);
    assert_eq!(h.sent().len(), 1);
    assert!(h.pipeline.has_held_frame());

    h.push(r#"{"commandId":"late"}"#.to_string(), Priority::Critical, "");
    h.pipeline.tick(h.t0 + Duration::from_millis(16));

    assert_eq!(h.sent().len(), 2);
    assert!(h.sent()[1].is_critical_only());
    let wire = WireFrame::parse(h.sent()[1].text()).unwrap();
    assert_eq!(wire.data["commandId"], "late");
    // Still no tokens for the Low frame.
    assert!(h.pipeline.has_held_frame());
}

#[test]
fn send_failures_double_backoff_while_link_up() {
    let config = unthrottled()
        .backoff(1.0, 10.0, 2.0)
        .retry_limits(0, 0)
        .batch_limits(10, 65_536, 0)
        .message_timeout_secs(0.0)
        .build();
    let mut h = Harness::connected(config);
    h.push(r#"{"status":"ready"}"#.to_string(), Priority::High, "");
    let mut now = h.t0;

    let mut waits = Vec::new();
    for _ in 0..6 {
        h.pipeline.tick(now);
        assert_eq!(h.pipeline.state(), PipelineState::Connected);
        let frame = h.pipeline.transport_mut().sent.pop().unwrap();

        h.pipeline.handle_event(TransportEvent::SendFailed(frame), now);
        assert_eq!(h.pipeline.state(), PipelineState::Backoff);
        let wait = h
            .drain_events()
            .into_iter()
            .find_map(|e| match e {
                PipelineEvent::BackoffStarted { wait, .. } => Some(wait),
                _ => None,
            })
            .unwrap();
        waits.push(wait.as_secs_f64());
        now += wait;
    }

    assert_eq!(waits, vec![1.0, 2.0, 4.0, 8.0, 10.0, 10.0]);
    assert_eq!(h.pipeline.transport().connects, 1);
    assert_eq!(h.pipeline.metrics(now).backoff_count, 6);
}

#[test]
fn coalesced_pulses_send_latest_only() {
    let mut h = Harness::connected(unthrottled().batch_limits(10, 65_536, 0).build());
    for n in 0..100 {
        h.push(format!(r#"{{"v":{}}}"#, n), Priority::Low, "emitter-7");
    }

    h.pipeline.tick(h.t0);

    assert_eq!(h.sent_messages(), 1);
    let wire = WireFrame::parse(h.sent()[0].text()).unwrap();
    assert_eq!(wire.data["v"], 99);
    assert_eq!(h.pipeline.metrics(h.t0).coalesced_total, 99);
}

#[test]
fn overflow_keeps_newest() {
    let config = unthrottled()
        .max_queue_length(10)
        .downsampling(false, 2, 5, 0.7)
        .batch_limits(20, 65_536, 0)
        .build();
    let mut h = Harness::connected(config);
    for n in 0..15 {
        h.push(format!(r#"{{"n":{}}}"#, n), Priority::Low, "");
    }

    h.pipeline.tick(h.t0);

    let wire = WireFrame::parse(h.sent()[0].text()).unwrap();
    let kept: Vec<u64> = wire.data.as_array().unwrap().iter().map(|v| v["n"].as_u64().unwrap()).collect();
    assert_eq!(kept, (5..15).collect::<Vec<_>>());
    assert_eq!(h.pipeline.metrics(h.t0).drops.get(DropReason::QueueFull), 5);
}

#[test]
fn downsampling_stops_once_pressure_relieved() {
    let config = unthrottled()
        .max_queue_length(100)
        .downsampling(true, 2, 5, 0.7)
        .batch_limits(10, 65_536, 0)
        .build();
    let mut h = Harness::connected(config);
    for n in 0..90 {
        h.push(format!(r#"{{"n":{}}}"#, n), Priority::Low, "");
    }

    h.pipeline.tick(h.t0);

    // Candidates drawn at 90..71 queued are sampled 1-in-5; the rest pass.
    let metrics = h.pipeline.metrics(h.t0);
    assert_eq!(h.sent_messages(), 74);
    assert_eq!(metrics.drops.downsampled, 16);
}

#[test]
fn queue_survives_link_loss() {
    let config = unthrottled().batch_limits(5, 65_536, 1000).backoff(1.0, 10.0, 2.0).build();
    let mut h = Harness::connected(config);
    for n in 0..3 {
        h.push(format!(r#"{{"n":{}}}"#, n), Priority::High, "");
    }

    h.pipeline.tick(h.t0);
    assert!(h.sent().is_empty());

    h.pipeline.handle_event(TransportEvent::Closed(None), h.t0);
    assert_eq!(h.pipeline.queue().len(), 3);

    let later = h.t0 + Duration::from_secs(1);
    h.pipeline.tick(later);
    h.pipeline.handle_event(TransportEvent::Connected, later);
    h.pipeline.tick(later + Duration::from_secs(2));
    h.pipeline.tick(later + Duration::from_secs(3));

    assert_eq!(h.sent_messages(), 3);
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::BackoffEnded)));
}

#[test]
fn shutdown_reports_unsent() {
    let mut h = Harness::new(unthrottled().build());
    for n in 0..5 {
        h.push(format!(r#"{{"n":{}}}"#, n), Priority::Normal, "");
    }

    assert_eq!(h.pipeline.shutdown(), 5);
    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::ShutdownDrained { dropped: 5 })));
    assert_eq!(
        h.pipeline.queue().enqueue(Message::from_json("{}", Priority::Critical, "").unwrap()),
        forge_outbound::EnqueueOutcome::Closed
    );
}
