use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::OutboundError;
use crate::metrics::PipelineMetrics;
use crate::model::{Message, MessageKind, Priority};
use crate::network::{ChannelTransport, ConnectionManager};
use crate::pipeline::{Pipeline, PipelineEvent, PipelineRunner, PipelineState};
use crate::queue::{EnqueueOutcome, SharedQueue};

/// Cheap, cloneable handle for pushing messages from any thread.
#[derive(Clone)]
pub struct Producer {
    queue: Arc<SharedQueue>,
}

impl Producer {
    pub fn new(queue: Arc<SharedQueue>) -> Self {
        Self { queue }
    }

    /// Queue an already serialized JSON envelope.
    ///
    /// # Arguments
    /// * `payload` - JSON text, validated here
    /// * `priority` - Drain and drop ordering
    /// * `key` - Coalescing key; empty never coalesces
    pub fn enqueue(
        &self,
        payload: impl Into<String>,
        priority: Priority,
        key: impl Into<String>,
    ) -> Result<EnqueueOutcome, OutboundError> {
        let message = Message::from_json(payload, priority, key)?;
        Ok(self.enqueue_message(message))
    }

    /// Serialize and queue a value, picking the priority from its kind.
    pub fn enqueue_value<T: Serialize + ?Sized>(
        &self,
        value: &T,
        kind: MessageKind,
        key: impl Into<String>,
    ) -> Result<EnqueueOutcome, OutboundError> {
        let message = Message::from_value(value, kind.default_priority(), key)?.with_kind(kind);
        Ok(self.enqueue_message(message))
    }

    pub fn enqueue_message(&self, message: Message) -> EnqueueOutcome {
        self.queue.enqueue(message)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Adaptive outbound WebSocket client.
///
/// Spawns two tasks: the socket owner and the drain loop. Messages go in
/// through [`Producer`]s; state, metrics and events come back out.
pub struct OutboundClient {
    producer: Producer,

    // We wrap it in Option so callers can take ownership of the stream
    events: Option<mpsc::Receiver<PipelineEvent>>,

    metrics: watch::Receiver<PipelineMetrics>,
    state: Arc<AtomicU8>,
    reset: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    runner: Option<JoinHandle<usize>>,
}

impl OutboundClient {
    /// Validate `config`, spawn the socket and drain tasks and start
    /// connecting to `url`.
    pub async fn connect(url: &str, config: PipelineConfig) -> Result<Self, OutboundError> {
        config.validate()?;

        let (frame_tx, frame_rx) = mpsc::channel(config.outbound_channel_capacity);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_event_tx, transport_event_rx) = mpsc::channel(config.event_channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = ConnectionManager::new(url, transport_event_tx, frame_rx, command_rx)
            .map_err(|e| OutboundError::ConnectionError(e.to_string()))?;
        tokio::spawn(manager.run());

        let queue = Arc::new(SharedQueue::new(&config));
        let transport = ChannelTransport::new(frame_tx, command_tx);
        let now = tokio::time::Instant::now().into_std();
        let pipeline = Pipeline::new(&config, Arc::clone(&queue), transport, now).with_events(event_tx);

        let runner = PipelineRunner::new(&config, pipeline, transport_event_rx, shutdown_rx);
        let metrics = runner.metrics();
        let state = runner.state_handle();
        let reset = runner.reset_handle();
        let runner = tokio::spawn(runner.run());

        info!("Outbound client started for {}", url);
        Ok(Self {
            producer: Producer::new(queue),
            events: Some(event_rx),
            metrics,
            state,
            reset,
            shutdown: shutdown_tx,
            runner: Some(runner),
        })
    }

    /// A producer handle for other tasks or threads.
    pub fn producer(&self) -> Producer {
        self.producer.clone()
    }

    /// Queue a JSON envelope.
    pub fn enqueue(
        &self,
        payload: impl Into<String>,
        priority: Priority,
        key: impl Into<String>,
    ) -> Result<EnqueueOutcome, OutboundError> {
        self.producer.enqueue(payload, priority, key)
    }

    pub fn enqueue_message(&self, message: Message) -> EnqueueOutcome {
        self.producer.enqueue_message(message)
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::Receiver<PipelineEvent>> {
        self.events.take()
    }

    /// Latest metrics snapshot.
    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics.borrow().clone()
    }

    /// Receiver that wakes whenever a new snapshot is published.
    pub fn watch_metrics(&self) -> watch::Receiver<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Zero the sent, dropped, coalesced and backoff counters. Takes effect
    /// on the drain task's next loop turn.
    pub fn reset_stats(&self) {
        self.reset.notify_one();
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Stop the drain loop and the socket. Returns how many messages were
    /// still unsent.
    pub async fn shutdown(mut self) -> Result<usize, OutboundError> {
        let _ = self.shutdown.send(true);
        let runner = self.runner.take().ok_or(OutboundError::ChannelClosed)?;
        runner.await.map_err(|e| {
            warn!("Pipeline task ended abnormally: {}", e);
            OutboundError::ChannelClosed
        })
    }
}
