//! Drain-loop orchestration.
//!
//! A [`Pipeline`] is driven by two inputs: periodic `tick(now)` calls and
//! [`TransportEvent`]s. It owns every piece of send-side state except the
//! queue, which producers share.
//!
//! Per tick, while connected:
//! 1. Retry the held frame (throttled or refused by the transport last time)
//! 2. Pull candidates from the queue and feed the batch builder
//! 3. Gate each sealed frame through the token buckets and hand it to the
//!    transport
//! 4. Seal a stale open frame
//!
//! The first throttled frame ends the tick; it is held and retried on the
//! next one. Critical messages queued meanwhile go out ahead of a held
//! non-Critical frame.
//!
//! A frame accepted by the transport is not a success: write failures come
//! back later as [`TransportEvent::SendFailed`]. The failure streak resets on
//! reconnect, or after the link has stayed up for as long as the last wait.

pub mod runner;
pub mod state;

pub use runner::PipelineRunner;
pub use state::PipelineState;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::batch::{BatchBuilder, Offer};
use crate::config::PipelineConfig;
use crate::error::DropReason;
use crate::governor::{AdaptiveController, BackoffController, BackoffDecision, RateGate};
use crate::metrics::{DropWindow, PipelineMetrics, Throughput, ThroughputWindow};
use crate::model::{Frame, Message};
use crate::network::{Transport, TransportEvent, TrySendError};
use crate::queue::{QueuePressure, SharedQueue};

/// Notifications for the embedding application.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    BackoffStarted {
        attempt: u32,
        wait: Duration,
    },
    BackoffEnded,
    GaveUp {
        attempts: u32,
    },
    Metrics(PipelineMetrics),
    /// Text received from the server.
    Inbound(String),
    ShutdownDrained {
        dropped: usize,
    },
}

/// A sealed frame that could not go out yet.
#[derive(Debug)]
struct HeldFrame {
    frame: Frame,
    /// Tokens were already charged (the transport refused it, not the gate).
    paid: bool,
}

/// Single-writer send pipeline over a [`Transport`].
pub struct Pipeline<T: Transport> {
    queue: Arc<SharedQueue>,
    transport: T,
    gate: RateGate,
    adaptive: AdaptiveController,
    backoff: BackoffController,
    batch: BatchBuilder,
    held: Option<HeldFrame>,

    state: PipelineState,
    /// Transport reported the link as up and has not reported it down since
    link_up: bool,
    pressure: QueuePressure,

    /// Resumed sending after a backoff without reconnecting
    stable_since: Option<Instant>,

    events: Option<mpsc::Sender<PipelineEvent>>,
    throughput: ThroughputWindow,
    drops: DropWindow,
    totals: Throughput,
    /// Messages that went out in multi-message frames
    batched_messages: u64,
    backoffs_total: u64,

    pressure_threshold: f64,
    max_retry_count: u32,
    critical_bypass_rate_limit: bool,
    critical_bypass_backoff: bool,
}

impl<T: Transport> Pipeline<T> {
    pub fn new(config: &PipelineConfig, queue: Arc<SharedQueue>, transport: T, now: Instant) -> Self {
        Self {
            queue,
            transport,
            gate: RateGate::from_config(config, now),
            adaptive: AdaptiveController::new(config, now),
            backoff: BackoffController::new(config),
            batch: BatchBuilder::new(config),
            held: None,
            state: PipelineState::Disconnected,
            link_up: false,
            pressure: QueuePressure::Nominal,
            stable_since: None,
            events: None,
            throughput: ThroughputWindow::default(),
            drops: DropWindow::default(),
            totals: Throughput::default(),
            batched_messages: 0,
            backoffs_total: 0,
            pressure_threshold: config.queue_pressure_threshold,
            max_retry_count: config.max_retry_count,
            critical_bypass_rate_limit: config.critical_bypass_rate_limit,
            critical_bypass_backoff: config.critical_bypass_backoff,
        }
    }

    /// Deliver [`PipelineEvent`]s on `sender`. Events are dropped when the
    /// receiver falls behind.
    pub fn with_events(mut self, sender: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn queue(&self) -> &Arc<SharedQueue> {
        &self.queue
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    /// Whether a sealed frame is waiting for tokens or transport room.
    pub fn has_held_frame(&self) -> bool {
        self.held.is_some()
    }

    /// Messages sitting in the open batch.
    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Begin connecting.
    pub fn start(&mut self, now: Instant) {
        if self.state != PipelineState::Disconnected {
            return;
        }
        self.connect(now);
    }

    fn connect(&mut self, now: Instant) {
        self.set_state(PipelineState::Connecting);
        if let Err(e) = self.transport.connect() {
            warn!("Failed to request connection: {}", e);
            self.on_link_down(now);
        }
    }

    /// Apply a transport notification.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        if self.state == PipelineState::ShutDown {
            if let TransportEvent::SendFailed(frame) = event {
                self.drop_messages(frame.into_messages(), DropReason::Shutdown);
            }
            return;
        }

        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::ConnectFailed(reason) => {
                warn!("Connection attempt failed: {}", reason);
                self.on_link_down(now);
            }
            TransportEvent::Closed(reason) => {
                match reason {
                    Some(reason) => warn!("Connection closed: {}", reason),
                    None => warn!("Connection closed"),
                }
                self.on_link_down(now);
            }
            TransportEvent::SendFailed(frame) => self.on_send_failed(frame, now),
            TransportEvent::RateLimited { retry_after } => self.on_rate_limited(retry_after, now),
            TransportEvent::Inbound(text) => self.emit(PipelineEvent::Inbound(text)),
        }
    }

    fn on_connected(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.link_up = true;
        self.stable_since = None;
        self.backoff.record_success();
        if self.state == PipelineState::Backoff {
            self.emit(PipelineEvent::BackoffEnded);
        }
        self.set_state(PipelineState::Connected);
    }

    fn on_link_down(&mut self, now: Instant) {
        self.link_up = false;
        match self.state {
            PipelineState::Connected | PipelineState::Connecting => self.enter_backoff(now),
            // Already waiting; the expiry reconnects since the link is down.
            _ => {}
        }
    }

    /// Requeue the frame's messages with one more retry each, dropping those
    /// out of retries. Critical messages are retried indefinitely.
    fn on_send_failed(&mut self, frame: Frame, now: Instant) {
        debug!("Send failed for frame of {} messages", frame.len());
        if self.state == PipelineState::Connected {
            self.enter_backoff(now);
        }
        self.adaptive.observe_backpressure();

        let mut retry = Vec::with_capacity(frame.len());
        let mut exhausted = Vec::new();
        for mut message in frame.into_messages() {
            let out_of_retries = self.max_retry_count > 0
                && message.retry_count() >= self.max_retry_count
                && !message.priority().is_critical();
            if out_of_retries {
                exhausted.push(message);
            } else {
                message.record_retry();
                retry.push(message);
            }
        }

        if !exhausted.is_empty() {
            warn!("Dropping {} messages after {} failed sends", exhausted.len(), self.max_retry_count + 1);
            self.drop_messages(exhausted, DropReason::RetryExhausted);
        }
        self.queue.lock().requeue_front(retry);
    }

    fn on_rate_limited(&mut self, retry_after: Option<Duration>, now: Instant) {
        if !matches!(self.state, PipelineState::Connected | PipelineState::Backoff) {
            return;
        }
        self.adaptive.observe_backpressure();
        self.reclaim();
        let wait = self.backoff.on_rate_limited(retry_after, now);
        self.stable_since = None;
        self.backoffs_total += 1;
        warn!("Server rate limit, pausing sends for {:.2}s", wait.as_secs_f64());
        self.set_state(PipelineState::Backoff);
        self.emit(PipelineEvent::BackoffStarted {
            attempt: self.backoff.consecutive_failures(),
            wait,
        });
    }

    fn enter_backoff(&mut self, now: Instant) {
        self.adaptive.observe_backpressure();
        self.reclaim();
        self.stable_since = None;

        match self.backoff.on_failure(now) {
            BackoffDecision::Wait(wait) => {
                let attempt = self.backoff.consecutive_failures();
                self.backoffs_total += 1;
                warn!("Backing off for {:.2}s (attempt {})", wait.as_secs_f64(), attempt);
                self.set_state(PipelineState::Backoff);
                self.emit(PipelineEvent::BackoffStarted { attempt, wait });
            }
            BackoffDecision::GiveUp => {
                let attempts = self.backoff.consecutive_failures().saturating_sub(1);
                error!(
                    "Giving up after {} reconnect attempts, {} messages still queued",
                    attempts,
                    self.queue.len()
                );
                self.transport.close();
                self.set_state(PipelineState::GaveUp);
                self.emit(PipelineEvent::GaveUp { attempts });
            }
        }
    }

    fn end_backoff(&mut self, now: Instant) {
        self.backoff.clear_wait();
        self.emit(PipelineEvent::BackoffEnded);
        if self.link_up {
            info!("Backoff over, resuming sends");
            self.stable_since = Some(now);
            self.set_state(PipelineState::Connected);
        } else {
            info!("Backoff over, reconnecting");
            self.connect(now);
        }
    }

    /// Return the held frame and the open batch to the queue fronts without
    /// touching their retry counts.
    fn reclaim(&mut self) {
        let mut returned = Vec::new();
        if let Some(held) = self.held.take() {
            returned.extend(held.frame.into_messages());
        }
        returned.extend(self.batch.take_pending());
        if !returned.is_empty() {
            debug!("Returning {} unsent messages to the queue", returned.len());
            self.queue.lock().requeue_front(returned);
        }
    }

    /// Advance one drain-loop period.
    pub fn tick(&mut self, now: Instant) {
        if self.state.is_terminal() {
            return;
        }

        self.update_rate(now);
        self.update_pressure(now);

        if self.state == PipelineState::Backoff {
            if self.backoff.is_expired(now) {
                self.end_backoff(now);
            } else if self.critical_bypass_backoff && self.link_up {
                self.send_critical_only(now);
            }
        }

        if self.state.is_sending() {
            self.check_stable(now);
            self.drain(now);
        }
    }

    /// Forget the failure streak once sending has gone on without a failure
    /// for as long as the last wait.
    fn check_stable(&mut self, now: Instant) {
        let Some(since) = self.stable_since else {
            return;
        };
        if now.saturating_duration_since(since) >= self.backoff.current() {
            debug!("Link stable for {:.2}s, resetting backoff", self.backoff.current().as_secs_f64());
            self.backoff.record_success();
            self.stable_since = None;
        }
    }

    fn update_rate(&mut self, now: Instant) {
        if self.state == PipelineState::Backoff {
            self.adaptive.observe_backpressure();
        }
        if let Some(fraction) = self.adaptive.maybe_adjust(now) {
            self.gate.set_rate_fraction(fraction, now);
        }
    }

    fn update_pressure(&mut self, now: Instant) {
        let (len, capacity, dropped) = {
            let queue = self.queue.lock();
            (queue.len(), queue.capacity(), queue.stats().drops.total())
        };
        self.drops.observe(now, dropped);
        let pressure = QueuePressure::from_capacity(len, capacity, self.pressure_threshold);
        if pressure.requires_sampling() {
            self.adaptive.observe_backpressure();
        }
        if pressure != self.pressure {
            self.log_pressure_transition(pressure, len, capacity);
            self.pressure = pressure;
        }
    }

    fn log_pressure_transition(&self, new: QueuePressure, len: usize, capacity: usize) {
        match new {
            QueuePressure::Nominal => {
                info!("Queue pressure {} -> {} ({}/{})", self.pressure, new, len, capacity);
            }
            QueuePressure::Elevated => {
                warn!(
                    "Queue pressure {} -> {} ({}/{}), downsampling Normal/Low",
                    self.pressure, new, len, capacity
                );
            }
            QueuePressure::Saturated => {
                warn!(
                    "Queue pressure {} -> {} ({}/{}), evicting oldest low-priority messages",
                    self.pressure, new, len, capacity
                );
            }
        }
    }

    fn drain(&mut self, now: Instant) {
        if !self.retry_held(now) {
            return;
        }

        loop {
            let candidate = self.queue.lock().drain_candidate(now);
            let Some(message) = candidate else {
                break;
            };

            if let Offer::Sealed(frame) = self.batch.offer(message, now) {
                if !self.dispatch(frame, false, now) {
                    return;
                }
            }
        }

        if let Some(frame) = self.batch.flush_if_stale(now) {
            self.dispatch(frame, false, now);
        }
    }

    /// While backing off with the link up, Critical messages still go out
    /// one per frame. Everything else waits.
    fn send_critical_only(&mut self, now: Instant) {
        if self.held.as_ref().is_some_and(|held| !held.frame.is_critical_only()) {
            self.reclaim();
        }
        if self.retry_held(now) {
            self.send_critical(now);
        }
    }

    /// Retry the held frame. Returns false when the tick should stop.
    ///
    /// A held non-Critical frame first lets queued Critical messages through.
    /// If one of those cannot go out, the bulk frame goes back to the queue
    /// and the Critical frame takes its place.
    fn retry_held(&mut self, now: Instant) -> bool {
        let Some(held) = self.held.take() else {
            return true;
        };
        if !held.frame.is_critical_only() && !self.send_critical(now) {
            debug!("Critical frame displaced a held frame of {} messages", held.frame.len());
            self.queue.lock().requeue_front(held.frame.into_messages());
            return false;
        }
        self.dispatch(held.frame, held.paid, now)
    }

    /// Send queued Critical messages one per frame. Returns false when one
    /// could not go out.
    fn send_critical(&mut self, now: Instant) -> bool {
        loop {
            let candidate = self.queue.lock().drain_critical();
            let Some(message) = candidate else {
                return true;
            };
            trace!("Sending Critical message on its own (key: {})", message.key());
            if !self.dispatch(Frame::single(message), false, now) {
                return false;
            }
        }
    }

    /// Gate and send one frame. Returns false when the tick should stop.
    fn dispatch(&mut self, frame: Frame, paid: bool, now: Instant) -> bool {
        if !paid && !self.admit(&frame, now) {
            trace!("Throttled frame of {} messages ({} bytes)", frame.len(), frame.total_bytes());
            self.adaptive.observe_backpressure();
            self.held = Some(HeldFrame { frame, paid: false });
            return false;
        }

        let messages = frame.len();
        let bytes = frame.total_bytes();
        match self.transport.try_send(frame) {
            Ok(()) => {
                self.record_sent(now, messages, bytes);
                true
            }
            Err(TrySendError::Full(frame)) => {
                trace!("Outbound channel full, holding frame");
                self.adaptive.observe_backpressure();
                self.held = Some(HeldFrame { frame, paid: true });
                false
            }
            Err(TrySendError::Closed(frame)) => {
                warn!("Transport closed while sending");
                self.link_up = false;
                self.on_send_failed(frame, now);
                false
            }
        }
    }

    fn admit(&mut self, frame: &Frame, now: Instant) -> bool {
        if frame.is_critical_only() && self.critical_bypass_rate_limit {
            return true;
        }
        self.gate.try_consume(1, frame.total_bytes(), now)
    }

    fn record_sent(&mut self, now: Instant, messages: usize, bytes: usize) {
        self.throughput.record(now, messages, bytes);
        self.totals.frames += 1;
        self.totals.messages += messages as u64;
        self.totals.bytes += bytes as u64;
        if messages > 1 {
            self.batched_messages += messages as u64;
        }
    }

    fn drop_messages(&self, messages: Vec<Message>, reason: DropReason) {
        let mut queue = self.queue.lock();
        let stats = queue.stats_mut();
        for message in &messages {
            stats.record_drop(reason, message.priority());
        }
    }

    /// Stop for good. Everything unsent is counted as a shutdown drop.
    /// Returns how many messages were dropped.
    pub fn shutdown(&mut self) -> usize {
        if self.state == PipelineState::ShutDown {
            return 0;
        }

        let mut unsent = Vec::new();
        if let Some(held) = self.held.take() {
            unsent.extend(held.frame.into_messages());
        }
        unsent.extend(self.batch.take_pending());

        let dropped = {
            let mut queue = self.queue.lock();
            for message in &unsent {
                queue.stats_mut().record_drop(DropReason::Shutdown, message.priority());
            }
            unsent.len() + queue.drain_all(DropReason::Shutdown)
        };
        self.queue.close();

        if dropped > 0 {
            warn!("Shutting down with {} unsent messages", dropped);
        } else {
            info!("Shutting down, queue empty");
        }

        self.transport.shutdown();
        self.link_up = false;
        self.set_state(PipelineState::ShutDown);
        self.emit(PipelineEvent::ShutdownDrained { dropped });
        dropped
    }

    /// Zero every counter: totals, windows, drop and coalesce counts, and
    /// the sampling pattern. Live gauges such as queue length, tokens, rate
    /// and backoff state are not counters and stay as they are.
    pub fn reset_stats(&mut self) {
        self.queue.lock().reset_stats();
        self.throughput = ThroughputWindow::default();
        self.drops = DropWindow::default();
        self.totals = Throughput::default();
        self.batched_messages = 0;
        self.backoffs_total = 0;
        info!("Pipeline statistics reset");
    }

    /// Current counters and gauges.
    pub fn metrics(&mut self, now: Instant) -> PipelineMetrics {
        let snapshot = self.queue.snapshot();
        self.drops.observe(now, snapshot.stats.drops.total());
        let window = self.throughput.totals(now);
        let (average_batch_size, average_batch_bytes) = if self.totals.frames > 0 {
            let frames = self.totals.frames as f64;
            (self.totals.messages as f64 / frames, self.totals.bytes as f64 / frames)
        } else {
            (0.0, 0.0)
        };
        let batching_efficiency = if self.totals.messages > 0 {
            self.batched_messages as f64 / self.totals.messages as f64
        } else {
            0.0
        };

        PipelineMetrics {
            state: self.state,
            messages_sent_last_second: window.messages,
            bytes_sent_last_second: window.bytes,
            frames_sent_last_second: window.frames,
            messages_sent_total: self.totals.messages,
            frames_sent_total: self.totals.frames,
            bytes_sent_total: self.totals.bytes,
            queue_length: snapshot.len_by_priority,
            queue_bytes: snapshot.queued_bytes,
            queue_pressure: snapshot.pressure,
            drops: snapshot.stats.drops,
            messages_dropped_last_second: self.drops.count(now),
            drops_by_priority: snapshot.stats.drops_by_priority,
            coalesced_total: snapshot.stats.messages_coalesced,
            enqueued_by_kind: snapshot.stats.enqueued_by_kind,
            current_rate: self.adaptive.current_rate(),
            current_byte_rate: self.gate.byte_rate(),
            available_message_tokens: self.gate.available_messages(now),
            available_byte_tokens: self.gate.available_bytes(now),
            backing_off: self.state == PipelineState::Backoff,
            current_backoff: self.backoff.current(),
            backoff_remaining: self.backoff.remaining(now),
            consecutive_failures: self.backoff.consecutive_failures(),
            backoff_count: self.backoffs_total,
            average_batch_size,
            average_batch_bytes,
            batching_efficiency,
        }
    }

    /// Publish a metrics event and return the snapshot.
    pub fn publish_metrics(&mut self, now: Instant) -> PipelineMetrics {
        let metrics = self.metrics(now);
        self.emit(PipelineEvent::Metrics(metrics.clone()));
        metrics
    }

    fn set_state(&mut self, to: PipelineState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("Pipeline {} -> {}", from, to);
        self.state = to;
        self.emit(PipelineEvent::StateChanged { from, to });
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            if events.try_send(event).is_err() {
                trace!("Event receiver lagging or gone, event dropped");
            }
        }
    }
}
