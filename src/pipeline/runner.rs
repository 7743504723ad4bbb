//! Tokio task that drives a [`Pipeline`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::metrics::PipelineMetrics;
use crate::network::{Transport, TransportEvent};

use super::{Pipeline, PipelineState};

/// Owns the pipeline and feeds it ticks and transport events until shutdown.
pub struct PipelineRunner<T: Transport> {
    pipeline: Pipeline<T>,
    transport_events: mpsc::Receiver<TransportEvent>,
    shutdown: watch::Receiver<bool>,
    metrics: watch::Sender<PipelineMetrics>,
    /// Mirrors the pipeline state for lock-free reads (see `PipelineState::as_u8`)
    state: Arc<AtomicU8>,
    reset: Arc<Notify>,
    tick_interval: Duration,
    metrics_interval: Option<Duration>,
}

impl<T: Transport> PipelineRunner<T> {
    pub fn new(
        config: &PipelineConfig,
        pipeline: Pipeline<T>,
        transport_events: mpsc::Receiver<TransportEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (metrics, _) = watch::channel(PipelineMetrics::default());
        Self {
            pipeline,
            transport_events,
            shutdown,
            metrics,
            state: Arc::new(AtomicU8::new(PipelineState::Disconnected.as_u8())),
            reset: Arc::new(Notify::new()),
            tick_interval: config.queue_process_interval(),
            metrics_interval: config.metrics_interval(),
        }
    }

    /// Receiver of the snapshot refreshed every tick.
    pub fn metrics(&self) -> watch::Receiver<PipelineMetrics> {
        self.metrics.subscribe()
    }

    /// Shared state cell, updated after every tick and event.
    pub fn state_handle(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.state)
    }

    /// Notify this to zero the pipeline counters on the next loop turn.
    pub fn reset_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.reset)
    }

    /// Run until shutdown is signalled (or its sender dropped). Returns how
    /// many messages were dropped as unsent.
    pub async fn run(mut self) -> usize {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let started = now();
        let mut last_summary = started;
        self.pipeline.start(started);
        self.publish_state();
        info!("Pipeline running, tick every {:?}", self.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = now();
                    self.pipeline.tick(now);

                    let summary_due = self
                        .metrics_interval
                        .map_or(false, |every| now.saturating_duration_since(last_summary) >= every);
                    let snapshot = if summary_due {
                        last_summary = now;
                        let snapshot = self.pipeline.publish_metrics(now);
                        info!("{}", snapshot);
                        snapshot
                    } else {
                        self.pipeline.metrics(now)
                    };
                    self.metrics.send_replace(snapshot);
                }
                event = self.transport_events.recv() => {
                    match event {
                        Some(event) => self.pipeline.handle_event(event, now()),
                        None => {
                            warn!("Transport event channel closed, stopping pipeline");
                            break;
                        }
                    }
                }
                _ = self.reset.notified() => {
                    self.pipeline.reset_stats();
                    self.metrics.send_replace(self.pipeline.metrics(now()));
                }
                _ = self.shutdown.changed() => {
                    debug!("Shutdown signalled");
                    break;
                }
            }
            self.publish_state();
        }

        let dropped = self.pipeline.shutdown();
        self.publish_state();
        self.metrics.send_replace(self.pipeline.metrics(now()));
        dropped
    }

    fn publish_state(&self) {
        self.state.store(self.pipeline.state().as_u8(), Ordering::Relaxed);
    }
}

/// Wall time as seen by tokio, so paused-clock tests advance it too.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OutboundError;
    use crate::model::{Frame, Message, Priority};
    use crate::network::TrySendError;
    use crate::queue::SharedQueue;

    struct ChannelSink {
        frames: mpsc::UnboundedSender<Frame>,
    }

    impl Transport for ChannelSink {
        fn try_send(&mut self, frame: Frame) -> Result<(), TrySendError> {
            self.frames.send(frame).map_err(|e| TrySendError::Closed(e.0))
        }

        fn connect(&mut self) -> Result<(), OutboundError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_sends_after_connect_and_drains_on_shutdown() {
        let config = PipelineConfig::builder()
            .batch_limits(10, 65_536, 0)
            .metrics_interval_secs(0.0)
            .build();
        let queue = Arc::new(SharedQueue::new(&config));
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new(&config, Arc::clone(&queue), ChannelSink { frames: frame_tx }, now());

        let (event_tx, event_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = PipelineRunner::new(&config, pipeline, event_rx, shutdown_rx);
        let state = runner.state_handle();
        let metrics = runner.metrics();
        let reset = runner.reset_handle();
        let handle = tokio::spawn(runner.run());

        for n in 0..3 {
            let msg = Message::from_json(format!(r#"{{"n":{}}}"#, n), Priority::Normal, "").unwrap();
            queue.enqueue(msg);
        }
        event_tx.send(TransportEvent::Connected).await.unwrap();

        let frame = frame_rx.recv().await.unwrap();
        assert_eq!(frame.len(), 3);
        assert_eq!(PipelineState::from_u8(state.load(Ordering::Relaxed)), PipelineState::Connected);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.borrow().messages_sent_total, 3);

        reset.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(metrics.borrow().messages_sent_total, 0);
        assert_eq!(metrics.borrow().frames_sent_total, 0);

        event_tx.send(TransportEvent::Closed(None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Backing off now, so this one never leaves.
        queue.enqueue(Message::from_json("{}", Priority::Low, "").unwrap());

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 1);
        assert_eq!(PipelineState::from_u8(state.load(Ordering::Relaxed)), PipelineState::ShutDown);
    }
}
