//! The seam between the drain loop and whatever carries frames.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::OutboundError;
use crate::model::Frame;

/// Why a frame could not be handed to the transport. The frame comes back.
#[derive(Debug)]
pub enum TrySendError {
    /// The outbound buffer is full; try again later.
    Full(Frame),
    /// The transport is gone.
    Closed(Frame),
}

/// Something the pipeline learns about the link, delivered asynchronously.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    ConnectFailed(String),
    /// The link dropped. Carries the close reason when there is one.
    Closed(Option<String>),
    /// A frame accepted by `try_send` did not make it onto the wire.
    SendFailed(Frame),
    /// The server asked us to slow down.
    RateLimited { retry_after: Option<Duration> },
    /// Text received from the server.
    Inbound(String),
}

/// Non-blocking frame sink driven by the drain loop.
///
/// Implementations must never block: results of `connect` and any write
/// failures are reported back as [`TransportEvent`]s.
pub trait Transport: Send {
    /// Queue a frame for writing.
    fn try_send(&mut self, frame: Frame) -> Result<(), TrySendError>;

    /// Start (re)connecting.
    fn connect(&mut self) -> Result<(), OutboundError>;

    /// Drop the link. Queued frames may be reported as failed.
    fn close(&mut self);

    /// Drop the link for good. Defaults to [`Transport::close`].
    fn shutdown(&mut self) {
        self.close();
    }
}

/// Commands from the drain loop to the socket task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCommand {
    Connect,
    Close,
    Shutdown,
}

/// [`Transport`] backed by bounded tokio channels into a socket task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    frames: mpsc::Sender<Frame>,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ChannelTransport {
    pub fn new(
        frames: mpsc::Sender<Frame>,
        commands: mpsc::UnboundedSender<ConnectionCommand>,
    ) -> Self {
        Self { frames, commands }
    }

}

impl Transport for ChannelTransport {
    fn try_send(&mut self, frame: Frame) -> Result<(), TrySendError> {
        self.frames.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(frame) => TrySendError::Full(frame),
            mpsc::error::TrySendError::Closed(frame) => TrySendError::Closed(frame),
        })
    }

    fn connect(&mut self) -> Result<(), OutboundError> {
        self.commands
            .send(ConnectionCommand::Connect)
            .map_err(|_| OutboundError::ChannelClosed)
    }

    fn close(&mut self) {
        if self.commands.send(ConnectionCommand::Close).is_err() {
            warn!("Connection task already stopped");
        }
    }

    fn shutdown(&mut self) {
        if self.commands.send(ConnectionCommand::Shutdown).is_err() {
            warn!("Connection task already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, Priority};

    fn frame() -> Frame {
        Frame::single(Message::from_json("{}", Priority::Normal, "").unwrap())
    }

    #[test]
    fn test_full_channel_returns_frame() {
        let (frame_tx, _frame_rx) = mpsc::channel(1);
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        let mut transport = ChannelTransport::new(frame_tx, cmd_tx);

        assert!(transport.try_send(frame()).is_ok());
        match transport.try_send(frame()) {
            Err(TrySendError::Full(returned)) => assert_eq!(returned.len(), 1),
            other => panic!("expected Full, got {:?}", other),
        }
    }

    #[test]
    fn test_closed_channel() {
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let mut transport = ChannelTransport::new(frame_tx, cmd_tx);
        drop(frame_rx);
        drop(cmd_rx);

        assert!(matches!(transport.try_send(frame()), Err(TrySendError::Closed(_))));
        assert!(matches!(transport.connect(), Err(OutboundError::ChannelClosed)));
    }

    #[test]
    fn test_connect_sends_command() {
        let (frame_tx, _frame_rx) = mpsc::channel(1);
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let mut transport = ChannelTransport::new(frame_tx, cmd_tx);

        transport.connect().unwrap();
        transport.close();
        assert_eq!(cmd_rx.try_recv().unwrap(), ConnectionCommand::Connect);
        assert_eq!(cmd_rx.try_recv().unwrap(), ConnectionCommand::Close);
    }

    #[test]
    fn test_shutdown_stops_socket_task() {
        let (frame_tx, _frame_rx) = mpsc::channel(1);
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let mut transport = ChannelTransport::new(frame_tx, cmd_tx);

        transport.shutdown();
        assert_eq!(cmd_rx.try_recv().unwrap(), ConnectionCommand::Shutdown);
    }
}
