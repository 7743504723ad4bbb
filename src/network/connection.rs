use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::frame::coding::CloseCode,
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::OutboundError;
use crate::model::Frame;

use super::transport::{ConnectionCommand, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How a connected session ended.
enum SessionEnd {
    /// Link dropped; wait for the next Connect.
    Disconnected(Option<String>),
    /// Shutdown requested or the pipeline is gone.
    Stop,
}

/// Owns the WebSocket. Connects only when told to, writes frames from the
/// drain loop and reports everything back as [`TransportEvent`]s.
pub struct ConnectionManager {
    url: Url,
    events: mpsc::Sender<TransportEvent>,
    frames: mpsc::Receiver<Frame>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
}

impl ConnectionManager {
    pub fn new(
        url: &str,
        events: mpsc::Sender<TransportEvent>,
        frames: mpsc::Receiver<Frame>,
        commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    ) -> Result<Self, OutboundError> {
        Ok(Self {
            url: Url::parse(url)?,
            events,
            frames,
            commands,
        })
    }

    /// Runs until a Shutdown command arrives or the pipeline goes away.
    pub async fn run(mut self) {
        loop {
            match self.commands.recv().await {
                Some(ConnectionCommand::Connect) => {}
                Some(ConnectionCommand::Close) => continue,
                Some(ConnectionCommand::Shutdown) | None => break,
            }

            info!("Connecting to {}...", self.url);
            match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!("Connected to {}", self.url);
                    if !self.emit(TransportEvent::Connected).await {
                        break;
                    }

                    let end = self.session(ws_stream).await;
                    let stop = matches!(end, SessionEnd::Stop);
                    if let SessionEnd::Disconnected(reason) = end {
                        if !self.emit(TransportEvent::Closed(reason)).await {
                            break;
                        }
                    }
                    self.fail_pending_frames().await;
                    if stop {
                        break;
                    }
                }
                Err(e) => {
                    let e = OutboundError::from(e);
                    error!("Connection to {} failed: {}", self.url, e);
                    if !self.emit(TransportEvent::ConnectFailed(e.to_string())).await {
                        break;
                    }
                }
            }
        }
        info!("Connection manager stopped");
    }

    /// Pump one connected session until it ends.
    async fn session(&mut self, ws_stream: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !self.emit(TransportEvent::Inbound(text.to_string())).await {
                                return SessionEnd::Stop;
                            }
                        }
                        Some(Ok(Message::Close(close))) => {
                            let policy = close.as_ref().is_some_and(|frame| frame.code == CloseCode::Policy);
                            if policy {
                                warn!("Server closed with policy violation, treating as rate limit");
                                if !self.emit(TransportEvent::RateLimited { retry_after: None }).await {
                                    return SessionEnd::Stop;
                                }
                            }
                            let reason = close.map(|frame| {
                                format!("{} {}", u16::from(frame.code), frame.reason.as_str())
                            });
                            warn!("Server closed the connection");
                            return SessionEnd::Disconnected(reason);
                        }
                        Some(Ok(_)) => {
                            // Ping/pong is answered by tungstenite.
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            return SessionEnd::Disconnected(Some(e.to_string()));
                        }
                        None => {
                            warn!("Stream ended unexpectedly");
                            return SessionEnd::Disconnected(None);
                        }
                    }
                }
                frame = self.frames.recv() => {
                    let Some(frame) = frame else {
                        let _ = write.close().await;
                        return SessionEnd::Stop;
                    };
                    if let Err(e) = write.send(Message::Text(frame.text().to_owned().into())).await {
                        let e = OutboundError::from(e);
                        error!("Failed to send frame: {}", e);
                        if !self.emit(TransportEvent::SendFailed(frame)).await {
                            return SessionEnd::Stop;
                        }
                        return SessionEnd::Disconnected(Some(e.to_string()));
                    }
                    debug!("Sent frame of {} messages ({} bytes)", frame.len(), frame.total_bytes());
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Connect) => {}
                        Some(ConnectionCommand::Close) => {
                            info!("Closing connection on request");
                            let _ = write.close().await;
                            return SessionEnd::Disconnected(Some("closed by client".to_string()));
                        }
                        Some(ConnectionCommand::Shutdown) | None => {
                            info!("Shutting down connection");
                            let _ = write.close().await;
                            return SessionEnd::Stop;
                        }
                    }
                }
            }
        }
    }

    /// Frames queued for a session that no longer exists go back as failures.
    async fn fail_pending_frames(&mut self) {
        let mut failed = 0;
        while let Ok(frame) = self.frames.try_recv() {
            failed += 1;
            if !self.emit(TransportEvent::SendFailed(frame)).await {
                return;
            }
        }
        if failed > 0 {
            debug!("Returned {} unsent frames", failed);
        }
    }

    /// Returns false once the pipeline side has gone away.
    async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}
