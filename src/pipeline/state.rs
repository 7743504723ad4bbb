//! Pipeline connection state machine.

/// Lifecycle state of the outbound pipeline.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Backoff -> Connecting
///                                    \          \
///                                     \          +--> GaveUp
///                                      +--> ShutDown (from any state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PipelineState {
    /// Not started yet.
    #[default]
    Disconnected = 0,

    /// Waiting for the transport to come up.
    Connecting = 1,

    /// Draining, gating, batching and sending.
    Connected = 2,

    /// Waiting out a failure or a server rate limit. The queue is kept.
    Backoff = 3,

    /// Reconnect attempts exhausted. The queue is kept until shutdown.
    GaveUp = 4,

    /// Stopped; pending messages were counted as shutdown drops.
    ShutDown = 5,
}

impl PipelineState {
    /// Convert to u8 for atomic storage.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Convert from u8 (from atomic load).
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Backoff,
            4 => Self::GaveUp,
            5 => Self::ShutDown,
            _ => Self::Disconnected,
        }
    }

    /// Only this state drains the queue onto the wire.
    #[inline]
    pub const fn is_sending(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// No further transitions happen from here.
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::GaveUp | Self::ShutDown)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
            Self::GaveUp => "gave_up",
            Self::ShutDown => "shut_down",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
