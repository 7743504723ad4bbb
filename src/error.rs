use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutboundError {
    #[error("Network connection failed: {0}")]
    ConnectionError(String),

    #[error("WebSocket error: {0}")]
    SocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to parse JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Internal channel closed")]
    ChannelClosed,

    #[error("Invalid URL")]
    UrlParseError(#[from] url::ParseError),

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

/// Why a message left the pipeline without being sent.
///
/// Every reason here is terminal for the affected message. Rate limiting is not
/// a drop: throttled messages stay queued for the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Evicted (or rejected) because the queue was at capacity.
    QueueFull,
    /// Waited longer than the configured message timeout.
    Expired,
    /// Skipped by the pressure sampler.
    Downsampled,
    /// Failed to send more times than the retry policy allows.
    RetryExhausted,
    /// Still pending when the pipeline shut down.
    Shutdown,
}

impl DropReason {
    pub const ALL: [DropReason; 5] = [
        Self::QueueFull,
        Self::Expired,
        Self::Downsampled,
        Self::RetryExhausted,
        Self::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Expired => "expired",
            Self::Downsampled => "downsampled",
            Self::RetryExhausted => "retry_exhausted",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
