//! Queue pressure state derived from the fill ratio.

/// How full the outbound queue is relative to the sampling threshold.
///
/// The state is computed from the ratio of queued messages to queue capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePressure {
    /// At or below the threshold: everything drains, nothing is sampled.
    #[default]
    Nominal,

    /// Above the threshold: Normal/Low traffic is downsampled.
    Elevated,

    /// At capacity: new non-coalescable messages evict or get dropped.
    Saturated,
}

impl QueuePressure {
    /// Determine state from queue occupancy.
    ///
    /// # Arguments
    /// * `len` - Messages currently queued
    /// * `capacity` - Queue capacity
    /// * `threshold` - Fill ratio above which sampling starts
    #[inline]
    pub fn from_capacity(len: usize, capacity: usize, threshold: f64) -> Self {
        if capacity == 0 || len >= capacity {
            return Self::Saturated;
        }

        if ratio(len, capacity) > threshold {
            Self::Elevated
        } else {
            Self::Nominal
        }
    }

    /// Check if this state requires sampling of lower-priority traffic.
    #[inline]
    pub fn requires_sampling(&self) -> bool {
        matches!(self, Self::Elevated | Self::Saturated)
    }

    /// Get a human-readable state name for logging/metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::Elevated => "elevated",
            Self::Saturated => "saturated",
        }
    }
}

impl std::fmt::Display for QueuePressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fill ratio, 1.0 for a zero-capacity queue.
#[inline]
pub fn ratio(len: usize, capacity: usize) -> f64 {
    if capacity == 0 {
        1.0
    } else {
        len as f64 / capacity as f64
    }
}
