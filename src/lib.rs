pub mod batch;
pub mod client;
pub mod config;
mod error;
pub mod governor;
pub mod metrics;
pub mod model;
pub mod network;
pub mod pipeline;
pub mod queue;

pub use client::{OutboundClient, Producer};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{DropReason, OutboundError};
pub use metrics::PipelineMetrics;
pub use model::{Frame, Message, MessageKind, Priority};
pub use network::{Transport, TransportEvent, TrySendError};
pub use pipeline::{Pipeline, PipelineEvent, PipelineState};
pub use queue::{EnqueueOutcome, SharedQueue};
