pub mod connection;
pub mod transport;

pub use connection::ConnectionManager;
pub use transport::{ChannelTransport, ConnectionCommand, Transport, TransportEvent, TrySendError};
