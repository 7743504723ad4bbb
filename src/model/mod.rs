pub mod frame;
pub mod message;

pub use frame::{Frame, WireFrame, BATCH_EVENT_NAME, EVENT_NAME};
pub use message::{Message, MessageKind, Priority};
