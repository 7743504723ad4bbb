//! Frame batching.
//!
//! Several small messages cost one message token and one socket write when
//! they travel together. Single-message frames go out unwrapped.

pub mod builder;

pub use builder::{BatchBuilder, Offer};
