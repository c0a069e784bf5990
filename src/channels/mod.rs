//! Chat-platform boundary
//!
//! Provides the inbound message types and the adapter contract through which
//! platform connections push messages into the gateway.

mod adapter;
mod message;

pub use adapter::{ChannelAdapter, ChannelEvent, JsonLinesAdapter};
pub use message::{BufferedMessage, InboundMessage};
