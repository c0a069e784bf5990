//! Ingest gateway
//!
//! Wires configuration, the memory store, the concurrency coordinator, the
//! extraction pipeline and the window scheduler together, and feeds the
//! scheduler from channel adapters.

mod server;

pub use server::{Gateway, GatewayBuilder, GatewayState, GatewayStatus};
