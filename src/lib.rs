//! SkyMemory - Long-term user memory for group chats
//!
//! SkyMemory watches chat channels, groups messages into conversation
//! windows, and asks a language model which durable facts about each
//! participant to save, update or forget. Memories are kept per user in a
//! bounded set with least-recently-used eviction.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         SkyMemory Gateway                         │
//! │  ┌────────────────┐   ChannelEvent    ┌────────────────────────┐ │
//! │  │ Channel adapter├──────────────────▶│     Window scheduler    │ │
//! │  └────────────────┘   (mpsc queue)    │ debounce / caps / drop  │ │
//! │                                       └───────────┬────────────┘ │
//! │                                                   │ FlushedWindow │
//! │  ┌────────────────────────────────────────────────▼────────────┐ │
//! │  │                   Extraction orchestrator                    │ │
//! │  │  snapshots ─▶ reasoning call (throttled) ─▶ parse/truncate   │ │
//! │  │  sorted per-user locks ─▶ consolidate ─▶ dedup ─▶ apply      │ │
//! │  └───────────────┬───────────────────────────────┬─────────────┘ │
//! │                  │                               │                │
//! │  ┌───────────────▼──────────┐   ┌────────────────▼─────────────┐ │
//! │  │ Concurrency coordinator  │   │        Memory store           │ │
//! │  │ user locks + throttle    │   │ bounded sets, LRU, JSON files │ │
//! │  └──────────────────────────┘   └──────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`gateway`]: wiring and lifecycle
//! - [`channels`]: inbound message types and adapters
//! - [`window`]: per-channel debounce scheduling
//! - [`extraction`]: extraction, consolidation and apply
//! - [`reasoning`]: language-model backend
//! - [`memory`]: records, deduplication and the per-user store
//! - [`coordinator`]: per-user locks and the global call throttle
//! - [`config`]: configuration management

pub mod channels;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod extraction;
pub mod gateway;
pub mod memory;
pub mod reasoning;
pub mod window;

#[cfg(test)]
mod testing;

pub use config::SkyMemoryConfig;
pub use error::{Error, Result};
