//! Per-user memory: records, bounded store, persistence and deduplication
//!
//! A user's memories are an ordered list of facts capped at a fixed size.
//! Saves collapse exact repeats and evict the least-recently-used record when
//! full; near-duplicates are filtered before they reach the store.

pub mod dedup;
pub mod persistence;
pub mod record;
pub mod store;

pub use dedup::{is_duplicate, DEFAULT_DUPLICATE_THRESHOLD};
pub use persistence::MemoryFiles;
pub use record::{MemoryAction, MemoryOperation, MemoryRecord};
pub use store::{MemoryStore, UserMemoryStore};
