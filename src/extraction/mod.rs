//! Memory extraction
//!
//! Turns flushed conversation windows into memory mutations: one reasoning
//! call per window, then an apply step under the per-user locks of every
//! participant the call touched.

mod consolidation;
mod orchestrator;
pub mod parse;

pub use consolidation::ConsolidationEngine;
pub use orchestrator::{ApplySummary, ExtractionOrchestrator};
