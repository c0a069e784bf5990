//! External reasoning service
//!
//! Extraction and consolidation both delegate to a language model behind the
//! `ReasoningService` trait. Implementations return the model's raw JSON
//! payload; turning it into typed operations is the caller's job, so a
//! malformed element never fails a whole batch.

mod openai;
pub mod prompt;

pub use openai::OpenAiReasoningService;

use crate::channels::BufferedMessage;
use crate::error::Result;
use crate::memory::MemoryRecord;
use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

/// One window participant and the memories the model may reference by index
#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub memories: Vec<MemoryRecord>,
}

/// Input for an extraction call
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRequest {
    pub window_id: Uuid,
    /// Chronological transcript
    pub messages: Vec<BufferedMessage>,
    /// Distinct authors, in order of first appearance
    pub participants: Vec<Participant>,
    /// Upper bound on operations the model should return
    pub max_operations: usize,
}

/// Input for a consolidation call
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationRequest {
    pub user_id: String,
    pub records: Vec<MemoryRecord>,
    pub target_count: usize,
}

/// Language-model backend
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Derive memory operations from a conversation window
    async fn extract(&self, request: &ExtractionRequest) -> Result<serde_json::Value>;

    /// Compress a memory set to at most `target_count` entries
    async fn consolidate(&self, request: &ConsolidationRequest) -> Result<serde_json::Value>;
}
