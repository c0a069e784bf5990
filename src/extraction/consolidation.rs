//! Consolidation of full memory sets
//!
//! When a user's set is at capacity and an extraction wants to save more, the
//! reasoning service is asked to merge the set down to a smaller one. Any
//! failure yields `None` and the store's LRU eviction takes over, so a save is
//! never blocked on consolidation.

use super::parse::parse_consolidated;
use crate::coordinator::ConcurrencyCoordinator;
use crate::error::Result;
use crate::memory::{MemoryRecord, MemoryStore};
use crate::reasoning::{ConsolidationRequest, ReasoningService};
use std::sync::Arc;

/// Merges oversized memory sets through the reasoning service
pub struct ConsolidationEngine {
    reasoning: Arc<dyn ReasoningService>,
    coordinator: Arc<ConcurrencyCoordinator>,
}

impl ConsolidationEngine {
    pub fn new(reasoning: Arc<dyn ReasoningService>, coordinator: Arc<ConcurrencyCoordinator>) -> Self {
        Self {
            reasoning,
            coordinator,
        }
    }

    /// Ask for `existing` compressed to at most `target_count` records
    pub async fn consolidate(
        &self,
        user_id: &str,
        existing: &[MemoryRecord],
        target_count: usize,
    ) -> Option<Vec<MemoryRecord>> {
        let request = ConsolidationRequest {
            user_id: user_id.to_string(),
            records: existing.to_vec(),
            target_count,
        };

        let payload = match self
            .coordinator
            .throttled(self.reasoning.consolidate(&request))
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Consolidation call failed");
                return None;
            }
        };

        let records = parse_consolidated(&payload, target_count);
        if records.is_none() {
            tracing::warn!(user_id, "Consolidation returned no usable memories");
        }
        records
    }

    /// Consolidate a user's stored set and replace it on success.
    ///
    /// The caller must hold the user's lock. Returns whether the set was
    /// replaced.
    pub async fn consolidate_user(
        &self,
        store: &dyn MemoryStore,
        user_id: &str,
        target_count: usize,
    ) -> Result<bool> {
        let existing = store.get(user_id).await;
        let Some(records) = self.consolidate(user_id, &existing, target_count).await else {
            return Ok(false);
        };

        tracing::info!(
            user_id,
            before = existing.len(),
            after = records.len(),
            "Consolidated memories"
        );
        store.replace_all(user_id, records).await?;
        Ok(true)
    }
}
