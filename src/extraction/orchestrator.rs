//! Window extraction pipeline
//!
//! ```text
//! FlushedWindow
//!   │  participants + memory snapshots (concurrent, unlocked)
//!   ▼
//! reasoning service (global throttle)
//!   │  parse, drop strays, truncate
//!   ▼
//! lock every touched user (sorted) ──▶ consolidate? ──▶ dedup ──▶ apply ──▶ unlock
//! ```
//!
//! Within one user's group, updates run first, then forgets from the highest
//! index down, then saves, so every index still refers to the snapshot the
//! reasoning service was shown.

use super::consolidation::ConsolidationEngine;
use super::parse::parse_operations;
use crate::channels::BufferedMessage;
use crate::config::MemoryConfig;
use crate::coordinator::ConcurrencyCoordinator;
use crate::error::{Error, Result};
use crate::memory::{is_duplicate, MemoryOperation, MemoryStore};
use crate::reasoning::{ExtractionRequest, Participant, ReasoningService};
use crate::window::{FlushedWindow, WindowSink};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Counts of what one batch changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub saved: usize,
    pub updated: usize,
    pub forgotten: usize,
    pub duplicates: usize,
    pub consolidated: usize,
}

/// Turns conversation windows into memory mutations
pub struct ExtractionOrchestrator {
    store: Arc<dyn MemoryStore>,
    reasoning: Arc<dyn ReasoningService>,
    coordinator: Arc<ConcurrencyCoordinator>,
    consolidation: ConsolidationEngine,
    max_per_extraction: usize,
    dedup_threshold: f64,
    consolidation_target: usize,
}

impl ExtractionOrchestrator {
    pub fn new(
        config: &MemoryConfig,
        store: Arc<dyn MemoryStore>,
        reasoning: Arc<dyn ReasoningService>,
        coordinator: Arc<ConcurrencyCoordinator>,
    ) -> Self {
        let consolidation = ConsolidationEngine::new(reasoning.clone(), coordinator.clone());
        let cap = store.max_memories_per_user();
        Self {
            store,
            reasoning,
            coordinator,
            consolidation,
            max_per_extraction: config.max_memories_per_extraction,
            dedup_threshold: config.dedup_threshold,
            consolidation_target: config.consolidation_target().min(cap),
        }
    }

    /// Derive operations from a window's messages
    pub async fn extract(
        &self,
        window_id: Uuid,
        messages: &[BufferedMessage],
    ) -> Result<Vec<MemoryOperation>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let authors: Vec<(&str, &str)> = messages
            .iter()
            .filter(|m| seen.insert(m.author_id.as_str()))
            .map(|m| (m.author_id.as_str(), m.author_display_name.as_str()))
            .collect();

        let snapshots =
            futures::future::join_all(authors.iter().map(|(id, _)| self.store.get(id))).await;
        let participants: Vec<Participant> = authors
            .iter()
            .zip(snapshots)
            .map(|((id, name), memories)| Participant {
                user_id: id.to_string(),
                display_name: name.to_string(),
                memories,
            })
            .collect();

        let request = ExtractionRequest {
            window_id,
            messages: messages.to_vec(),
            participants,
            max_operations: self.max_per_extraction,
        };

        let payload = self
            .coordinator
            .throttled(self.reasoning.extract(&request))
            .await?;

        let ids: HashSet<String> = request
            .participants
            .iter()
            .map(|p| p.user_id.clone())
            .collect();
        let mut operations = parse_operations(&payload, &ids)?;
        if operations.len() > self.max_per_extraction {
            tracing::debug!(
                window_id = %window_id,
                returned = operations.len(),
                kept = self.max_per_extraction,
                "Truncating extracted operations"
            );
            operations.truncate(self.max_per_extraction);
        }
        Ok(operations)
    }

    /// Apply operations while holding the locks of every user they touch
    pub async fn apply(&self, operations: Vec<MemoryOperation>) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();
        if operations.is_empty() {
            return Ok(summary);
        }

        let groups = group_by_user(operations);
        let locks = self
            .coordinator
            .lock_users(groups.iter().map(|(user_id, _)| user_id.as_str()))
            .await?;

        for (user_id, ops) in groups {
            if !locks.holds(&user_id) {
                return Err(Error::Internal(format!("lock for user {} not held", user_id)));
            }
            self.apply_user(&user_id, ops, &mut summary).await?;
        }

        Ok(summary)
    }

    async fn apply_user(
        &self,
        user_id: &str,
        ops: Vec<MemoryOperation>,
        summary: &mut ApplySummary,
    ) -> Result<()> {
        let mut updates = Vec::new();
        let mut forgets = Vec::new();
        let mut saves = Vec::new();
        for op in ops {
            match op {
                MemoryOperation::Update {
                    memory_index,
                    content,
                    context,
                    ..
                } => updates.push((memory_index, content, context)),
                MemoryOperation::Forget { memory_index, .. } => forgets.push(memory_index),
                MemoryOperation::Save {
                    content, context, ..
                } => saves.push((content, context)),
            }
        }

        for (index, content, context) in updates {
            self.store.update(user_id, index, &content, &context).await?;
            summary.updated += 1;
        }

        forgets.sort_unstable_by(|a, b| b.cmp(a));
        forgets.dedup();
        for index in forgets {
            self.store.forget(user_id, index).await?;
            summary.forgotten += 1;
        }

        let cap = self.store.max_memories_per_user();
        let mut consolidated = false;
        for (content, context) in saves {
            let current = self.store.get(user_id).await;
            if is_duplicate(&content, &current, self.dedup_threshold) {
                tracing::debug!(user_id, "Skipping near-duplicate memory");
                summary.duplicates += 1;
                continue;
            }

            if current.len() >= cap && !consolidated {
                consolidated = true;
                if self
                    .consolidation
                    .consolidate_user(self.store.as_ref(), user_id, self.consolidation_target)
                    .await?
                {
                    summary.consolidated += 1;
                }
            }

            self.store.save(user_id, &content, &context).await?;
            summary.saved += 1;
        }

        Ok(())
    }

    /// Extract and apply one window
    pub async fn process_window(&self, window: &FlushedWindow) -> Result<ApplySummary> {
        let operations = self.extract(window.id, &window.messages).await?;
        self.apply(operations).await
    }
}

#[async_trait]
impl WindowSink for ExtractionOrchestrator {
    async fn flush_window(&self, window: FlushedWindow) {
        match self.process_window(&window).await {
            Ok(summary) => tracing::info!(
                window_id = %window.id,
                channel_id = %window.channel_id,
                messages = window.messages.len(),
                saved = summary.saved,
                updated = summary.updated,
                forgotten = summary.forgotten,
                duplicates = summary.duplicates,
                consolidated = summary.consolidated,
                "Processed conversation window"
            ),
            Err(Error::Cancelled(what)) => tracing::debug!(
                window_id = %window.id,
                channel_id = %window.channel_id,
                during = %what,
                "Window processing cancelled"
            ),
            Err(e) => tracing::warn!(
                window_id = %window.id,
                channel_id = %window.channel_id,
                error = %e,
                "Dropping conversation window"
            ),
        }
    }
}

/// Group operations per user, keeping first-appearance order of users and
/// original order within each user
fn group_by_user(operations: Vec<MemoryOperation>) -> Vec<(String, Vec<MemoryOperation>)> {
    let mut groups: Vec<(String, Vec<MemoryOperation>)> = Vec::new();
    for op in operations {
        match groups.iter_mut().find(|(user_id, _)| user_id == op.user_id()) {
            Some((_, ops)) => ops.push(op),
            None => groups.push((op.user_id().to_string(), vec![op])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::UserMemoryStore;
    use crate::testing::{InstrumentedStore, ScriptedReasoning};
    use crate::window::FlushReason;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::assert_ok;
    use tokio_util::sync::CancellationToken;

    fn memory_config(cap: usize) -> MemoryConfig {
        MemoryConfig {
            max_memories_per_user: cap,
            ..MemoryConfig::default()
        }
    }

    fn orchestrator(
        cap: usize,
        store: Arc<dyn MemoryStore>,
        reasoning: Arc<ScriptedReasoning>,
    ) -> ExtractionOrchestrator {
        let coordinator = Arc::new(ConcurrencyCoordinator::new(4, CancellationToken::new()));
        ExtractionOrchestrator::new(&memory_config(cap), store, reasoning, coordinator)
    }

    fn window(messages: Vec<BufferedMessage>) -> FlushedWindow {
        let now = Utc::now();
        FlushedWindow {
            id: Uuid::new_v4(),
            channel_id: "discord:general".to_string(),
            messages,
            first_message_at: now,
            last_message_at: now,
            reason: FlushReason::Inactivity,
        }
    }

    fn msg(author: &str, content: &str) -> BufferedMessage {
        BufferedMessage::new(author, &format!("user{}", author), content)
    }

    /// Saves one window-specific fact for every participant
    fn save_per_participant(request: &ExtractionRequest) -> std::result::Result<serde_json::Value, String> {
        let tag = request.messages[0].content.clone();
        let ops: Vec<_> = request
            .participants
            .iter()
            .map(|p| {
                json!({
                    "user_id": p.user_id,
                    "action": "save",
                    "content": format!("{} mentioned {}", p.user_id, tag),
                })
            })
            .collect();
        Ok(json!({"operations": ops}))
    }

    #[tokio::test]
    async fn test_extract_builds_request() {
        let reasoning = Arc::new(ScriptedReasoning::new());
        let store = Arc::new(UserMemoryStore::new(10));
        store.save("100", "Lives in Oslo", "").await.unwrap();
        let orchestrator = orchestrator(10, store, reasoning.clone());

        let ops = orchestrator
            .extract(
                Uuid::new_v4(),
                &[msg("100", "hi"), msg("200", "hey"), msg("100", "bye")],
            )
            .await
            .unwrap();
        assert!(ops.is_empty());

        let requests = reasoning.extraction_requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.participants.len(), 2);
        assert_eq!(request.participants[0].user_id, "100");
        assert_eq!(request.participants[0].display_name, "user100");
        assert_eq!(request.participants[0].memories.len(), 1);
        assert!(request.participants[1].memories.is_empty());
    }

    #[tokio::test]
    async fn test_extract_empty_window_skips_call() {
        let reasoning = Arc::new(ScriptedReasoning::new());
        let orchestrator = orchestrator(10, Arc::new(UserMemoryStore::new(10)), reasoning.clone());
        assert!(orchestrator.extract(Uuid::new_v4(), &[]).await.unwrap().is_empty());
        assert!(reasoning.extraction_requests().is_empty());
    }

    #[tokio::test]
    async fn test_extract_drops_strays_and_truncates() {
        let reasoning = Arc::new(ScriptedReasoning::new());
        let mut ops: Vec<_> = (0..15)
            .map(|i| json!({"user_id": "100", "action": "save", "content": format!("fact {}", i)}))
            .collect();
        ops.insert(0, json!({"user_id": "999", "action": "save", "content": "stranger"}));
        ops.insert(1, json!({"user_id": "100", "action": "save"}));
        reasoning.push_extraction(Ok(json!({"operations": ops})));

        let orchestrator = orchestrator(30, Arc::new(UserMemoryStore::new(30)), reasoning);
        let ops = orchestrator
            .extract(Uuid::new_v4(), &[msg("100", "lots of facts")])
            .await
            .unwrap();

        assert_eq!(ops.len(), 10);
        assert!(ops.iter().all(|op| op.user_id() == "100"));
        assert_eq!(
            ops[0],
            MemoryOperation::Save {
                user_id: "100".to_string(),
                content: "fact 0".to_string(),
                context: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn test_apply_orders_updates_forgets_saves() {
        let store = Arc::new(UserMemoryStore::new(10));
        for fact in ["Lives in Oslo", "Plays chess", "Has a dog"] {
            store.save("100", fact, "").await.unwrap();
        }
        let orchestrator = orchestrator(10, store.clone(), Arc::new(ScriptedReasoning::new()));

        let summary = orchestrator
            .apply(vec![
                MemoryOperation::Forget {
                    user_id: "100".to_string(),
                    memory_index: 0,
                },
                MemoryOperation::Save {
                    user_id: "100".to_string(),
                    content: "Learning Rust".to_string(),
                    context: "said so".to_string(),
                },
                MemoryOperation::Update {
                    user_id: "100".to_string(),
                    memory_index: 2,
                    content: "Has two dogs".to_string(),
                    context: "got another".to_string(),
                },
                MemoryOperation::Forget {
                    user_id: "100".to_string(),
                    memory_index: 1,
                },
            ])
            .await
            .unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.forgotten, 2);
        assert_eq!(summary.saved, 1);

        let contents: Vec<String> = store.get("100").await.into_iter().map(|r| r.content).collect();
        assert_eq!(contents, vec!["Has two dogs", "Learning Rust"]);
    }

    #[tokio::test]
    async fn test_apply_skips_near_duplicates() {
        let store = Arc::new(UserMemoryStore::new(10));
        store.save("100", "Likes cats very much", "").await.unwrap();
        let orchestrator = orchestrator(10, store.clone(), Arc::new(ScriptedReasoning::new()));

        let summary = orchestrator
            .apply(vec![
                MemoryOperation::Save {
                    user_id: "100".to_string(),
                    content: "Likes cats very much indeed".to_string(),
                    context: String::new(),
                },
                MemoryOperation::Save {
                    user_id: "100".to_string(),
                    content: "Collects vinyl records".to_string(),
                    context: String::new(),
                },
                MemoryOperation::Save {
                    user_id: "100".to_string(),
                    content: "collects vinyl records".to_string(),
                    context: String::new(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(summary.saved, 1);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(store.get("100").await.len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_operations_are_noops() {
        let store = Arc::new(UserMemoryStore::new(10));
        store.save("100", "Plays chess", "").await.unwrap();
        let before = store.get("100").await;
        let orchestrator = orchestrator(10, store.clone(), Arc::new(ScriptedReasoning::new()));

        assert_ok!(
            orchestrator
                .apply(vec![
                    MemoryOperation::Update {
                        user_id: "100".to_string(),
                        memory_index: 7,
                        content: "x".to_string(),
                        context: String::new(),
                    },
                    MemoryOperation::Forget {
                        user_id: "100".to_string(),
                        memory_index: 3,
                    },
                ])
                .await
        );
        assert_eq!(store.get("100").await, before);
    }

    #[tokio::test]
    async fn test_consolidation_when_full() {
        let store = Arc::new(UserMemoryStore::new(4));
        for fact in ["Has a cat", "Has a tabby cat", "Plays chess", "Lives in Oslo"] {
            store.save("100", fact, "").await.unwrap();
        }
        let reasoning = Arc::new(ScriptedReasoning::new());
        reasoning.push_consolidation(Ok(json!({"memories": [
            {"content": "Has a tabby cat"},
            {"content": "Plays chess"},
            {"content": "Lives in Oslo"}
        ]})));
        let orchestrator = orchestrator(4, store.clone(), reasoning.clone());

        let summary = orchestrator
            .apply(vec![
                MemoryOperation::Save {
                    user_id: "100".to_string(),
                    content: "Learning the piano".to_string(),
                    context: String::new(),
                },
                MemoryOperation::Save {
                    user_id: "100".to_string(),
                    content: "Works as a nurse".to_string(),
                    context: String::new(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(summary.consolidated, 1);
        assert_eq!(summary.saved, 2);
        assert_eq!(reasoning.consolidation_requests().len(), 1);
        assert_eq!(reasoning.consolidation_requests()[0].target_count, 3);

        let records = store.get("100").await;
        assert_eq!(records.len(), 4);
        assert!(records.iter().any(|r| r.content == "Works as a nurse"));
        assert!(!records.iter().any(|r| r.content == "Has a cat"));
    }

    #[tokio::test]
    async fn test_consolidation_failure_falls_back_to_lru() {
        let store = Arc::new(UserMemoryStore::new(3));
        for fact in ["Oldest fact here", "Middle fact here", "Newest fact here"] {
            store.save("100", fact, "").await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let reasoning = Arc::new(ScriptedReasoning::new());
        reasoning.push_consolidation(Ok(json!({"memories": []})));
        let orchestrator = orchestrator(3, store.clone(), reasoning);

        let summary = orchestrator
            .apply(vec![MemoryOperation::Save {
                user_id: "100".to_string(),
                content: "Brand new thing".to_string(),
                context: String::new(),
            }])
            .await
            .unwrap();
        assert_eq!(summary.consolidated, 0);

        let contents: Vec<String> = store.get("100").await.into_iter().map(|r| r.content).collect();
        assert_eq!(contents.len(), 3);
        assert!(!contents.contains(&"Oldest fact here".to_string()));
        assert!(contents.contains(&"Brand new thing".to_string()));
    }

    #[tokio::test]
    async fn test_overlapping_windows_do_not_deadlock() {
        let store = Arc::new(InstrumentedStore::new(3, Duration::from_millis(20)));
        let reasoning = Arc::new(
            ScriptedReasoning::with_extractor(save_per_participant).delay(Duration::from_millis(10)),
        );
        let orchestrator = Arc::new(orchestrator(3, store.clone(), reasoning));

        let mut handles = Vec::new();
        for round in 0..4 {
            let forward = window(vec![msg("100", &format!("a{}", round)), msg("200", "x")]);
            let backward = window(vec![msg("200", &format!("b{}", round)), msg("100", "y")]);
            for w in [forward, backward] {
                let orchestrator = orchestrator.clone();
                handles.push(tokio::spawn(async move { orchestrator.process_window(&w).await }));
            }
        }

        let results = tokio::time::timeout(
            Duration::from_secs(10),
            futures::future::join_all(handles),
        )
        .await
        .expect("windows deadlocked");

        for result in results {
            assert_ok!(result.unwrap());
        }
        assert!(store.get("100").await.len() <= 3);
        assert!(store.get("200").await.len() <= 3);
    }

    #[tokio::test]
    async fn test_same_user_windows_serialize() {
        let store = Arc::new(InstrumentedStore::new(30, Duration::from_millis(25)));
        let reasoning = Arc::new(ScriptedReasoning::with_extractor(save_per_participant));
        let orchestrator = Arc::new(orchestrator(30, store.clone(), reasoning));

        let a = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .process_window(&window(vec![msg("100", "first topic")]))
                    .await
            })
        };
        let b = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .process_window(&window(vec![msg("100", "second subject")]))
                    .await
            })
        };

        assert_ok!(a.await.unwrap());
        assert_ok!(b.await.unwrap());
        assert_eq!(store.peak_per_user(), 1);
        assert_eq!(store.get("100").await.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_released_after_store_failure() {
        let store = Arc::new(InstrumentedStore::new(30, Duration::ZERO));
        store.fail_next_saves(1);
        let reasoning = Arc::new(ScriptedReasoning::with_extractor(save_per_participant));
        let orchestrator = orchestrator(30, store.clone(), reasoning);

        let first = orchestrator
            .process_window(&window(vec![msg("100", "doomed")]))
            .await;
        assert!(matches!(first, Err(Error::Store(_))));

        let second = tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.process_window(&window(vec![msg("100", "recovered")])),
        )
        .await
        .expect("user lock was not released");
        assert_eq!(second.unwrap().saved, 1);
        assert_eq!(store.get("100").await[0].content, "100 mentioned recovered");
    }

    #[tokio::test]
    async fn test_reasoning_failure_drops_window() {
        let reasoning = Arc::new(ScriptedReasoning::new());
        reasoning.push_extraction(Err("502 bad gateway".to_string()));
        reasoning.push_extraction(Ok(json!("garbage")));
        let store = Arc::new(UserMemoryStore::new(10));
        let orchestrator = orchestrator(10, store.clone(), reasoning);

        let w = window(vec![msg("100", "hello")]);
        assert!(matches!(
            orchestrator.process_window(&w).await,
            Err(Error::Reasoning(_))
        ));
        assert!(matches!(
            orchestrator.process_window(&w).await,
            Err(Error::Parse(_))
        ));

        // The sink swallows failures
        orchestrator.flush_window(w).await;
        assert!(store.get("100").await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_lock_wait_returns_error() {
        let cancel = CancellationToken::new();
        let coordinator = Arc::new(ConcurrencyCoordinator::new(1, cancel.clone()));
        let store: Arc<dyn MemoryStore> = Arc::new(UserMemoryStore::new(10));
        let orchestrator = ExtractionOrchestrator::new(
            &memory_config(10),
            store,
            Arc::new(ScriptedReasoning::new()),
            coordinator.clone(),
        );

        let held = coordinator.lock_users(["100"]).await.unwrap();
        let pending = tokio::spawn(async move {
            orchestrator
                .apply(vec![MemoryOperation::Forget {
                    user_id: "100".to_string(),
                    memory_index: 0,
                }])
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));
        drop(held);
    }

    #[test]
    fn test_group_by_user_keeps_order() {
        let save = |user: &str, content: &str| MemoryOperation::Save {
            user_id: user.to_string(),
            content: content.to_string(),
            context: String::new(),
        };
        let groups = group_by_user(vec![save("200", "a"), save("100", "b"), save("200", "c")]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "200");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "100");
    }
}
