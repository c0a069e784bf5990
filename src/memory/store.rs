//! Per-user bounded memory store
//!
//! Each user owns an ordered `Vec<MemoryRecord>` capped at
//! `max_memories_per_user`. When a save would exceed the cap, the record with
//! the oldest `last_referenced_at` is evicted first (ties: lowest
//! `reference_count`, then earliest position).
//!
//! Sets live in a `DashMap` so operations on different users never contend on
//! one global lock. With a `MemoryFiles` backend, sets are loaded lazily on
//! first access and written back in batches by `flush()`.

use super::persistence::MemoryFiles;
use super::record::{normalize_content, MemoryRecord};
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Operations on per-user memory sets.
///
/// Index arguments are positions in the snapshot most recently returned by
/// `get`; out-of-range indices are silently ignored.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Snapshot of a user's records (a copy, never a live view)
    async fn get(&self, user_id: &str) -> Vec<MemoryRecord>;

    /// Save a fact, collapsing exact (case-insensitive) repeats
    async fn save(&self, user_id: &str, content: &str, context: &str) -> Result<()>;

    /// Replace content/context of the record at `index`
    async fn update(&self, user_id: &str, index: usize, content: &str, context: &str)
        -> Result<()>;

    /// Remove the record at `index`
    async fn forget(&self, user_id: &str, index: usize) -> Result<()>;

    /// Remove every record for the user
    async fn forget_all(&self, user_id: &str) -> Result<()>;

    /// Mark every record of the user as referenced
    async fn touch(&self, user_id: &str) -> Result<()>;

    /// Mark only the records at `indices` as referenced
    async fn touch_records(&self, user_id: &str, indices: &[usize]) -> Result<()>;

    /// Swap the user's entire set
    async fn replace_all(&self, user_id: &str, records: Vec<MemoryRecord>) -> Result<()>;

    /// Per-user capacity
    fn max_memories_per_user(&self) -> usize;
}

/// Index of the least-recently-used record
pub fn lru_index(records: &[MemoryRecord]) -> Option<usize> {
    records
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| {
            a.last_referenced_at
                .cmp(&b.last_referenced_at)
                .then(a.reference_count.cmp(&b.reference_count))
                .then(ia.cmp(ib))
        })
        .map(|(i, _)| i)
}

/// Evict LRU records until the set holds at most `cap` entries
fn evict_to(records: &mut Vec<MemoryRecord>, cap: usize) -> usize {
    let mut evicted = 0;
    while records.len() > cap {
        match lru_index(records) {
            Some(i) => {
                records.remove(i);
                evicted += 1;
            }
            None => break,
        }
    }
    evicted
}

/// In-memory memory store with optional JSON file persistence
pub struct UserMemoryStore {
    sets: DashMap<String, Vec<MemoryRecord>>,
    dirty: DashSet<String>,
    files: Option<MemoryFiles>,
    max_per_user: usize,
}

impl UserMemoryStore {
    /// Create a purely in-memory store
    pub fn new(max_per_user: usize) -> Self {
        Self {
            sets: DashMap::new(),
            dirty: DashSet::new(),
            files: None,
            max_per_user: max_per_user.max(1),
        }
    }

    /// Create a store backed by one JSON file per user
    pub fn with_files(max_per_user: usize, files: MemoryFiles) -> Self {
        Self {
            files: Some(files),
            ..Self::new(max_per_user)
        }
    }

    /// Known user ids (in memory or on disk), sorted
    pub async fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sets
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        if let Some(files) = &self.files {
            match files.list_users().await {
                Ok(on_disk) => ids.extend(on_disk),
                Err(e) => tracing::warn!(error = %e, "Failed to list memory files"),
            }
        }

        ids.sort();
        ids.dedup();
        ids
    }

    /// Number of users with unflushed changes
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Write every dirty user to disk. Returns how many users were written.
    pub async fn flush(&self) -> Result<usize> {
        let Some(files) = &self.files else {
            self.dirty.clear();
            return Ok(0);
        };

        let users: Vec<String> = self.dirty.iter().map(|u| u.key().clone()).collect();
        let mut written = 0;
        for user_id in users {
            self.dirty.remove(&user_id);
            let snapshot = self.snapshot(&user_id);
            if let Err(e) = files.write(&user_id, &snapshot).await {
                self.dirty.insert(user_id.clone());
                tracing::warn!(user_id = %user_id, error = %e, "Failed to flush memories");
                continue;
            }
            written += 1;
        }

        if written > 0 {
            tracing::debug!(users = written, "Flushed memory sets");
        }
        Ok(written)
    }

    /// Spawn the periodic flush loop; a final flush runs when `cancel` fires.
    pub fn spawn_flush_loop(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush().await {
                            tracing::warn!(error = %e, "Periodic memory flush failed");
                        }
                    }
                }
            }
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "Final memory flush failed");
            }
            tracing::debug!("Memory flush loop stopped");
        })
    }

    fn snapshot(&self, user_id: &str) -> Vec<MemoryRecord> {
        self.sets
            .get(user_id)
            .map(|set| set.value().clone())
            .unwrap_or_default()
    }

    /// Pull a user's set from disk into memory if it is not resident yet
    async fn ensure_loaded(&self, user_id: &str) {
        if self.sets.contains_key(user_id) {
            return;
        }
        let loaded = match &self.files {
            Some(files) => files.load(user_id).await,
            None => return,
        };
        self.sets.entry(user_id.to_string()).or_insert(loaded);
    }

    fn mark_dirty(&self, user_id: &str) {
        if self.files.is_some() {
            self.dirty.insert(user_id.to_string());
        }
    }
}

#[async_trait]
impl MemoryStore for UserMemoryStore {
    async fn get(&self, user_id: &str) -> Vec<MemoryRecord> {
        self.ensure_loaded(user_id).await;
        self.snapshot(user_id)
    }

    async fn save(&self, user_id: &str, content: &str, context: &str) -> Result<()> {
        self.ensure_loaded(user_id).await;
        let normalized = normalize_content(content);
        {
            let mut set = self.sets.entry(user_id.to_string()).or_default();

            let position = set.iter().position(|r| r.normalized_content() == normalized);
            if let Some(pos) = position {
                let existing = &mut set[pos];
                existing.context = context.to_string();
                existing.touch();
                tracing::debug!(user_id, "Collapsed repeated memory");
            } else {
                let evicted = evict_to(&mut set, self.max_per_user - 1);
                if evicted > 0 {
                    tracing::debug!(user_id, evicted, "Evicted least-recently-used memories");
                }
                set.push(MemoryRecord::new(content, context));
            }
        }
        self.mark_dirty(user_id);
        Ok(())
    }

    async fn update(
        &self,
        user_id: &str,
        index: usize,
        content: &str,
        context: &str,
    ) -> Result<()> {
        self.ensure_loaded(user_id).await;
        let updated = match self.sets.get_mut(user_id) {
            Some(mut set) => match set.get_mut(index) {
                Some(record) => {
                    record.content = content.to_string();
                    record.context = context.to_string();
                    record.last_referenced_at = Utc::now();
                    true
                }
                None => false,
            },
            None => false,
        };

        if updated {
            self.mark_dirty(user_id);
        } else {
            tracing::debug!(user_id, index, "Ignoring update for out-of-range memory index");
        }
        Ok(())
    }

    async fn forget(&self, user_id: &str, index: usize) -> Result<()> {
        self.ensure_loaded(user_id).await;
        let removed = match self.sets.get_mut(user_id) {
            Some(mut set) if index < set.len() => {
                set.remove(index);
                true
            }
            _ => false,
        };

        if removed {
            self.mark_dirty(user_id);
        } else {
            tracing::debug!(user_id, index, "Ignoring forget for out-of-range memory index");
        }
        Ok(())
    }

    async fn forget_all(&self, user_id: &str) -> Result<()> {
        // File goes first; the resident empty set keeps a racing `get` from
        // reloading it.
        if let Some(files) = &self.files {
            files.remove(user_id).await?;
        }
        self.sets.insert(user_id.to_string(), Vec::new());
        self.dirty.remove(user_id);
        tracing::info!(user_id, "Forgot all memories");
        Ok(())
    }

    async fn touch(&self, user_id: &str) -> Result<()> {
        self.ensure_loaded(user_id).await;
        let touched = match self.sets.get_mut(user_id) {
            Some(mut set) if !set.is_empty() => {
                set.iter_mut().for_each(MemoryRecord::touch);
                true
            }
            _ => false,
        };
        if touched {
            self.mark_dirty(user_id);
        }
        Ok(())
    }

    async fn touch_records(&self, user_id: &str, indices: &[usize]) -> Result<()> {
        self.ensure_loaded(user_id).await;
        let mut touched = false;
        if let Some(mut set) = self.sets.get_mut(user_id) {
            for &index in indices {
                if let Some(record) = set.get_mut(index) {
                    record.touch();
                    touched = true;
                }
            }
        }
        if touched {
            self.mark_dirty(user_id);
        }
        Ok(())
    }

    async fn replace_all(&self, user_id: &str, mut records: Vec<MemoryRecord>) -> Result<()> {
        evict_to(&mut records, self.max_per_user);
        self.sets.insert(user_id.to_string(), records);
        self.mark_dirty(user_id);
        Ok(())
    }

    fn max_memories_per_user(&self) -> usize {
        self.max_per_user
    }
}
