//! Test doubles for the reasoning service and the memory store

use crate::error::{Error, Result};
use crate::memory::{MemoryRecord, MemoryStore, UserMemoryStore};
use crate::reasoning::{ConsolidationRequest, ExtractionRequest, ReasoningService};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Extractor = Box<dyn Fn(&ExtractionRequest) -> std::result::Result<Value, String> + Send + Sync>;

/// Reasoning service answering from queued replies or a responder closure.
///
/// With nothing queued, extraction returns no operations and consolidation
/// returns an empty list.
pub struct ScriptedReasoning {
    extractions: Mutex<VecDeque<std::result::Result<Value, String>>>,
    consolidations: Mutex<VecDeque<std::result::Result<Value, String>>>,
    extractor: Option<Extractor>,
    delay: Duration,
    extraction_log: Mutex<Vec<ExtractionRequest>>,
    consolidation_log: Mutex<Vec<ConsolidationRequest>>,
}

impl ScriptedReasoning {
    pub fn new() -> Self {
        Self {
            extractions: Mutex::new(VecDeque::new()),
            consolidations: Mutex::new(VecDeque::new()),
            extractor: None,
            delay: Duration::ZERO,
            extraction_log: Mutex::new(Vec::new()),
            consolidation_log: Mutex::new(Vec::new()),
        }
    }

    /// Answer every extraction with `f`
    pub fn with_extractor<F>(f: F) -> Self
    where
        F: Fn(&ExtractionRequest) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            extractor: Some(Box::new(f)),
            ..Self::new()
        }
    }

    /// Sleep before every reply
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_extraction(&self, reply: std::result::Result<Value, String>) {
        self.extractions.lock().unwrap().push_back(reply);
    }

    pub fn push_consolidation(&self, reply: std::result::Result<Value, String>) {
        self.consolidations.lock().unwrap().push_back(reply);
    }

    pub fn extraction_requests(&self) -> Vec<ExtractionRequest> {
        self.extraction_log.lock().unwrap().clone()
    }

    pub fn consolidation_requests(&self) -> Vec<ConsolidationRequest> {
        self.consolidation_log.lock().unwrap().clone()
    }
}

impl Default for ScriptedReasoning {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn extract(&self, request: &ExtractionRequest) -> Result<Value> {
        self.extraction_log.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = match &self.extractor {
            Some(f) => f(request),
            None => self
                .extractions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"operations": []}))),
        };
        reply.map_err(Error::Reasoning)
    }

    async fn consolidate(&self, request: &ConsolidationRequest) -> Result<Value> {
        self.consolidation_log.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.consolidations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"memories": []})))
            .map_err(Error::Reasoning)
    }
}

/// Store wrapper that measures per-user overlap of mutations and can fail
/// upcoming saves on demand
pub struct InstrumentedStore {
    inner: UserMemoryStore,
    delay: Duration,
    active: Mutex<HashMap<String, usize>>,
    peak: AtomicUsize,
    failing_saves: AtomicUsize,
}

impl InstrumentedStore {
    pub fn new(max_per_user: usize, delay: Duration) -> Self {
        Self {
            inner: UserMemoryStore::new(max_per_user),
            delay,
            active: Mutex::new(HashMap::new()),
            peak: AtomicUsize::new(0),
            failing_saves: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` saves with a store error
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Highest number of overlapping mutations seen for any single user
    pub fn peak_per_user(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn section<F, T>(&self, user_id: &str, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(user_id.to_string()).or_insert(0);
            *count += 1;
            self.peak.fetch_max(*count, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = op.await;
        if let Some(count) = self.active.lock().unwrap().get_mut(user_id) {
            *count -= 1;
        }
        result
    }
}

#[async_trait]
impl MemoryStore for InstrumentedStore {
    async fn get(&self, user_id: &str) -> Vec<MemoryRecord> {
        self.inner.get(user_id).await
    }

    async fn save(&self, user_id: &str, content: &str, context: &str) -> Result<()> {
        self.section(user_id, async {
            let fail = self
                .failing_saves
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(Error::Store("injected save failure".to_string()));
            }
            self.inner.save(user_id, content, context).await
        })
        .await
    }

    async fn update(&self, user_id: &str, index: usize, content: &str, context: &str) -> Result<()> {
        self.section(user_id, self.inner.update(user_id, index, content, context))
            .await
    }

    async fn forget(&self, user_id: &str, index: usize) -> Result<()> {
        self.section(user_id, self.inner.forget(user_id, index)).await
    }

    async fn forget_all(&self, user_id: &str) -> Result<()> {
        self.inner.forget_all(user_id).await
    }

    async fn touch(&self, user_id: &str) -> Result<()> {
        self.inner.touch(user_id).await
    }

    async fn touch_records(&self, user_id: &str, indices: &[usize]) -> Result<()> {
        self.inner.touch_records(user_id, indices).await
    }

    async fn replace_all(&self, user_id: &str, records: Vec<MemoryRecord>) -> Result<()> {
        self.section(user_id, self.inner.replace_all(user_id, records))
            .await
    }

    fn max_memories_per_user(&self) -> usize {
        self.inner.max_memories_per_user()
    }
}
