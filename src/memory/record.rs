//! Memory record and operation types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One remembered fact about one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// The fact itself
    pub content: String,
    /// Why it was saved / where it came from
    #[serde(default)]
    pub context: String,
    /// Set once on creation
    pub created_at: DateTime<Utc>,
    /// Refreshed on creation, update and touch
    pub last_referenced_at: DateTime<Utc>,
    /// Incremented on touch and duplicate saves
    #[serde(default)]
    pub reference_count: u32,
}

impl MemoryRecord {
    /// Create a fresh record stamped with the current time
    pub fn new(content: impl Into<String>, context: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            content: content.into(),
            context: context.into(),
            created_at: now,
            last_referenced_at: now,
            reference_count: 0,
        }
    }

    /// Record a use of this memory
    pub fn touch(&mut self) {
        self.last_referenced_at = Utc::now();
        self.reference_count = self.reference_count.saturating_add(1);
    }

    /// Case-insensitive, whitespace-trimmed content used for exact matching
    pub fn normalized_content(&self) -> String {
        normalize_content(&self.content)
    }
}

pub(crate) fn normalize_content(content: &str) -> String {
    content.trim().to_lowercase()
}

/// What a memory operation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAction {
    Save,
    Update,
    Forget,
}

impl MemoryAction {
    /// Parse an action name, ignoring case and surrounding whitespace
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "save" => Some(Self::Save),
            "update" => Some(Self::Update),
            "forget" => Some(Self::Forget),
            _ => None,
        }
    }
}

/// A validated mutation of one user's memory set.
///
/// Only constructed through parsing, which guarantees `Save` carries content
/// and `Update`/`Forget` carry an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryOperation {
    Save {
        user_id: String,
        content: String,
        context: String,
    },
    Update {
        user_id: String,
        memory_index: usize,
        content: String,
        context: String,
    },
    Forget {
        user_id: String,
        memory_index: usize,
    },
}

impl MemoryOperation {
    pub fn user_id(&self) -> &str {
        match self {
            Self::Save { user_id, .. }
            | Self::Update { user_id, .. }
            | Self::Forget { user_id, .. } => user_id,
        }
    }

    pub fn action(&self) -> MemoryAction {
        match self {
            Self::Save { .. } => MemoryAction::Save,
            Self::Update { .. } => MemoryAction::Update,
            Self::Forget { .. } => MemoryAction::Forget,
        }
    }
}
