//! Decoding reasoning-service payloads into typed operations
//!
//! Individual malformed elements are dropped with a debug log; only a payload
//! of the wrong overall shape is an error.

use crate::error::{Error, Result};
use crate::memory::{MemoryAction, MemoryOperation, MemoryRecord};
use serde_json::Value;
use std::collections::HashSet;

/// Parse an extraction payload, keeping only operations whose user id is in
/// `participants`
pub fn parse_operations(payload: &Value, participants: &HashSet<String>) -> Result<Vec<MemoryOperation>> {
    let items = list_field(payload, "operations").ok_or_else(|| {
        Error::Parse("extraction reply has no operations list".to_string())
    })?;

    let mut operations = Vec::with_capacity(items.len());
    for item in items {
        match parse_operation(item) {
            Some(op) if participants.contains(op.user_id()) => operations.push(op),
            Some(op) => {
                tracing::debug!(user_id = %op.user_id(), "Dropping operation for non-participant");
            }
            None => tracing::debug!(operation = %item, "Dropping malformed operation"),
        }
    }
    Ok(operations)
}

/// Parse one operation element; `None` when a required field is missing
pub fn parse_operation(item: &Value) -> Option<MemoryOperation> {
    let user_id = field(item, "user_id", "userId").and_then(id_value)?;
    let action = field(item, "action", "action")
        .and_then(Value::as_str)
        .and_then(MemoryAction::parse)?;
    let content = field(item, "content", "content").and_then(text_value);
    let context = field(item, "context", "context")
        .and_then(text_value)
        .unwrap_or_default();
    let index = field(item, "memory_index", "memoryIndex").and_then(index_value);

    match action {
        MemoryAction::Save => Some(MemoryOperation::Save {
            user_id,
            content: content?,
            context,
        }),
        MemoryAction::Update => Some(MemoryOperation::Update {
            user_id,
            memory_index: index?,
            content: content?,
            context,
        }),
        MemoryAction::Forget => Some(MemoryOperation::Forget {
            user_id,
            memory_index: index?,
        }),
    }
}

/// Parse a consolidation payload into fresh records.
///
/// Returns `None` when nothing usable came back. Longer results are cut to
/// `target_count`.
pub fn parse_consolidated(payload: &Value, target_count: usize) -> Option<Vec<MemoryRecord>> {
    let items = list_field(payload, "memories")?;
    let records: Vec<MemoryRecord> = items
        .iter()
        .filter_map(|item| {
            let content = item.get("content").and_then(text_value)?;
            let context = item.get("context").and_then(text_value).unwrap_or_default();
            Some(MemoryRecord::new(content, context))
        })
        .take(target_count)
        .collect();

    if records.is_empty() {
        None
    } else {
        Some(records)
    }
}

fn list_field<'a>(payload: &'a Value, key: &str) -> Option<&'a Vec<Value>> {
    match payload {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get(key).and_then(Value::as_array),
        _ => None,
    }
}

fn field<'a>(item: &'a Value, snake: &str, camel: &str) -> Option<&'a Value> {
    item.get(snake)
        .or_else(|| item.get(camel))
        .filter(|v| !v.is_null())
}

fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => n.as_u64().map(|n| n.to_string()),
        _ => None,
    }
}

fn text_value(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn index_value(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
