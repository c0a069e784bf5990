//! Prompt rendering for extraction and consolidation calls

use super::{ConsolidationRequest, ExtractionRequest};
use crate::memory::MemoryRecord;
use serde::Serialize;
use std::fmt::Write;

const EXTRACTION_SYSTEM: &str = "You maintain long-term memories about the people in a group chat. \
Read the conversation and decide which durable facts about each participant should be saved, \
which existing memories should be updated because they are outdated or corrected, and which \
should be forgotten because a participant asked or they are no longer true. Ignore small talk \
and anything only true for the moment. Only reference the participant ids listed. \
Respond with JSON: {\"operations\": [{\"user_id\": \"...\", \"action\": \"save|update|forget\", \
\"content\": \"...\", \"context\": \"...\", \"memory_index\": 0}]}. \
`memory_index` refers to the bracketed index of an existing memory and is required for update \
and forget. `content` is required for save and update. Return an empty list when nothing is worth keeping.";

const CONSOLIDATION_SYSTEM: &str = "You compress a person's memory list. Merge related facts, \
drop redundant ones, and keep distinctive details and corrections. \
Respond with JSON: {\"memories\": [{\"content\": \"...\", \"context\": \"...\"}]}.";

/// Chat-completions message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    fn system(content: &str) -> Self {
        Self {
            role: "system",
            content: content.to_string(),
        }
    }

    fn user(content: String) -> Self {
        Self {
            role: "user",
            content,
        }
    }
}

/// Render `<display name> (<user id>): <content>` lines
pub fn render_transcript(request: &ExtractionRequest) -> String {
    let mut out = String::new();
    for message in &request.messages {
        let _ = writeln!(
            out,
            "{} ({}): {}",
            message.author_display_name, message.author_id, message.content
        );
    }
    out
}

/// Render `[<index>] <content> (context: <context>)` lines
pub fn render_memories(records: &[MemoryRecord]) -> String {
    if records.is_empty() {
        return "(none)\n".to_string();
    }
    let mut out = String::new();
    for (index, record) in records.iter().enumerate() {
        if record.context.is_empty() {
            let _ = writeln!(out, "[{}] {}", index, record.content);
        } else {
            let _ = writeln!(
                out,
                "[{}] {} (context: {})",
                index, record.content, record.context
            );
        }
    }
    out
}

pub fn extraction_messages(request: &ExtractionRequest) -> Vec<ChatMessage> {
    let mut body = String::from("Participants and their current memories:\n");
    for participant in &request.participants {
        let _ = writeln!(
            body,
            "\n## {} (id: {})",
            participant.display_name, participant.user_id
        );
        body.push_str(&render_memories(&participant.memories));
    }
    body.push_str("\nConversation:\n");
    body.push_str(&render_transcript(request));
    let _ = write!(
        body,
        "\nReturn at most {} operations.",
        request.max_operations
    );

    vec![ChatMessage::system(EXTRACTION_SYSTEM), ChatMessage::user(body)]
}

pub fn consolidation_messages(request: &ConsolidationRequest) -> Vec<ChatMessage> {
    let mut body = format!(
        "Memories for user {} ({} entries):\n",
        request.user_id,
        request.records.len()
    );
    body.push_str(&render_memories(&request.records));
    let _ = write!(
        body,
        "\nRewrite this list as at most {} memories.",
        request.target_count
    );

    vec![
        ChatMessage::system(CONSOLIDATION_SYSTEM),
        ChatMessage::user(body),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::BufferedMessage;
    use crate::reasoning::Participant;
    use uuid::Uuid;

    fn request() -> ExtractionRequest {
        ExtractionRequest {
            window_id: Uuid::new_v4(),
            messages: vec![
                BufferedMessage::new("100", "Alice", "I just adopted a cat"),
                BufferedMessage::new("200", "Bob", "nice, what's its name?"),
            ],
            participants: vec![
                Participant {
                    user_id: "100".to_string(),
                    display_name: "Alice".to_string(),
                    memories: vec![MemoryRecord::new("Lives in Oslo", "mentioned moving")],
                },
                Participant {
                    user_id: "200".to_string(),
                    display_name: "Bob".to_string(),
                    memories: Vec::new(),
                },
            ],
            max_operations: 10,
        }
    }

    #[test]
    fn test_render_transcript() {
        let transcript = render_transcript(&request());
        assert_eq!(
            transcript,
            "Alice (100): I just adopted a cat\nBob (200): nice, what's its name?\n"
        );
    }

    #[test]
    fn test_render_memories_indexed() {
        let records = vec![
            MemoryRecord::new("Lives in Oslo", "mentioned moving"),
            MemoryRecord::new("Plays chess", ""),
        ];
        assert_eq!(
            render_memories(&records),
            "[0] Lives in Oslo (context: mentioned moving)\n[1] Plays chess\n"
        );
        assert_eq!(render_memories(&[]), "(none)\n");
    }

    #[test]
    fn test_extraction_messages_include_everything() {
        let messages = extraction_messages(&request());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");

        let body = &messages[1].content;
        assert!(body.contains("## Alice (id: 100)"));
        assert!(body.contains("[0] Lives in Oslo"));
        assert!(body.contains("## Bob (id: 200)\n(none)"));
        assert!(body.contains("Bob (200): nice"));
        assert!(body.ends_with("at most 10 operations."));
    }

    #[test]
    fn test_consolidation_messages() {
        let messages = consolidation_messages(&ConsolidationRequest {
            user_id: "100".to_string(),
            records: vec![
                MemoryRecord::new("Likes cats", ""),
                MemoryRecord::new("Owns a cat", ""),
            ],
            target_count: 1,
        });
        let body = &messages[1].content;
        assert!(body.starts_with("Memories for user 100 (2 entries)"));
        assert!(body.contains("[1] Owns a cat"));
        assert!(body.ends_with("at most 1 memories."));
    }
}
