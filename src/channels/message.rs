//! Message types crossing the chat-platform boundary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message received from a chat-platform adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform name (e.g. "discord")
    #[serde(default = "default_platform")]
    pub channel: String,
    /// Conversation the message belongs to; one window per chat id
    pub chat_id: String,
    /// Author's user id
    pub sender_id: String,
    /// Author's display name
    #[serde(default)]
    pub sender_name: String,
    /// Message text
    pub content: String,
    /// When the message was sent
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Whether the author is a bot
    #[serde(default)]
    pub is_bot: bool,
}

fn default_platform() -> String {
    "discord".to_string()
}

impl InboundMessage {
    /// Create a new inbound message stamped with the current time
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_id.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            is_bot: false,
        }
    }

    /// Set the author's display name
    pub fn sender_name(mut self, name: &str) -> Self {
        self.sender_name = name.to_string();
        self
    }

    /// Whether this message should be buffered for memory extraction
    pub fn is_memorable(&self) -> bool {
        !self.is_bot && !self.content.trim().is_empty() && !self.sender_id.is_empty()
    }

    /// Window key: platform-qualified chat id
    pub fn window_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }

    /// Convert into the immutable buffered form
    pub fn into_buffered(self) -> BufferedMessage {
        let author_display_name = if self.sender_name.is_empty() {
            self.sender_id.clone()
        } else {
            self.sender_name
        };
        BufferedMessage {
            author_id: self.sender_id,
            author_display_name,
            content: self.content,
            timestamp: self.timestamp,
        }
    }
}

/// A message held in a conversation window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub author_id: String,
    pub author_display_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl BufferedMessage {
    pub fn new(author_id: &str, author_display_name: &str, content: &str) -> Self {
        Self {
            author_id: author_id.to_string(),
            author_display_name: author_display_name.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }
}
