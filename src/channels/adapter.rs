//! Channel adapter contract and a JSON-lines adapter
//!
//! Adapters push `ChannelEvent`s into the gateway's event queue and are never
//! blocked on extraction work.

use super::message::InboundMessage;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Event emitted by a channel adapter
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A chat message was received
    Message(InboundMessage),
    /// The adapter connected to its platform
    Connected { channel: String },
    /// The adapter lost its connection
    Disconnected { channel: String, reason: String },
    /// A non-fatal adapter error
    Error { channel: String, error: String },
}

/// Source of inbound chat events
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Adapter name
    fn name(&self) -> &str;

    /// Start delivering events into `event_tx`
    async fn start(&self, event_tx: mpsc::Sender<ChannelEvent>) -> Result<()>;

    /// Stop delivering events
    async fn stop(&self) -> Result<()>;
}

/// Reads one JSON-encoded `InboundMessage` per line.
///
/// Malformed lines are logged and skipped. End of input emits
/// `Disconnected`.
pub struct JsonLinesAdapter<R> {
    name: String,
    reader: Mutex<Option<R>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R> JsonLinesAdapter<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(name: &str, reader: R) -> Self {
        Self {
            name: name.to_string(),
            reader: Mutex::new(Some(reader)),
            task: Mutex::new(None),
        }
    }

    async fn pump(name: String, reader: R, event_tx: mpsc::Sender<ChannelEvent>) {
        let mut lines = reader.lines();
        let mut line_no = 0usize;
        let reason = loop {
            line_no += 1;
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event = match serde_json::from_str::<InboundMessage>(&line) {
                        Ok(message) => ChannelEvent::Message(message),
                        Err(e) => {
                            tracing::warn!(channel = %name, line = line_no, error = %e, "Skipping malformed message line");
                            ChannelEvent::Error {
                                channel: name.clone(),
                                error: format!("line {}: {}", line_no, e),
                            }
                        }
                    };
                    if event_tx.send(event).await.is_err() {
                        break "event queue closed".to_string();
                    }
                }
                Ok(None) => break "end of input".to_string(),
                Err(e) => break format!("read error: {}", e),
            }
        };

        let _ = event_tx
            .send(ChannelEvent::Disconnected {
                channel: name,
                reason,
            })
            .await;
    }
}

#[async_trait]
impl<R> ChannelAdapter for JsonLinesAdapter<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, event_tx: mpsc::Sender<ChannelEvent>) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .map_err(|_| Error::Channel("adapter state poisoned".to_string()))?
            .take()
            .ok_or_else(|| Error::Channel(format!("{} adapter already started", self.name)))?;

        let _ = event_tx
            .send(ChannelEvent::Connected {
                channel: self.name.clone(),
            })
            .await;

        let handle = tokio::spawn(Self::pump(self.name.clone(), reader, event_tx));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }

        tracing::info!(channel = %self.name, "JSON-lines adapter started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        tracing::info!(channel = %self.name, "JSON-lines adapter stopped");
        Ok(())
    }
}
