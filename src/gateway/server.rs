//! Gateway implementation

use crate::channels::{ChannelAdapter, ChannelEvent, InboundMessage};
use crate::config::SkyMemoryConfig;
use crate::coordinator::ConcurrencyCoordinator;
use crate::error::{Error, Result};
use crate::extraction::ExtractionOrchestrator;
use crate::memory::{MemoryFiles, MemoryStore, UserMemoryStore};
use crate::reasoning::{OpenAiReasoningService, ReasoningService};
use crate::window::{FlushReason, WindowScheduler};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Gateway lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GatewayState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

/// Owns the memory pipeline and feeds it from channel adapters
pub struct Gateway {
    config: SkyMemoryConfig,
    state: Arc<RwLock<GatewayState>>,
    store: Arc<UserMemoryStore>,
    coordinator: Arc<ConcurrencyCoordinator>,
    scheduler: Arc<WindowScheduler>,
    channels: Arc<RwLock<Vec<Arc<dyn ChannelAdapter>>>>,
    event_tx: mpsc::Sender<ChannelEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    connected: Arc<AtomicUsize>,
    all_disconnected: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Gateway {
    /// Wire a gateway around an existing store and reasoning backend
    pub fn new(
        config: SkyMemoryConfig,
        store: Arc<UserMemoryStore>,
        reasoning: Arc<dyn ReasoningService>,
    ) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let coordinator = Arc::new(ConcurrencyCoordinator::new(
            config.reasoning.max_concurrent_calls,
            cancel.clone(),
        ));
        let orchestrator = Arc::new(ExtractionOrchestrator::new(
            &config.memory,
            store.clone(),
            reasoning,
            coordinator.clone(),
        ));
        let scheduler = Arc::new(WindowScheduler::new(
            &config.window,
            orchestrator,
            cancel.clone(),
        ));
        let (event_tx, event_rx) = mpsc::channel(1000);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(GatewayState::Stopped)),
            store,
            coordinator,
            scheduler,
            channels: Arc::new(RwLock::new(Vec::new())),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            connected: Arc::new(AtomicUsize::new(0)),
            all_disconnected: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
            cancel,
        })
    }

    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    pub fn config(&self) -> &SkyMemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<UserMemoryStore> {
        &self.store
    }

    /// Sender adapters (or callers) push events into
    pub fn event_sender(&self) -> &mpsc::Sender<ChannelEvent> {
        &self.event_tx
    }

    /// Register an adapter; it is started with the gateway
    pub async fn add_channel(&self, adapter: Arc<dyn ChannelAdapter>) {
        self.channels.write().await.push(adapter);
    }

    /// Start the flush loop, the event processor and every channel
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Stopped {
            return Err(Error::Internal("Gateway already running".to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Internal("Gateway was stopped and cannot restart".to_string()));
        }
        *state = GatewayState::Starting;
        drop(state);

        tracing::info!("Starting SkyMemory gateway");

        let flush_loop = self
            .store
            .clone()
            .spawn_flush_loop(self.config.storage.flush_interval(), self.cancel.clone());
        self.tasks.lock().await.push(flush_loop);

        self.start_event_processor().await?;

        let channels: Vec<Arc<dyn ChannelAdapter>> = self.channels.read().await.clone();
        for channel in &channels {
            channel.start(self.event_tx.clone()).await?;
        }

        *self.state.write().await = GatewayState::Running;
        tracing::info!(
            channels = channels.len(),
            max_concurrent_calls = self.config.reasoning.max_concurrent_calls,
            "SkyMemory gateway started"
        );
        Ok(())
    }

    async fn start_event_processor(&self) -> Result<()> {
        let mut rx = self
            .event_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("event processor already started".to_string()))?;

        let scheduler = self.scheduler.clone();
        let connected = self.connected.clone();
        let all_disconnected = self.all_disconnected.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                Self::handle_event(event, &scheduler, &connected, &all_disconnected);
            }
            tracing::debug!("Event processor stopped");
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    fn handle_event(
        event: ChannelEvent,
        scheduler: &WindowScheduler,
        connected: &AtomicUsize,
        all_disconnected: &Notify,
    ) {
        match event {
            ChannelEvent::Message(message) => {
                Self::ingest_into(scheduler, message);
            }
            ChannelEvent::Connected { channel } => {
                connected.fetch_add(1, Ordering::SeqCst);
                tracing::info!(channel = %channel, "Channel connected");
            }
            ChannelEvent::Disconnected { channel, reason } => {
                tracing::info!(channel = %channel, reason = %reason, "Channel disconnected");
                let previous = connected
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .unwrap_or(0);
                if previous <= 1 {
                    all_disconnected.notify_one();
                }
            }
            ChannelEvent::Error { channel, error } => {
                tracing::warn!(channel = %channel, error = %error, "Channel error");
            }
        }
    }

    fn ingest_into(scheduler: &WindowScheduler, message: InboundMessage) -> Option<FlushReason> {
        if !message.is_memorable() {
            tracing::debug!(
                channel = %message.channel,
                sender_id = %message.sender_id,
                is_bot = message.is_bot,
                "Ignoring message"
            );
            return None;
        }
        let key = message.window_key();
        tracing::debug!(channel_id = %key, sender_id = %message.sender_id, "Buffering message");
        scheduler.push(&key, message.into_buffered())
    }

    /// Push a message straight into its window, bypassing the event queue
    pub fn ingest(&self, message: InboundMessage) -> Option<FlushReason> {
        Self::ingest_into(&self.scheduler, message)
    }

    /// Resolves once every started channel has disconnected
    pub async fn channels_closed(&self) {
        self.all_disconnected.notified().await;
    }

    /// Flush every pending window now and wait for extraction to finish
    pub async fn drain(&self) -> usize {
        let flushed = self.scheduler.drain().await;
        tracing::info!(windows = flushed, "Drained pending conversation windows");
        flushed
    }

    /// Stop channels, drop pending windows, cancel in-flight work and flush
    /// the store. A stopped gateway cannot be restarted.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Running {
            return Ok(());
        }
        *state = GatewayState::ShuttingDown;
        drop(state);

        tracing::info!("Stopping SkyMemory gateway");

        let channels: Vec<Arc<dyn ChannelAdapter>> = self.channels.read().await.clone();
        for channel in channels {
            if let Err(e) = channel.stop().await {
                tracing::warn!(channel = %channel.name(), error = %e, "Failed to stop channel");
            }
        }

        // Cancels the shared token: timers, lock waits and reasoning calls unwind
        self.scheduler.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        let written = self.store.flush().await?;
        *self.state.write().await = GatewayState::Stopped;
        tracing::info!(flushed_users = written, "SkyMemory gateway stopped");
        Ok(())
    }

    pub async fn status(&self) -> GatewayStatus {
        let channels = self
            .channels
            .read()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        GatewayStatus {
            state: self.state().await,
            channels,
            pending_windows: self.scheduler.pending_channels(),
            tracked_users: self.coordinator.tracked_users(),
            dirty_users: self.store.dirty_count(),
            max_memories_per_user: self.store.max_memories_per_user(),
        }
    }
}

/// Gateway status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub state: GatewayState,
    pub channels: Vec<String>,
    pub pending_windows: usize,
    /// Users with a lock entry
    pub tracked_users: usize,
    /// Users with unflushed memory changes
    pub dirty_users: usize,
    pub max_memories_per_user: usize,
}

/// Builder for Gateway
pub struct GatewayBuilder {
    config: SkyMemoryConfig,
    store: Option<Arc<UserMemoryStore>>,
    reasoning: Option<Arc<dyn ReasoningService>>,
}

impl GatewayBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: SkyMemoryConfig::default(),
            store: None,
            reasoning: None,
        }
    }

    pub fn config(mut self, config: SkyMemoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this store instead of opening `storage.memory_dir`
    pub fn store(mut self, store: Arc<UserMemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this backend instead of the configured chat-completions endpoint
    pub fn reasoning(mut self, reasoning: Arc<dyn ReasoningService>) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    /// Build the gateway, opening the memory directory if no store was given
    pub async fn build(self) -> Result<Gateway> {
        let store = match self.store {
            Some(store) => store,
            None => {
                let files = MemoryFiles::open(&self.config.storage.memory_dir).await?;
                tracing::info!(dir = %files.dir().display(), "Opened memory directory");
                Arc::new(UserMemoryStore::with_files(
                    self.config.memory.max_memories_per_user,
                    files,
                ))
            }
        };
        let reasoning = match self.reasoning {
            Some(reasoning) => reasoning,
            None => Arc::new(OpenAiReasoningService::new(&self.config.reasoning)?),
        };
        Gateway::new(self.config, store, reasoning)
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::JsonLinesAdapter;
    use crate::testing::ScriptedReasoning;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::BufReader;

    fn fast_config(dir: &TempDir) -> SkyMemoryConfig {
        let mut config = SkyMemoryConfig::default();
        config.window.conversation_window_timeout_secs = 1;
        config.window.max_window_messages = 3;
        config.storage.memory_dir = dir.path().to_path_buf();
        config.storage.flush_interval_secs = 3600;
        config
    }

    fn saving_reasoning() -> Arc<ScriptedReasoning> {
        Arc::new(ScriptedReasoning::with_extractor(|request| {
            let ops: Vec<_> = request
                .messages
                .iter()
                .map(|m| json!({"user_id": m.author_id, "action": "save", "content": m.content}))
                .collect();
            Ok(json!({"operations": ops}))
        }))
    }

    async fn gateway(dir: &TempDir, reasoning: Arc<ScriptedReasoning>) -> Gateway {
        GatewayBuilder::new()
            .config(fast_config(dir))
            .reasoning(reasoning)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir, saving_reasoning()).await;
        assert_eq!(gateway.state().await, GatewayState::Stopped);

        gateway.start().await.unwrap();
        assert_eq!(gateway.state().await, GatewayState::Running);
        assert!(gateway.start().await.is_err());

        gateway.stop().await.unwrap();
        assert_eq!(gateway.state().await, GatewayState::Stopped);
        assert!(gateway.start().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config(&dir);
        config.memory.max_memories_per_user = 0;
        let result = GatewayBuilder::new()
            .config(config)
            .reasoning(saving_reasoning())
            .build()
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_message_cap_reaches_store_and_disk() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir, saving_reasoning()).await;
        gateway.start().await.unwrap();

        let tx = gateway.event_sender().clone();
        for content in ["Adopted a cat named Miso", "Works night shifts", "Learning Rust"] {
            tx.send(ChannelEvent::Message(InboundMessage::new(
                "discord", "100", "general", content,
            )))
            .await
            .unwrap();
        }

        let mut saved = 0;
        for _ in 0..100 {
            saved = gateway.store().get("100").await.len();
            if saved == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(saved, 3);

        gateway.stop().await.unwrap();
        assert!(dir.path().join("100.json").exists());
    }

    #[tokio::test]
    async fn test_bots_and_blank_messages_ignored() {
        let dir = TempDir::new().unwrap();
        let gateway = gateway(&dir, saving_reasoning()).await;

        let mut bot = InboundMessage::new("discord", "999", "general", "beep");
        bot.is_bot = true;
        assert_eq!(gateway.ingest(bot), None);
        assert_eq!(
            gateway.ingest(InboundMessage::new("discord", "100", "general", "  ")),
            None
        );
        assert_eq!(gateway.status().await.pending_windows, 0);

        gateway.ingest(InboundMessage::new("discord", "100", "general", "hello"));
        assert_eq!(gateway.status().await.pending_windows, 1);
    }

    #[tokio::test]
    async fn test_stop_drops_pending_windows() {
        let dir = TempDir::new().unwrap();
        let reasoning = saving_reasoning();
        let gateway = gateway(&dir, reasoning.clone()).await;
        gateway.start().await.unwrap();

        gateway.ingest(InboundMessage::new("discord", "100", "general", "half a thought"));
        gateway.stop().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(reasoning.extraction_requests().is_empty());
        assert!(gateway.store().get("100").await.is_empty());
    }

    #[tokio::test]
    async fn test_json_lines_channel_then_drain() {
        let dir = TempDir::new().unwrap();
        let mut config = fast_config(&dir);
        config.window.conversation_window_timeout_secs = 600;
        let gateway = GatewayBuilder::new()
            .config(config)
            .reasoning(saving_reasoning())
            .build()
            .await
            .unwrap();

        let input = concat!(
            r#"{"chat_id": "general", "sender_id": "100", "content": "I moved to Oslo"}"#,
            "\n",
            r#"{"chat_id": "random", "sender_id": "200", "content": "Started running"}"#,
            "\n",
        );
        gateway
            .add_channel(Arc::new(JsonLinesAdapter::new(
                "stdin",
                BufReader::new(input.as_bytes()),
            )))
            .await;
        gateway.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), gateway.channels_closed())
            .await
            .unwrap();
        assert_eq!(gateway.drain().await, 2);

        assert_eq!(gateway.store().get("100").await[0].content, "I moved to Oslo");
        assert_eq!(gateway.store().get("200").await[0].content, "Started running");
        gateway.stop().await.unwrap();
    }
}
