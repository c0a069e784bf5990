//! Debounce scheduler for per-channel conversation windows
//!
//! Each channel is either `Idle` (no window) or `Buffering`:
//!
//! ```text
//!   Idle ──message──▶ Buffering ──message (under caps)──▶ Buffering (timer reset)
//!                        │
//!                        ├──message hits count/duration cap──▶ flush ──▶ Idle
//!                        └──debounce timer fires────────────▶ flush ──▶ Idle
//! ```
//!
//! Flushes run as background tasks so pushing never waits on extraction.
//! A per-channel gate keeps at most one flush per channel in flight. On
//! shutdown, pending windows are dropped without flushing.

use crate::channels::BufferedMessage;
use crate::config::WindowConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Consumer of flushed windows (the extraction pipeline)
#[async_trait]
pub trait WindowSink: Send + Sync {
    async fn flush_window(&self, window: FlushedWindow);
}

/// Why a window was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// No message arrived for the debounce timeout
    Inactivity,
    /// The window reached the message cap
    MessageLimit,
    /// The window stayed open for the maximum duration
    DurationLimit,
    /// Input ended and pending windows were flushed early
    Drained,
}

/// Per-channel scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Idle,
    Buffering,
}

/// A closed window handed to the sink
#[derive(Debug, Clone)]
pub struct FlushedWindow {
    pub id: Uuid,
    pub channel_id: String,
    pub messages: Vec<BufferedMessage>,
    pub first_message_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub reason: FlushReason,
}

struct ChannelWindow {
    messages: Vec<BufferedMessage>,
    first_message_at: DateTime<Utc>,
    last_message_at: DateTime<Utc>,
    opened_at: Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl ChannelWindow {
    fn close(mut self, channel_id: &str, reason: FlushReason) -> FlushedWindow {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        FlushedWindow {
            id: Uuid::new_v4(),
            channel_id: channel_id.to_string(),
            messages: self.messages,
            first_message_at: self.first_message_at,
            last_message_at: self.last_message_at,
            reason,
        }
    }
}

struct SchedulerInner {
    timeout: Duration,
    max_messages: usize,
    max_duration: Duration,
    windows: Mutex<HashMap<String, ChannelWindow>>,
    flush_gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    sink: Arc<dyn WindowSink>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl SchedulerInner {
    fn windows(&self) -> MutexGuard<'_, HashMap<String, ChannelWindow>> {
        // A panic while holding this lock leaves plain data behind; keep serving.
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flush_gate(&self, channel_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.flush_gates
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn arm_timer(self: &Arc<Self>, channel_id: &str, generation: u64) -> JoinHandle<()> {
        let inner = self.clone();
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(inner.timeout) => inner.on_timer(&channel_id, generation),
            }
        })
    }

    fn on_timer(self: &Arc<Self>, channel_id: &str, generation: u64) {
        let window = {
            let mut windows = self.windows();
            // A newer message re-armed the timer; this firing is stale
            let current = windows.get(channel_id).map(|w| w.generation) == Some(generation);
            if current {
                windows.remove(channel_id)
            } else {
                None
            }
        };

        if let Some(mut window) = window {
            // This is the timer task itself; nothing to abort
            window.timer = None;
            self.dispatch(window.close(channel_id, FlushReason::Inactivity));
        }
    }

    fn dispatch(self: &Arc<Self>, window: FlushedWindow) {
        tracing::debug!(
            channel_id = %window.channel_id,
            window_id = %window.id,
            messages = window.messages.len(),
            reason = ?window.reason,
            "Flushing conversation window"
        );

        let inner = self.clone();
        self.tasks.spawn(async move {
            let channel_id = window.channel_id.clone();
            let gate = inner.flush_gate(&channel_id);
            let guard = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => {
                    tracing::debug!(window_id = %window.id, "Dropping window queued behind shutdown");
                    None
                }
                guard = gate.clone().lock_owned() => Some(guard),
            };
            if let Some(_guard) = guard {
                inner.sink.flush_window(window).await;
            }
            drop(gate);
            inner.release_gate(&channel_id);
        });
    }

    /// Forget a channel's gate once no flush holds or waits on it
    fn release_gate(&self, channel_id: &str) {
        self.flush_gates
            .remove_if(channel_id, |_, gate| Arc::strong_count(gate) == 1);
    }
}

/// Per-channel debounce scheduler
pub struct WindowScheduler {
    inner: Arc<SchedulerInner>,
}

impl WindowScheduler {
    /// Create a scheduler delivering flushed windows to `sink`
    pub fn new(config: &WindowConfig, sink: Arc<dyn WindowSink>, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                timeout: config.conversation_window_timeout(),
                max_messages: config.max_window_messages.max(1),
                max_duration: config.max_window_duration(),
                windows: Mutex::new(HashMap::new()),
                flush_gates: DashMap::new(),
                sink,
                cancel,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Append a message to a channel's window.
    ///
    /// Returns the flush reason when this message closed the window.
    pub fn push(&self, channel_id: &str, message: BufferedMessage) -> Option<FlushReason> {
        if self.inner.cancel.is_cancelled() {
            tracing::debug!(channel_id, "Scheduler shut down, dropping message");
            return None;
        }

        let closed = {
            let mut windows = self.inner.windows();
            let window = windows
                .entry(channel_id.to_string())
                .or_insert_with(|| ChannelWindow {
                    messages: Vec::new(),
                    first_message_at: message.timestamp,
                    last_message_at: message.timestamp,
                    opened_at: Instant::now(),
                    generation: 0,
                    timer: None,
                });

            window.last_message_at = message.timestamp;
            window.messages.push(message);

            let reason = if window.messages.len() >= self.inner.max_messages {
                Some(FlushReason::MessageLimit)
            } else if window.opened_at.elapsed() >= self.inner.max_duration {
                Some(FlushReason::DurationLimit)
            } else {
                None
            };

            match reason {
                Some(reason) => windows
                    .remove(channel_id)
                    .map(|w| w.close(channel_id, reason)),
                None => {
                    if let Some(timer) = window.timer.take() {
                        timer.abort();
                    }
                    window.generation += 1;
                    window.timer = Some(self.inner.arm_timer(channel_id, window.generation));
                    None
                }
            }
        };

        closed.map(|window| {
            let reason = window.reason;
            self.inner.dispatch(window);
            reason
        })
    }

    /// Current state of a channel
    pub fn state(&self, channel_id: &str) -> WindowState {
        if self.inner.windows().contains_key(channel_id) {
            WindowState::Buffering
        } else {
            WindowState::Idle
        }
    }

    /// Messages buffered for a channel
    pub fn buffered_len(&self, channel_id: &str) -> usize {
        self.inner
            .windows()
            .get(channel_id)
            .map(|w| w.messages.len())
            .unwrap_or(0)
    }

    /// Channels currently buffering
    pub fn pending_channels(&self) -> usize {
        self.inner.windows().len()
    }

    /// Channels with a flush gate currently allocated
    pub fn tracked_gates(&self) -> usize {
        self.inner.flush_gates.len()
    }

    /// Flush every pending window now and wait for all flushes to finish.
    /// Returns the number of windows flushed.
    pub async fn drain(&self) -> usize {
        let pending: Vec<(String, ChannelWindow)> = self.inner.windows().drain().collect();
        let count = pending.len();
        for (channel_id, window) in pending {
            self.inner.dispatch(window.close(&channel_id, FlushReason::Drained));
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
        count
    }

    /// Cancel all timers, drop pending windows, and wait for in-flight
    /// flushes to unwind. Returns the number of windows dropped.
    pub async fn shutdown(&self) -> usize {
        self.inner.cancel.cancel();

        let dropped: Vec<ChannelWindow> = {
            let mut windows = self.inner.windows();
            windows.drain().map(|(_, w)| w).collect()
        };
        for window in &dropped {
            if let Some(timer) = &window.timer {
                timer.abort();
            }
        }
        if !dropped.is_empty() {
            let messages: usize = dropped.iter().map(|w| w.messages.len()).sum();
            tracing::info!(
                windows = dropped.len(),
                messages,
                "Dropped pending conversation windows on shutdown"
            );
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        dropped.len()
    }
}
