//! SkyMemory configuration management

use crate::error::{Error, Result};
use crate::memory::DEFAULT_DUPLICATE_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main SkyMemory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkyMemoryConfig {
    /// Conversation window configuration
    #[serde(default)]
    pub window: WindowConfig,

    /// Memory store limits
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Reasoning service configuration
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SkyMemoryConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make windowing or the store degenerate
    pub fn validate(&self) -> Result<()> {
        if self.window.conversation_window_timeout_secs == 0 {
            return Err(Error::Config(
                "window.conversation_window_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.window.max_window_messages == 0 {
            return Err(Error::Config(
                "window.max_window_messages must be > 0".to_string(),
            ));
        }
        if self.window.max_window_duration_secs == 0 {
            return Err(Error::Config(
                "window.max_window_duration_secs must be > 0".to_string(),
            ));
        }
        if self.memory.max_memories_per_user == 0 {
            return Err(Error::Config(
                "memory.max_memories_per_user must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.memory.dedup_threshold) {
            return Err(Error::Config(
                "memory.dedup_threshold must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.reasoning.max_concurrent_calls == 0 {
            return Err(Error::Config(
                "reasoning.max_concurrent_calls must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Conversation window (debounce) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Quiet period after the last message before a window is flushed
    pub conversation_window_timeout_secs: u64,

    /// Flush immediately once a window holds this many messages
    pub max_window_messages: usize,

    /// Flush immediately once a window has been open this long
    pub max_window_duration_secs: u64,
}

impl WindowConfig {
    pub fn conversation_window_timeout(&self) -> Duration {
        Duration::from_secs(self.conversation_window_timeout_secs)
    }

    pub fn max_window_duration(&self) -> Duration {
        Duration::from_secs(self.max_window_duration_secs)
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            conversation_window_timeout_secs: 30,
            max_window_messages: 50,
            max_window_duration_secs: 300,
        }
    }
}

/// Memory store limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Hard cap on records held for one user
    pub max_memories_per_user: usize,

    /// Operations kept from one extraction response
    pub max_memories_per_extraction: usize,

    /// Jaccard similarity at which a new fact counts as a duplicate
    pub dedup_threshold: f64,

    /// Size a consolidated set is compressed to (0 = 3/4 of the per-user cap)
    pub consolidation_target: usize,
}

impl MemoryConfig {
    /// Effective consolidation target, always in `1..=max_memories_per_user`
    pub fn consolidation_target(&self) -> usize {
        let target = if self.consolidation_target == 0 {
            self.max_memories_per_user * 3 / 4
        } else {
            self.consolidation_target
        };
        target.clamp(1, self.max_memories_per_user.max(1))
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memories_per_user: 30,
            max_memories_per_extraction: 10,
            dedup_threshold: DEFAULT_DUPLICATE_THRESHOLD,
            consolidation_target: 0,
        }
    }
}

/// Reasoning service (OpenAI-compatible chat completions) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    /// API base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum reasoning calls in flight across all channels
    pub max_concurrent_calls: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 45,
            max_concurrent_calls: 4,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one JSON file per user
    pub memory_dir: PathBuf,

    /// Seconds between batched flushes of dirty users
    pub flush_interval_secs: u64,
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs_next::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("skymemory");

        Self {
            memory_dir: base.join("memories"),
            flush_interval_secs: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable output
    pub json: bool,
}
