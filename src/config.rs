//! Orchestrator configuration.
//!
//! Loaded from a YAML file; a missing file yields defaults so embedding
//! hosts can run with zero configuration.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Directory holding one JSONL journal per channel.
    #[serde(default)]
    pub journals_dir: Option<PathBuf>,
    /// Sender identities allowed to submit. Empty means open access.
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

impl Config {
    /// Load configuration from a YAML file. A missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }

    /// Effective journals directory.
    pub fn journals_dir(&self) -> PathBuf {
        self.journals_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_JOURNALS_DIR))
    }
}

/// Default journals directory (relative to the working directory).
pub const DEFAULT_JOURNALS_DIR: &str = "journals";

// ============================================================================
// Queue
// ============================================================================

/// Per-channel pending queue limits.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued requests while a turn is in flight. When full, the
    /// oldest queued request is evicted to make room.
    #[serde(default = "QueueConfig::default_max_pending")]
    pub max_pending: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: Self::default_max_pending(),
        }
    }
}

impl QueueConfig {
    fn default_max_pending() -> usize {
        8
    }
}

// ============================================================================
// Rate Limiting
// ============================================================================

/// Windowed request limits, per sender and global.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "RateLimitConfig::default_per_sender_max")]
    pub per_sender_max: u32,
    #[serde(default = "RateLimitConfig::default_global_max")]
    pub global_max: u32,
    #[serde(default = "RateLimitConfig::default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_sender_max: Self::default_per_sender_max(),
            global_max: Self::default_global_max(),
            window_secs: Self::default_window_secs(),
        }
    }
}

impl RateLimitConfig {
    fn default_per_sender_max() -> u32 {
        10
    }

    fn default_global_max() -> u32 {
        60
    }

    fn default_window_secs() -> u64 {
        60
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

// ============================================================================
// Turn Execution
// ============================================================================

/// Timeout and live-edit pacing for turn execution.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnConfig {
    /// Upper bound on one turn's stream consumption.
    #[serde(default = "TurnConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Minimum interval between outbound incremental edits.
    #[serde(default = "TurnConfig::default_edit_interval_ms")]
    pub edit_interval_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout_secs(),
            edit_interval_ms: Self::default_edit_interval_ms(),
        }
    }
}

impl TurnConfig {
    fn default_timeout_secs() -> u64 {
        120
    }

    fn default_edit_interval_ms() -> u64 {
        500
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn edit_interval(&self) -> Duration {
        Duration::from_millis(self.edit_interval_ms)
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Retry configuration for transient model transport failures.
///
/// Uses exponential backoff with jitter to avoid thundering herd.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u8,
    /// Initial delay before the first retry in milliseconds.
    #[serde(default = "RetryConfig::default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "RetryConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            initial_delay_ms: Self::default_initial_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    fn default_max_retries() -> u8 {
        3
    }

    fn default_initial_delay_ms() -> u64 {
        1000
    }

    fn default_max_delay_ms() -> u64 {
        30000
    }

    /// Calculate the delay for a given attempt using exponential backoff
    /// with jitter.
    ///
    /// Delay = min(initial * 2^attempt, max) * (0.8 + random(0, 0.4))
    pub fn delay_for_attempt(&self, attempt: u8) -> Duration {
        let base_delay = self.initial_delay_ms.saturating_mul(1 << attempt.min(10));
        let capped_delay = base_delay.min(self.max_delay_ms);

        let jitter_factor = 0.8 + (rand::random::<f64>() * 0.4);
        let jittered_delay = (capped_delay as f64 * jitter_factor) as u64;

        Duration::from_millis(jittered_delay)
    }
}

// ============================================================================
// Context
// ============================================================================

/// History budget and compaction thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    /// Token budget for older turns in a prompt (the recent tail is always
    /// carried verbatim).
    #[serde(default = "ContextConfig::default_max_history_tokens")]
    pub max_history_tokens: u32,
    /// Turns always retained verbatim through trimming and compaction.
    #[serde(default = "ContextConfig::default_keep_recent")]
    pub keep_recent: usize,
    /// Active turn count that triggers history compaction. Independent from
    /// the token budget above; the two are never merged.
    #[serde(default = "ContextConfig::default_compaction_ceiling")]
    pub compaction_ceiling: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_history_tokens: Self::default_max_history_tokens(),
            keep_recent: Self::default_keep_recent(),
            compaction_ceiling: Self::default_compaction_ceiling(),
        }
    }
}

impl ContextConfig {
    fn default_max_history_tokens() -> u32 {
        8192
    }

    fn default_keep_recent() -> usize {
        8
    }

    fn default_compaction_ceiling() -> usize {
        20
    }
}

// ============================================================================
// Dedup
// ============================================================================

/// TTL cache sizing for idempotency-key deduplication.
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "DedupConfig::default_ttl_secs")]
    pub ttl_secs: u64,
    /// Cache is pruned when it grows past this many entries.
    #[serde(default = "DedupConfig::default_max_entries")]
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: Self::default_ttl_secs(),
            max_entries: Self::default_max_entries(),
        }
    }
}

impl DedupConfig {
    fn default_ttl_secs() -> u64 {
        300
    }

    fn default_max_entries() -> usize {
        4096
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}
