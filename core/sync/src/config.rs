//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use tideline_common::{ConflictPolicy, Error, Priority, Result};

use crate::retry::RetryConfig;

/// How enqueue notifications are turned into sync passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TriggerMode {
    /// Collapse a burst of enqueues into one pass fired `window` after the last one.
    Debounce { window: Duration },
    /// Run at most one pass per `interval`; extra triggers wait for the next slot.
    Throttle { interval: Duration },
}

impl Default for TriggerMode {
    fn default() -> Self {
        Self::Debounce {
            window: Duration::from_millis(100),
        }
    }
}

/// Configuration for the sync engine and its scheduler.
///
/// Set once at startup and may be replaced live through
/// [`SyncEngine::update_config`](crate::SyncEngine::update_config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the auto-sync timer. `None` disables it.
    pub auto_sync_interval: Option<Duration>,
    /// Retries granted to an item after its first failed attempt.
    pub max_retry_count: u32,
    /// Maximum number of items per batch.
    pub batch_size: usize,
    /// How often the connectivity probe is polled.
    pub network_check_interval: Duration,
    /// Debounce or throttle strategy for enqueue triggers.
    pub trigger_mode: TriggerMode,
    /// Upper bound on a single transmission.
    pub sync_timeout: Duration,
    /// Base delay for exponential backoff.
    pub retry_delay: Duration,
    /// Cap for exponential backoff.
    pub max_retry_delay: Duration,
    /// Whether to add +/-25% jitter to backoff delays.
    pub retry_jitter: bool,
    /// Conflict resolution policy.
    pub conflict_resolution: ConflictPolicy,
    /// Tables whose mutations default to high priority.
    pub priority_tables: Vec<String>,
    /// Number of pass outcomes kept in the sync history.
    pub history_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_interval: Some(Duration::from_secs(30)),
            max_retry_count: 3,
            batch_size: 50,
            network_check_interval: Duration::from_secs(10),
            trigger_mode: TriggerMode::default(),
            sync_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            retry_jitter: true,
            conflict_resolution: ConflictPolicy::default(),
            priority_tables: Vec::new(),
            history_limit: 50,
        }
    }
}

impl SyncConfig {
    /// Set the auto-sync period (`None` disables the timer).
    pub fn with_auto_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.auto_sync_interval = interval;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the connectivity polling period.
    pub fn with_network_check_interval(mut self, interval: Duration) -> Self {
        self.network_check_interval = interval;
        self
    }

    /// Set the trigger strategy.
    pub fn with_trigger_mode(mut self, mode: TriggerMode) -> Self {
        self.trigger_mode = mode;
        self
    }

    /// Set the per-pass timeout.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Set backoff base and cap.
    pub fn with_retry_delay(mut self, base: Duration, max: Duration) -> Self {
        self.retry_delay = base;
        self.max_retry_delay = max;
        self
    }

    /// Enable or disable jitter.
    pub fn with_retry_jitter(mut self, jitter: bool) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Set the conflict policy.
    pub fn with_conflict_resolution(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_resolution = policy;
        self
    }

    /// Set the tables promoted to high priority.
    pub fn with_priority_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Set the history bound.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Backoff settings derived from this configuration.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retry_count)
            .with_initial_delay(self.retry_delay)
            .with_max_delay(self.max_retry_delay)
            .with_jitter(self.retry_jitter)
    }

    /// Priority for a mutation on `table` when the caller did not pick one.
    pub fn priority_for(&self, table: &str, explicit: Option<Priority>) -> Priority {
        explicit.unwrap_or_else(|| {
            if self.priority_tables.iter().any(|t| t == table) {
                Priority::HIGH
            } else {
                Priority::NORMAL
            }
        })
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    /// - Zero batch size
    /// - Zero sync timeout
    /// - Zero history limit
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.sync_timeout.is_zero() {
            return Err(Error::InvalidInput("sync_timeout must be non-zero".to_string()));
        }
        if self.history_limit == 0 {
            return Err(Error::InvalidInput("history_limit must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(Error::Io)?;
        Self::from_json(&content)
    }

    /// Write the configuration to a file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json()?).await.map_err(Error::Io)
    }
}
