use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the queue processor.
///
/// Use [`ProcessorConfig::builder()`] for ergonomic construction,
/// [`ProcessorConfig::from_env()`] to read `ANALYSIS_QUEUE_*` variables, or
/// [`ProcessorConfig::default()`] for the production pacing with an
/// in-memory database.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Path to SQLite database file. `None` = in-memory database.
    pub db_path: Option<PathBuf>,

    /// Maximum number of items fetched per batch.
    pub max_batch_size: usize,

    /// Mean estimated tokens at or above which a batch is "large".
    pub large_doc_threshold: u64,

    /// Estimate used for items enqueued without one.
    pub default_estimated_tokens: u64,

    /// Items executed per large batch.
    pub large_batch_size: usize,

    /// `max_retries` stamped on items enqueued without one.
    pub default_max_retries: u32,

    /// Pause between items of a sequential small batch.
    pub small_item_delay: Duration,

    /// Pause between items of a sequential large batch.
    pub large_item_delay: Duration,

    /// Per consecutive rate limit pause between sequential items.
    pub rate_limit_item_delay: Duration,

    /// Cooldown after a small (parallel) batch.
    pub small_batch_cooldown: Duration,

    /// Cooldown after a large (sequential) batch.
    pub large_batch_cooldown: Duration,

    /// Cooldown after any batch while rate limited.
    pub rate_limit_cooldown: Duration,

    /// Ceiling for any rate-limit driven delay.
    pub max_backoff: Duration,

    /// Consecutive rate limits before the run is halted (0 = unlimited).
    pub max_consecutive_rate_limits: u32,

    /// Age after which a `processing` claim is presumed abandoned and
    /// requeued on startup. Younger claims belong to a live processor.
    pub stale_claim_after: Duration,

    /// Passed to the extraction service.
    pub force_re_extract: bool,

    /// Passed to the analysis service.
    pub bypass_limit: bool,

    /// Capacity of the progress event channel.
    pub event_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_batch_size: 3,
            large_doc_threshold: 5000,
            default_estimated_tokens: 5000,
            large_batch_size: 1,
            default_max_retries: 3,
            small_item_delay: Duration::from_secs(10),
            large_item_delay: Duration::from_secs(20),
            rate_limit_item_delay: Duration::from_secs(60),
            small_batch_cooldown: Duration::from_secs(30),
            large_batch_cooldown: Duration::from_secs(10),
            rate_limit_cooldown: Duration::from_secs(60),
            max_backoff: Duration::from_secs(600),
            max_consecutive_rate_limits: 5,
            stale_claim_after: Duration::from_secs(30 * 60),
            force_re_extract: true,
            bypass_limit: true,
            event_capacity: 256,
        }
    }
}

impl ProcessorConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder::default()
    }

    /// Load overrides from `ANALYSIS_QUEUE_*` environment variables.
    ///
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let secs = |key: &str| parsed(key).map(Duration::from_secs);

        if let Some(path) = lookup("ANALYSIS_QUEUE_DB_PATH").filter(|p| !p.is_empty()) {
            config.db_path = Some(PathBuf::from(path));
        }
        if let Some(v) = parsed("ANALYSIS_QUEUE_MAX_BATCH_SIZE") {
            config.max_batch_size = v as usize;
        }
        if let Some(v) = parsed("ANALYSIS_QUEUE_LARGE_DOC_THRESHOLD") {
            config.large_doc_threshold = v;
        }
        if let Some(v) = parsed("ANALYSIS_QUEUE_LARGE_BATCH_SIZE") {
            config.large_batch_size = v as usize;
        }
        if let Some(v) = parsed("ANALYSIS_QUEUE_MAX_RETRIES") {
            config.default_max_retries = v as u32;
        }
        if let Some(d) = secs("ANALYSIS_QUEUE_MAX_BACKOFF_SECS") {
            config.max_backoff = d;
        }
        if let Some(v) = parsed("ANALYSIS_QUEUE_MAX_CONSECUTIVE_RATE_LIMITS") {
            config.max_consecutive_rate_limits = v as u32;
        }
        if let Some(d) = secs("ANALYSIS_QUEUE_STALE_CLAIM_SECS") {
            config.stale_claim_after = d;
        }
        config
    }

    /// Effective fetch size; never below one.
    pub(crate) fn batch_limit(&self) -> usize {
        self.max_batch_size.max(1)
    }
}

/// Builder for [`ProcessorConfig`].
#[derive(Default)]
pub struct ProcessorConfigBuilder {
    config: ProcessorConfig,
}

impl ProcessorConfigBuilder {
    /// Set the SQLite database path for persistence. Omit for in-memory.
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.config.db_path = Some(path);
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = size;
        self
    }

    pub fn with_large_doc_threshold(mut self, tokens: u64) -> Self {
        self.config.large_doc_threshold = tokens;
        self
    }

    pub fn with_default_estimated_tokens(mut self, tokens: u64) -> Self {
        self.config.default_estimated_tokens = tokens;
        self
    }

    pub fn with_large_batch_size(mut self, size: usize) -> Self {
        self.config.large_batch_size = size;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.config.default_max_retries = retries;
        self
    }

    /// Set the baseline pauses between sequential items (small, large).
    pub fn with_item_delays(mut self, small: Duration, large: Duration) -> Self {
        self.config.small_item_delay = small;
        self.config.large_item_delay = large;
        self
    }

    /// Set the baseline cooldowns after a batch (small, large).
    pub fn with_batch_cooldowns(mut self, small: Duration, large: Duration) -> Self {
        self.config.small_batch_cooldown = small;
        self.config.large_batch_cooldown = large;
        self
    }

    /// Set the rate-limit step for item delays and the rate-limit cooldown.
    pub fn with_rate_limit_backoff(mut self, item_step: Duration, cooldown: Duration) -> Self {
        self.config.rate_limit_item_delay = item_step;
        self.config.rate_limit_cooldown = cooldown;
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.config.max_backoff = max;
        self
    }

    pub fn with_max_consecutive_rate_limits(mut self, max: u32) -> Self {
        self.config.max_consecutive_rate_limits = max;
        self
    }

    /// Set how old a `processing` claim must be before startup requeues it.
    pub fn with_stale_claim_after(mut self, age: Duration) -> Self {
        self.config.stale_claim_after = age;
        self
    }

    pub fn with_force_re_extract(mut self, enabled: bool) -> Self {
        self.config.force_re_extract = enabled;
        self
    }

    pub fn with_bypass_limit(mut self, enabled: bool) -> Self {
        self.config.bypass_limit = enabled;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build the final [`ProcessorConfig`].
    pub fn build(self) -> ProcessorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_production_pacing() {
        let config = ProcessorConfig::default();
        assert_eq!(config.max_batch_size, 3);
        assert_eq!(config.large_doc_threshold, 5000);
        assert_eq!(config.large_batch_size, 1);
        assert_eq!(config.large_item_delay, Duration::from_secs(20));
        assert_eq!(config.small_batch_cooldown, Duration::from_secs(30));
        assert_eq!(config.max_consecutive_rate_limits, 5);
        assert_eq!(config.stale_claim_after, Duration::from_secs(1800));
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let config = ProcessorConfig::builder()
            .with_max_batch_size(5)
            .with_large_doc_threshold(8000)
            .with_item_delays(Duration::from_secs(1), Duration::from_secs(2))
            .with_max_consecutive_rate_limits(4)
            .build();

        assert_eq!(config.max_batch_size, 5);
        assert_eq!(config.large_doc_threshold, 8000);
        assert_eq!(config.small_item_delay, Duration::from_secs(1));
        assert_eq!(config.large_item_delay, Duration::from_secs(2));
        assert_eq!(config.max_consecutive_rate_limits, 4);
    }

    #[test]
    fn test_from_lookup_reads_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("ANALYSIS_QUEUE_DB_PATH", "/tmp/queue.db"),
            ("ANALYSIS_QUEUE_MAX_BATCH_SIZE", "6"),
            ("ANALYSIS_QUEUE_LARGE_DOC_THRESHOLD", "not-a-number"),
            ("ANALYSIS_QUEUE_MAX_BACKOFF_SECS", "300"),
            ("ANALYSIS_QUEUE_MAX_CONSECUTIVE_RATE_LIMITS", "0"),
            ("ANALYSIS_QUEUE_STALE_CLAIM_SECS", "120"),
        ]
        .into_iter()
        .collect();

        let config = ProcessorConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/queue.db")));
        assert_eq!(config.max_batch_size, 6);
        assert_eq!(config.large_doc_threshold, 5000);
        assert_eq!(config.max_backoff, Duration::from_secs(300));
        assert_eq!(config.max_consecutive_rate_limits, 0);
        assert_eq!(config.stale_claim_after, Duration::from_secs(120));
    }

    #[test]
    fn test_batch_limit_never_zero() {
        let config = ProcessorConfig::builder().with_max_batch_size(0).build();
        assert_eq!(config.batch_limit(), 1);
    }
}
