//! Scheduling policy: how a fetched batch is executed, how long to pause
//! between items and batches, and what happens to an item after a failure.
//!
//! Everything here is pure so the pacing rules can be checked without a
//! database or a clock.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ProcessorConfig;
use crate::error::{ServiceError, ServiceErrorKind};
use crate::types::{QueueItem, QueueItemStatus};

/// Cost class of a batch, by mean estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchClass {
    Small,
    Large,
}

/// The items chosen from one fetch, and the ones handed back.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub class: BatchClass,
    pub avg_tokens: f64,
    pub selected: Vec<QueueItem>,
    pub deferred: Vec<QueueItem>,
}

impl BatchPlan {
    /// Classify a fetched batch and split off the items to run now.
    ///
    /// Large batches run `large_batch_size` items, small batches run up to
    /// `max_batch_size`. Items without an estimate count as
    /// `default_estimated_tokens`.
    pub fn from_fetched(mut fetched: Vec<QueueItem>, config: &ProcessorConfig) -> Self {
        let avg_tokens = if fetched.is_empty() {
            0.0
        } else {
            let total: u64 = fetched
                .iter()
                .map(|i| i.estimated_tokens.unwrap_or(config.default_estimated_tokens))
                .sum();
            total as f64 / fetched.len() as f64
        };

        let class = if avg_tokens >= config.large_doc_threshold as f64 {
            BatchClass::Large
        } else {
            BatchClass::Small
        };

        let take = match class {
            BatchClass::Large => config.large_batch_size.max(1),
            BatchClass::Small => config.batch_limit(),
        }
        .min(fetched.len());
        let deferred = fetched.split_off(take);

        Self {
            class,
            avg_tokens,
            selected: fetched,
            deferred,
        }
    }

    /// Large batches and singletons run one item at a time.
    pub fn is_sequential(&self) -> bool {
        self.class == BatchClass::Large || self.selected.len() <= 1
    }
}

fn capped(config: &ProcessorConfig, delay: Duration) -> Duration {
    delay.min(config.max_backoff)
}

/// Pause between items of a sequential batch.
///
/// Grows linearly with the run's consecutive rate limits (capped at
/// `max_backoff`); otherwise the baseline pacing for the batch class.
pub fn inter_item_delay(
    config: &ProcessorConfig,
    class: BatchClass,
    consecutive_rate_limits: u32,
) -> Duration {
    if consecutive_rate_limits > 0 {
        return capped(
            config,
            config
                .rate_limit_item_delay
                .saturating_mul(consecutive_rate_limits),
        );
    }
    match class {
        BatchClass::Large => config.large_item_delay,
        BatchClass::Small => config.small_item_delay,
    }
}

/// Pause after a completed batch.
///
/// Large batches were already paced item by item, so they get the short
/// cooldown; small batches fired several calls at once and get the long one.
pub fn batch_cooldown(
    config: &ProcessorConfig,
    class: BatchClass,
    consecutive_rate_limits: u32,
) -> Duration {
    if consecutive_rate_limits > 0 {
        return capped(config, config.rate_limit_cooldown);
    }
    match class {
        BatchClass::Large => config.large_batch_cooldown,
        BatchClass::Small => config.small_batch_cooldown,
    }
}

/// Consecutive rate-limit counter for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitTracker {
    consecutive: u32,
}

impl RateLimitTracker {
    pub fn record_rate_limit(&mut self) {
        self.consecutive = self.consecutive.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// True once `max` consecutive rate limits were seen. `0` never trips.
    pub fn limit_reached(&self, max: u32) -> bool {
        max > 0 && self.consecutive >= max
    }
}

/// Where a failed item goes next and what gets written about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    /// `Pending` to retry, `Failed` when terminal.
    pub status: QueueItemStatus,
    pub retry_count: u32,
    pub queue_message: String,
    pub ledger_message: String,
    pub kind: ServiceErrorKind,
}

impl RetryDecision {
    /// Decide the outcome of a failed attempt.
    ///
    /// `item.retry_count` is the count before this attempt: the item is
    /// retried while it is below `max_retries` and the failure is a timeout
    /// or a rate limit. Either way the stored count becomes `retry_count + 1`.
    pub fn for_failure(item: &QueueItem, error: &ServiceError, message: &str) -> Self {
        let attempt = item.retry_count.saturating_add(1);
        let max = item.max_retries;
        let eligible = item.retry_count < max && error.kind.is_retryable();

        let ledger_message = match error.kind {
            ServiceErrorKind::RateLimited if eligible => {
                format!("Rate limited (429). Auto-retry {}/{}", attempt, max)
            }
            ServiceErrorKind::RateLimited => "Rate limited (429). Retries exhausted".to_string(),
            ServiceErrorKind::PaymentRequired => {
                "Insufficient AI credits. Please add credits.".to_string()
            }
            _ => message.to_string(),
        };

        let (status, queue_message) = if eligible {
            let msg = match error.kind {
                ServiceErrorKind::RateLimited => {
                    format!("Rate limited. Will auto-retry ({}/{})", attempt, max)
                }
                _ => format!("Timeout. Will retry ({}/{})", attempt, max),
            };
            (QueueItemStatus::Pending, msg)
        } else if error.kind == ServiceErrorKind::PaymentRequired {
            (
                QueueItemStatus::Failed,
                "Insufficient AI credits. Please add credits to continue.".to_string(),
            )
        } else if error.kind.is_retryable() {
            (
                QueueItemStatus::Failed,
                format!("Max retries ({}) exceeded: {}", max, message),
            )
        } else {
            (QueueItemStatus::Failed, message.to_string())
        };

        Self {
            status,
            retry_count: attempt,
            queue_message,
            ledger_message,
            kind: error.kind,
        }
    }

    pub fn will_retry(&self) -> bool {
        self.status == QueueItemStatus::Pending
    }
}
