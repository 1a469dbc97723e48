//! Retry scheduling
//!
//! Three independent schedulers, one per failure category, each with its own
//! ordered delay table: a plugin outage and a card decline warrant different
//! backoff, and AUTO_PAY_OFF removal re-runs parked payments immediately.
//! The attempt count is recomputed from the payment's attempt history on
//! every decision, so firing a retry twice cannot double-count.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryCategory {
    /// Gateway declined the payment
    PaymentFailure,
    /// Plugin exception or unknown outcome
    PluginFailure,
    /// Payments parked while the account was AUTO_PAY_OFF
    AutoPayOffResume,
}

impl RetryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryCategory::PaymentFailure => "PAYMENT_FAILURE",
            RetryCategory::PluginFailure => "PLUGIN_FAILURE",
            RetryCategory::AutoPayOffResume => "AUTO_PAY_OFF_RESUME",
        }
    }
}

/// One scheduled re-entry into the payment state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRetry {
    pub payment_id: Uuid,
    pub category: RetryCategory,
    pub effective_at: OffsetDateTime,
}

/// Effective-dated retry entries, drained by the worker.
///
/// A drained entry simply re-enters the state machine; if the payment moved
/// to a terminal or unexpected state meanwhile, the retry aborts silently
/// under the account lock (checked after re-fetch, not here).
#[derive(Default)]
pub struct RetryQueue {
    entries: Mutex<Vec<ScheduledRetry>>,
}

impl RetryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, entry: ScheduledRetry) {
        self.entries.lock().await.push(entry);
    }

    /// Remove and return every entry due at or before `now`
    pub async fn due(&self, now: OffsetDateTime) -> Vec<ScheduledRetry> {
        let mut entries = self.entries.lock().await;
        let mut due = Vec::new();
        entries.retain(|entry| {
            if entry.effective_at <= now {
                due.push(entry.clone());
                false
            } else {
                true
            }
        });
        due.sort_by_key(|entry| entry.effective_at);
        due
    }

    pub async fn pending(&self) -> Vec<ScheduledRetry> {
        self.entries.lock().await.clone()
    }
}

/// Ordered delay table for one failure category
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub category: RetryCategory,
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Delay for the next retry given the number of prior attempts in this
    /// category, or `None` once the table is exhausted
    pub fn delay_for(&self, prior_attempts: usize) -> Option<Duration> {
        self.delays.get(prior_attempts).copied()
    }
}

/// The three per-category schedulers plus their shared queue
pub struct RetrySchedulers {
    payment_failure: RetryPolicy,
    plugin_failure: RetryPolicy,
    queue: Arc<RetryQueue>,
}

impl RetrySchedulers {
    pub fn new(
        payment_failure: RetryPolicy,
        plugin_failure: RetryPolicy,
        queue: Arc<RetryQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            payment_failure,
            plugin_failure,
            queue,
        })
    }

    /// Defaults: declines retried every 8 days up to 3 times; plugin
    /// failures retried at 15m / 1h / 8h
    pub fn with_defaults(queue: Arc<RetryQueue>) -> Arc<Self> {
        Self::new(
            RetryPolicy {
                category: RetryCategory::PaymentFailure,
                delays: vec![Duration::days(8), Duration::days(8), Duration::days(8)],
            },
            RetryPolicy {
                category: RetryCategory::PluginFailure,
                delays: vec![
                    Duration::minutes(15),
                    Duration::hours(1),
                    Duration::hours(8),
                ],
            },
            queue,
        )
    }

    /// Read `REBILL_PAYMENT_RETRY_DAYS` (e.g. "8,8,8") and
    /// `REBILL_PLUGIN_RETRY_MINUTES` (e.g. "15,60,480")
    pub fn from_env(queue: Arc<RetryQueue>) -> Arc<Self> {
        let payment_delays = parse_table("REBILL_PAYMENT_RETRY_DAYS", Duration::days)
            .unwrap_or_else(|| vec![Duration::days(8), Duration::days(8), Duration::days(8)]);
        let plugin_delays = parse_table("REBILL_PLUGIN_RETRY_MINUTES", Duration::minutes)
            .unwrap_or_else(|| {
                vec![
                    Duration::minutes(15),
                    Duration::hours(1),
                    Duration::hours(8),
                ]
            });
        Self::new(
            RetryPolicy {
                category: RetryCategory::PaymentFailure,
                delays: payment_delays,
            },
            RetryPolicy {
                category: RetryCategory::PluginFailure,
                delays: plugin_delays,
            },
            queue,
        )
    }

    pub fn queue(&self) -> Arc<RetryQueue> {
        self.queue.clone()
    }

    /// Schedule the next retry for the category, honoring its delay table.
    /// Returns false when the table is exhausted (caller aborts the payment).
    pub async fn schedule(
        &self,
        category: RetryCategory,
        payment_id: Uuid,
        prior_attempts: usize,
        now: OffsetDateTime,
    ) -> bool {
        let policy = match category {
            RetryCategory::PaymentFailure => &self.payment_failure,
            RetryCategory::PluginFailure => &self.plugin_failure,
            // AUTO_PAY_OFF resumption is always immediate and unbounded
            RetryCategory::AutoPayOffResume => {
                self.schedule_immediate(category, payment_id, now).await;
                return true;
            }
        };
        match policy.delay_for(prior_attempts) {
            Some(delay) => {
                let effective_at = now + delay;
                tracing::debug!(
                    payment_id = %payment_id,
                    category = category.as_str(),
                    prior_attempts = prior_attempts,
                    effective_at = %effective_at,
                    "Scheduling payment retry"
                );
                self.queue
                    .insert(ScheduledRetry {
                        payment_id,
                        category,
                        effective_at,
                    })
                    .await;
                true
            }
            None => {
                tracing::info!(
                    payment_id = %payment_id,
                    category = category.as_str(),
                    prior_attempts = prior_attempts,
                    "Retry table exhausted, aborting payment"
                );
                false
            }
        }
    }

    /// Queue a retry due now (AUTO_PAY_OFF removal path)
    pub async fn schedule_immediate(
        &self,
        category: RetryCategory,
        payment_id: Uuid,
        now: OffsetDateTime,
    ) {
        self.queue
            .insert(ScheduledRetry {
                payment_id,
                category,
                effective_at: now,
            })
            .await;
    }
}

fn parse_table(var: &str, unit: fn(i64) -> Duration) -> Option<Vec<Duration>> {
    let raw = std::env::var(var).ok()?;
    let parsed: Vec<Duration> = raw
        .split(',')
        .filter_map(|part| i64::from_str(part.trim()).ok())
        .map(unit)
        .collect();
    (!parsed.is_empty()).then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn test_delay_table_indexed_by_attempt_count() {
        let queue = RetryQueue::new();
        let schedulers = RetrySchedulers::with_defaults(queue.clone());
        let payment_id = Uuid::new_v4();
        let now = datetime!(2012-05-01 00:00 UTC);

        assert!(
            schedulers
                .schedule(RetryCategory::PaymentFailure, payment_id, 0, now)
                .await
        );
        assert!(
            schedulers
                .schedule(RetryCategory::PaymentFailure, payment_id, 2, now)
                .await
        );
        // Table has three entries: the fourth failure aborts
        assert!(
            !schedulers
                .schedule(RetryCategory::PaymentFailure, payment_id, 3, now)
                .await
        );

        let pending = queue.pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].effective_at, now + Duration::days(8));
    }

    #[tokio::test]
    async fn test_plugin_failures_use_their_own_table() {
        let queue = RetryQueue::new();
        let schedulers = RetrySchedulers::with_defaults(queue.clone());
        let now = datetime!(2012-05-01 00:00 UTC);

        schedulers
            .schedule(RetryCategory::PluginFailure, Uuid::new_v4(), 0, now)
            .await;
        let pending = queue.pending().await;
        assert_eq!(pending[0].effective_at, now + Duration::minutes(15));
    }

    #[tokio::test]
    async fn test_auto_pay_off_resume_is_immediate_and_unbounded() {
        let queue = RetryQueue::new();
        let schedulers = RetrySchedulers::with_defaults(queue.clone());
        let now = datetime!(2012-05-01 00:00 UTC);

        assert!(
            schedulers
                .schedule(RetryCategory::AutoPayOffResume, Uuid::new_v4(), 99, now)
                .await
        );
        assert_eq!(queue.pending().await[0].effective_at, now);
    }

    #[tokio::test]
    async fn test_due_drains_only_ripe_entries() {
        let queue = RetryQueue::new();
        let now = datetime!(2012-05-01 00:00 UTC);
        queue
            .insert(ScheduledRetry {
                payment_id: Uuid::new_v4(),
                category: RetryCategory::PaymentFailure,
                effective_at: now,
            })
            .await;
        queue
            .insert(ScheduledRetry {
                payment_id: Uuid::new_v4(),
                category: RetryCategory::PaymentFailure,
                effective_at: now + Duration::days(8),
            })
            .await;

        let due = queue.due(now + Duration::days(1)).await;
        assert_eq!(due.len(), 1);
        assert_eq!(queue.pending().await.len(), 1);

        // Draining is destructive: the same entry does not fire twice
        assert!(queue.due(now + Duration::days(1)).await.is_empty());
    }
}
