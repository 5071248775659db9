//! Dead-letter store.
//!
//! Holds notifications whose ordinary retries are exhausted. Entries point at
//! their ledger row and carry an opaque copy of the originating request. A
//! periodic pass replays ready entries after re-checking the user's
//! preferences. Entries whose payload no longer decodes are marked processed
//! without a send. Processed entries are purged after the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::channels::{ChannelMessage, ChannelRegistry, DeliveryOutcome};
use super::events::EventType;
use super::preferences::PreferenceResolver;
use super::retry::RetryPolicy;
use super::scheduler::PassGuard;
use super::types::NotificationRequest;
use crate::config::DeadLetterConfig;
use crate::database::models::{
    Channel, DeadLetterDbModel, DeliveryAttempt, NotificationDbModel, Paginated,
};
use crate::database::repositories::{DeadLetterFilter, DeadLetterRepository};
use crate::database::time::{datetime_to_ms, days_before_ms, ms_to_datetime};
use crate::notification::ledger::NotificationLedger;
use crate::{Error, Result};

const PASS_CONCURRENCY: usize = 4;

/// Processed reasons.
pub const REASON_DELIVERED: &str = "delivered";
pub const REASON_NOT_SUBSCRIBED: &str = "no longer subscribed";
pub const REASON_CHANNEL_DISABLED: &str = "channel disabled";
pub const REASON_MAX_RETRIES: &str = "max retries exceeded";
pub const REASON_UNDECODABLE: &str = "undecodable payload";

/// Decoded view of a dead-letter entry, used for listing and export.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub notification_id: String,
    pub user_id: String,
    pub event_type: String,
    pub channel: String,
    pub event_payload: Value,
    pub failure_reason: String,
    pub retry_attempts: Vec<DeliveryAttempt>,
    pub max_retries: i64,
    pub processed: bool,
    pub processed_reason: Option<String>,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&DeadLetterDbModel> for DeadLetterEntry {
    fn from(row: &DeadLetterDbModel) -> Self {
        Self {
            id: row.id.clone(),
            notification_id: row.notification_id.clone(),
            user_id: row.user_id.clone(),
            event_type: row.event_type.clone(),
            channel: row.channel.clone(),
            event_payload: serde_json::from_str(&row.event_payload).unwrap_or(Value::Null),
            failure_reason: row.failure_reason.clone(),
            retry_attempts: row.attempts(),
            max_retries: row.max_retries,
            processed: row.processed,
            processed_reason: row.processed_reason.clone(),
            next_retry_at: row.next_retry_at(),
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
        }
    }
}

/// How one replay of an entry ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Delivered,
    /// Preferences changed since the failure; nothing was sent.
    Skipped(&'static str),
    Rescheduled(i64),
    /// Failed and the history reached its ceiling.
    Exhausted,
    /// The stored payload cannot be turned into a message; nothing was sent.
    Discarded(&'static str),
}

/// Summary of one dead-letter pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterPassReport {
    pub skipped: bool,
    pub selected: usize,
    pub delivered: usize,
    pub revalidation_skipped: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    pub discarded: usize,
    pub errors: usize,
}

pub struct DeadLetterStore {
    repo: Arc<dyn DeadLetterRepository>,
    ledger: Arc<NotificationLedger>,
    registry: Arc<ChannelRegistry>,
    preferences: Arc<PreferenceResolver>,
    config: DeadLetterConfig,
    policy: RetryPolicy,
    send_timeout: Duration,
    process_guard: PassGuard,
    cleanup_guard: PassGuard,
}

impl DeadLetterStore {
    pub fn new(
        repo: Arc<dyn DeadLetterRepository>,
        ledger: Arc<NotificationLedger>,
        registry: Arc<ChannelRegistry>,
        preferences: Arc<PreferenceResolver>,
        config: DeadLetterConfig,
        send_timeout: Duration,
    ) -> Self {
        let policy = RetryPolicy::for_dead_letters(&config);
        Self {
            repo,
            ledger,
            registry,
            preferences,
            config,
            policy,
            send_timeout,
            process_guard: PassGuard::new(),
            cleanup_guard: PassGuard::new(),
        }
    }

    /// Move `notification` into the store and mark its ledger row.
    ///
    /// Adding the same notification twice returns the existing entry, and
    /// still marks the ledger row in case the first call stopped short.
    pub async fn add_entry(
        &self,
        notification: &NotificationDbModel,
        event_payload: &Value,
        reason: &str,
    ) -> Result<DeadLetterDbModel> {
        if let Some(existing) = self.repo.find_by_notification(&notification.id).await? {
            debug!(notification_id = %notification.id, "Dead-letter entry already exists");
            self.ledger
                .mark_dead_lettered(&notification.id, &existing.failure_reason)
                .await?;
            return Ok(existing);
        }

        let entry = DeadLetterDbModel::new(
            notification,
            serde_json::to_string(event_payload)?,
            reason,
            self.config.max_retries,
            self.policy.next_retry_at(Utc::now(), 0),
        );
        self.repo.insert(&entry).await?;
        self.ledger
            .mark_dead_lettered(&notification.id, reason)
            .await?;

        info!(
            entry_id = %entry.id,
            notification_id = %notification.id,
            user_id = %notification.user_id,
            reason,
            "Added dead-letter entry"
        );
        Ok(entry)
    }

    pub async fn get(&self, id: &str) -> Result<DeadLetterEntry> {
        Ok(DeadLetterEntry::from(&self.repo.get(id).await?))
    }

    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Paginated<DeadLetterEntry>> {
        let page = self.repo.list(filter).await?;
        Ok(Paginated {
            items: page.items.iter().map(DeadLetterEntry::from).collect(),
            total: page.total,
            page: page.page,
            limit: page.limit,
        })
    }

    /// Every entry as a JSON array, oldest first.
    pub async fn export(&self) -> Result<Value> {
        let entries: Vec<DeadLetterEntry> = self
            .repo
            .list_all()
            .await?
            .iter()
            .map(DeadLetterEntry::from)
            .collect();
        Ok(serde_json::to_value(entries)?)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if !self.repo.delete(id).await? {
            return Err(Error::not_found("DeadLetterEntry", id));
        }
        debug!(entry_id = id, "Deleted dead-letter entry");
        Ok(())
    }

    pub async fn count_unprocessed(&self) -> Result<i64> {
        self.repo.count_unprocessed().await
    }

    /// Force one immediate attempt for an unprocessed entry.
    ///
    /// An operator asked for this send, so preferences are not re-checked.
    pub async fn retry(&self, id: &str) -> Result<ReplayOutcome> {
        let entry = self.repo.get(id).await?;
        if entry.processed {
            return Err(Error::validation(format!(
                "dead-letter entry {id} is already processed"
            )));
        }
        self.attempt(&entry, Utc::now()).await
    }

    /// Run one replay pass at the current time.
    pub async fn process_ready(&self) -> Result<DeadLetterPassReport> {
        self.process_ready_at(Utc::now()).await
    }

    /// Replay every entry ready at `now`, up to the batch size.
    pub async fn process_ready_at(&self, now: DateTime<Utc>) -> Result<DeadLetterPassReport> {
        let Some(_token) = self.process_guard.try_begin() else {
            debug!("Dead-letter pass already running, skipping");
            return Ok(DeadLetterPassReport {
                skipped: true,
                ..Default::default()
            });
        };

        let recovered = self.registry.recheck_unhealthy().await;
        if recovered > 0 {
            debug!(recovered, "Channels recovered before dead-letter pass");
        }

        let ready = self
            .repo
            .list_ready(datetime_to_ms(now), self.config.batch_size)
            .await?;
        if ready.is_empty() {
            return Ok(DeadLetterPassReport::default());
        }

        let selected = ready.len();
        let outcomes: Vec<(String, Result<ReplayOutcome>)> = futures::stream::iter(ready)
            .map(|entry| async move {
                let outcome = self.replay(&entry, now).await;
                (entry.id, outcome)
            })
            .buffer_unordered(PASS_CONCURRENCY)
            .collect()
            .await;

        let mut report = DeadLetterPassReport {
            selected,
            ..Default::default()
        };
        for (entry_id, outcome) in outcomes {
            match outcome {
                Ok(ReplayOutcome::Delivered) => report.delivered += 1,
                Ok(ReplayOutcome::Skipped(_)) => report.revalidation_skipped += 1,
                Ok(ReplayOutcome::Rescheduled(_)) => report.rescheduled += 1,
                Ok(ReplayOutcome::Exhausted) => report.exhausted += 1,
                Ok(ReplayOutcome::Discarded(_)) => report.discarded += 1,
                Err(e) => {
                    warn!(entry_id = %entry_id, error = %e, "Dead-letter replay failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            selected = report.selected,
            delivered = report.delivered,
            skipped = report.revalidation_skipped,
            rescheduled = report.rescheduled,
            exhausted = report.exhausted,
            discarded = report.discarded,
            "Dead-letter pass finished"
        );
        Ok(report)
    }

    /// Re-check preferences, then attempt delivery.
    async fn replay(&self, entry: &DeadLetterDbModel, now: DateTime<Utc>) -> Result<ReplayOutcome> {
        let prefs = self.preferences.get_preferences(&entry.user_id).await;

        let subscribed = EventType::parse(&entry.event_type)
            .is_some_and(|event_type| prefs.is_event_subscribed(event_type));
        let skip_reason = if !subscribed {
            Some(REASON_NOT_SUBSCRIBED)
        } else if !Channel::parse(&entry.channel).is_some_and(|c| prefs.is_channel_enabled(c)) {
            Some(REASON_CHANNEL_DISABLED)
        } else {
            None
        };

        if let Some(reason) = skip_reason {
            self.repo.mark_processed(&entry.id, None, reason).await?;
            info!(
                entry_id = %entry.id,
                user_id = %entry.user_id,
                reason,
                "Dead-letter replay skipped"
            );
            return Ok(ReplayOutcome::Skipped(reason));
        }

        self.attempt(entry, now).await
    }

    /// One delivery attempt, recorded in the entry's history.
    async fn attempt(&self, entry: &DeadLetterDbModel, now: DateTime<Utc>) -> Result<ReplayOutcome> {
        let message = match self.build_message(entry).await {
            Ok(message) => message,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Dead-letter payload cannot be replayed");
                self.repo
                    .mark_processed(&entry.id, None, REASON_UNDECODABLE)
                    .await?;
                return Ok(ReplayOutcome::Discarded(REASON_UNDECODABLE));
            }
        };
        let outcome = self.registry.deliver(&message, self.send_timeout).await;
        self.record_outcome(entry, message.channel, outcome, now).await
    }

    async fn build_message(&self, entry: &DeadLetterDbModel) -> Result<ChannelMessage> {
        let request: NotificationRequest = serde_json::from_str(&entry.event_payload)?;
        let channel = Channel::parse(&entry.channel)
            .or(request.channel)
            .ok_or_else(|| Error::validation(format!("unknown channel '{}'", entry.channel)))?;
        let prefs = self.preferences.get_preferences(&entry.user_id).await;

        Ok(ChannelMessage {
            notification_id: entry.notification_id.clone(),
            user_id: entry.user_id.clone(),
            event_type: request.event_type,
            channel,
            title: request.title,
            body: request.message,
            priority: request.priority,
            metadata: request.metadata,
            recipient: prefs.recipient_for(channel),
        })
    }

    async fn record_outcome(
        &self,
        entry: &DeadLetterDbModel,
        channel: Channel,
        outcome: DeliveryOutcome,
        now: DateTime<Utc>,
    ) -> Result<ReplayOutcome> {
        if outcome.is_success() {
            self.repo
                .mark_processed(&entry.id, Some(&outcome.attempt), REASON_DELIVERED)
                .await?;
            self.ledger
                .mark_sent(&entry.notification_id, channel, &outcome.attempt)
                .await?;
            info!(
                entry_id = %entry.id,
                notification_id = %entry.notification_id,
                %channel,
                "Dead-letter entry delivered"
            );
            return Ok(ReplayOutcome::Delivered);
        }

        let history = entry.attempt_count() + 1;
        if history as i64 >= entry.max_retries {
            self.repo
                .mark_processed(&entry.id, Some(&outcome.attempt), REASON_MAX_RETRIES)
                .await?;
            warn!(
                entry_id = %entry.id,
                notification_id = %entry.notification_id,
                attempts = history,
                "Dead-letter entry exhausted"
            );
            return Ok(ReplayOutcome::Exhausted);
        }

        let retry_count = u32::try_from(history).unwrap_or(u32::MAX);
        let next_retry_at = self.policy.next_retry_at(now, retry_count);
        self.repo
            .record_failure(&entry.id, &outcome.attempt, next_retry_at)
            .await?;
        debug!(
            entry_id = %entry.id,
            attempts = history,
            next_retry_at,
            error = %outcome.error_message().unwrap_or_default(),
            "Dead-letter replay failed, rescheduled"
        );
        Ok(ReplayOutcome::Rescheduled(next_retry_at))
    }

    /// Purge processed entries older than the retention window.
    pub async fn cleanup(&self) -> Result<u64> {
        self.cleanup_at(Utc::now()).await
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let Some(_token) = self.cleanup_guard.try_begin() else {
            return Ok(0);
        };
        let before = days_before_ms(now, self.config.retention_days);
        let removed = self.repo.cleanup_processed(before).await?;
        if removed > 0 {
            info!(
                removed,
                retention_days = self.config.retention_days,
                "Purged processed dead-letter entries"
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::events::NotificationPriority;

    #[test]
    fn test_entry_view_parses_payload() {
        let notification = NotificationDbModel::new(
            "u-1",
            EventType::FileShared,
            Channel::Email,
            "A file was shared with you",
            "b",
            NotificationPriority::Normal,
            &serde_json::Map::new(),
        );
        let row = DeadLetterDbModel::new(&notification, r#"{"user_id":"u-1"}"#, "boom", 5, 0);
        let entry = DeadLetterEntry::from(&row);
        assert_eq!(entry.event_payload["user_id"], "u-1");
        assert!(entry.retry_attempts.is_empty());
        assert_eq!(entry.failure_reason, "boom");

        let corrupt = DeadLetterDbModel::new(&notification, "not json", "boom", 5, 0);
        assert_eq!(DeadLetterEntry::from(&corrupt).event_payload, Value::Null);
    }
}
