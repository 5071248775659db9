//! Scheduled redelivery with bounded exponential backoff.
//!
//! Per notification: `failed -> scheduled -> retry attempt -> sent | failed`
//! with `retry_count + 1`, repeating until `retry_count >= max_retries`. At
//! that point the notification moves to the dead-letter store and leaves the
//! ordinary retry path for good. Until the dead-letter entry is written the
//! row stays due, so a failed handoff is picked up by the next pass.
//!
//! Rows that no longer decode (unknown channel or event type) are handed to
//! the dead-letter store on their next pass instead of being retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::channels::{ChannelMessage, ChannelRegistry};
use super::dead_letter::{DeadLetterStore, REASON_MAX_RETRIES};
use super::ledger::{NotificationLedger, NotificationRecord, request_from_record};
use super::preferences::PreferenceResolver;
use super::scheduler::PassGuard;
use crate::Result;
use crate::config::{DeadLetterConfig, RetryConfig};
use crate::database::models::{DeliveryAttempt, NotificationDbModel};
use crate::database::time::{add_delay_ms, datetime_to_ms};

const PASS_CONCURRENCY: usize = 8;

/// Backoff policy: `delay(n) = min(base * multiplier^n, max)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Dead-letter replays double their delay each time.
    pub fn for_dead_letters(config: &DeadLetterConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: true,
        }
    }

    /// Deterministic delay before retry number `retry_count`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= max_ms {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64)
    }

    /// `delay` perturbed by up to ±25% when jitter is enabled.
    pub fn delay_with_jitter(&self, retry_count: u32) -> Duration {
        let delay_ms = u64::try_from(self.delay(retry_count).as_millis()).unwrap_or(u64::MAX);
        if !self.jitter {
            return Duration::from_millis(delay_ms);
        }
        let jitter_range = delay_ms / 4;
        if jitter_range == 0 {
            return Duration::from_millis(delay_ms);
        }
        let offset = rand::random::<u64>() % (jitter_range * 2 + 1);
        Duration::from_millis(delay_ms - jitter_range + offset)
    }

    /// Epoch ms of the next attempt after `now`.
    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> i64 {
        add_delay_ms(now, self.delay_with_jitter(retry_count))
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

/// What happened to a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Another attempt is scheduled at the given epoch ms.
    Scheduled(i64),
    /// Retries are exhausted; the notification is in the dead-letter store.
    DeadLettered,
}

/// Summary of one retry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryPassReport {
    /// A pass was already running, so this one did nothing.
    pub skipped: bool,
    pub selected: usize,
    pub sent: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub errors: usize,
}

pub struct RetryEngine {
    ledger: Arc<NotificationLedger>,
    registry: Arc<ChannelRegistry>,
    preferences: Arc<PreferenceResolver>,
    dead_letters: Arc<DeadLetterStore>,
    policy: RetryPolicy,
    batch_size: u32,
    send_timeout: Duration,
    guard: PassGuard,
}

impl RetryEngine {
    pub fn new(
        ledger: Arc<NotificationLedger>,
        registry: Arc<ChannelRegistry>,
        preferences: Arc<PreferenceResolver>,
        dead_letters: Arc<DeadLetterStore>,
        config: &RetryConfig,
        send_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            registry,
            preferences,
            dead_letters,
            policy: RetryPolicy::from_config(config),
            batch_size: config.batch_size,
            send_timeout,
            guard: PassGuard::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed attempt for `notification` and decide what comes next.
    ///
    /// `notification.retry_count` is the count before this attempt; the
    /// initial send passes a fresh row with count 0.
    pub async fn handle_failure(
        &self,
        notification: &NotificationDbModel,
        attempt: &DeliveryAttempt,
        is_retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition> {
        let previous = u32::try_from(notification.retry_count).unwrap_or(u32::MAX);
        let retry_count = if is_retry {
            previous.saturating_add(1).min(self.policy.max_retries)
        } else {
            previous.min(self.policy.max_retries)
        };
        let reason = attempt
            .error
            .clone()
            .unwrap_or_else(|| "delivery failed".to_string());

        if self.policy.is_exhausted(retry_count) {
            self.ledger
                .mark_failed(&notification.id, attempt, retry_count, Some(datetime_to_ms(now)))
                .await?;
            self.dead_letter(notification, &reason).await?;
            warn!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                retry_count,
                "Retries exhausted, moved to dead-letter store"
            );
            return Ok(FailureDisposition::DeadLettered);
        }

        let next_retry_at = self.policy.next_retry_at(now, retry_count);
        self.ledger
            .mark_failed(&notification.id, attempt, retry_count, Some(next_retry_at))
            .await?;
        debug!(
            notification_id = %notification.id,
            retry_count,
            next_retry_at,
            "Scheduled notification retry"
        );
        Ok(FailureDisposition::Scheduled(next_retry_at))
    }

    /// Run one retry pass at the current time.
    pub async fn process_due(&self) -> Result<RetryPassReport> {
        self.process_due_at(Utc::now()).await
    }

    /// Retry every failed notification due at `now`, up to the batch size.
    pub async fn process_due_at(&self, now: DateTime<Utc>) -> Result<RetryPassReport> {
        let Some(_token) = self.guard.try_begin() else {
            debug!("Retry pass already running, skipping");
            return Ok(RetryPassReport {
                skipped: true,
                ..Default::default()
            });
        };

        let recovered = self.registry.recheck_unhealthy().await;
        if recovered > 0 {
            debug!(recovered, "Channels recovered before retry pass");
        }

        let due = self
            .ledger
            .due_for_retry(now, self.policy.max_retries, self.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(RetryPassReport::default());
        }

        let selected = due.len();
        let sent = AtomicUsize::new(0);
        let rescheduled = AtomicUsize::new(0);
        let dead_lettered = AtomicUsize::new(0);
        let errors = AtomicUsize::new(0);

        futures::stream::iter(due)
            .for_each_concurrent(PASS_CONCURRENCY, |notification| {
                let (sent, rescheduled, dead_lettered, errors) =
                    (&sent, &rescheduled, &dead_lettered, &errors);
                async move {
                    match self.retry_one(&notification, now).await {
                        Ok(None) => sent.fetch_add(1, Ordering::Relaxed),
                        Ok(Some(FailureDisposition::Scheduled(_))) => {
                            rescheduled.fetch_add(1, Ordering::Relaxed)
                        }
                        Ok(Some(FailureDisposition::DeadLettered)) => {
                            dead_lettered.fetch_add(1, Ordering::Relaxed)
                        }
                        Err(e) => {
                            warn!(
                                notification_id = %notification.id,
                                error = %e,
                                "Retry attempt could not be recorded"
                            );
                            errors.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                }
            })
            .await;

        let report = RetryPassReport {
            skipped: false,
            selected,
            sent: sent.into_inner(),
            rescheduled: rescheduled.into_inner(),
            dead_lettered: dead_lettered.into_inner(),
            errors: errors.into_inner(),
        };
        info!(
            selected = report.selected,
            sent = report.sent,
            rescheduled = report.rescheduled,
            dead_lettered = report.dead_lettered,
            "Retry pass finished"
        );
        Ok(report)
    }

    /// One attempt for one notification. `Ok(None)` means delivered.
    async fn retry_one(
        &self,
        notification: &NotificationDbModel,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureDisposition>> {
        let previous = u32::try_from(notification.retry_count).unwrap_or(u32::MAX);
        if self.policy.is_exhausted(previous) {
            let reason = notification.last_error.as_deref().unwrap_or(REASON_MAX_RETRIES);
            return self.dead_letter(notification, reason).await.map(Some);
        }

        let request = match request_from_record(notification) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    notification_id = %notification.id,
                    error = %e,
                    "Undecodable notification"
                );
                return self.dead_letter(notification, &e.to_string()).await.map(Some);
            }
        };
        let Some(channel) = request.channel else {
            let reason = format!("unknown channel '{}'", notification.channel);
            warn!(
                notification_id = %notification.id,
                reason = %reason,
                "Undecodable notification"
            );
            return self.dead_letter(notification, &reason).await.map(Some);
        };
        let prefs = self.preferences.get_preferences(&notification.user_id).await;

        let message = ChannelMessage {
            notification_id: notification.id.clone(),
            user_id: notification.user_id.clone(),
            event_type: request.event_type,
            channel,
            title: request.title,
            body: request.message,
            priority: request.priority,
            metadata: request.metadata,
            recipient: prefs.recipient_for(channel),
        };

        let outcome = self.registry.deliver(&message, self.send_timeout).await;
        if outcome.is_success() {
            self.ledger
                .mark_sent(&notification.id, channel, &outcome.attempt)
                .await?;
            debug!(notification_id = %notification.id, %channel, "Retry delivered");
            return Ok(None);
        }

        self.handle_failure(notification, &outcome.attempt, true, now)
            .await
            .map(Some)
    }

    /// Hand `notification` to the dead-letter store. Rows that no longer
    /// decode into a request keep their ledger view as the payload.
    async fn dead_letter(
        &self,
        notification: &NotificationDbModel,
        reason: &str,
    ) -> Result<FailureDisposition> {
        let payload = match request_from_record(notification) {
            Ok(request) => serde_json::to_value(request)?,
            Err(_) => serde_json::to_value(NotificationRecord::from(notification))?,
        };
        self.dead_letters
            .add_entry(notification, &payload, reason)
            .await?;
        Ok(FailureDisposition::DeadLettered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
            jitter,
        }
    }

    #[test]
    fn test_delay_formula() {
        let p = policy(false);
        assert_eq!(p.delay(0), Duration::from_millis(1_000));
        assert_eq!(p.delay(1), Duration::from_millis(2_000));
        assert_eq!(p.delay(3), Duration::from_millis(8_000));
        assert_eq!(p.delay(4), Duration::from_millis(10_000));
        assert_eq!(p.delay(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn test_delay_is_monotonic_up_to_cap() {
        let p = policy(false);
        let mut previous = Duration::ZERO;
        for n in 0..64 {
            let delay = p.delay(n);
            assert!(delay >= previous);
            assert!(delay <= p.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_is_bounded() {
        let p = policy(true);
        for n in 0..6 {
            let base = p.delay(n).as_millis();
            for _ in 0..200 {
                let jittered = p.delay_with_jitter(n).as_millis();
                assert!(jittered >= base - base / 4);
                assert!(jittered <= base + base / 4);
            }
        }
    }

    #[test]
    fn test_without_jitter_is_exact() {
        let p = policy(false);
        assert_eq!(p.delay_with_jitter(2), p.delay(2));
    }

    #[test]
    fn test_exhaustion() {
        let p = policy(false);
        assert!(!p.is_exhausted(2));
        assert!(p.is_exhausted(3));
    }

    #[test]
    fn test_dead_letter_policy() {
        let p = RetryPolicy::for_dead_letters(&DeadLetterConfig::default());
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.delay(0), Duration::from_secs(60));
        assert_eq!(p.delay(1), Duration::from_secs(120));
        assert_eq!(p.delay(10), Duration::from_secs(3_600));
    }
}
