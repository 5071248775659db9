//! Dead-letter database model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{DeliveryAttempt, NotificationDbModel};
use crate::database::time::{ms_to_datetime, now_ms};

/// Dead-letter entry for a notification whose ordinary retries were exhausted.
///
/// References the ledger row by `notification_id`; the payload is an opaque
/// copy of the originating request.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeadLetterDbModel {
    pub id: String,
    pub notification_id: String,
    pub user_id: String,
    pub event_type: String,
    pub channel: String,
    /// JSON blob of the original event payload
    pub event_payload: String,
    pub failure_reason: String,
    /// JSON array of [`DeliveryAttempt`] made by the dead-letter pass
    pub retry_attempts: String,
    pub max_retries: i64,
    pub processed: bool,
    pub processed_reason: Option<String>,
    pub next_retry_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeadLetterDbModel {
    pub fn new(
        notification: &NotificationDbModel,
        event_payload: impl Into<String>,
        failure_reason: impl Into<String>,
        max_retries: u32,
        next_retry_at: i64,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification.id.clone(),
            user_id: notification.user_id.clone(),
            event_type: notification.event_type.clone(),
            channel: notification.channel.clone(),
            event_payload: event_payload.into(),
            failure_reason: failure_reason.into(),
            retry_attempts: "[]".to_string(),
            max_retries: i64::from(max_retries),
            processed: false,
            processed_reason: None,
            next_retry_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Ordered retry history. Corrupt blobs read as empty.
    pub fn attempts(&self) -> Vec<DeliveryAttempt> {
        serde_json::from_str(&self.retry_attempts).unwrap_or_default()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts().len()
    }

    /// Whether the history has reached the ceiling.
    pub fn is_exhausted(&self) -> bool {
        self.attempt_count() as i64 >= self.max_retries
    }

    pub fn next_retry_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.next_retry_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::Channel;
    use crate::notification::events::{EventType, NotificationPriority};

    #[test]
    fn test_dead_letter_new() {
        let notification = NotificationDbModel::new(
            "user-1",
            EventType::FileUploaded,
            Channel::Email,
            "t",
            "m",
            NotificationPriority::Normal,
            &serde_json::Map::new(),
        );
        let entry = DeadLetterDbModel::new(&notification, "{}", "connection refused", 5, 0);

        assert_eq!(entry.notification_id, notification.id);
        assert_eq!(entry.user_id, "user-1");
        assert_eq!(entry.event_type, "file.uploaded");
        assert_eq!(entry.max_retries, 5);
        assert!(!entry.processed);
        assert_eq!(entry.attempt_count(), 0);
        assert!(!entry.is_exhausted());
    }
}
