//! Notification ledger database models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime, now_ms};
use crate::notification::events::{EventType, NotificationPriority};

/// Delivery medium for a notification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
            Self::InApp => "in_app",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "sms" => Some(Self::Sms),
            "push" => Some(Self::Push),
            "in_app" | "inapp" | "in-app" => Some(Self::InApp),
            _ => None,
        }
    }
}

/// Lifecycle status of a ledger entry.
///
/// `DeadLettered` is terminal for the ordinary retry path; the dead-letter
/// store takes over from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    DeadLettered,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }
}

/// A single delivery attempt against a channel handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub attempted_at: DateTime<Utc>,
    pub channel: Channel,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Notification database model.
/// One row per outbound notification; the system of record for delivery status.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    pub user_id: String,
    pub event_type: String,
    pub channel: String,
    pub title: String,
    pub message: String,
    pub status: String,
    pub priority: String,
    /// JSON object with free-form metadata
    pub metadata: String,
    pub retry_count: i64,
    /// Epoch ms of the next scheduled retry, if any
    pub next_retry_at: Option<i64>,
    /// JSON array of [`DeliveryAttempt`]
    pub delivery_attempts: String,
    pub last_error: Option<String>,
    pub is_read: bool,
    pub read_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NotificationDbModel {
    /// Build a new pending ledger entry.
    pub fn new(
        user_id: impl Into<String>,
        event_type: EventType,
        channel: Channel,
        title: impl Into<String>,
        message: impl Into<String>,
        priority: NotificationPriority,
        metadata: &Map<String, Value>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            event_type: event_type.as_str().to_string(),
            channel: channel.as_str().to_string(),
            title: title.into(),
            message: message.into(),
            status: NotificationStatus::Pending.as_str().to_string(),
            priority: priority.as_str().to_string(),
            metadata: Value::Object(metadata.clone()).to_string(),
            retry_count: 0,
            next_retry_at: None,
            delivery_attempts: "[]".to_string(),
            last_error: None,
            is_read: false,
            read_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> Option<NotificationStatus> {
        NotificationStatus::parse(&self.status)
    }

    pub fn channel(&self) -> Option<Channel> {
        Channel::parse(&self.channel)
    }

    pub fn event_type(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }

    pub fn priority(&self) -> NotificationPriority {
        NotificationPriority::parse(&self.priority).unwrap_or_default()
    }

    /// Metadata as a JSON map. Corrupt blobs read as empty.
    pub fn metadata_map(&self) -> Map<String, Value> {
        match serde_json::from_str::<Value>(&self.metadata) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Ordered delivery attempts. Corrupt blobs read as empty.
    pub fn attempts(&self) -> Vec<DeliveryAttempt> {
        serde_json::from_str(&self.delivery_attempts).unwrap_or_default()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.created_at)
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at.map(ms_to_datetime)
    }

    /// Whether the scheduled retry pass should pick this entry at `now`.
    /// A row at `max_retries` stays due until its dead-letter handoff lands.
    pub fn is_due_for_retry(&self, now: DateTime<Utc>, max_retries: u32) -> bool {
        self.status() == Some(NotificationStatus::Failed)
            && self.retry_count <= i64::from(max_retries)
            && self
                .next_retry_at
                .is_some_and(|at| at <= datetime_to_ms(now))
    }
}

/// Per-channel delivery counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDeliveryStats {
    pub sent: i64,
    pub failed: i64,
}

/// Delivery statistics over a date range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub total: i64,
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
    pub dead_lettered: i64,
    pub read: i64,
    pub by_channel: BTreeMap<String, ChannelDeliveryStats>,
}

impl DeliveryStats {
    /// Fraction of settled notifications that were sent.
    pub fn success_rate(&self) -> f64 {
        let settled = self.sent + self.failed + self.dead_lettered;
        if settled == 0 {
            return 0.0;
        }
        self.sent as f64 / settled as f64
    }
}
