//! Request and response types for the delivery pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::events::{EventType, NotificationPriority};
use crate::database::models::Channel;
use crate::{Error, Result};

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_MESSAGE_LEN: usize = 8 * 1024;

/// Ephemeral command asking the pipeline to notify a user. Not persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: String,
    pub event_type: EventType,
    /// Resolved from preferences when absent.
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub priority: NotificationPriority,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub bypass_batching: bool,
    #[serde(default)]
    pub bypass_quiet_hours: bool,
    /// Explicit template, taking precedence over the (event, channel) lookup.
    #[serde(default)]
    pub template_id: Option<String>,
}

impl NotificationRequest {
    pub fn new(user_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            user_id: user_id.into(),
            event_type,
            channel: None,
            title: String::new(),
            message: String::new(),
            priority: NotificationPriority::Normal,
            metadata: Map::new(),
            bypass_batching: false,
            bypass_quiet_hours: false,
            template_id: None,
        }
    }

    pub fn with_content(mut self, title: impl Into<String>, message: impl Into<String>) -> Self {
        self.title = title.into();
        self.message = message.into();
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn bypass_batching(mut self) -> Self {
        self.bypass_batching = true;
        self
    }

    pub fn bypass_quiet_hours(mut self) -> Self {
        self.bypass_quiet_hours = true;
        self
    }

    /// Reject malformed requests before anything is persisted.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(Error::validation("user_id is required"));
        }
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(Error::validation(format!(
                "title exceeds {MAX_TITLE_LEN} characters"
            )));
        }
        if self.message.len() > MAX_MESSAGE_LEN {
            return Err(Error::validation(format!(
                "message exceeds {MAX_MESSAGE_LEN} bytes"
            )));
        }
        if let Some(template_id) = &self.template_id
            && template_id.trim().is_empty()
        {
            return Err(Error::validation("template_id must not be blank"));
        }
        Ok(())
    }

    /// Metadata value as display text; strings are unquoted.
    pub fn meta_str(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Outcome of an ingestion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    /// Delivered by a channel handler.
    Sent,
    /// Delivery failed and was scheduled for retry.
    Failed,
    /// Delivery failed and went straight to the dead-letter store.
    DeadLettered,
    /// Appended to a batch; delivered on the next flush.
    Batched,
    /// Held back by quiet hours.
    Suppressed,
    /// User is not subscribed to the event type.
    Skipped,
}

/// Response for `send`, `send_with_fallback` and `send_notification`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResponse {
    pub notification_id: Option<String>,
    pub status: SendStatus,
    pub channel: Option<Channel>,
    pub error: Option<String>,
}

impl SendResponse {
    pub fn sent(notification_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            notification_id: Some(notification_id.into()),
            status: SendStatus::Sent,
            channel: Some(channel),
            error: None,
        }
    }

    pub fn failed(
        notification_id: impl Into<String>,
        channel: Channel,
        status: SendStatus,
        error: impl Into<String>,
    ) -> Self {
        Self {
            notification_id: Some(notification_id.into()),
            status,
            channel: Some(channel),
            error: Some(error.into()),
        }
    }

    pub fn without_record(status: SendStatus, channel: Option<Channel>) -> Self {
        Self {
            notification_id: None,
            status,
            channel,
            error: None,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == SendStatus::Sent
    }
}
