//! Notification template database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::Channel;
use crate::database::time::now_ms;
use crate::notification::events::EventType;

/// A subject/body template for one (event type, channel) pair.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct NotificationTemplateDbModel {
    pub id: String,
    pub event_type: String,
    pub channel: String,
    pub subject_template: String,
    pub body_template: String,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NotificationTemplateDbModel {
    pub fn new(
        event_type: EventType,
        channel: Channel,
        subject_template: impl Into<String>,
        body_template: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.as_str().to_string(),
            channel: channel.as_str().to_string(),
            subject_template: subject_template.into(),
            body_template: body_template.into(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}
