//! User notification preference database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Preference row. Structured columns hold JSON text:
/// - `subscribed_events`: array of canonical event names
/// - `channel_enabled`: object `{ "email": true, ... }`
/// - `channel_priority`: array of channel names, most preferred first
/// - `event_channels`: object mapping event name to a channel array
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserPreferencesDbModel {
    pub user_id: String,
    pub subscribed_events: String,
    pub channel_enabled: String,
    pub channel_priority: String,
    pub event_channels: String,
    pub quiet_hours_enabled: bool,
    /// `HH:MM`
    pub quiet_hours_start: String,
    /// `HH:MM`
    pub quiet_hours_end: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
