//! Per-user notification preferences and the resolver that answers
//! "should this go out, and where".
//!
//! Lookups never fail: a missing row yields synthesized defaults (persisted
//! best effort), and a storage error is logged and also yields defaults so a
//! notification is never dropped because preferences were unreadable.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::{debug, warn};

use super::events::EventType;
use crate::database::models::{Channel, UserPreferencesDbModel};
use crate::database::repositories::PreferencesRepository;
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::{Error, Result};

const DEFAULT_QUIET_START: &str = "22:00";
const DEFAULT_QUIET_END: &str = "08:00";

/// Default channel ordering, most preferred first.
pub const DEFAULT_CHANNEL_PRIORITY: [Channel; 4] =
    [Channel::Email, Channel::Push, Channel::InApp, Channel::Sms];

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("valid regex")
});

static PHONE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[1-9][0-9]{6,14}$").expect("valid regex"));

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email)
}

/// E.164-style number; spaces, dashes and parentheses are ignored.
pub fn is_valid_phone(phone: &str) -> bool {
    let compact: String = phone
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    PHONE_REGEX.is_match(&compact)
}

/// Parse a strict `HH:MM` time of day.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    let trimmed = value.trim();
    let valid_shape = trimmed.len() == 5
        && trimmed.as_bytes()[2] == b':'
        && trimmed
            .bytes()
            .enumerate()
            .all(|(i, b)| i == 2 || b.is_ascii_digit());
    if !valid_shape {
        return Err(Error::validation(format!(
            "invalid time of day '{value}', expected HH:MM"
        )));
    }
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .map_err(|_| Error::validation(format!("invalid time of day '{value}'")))
}

fn format_time_of_day(time: NaiveTime) -> String {
    format!("{:02}:{:02}", time.hour(), time.minute())
}

/// User-configured window during which non-critical notifications are held.
///
/// Times are evaluated against UTC wall-clock time at minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: parse_time_of_day(DEFAULT_QUIET_START).unwrap_or(NaiveTime::MIN),
            end: parse_time_of_day(DEFAULT_QUIET_END).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl QuietHours {
    /// Inclusive at both ends. A window with `start > end` crosses midnight.
    pub fn contains(&self, time: NaiveTime) -> bool {
        let Some(time) = time.with_second(0).and_then(|t| t.with_nanosecond(0)) else {
            return false;
        };
        if self.start <= self.end {
            time >= self.start && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.contains(now.time())
    }
}

/// Resolved preferences for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNotificationPreferences {
    pub user_id: String,
    pub subscribed_events: BTreeSet<EventType>,
    pub channel_enabled: BTreeMap<Channel, bool>,
    /// Global ordering used for primary selection and fallback.
    pub channel_priority: Vec<Channel>,
    /// Per-event ordering, consulted before `channel_priority`.
    pub event_channels: BTreeMap<EventType, Vec<Channel>>,
    pub quiet_hours: QuietHours,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserNotificationPreferences {
    /// Subscribed to everything, SMS off, quiet hours off.
    pub fn defaults(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            subscribed_events: EventType::iter().collect(),
            channel_enabled: Channel::iter()
                .map(|channel| (channel, channel != Channel::Sms))
                .collect(),
            channel_priority: DEFAULT_CHANNEL_PRIORITY.to_vec(),
            event_channels: BTreeMap::new(),
            quiet_hours: QuietHours::default(),
            email: None,
            phone: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_event_subscribed(&self, event_type: EventType) -> bool {
        self.subscribed_events.contains(&event_type)
    }

    pub fn is_channel_enabled(&self, channel: Channel) -> bool {
        self.channel_enabled.get(&channel).copied().unwrap_or(false)
    }

    pub fn is_in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        self.quiet_hours.is_active_at(now)
    }

    /// Whether quiet hours hold back this event right now. Critical events
    /// and explicit bypasses are never held.
    pub fn suppresses(&self, event_type: EventType, bypass: bool, now: DateTime<Utc>) -> bool {
        !bypass && !event_type.is_critical() && self.is_in_quiet_hours(now)
    }

    /// Ordered channel list for an event. Channels missing from the stored
    /// ordering are appended in default order.
    pub fn channel_priorities(&self, event_type: EventType) -> Vec<Channel> {
        let preferred = self
            .event_channels
            .get(&event_type)
            .filter(|channels| !channels.is_empty())
            .unwrap_or(&self.channel_priority);

        let mut ordered: Vec<Channel> = Vec::with_capacity(DEFAULT_CHANNEL_PRIORITY.len());
        for channel in preferred.iter().chain(DEFAULT_CHANNEL_PRIORITY.iter()) {
            if !ordered.contains(channel) {
                ordered.push(*channel);
            }
        }
        ordered
    }

    /// Enabled channels in priority order.
    pub fn fallback_channels(&self, event_type: EventType) -> Vec<Channel> {
        self.channel_priorities(event_type)
            .into_iter()
            .filter(|channel| self.is_channel_enabled(*channel))
            .collect()
    }

    /// First enabled channel in priority order.
    pub fn optimal_channel(&self, event_type: EventType) -> Result<Channel> {
        self.fallback_channels(event_type)
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::channel_unavailable(
                    "any",
                    format!("no enabled channel for user {}", self.user_id),
                )
            })
    }

    /// Contact identifier used as the recipient on `channel`.
    pub fn recipient_for(&self, channel: Channel) -> Option<String> {
        match channel {
            Channel::Email => self.email.clone(),
            Channel::Sms => self.phone.clone(),
            Channel::Push | Channel::InApp => Some(self.user_id.clone()),
        }
    }

    pub fn to_db_model(&self) -> Result<UserPreferencesDbModel> {
        let subscribed: Vec<&str> = self.subscribed_events.iter().map(|e| e.as_str()).collect();
        let enabled: BTreeMap<&str, bool> = self
            .channel_enabled
            .iter()
            .map(|(channel, on)| (channel.as_str(), *on))
            .collect();
        let priority: Vec<&str> = self.channel_priority.iter().map(|c| c.as_str()).collect();
        let event_channels: BTreeMap<&str, Vec<&str>> = self
            .event_channels
            .iter()
            .map(|(event, channels)| {
                (
                    event.as_str(),
                    channels.iter().map(|c| c.as_str()).collect(),
                )
            })
            .collect();

        Ok(UserPreferencesDbModel {
            user_id: self.user_id.clone(),
            subscribed_events: serde_json::to_string(&subscribed)?,
            channel_enabled: serde_json::to_string(&enabled)?,
            channel_priority: serde_json::to_string(&priority)?,
            event_channels: serde_json::to_string(&event_channels)?,
            quiet_hours_enabled: self.quiet_hours.enabled,
            quiet_hours_start: format_time_of_day(self.quiet_hours.start),
            quiet_hours_end: format_time_of_day(self.quiet_hours.end),
            email: self.email.clone(),
            phone: self.phone.clone(),
            created_at: datetime_to_ms(self.created_at),
            updated_at: datetime_to_ms(self.updated_at),
        })
    }

    /// Decode a stored row. Unreadable columns fall back to their defaults
    /// and unknown names are dropped.
    pub fn from_db_model(row: &UserPreferencesDbModel) -> Self {
        let defaults = Self::defaults(&row.user_id);

        let subscribed_events = serde_json::from_str::<Vec<String>>(&row.subscribed_events)
            .map(|names| names.iter().filter_map(|n| EventType::parse(n)).collect())
            .unwrap_or_else(|_| defaults.subscribed_events.clone());

        let channel_enabled = serde_json::from_str::<BTreeMap<String, bool>>(&row.channel_enabled)
            .map(|map| {
                let mut enabled = defaults.channel_enabled.clone();
                for (name, on) in map {
                    if let Some(channel) = Channel::parse(&name) {
                        enabled.insert(channel, on);
                    }
                }
                enabled
            })
            .unwrap_or_else(|_| defaults.channel_enabled.clone());

        let channel_priority = serde_json::from_str::<Vec<String>>(&row.channel_priority)
            .map(|names| names.iter().filter_map(|n| Channel::parse(n)).collect::<Vec<_>>())
            .ok()
            .filter(|channels| !channels.is_empty())
            .unwrap_or_else(|| defaults.channel_priority.clone());

        let event_channels =
            serde_json::from_str::<BTreeMap<String, Vec<String>>>(&row.event_channels)
                .map(|map| {
                    map.into_iter()
                        .filter_map(|(event, channels)| {
                            let event = EventType::parse(&event)?;
                            let channels: Vec<Channel> =
                                channels.iter().filter_map(|c| Channel::parse(c)).collect();
                            Some((event, channels))
                        })
                        .collect()
                })
                .unwrap_or_default();

        let quiet_hours = QuietHours {
            enabled: row.quiet_hours_enabled,
            start: parse_time_of_day(&row.quiet_hours_start)
                .unwrap_or(defaults.quiet_hours.start),
            end: parse_time_of_day(&row.quiet_hours_end).unwrap_or(defaults.quiet_hours.end),
        };

        Self {
            user_id: row.user_id.clone(),
            subscribed_events,
            channel_enabled,
            channel_priority,
            event_channels,
            quiet_hours,
            email: row.email.clone(),
            phone: row.phone.clone(),
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
        }
    }
}

/// Patch applied through [`PreferenceResolver::update_preferences`].
///
/// `None` leaves a field unchanged. For `email` and `phone`, an empty string
/// clears the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePreferences {
    pub subscribed_events: Option<Vec<String>>,
    pub channel_enabled: Option<BTreeMap<String, bool>>,
    pub channel_priority: Option<Vec<String>>,
    pub event_channels: Option<BTreeMap<String, Vec<String>>>,
    pub quiet_hours_enabled: Option<bool>,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

fn parse_event_list(names: &[String]) -> Result<BTreeSet<EventType>> {
    names
        .iter()
        .map(|name| {
            EventType::parse(name)
                .ok_or_else(|| Error::validation(format!("unknown event type '{name}'")))
        })
        .collect()
}

fn parse_channel_list(names: &[String]) -> Result<Vec<Channel>> {
    let mut channels = Vec::with_capacity(names.len());
    for name in names {
        let channel = Channel::parse(name)
            .ok_or_else(|| Error::validation(format!("unknown channel '{name}'")))?;
        if channels.contains(&channel) {
            return Err(Error::validation(format!("duplicate channel '{name}'")));
        }
        channels.push(channel);
    }
    Ok(channels)
}

impl UpdatePreferences {
    /// Check every supplied field without touching any state.
    pub fn validate(&self) -> Result<()> {
        if let Some(events) = &self.subscribed_events {
            parse_event_list(events)?;
        }
        if let Some(enabled) = &self.channel_enabled {
            for name in enabled.keys() {
                Channel::parse(name)
                    .ok_or_else(|| Error::validation(format!("unknown channel '{name}'")))?;
            }
        }
        if let Some(priority) = &self.channel_priority {
            parse_channel_list(priority)?;
        }
        if let Some(event_channels) = &self.event_channels {
            for (event, channels) in event_channels {
                EventType::parse(event)
                    .ok_or_else(|| Error::validation(format!("unknown event type '{event}'")))?;
                parse_channel_list(channels)?;
            }
        }
        if let Some(start) = &self.quiet_hours_start {
            parse_time_of_day(start)?;
        }
        if let Some(end) = &self.quiet_hours_end {
            parse_time_of_day(end)?;
        }
        if let Some(email) = &self.email
            && !email.is_empty()
            && !is_valid_email(email)
        {
            return Err(Error::validation(format!("invalid email address '{email}'")));
        }
        if let Some(phone) = &self.phone
            && !phone.is_empty()
            && !is_valid_phone(phone)
        {
            return Err(Error::validation(format!("invalid phone number '{phone}'")));
        }
        Ok(())
    }

    /// Validate, then apply onto `prefs`.
    pub fn apply(&self, prefs: &mut UserNotificationPreferences) -> Result<()> {
        self.validate()?;

        if let Some(events) = &self.subscribed_events {
            prefs.subscribed_events = parse_event_list(events)?;
        }
        if let Some(enabled) = &self.channel_enabled {
            for (name, on) in enabled {
                if let Some(channel) = Channel::parse(name) {
                    prefs.channel_enabled.insert(channel, *on);
                }
            }
        }
        if let Some(priority) = &self.channel_priority {
            prefs.channel_priority = parse_channel_list(priority)?;
        }
        if let Some(event_channels) = &self.event_channels {
            prefs.event_channels.clear();
            for (event, channels) in event_channels {
                if let Some(event) = EventType::parse(event) {
                    prefs.event_channels.insert(event, parse_channel_list(channels)?);
                }
            }
        }
        if let Some(enabled) = self.quiet_hours_enabled {
            prefs.quiet_hours.enabled = enabled;
        }
        if let Some(start) = &self.quiet_hours_start {
            prefs.quiet_hours.start = parse_time_of_day(start)?;
        }
        if let Some(end) = &self.quiet_hours_end {
            prefs.quiet_hours.end = parse_time_of_day(end)?;
        }
        if let Some(email) = &self.email {
            prefs.email = (!email.is_empty()).then(|| email.trim().to_string());
        }
        if let Some(phone) = &self.phone {
            prefs.phone = (!phone.is_empty()).then(|| phone.trim().to_string());
        }
        prefs.updated_at = Utc::now();
        Ok(())
    }
}

/// Answers routing questions from stored preferences.
pub struct PreferenceResolver {
    repo: Arc<dyn PreferencesRepository>,
}

impl PreferenceResolver {
    pub fn new(repo: Arc<dyn PreferencesRepository>) -> Self {
        Self { repo }
    }

    /// Stored preferences, or synthesized defaults. Never fails.
    pub async fn get_preferences(&self, user_id: &str) -> UserNotificationPreferences {
        match self.repo.get(user_id).await {
            Ok(Some(row)) => UserNotificationPreferences::from_db_model(&row),
            Ok(None) => {
                let defaults = UserNotificationPreferences::defaults(user_id);
                self.persist_defaults(&defaults).await;
                defaults
            }
            Err(e) => {
                let err = Error::PreferenceLookup(e.to_string());
                warn!(user_id, error = %err, "Falling back to default preferences");
                UserNotificationPreferences::defaults(user_id)
            }
        }
    }

    async fn persist_defaults(&self, defaults: &UserNotificationPreferences) {
        let row = match defaults.to_db_model() {
            Ok(row) => row,
            Err(e) => {
                warn!(user_id = %defaults.user_id, error = %e, "Failed to encode default preferences");
                return;
            }
        };
        match self.repo.insert_if_absent(&row).await {
            Ok(true) => debug!(user_id = %defaults.user_id, "Persisted default preferences"),
            Ok(false) => {}
            Err(e) => {
                warn!(user_id = %defaults.user_id, error = %e, "Failed to persist default preferences")
            }
        }
    }

    /// Validate and persist a patch. Invalid input is rejected before any write.
    pub async fn update_preferences(
        &self,
        user_id: &str,
        update: &UpdatePreferences,
    ) -> Result<UserNotificationPreferences> {
        update.validate()?;

        let mut prefs = match self.repo.get(user_id).await? {
            Some(row) => UserNotificationPreferences::from_db_model(&row),
            None => UserNotificationPreferences::defaults(user_id),
        };
        update.apply(&mut prefs)?;
        self.repo.upsert(&prefs.to_db_model()?).await?;

        debug!(user_id, "Updated notification preferences");
        Ok(prefs)
    }

    pub async fn is_event_subscribed(&self, user_id: &str, event_type: EventType) -> bool {
        self.get_preferences(user_id)
            .await
            .is_event_subscribed(event_type)
    }

    pub async fn is_channel_enabled(&self, user_id: &str, channel: Channel) -> bool {
        self.get_preferences(user_id).await.is_channel_enabled(channel)
    }

    pub async fn is_in_quiet_hours(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        self.get_preferences(user_id).await.is_in_quiet_hours(now)
    }

    pub async fn get_channel_priorities(&self, user_id: &str, event_type: EventType) -> Vec<Channel> {
        self.get_preferences(user_id)
            .await
            .channel_priorities(event_type)
    }

    pub async fn get_optimal_channel(&self, user_id: &str, event_type: EventType) -> Result<Channel> {
        self.get_preferences(user_id)
            .await
            .optimal_channel(event_type)
    }

    pub async fn get_fallback_channels(&self, user_id: &str, event_type: EventType) -> Vec<Channel> {
        self.get_preferences(user_id)
            .await
            .fallback_channels(event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn window(start: (u32, u32), end: (u32, u32)) -> QuietHours {
        QuietHours {
            enabled: true,
            start: t(start.0, start.1),
            end: t(end.0, end.1),
        }
    }

    #[test]
    fn test_quiet_hours_crossing_midnight() {
        let quiet = window((22, 0), (8, 0));
        assert!(quiet.contains(t(23, 30)));
        assert!(quiet.contains(t(3, 0)));
        assert!(quiet.contains(t(22, 0)));
        assert!(quiet.contains(t(8, 0)));
        assert!(!quiet.contains(t(10, 0)));
        assert!(!quiet.contains(t(8, 1)));
    }

    #[test]
    fn test_quiet_hours_same_day() {
        let quiet = window((9, 0), (17, 0));
        assert!(quiet.contains(t(12, 0)));
        assert!(quiet.contains(t(9, 0)));
        assert!(quiet.contains(t(17, 0)));
        assert!(!quiet.contains(t(20, 0)));
    }

    #[test]
    fn test_end_boundary_includes_whole_minute() {
        let quiet = window((9, 0), (17, 0));
        assert!(quiet.contains(NaiveTime::from_hms_opt(17, 0, 45).unwrap()));
    }

    #[test]
    fn test_critical_events_never_suppressed() {
        let mut prefs = UserNotificationPreferences::defaults("u");
        prefs.quiet_hours = window((0, 0), (23, 59));
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        for event in EventType::iter().filter(|e| e.is_critical()) {
            assert!(!prefs.suppresses(event, false, now));
            assert!(!prefs.suppresses(event, true, now));
        }
        assert!(prefs.suppresses(EventType::FileUploaded, false, now));
        assert!(!prefs.suppresses(EventType::FileUploaded, true, now));
    }

    #[test]
    fn test_disabled_quiet_hours_never_suppress() {
        let mut prefs = UserNotificationPreferences::defaults("u");
        prefs.quiet_hours = window((0, 0), (23, 59));
        prefs.quiet_hours.enabled = false;
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert!(!prefs.suppresses(EventType::FileUploaded, false, now));
    }

    #[test]
    fn test_default_channels() {
        let prefs = UserNotificationPreferences::defaults("u");
        assert!(prefs.is_channel_enabled(Channel::Email));
        assert!(!prefs.is_channel_enabled(Channel::Sms));
        assert_eq!(
            prefs.fallback_channels(EventType::FileUploaded),
            vec![Channel::Email, Channel::Push, Channel::InApp]
        );
        assert_eq!(
            prefs.optimal_channel(EventType::FileUploaded).unwrap(),
            Channel::Email
        );
    }

    #[test]
    fn test_event_channel_override() {
        let mut prefs = UserNotificationPreferences::defaults("u");
        prefs
            .event_channels
            .insert(EventType::SecurityAlert, vec![Channel::Sms, Channel::Push]);
        prefs.channel_enabled.insert(Channel::Sms, true);

        assert_eq!(
            prefs.channel_priorities(EventType::SecurityAlert),
            vec![Channel::Sms, Channel::Push, Channel::Email, Channel::InApp]
        );
        assert_eq!(
            prefs.optimal_channel(EventType::SecurityAlert).unwrap(),
            Channel::Sms
        );
        assert_eq!(
            prefs.optimal_channel(EventType::FileShared).unwrap(),
            Channel::Email
        );
    }

    #[test]
    fn test_no_enabled_channel_is_unavailable() {
        let mut prefs = UserNotificationPreferences::defaults("u");
        for on in prefs.channel_enabled.values_mut() {
            *on = false;
        }
        assert!(matches!(
            prefs.optimal_channel(EventType::FileUploaded),
            Err(Error::ChannelUnavailable { .. })
        ));
        assert!(prefs.fallback_channels(EventType::FileUploaded).is_empty());
    }

    #[test]
    fn test_update_validation() {
        let bad_email = UpdatePreferences {
            email: Some("not-an-email".to_string()),
            ..Default::default()
        };
        assert!(bad_email.validate().is_err());

        let bad_phone = UpdatePreferences {
            phone: Some("12ab".to_string()),
            ..Default::default()
        };
        assert!(bad_phone.validate().is_err());

        let bad_time = UpdatePreferences {
            quiet_hours_start: Some("7:5".to_string()),
            ..Default::default()
        };
        assert!(bad_time.validate().is_err());

        let bad_hour = UpdatePreferences {
            quiet_hours_end: Some("25:00".to_string()),
            ..Default::default()
        };
        assert!(bad_hour.validate().is_err());

        let bad_event = UpdatePreferences {
            subscribed_events: Some(vec!["file.uploaded".into(), "file.teleported".into()]),
            ..Default::default()
        };
        assert!(bad_event.validate().is_err());

        let good = UpdatePreferences {
            email: Some("alice@example.com".to_string()),
            phone: Some("+1 (555) 123-4567".to_string()),
            quiet_hours_start: Some("23:15".to_string()),
            subscribed_events: Some(vec!["FileUploaded".into()]),
            channel_priority: Some(vec!["push".into(), "email".into()]),
            ..Default::default()
        };
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_db_model_round_trip() {
        let mut prefs = UserNotificationPreferences::defaults("u");
        prefs.subscribed_events = [EventType::FileUploaded].into_iter().collect();
        prefs.quiet_hours = window((21, 30), (6, 45));
        prefs.email = Some("u@example.com".to_string());
        prefs
            .event_channels
            .insert(EventType::FileShared, vec![Channel::InApp]);

        let row = prefs.to_db_model().unwrap();
        assert_eq!(row.quiet_hours_start, "21:30");
        let decoded = UserNotificationPreferences::from_db_model(&row);
        assert_eq!(decoded.subscribed_events, prefs.subscribed_events);
        assert_eq!(decoded.quiet_hours, prefs.quiet_hours);
        assert_eq!(decoded.event_channels, prefs.event_channels);
        assert_eq!(decoded.email, prefs.email);
    }

    #[derive(Default)]
    struct MemoryPreferences {
        rows: Mutex<HashMap<String, UserPreferencesDbModel>>,
        fail: bool,
    }

    #[async_trait]
    impl PreferencesRepository for MemoryPreferences {
        async fn get(&self, user_id: &str) -> Result<Option<UserPreferencesDbModel>> {
            if self.fail {
                return Err(Error::Database("database is locked".to_string()));
            }
            Ok(self.rows.lock().get(user_id).cloned())
        }

        async fn upsert(&self, prefs: &UserPreferencesDbModel) -> Result<()> {
            self.rows.lock().insert(prefs.user_id.clone(), prefs.clone());
            Ok(())
        }

        async fn insert_if_absent(&self, prefs: &UserPreferencesDbModel) -> Result<bool> {
            let mut rows = self.rows.lock();
            if rows.contains_key(&prefs.user_id) {
                return Ok(false);
            }
            rows.insert(prefs.user_id.clone(), prefs.clone());
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_missing_preferences_are_synthesized_and_persisted() {
        let repo = Arc::new(MemoryPreferences::default());
        let resolver = PreferenceResolver::new(repo.clone());

        let prefs = resolver.get_preferences("new-user").await;
        assert_eq!(prefs, UserNotificationPreferences {
            created_at: prefs.created_at,
            updated_at: prefs.updated_at,
            ..UserNotificationPreferences::defaults("new-user")
        });
        assert!(repo.rows.lock().contains_key("new-user"));
    }

    #[tokio::test]
    async fn test_storage_error_yields_defaults() {
        let repo = Arc::new(MemoryPreferences {
            fail: true,
            ..Default::default()
        });
        let resolver = PreferenceResolver::new(repo);

        assert!(
            resolver
                .is_event_subscribed("u", EventType::FileUploaded)
                .await
        );
        assert_eq!(
            resolver
                .get_optimal_channel("u", EventType::FileUploaded)
                .await
                .unwrap(),
            Channel::Email
        );
    }

    #[test]
    fn test_contact_formats() {
        assert!(is_valid_email("user@example.com"));
        assert!(!is_valid_email("user@example"));
        assert!(!is_valid_email("not an email"));

        assert!(is_valid_phone("+1 (555) 123-4567"));
        assert!(!is_valid_phone("0123"));
        assert!(!is_valid_phone("+44 abc"));
    }

    #[tokio::test]
    async fn test_invalid_update_is_not_persisted() {
        let repo = Arc::new(MemoryPreferences::default());
        let resolver = PreferenceResolver::new(repo.clone());

        let update = UpdatePreferences {
            quiet_hours_enabled: Some(true),
            quiet_hours_start: Some("noon".to_string()),
            ..Default::default()
        };
        assert!(resolver.update_preferences("u", &update).await.is_err());
        assert!(repo.rows.lock().is_empty());

        let update = UpdatePreferences {
            subscribed_events: Some(vec!["file.uploaded".to_string()]),
            channel_enabled: Some([("sms".to_string(), true)].into_iter().collect()),
            ..Default::default()
        };
        let prefs = resolver.update_preferences("u", &update).await.unwrap();
        assert!(prefs.is_channel_enabled(Channel::Sms));
        assert!(!prefs.is_event_subscribed(EventType::FileShared));
        assert!(
            !resolver
                .is_event_subscribed("u", EventType::FileShared)
                .await
        );
    }
}
