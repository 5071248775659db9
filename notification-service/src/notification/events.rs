//! Notification events.
//!
//! Defines the closed set of event types the pipeline understands, their
//! priority levels, and the inbound domain-event envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::template::{TemplateData, default_content};
use super::types::NotificationRequest;
use crate::{Error, Result};

/// Static metadata about a supported event type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EventTypeInfo {
    /// Canonical dotted name.
    pub event_type: &'static str,
    /// Human-friendly label.
    pub label: &'static str,
    /// Additional accepted names.
    pub aliases: &'static [&'static str],
    /// Critical events are never suppressed by quiet hours or batching.
    pub critical: bool,
}

const EVENT_TYPES: &[EventTypeInfo] = &[
    EventTypeInfo {
        event_type: "file.uploaded",
        label: "File Uploaded",
        aliases: &["FileUploaded", "upload.completed"],
        critical: false,
    },
    EventTypeInfo {
        event_type: "file.deleted",
        label: "File Deleted",
        aliases: &["FileDeleted"],
        critical: false,
    },
    EventTypeInfo {
        event_type: "file.shared",
        label: "File Shared",
        aliases: &["FileShared", "share.created"],
        critical: false,
    },
    EventTypeInfo {
        event_type: "file.downloaded",
        label: "File Downloaded",
        aliases: &["FileDownloaded"],
        critical: false,
    },
    EventTypeInfo {
        event_type: "quota.warning",
        label: "Storage Quota Warning",
        aliases: &["QuotaWarning", "storage.quota_warning"],
        critical: false,
    },
    EventTypeInfo {
        event_type: "quota.exceeded",
        label: "Storage Quota Exceeded",
        aliases: &["QuotaExceeded", "storage.quota_exceeded"],
        critical: true,
    },
    EventTypeInfo {
        event_type: "security.alert",
        label: "Security Alert",
        aliases: &["SecurityAlert"],
        critical: true,
    },
    EventTypeInfo {
        event_type: "auth.new_login",
        label: "New Sign-in",
        aliases: &["NewLogin", "auth.login"],
        critical: false,
    },
    EventTypeInfo {
        event_type: "billing.payment_succeeded",
        label: "Payment Received",
        aliases: &["PaymentSucceeded", "payment.succeeded"],
        critical: false,
    },
    EventTypeInfo {
        event_type: "billing.payment_failed",
        label: "Payment Failed",
        aliases: &["PaymentFailed", "payment.failed"],
        critical: false,
    },
    EventTypeInfo {
        event_type: "system.maintenance",
        label: "Scheduled Maintenance",
        aliases: &["SystemMaintenance", "maintenance.scheduled"],
        critical: true,
    },
];

pub fn event_types() -> &'static [EventTypeInfo] {
    EVENT_TYPES
}

/// Resolve any accepted spelling to the canonical dotted name.
pub fn canonicalize_event_name(input: &str) -> Option<&'static str> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized_input = normalize_event_key(trimmed);
    EVENT_TYPES
        .iter()
        .find(|info| {
            normalize_event_key(info.event_type) == normalized_input
                || info
                    .aliases
                    .iter()
                    .any(|alias| normalize_event_key(alias) == normalized_input)
        })
        .map(|info| info.event_type)
}

fn normalize_event_key(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !matches!(c, '.' | '_' | '-' | ' '))
        .collect()
}

/// Domain occurrence a notification concerns.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, strum::EnumIter,
)]
#[serde(into = "&'static str", try_from = "String")]
pub enum EventType {
    FileUploaded,
    FileDeleted,
    FileShared,
    FileDownloaded,
    QuotaWarning,
    QuotaExceeded,
    SecurityAlert,
    NewLogin,
    PaymentSucceeded,
    PaymentFailed,
    SystemMaintenance,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileUploaded => "file.uploaded",
            Self::FileDeleted => "file.deleted",
            Self::FileShared => "file.shared",
            Self::FileDownloaded => "file.downloaded",
            Self::QuotaWarning => "quota.warning",
            Self::QuotaExceeded => "quota.exceeded",
            Self::SecurityAlert => "security.alert",
            Self::NewLogin => "auth.new_login",
            Self::PaymentSucceeded => "billing.payment_succeeded",
            Self::PaymentFailed => "billing.payment_failed",
            Self::SystemMaintenance => "system.maintenance",
        }
    }

    /// Parse a canonical name or any alias.
    pub fn parse(s: &str) -> Option<Self> {
        match canonicalize_event_name(s)? {
            "file.uploaded" => Some(Self::FileUploaded),
            "file.deleted" => Some(Self::FileDeleted),
            "file.shared" => Some(Self::FileShared),
            "file.downloaded" => Some(Self::FileDownloaded),
            "quota.warning" => Some(Self::QuotaWarning),
            "quota.exceeded" => Some(Self::QuotaExceeded),
            "security.alert" => Some(Self::SecurityAlert),
            "auth.new_login" => Some(Self::NewLogin),
            "billing.payment_succeeded" => Some(Self::PaymentSucceeded),
            "billing.payment_failed" => Some(Self::PaymentFailed),
            "system.maintenance" => Some(Self::SystemMaintenance),
            _ => None,
        }
    }

    pub fn info(&self) -> EventTypeInfo {
        let name = self.as_str();
        EVENT_TYPES
            .iter()
            .copied()
            .find(|info| info.event_type == name)
            .unwrap_or(EventTypeInfo {
                event_type: name,
                label: name,
                aliases: &[],
                critical: false,
            })
    }

    pub fn label(&self) -> &'static str {
        self.info().label
    }

    /// Member of the critical set: bypasses quiet hours and batching.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded | Self::SecurityAlert | Self::SystemMaintenance
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EventType> for &'static str {
    fn from(value: EventType) -> Self {
        value.as_str()
    }
}

impl TryFrom<String> for EventType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value).ok_or_else(|| Error::validation(format!("unknown event type: {value}")))
    }
}

/// Priority level for notifications.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    /// Informational only.
    Low,
    #[default]
    Normal,
    High,
    /// Requires immediate attention.
    Critical,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" | "urgent" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Inbound domain event as emitted by the file, auth and billing services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: EventType,
    pub user_id: String,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_success() -> bool {
    true
}

impl DomainEvent {
    pub fn new(event_type: EventType, user_id: impl Into<String>) -> Self {
        Self {
            event_type,
            user_id: user_id.into(),
            file_id: None,
            file_name: None,
            file_size: None,
            success: true,
            error: None,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_file(
        mut self,
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
    ) -> Self {
        self.file_id = Some(file_id.into());
        self.file_name = Some(file_name.into());
        self.file_size = Some(file_size);
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    /// Critical events keep their urgency; otherwise failures are high and
    /// successes normal.
    pub fn priority(&self) -> NotificationPriority {
        if self.event_type.is_critical() {
            NotificationPriority::Critical
        } else if !self.success {
            NotificationPriority::High
        } else {
            NotificationPriority::Normal
        }
    }

    /// Deterministic translation into a notification request.
    ///
    /// The title and message are the per-event defaults; an active template
    /// replaces them at render time.
    pub fn to_request(&self) -> NotificationRequest {
        let mut metadata = self.metadata.clone();
        if let Some(file_id) = &self.file_id {
            metadata.insert("file_id".to_string(), Value::from(file_id.as_str()));
        }
        if let Some(file_name) = &self.file_name {
            metadata.insert("file_name".to_string(), Value::from(file_name.as_str()));
        }
        if let Some(file_size) = self.file_size {
            metadata.insert("file_size".to_string(), Value::from(file_size));
        }
        metadata.insert("success".to_string(), Value::Bool(self.success));
        if let Some(error) = &self.error {
            metadata.insert("error".to_string(), Value::from(error.as_str()));
        }
        metadata.insert(
            "timestamp".to_string(),
            Value::from(self.timestamp.to_rfc3339()),
        );

        let data = TemplateData::from_metadata(self.event_type, &metadata);
        let (title, message) = default_content(self.event_type, &data);

        NotificationRequest::new(self.user_id.clone(), self.event_type)
            .with_content(title, message)
            .with_priority(self.priority())
            .with_metadata(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_priority_ordering() {
        assert!(NotificationPriority::Low < NotificationPriority::Normal);
        assert!(NotificationPriority::Normal < NotificationPriority::High);
        assert!(NotificationPriority::High < NotificationPriority::Critical);
        assert_eq!(NotificationPriority::default(), NotificationPriority::Normal);
        assert_eq!(NotificationPriority::Critical.to_string(), "critical");
    }

    #[test]
    fn test_event_type_aliases() {
        assert_eq!(EventType::parse("file.uploaded"), Some(EventType::FileUploaded));
        assert_eq!(EventType::parse("FileUploaded"), Some(EventType::FileUploaded));
        assert_eq!(EventType::parse("file_uploaded"), Some(EventType::FileUploaded));
        assert_eq!(EventType::parse(" Security-Alert "), Some(EventType::SecurityAlert));
        assert_eq!(EventType::parse("file.exploded"), None);
        assert_eq!(EventType::parse(""), None);
    }

    #[test]
    fn test_every_variant_round_trips_its_name() {
        for event_type in EventType::iter() {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
            assert_eq!(event_type.info().event_type, event_type.as_str());
            assert_eq!(event_type.is_critical(), event_type.info().critical);
        }
    }

    #[test]
    fn test_serde_uses_dotted_names() {
        let json = serde_json::to_string(&EventType::NewLogin).unwrap();
        assert_eq!(json, "\"auth.new_login\"");
        let parsed: EventType = serde_json::from_str("\"QuotaExceeded\"").unwrap();
        assert_eq!(parsed, EventType::QuotaExceeded);
        assert!(serde_json::from_str::<EventType>("\"nope\"").is_err());
    }

    #[test]
    fn test_domain_event_to_request() {
        let event = DomainEvent::new(EventType::FileUploaded, "user-1")
            .with_file("f-1", "report.pdf", 1_572_864)
            .failed("virus scan failed");
        let request = event.to_request();

        assert_eq!(request.user_id, "user-1");
        assert_eq!(request.event_type, EventType::FileUploaded);
        assert_eq!(request.priority, NotificationPriority::High);
        assert_eq!(request.metadata["file_name"], "report.pdf");
        assert_eq!(request.metadata["success"], false);
        assert_eq!(request.metadata["error"], "virus scan failed");
        assert!(!request.title.is_empty());
        assert!(request.message.contains("report.pdf"));
    }

    #[test]
    fn test_critical_event_priority() {
        let event = DomainEvent::new(EventType::SecurityAlert, "user-1");
        assert_eq!(event.priority(), NotificationPriority::Critical);
        assert_eq!(
            DomainEvent::new(EventType::FileShared, "u").priority(),
            NotificationPriority::Normal
        );
    }
}
