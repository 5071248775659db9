//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Preference lookup failed: {0}")]
    PreferenceLookup(String),

    #[error("Channel {channel} unavailable: {reason}")]
    ChannelUnavailable { channel: String, reason: String },

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Template render error: {0}")]
    TemplateRender(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn channel_unavailable(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ChannelUnavailable {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error was raised by the storage layer.
    ///
    /// Storage failures mean the notification was not accepted.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::DatabaseSqlx(_) | Self::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_unavailable_display() {
        let err = Error::channel_unavailable("sms", "handler disabled");
        assert_eq!(err.to_string(), "Channel sms unavailable: handler disabled");
    }

    #[test]
    fn test_is_storage() {
        assert!(Error::Database("locked".to_string()).is_storage());
        assert!(!Error::validation("bad").is_storage());
    }
}
