//! Service configuration.
//!
//! Defaults are usable as-is. `from_env` loads a `.env` file when present and
//! overrides individual values from `NOTIFY_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Scheduled retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Notifications retried per pass.
    pub batch_size: u32,
    pub interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            jitter: true,
            batch_size: 100,
            interval_secs: 30,
        }
    }
}

/// Batching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub enabled: bool,
    /// Sliding expiry of an aggregation key, refreshed on every append.
    pub window_secs: u64,
    pub flush_interval_secs: u64,
    /// A batch reaching this size is flushed immediately.
    pub max_items_per_batch: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 300,
            flush_interval_secs: 60,
            max_items_per_batch: 100,
        }
    }
}

/// Dead-letter replay and retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub retention_days: u32,
    pub batch_size: u32,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 60_000,
            max_delay_ms: 3_600_000,
            interval_secs: 300,
            cleanup_interval_secs: 3_600,
            retention_days: 7,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Upper bound on a single channel send.
    pub send_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 10_000,
        }
    }
}

impl DeliveryConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// HTTP relay in front of an email, SMS or push provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            token: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub email: GatewayConfig,
    pub sms: GatewayConfig,
    pub push: GatewayConfig,
    pub in_app: bool,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            email: GatewayConfig::default(),
            sms: GatewayConfig::default(),
            push: GatewayConfig::default(),
            in_app: true,
        }
    }
}

/// Top-level configuration for the notification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationServiceConfig {
    pub database_url: String,
    pub log_dir: Option<PathBuf>,
    pub retry: RetryConfig,
    pub batching: BatchingConfig,
    pub dead_letter: DeadLetterConfig,
    pub delivery: DeliveryConfig,
    pub channels: ChannelsConfig,
}

impl Default for NotificationServiceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:notifications.db?mode=rwc".to_string(),
            log_dir: None,
            retry: RetryConfig::default(),
            batching: BatchingConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            delivery: DeliveryConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()> {
    if let Some(raw) = lookup(key) {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(());
        }
        *target = raw
            .parse()
            .map_err(|_| Error::config(format!("Invalid value for {key}: '{raw}'")))?;
    }
    Ok(())
}

fn parse_gateway(
    lookup: &impl Fn(&str) -> Option<String>,
    prefix: &str,
    target: &mut GatewayConfig,
) -> Result<()> {
    parse_var(lookup, &format!("{prefix}_ENABLED"), &mut target.enabled)?;
    parse_var(lookup, &format!("{prefix}_URL"), &mut target.url)?;
    parse_var(lookup, &format!("{prefix}_TIMEOUT_SECS"), &mut target.timeout_secs)?;
    if let Some(token) = lookup(&format!("{prefix}_TOKEN")).filter(|t| !t.trim().is_empty()) {
        target.token = Some(token.trim().to_string());
    }
    Ok(())
}

impl NotificationServiceConfig {
    /// Load from the process environment (and `.env` if present), then validate.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        parse_var(&lookup, "NOTIFY_DATABASE_URL", &mut config.database_url)?;
        if let Some(dir) = lookup("NOTIFY_LOG_DIR").filter(|d| !d.trim().is_empty()) {
            config.log_dir = Some(PathBuf::from(dir.trim()));
        }

        let retry = &mut config.retry;
        parse_var(&lookup, "NOTIFY_RETRY_MAX_RETRIES", &mut retry.max_retries)?;
        parse_var(&lookup, "NOTIFY_RETRY_BASE_DELAY_MS", &mut retry.base_delay_ms)?;
        parse_var(&lookup, "NOTIFY_RETRY_MULTIPLIER", &mut retry.multiplier)?;
        parse_var(&lookup, "NOTIFY_RETRY_MAX_DELAY_MS", &mut retry.max_delay_ms)?;
        parse_var(&lookup, "NOTIFY_RETRY_JITTER", &mut retry.jitter)?;
        parse_var(&lookup, "NOTIFY_RETRY_BATCH_SIZE", &mut retry.batch_size)?;
        parse_var(&lookup, "NOTIFY_RETRY_INTERVAL_SECS", &mut retry.interval_secs)?;

        let batching = &mut config.batching;
        parse_var(&lookup, "NOTIFY_BATCHING_ENABLED", &mut batching.enabled)?;
        parse_var(&lookup, "NOTIFY_BATCHING_WINDOW_SECS", &mut batching.window_secs)?;
        parse_var(
            &lookup,
            "NOTIFY_BATCHING_FLUSH_INTERVAL_SECS",
            &mut batching.flush_interval_secs,
        )?;
        parse_var(
            &lookup,
            "NOTIFY_BATCHING_MAX_ITEMS",
            &mut batching.max_items_per_batch,
        )?;

        let dead_letter = &mut config.dead_letter;
        parse_var(&lookup, "NOTIFY_DLQ_MAX_RETRIES", &mut dead_letter.max_retries)?;
        parse_var(&lookup, "NOTIFY_DLQ_BASE_DELAY_MS", &mut dead_letter.base_delay_ms)?;
        parse_var(&lookup, "NOTIFY_DLQ_MAX_DELAY_MS", &mut dead_letter.max_delay_ms)?;
        parse_var(&lookup, "NOTIFY_DLQ_INTERVAL_SECS", &mut dead_letter.interval_secs)?;
        parse_var(
            &lookup,
            "NOTIFY_DLQ_CLEANUP_INTERVAL_SECS",
            &mut dead_letter.cleanup_interval_secs,
        )?;
        parse_var(&lookup, "NOTIFY_DLQ_RETENTION_DAYS", &mut dead_letter.retention_days)?;
        parse_var(&lookup, "NOTIFY_DLQ_BATCH_SIZE", &mut dead_letter.batch_size)?;

        parse_var(
            &lookup,
            "NOTIFY_SEND_TIMEOUT_MS",
            &mut config.delivery.send_timeout_ms,
        )?;

        parse_gateway(&lookup, "NOTIFY_EMAIL_GATEWAY", &mut config.channels.email)?;
        parse_gateway(&lookup, "NOTIFY_SMS_GATEWAY", &mut config.channels.sms)?;
        parse_gateway(&lookup, "NOTIFY_PUSH_GATEWAY", &mut config.channels.push)?;
        parse_var(&lookup, "NOTIFY_IN_APP_ENABLED", &mut config.channels.in_app)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or break the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }

        let retry = &self.retry;
        if !(retry.multiplier >= 1.0 && retry.multiplier.is_finite()) {
            return Err(Error::config("retry.multiplier must be a finite value >= 1.0"));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(Error::config("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }
        if retry.interval_secs == 0 || retry.batch_size == 0 {
            return Err(Error::config("retry.interval_secs and retry.batch_size must be > 0"));
        }

        let batching = &self.batching;
        if batching.flush_interval_secs == 0 || batching.window_secs == 0 {
            return Err(Error::config(
                "batching.flush_interval_secs and batching.window_secs must be > 0",
            ));
        }
        if batching.max_items_per_batch == 0 {
            return Err(Error::config("batching.max_items_per_batch must be > 0"));
        }
        if batching.window_secs <= batching.flush_interval_secs {
            return Err(Error::config(
                "batching.window_secs must be greater than batching.flush_interval_secs",
            ));
        }

        let dead_letter = &self.dead_letter;
        if dead_letter.base_delay_ms > dead_letter.max_delay_ms {
            return Err(Error::config(
                "dead_letter.base_delay_ms must not exceed dead_letter.max_delay_ms",
            ));
        }
        if dead_letter.interval_secs == 0
            || dead_letter.cleanup_interval_secs == 0
            || dead_letter.batch_size == 0
        {
            return Err(Error::config(
                "dead_letter intervals and batch_size must be > 0",
            ));
        }

        if self.delivery.send_timeout_ms == 0 {
            return Err(Error::config("delivery.send_timeout_ms must be > 0"));
        }

        for (name, gateway) in [
            ("email", &self.channels.email),
            ("sms", &self.channels.sms),
            ("push", &self.channels.push),
        ] {
            if gateway.enabled && gateway.url.trim().is_empty() {
                return Err(Error::config(format!(
                    "channels.{name}.url is required when the gateway is enabled"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = NotificationServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.dead_letter.retention_days, 7);
        assert!(config.channels.in_app);
    }

    #[test]
    fn test_env_overrides() {
        let config = NotificationServiceConfig::from_lookup(lookup(&[
            ("NOTIFY_RETRY_MAX_RETRIES", "5"),
            ("NOTIFY_RETRY_MULTIPLIER", "1.5"),
            ("NOTIFY_BATCHING_ENABLED", "false"),
            ("NOTIFY_EMAIL_GATEWAY_ENABLED", "true"),
            ("NOTIFY_EMAIL_GATEWAY_URL", "http://relay.local/email"),
            ("NOTIFY_EMAIL_GATEWAY_TOKEN", "secret"),
            ("NOTIFY_LOG_DIR", "/var/log/notify"),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.multiplier, 1.5);
        assert!(!config.batching.enabled);
        assert!(config.channels.email.enabled);
        assert_eq!(config.channels.email.token.as_deref(), Some("secret"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/notify")));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(
            NotificationServiceConfig::from_lookup(lookup(&[("NOTIFY_RETRY_MAX_RETRIES", "many")]))
                .is_err()
        );
        assert!(
            NotificationServiceConfig::from_lookup(lookup(&[("NOTIFY_RETRY_MULTIPLIER", "0.5")]))
                .is_err()
        );
        assert!(
            NotificationServiceConfig::from_lookup(lookup(&[(
                "NOTIFY_SMS_GATEWAY_ENABLED",
                "true"
            )]))
            .is_err()
        );

        let mut config = NotificationServiceConfig::default();
        config.retry.base_delay_ms = config.retry.max_delay_ms + 1;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_batch_window_must_outlast_flush_interval() {
        let mut config = NotificationServiceConfig::default();
        config.batching.window_secs = config.batching.flush_interval_secs;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.batching.window_secs = config.batching.flush_interval_secs + 1;
        assert!(config.validate().is_ok());

        assert!(
            NotificationServiceConfig::from_lookup(lookup(&[
                ("NOTIFY_BATCHING_WINDOW_SECS", "30"),
                ("NOTIFY_BATCHING_FLUSH_INTERVAL_SECS", "60"),
            ]))
            .is_err()
        );
    }
}
