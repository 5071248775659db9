//! Notification batching.
//!
//! Non-critical requests are appended to a per `(user, event type, channel)`
//! aggregation key whose expiry slides forward on every append. The periodic
//! flush drains every key and sends one aggregate notification per non-empty
//! key. A key whose window lapsed before a flush reached it is still
//! delivered; expiry only marks it as late.
//!
//! When the aggregate cannot be written to the ledger, the drained items are
//! appended back so the next flush retries them.
//!
//! Draining is read-then-delete unless the store overrides it with an atomic
//! removal. With a read-then-delete store, an append landing between the read
//! and the delete of the same key is lost. Batching is best-effort, not
//! exactly-once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::dispatcher::ChannelDispatcher;
use super::events::{EventType, NotificationPriority};
use super::preferences::PreferenceResolver;
use super::scheduler::PassGuard;
use super::template::{TemplateData, default_content};
use super::types::{
    MAX_MESSAGE_LEN, MAX_TITLE_LEN, NotificationRequest, SendResponse, SendStatus,
};
use crate::Result;
use crate::config::BatchingConfig;
use crate::database::models::Channel;

/// Aggregation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    pub user_id: String,
    pub event_type: EventType,
    pub channel: Channel,
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.user_id, self.event_type, self.channel)
    }
}

/// One buffered request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl BatchItem {
    pub fn from_request(request: &NotificationRequest) -> Self {
        Self {
            file_name: request.meta_str("file_name"),
            file_size: request.metadata.get("file_size").and_then(Value::as_u64),
            success: request
                .metadata
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            error: request.meta_str("error"),
            metadata: request.metadata.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Sorted-collection store backing the batching engine.
///
/// Members of a key are ordered by score. Every append refreshes the key's
/// expiry to `ttl` from now. Expiry never discards members; they stay until
/// drained.
#[async_trait]
pub trait AggregationStore: Send + Sync {
    /// Append a member and return the key's new size.
    async fn append(&self, key: &BatchKey, item: BatchItem, score: i64, ttl: Duration)
    -> Result<usize>;

    /// Every key holding members, expired or not.
    async fn keys(&self) -> Result<Vec<BatchKey>>;

    /// Members in score order. Missing keys read as empty.
    async fn read(&self, key: &BatchKey) -> Result<Vec<BatchItem>>;

    async fn delete(&self, key: &BatchKey) -> Result<()>;

    /// Remove and return every member of `key`.
    async fn drain(&self, key: &BatchKey) -> Result<Vec<BatchItem>> {
        let items = self.read(key).await?;
        self.delete(key).await?;
        Ok(items)
    }

    /// Keys whose window lapsed without being drained.
    async fn expired_keys(&self) -> Result<Vec<BatchKey>>;
}

#[derive(Debug)]
struct Bucket {
    members: Vec<(i64, BatchItem)>,
    expires_at: Instant,
}

impl Bucket {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-process aggregation store.
#[derive(Debug, Default)]
pub struct InMemoryAggregationStore {
    buckets: DashMap<BatchKey, Bucket>,
}

impl InMemoryAggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut members: Vec<(i64, BatchItem)>) -> Vec<BatchItem> {
        members.sort_by_key(|(score, _)| *score);
        members.into_iter().map(|(_, item)| item).collect()
    }
}

#[async_trait]
impl AggregationStore for InMemoryAggregationStore {
    async fn append(
        &self,
        key: &BatchKey,
        item: BatchItem,
        score: i64,
        ttl: Duration,
    ) -> Result<usize> {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.clone()).or_insert_with(|| Bucket {
            members: Vec::new(),
            expires_at: now + ttl,
        });
        bucket.members.push((score, item));
        bucket.expires_at = now + ttl;
        Ok(bucket.members.len())
    }

    async fn keys(&self) -> Result<Vec<BatchKey>> {
        let mut keys: Vec<BatchKey> = self
            .buckets
            .iter()
            .filter(|entry| !entry.value().members.is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn read(&self, key: &BatchKey) -> Result<Vec<BatchItem>> {
        Ok(self
            .buckets
            .get(key)
            .map(|bucket| Self::sorted(bucket.members.clone()))
            .unwrap_or_default())
    }

    async fn delete(&self, key: &BatchKey) -> Result<()> {
        self.buckets.remove(key);
        Ok(())
    }

    async fn drain(&self, key: &BatchKey) -> Result<Vec<BatchItem>> {
        Ok(self
            .buckets
            .remove(key)
            .map(|(_, bucket)| Self::sorted(bucket.members))
            .unwrap_or_default())
    }

    async fn expired_keys(&self) -> Result<Vec<BatchKey>> {
        let now = Instant::now();
        let mut keys: Vec<BatchKey> = self
            .buckets
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub skipped: bool,
    pub keys: usize,
    /// Keys whose window had lapsed before this pass.
    pub late: usize,
    pub items: usize,
    pub notifications: usize,
    pub errors: usize,
}

/// Title and message summarising a batch.
pub fn aggregate_content(event_type: EventType, items: &[BatchItem]) -> (String, String) {
    let total = items.len();
    let failed = items.iter().filter(|item| !item.success).count();
    let succeeded = total - failed;

    if total == 1 {
        let data = TemplateData::from_metadata(event_type, &items[0].metadata);
        return default_content(event_type, &data);
    }

    let files = |n: usize| if n == 1 { "file" } else { "files" };
    let title = match event_type {
        EventType::FileUploaded => {
            if failed == 0 {
                format!("{total} {} uploaded successfully", files(total))
            } else if succeeded == 0 {
                format!("{failed} file {} failed", plural(failed, "upload", "uploads"))
            } else {
                format!("{succeeded} {} uploaded, {failed} failed", files(succeeded))
            }
        }
        EventType::FileDeleted => format!("{total} files deleted"),
        EventType::FileShared => format!("{total} files shared with you"),
        EventType::FileDownloaded => format!("{total} files downloaded"),
        other => format!("{total} {} notifications", other.label()),
    };

    let mut message = summarize_names(items.iter().filter(|item| item.success));
    let failures: Vec<String> = items
        .iter()
        .filter(|item| !item.success)
        .map(|item| {
            let name = item.file_name.as_deref().unwrap_or("unnamed file");
            match &item.error {
                Some(error) => format!("{name} ({error})"),
                None => name.to_string(),
            }
        })
        .collect();
    if !failures.is_empty() {
        if !message.is_empty() {
            message.push(' ');
        }
        message.push_str(&format!("Failed: {}.", truncate_list(&failures)));
    }
    if message.is_empty() {
        message = format!("{total} events were grouped into this notification.");
    }

    (title, message)
}

fn plural<'a>(n: usize, one: &'a str, many: &'a str) -> &'a str {
    if n == 1 { one } else { many }
}

const MAX_LISTED_NAMES: usize = 5;

fn truncate_list(names: &[String]) -> String {
    if names.len() <= MAX_LISTED_NAMES {
        return names.join(", ");
    }
    format!(
        "{} and {} more",
        names[..MAX_LISTED_NAMES].join(", "),
        names.len() - MAX_LISTED_NAMES
    )
}

fn summarize_names<'a>(items: impl Iterator<Item = &'a BatchItem>) -> String {
    let names: Vec<String> = items.filter_map(|item| item.file_name.clone()).collect();
    if names.is_empty() {
        String::new()
    } else {
        format!("Files: {}.", truncate_list(&names))
    }
}

const ELLIPSIS: &str = "…";

/// Cut `text` to at most `max_bytes`, on a char boundary, marking the cut.
fn clamp_text(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes.saturating_sub(ELLIPSIS.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{ELLIPSIS}", &text[..end])
}

/// The single request sent for a drained batch.
pub fn aggregate_request(key: &BatchKey, items: &[BatchItem]) -> NotificationRequest {
    let failure_count = items.iter().filter(|item| !item.success).count();
    let success_count = items.len() - failure_count;
    let (title, message) = aggregate_content(key.event_type, items);
    let title = clamp_text(title, MAX_TITLE_LEN);
    let message = clamp_text(message, MAX_MESSAGE_LEN);

    let summaries: Vec<Value> = items
        .iter()
        .map(|item| {
            json!({
                "file_name": item.file_name,
                "file_size": item.file_size,
                "success": item.success,
                "error": item.error,
                "timestamp": item.timestamp.to_rfc3339(),
            })
        })
        .collect();

    let mut request = NotificationRequest::new(key.user_id.clone(), key.event_type)
        .with_content(title, message)
        .with_channel(key.channel)
        .with_priority(if failure_count > 0 {
            NotificationPriority::High
        } else {
            NotificationPriority::Normal
        })
        .with_meta("batched", true)
        .with_meta("count", items.len() as u64)
        .with_meta("success_count", success_count as u64)
        .with_meta("failure_count", failure_count as u64)
        .with_meta("items", Value::Array(summaries))
        .bypass_batching();
    if let [only] = items {
        for (k, v) in &only.metadata {
            request.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    request
}

pub struct BatchingEngine {
    store: Arc<dyn AggregationStore>,
    preferences: Arc<PreferenceResolver>,
    dispatcher: Arc<ChannelDispatcher>,
    config: BatchingConfig,
    guard: PassGuard,
}

impl BatchingEngine {
    pub fn new(
        store: Arc<dyn AggregationStore>,
        preferences: Arc<PreferenceResolver>,
        dispatcher: Arc<ChannelDispatcher>,
        config: BatchingConfig,
    ) -> Self {
        Self {
            store,
            preferences,
            dispatcher,
            config,
            guard: PassGuard::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether `request` is eligible for batching. Only an explicit bypass or
    /// a critical event type keeps a request out of the batch, so failures are
    /// aggregated alongside successes.
    pub fn should_batch(&self, request: &NotificationRequest) -> bool {
        self.config.enabled && !request.bypass_batching && !request.event_type.is_critical()
    }

    /// Buffer `request` until the next flush.
    ///
    /// A key reaching `max_items_per_batch` is flushed immediately.
    pub async fn add_to_batch(&self, request: &NotificationRequest) -> Result<SendResponse> {
        request.validate()?;
        let channel = match request.channel {
            Some(channel) => channel,
            None => {
                self.preferences
                    .get_optimal_channel(&request.user_id, request.event_type)
                    .await?
            }
        };
        let key = BatchKey {
            user_id: request.user_id.clone(),
            event_type: request.event_type,
            channel,
        };

        let item = BatchItem::from_request(request);
        let score = item.timestamp.timestamp_millis();
        let ttl = Duration::from_secs(self.config.window_secs);
        let size = self.store.append(&key, item, score, ttl).await?;
        debug!(key = %key, size, "Added notification to batch");

        if size >= self.config.max_items_per_batch.max(1) {
            info!(key = %key, size, "Batch full, flushing early");
            if let Err(e) = self.flush_key(&key).await {
                warn!(key = %key, error = %e, "Early batch flush failed");
            }
        }

        Ok(SendResponse::without_record(SendStatus::Batched, Some(channel)))
    }

    /// Drain every key and send one aggregate per non-empty key.
    pub async fn flush(&self) -> Result<FlushReport> {
        let Some(_token) = self.guard.try_begin() else {
            debug!("Batch flush already running, skipping");
            return Ok(FlushReport {
                skipped: true,
                ..Default::default()
            });
        };

        let late = self.store.expired_keys().await?.len();
        if late > 0 {
            warn!(late, "Flushing batch keys whose window already lapsed");
        }

        let keys = self.store.keys().await?;
        let mut report = FlushReport {
            keys: keys.len(),
            late,
            ..Default::default()
        };

        for key in keys {
            match self.flush_key(&key).await {
                Ok(Some(count)) => {
                    report.items += count;
                    report.notifications += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to flush batch");
                    report.errors += 1;
                }
            }
        }

        if report.notifications > 0 {
            info!(
                keys = report.keys,
                items = report.items,
                notifications = report.notifications,
                "Batch flush finished"
            );
        }
        Ok(report)
    }

    /// Drain one key. Returns the number of items aggregated, or `None` when
    /// the key was empty.
    async fn flush_key(&self, key: &BatchKey) -> Result<Option<usize>> {
        let items = self.store.drain(key).await?;
        if items.is_empty() {
            return Ok(None);
        }

        let request = aggregate_request(key, &items);
        let response = match self.dispatcher.send(&request).await {
            Ok(response) => response,
            Err(e) if e.is_storage() => {
                warn!(
                    key = %key,
                    count = items.len(),
                    error = %e,
                    "Aggregate not persisted, returning items to the batch"
                );
                self.restore(key, items).await?;
                return Err(e);
            }
            Err(e) => {
                warn!(
                    key = %key,
                    count = items.len(),
                    error = %e,
                    "Dropping undeliverable batch"
                );
                return Err(e);
            }
        };
        debug!(
            key = %key,
            count = items.len(),
            status = %response.status,
            "Sent aggregate notification"
        );
        Ok(Some(items.len()))
    }

    async fn restore(&self, key: &BatchKey, items: Vec<BatchItem>) -> Result<()> {
        let ttl = Duration::from_secs(self.config.window_secs);
        for item in items {
            let score = item.timestamp.timestamp_millis();
            self.store.append(key, item, score, ttl).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, success: bool) -> BatchItem {
        let mut metadata = Map::new();
        metadata.insert("file_name".into(), Value::from(name));
        metadata.insert("file_size".into(), Value::from(2048u64));
        metadata.insert("success".into(), Value::Bool(success));
        BatchItem {
            file_name: Some(name.to_string()),
            file_size: Some(2048),
            success,
            error: (!success).then(|| "disk full".to_string()),
            metadata,
            timestamp: Utc::now(),
        }
    }

    fn key() -> BatchKey {
        BatchKey {
            user_id: "u-1".to_string(),
            event_type: EventType::FileUploaded,
            channel: Channel::Email,
        }
    }

    #[test]
    fn test_aggregate_titles() {
        let all_ok: Vec<BatchItem> = (0..5).map(|i| item(&format!("f{i}.txt"), true)).collect();
        let (title, message) = aggregate_content(EventType::FileUploaded, &all_ok);
        assert_eq!(title, "5 files uploaded successfully");
        assert!(message.starts_with("Files: f0.txt"));

        let mixed = vec![item("a", true), item("b", true), item("c", false)];
        let (title, message) = aggregate_content(EventType::FileUploaded, &mixed);
        assert_eq!(title, "2 files uploaded, 1 failed");
        assert!(message.contains("Failed: c (disk full)."));

        let failed = vec![item("a", false), item("b", false)];
        assert_eq!(
            aggregate_content(EventType::FileUploaded, &failed).0,
            "2 file uploads failed"
        );

        let one_ok = vec![item("a", true), item("b", false)];
        assert_eq!(
            aggregate_content(EventType::FileUploaded, &one_ok).0,
            "1 file uploaded, 1 failed"
        );

        let warnings = vec![item("a", true), item("b", true)];
        assert_eq!(
            aggregate_content(EventType::QuotaWarning, &warnings).0,
            format!("2 {} notifications", EventType::QuotaWarning.label())
        );
    }

    #[test]
    fn test_single_item_uses_default_content() {
        let (title, message) = aggregate_content(EventType::FileUploaded, &[item("a.txt", true)]);
        assert_eq!(title, "File uploaded");
        assert!(message.contains("a.txt"));
    }

    #[test]
    fn test_long_name_lists_are_truncated() {
        let items: Vec<BatchItem> = (0..8).map(|i| item(&format!("f{i}"), true)).collect();
        let (_, message) = aggregate_content(EventType::FileUploaded, &items);
        assert!(message.ends_with("and 3 more."));
    }

    #[test]
    fn test_aggregate_request_counts() {
        let items = vec![item("a", true), item("b", false), item("c", true)];
        let request = aggregate_request(&key(), &items);
        assert_eq!(request.metadata["count"], 3);
        assert_eq!(request.metadata["success_count"], 2);
        assert_eq!(request.metadata["failure_count"], 1);
        assert_eq!(request.metadata["items"].as_array().unwrap().len(), 3);
        assert_eq!(request.channel, Some(Channel::Email));
        assert_eq!(request.priority, NotificationPriority::High);
        assert!(request.bypass_batching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_orders_by_score_and_slides_expiry() {
        let store = InMemoryAggregationStore::new();
        let ttl = Duration::from_secs(10);
        assert_eq!(store.append(&key(), item("b", true), 2, ttl).await.unwrap(), 1);
        assert_eq!(store.append(&key(), item("a", true), 1, ttl).await.unwrap(), 2);

        let names: Vec<_> = store
            .read(&key())
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.file_name.unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        tokio::time::advance(Duration::from_secs(8)).await;
        store.append(&key(), item("c", true), 3, ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.keys().await.unwrap(), vec![key()]);

        assert!(store.expired_keys().await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.expired_keys().await.unwrap(), vec![key()]);
        assert_eq!(store.keys().await.unwrap(), vec![key()]);
        assert_eq!(store.read(&key()).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_key_keeps_members_on_append() {
        let store = InMemoryAggregationStore::new();
        let ttl = Duration::from_secs(5);
        store.append(&key(), item("a", true), 1, ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(store.append(&key(), item("b", true), 2, ttl).await.unwrap(), 2);
        assert!(store.expired_keys().await.unwrap().is_empty());
        assert_eq!(store.drain(&key()).await.unwrap().len(), 2);
    }

    #[test]
    fn test_aggregate_request_fits_content_limits() {
        let long = "é".repeat(1800);
        let items: Vec<BatchItem> = (0..5)
            .map(|i| item(&format!("{i}{long}"), i % 2 == 0))
            .collect();
        let request = aggregate_request(&key(), &items);

        assert!(request.message.len() <= MAX_MESSAGE_LEN);
        assert!(request.message.ends_with(ELLIPSIS));
        assert!(request.title.chars().count() <= MAX_TITLE_LEN);
        assert!(request.validate().is_ok());
    }

    #[tokio::test]
    async fn test_drain_empties_key() {
        let store = InMemoryAggregationStore::new();
        let ttl = Duration::from_secs(60);
        store.append(&key(), item("a", true), 1, ttl).await.unwrap();
        assert_eq!(store.drain(&key()).await.unwrap().len(), 1);
        assert!(store.drain(&key()).await.unwrap().is_empty());
        assert!(store.keys().await.unwrap().is_empty());
    }
}
