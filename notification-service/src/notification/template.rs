//! Template rendering.
//!
//! Turns a request into channel-appropriate title/body text. Active templates
//! are looked up by `(event type, channel)` (or by explicit id) through a
//! read-through cache that is cleared wholesale on every template write. The
//! cache is process-local: other instances only observe a write once their
//! own cache is invalidated.
//!
//! Placeholders use `{{name}}`; `{{metadata.key}}` reads request metadata.
//! Unknown names render empty. A malformed template never aborts a
//! notification; rendering falls back to the per-event default text.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::events::EventType;
use super::types::NotificationRequest;
use crate::database::models::{Channel, NotificationTemplateDbModel};
use crate::database::repositories::TemplateRepository;
use crate::{Error, Result};

/// Format bytes into a human-readable string, e.g. `1.5 MB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Rendering context derived from request metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateData {
    pub user_name: Option<String>,
    pub file_name: Option<String>,
    /// Human readable size.
    pub file_size: Option<String>,
    /// RFC 3339
    pub timestamp: String,
    pub error_message: Option<String>,
    pub event_type: String,
    pub count: Option<u64>,
    pub success_count: Option<u64>,
    pub failure_count: Option<u64>,
    pub metadata: Map<String, Value>,
}

impl TemplateData {
    pub fn from_metadata(event_type: EventType, metadata: &Map<String, Value>) -> Self {
        let text = |key: &str| metadata.get(key).and_then(value_to_text);
        let number = |key: &str| metadata.get(key).and_then(Value::as_u64);

        let file_size = match metadata.get("file_size") {
            Some(Value::Number(n)) => n.as_u64().map(format_file_size),
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        };

        Self {
            user_name: text("user_name"),
            file_name: text("file_name"),
            file_size,
            timestamp: text("timestamp").unwrap_or_else(|| Utc::now().to_rfc3339()),
            error_message: text("error").or_else(|| text("error_message")),
            event_type: event_type.as_str().to_string(),
            count: number("count"),
            success_count: number("success_count"),
            failure_count: number("failure_count"),
            metadata: metadata.clone(),
        }
    }

    pub fn from_request(request: &NotificationRequest) -> Self {
        Self::from_metadata(request.event_type, &request.metadata)
    }

    /// Value for a placeholder name. Unknown names resolve to `None`.
    pub fn lookup(&self, name: &str) -> Option<String> {
        if let Some(key) = name.strip_prefix("metadata.") {
            return self.metadata.get(key).and_then(value_to_text);
        }
        match name {
            "user_name" => self.user_name.clone(),
            "file_name" => self.file_name.clone(),
            "file_size" => self.file_size.clone(),
            "timestamp" => Some(self.timestamp.clone()),
            "error_message" | "error" => self.error_message.clone(),
            "event_type" => Some(self.event_type.clone()),
            "count" => self.count.map(|n| n.to_string()),
            "success_count" => self.success_count.map(|n| n.to_string()),
            "failure_count" => self.failure_count.map(|n| n.to_string()),
            _ => None,
        }
    }

    fn file_label(&self) -> String {
        self.file_name.clone().unwrap_or_else(|| "A file".to_string())
    }

    fn meta(&self, key: &str) -> Option<String> {
        self.metadata.get(key).and_then(value_to_text)
    }
}

/// Expand `{{name}}` placeholders against `data`.
///
/// A lone `{` is literal. An unclosed or empty placeholder is an error.
pub fn render_template(template: &str, data: &TemplateData) -> Result<String> {
    let mut result = String::with_capacity(template.len() * 2);
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '{' || chars.peek() != Some(&'{') {
            result.push(c);
            continue;
        }
        chars.next();

        let mut name = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            if c == '}' && chars.peek() == Some(&'}') {
                chars.next();
                closed = true;
                break;
            }
            name.push(c);
        }

        if !closed {
            return Err(Error::TemplateRender(format!(
                "unclosed placeholder '{{{{{name}'"
            )));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::TemplateRender("empty placeholder".to_string()));
        }
        if let Some(value) = data.lookup(name) {
            result.push_str(&value);
        }
    }

    Ok(result)
}

/// Fixed per-event title and body, independent of channel.
pub fn default_content(event_type: EventType, data: &TemplateData) -> (String, String) {
    let file = data.file_label();
    let succeeded = data.metadata.get("success").and_then(Value::as_bool) != Some(false);

    match event_type {
        EventType::FileUploaded if succeeded => {
            let size = data
                .file_size
                .as_deref()
                .map(|s| format!(" ({s})"))
                .unwrap_or_default();
            (
                "File uploaded".to_string(),
                format!("{file}{size} was uploaded successfully."),
            )
        }
        EventType::FileUploaded => {
            let reason = data
                .error_message
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default();
            (
                "File upload failed".to_string(),
                format!("{file} could not be uploaded{reason}."),
            )
        }
        EventType::FileDeleted => ("File deleted".to_string(), format!("{file} was deleted.")),
        EventType::FileShared => {
            let by = data
                .meta("shared_by")
                .map(|who| format!(" by {who}"))
                .unwrap_or_default();
            (
                "A file was shared with you".to_string(),
                format!("{file} was shared with you{by}."),
            )
        }
        EventType::FileDownloaded => (
            "File downloaded".to_string(),
            format!("{file} was downloaded."),
        ),
        EventType::QuotaWarning => {
            let body = match data.meta("usage_percent") {
                Some(percent) => format!("You have used {percent}% of your storage quota."),
                None => "You are approaching your storage quota.".to_string(),
            };
            ("Storage almost full".to_string(), body)
        }
        EventType::QuotaExceeded => (
            "Storage quota exceeded".to_string(),
            "Your storage quota has been exceeded. New uploads are blocked until space is freed."
                .to_string(),
        ),
        EventType::SecurityAlert => (
            "Security alert".to_string(),
            data.meta("description")
                .or_else(|| data.error_message.clone())
                .unwrap_or_else(|| "Unusual activity was detected on your account.".to_string()),
        ),
        EventType::NewLogin => {
            let from = data
                .meta("ip_address")
                .map(|ip| format!(" from {ip}"))
                .unwrap_or_default();
            (
                "New sign-in to your account".to_string(),
                format!("A new sign-in to your account was detected{from}."),
            )
        }
        EventType::PaymentSucceeded => {
            let amount = data
                .meta("amount")
                .map(|a| format!(" of {a}"))
                .unwrap_or_default();
            (
                "Payment received".to_string(),
                format!("Your payment{amount} was processed successfully."),
            )
        }
        EventType::PaymentFailed => {
            let reason = data
                .error_message
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default();
            (
                "Payment failed".to_string(),
                format!("We could not process your payment{reason}."),
            )
        }
        EventType::SystemMaintenance => {
            let when = data
                .meta("scheduled_at")
                .map(|at| format!(" starting {at}"))
                .unwrap_or_default();
            (
                "Scheduled maintenance".to_string(),
                format!("The service will undergo scheduled maintenance{when}."),
            )
        }
    }
}

/// Rendered output for one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub title: String,
    pub body: String,
    /// Template used, if any.
    pub template_id: Option<String>,
}

/// Fields accepted when creating a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTemplate {
    pub event_type: EventType,
    pub channel: Channel,
    pub subject_template: String,
    pub body_template: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Patch for an existing template. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateUpdate {
    pub event_type: Option<EventType>,
    pub channel: Option<Channel>,
    pub subject_template: Option<String>,
    pub body_template: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Pair(EventType, Channel),
    Id(String),
}

/// Template-backed renderer with a read-through cache.
pub struct TemplateRenderer {
    repo: Arc<dyn TemplateRepository>,
    cache: RwLock<TemplateCache>,
}

/// Cached lookups, including misses. `generation` advances on every
/// invalidation so a lookup that started earlier cannot repopulate it.
#[derive(Default)]
struct TemplateCache {
    entries: HashMap<CacheKey, Option<NotificationTemplateDbModel>>,
    generation: u64,
}

impl TemplateRenderer {
    pub fn new(repo: Arc<dyn TemplateRepository>) -> Self {
        Self {
            repo,
            cache: RwLock::new(TemplateCache::default()),
        }
    }

    /// Render title and body for `request` on `channel`. Never fails.
    pub async fn render(&self, request: &NotificationRequest, channel: Channel) -> RenderedContent {
        let data = TemplateData::from_request(request);

        if let Some(template) = self.resolve_template(request, channel).await {
            let rendered = render_template(&template.subject_template, &data).and_then(|title| {
                render_template(&template.body_template, &data).map(|body| (title, body))
            });
            match rendered {
                Ok((title, body)) => {
                    return RenderedContent {
                        title,
                        body,
                        template_id: Some(template.id),
                    };
                }
                Err(e) => {
                    warn!(
                        template_id = %template.id,
                        event_type = %request.event_type,
                        %channel,
                        error = %e,
                        "Template rendering failed, using default formatting"
                    );
                }
            }
        }

        self.fallback(request, &data)
    }

    fn fallback(&self, request: &NotificationRequest, data: &TemplateData) -> RenderedContent {
        let (default_title, default_body) = default_content(request.event_type, data);
        let title = if request.title.trim().is_empty() {
            default_title
        } else {
            request.title.clone()
        };
        let body = if request.message.trim().is_empty() {
            default_body
        } else {
            request.message.clone()
        };
        RenderedContent {
            title,
            body,
            template_id: None,
        }
    }

    async fn resolve_template(
        &self,
        request: &NotificationRequest,
        channel: Channel,
    ) -> Option<NotificationTemplateDbModel> {
        if let Some(id) = &request.template_id {
            match self.cached(CacheKey::Id(id.clone())).await {
                Some(template) if template.is_active => return Some(template),
                Some(_) => debug!(template_id = %id, "Requested template is inactive"),
                None => debug!(template_id = %id, "Requested template not found"),
            }
        }
        self.cached(CacheKey::Pair(request.event_type, channel)).await
    }

    async fn cached(&self, key: CacheKey) -> Option<NotificationTemplateDbModel> {
        let generation = {
            let cache = self.cache.read();
            if let Some(hit) = cache.entries.get(&key) {
                return hit.clone();
            }
            cache.generation
        };

        let loaded = match &key {
            CacheKey::Pair(event_type, channel) => {
                self.repo
                    .find_active(event_type.as_str(), channel.as_str())
                    .await
            }
            CacheKey::Id(id) => match self.repo.get(id).await {
                Ok(template) => Ok(Some(template)),
                Err(Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            },
        };

        match loaded {
            Ok(template) => {
                let mut cache = self.cache.write();
                if cache.generation == generation {
                    cache.entries.insert(key, template.clone());
                } else {
                    debug!("Template cache invalidated during lookup, not caching");
                }
                template
            }
            Err(e) => {
                // Not cached, so the next render retries the lookup.
                warn!(error = %e, "Template lookup failed, using default formatting");
                None
            }
        }
    }

    pub fn invalidate_cache(&self) {
        let mut cache = self.cache.write();
        cache.entries.clear();
        cache.generation = cache.generation.wrapping_add(1);
    }

    fn check_syntax(subject: &str, body: &str) -> Result<()> {
        let sample = TemplateData::default();
        render_template(subject, &sample)
            .and_then(|_| render_template(body, &sample))
            .map(|_| ())
            .map_err(|e| Error::validation(e.to_string()))
    }

    pub async fn create_template(&self, new: NewTemplate) -> Result<NotificationTemplateDbModel> {
        Self::check_syntax(&new.subject_template, &new.body_template)?;

        let mut template = NotificationTemplateDbModel::new(
            new.event_type,
            new.channel,
            new.subject_template,
            new.body_template,
        );
        template.is_active = new.is_active;

        self.repo.create(&template).await?;
        self.invalidate_cache();
        debug!(template_id = %template.id, event_type = %template.event_type, "Created template");
        Ok(template)
    }

    pub async fn update_template(
        &self,
        id: &str,
        update: TemplateUpdate,
    ) -> Result<NotificationTemplateDbModel> {
        let mut template = self.repo.get(id).await?;
        if let Some(event_type) = update.event_type {
            template.event_type = event_type.as_str().to_string();
        }
        if let Some(channel) = update.channel {
            template.channel = channel.as_str().to_string();
        }
        if let Some(subject) = update.subject_template {
            template.subject_template = subject;
        }
        if let Some(body) = update.body_template {
            template.body_template = body;
        }
        if let Some(active) = update.is_active {
            template.is_active = active;
        }
        Self::check_syntax(&template.subject_template, &template.body_template)?;

        self.repo.update(&template).await?;
        self.invalidate_cache();
        debug!(template_id = %id, "Updated template");
        self.repo.get(id).await
    }

    pub async fn delete_template(&self, id: &str) -> Result<bool> {
        let deleted = self.repo.delete(id).await?;
        self.invalidate_cache();
        Ok(deleted)
    }

    pub async fn get_template(&self, id: &str) -> Result<NotificationTemplateDbModel> {
        self.repo.get(id).await
    }

    pub async fn list_templates(
        &self,
        event_type: Option<EventType>,
    ) -> Result<Vec<NotificationTemplateDbModel>> {
        self.repo.list(event_type.map(|e| e.as_str())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn data() -> TemplateData {
        let mut metadata = Map::new();
        metadata.insert("file_name".into(), Value::from("report.pdf"));
        metadata.insert("file_size".into(), Value::from(1_572_864u64));
        metadata.insert("folder".into(), Value::from("Invoices"));
        TemplateData::from_metadata(EventType::FileUploaded, &metadata)
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1_572_864), "1.5 MB");
        assert_eq!(format_file_size(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn test_render_placeholders() {
        let out = render_template(
            "{{ file_name }} ({{file_size}}) in {{metadata.folder}} by {{user_name}}",
            &data(),
        )
        .unwrap();
        assert_eq!(out, "report.pdf (1.5 MB) in Invoices by ");
    }

    #[test]
    fn test_render_literal_braces() {
        let out = render_template("{single} and }} stay", &data()).unwrap();
        assert_eq!(out, "{single} and }} stay");
    }

    #[test]
    fn test_render_errors() {
        assert!(matches!(
            render_template("Hello {{file_name", &data()),
            Err(Error::TemplateRender(_))
        ));
        assert!(render_template("{{ }}", &data()).is_err());
    }

    #[test]
    fn test_default_content_is_distinct_per_event() {
        use strum::IntoEnumIterator;
        let data = data();
        let titles: std::collections::HashSet<String> = EventType::iter()
            .map(|e| default_content(e, &data).0)
            .collect();
        assert_eq!(titles.len(), EventType::iter().count());
    }

    #[test]
    fn test_default_upload_failure() {
        let mut metadata = Map::new();
        metadata.insert("file_name".into(), Value::from("a.txt"));
        metadata.insert("success".into(), Value::Bool(false));
        metadata.insert("error".into(), Value::from("quota exceeded"));
        let data = TemplateData::from_metadata(EventType::FileUploaded, &metadata);
        let (title, body) = default_content(EventType::FileUploaded, &data);
        assert_eq!(title, "File upload failed");
        assert_eq!(body, "a.txt could not be uploaded: quota exceeded.");
    }

    #[derive(Default)]
    struct MemoryTemplates {
        rows: Mutex<Vec<NotificationTemplateDbModel>>,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl TemplateRepository for MemoryTemplates {
        async fn get(&self, id: &str) -> Result<NotificationTemplateDbModel> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.rows
                .lock()
                .iter()
                .find(|t| t.id == id)
                .cloned()
                .ok_or_else(|| Error::not_found("NotificationTemplate", id))
        }

        async fn list(&self, event_type: Option<&str>) -> Result<Vec<NotificationTemplateDbModel>> {
            Ok(self
                .rows
                .lock()
                .iter()
                .filter(|t| event_type.is_none_or(|e| t.event_type == e))
                .cloned()
                .collect())
        }

        async fn find_active(
            &self,
            event_type: &str,
            channel: &str,
        ) -> Result<Option<NotificationTemplateDbModel>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .rows
                .lock()
                .iter()
                .find(|t| t.event_type == event_type && t.channel == channel && t.is_active)
                .cloned())
        }

        async fn create(&self, template: &NotificationTemplateDbModel) -> Result<()> {
            self.rows.lock().push(template.clone());
            Ok(())
        }

        async fn update(&self, template: &NotificationTemplateDbModel) -> Result<()> {
            let mut rows = self.rows.lock();
            let row = rows
                .iter_mut()
                .find(|t| t.id == template.id)
                .ok_or_else(|| Error::not_found("NotificationTemplate", &template.id))?;
            *row = template.clone();
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<bool> {
            let mut rows = self.rows.lock();
            let before = rows.len();
            rows.retain(|t| t.id != id);
            Ok(rows.len() != before)
        }
    }

    fn upload_request() -> NotificationRequest {
        NotificationRequest::new("u", EventType::FileUploaded)
            .with_meta("file_name", "report.pdf")
            .with_meta("user_name", "Ada")
    }

    #[tokio::test]
    async fn test_render_uses_active_template() {
        let repo = Arc::new(MemoryTemplates::default());
        let renderer = TemplateRenderer::new(repo.clone());
        renderer
            .create_template(NewTemplate {
                event_type: EventType::FileUploaded,
                channel: Channel::Email,
                subject_template: "Hi {{user_name}}".into(),
                body_template: "{{file_name}} is up".into(),
                is_active: true,
            })
            .await
            .unwrap();

        let email = renderer.render(&upload_request(), Channel::Email).await;
        assert_eq!(email.title, "Hi Ada");
        assert_eq!(email.body, "report.pdf is up");
        assert!(email.template_id.is_some());

        let push = renderer.render(&upload_request(), Channel::Push).await;
        assert_eq!(push.title, "File uploaded");
        assert_eq!(push.template_id, None);
    }

    #[tokio::test]
    async fn test_malformed_template_falls_back() {
        let repo = Arc::new(MemoryTemplates::default());
        repo.rows.lock().push(NotificationTemplateDbModel::new(
            EventType::FileUploaded,
            Channel::Email,
            "Hi {{user_name",
            "body",
        ));
        let renderer = TemplateRenderer::new(repo);

        let request = upload_request().with_content("Custom title", "");
        let rendered = renderer.render(&request, Channel::Email).await;
        assert_eq!(rendered.title, "Custom title");
        assert_eq!(rendered.body, "report.pdf was uploaded successfully.");
        assert_eq!(rendered.template_id, None);
    }

    #[tokio::test]
    async fn test_malformed_template_rejected_on_create() {
        let renderer = TemplateRenderer::new(Arc::new(MemoryTemplates::default()));
        let result = renderer
            .create_template(NewTemplate {
                event_type: EventType::FileUploaded,
                channel: Channel::Email,
                subject_template: "{{oops".into(),
                body_template: "".into(),
                is_active: true,
            })
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_cache_is_read_through_and_invalidated_on_write() {
        let repo = Arc::new(MemoryTemplates::default());
        let renderer = TemplateRenderer::new(repo.clone());
        let request = upload_request();

        renderer.render(&request, Channel::Email).await;
        renderer.render(&request, Channel::Email).await;
        assert_eq!(repo.lookups.load(Ordering::SeqCst), 1);

        let created = renderer
            .create_template(NewTemplate {
                event_type: EventType::FileUploaded,
                channel: Channel::Email,
                subject_template: "v1".into(),
                body_template: "b".into(),
                is_active: true,
            })
            .await
            .unwrap();
        assert_eq!(renderer.render(&request, Channel::Email).await.title, "v1");

        renderer
            .update_template(
                &created.id,
                TemplateUpdate {
                    subject_template: Some("v2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renderer.render(&request, Channel::Email).await.title, "v2");

        assert!(renderer.delete_template(&created.id).await.unwrap());
        assert_eq!(
            renderer.render(&request, Channel::Email).await.title,
            "File uploaded"
        );
    }

    #[tokio::test]
    async fn test_explicit_template_id_takes_precedence() {
        let repo = Arc::new(MemoryTemplates::default());
        let renderer = TemplateRenderer::new(repo.clone());
        for subject in ["pair", "explicit"] {
            renderer
                .create_template(NewTemplate {
                    event_type: EventType::FileUploaded,
                    channel: Channel::Email,
                    subject_template: subject.into(),
                    body_template: "b".into(),
                    is_active: true,
                })
                .await
                .unwrap();
        }
        let explicit_id = repo.rows.lock()[1].id.clone();

        let rendered = renderer
            .render(&upload_request().with_template(&explicit_id), Channel::Email)
            .await;
        assert_eq!(rendered.title, "explicit");

        let missing = renderer
            .render(&upload_request().with_template("missing"), Channel::Email)
            .await;
        assert_eq!(missing.title, "pair");
    }

    /// Computes its lookup result, then waits to be released before
    /// returning it.
    #[derive(Default)]
    struct StallingTemplates {
        inner: MemoryTemplates,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl TemplateRepository for StallingTemplates {
        async fn get(&self, id: &str) -> Result<NotificationTemplateDbModel> {
            self.inner.get(id).await
        }

        async fn list(&self, event_type: Option<&str>) -> Result<Vec<NotificationTemplateDbModel>> {
            self.inner.list(event_type).await
        }

        async fn find_active(
            &self,
            event_type: &str,
            channel: &str,
        ) -> Result<Option<NotificationTemplateDbModel>> {
            let found = self.inner.find_active(event_type, channel).await;
            self.entered.notify_one();
            self.release.notified().await;
            found
        }

        async fn create(&self, template: &NotificationTemplateDbModel) -> Result<()> {
            self.inner.create(template).await
        }

        async fn update(&self, template: &NotificationTemplateDbModel) -> Result<()> {
            self.inner.update(template).await
        }

        async fn delete(&self, id: &str) -> Result<bool> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_lookup_racing_a_write_is_not_cached() {
        let repo = Arc::new(StallingTemplates::default());
        let renderer = Arc::new(TemplateRenderer::new(repo.clone()));

        let in_flight = {
            let renderer = renderer.clone();
            tokio::spawn(async move { renderer.render(&upload_request(), Channel::Email).await })
        };
        repo.entered.notified().await;

        renderer
            .create_template(NewTemplate {
                event_type: EventType::FileUploaded,
                channel: Channel::Email,
                subject_template: "fresh".into(),
                body_template: "b".into(),
                is_active: true,
            })
            .await
            .unwrap();
        repo.release.notify_one();

        // The lookup began before the write, so it still sees no template.
        assert_eq!(in_flight.await.unwrap().title, "File uploaded");

        repo.release.notify_one();
        assert_eq!(
            renderer.render(&upload_request(), Channel::Email).await.title,
            "fresh"
        );
    }
}
