//! Network interception and observation capture.
//!
//! The interceptor is a push-only producer: the browser driver delivers every
//! completed request/response pair, the classifier keeps the API traffic, and
//! accepted pairs become immutable observations tagged with the UI
//! interaction that produced them. All other components read the buffer
//! during their own phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::browser::{ActionRecord, RawExchange};

/// Unique identifier for an observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationId(pub Uuid);

impl ObservationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One captured request/response pair. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ObservationId,
    pub session_id: String,
    /// Monotonic id of the UI interaction that triggered this capture
    pub interaction_id: u64,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    pub status: u16,
    pub response_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// URL of the page that was loaded when the capture happened
    pub page_url: String,
    /// The UI action active at capture time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_action: Option<ActionRecord>,
}

impl Observation {
    /// Case-insensitive response header lookup.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.response_headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == lower)
            .map(|(_, v)| v.as_str())
    }

    /// Case-insensitive request header lookup.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.request_headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Static-asset extensions that are never API traffic.
const STATIC_EXTENSIONS: &[&str] = &[
    "css", "png", "jpg", "jpeg", "gif", "svg", "woff", "woff2", "ttf", "eot", "ico", "webp",
    "mp4", "mp3", "wav", "pdf", "zip",
];

/// Tracker/CDN substrings that are never the target's API.
const TRACKER_PATTERNS: &[&str] = &[
    "google-analytics",
    "googletagmanager",
    "facebook",
    "hotjar",
    "mixpanel",
    "segment.io",
    "segment.com",
    "doubleclick",
    "cloudflareinsights",
    "/cdn-cgi/",
    "unpkg.com",
    "jsdelivr.net",
    "cdnjs.cloudflare",
    "bootstrapcdn",
    "fontawesome",
];

/// Path markers that indicate API traffic.
const API_PATH_MARKERS: &[&str] = &["/api/", "/v1/", "/v2/", "/v3/", "/graphql", "/rest/"];

/// Classify a request/response pair as API traffic.
pub fn is_api_traffic(raw: &RawExchange) -> bool {
    let url = raw.url.to_lowercase();
    let path = crate::cluster::url_path(&url);

    // Rejections first: static assets, trackers, CDN-served scripts
    for ext in STATIC_EXTENSIONS {
        if path.ends_with(&format!(".{}", ext)) {
            return false;
        }
    }

    for tracker in TRACKER_PATTERNS {
        if url.contains(tracker) {
            return false;
        }
    }

    if path.ends_with(".js") {
        if let Some(host) = crate::guardrails::url_host(&url) {
            if host.starts_with("static.") || host.starts_with("cdn.") || host.starts_with("assets.")
            {
                return false;
            }
        }
    }

    // Acceptance: content type, path shape, or write method
    let content_type = raw
        .response_headers
        .iter()
        .find(|(k, _)| k.to_lowercase() == "content-type")
        .map(|(_, v)| v.to_lowercase())
        .unwrap_or_default();
    if content_type.contains("application/json") || content_type.contains("xml") {
        return true;
    }

    if API_PATH_MARKERS.iter().any(|marker| path.contains(marker)) || path.ends_with(".json") {
        return true;
    }

    matches!(
        raw.method.to_uppercase().as_str(),
        "POST" | "PUT" | "PATCH" | "DELETE"
    )
}

/// Thread-safe observation buffer: single writer (interceptor), single
/// reader (the observe phase drains it).
#[derive(Debug, Default)]
pub struct ObservationBuffer {
    inner: Mutex<Vec<Observation>>,
}

impl ObservationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, observation: Observation) {
        if let Ok(mut buffer) = self.inner.lock() {
            buffer.push(observation);
        }
    }

    /// Drain observations captured up to now, in capture order.
    pub fn drain(&self) -> Vec<Observation> {
        match self.inner.lock() {
            Ok(mut buffer) => std::mem::take(&mut *buffer),
            Err(_) => Vec::new(),
        }
    }

    /// Drain only observations quiesced before the given phase boundary.
    pub fn drain_before(&self, boundary: DateTime<Utc>) -> Vec<Observation> {
        match self.inner.lock() {
            Ok(mut buffer) => {
                let (ready, pending): (Vec<_>, Vec<_>) =
                    std::mem::take(&mut *buffer)
                        .into_iter()
                        .partition(|obs| obs.timestamp <= boundary);
                *buffer = pending;
                ready
            }
            Err(_) => Vec::new(),
        }
    }

    /// Ids of buffered observations captured under an interaction,
    /// without draining.
    pub fn ids_for_interaction(&self, interaction_id: u64) -> Vec<String> {
        match self.inner.lock() {
            Ok(buffer) => buffer
                .iter()
                .filter(|obs| obs.interaction_id == interaction_id)
                .map(|obs| obs.id.to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Captures network traffic and correlates it with UI actions.
/// Deterministic; no LLM involved.
pub struct Interceptor {
    session_id: String,
    buffer: ObservationBuffer,
    interaction_counter: AtomicU64,
    context: Mutex<InteractionContext>,
}

#[derive(Debug, Default)]
struct InteractionContext {
    interaction_id: u64,
    last_action: Option<ActionRecord>,
    page_url: String,
}

impl Interceptor {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            buffer: ObservationBuffer::new(),
            interaction_counter: AtomicU64::new(0),
            context: Mutex::new(InteractionContext::default()),
        }
    }

    /// Begin a new interaction: returns the monotonic id that captures
    /// during this action will carry.
    pub fn begin_interaction(&self, action: Option<ActionRecord>, page_url: &str) -> u64 {
        let id = self.interaction_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut context) = self.context.lock() {
            context.interaction_id = id;
            context.last_action = action;
            context.page_url = page_url.to_string();
        }
        id
    }

    /// Ingest a raw exchange from the driver. Returns the observation if
    /// the pair classified as API traffic.
    pub fn ingest(&self, raw: RawExchange) -> Option<Observation> {
        if !is_api_traffic(&raw) {
            trace!(url = %raw.url, "rejected non-API exchange");
            return None;
        }

        let (interaction_id, ui_action, page_url) = match self.context.lock() {
            Ok(context) => (
                context.interaction_id,
                context.last_action.clone(),
                context.page_url.clone(),
            ),
            Err(_) => (0, None, String::new()),
        };

        let observation = Observation {
            id: ObservationId::new(),
            session_id: self.session_id.clone(),
            interaction_id,
            timestamp: Utc::now(),
            method: raw.method.to_uppercase(),
            url: raw.url,
            request_headers: raw.request_headers,
            request_body: raw.request_body,
            status: raw.status,
            response_headers: raw.response_headers,
            response_body: raw.response_body,
            page_url,
            ui_action,
        };

        debug!(
            method = %observation.method,
            url = %observation.url,
            status = observation.status,
            "captured observation"
        );
        self.buffer.push(observation.clone());
        Some(observation)
    }

    /// Pump raw exchanges from the driver's push channel until it closes.
    /// Runs in parallel with the navigator.
    pub async fn run_pump(&self, mut receiver: mpsc::UnboundedReceiver<RawExchange>) {
        while let Some(raw) = receiver.recv().await {
            self.ingest(raw);
        }
    }

    pub fn buffer(&self) -> &ObservationBuffer {
        &self.buffer
    }

    /// Summary statistics over a batch of observations.
    pub fn summarize(observations: &[Observation]) -> ObservationStats {
        let mut by_method: HashMap<String, usize> = HashMap::new();
        let mut by_status: HashMap<u16, usize> = HashMap::new();
        let mut url_counts: HashMap<String, usize> = HashMap::new();

        for obs in observations {
            *by_method.entry(obs.method.clone()).or_insert(0) += 1;
            *by_status.entry(obs.status).or_insert(0) += 1;
            let base = obs.url.split('?').next().unwrap_or(&obs.url).to_string();
            *url_counts.entry(base).or_insert(0) += 1;
        }

        let mut top_urls: Vec<(String, usize)> = url_counts.into_iter().collect();
        top_urls.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let unique_urls = top_urls.len();
        top_urls.truncate(10);

        ObservationStats {
            total: observations.len(),
            unique_urls,
            by_method,
            by_status,
            top_urls,
        }
    }

    /// Extract authentication material from captured request headers,
    /// feeding the verifier's auth state.
    pub fn extract_auth_tokens(observations: &[Observation]) -> HashMap<String, String> {
        let mut tokens = HashMap::new();

        for obs in observations {
            if let Some(auth) = obs.request_header("authorization") {
                if let Some(bearer) = auth.strip_prefix("Bearer ") {
                    tokens.insert("bearer".to_string(), bearer.to_string());
                }
            }
            for key in ["x-api-key", "api-key", "apikey"] {
                if let Some(value) = obs.request_header(key) {
                    tokens.insert("api_key".to_string(), value.to_string());
                }
            }
            if let Some(cookie) = obs.request_header("cookie") {
                if cookie.to_lowercase().contains("session") {
                    tokens.insert("session_cookie".to_string(), cookie.to_string());
                }
            }
        }

        tokens
    }
}

/// Summary of captured observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationStats {
    pub total: usize,
    pub unique_urls: usize,
    pub by_method: HashMap<String, usize>,
    pub by_status: HashMap<u16, usize>,
    pub top_urls: Vec<(String, usize)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ActionKind;

    fn exchange(method: &str, url: &str, content_type: &str, status: u16) -> RawExchange {
        let mut response_headers = HashMap::new();
        if !content_type.is_empty() {
            response_headers.insert("Content-Type".to_string(), content_type.to_string());
        }
        RawExchange {
            method: method.to_string(),
            url: url.to_string(),
            request_headers: HashMap::new(),
            request_body: None,
            status,
            response_headers,
            response_body: Some("{}".to_string()),
        }
    }

    #[test]
    fn test_json_content_type_accepted() {
        let raw = exchange("GET", "https://h/data/users", "application/json", 200);
        assert!(is_api_traffic(&raw));
    }

    #[test]
    fn test_api_path_accepted_without_content_type() {
        assert!(is_api_traffic(&exchange("GET", "https://h/api/users/42", "", 200)));
        assert!(is_api_traffic(&exchange("POST", "https://h/graphql", "", 200)));
        assert!(is_api_traffic(&exchange("GET", "https://h/rest/items", "", 200)));
        assert!(is_api_traffic(&exchange("GET", "https://h/config.json", "", 200)));
    }

    #[test]
    fn test_write_methods_accepted() {
        assert!(is_api_traffic(&exchange("POST", "https://h/submit", "", 201)));
        assert!(is_api_traffic(&exchange("DELETE", "https://h/thing/3", "", 204)));
    }

    #[test]
    fn test_static_assets_rejected() {
        for ext in ["css", "png", "woff2", "ico", "pdf", "zip"] {
            let url = format!("https://h/static/app.{}", ext);
            assert!(!is_api_traffic(&exchange("GET", &url, "", 200)), "{}", ext);
        }
    }

    #[test]
    fn test_trackers_rejected() {
        // Tracker rejection wins even for POSTs with JSON bodies
        let raw = exchange(
            "POST",
            "https://www.google-analytics.com/collect",
            "application/json",
            200,
        );
        assert!(!is_api_traffic(&raw));
        assert!(!is_api_traffic(&exchange(
            "GET",
            "https://cdnjs.cloudflare.com/ajax/libs/x.json",
            "",
            200
        )));
    }

    #[test]
    fn test_cdn_scripts_rejected() {
        assert!(!is_api_traffic(&exchange(
            "GET",
            "https://cdn.example.com/bundle.js",
            "application/javascript",
            200
        )));
        assert!(!is_api_traffic(&exchange("GET", "https://h/app.js", "", 200)));
    }

    #[test]
    fn test_plain_get_html_rejected() {
        assert!(!is_api_traffic(&exchange(
            "GET",
            "https://h/about",
            "text/html",
            200
        )));
    }

    #[test]
    fn test_ingest_tags_interaction() {
        let interceptor = Interceptor::new("sess-1");
        let action = ActionRecord::new(ActionKind::Click, "[42]");
        let interaction_id =
            interceptor.begin_interaction(Some(action.clone()), "https://h/dashboard");
        assert_eq!(interaction_id, 1);

        let observation = interceptor
            .ingest(exchange("GET", "https://h/api/users/42", "application/json", 200))
            .unwrap();

        assert_eq!(observation.interaction_id, 1);
        assert_eq!(observation.page_url, "https://h/dashboard");
        assert_eq!(observation.ui_action, Some(action));
        assert_eq!(interceptor.buffer().len(), 1);
    }

    #[test]
    fn test_interaction_ids_are_monotonic() {
        let interceptor = Interceptor::new("sess-1");
        let first = interceptor.begin_interaction(None, "https://h/");
        let second = interceptor.begin_interaction(None, "https://h/");
        assert!(second > first);
    }

    #[test]
    fn test_rejected_exchange_not_buffered() {
        let interceptor = Interceptor::new("sess-1");
        assert!(interceptor
            .ingest(exchange("GET", "https://h/logo.png", "", 200))
            .is_none());
        assert!(interceptor.buffer().is_empty());
    }

    #[test]
    fn test_buffer_drain_preserves_order() {
        let interceptor = Interceptor::new("sess-1");
        interceptor.begin_interaction(None, "https://h/");
        interceptor.ingest(exchange("GET", "https://h/api/a", "application/json", 200));
        interceptor.ingest(exchange("GET", "https://h/api/b", "application/json", 200));

        let drained = interceptor.buffer().drain();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].url.ends_with("/api/a"));
        assert!(drained[1].url.ends_with("/api/b"));
        assert!(interceptor.buffer().is_empty());
    }

    #[test]
    fn test_drain_before_boundary() {
        let buffer = ObservationBuffer::new();
        let interceptor = Interceptor::new("sess-1");
        let early = interceptor
            .ingest(exchange("GET", "https://h/api/a", "application/json", 200))
            .unwrap();
        buffer.push(early);

        let boundary = Utc::now();
        let mut late = interceptor
            .ingest(exchange("GET", "https://h/api/b", "application/json", 200))
            .unwrap();
        late.timestamp = boundary + chrono::Duration::seconds(5);
        buffer.push(late);

        let ready = buffer.drain_before(boundary);
        assert_eq!(ready.len(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_stats_and_auth_extraction() {
        let interceptor = Interceptor::new("sess-1");
        interceptor.begin_interaction(None, "https://h/");
        let mut raw = exchange("GET", "https://h/api/me", "application/json", 200);
        raw.request_headers
            .insert("Authorization".to_string(), "Bearer tok123".to_string());
        interceptor.ingest(raw);
        interceptor.ingest(exchange("POST", "https://h/api/orders", "application/json", 401));

        let observations = interceptor.buffer().drain();
        let stats = Interceptor::summarize(&observations);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_method["GET"], 1);
        assert_eq!(stats.by_status[&401], 1);

        let tokens = Interceptor::extract_auth_tokens(&observations);
        assert_eq!(tokens["bearer"], "tok123");
    }

    #[tokio::test]
    async fn test_pump_ingests_from_channel() {
        let interceptor = std::sync::Arc::new(Interceptor::new("sess-1"));
        let (sender, receiver) = mpsc::unbounded_channel();

        let pump = {
            let interceptor = interceptor.clone();
            tokio::spawn(async move { interceptor.run_pump(receiver).await })
        };

        sender
            .send(exchange("GET", "https://h/api/users", "application/json", 200))
            .unwrap();
        sender.send(exchange("GET", "https://h/logo.png", "", 200)).unwrap();
        drop(sender);
        pump.await.unwrap();

        assert_eq!(interceptor.buffer().len(), 1);
    }
}
