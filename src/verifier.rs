//! Hypothesis verification through bounded probes.
//!
//! The verifier is the experimentalist: it replays and mutates requests
//! derived from a hypothesis's endpoint pattern and translates the observed
//! status into a confirm/falsify/inconclusive outcome. Probes validate
//! beliefs; they are not exploitation.

use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancellationSignal;
use crate::error::{Error, Result};
use crate::guardrails::{Guardrails, RateLimiter};
use crate::hypothesis::{
    CriticReview, Hypothesis, HypothesisStore, ProbeKind, ProbeOutcome, ProbeRequest, ProbeResult,
};

/// Per-probe HTTP timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pad length for string boundary values.
const BOUNDARY_STRING_LEN: usize = 10_000;

/// Fill `{id}` with a canonical test value, any other placeholder with `test`.
pub fn fill_path_params(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| {
            if segment == "{id}" {
                "1"
            } else if segment.starts_with('{') && segment.ends_with('}') {
                "test"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Generate a request body satisfying a request schema.
pub fn generate_test_body(schema: &Value) -> Value {
    let mut body = Map::new();
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Value::Object(body);
    };

    for (field, field_schema) in properties {
        let field_type = field_schema
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("string");
        let value = match field_type {
            "string" => {
                if field.to_lowercase().contains("email") {
                    json!("test@example.com")
                } else if field.to_lowercase().contains("date") {
                    json!("2024-01-15")
                } else {
                    json!(format!("test_{}", field))
                }
            }
            "integer" => json!(1),
            "number" => json!(1.0),
            "boolean" => json!(true),
            "array" => json!([]),
            "object" => json!({}),
            _ => json!(null),
        };
        body.insert(field.clone(), value);
    }

    Value::Object(body)
}

/// Apply the probe-specific mutation to a request body.
pub fn mutate_body(kind: ProbeKind, body: &mut Value) {
    let Some(map) = body.as_object_mut() else {
        return;
    };

    match kind {
        ProbeKind::OmitField => {
            if let Some(first_key) = map.keys().next().cloned() {
                map.remove(&first_key);
            }
        }
        ProbeKind::AddField => {
            map.insert("unexpected_field".to_string(), json!("probe"));
        }
        ProbeKind::MutateField => {
            if let Some(first_key) = map.keys().next().cloned() {
                map.insert(first_key, json!("mutated_value"));
            }
        }
        ProbeKind::BoundaryValue => {
            for value in map.values_mut() {
                if value.is_i64() || value.is_u64() {
                    *value = json!(i32::MAX);
                } else if value.is_string() {
                    *value = json!("x".repeat(BOUNDARY_STRING_LEN));
                }
            }
        }
        ProbeKind::ChangeType => {
            for value in map.values_mut() {
                if let Some(n) = value.as_i64() {
                    *value = json!(n.to_string());
                } else if value.is_string() {
                    *value = json!(12345);
                }
            }
        }
        ProbeKind::ReplayExact | ProbeKind::SequenceBreak | ProbeKind::AuthVariation => {}
    }
}

/// Translate a probe's observed status into an outcome per the fixed table.
pub fn evaluate_outcome(kind: ProbeKind, status: u16) -> (ProbeOutcome, f64, &'static str) {
    let success = (200..300).contains(&status);

    match kind {
        ProbeKind::ReplayExact => {
            if success {
                (ProbeOutcome::Confirmed, 0.15, "endpoint consistent")
            } else if status >= 400 {
                (ProbeOutcome::Inconclusive, -0.05, "possibly state-dependent")
            } else {
                (ProbeOutcome::Inconclusive, 0.0, "unexpected status")
            }
        }
        ProbeKind::AuthVariation => {
            if status == 401 || status == 403 {
                (ProbeOutcome::Confirmed, 0.10, "auth required")
            } else if success {
                (ProbeOutcome::Confirmed, 0.10, "auth not required")
            } else {
                (ProbeOutcome::Inconclusive, 0.0, "unexpected status")
            }
        }
        ProbeKind::OmitField => {
            if status == 400 {
                (ProbeOutcome::Confirmed, 0.10, "field required")
            } else if success {
                (ProbeOutcome::Confirmed, 0.10, "field optional")
            } else {
                (ProbeOutcome::Inconclusive, 0.0, "unexpected status")
            }
        }
        ProbeKind::SequenceBreak => {
            if status >= 400 {
                (ProbeOutcome::Confirmed, 0.15, "sequence enforced")
            } else if success {
                (ProbeOutcome::Falsified, -0.30, "sequence not enforced")
            } else {
                (ProbeOutcome::Inconclusive, 0.0, "unexpected status")
            }
        }
        ProbeKind::BoundaryValue => {
            if status == 400 {
                (ProbeOutcome::Confirmed, 0.10, "validated")
            } else if success {
                (ProbeOutcome::Inconclusive, 0.0, "needs further testing")
            } else {
                (ProbeOutcome::Inconclusive, 0.0, "unexpected status")
            }
        }
        ProbeKind::ChangeType | ProbeKind::MutateField | ProbeKind::AddField => {
            if status == 400 {
                (ProbeOutcome::Confirmed, 0.10, "type validation enforced")
            } else {
                (ProbeOutcome::Inconclusive, 0.0, "needs further testing")
            }
        }
    }
}

/// Executes probes against the target origin.
pub struct Verifier {
    store: Arc<HypothesisStore>,
    guardrails: Arc<Guardrails>,
    rate_limiter: Arc<RateLimiter>,
    http: Client,
    auth: Mutex<AuthState>,
    max_probes_per_iteration: usize,
    probing_enabled: bool,
}

#[derive(Debug, Default, Clone)]
struct AuthState {
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
}

impl Verifier {
    pub fn new(
        store: Arc<HypothesisStore>,
        guardrails: Arc<Guardrails>,
        rate_limiter: Arc<RateLimiter>,
        max_probes_per_iteration: usize,
        probing_enabled: bool,
    ) -> Self {
        let http = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            store,
            guardrails,
            rate_limiter,
            http,
            auth: Mutex::new(AuthState::default()),
            max_probes_per_iteration,
            probing_enabled,
        }
    }

    /// Set authentication state inherited by every probe.
    pub fn set_auth(
        &self,
        headers: Option<HashMap<String, String>>,
        cookies: Option<HashMap<String, String>>,
    ) {
        if let Ok(mut auth) = self.auth.lock() {
            if let Some(headers) = headers {
                auth.headers.extend(headers);
            }
            if let Some(cookies) = cookies {
                auth.cookies.extend(cookies);
            }
        }
    }

    /// Clear authentication state.
    pub fn clear_auth(&self) {
        if let Ok(mut auth) = self.auth.lock() {
            *auth = AuthState::default();
        }
    }

    /// Execute the probes required by this iteration's critic reviews,
    /// bounded by the per-iteration budget.
    pub async fn execute_probes(
        &self,
        reviews: &[CriticReview],
        origin: &str,
        cancel: &CancellationSignal,
    ) -> Result<Vec<ProbeResult>> {
        let probes: Vec<&ProbeRequest> = reviews
            .iter()
            .flat_map(|review| review.required_probes.iter())
            .take(self.max_probes_per_iteration)
            .collect();

        if probes.is_empty() {
            debug!("no probes to execute");
            return Ok(Vec::new());
        }

        info!(count = probes.len(), "executing probes");
        let mut results = Vec::new();

        for probe in probes {
            if cancel.is_cancelled() {
                break;
            }

            if let Err(Error::Guardrail(reason)) =
                self.guardrails.validate_probe(probe.kind, self.probing_enabled)
            {
                debug!(%reason, "probe skipped by guardrail");
                continue;
            }

            results.push(self.execute_probe(probe, origin, cancel).await);
        }

        let confirmed = results
            .iter()
            .filter(|r| r.outcome == ProbeOutcome::Confirmed)
            .count();
        let falsified = results
            .iter()
            .filter(|r| r.outcome == ProbeOutcome::Falsified)
            .count();
        info!(total = results.len(), confirmed, falsified, "probe run complete");

        Ok(results)
    }

    async fn execute_probe(
        &self,
        probe: &ProbeRequest,
        origin: &str,
        cancel: &CancellationSignal,
    ) -> ProbeResult {
        // A vanished hypothesis fails the probe as inconclusive
        let hypothesis = match self.store.get(&probe.hypothesis_id) {
            Ok(Some(hypothesis)) => hypothesis,
            _ => {
                return error_result(probe, "hypothesis no longer exists");
            }
        };

        let (method, url, headers, body) = match self.build_request(probe, &hypothesis, origin) {
            Some(request) => request,
            None => return error_result(probe, "could not build request"),
        };

        if self.guardrails.validate_target_url(&url).is_err() {
            return error_result(probe, "target url rejected by guardrail");
        }

        let request_snapshot = json!({
            "method": method,
            "url": url,
            "headers": headers.keys().collect::<Vec<_>>(),
        });

        if self.rate_limiter.acquire().await.is_err() {
            return error_result(probe, "rate limiter unavailable");
        }

        let response = match cancel
            .bounded(PROBE_TIMEOUT, self.send(&method, &url, &headers, body.as_ref()))
            .await
        {
            Some(Ok(response)) => response,
            Some(Err(error)) => {
                // Transient network failure: inconclusive, small penalty
                warn!(%error, url = %url, "probe request failed");
                return error_result(probe, &format!("request failed: {}", error));
            }
            None => {
                return error_result(probe, "probe cancelled or timed out");
            }
        };

        let status = response.status().as_u16();
        let response_body = response.text().await.ok().map(|text| {
            let clipped: String = text.chars().take(500).collect();
            clipped
        });

        let (outcome, delta, notes) = evaluate_outcome(probe.kind, status);
        ProbeResult {
            id: Uuid::new_v4(),
            hypothesis_id: probe.hypothesis_id.clone(),
            probe_kind: probe.kind,
            request: request_snapshot,
            response_status: status,
            response_body,
            outcome,
            confidence_delta: delta,
            notes: notes.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn build_request(
        &self,
        probe: &ProbeRequest,
        hypothesis: &Hypothesis,
        origin: &str,
    ) -> Option<(String, String, HashMap<String, String>, Option<Value>)> {
        let pattern = hypothesis.endpoint_pattern.as_deref()?;
        let method = hypothesis
            .method
            .clone()
            .unwrap_or_else(|| "GET".to_string());

        let url = format!("{}{}", origin.trim_end_matches('/'), fill_path_params(pattern));

        let auth = self.auth.lock().ok()?.clone();
        let mut headers: HashMap<String, String> = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.extend(auth.headers);

        if !auth.cookies.is_empty() {
            let cookie = auth
                .cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            headers.insert("Cookie".to_string(), cookie);
        }

        let mut body = if matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
            Some(generate_test_body(
                hypothesis.request_schema.as_ref().unwrap_or(&json!({})),
            ))
        } else {
            None
        };

        if probe.kind == ProbeKind::AuthVariation {
            headers.retain(|name, _| {
                let lower = name.to_lowercase();
                lower != "authorization" && lower != "cookie"
            });
        }
        if let Some(body) = body.as_mut() {
            mutate_body(probe.kind, body);
        }

        Some((method, url, headers, body))
    }

    async fn send(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&Value>,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut request = self.http.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await
    }
}

fn error_result(probe: &ProbeRequest, message: &str) -> ProbeResult {
    ProbeResult {
        id: Uuid::new_v4(),
        hypothesis_id: probe.hypothesis_id.clone(),
        probe_kind: probe.kind,
        request: json!({}),
        response_status: 0,
        response_body: None,
        outcome: ProbeOutcome::Inconclusive,
        confidence_delta: -0.05,
        notes: format!("Probe error: {}", message),
        timestamp: Utc::now(),
    }
}
