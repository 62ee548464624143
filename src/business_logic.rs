//! Business-rule inference.
//!
//! Reads error responses and status patterns out of fresh observations and
//! turns them into rule hypotheses: field constraints and required sequences
//! from 4xx error bodies, permission gates from 401/403, rate limits from
//! 429, and state dependencies from endpoints that both succeed and fail.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hypothesis::{
    EvidenceRef, EvidenceStrength, Hypothesis, HypothesisKind, HypothesisStore, NewHypothesis,
    RuleKind,
};
use crate::interceptor::Observation;
use crate::llm::{ChatMessage, LlmClient};

const BUSINESS_LOGIC_PROMPT: &str = "You are analyzing observed API interactions to infer \
server-side business rules and state machines. Only infer what the evidence strongly supports, \
cite the observations, and assign a justified confidence.";

/// Keyword families that map an error message to a rule kind.
const REQUIRED_KEYWORDS: &[&str] = &["required", "missing", "empty"];
const FORMAT_KEYWORDS: &[&str] = &["invalid", "format", "type"];
const SEQUENCE_KEYWORDS: &[&str] = &["sequence", "first", "before", "must"];

fn dependency_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "has_dependency": {"type": "boolean"},
            "description": {"type": "string"},
            "prerequisite": {"type": "string"},
            "confidence": {"type": "number"}
        },
        "required": ["has_dependency"]
    })
}

/// Extract a human-readable error message from a JSON error body.
fn error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    for key in ["error", "message", "detail"] {
        if let Some(message) = parsed.get(key).and_then(Value::as_str) {
            return Some(message.to_string());
        }
    }
    parsed.as_object().map(|_| parsed.to_string())
}

/// Classify an error message into a rule kind and description.
fn classify_error(message: &str, endpoint: &str) -> (RuleKind, String) {
    let lower = message.to_lowercase();

    if REQUIRED_KEYWORDS.iter().any(|k| lower.contains(k)) {
        (
            RuleKind::FieldConstraint,
            format!("Endpoint {} has required field validation", endpoint),
        )
    } else if FORMAT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        (
            RuleKind::FieldConstraint,
            format!("Endpoint {} has field format validation", endpoint),
        )
    } else if SEQUENCE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        (
            RuleKind::RequiredSequence,
            format!("Endpoint {} requires a prerequisite action", endpoint),
        )
    } else {
        let head: String = message.chars().take(50).collect();
        (
            RuleKind::FieldConstraint,
            format!("Endpoint {} rejected request: {}", endpoint, head),
        )
    }
}

/// Detects server-side enforcement rules from observed behavior.
pub struct BusinessLogic {
    store: Arc<HypothesisStore>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl BusinessLogic {
    pub fn new(store: Arc<HypothesisStore>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { store, llm }
    }

    /// Analyze fresh observations; returns the rule hypotheses produced.
    pub async fn infer(&self, observations: &[Observation]) -> Result<Vec<Hypothesis>> {
        if observations.is_empty() {
            debug!("no observations for business-logic analysis");
            return Ok(Vec::new());
        }

        let mut pending = Vec::new();

        pending.extend(self.detect_enforcement_rules(observations)?);
        pending.extend(self.detect_permissions(observations)?);
        pending.extend(self.detect_rate_limits(observations)?);
        pending.extend(self.detect_state_dependencies(observations).await?);

        info!(rules = pending.len(), "business-logic inference complete");
        Ok(pending)
    }

    fn detect_enforcement_rules(&self, observations: &[Observation]) -> Result<Vec<Hypothesis>> {
        let mut hypotheses = Vec::new();

        for obs in observations {
            if !(400..500).contains(&obs.status) || matches!(obs.status, 401 | 403 | 429) {
                continue;
            }
            let Some(message) = obs.response_body.as_deref().and_then(error_message) else {
                continue;
            };

            let endpoint = crate::cluster::url_path(&obs.url);
            let (rule_kind, description) = classify_error(&message, endpoint);
            let error_head: String = message.chars().take(100).collect();

            let new = NewHypothesis::new(HypothesisKind::BusinessRule, description, "business_logic")
                .with_endpoint(endpoint, &obs.method)
                .with_rule(
                    rule_kind,
                    json!({"endpoint": endpoint, "error_pattern": error_head}),
                )
                .with_observed_response(json!({
                    "status": obs.status,
                    "error": message.chars().take(200).collect::<String>(),
                }))
                .with_evidence(vec![EvidenceRef::new(
                    obs.id.to_string(),
                    format!("{} error: {}", obs.status, error_head),
                    EvidenceStrength::Strong,
                )])
                .with_confidence(0.6);

            if let Some(hypothesis) = self.create_or_reinforce(new, obs)? {
                hypotheses.push(hypothesis);
            }
        }

        Ok(hypotheses)
    }

    fn detect_permissions(&self, observations: &[Observation]) -> Result<Vec<Hypothesis>> {
        let mut hypotheses = Vec::new();

        for obs in observations {
            let (requirement, confidence, description) = match obs.status {
                401 => (
                    "authentication",
                    0.7,
                    format!("Endpoint {} requires authentication", obs.url),
                ),
                403 => (
                    "elevated_role",
                    0.6,
                    format!("Endpoint {} requires elevated permissions", obs.url),
                ),
                _ => continue,
            };

            let endpoint = crate::cluster::url_path(&obs.url);
            let body_head: String = obs
                .response_body
                .as_deref()
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();

            let new = NewHypothesis::new(HypothesisKind::PermissionGate, description, "business_logic")
                .with_endpoint(endpoint, &obs.method)
                .with_rule(
                    RuleKind::PermissionGate,
                    json!({"endpoint": endpoint, "requirement": requirement}),
                )
                .with_observed_response(json!({"status": obs.status, "body": body_head}))
                .with_evidence(vec![EvidenceRef::new(
                    obs.id.to_string(),
                    format!(
                        "{} {} on {}",
                        obs.status,
                        if obs.status == 401 { "Unauthorized" } else { "Forbidden" },
                        obs.url
                    ),
                    EvidenceStrength::Strong,
                )])
                .with_untested_assumptions(vec![
                    if obs.status == 401 {
                        "May accept different auth methods".to_string()
                    } else {
                        "Specific role requirement unknown".to_string()
                    },
                ])
                .with_confidence(confidence);

            if let Some(hypothesis) = self.create_or_reinforce(new, obs)? {
                hypotheses.push(hypothesis);
            }
        }

        Ok(hypotheses)
    }

    fn detect_rate_limits(&self, observations: &[Observation]) -> Result<Vec<Hypothesis>> {
        let mut hypotheses = Vec::new();

        for obs in observations.iter().filter(|o| o.status == 429) {
            let endpoint = crate::cluster::url_path(&obs.url);

            let retry_after = obs.response_header("retry-after").unwrap_or("unknown");
            let mut trigger = json!({
                "endpoint": endpoint,
                "retry_after": retry_after,
            });
            // Copy every X-RateLimit-* header into the trigger conditions
            for (name, value) in &obs.response_headers {
                if name.to_lowercase().starts_with("x-ratelimit-") {
                    trigger[name.to_lowercase()] = json!(value);
                }
            }

            let new = NewHypothesis::new(
                HypothesisKind::RateLimit,
                format!("Endpoint {} has rate limiting", obs.url),
                "business_logic",
            )
            .with_endpoint(endpoint, &obs.method)
            .with_rule(RuleKind::RateLimit, trigger)
            .with_observed_response(json!({"status": 429}))
            .with_evidence(vec![EvidenceRef::new(
                obs.id.to_string(),
                format!("429 Rate Limited on {}", obs.url),
                EvidenceStrength::Strong,
            )])
            .with_untested_assumptions(vec!["Window duration uncertain".to_string()])
            .with_confidence(0.8);

            if let Some(hypothesis) = self.create_or_reinforce(new, obs)? {
                hypotheses.push(hypothesis);
            }
        }

        Ok(hypotheses)
    }

    async fn detect_state_dependencies(
        &self,
        observations: &[Observation],
    ) -> Result<Vec<Hypothesis>> {
        let Some(llm) = &self.llm else {
            return Ok(Vec::new());
        };

        // Group by bare endpoint URL; interesting ones succeed AND fail
        let mut by_endpoint: HashMap<String, Vec<&Observation>> = HashMap::new();
        for obs in observations {
            let base = obs.url.split('?').next().unwrap_or(&obs.url).to_string();
            by_endpoint.entry(base).or_default().push(obs);
        }

        let mut hypotheses = Vec::new();
        for (endpoint, group) in by_endpoint {
            let successes: Vec<&&Observation> =
                group.iter().filter(|o| o.is_success()).collect();
            let failures: Vec<&&Observation> =
                group.iter().filter(|o| o.status >= 400).collect();
            if successes.is_empty() || failures.is_empty() {
                continue;
            }

            let summarize = |items: &[&&Observation]| -> Vec<Value> {
                items
                    .iter()
                    .take(3)
                    .map(|o| {
                        json!({
                            "status": o.status,
                            "action_before": o.ui_action.as_ref().map(|a| a.kind.to_string()),
                        })
                    })
                    .collect()
            };

            let prompt = format!(
                "Analyze these API interaction patterns for state dependencies.\n\n\
                 ENDPOINT: {}\n\nSUCCESSFUL REQUESTS:\n{}\n\nFAILED REQUESTS:\n{}\n\n\
                 Is there a state dependency, and what prerequisite might be required?",
                endpoint,
                json!(summarize(&successes)),
                json!(summarize(&failures)),
            );

            let parsed = match llm
                .invoke_structured(
                    vec![ChatMessage::user(prompt)],
                    &dependency_schema(),
                    Some(BUSINESS_LOGIC_PROMPT),
                    0.5,
                )
                .await
            {
                Ok(parsed) => parsed,
                Err(error) => {
                    warn!(%error, "state-dependency analysis failed");
                    continue;
                }
            };

            if parsed.get("has_dependency").and_then(Value::as_bool) != Some(true) {
                continue;
            }

            let path = crate::cluster::url_path(&endpoint);
            let method = failures
                .first()
                .map(|o| o.method.clone())
                .unwrap_or_else(|| "GET".to_string());
            let description = parsed
                .get("description")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("State dependency on {}", endpoint));
            let prerequisite = parsed
                .get("prerequisite")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let confidence = parsed
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.5)
                .clamp(0.0, 1.0);

            let evidence: Vec<EvidenceRef> = successes
                .iter()
                .take(3)
                .map(|o| {
                    EvidenceRef::new(o.id.to_string(), "Successful request", EvidenceStrength::Moderate)
                })
                .chain(failures.iter().take(3).map(|o| {
                    EvidenceRef::new(o.id.to_string(), "Failed request", EvidenceStrength::Moderate)
                }))
                .collect();

            let new = NewHypothesis::new(HypothesisKind::StateTransition, description, "business_logic")
                .with_endpoint(path, &method)
                .with_rule(
                    RuleKind::RequiredSequence,
                    json!({"endpoint": endpoint, "prerequisite": prerequisite}),
                )
                .with_evidence(evidence)
                .with_untested_assumptions(vec![
                    "Sequence requirements not fully mapped".to_string(),
                ])
                .with_confidence(confidence);

            match self.store.create(new) {
                Ok(hypothesis) => hypotheses.push(hypothesis),
                Err(Error::Conflict(_)) => {}
                Err(error) => return Err(error),
            }
        }

        Ok(hypotheses)
    }

    /// Create the hypothesis, or reinforce the existing one with the new
    /// observation when the `(kind, pattern, method)` key already exists.
    fn create_or_reinforce(
        &self,
        new: NewHypothesis,
        obs: &Observation,
    ) -> Result<Option<Hypothesis>> {
        let kind = new.kind;
        let pattern = new.endpoint_pattern.clone();
        let method = new.method.clone();
        let summary = new
            .evidence
            .first()
            .map(|e| e.summary.clone())
            .unwrap_or_else(|| format!("{} on {}", obs.status, obs.url));

        match self.store.create(new) {
            Ok(hypothesis) => Ok(Some(hypothesis)),
            Err(Error::Conflict(_)) => {
                let (Some(pattern), Some(method)) = (pattern, method) else {
                    return Ok(None);
                };
                let Some(existing) = self.store.find_by_kind_endpoint(kind, &pattern, &method)?
                else {
                    return Ok(None);
                };
                let updated = self.store.add_evidence(
                    &existing.id,
                    EvidenceRef::new(obs.id.to_string(), summary, EvidenceStrength::Strong),
                    "business_logic",
                )?;
                Ok(Some(updated))
            }
            Err(error) => Err(error),
        }
    }
}
