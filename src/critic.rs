//! Adversarial hypothesis review.
//!
//! The critic's job is to challenge, not confirm: for every pending
//! hypothesis it enumerates alternative explanations, untested assumptions,
//! and missing evidence, recommends a (usually lower) confidence, and names
//! the probes that would settle the question. When the language model is
//! unreachable the deterministic fallback still produces a conservative
//! review so the loop keeps moving.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hypothesis::{
    CriticReview, CriticVerdict, Hypothesis, HypothesisKind, ProbeKind, ProbeRequest,
};
use crate::llm::{ChatMessage, LlmClient};

const CRITIC_SYSTEM_PROMPT: &str = "You are an ADVERSARIAL CRITIC. Your job is to CHALLENGE \
hypotheses, not confirm them. For every hypothesis list all alternative explanations that fit \
the evidence, identify untested assumptions, find missing evidence, and check for \
contradictions.\n\nSCORING RULES (apply strictly):\n\
- 1-2 supporting observations: confidence <= 0.3\n\
- each alternative explanation: reduce confidence by 0.2\n\
- each untested critical assumption: reduce confidence by 0.3\n\
- circumstantial evidence: reduce confidence by 0.2\n\
- each logical gap: reduce confidence by 0.15\n\n\
Find weaknesses, not strengths. The only good hypothesis is one that has survived rigorous \
challenge.";

fn review_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "verdict": {"type": "string"},
            "alternative_explanations": {"type": "array", "items": {"type": "string"}},
            "untested_assumptions": {"type": "array", "items": {"type": "string"}},
            "missing_evidence": {"type": "array", "items": {"type": "string"}},
            "contradictions": {"type": "array", "items": {"type": "string"}},
            "recommended_confidence": {"type": "number"},
            "adjustment_reason": {"type": "string"},
            "required_exploration": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["verdict", "recommended_confidence", "adjustment_reason"]
    })
}

/// Challenges pending hypotheses and prescribes probes.
pub struct Critic {
    llm: Option<Arc<dyn LlmClient>>,
}

impl Critic {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    /// Review every pending hypothesis.
    pub async fn review_all(&self, pending: &[Hypothesis]) -> Vec<CriticReview> {
        if pending.is_empty() {
            debug!("no hypotheses to critique");
            return Vec::new();
        }

        let mut reviews = Vec::with_capacity(pending.len());
        for hypothesis in pending {
            reviews.push(self.review(hypothesis).await);
        }

        let accepted = reviews
            .iter()
            .filter(|r| r.verdict == CriticVerdict::Accept)
            .count();
        info!(
            total = reviews.len(),
            accepted,
            challenged = reviews.len() - accepted,
            "critic reviews complete"
        );
        reviews
    }

    /// Review one hypothesis, falling back to the deterministic strategy on
    /// any language-model failure.
    pub async fn review(&self, hypothesis: &Hypothesis) -> CriticReview {
        let mut review = match self.llm_review(hypothesis).await {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, hypothesis = %hypothesis.id, "critic falling back to deterministic review");
                self.fallback_review(hypothesis)
            }
        };

        review.recommended_confidence = review.recommended_confidence.clamp(0.0, 1.0);

        // Any verdict short of acceptance needs probes to settle it
        if review.verdict != CriticVerdict::Accept && review.required_probes.is_empty() {
            review.required_probes = default_probes(hypothesis);
        }

        review
    }

    async fn llm_review(&self, hypothesis: &Hypothesis) -> Result<CriticReview> {
        let llm = self.llm.as_ref().ok_or_else(|| {
            crate::error::Error::llm("none", "no language-model provider configured")
        })?;

        let parsed = llm
            .invoke_structured(
                vec![ChatMessage::user(evaluation_prompt(hypothesis))],
                &review_schema(),
                Some(CRITIC_SYSTEM_PROMPT),
                0.3,
            )
            .await?;

        let verdict = match parsed.get("verdict").and_then(Value::as_str) {
            Some("accept") => CriticVerdict::Accept,
            Some("reject") => CriticVerdict::Reject,
            // Unknown verdicts are treated as challenges
            _ => CriticVerdict::Challenge,
        };

        let strings = |key: &str| -> Vec<String> {
            parsed
                .get(key)
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(CriticReview {
            hypothesis_id: hypothesis.id.clone(),
            verdict,
            alternative_explanations: strings("alternative_explanations"),
            untested_assumptions: strings("untested_assumptions"),
            missing_evidence: strings("missing_evidence"),
            contradictions: strings("contradictions"),
            original_confidence: hypothesis.confidence,
            recommended_confidence: parsed
                .get("recommended_confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.3),
            adjustment_reason: parsed
                .get("adjustment_reason")
                .and_then(Value::as_str)
                .unwrap_or("Critic adjustment")
                .to_string(),
            required_probes: Vec::new(),
            required_exploration: strings("required_exploration"),
        })
    }

    /// Deterministic review from evidence count alone.
    fn fallback_review(&self, hypothesis: &Hypothesis) -> CriticReview {
        let evidence_count = hypothesis.supporting_evidence.len();
        let current = hypothesis.confidence;

        let (recommended, verdict) = if evidence_count <= 1 {
            (current.min(0.3), CriticVerdict::Challenge)
        } else if evidence_count <= 3 {
            (current.min(0.5), CriticVerdict::Challenge)
        } else if current >= 0.6 {
            (current.min(0.7), CriticVerdict::Accept)
        } else {
            (current.min(0.7), CriticVerdict::Challenge)
        };

        CriticReview {
            hypothesis_id: hypothesis.id.clone(),
            verdict,
            alternative_explanations: vec![
                "Evidence may be coincidental".to_string(),
                "Observed behavior may be context-dependent".to_string(),
            ],
            untested_assumptions: vec![
                "Assumes consistent API behavior".to_string(),
                "Limited observation sample".to_string(),
            ],
            missing_evidence: vec![
                "Need more diverse test cases".to_string(),
                "Need negative test cases".to_string(),
            ],
            contradictions: Vec::new(),
            original_confidence: current,
            recommended_confidence: recommended,
            adjustment_reason: format!(
                "Conservative evaluation: {} observations supporting",
                evidence_count
            ),
            required_probes: Vec::new(),
            required_exploration: Vec::new(),
        }
    }
}

/// Default probes for a non-accepted hypothesis, keyed to its kind.
pub fn default_probes(hypothesis: &Hypothesis) -> Vec<ProbeRequest> {
    let id = hypothesis.id.clone();

    match hypothesis.kind {
        HypothesisKind::EndpointSchema => {
            let method = hypothesis.method.as_deref().unwrap_or("GET");
            let mut probes = vec![ProbeRequest::new(
                ProbeKind::ReplayExact,
                id.clone(),
                format!(
                    "Replay {} {} to confirm consistency",
                    method,
                    hypothesis.endpoint_pattern.as_deref().unwrap_or("?")
                ),
                "Same response structure",
            )];
            if matches!(method, "POST" | "PUT" | "PATCH") {
                probes.push(ProbeRequest::new(
                    ProbeKind::OmitField,
                    id.clone(),
                    "Submit with a field omitted",
                    "Success with defaults or a validation error",
                ));
            }
            probes.push(ProbeRequest::new(
                ProbeKind::AuthVariation,
                id,
                "Request without authentication",
                "401 if auth required, else same response",
            ));
            probes
        }
        HypothesisKind::BusinessRule | HypothesisKind::StateTransition => {
            vec![ProbeRequest::new(
                ProbeKind::SequenceBreak,
                id,
                "Issue the request without its prerequisite action",
                "Error if the sequence is enforced",
            )]
        }
        HypothesisKind::PermissionGate => {
            vec![ProbeRequest::new(
                ProbeKind::AuthVariation,
                id,
                "Request with authentication stripped",
                "401/403 if the gate is real",
            )]
        }
        HypothesisKind::RateLimit | HypothesisKind::FieldConstraint => {
            vec![ProbeRequest::new(
                ProbeKind::ReplayExact,
                id,
                "Replay the triggering request",
                "Same enforcement response",
            )]
        }
    }
}

fn evaluation_prompt(hypothesis: &Hypothesis) -> String {
    let evidence: Vec<String> = hypothesis
        .supporting_evidence
        .iter()
        .take(5)
        .map(|e| format!("  - {}", e.summary))
        .collect();
    let evidence = if evidence.is_empty() {
        "  (no evidence provided)".to_string()
    } else {
        evidence.join("\n")
    };

    let schema = hypothesis
        .response_schema
        .as_ref()
        .map(|s| {
            let text = serde_json::to_string_pretty(s).unwrap_or_default();
            let clipped: String = text.chars().take(500).collect();
            format!("\nRESPONSE SCHEMA:\n```json\n{}\n```", clipped)
        })
        .unwrap_or_default();

    let rule = hypothesis
        .rule_kind
        .map(|kind| {
            let trigger = hypothesis
                .trigger_conditions
                .as_ref()
                .map(|t| {
                    let text = t.to_string();
                    let clipped: String = text.chars().take(200).collect();
                    format!("\nTRIGGER: {}", clipped)
                })
                .unwrap_or_default();
            format!("\nRULE KIND: {}{}", kind, trigger)
        })
        .unwrap_or_default();

    let competing: Vec<String> = hypothesis
        .competing_explanations
        .iter()
        .map(|c| format!("  - {}", c.description))
        .collect();
    let assumptions: Vec<String> = hypothesis
        .untested_assumptions
        .iter()
        .map(|a| format!("  - {}", a))
        .collect();

    format!(
        "HYPOTHESIS UNDER REVIEW:\n\nKIND: {}\nDESCRIPTION: {}\nCURRENT CONFIDENCE: {:.2}{}{}\n\n\
         SUPPORTING EVIDENCE:\n{}\n\nEXISTING COMPETING EXPLANATIONS:\n{}\n\n\
         UNTESTED ASSUMPTIONS NOTED:\n{}\n\n---\n\n\
         Critically evaluate this hypothesis. Respond with verdict accept, challenge, or reject, \
         a recommended confidence, and what is missing. Apply the scoring rules strictly.",
        hypothesis.kind,
        hypothesis.description,
        hypothesis.confidence,
        rule,
        schema,
        evidence,
        if competing.is_empty() { "  (none)".to_string() } else { competing.join("\n") },
        if assumptions.is_empty() { "  (none)".to_string() } else { assumptions.join("\n") },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypothesis::{
        EvidenceRef, EvidenceStrength, HypothesisStore, NewHypothesis,
    };
    use async_trait::async_trait;

    fn hypothesis_with_evidence(count: usize) -> Hypothesis {
        let store = HypothesisStore::new();
        let evidence = (0..count)
            .map(|i| EvidenceRef::new(format!("obs-{}", i), "observed", EvidenceStrength::Strong))
            .collect();
        store
            .create(
                NewHypothesis::new(HypothesisKind::EndpointSchema, "users endpoint", "analyst")
                    .with_endpoint("/api/users/{id}", "GET")
                    .with_evidence(evidence),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_fallback_single_observation_capped() {
        let critic = Critic::new(None);
        let hypothesis = hypothesis_with_evidence(1);
        let review = critic.review(&hypothesis).await;

        assert_eq!(review.verdict, CriticVerdict::Challenge);
        assert!(review.recommended_confidence <= 0.3);
        assert_eq!(review.alternative_explanations.len(), 2);
        assert!(!review.required_probes.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_tiers() {
        let critic = Critic::new(None);

        let two = critic.review(&hypothesis_with_evidence(3)).await;
        assert!(two.recommended_confidence <= 0.5);

        let many = critic.review(&hypothesis_with_evidence(6)).await;
        assert!(many.recommended_confidence <= 0.7);
        assert_eq!(many.verdict, CriticVerdict::Accept);
    }

    #[test]
    fn test_default_probes_for_schema_kind() {
        let hypothesis = hypothesis_with_evidence(1);
        let probes = default_probes(&hypothesis);
        let kinds: Vec<ProbeKind> = probes.iter().map(|p| p.kind).collect();
        assert!(kinds.contains(&ProbeKind::ReplayExact));
        assert!(kinds.contains(&ProbeKind::AuthVariation));
        // GET endpoints get no omit-field probe
        assert!(!kinds.contains(&ProbeKind::OmitField));
    }

    #[test]
    fn test_default_probes_for_write_schema() {
        let store = HypothesisStore::new();
        let hypothesis = store
            .create(
                NewHypothesis::new(HypothesisKind::EndpointSchema, "create order", "analyst")
                    .with_endpoint("/api/orders", "POST"),
            )
            .unwrap();

        let kinds: Vec<ProbeKind> = default_probes(&hypothesis).iter().map(|p| p.kind).collect();
        assert!(kinds.contains(&ProbeKind::OmitField));
    }

    #[test]
    fn test_default_probes_for_rules_and_gates() {
        let store = HypothesisStore::new();
        let rule = store
            .create(NewHypothesis::new(
                HypothesisKind::StateTransition,
                "checkout sequence",
                "business_logic",
            ))
            .unwrap();
        let kinds: Vec<ProbeKind> = default_probes(&rule).iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![ProbeKind::SequenceBreak]);

        let gate = store
            .create(NewHypothesis::new(
                HypothesisKind::PermissionGate,
                "auth required",
                "business_logic",
            ))
            .unwrap();
        let kinds: Vec<ProbeKind> = default_probes(&gate).iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![ProbeKind::AuthVariation]);
    }

    /// LLM double returning a fixed structured payload.
    struct FixedLlm {
        payload: Value,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn invoke(
            &self,
            _request: crate::llm::InvokeRequest,
        ) -> crate::error::Result<crate::llm::InvokeResponse> {
            Ok(crate::llm::InvokeResponse::default())
        }

        async fn invoke_structured(
            &self,
            _messages: Vec<ChatMessage>,
            _schema: &Value,
            _system_prompt: Option<&str>,
            _temperature: f64,
        ) -> crate::error::Result<Value> {
            Ok(self.payload.clone())
        }

        fn provider(&self) -> crate::llm::Provider {
            crate::llm::Provider::OpenAi
        }
    }

    #[tokio::test]
    async fn test_llm_review_parsed() {
        let critic = Critic::new(Some(Arc::new(FixedLlm {
            payload: json!({
                "verdict": "challenge",
                "alternative_explanations": ["cached response"],
                "untested_assumptions": ["single auth level"],
                "missing_evidence": ["error-case observation"],
                "contradictions": [],
                "recommended_confidence": 0.28,
                "adjustment_reason": "limited evidence",
                "required_exploration": ["admin section"]
            }),
        })));

        let hypothesis = hypothesis_with_evidence(2);
        let review = critic.review(&hypothesis).await;

        assert_eq!(review.verdict, CriticVerdict::Challenge);
        assert!((review.recommended_confidence - 0.28).abs() < 1e-9);
        assert_eq!(review.alternative_explanations, vec!["cached response"]);
        assert_eq!(review.required_exploration, vec!["admin section"]);
        // Challenge verdict pulls in the default probes
        assert!(!review.required_probes.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_verdict_becomes_challenge() {
        let critic = Critic::new(Some(Arc::new(FixedLlm {
            payload: json!({
                "verdict": "maybe",
                "recommended_confidence": 1.7,
                "adjustment_reason": "odd output"
            }),
        })));

        let review = critic.review(&hypothesis_with_evidence(2)).await;
        assert_eq!(review.verdict, CriticVerdict::Challenge);
        // Out-of-range recommendation is clamped
        assert!((review.recommended_confidence - 1.0).abs() < 1e-9);
    }
}
