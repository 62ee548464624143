//! Core types for hypotheses, critic reviews, and probes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a hypothesis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HypothesisId(pub Uuid);

impl HypothesisId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HypothesisId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HypothesisId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of inferred knowledge a hypothesis represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisKind {
    EndpointSchema,
    BusinessRule,
    StateTransition,
    PermissionGate,
    RateLimit,
    FieldConstraint,
}

impl HypothesisKind {
    pub const ALL: [HypothesisKind; 6] = [
        Self::EndpointSchema,
        Self::BusinessRule,
        Self::StateTransition,
        Self::PermissionGate,
        Self::RateLimit,
        Self::FieldConstraint,
    ];
}

impl std::fmt::Display for HypothesisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndpointSchema => write!(f, "endpoint_schema"),
            Self::BusinessRule => write!(f, "business_rule"),
            Self::StateTransition => write!(f, "state_transition"),
            Self::PermissionGate => write!(f, "permission_gate"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::FieldConstraint => write!(f, "field_constraint"),
        }
    }
}

/// Lifecycle status of a hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisStatus {
    Active,
    Challenged,
    Confirmed,
    Falsified,
    NeedsRevision,
}

impl HypothesisStatus {
    /// Terminal statuses never transition back to `Active`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Falsified)
    }
}

impl std::fmt::Display for HypothesisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Challenged => write!(f, "challenged"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Falsified => write!(f, "falsified"),
            Self::NeedsRevision => write!(f, "needs_revision"),
        }
    }
}

/// Strength of an evidence reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStrength {
    Weak,
    Moderate,
    Strong,
}

/// Pointer from a hypothesis to a supporting or contradicting observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    /// Observation id this evidence points at
    pub observation_id: String,
    /// One-line summary of what was observed
    pub summary: String,
    /// Strength of the evidence
    pub strength: EvidenceStrength,
}

impl EvidenceRef {
    pub fn new(
        observation_id: impl Into<String>,
        summary: impl Into<String>,
        strength: EvidenceStrength,
    ) -> Self {
        Self {
            observation_id: observation_id.into(),
            summary: summary.into(),
            strength,
        }
    }
}

/// An alternative explanation that could also fit the evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetingExplanation {
    pub description: String,
    /// How plausible the alternative is (0.0-1.0)
    pub plausibility: f64,
    /// A test that would distinguish it from the main hypothesis
    pub distinguishing_test: String,
}

impl CompetingExplanation {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            plausibility: 0.5,
            distinguishing_test: "Requires further investigation".to_string(),
        }
    }
}

/// Kind of confidence-changing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceEventKind {
    InitialInference,
    EvidenceAdded,
    CriticChallenge,
    ProbeConfirmed,
    ProbeFalsified,
    ProbeInconclusive,
    Merged,
}

impl std::fmt::Display for ConfidenceEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitialInference => write!(f, "initial_inference"),
            Self::EvidenceAdded => write!(f, "evidence_added"),
            Self::CriticChallenge => write!(f, "critic_challenge"),
            Self::ProbeConfirmed => write!(f, "probe_confirmed"),
            Self::ProbeFalsified => write!(f, "probe_falsified"),
            Self::ProbeInconclusive => write!(f, "probe_inconclusive"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// Immutable record of one confidence change. Appending one of these is the
/// only way a hypothesis's confidence moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceEvent {
    pub timestamp: DateTime<Utc>,
    pub event_kind: ConfidenceEventKind,
    pub old_confidence: f64,
    pub new_confidence: f64,
    pub reason: String,
    pub agent: String,
}

impl ConfidenceEvent {
    pub fn new(
        event_kind: ConfidenceEventKind,
        old_confidence: f64,
        new_confidence: f64,
        reason: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_kind,
            old_confidence,
            new_confidence,
            reason: reason.into(),
            agent: agent.into(),
        }
    }

    /// Idempotence key: two events with the same key within one logical
    /// operation are the same event.
    pub fn dedup_key(&self) -> (ConfidenceEventKind, &str, &str) {
        (self.event_kind, self.reason.as_str(), self.agent.as_str())
    }
}

/// Kind of server-side rule a business hypothesis describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    FieldConstraint,
    RequiredSequence,
    PermissionGate,
    RateLimit,
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FieldConstraint => write!(f, "field_constraint"),
            Self::RequiredSequence => write!(f, "required_sequence"),
            Self::PermissionGate => write!(f, "permission_gate"),
            Self::RateLimit => write!(f, "rate_limit"),
        }
    }
}

/// The central unit of inferred knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: HypothesisId,
    pub kind: HypothesisKind,
    pub status: HypothesisStatus,
    pub description: String,

    // Endpoint-schema fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub field_semantics: HashMap<String, String>,

    // Business-rule fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_kind: Option<RuleKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_conditions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_response: Option<Value>,

    // Evidence
    pub supporting_evidence: Vec<EvidenceRef>,
    #[serde(default)]
    pub contradicting_evidence: Vec<EvidenceRef>,
    #[serde(default)]
    pub competing_explanations: Vec<CompetingExplanation>,
    #[serde(default)]
    pub untested_assumptions: Vec<String>,

    pub confidence: f64,
    pub confidence_history: Vec<ConfidenceEvent>,

    pub created_by: String,
    pub last_modified_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u32,
}

impl Hypothesis {
    /// Confidence after the k-th confidence event.
    pub fn confidence_at(&self, k: usize) -> Option<f64> {
        self.confidence_history.get(k).map(|e| e.new_confidence)
    }

    /// Whether the hypothesis qualifies for OpenAPI export.
    pub fn is_exportable(&self, min_confidence: f64) -> bool {
        self.confidence >= min_confidence && self.status != HypothesisStatus::Falsified
    }

    /// Dedup key for endpoint-schema hypotheses.
    pub fn endpoint_key(&self) -> Option<(String, String)> {
        match (self.endpoint_pattern.as_ref(), self.method.as_ref()) {
            (Some(pattern), Some(method)) => {
                Some((pattern.clone(), method.to_uppercase()))
            }
            _ => None,
        }
    }
}

/// Builder for creating hypotheses through the store.
#[derive(Debug, Clone)]
pub struct NewHypothesis {
    pub kind: HypothesisKind,
    pub description: String,
    pub created_by: String,
    pub evidence: Vec<EvidenceRef>,
    pub competing_explanations: Vec<CompetingExplanation>,
    pub untested_assumptions: Vec<String>,
    pub endpoint_pattern: Option<String>,
    pub method: Option<String>,
    pub request_schema: Option<Value>,
    pub response_schema: Option<Value>,
    pub field_semantics: HashMap<String, String>,
    pub rule_kind: Option<RuleKind>,
    pub trigger_conditions: Option<Value>,
    pub observed_response: Option<Value>,
    pub confidence_override: Option<f64>,
}

impl NewHypothesis {
    pub fn new(
        kind: HypothesisKind,
        description: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            created_by: created_by.into(),
            evidence: Vec::new(),
            competing_explanations: Vec::new(),
            untested_assumptions: Vec::new(),
            endpoint_pattern: None,
            method: None,
            request_schema: None,
            response_schema: None,
            field_semantics: HashMap::new(),
            rule_kind: None,
            trigger_conditions: None,
            observed_response: None,
            confidence_override: None,
        }
    }

    pub fn with_endpoint(mut self, pattern: impl Into<String>, method: impl Into<String>) -> Self {
        self.endpoint_pattern = Some(pattern.into());
        self.method = Some(method.into());
        self
    }

    pub fn with_schemas(mut self, request: Option<Value>, response: Option<Value>) -> Self {
        self.request_schema = request;
        self.response_schema = response;
        self
    }

    pub fn with_field_semantics(mut self, semantics: HashMap<String, String>) -> Self {
        self.field_semantics = semantics;
        self
    }

    pub fn with_rule(mut self, rule_kind: RuleKind, trigger_conditions: Value) -> Self {
        self.rule_kind = Some(rule_kind);
        self.trigger_conditions = Some(trigger_conditions);
        self
    }

    pub fn with_observed_response(mut self, response: Value) -> Self {
        self.observed_response = Some(response);
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<EvidenceRef>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_competing_explanations(mut self, competing: Vec<CompetingExplanation>) -> Self {
        self.competing_explanations = competing;
        self
    }

    pub fn with_untested_assumptions(mut self, assumptions: Vec<String>) -> Self {
        self.untested_assumptions = assumptions;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_override = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

/// Critic's verdict on a hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticVerdict {
    Accept,
    Challenge,
    Reject,
}

impl std::fmt::Display for CriticVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Challenge => write!(f, "challenge"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// One review produced by the critic for a pending hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticReview {
    pub hypothesis_id: HypothesisId,
    pub verdict: CriticVerdict,
    #[serde(default)]
    pub alternative_explanations: Vec<String>,
    #[serde(default)]
    pub untested_assumptions: Vec<String>,
    #[serde(default)]
    pub missing_evidence: Vec<String>,
    #[serde(default)]
    pub contradictions: Vec<String>,
    pub original_confidence: f64,
    pub recommended_confidence: f64,
    pub adjustment_reason: String,
    #[serde(default)]
    pub required_probes: Vec<ProbeRequest>,
    #[serde(default)]
    pub required_exploration: Vec<String>,
}

/// Kind of bounded validation probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    ReplayExact,
    MutateField,
    OmitField,
    AddField,
    ChangeType,
    BoundaryValue,
    SequenceBreak,
    AuthVariation,
}

impl ProbeKind {
    /// Fuzzing-class probes require explicit enablement.
    pub fn is_fuzzing(&self) -> bool {
        matches!(self, Self::BoundaryValue | Self::ChangeType)
    }
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReplayExact => write!(f, "replay_exact"),
            Self::MutateField => write!(f, "mutate_field"),
            Self::OmitField => write!(f, "omit_field"),
            Self::AddField => write!(f, "add_field"),
            Self::ChangeType => write!(f, "change_type"),
            Self::BoundaryValue => write!(f, "boundary_value"),
            Self::SequenceBreak => write!(f, "sequence_break"),
            Self::AuthVariation => write!(f, "auth_variation"),
        }
    }
}

/// A probe requested by the critic for a hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub kind: ProbeKind,
    pub hypothesis_id: HypothesisId,
    pub description: String,
    pub expected_outcome: String,
}

impl ProbeRequest {
    pub fn new(
        kind: ProbeKind,
        hypothesis_id: HypothesisId,
        description: impl Into<String>,
        expected_outcome: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            hypothesis_id,
            description: description.into(),
            expected_outcome: expected_outcome.into(),
        }
    }
}

/// Outcome of an executed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Confirmed,
    Falsified,
    Inconclusive,
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmed => write!(f, "confirmed"),
            Self::Falsified => write!(f, "falsified"),
            Self::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

/// Result of an executed probe, ready to feed the probe confidence rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub id: Uuid,
    pub hypothesis_id: HypothesisId,
    pub probe_kind: ProbeKind,
    /// Snapshot of the issued request (method, url, headers)
    pub request: Value,
    pub response_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub outcome: ProbeOutcome,
    /// Delta hint from the outcome table; the store's probe rule takes
    /// precedence where one applies
    pub confidence_delta: f64,
    pub notes: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_hypothesis_builder() {
        let new = NewHypothesis::new(HypothesisKind::EndpointSchema, "users endpoint", "analyst")
            .with_endpoint("/api/users/{id}", "GET")
            .with_untested_assumptions(vec!["sample is small".into()]);

        assert_eq!(new.kind, HypothesisKind::EndpointSchema);
        assert_eq!(new.endpoint_pattern.as_deref(), Some("/api/users/{id}"));
        assert_eq!(new.untested_assumptions.len(), 1);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(HypothesisStatus::Confirmed.is_terminal());
        assert!(HypothesisStatus::Falsified.is_terminal());
        assert!(!HypothesisStatus::Active.is_terminal());
        assert!(!HypothesisStatus::NeedsRevision.is_terminal());
    }

    #[test]
    fn test_fuzzing_probe_kinds() {
        assert!(ProbeKind::BoundaryValue.is_fuzzing());
        assert!(ProbeKind::ChangeType.is_fuzzing());
        assert!(!ProbeKind::ReplayExact.is_fuzzing());
        assert!(!ProbeKind::AuthVariation.is_fuzzing());
    }

    #[test]
    fn test_kind_display_round_trip() {
        for kind in HypothesisKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json.trim_matches('"'), kind.to_string());
        }
    }

    #[test]
    fn test_event_dedup_key() {
        let a = ConfidenceEvent::new(ConfidenceEventKind::EvidenceAdded, 0.2, 0.35, "r", "analyst");
        let b = ConfidenceEvent::new(ConfidenceEventKind::EvidenceAdded, 0.2, 0.35, "r", "analyst");
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
