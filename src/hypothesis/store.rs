//! In-memory hypothesis store with confidence accounting.
//!
//! Every mutation appends exactly one confidence event and bumps the
//! revision. Mutators are idempotent per `(event kind, reason, agent)`:
//! re-applying the same logical operation leaves the hypothesis unchanged
//! and appends no second event.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::schema::merge_schemas;

use super::confidence::{ConfidenceCalculator, REVISION_THRESHOLD, STOP_THRESHOLD};
use super::types::{
    CompetingExplanation, ConfidenceEvent, ConfidenceEventKind, CriticReview, CriticVerdict,
    EvidenceRef, Hypothesis, HypothesisId, HypothesisKind, HypothesisStatus, NewHypothesis,
    ProbeOutcome, ProbeResult,
};

/// Read-only filter over the store.
#[derive(Debug, Clone, Default)]
pub struct HypothesisFilter {
    pub kind: Option<HypothesisKind>,
    pub min_confidence: Option<f64>,
    pub status: Option<HypothesisStatus>,
}

impl HypothesisFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: HypothesisKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn min_confidence(mut self, min: f64) -> Self {
        self.min_confidence = Some(min);
        self
    }

    pub fn status(mut self, status: HypothesisStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches(&self, hypothesis: &Hypothesis) -> bool {
        if let Some(kind) = self.kind {
            if hypothesis.kind != kind {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if hypothesis.confidence < min {
                return false;
            }
        }
        if let Some(status) = self.status {
            if hypothesis.status != status {
                return false;
            }
        }
        true
    }
}

/// A detected contradiction between two hypotheses.
#[derive(Debug, Clone, PartialEq)]
pub struct Contradiction {
    pub first: HypothesisId,
    pub second: HypothesisId,
    pub description: String,
}

/// Confidence breakdown across the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfidenceSummary {
    pub total: usize,
    pub mean_confidence: f64,
    pub high_confidence: usize,
    pub low_confidence: usize,
    pub confirmed: usize,
    pub needs_revision: usize,
    pub by_kind: HashMap<HypothesisKind, usize>,
}

/// Manages hypotheses and their confidence scores.
#[derive(Debug, Default)]
pub struct HypothesisStore {
    inner: Mutex<HashMap<HypothesisId, Hypothesis>>,
}

impl HypothesisStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new hypothesis. Rejects duplicates of `(kind, pattern,
    /// method)`; the caller must merge into the existing hypothesis instead.
    pub fn create(&self, new: NewHypothesis) -> Result<Hypothesis> {
        let mut map = self.lock()?;

        if let (Some(pattern), Some(method)) = (&new.endpoint_pattern, &new.method) {
            let key = (pattern.clone(), method.to_uppercase());
            if let Some(existing) = map
                .values()
                .find(|h| h.kind == new.kind && h.endpoint_key().as_ref() == Some(&key))
            {
                return Err(Error::Conflict(format!(
                    "hypothesis for {} {} {} already exists as {}",
                    new.kind, method, pattern, existing.id
                )));
            }
        }

        let initial = match new.confidence_override {
            Some(confidence) => confidence,
            None => ConfidenceCalculator::initial_confidence(
                new.evidence.len(),
                new.competing_explanations.len(),
                new.untested_assumptions.len(),
            ),
        };

        let now = Utc::now();
        let hypothesis = Hypothesis {
            id: HypothesisId::new(),
            kind: new.kind,
            status: HypothesisStatus::Active,
            description: new.description,
            endpoint_pattern: new.endpoint_pattern,
            method: new.method.map(|m| m.to_uppercase()),
            request_schema: new.request_schema,
            response_schema: new.response_schema,
            field_semantics: new.field_semantics,
            rule_kind: new.rule_kind,
            trigger_conditions: new.trigger_conditions,
            observed_response: new.observed_response,
            contradicting_evidence: Vec::new(),
            competing_explanations: new.competing_explanations,
            untested_assumptions: new.untested_assumptions,
            confidence: initial,
            confidence_history: vec![ConfidenceEvent::new(
                ConfidenceEventKind::InitialInference,
                0.0,
                initial,
                format!("Initial inference with {} observations", new.evidence.len()),
                new.created_by.clone(),
            )],
            supporting_evidence: new.evidence,
            created_by: new.created_by.clone(),
            last_modified_by: new.created_by,
            created_at: now,
            updated_at: now,
            revision: 1,
        };

        map.insert(hypothesis.id.clone(), hypothesis.clone());
        Ok(hypothesis)
    }

    /// Append supporting evidence. Confidence is recomputed by the initial
    /// rule but never decreases.
    pub fn add_evidence(
        &self,
        id: &HypothesisId,
        evidence: EvidenceRef,
        agent: &str,
    ) -> Result<Hypothesis> {
        let mut map = self.lock()?;
        let hypothesis = get_mut(&mut map, id)?;

        let reason = format!("Added evidence: {}", evidence.summary);
        if already_applied(hypothesis, ConfidenceEventKind::EvidenceAdded, &reason, agent) {
            return Ok(hypothesis.clone());
        }

        hypothesis.supporting_evidence.push(evidence);

        let old = hypothesis.confidence;
        let recomputed = ConfidenceCalculator::initial_confidence(
            hypothesis.supporting_evidence.len(),
            hypothesis.competing_explanations.len(),
            hypothesis.untested_assumptions.len(),
        );
        let new = old.max(recomputed);

        apply_event(
            hypothesis,
            ConfidenceEventKind::EvidenceAdded,
            new,
            reason,
            agent,
        );
        Ok(hypothesis.clone())
    }

    /// Apply a critic review: record alternatives and assumptions
    /// (deduplicated by exact description), then adjust confidence by the
    /// critic rule.
    pub fn apply_critic(&self, id: &HypothesisId, review: &CriticReview) -> Result<Hypothesis> {
        let mut map = self.lock()?;
        let hypothesis = get_mut(&mut map, id)?;

        if already_applied(
            hypothesis,
            ConfidenceEventKind::CriticChallenge,
            &review.adjustment_reason,
            "critic",
        ) {
            return Ok(hypothesis.clone());
        }

        for alternative in &review.alternative_explanations {
            if !hypothesis
                .competing_explanations
                .iter()
                .any(|c| c.description == *alternative)
            {
                hypothesis
                    .competing_explanations
                    .push(CompetingExplanation::new(alternative.clone()));
            }
        }
        for assumption in &review.untested_assumptions {
            if !hypothesis.untested_assumptions.contains(assumption) {
                hypothesis.untested_assumptions.push(assumption.clone());
            }
        }

        let old = hypothesis.confidence;
        let new =
            ConfidenceCalculator::apply_critic(old, review.verdict, review.recommended_confidence);

        apply_event(
            hypothesis,
            ConfidenceEventKind::CriticChallenge,
            new,
            review.adjustment_reason.clone(),
            "critic",
        );

        if !hypothesis.status.is_terminal() {
            if new < REVISION_THRESHOLD {
                hypothesis.status = HypothesisStatus::NeedsRevision;
            } else if matches!(review.verdict, CriticVerdict::Challenge | CriticVerdict::Reject) {
                hypothesis.status = HypothesisStatus::Challenged;
            }
        }

        Ok(hypothesis.clone())
    }

    /// Apply a probe result: adjust confidence by the probe rule and settle
    /// status transitions.
    pub fn apply_probe(&self, id: &HypothesisId, result: &ProbeResult) -> Result<Hypothesis> {
        let mut map = self.lock()?;
        let hypothesis = get_mut(&mut map, id)?;

        let event_kind = match result.outcome {
            ProbeOutcome::Confirmed => ConfidenceEventKind::ProbeConfirmed,
            ProbeOutcome::Falsified => ConfidenceEventKind::ProbeFalsified,
            ProbeOutcome::Inconclusive => ConfidenceEventKind::ProbeInconclusive,
        };
        let reason = if result.notes.is_empty() {
            format!("Probe {}", result.outcome)
        } else {
            result.notes.clone()
        };

        if already_applied(hypothesis, event_kind, &reason, "verifier") {
            return Ok(hypothesis.clone());
        }

        let old = hypothesis.confidence;
        let new = ConfidenceCalculator::apply_probe(old, result.outcome);

        apply_event(hypothesis, event_kind, new, reason, "verifier");

        match result.outcome {
            ProbeOutcome::Falsified => {
                hypothesis.contradicting_evidence.push(EvidenceRef::new(
                    result.id.to_string(),
                    format!("Probe falsified: {}", result.notes),
                    super::types::EvidenceStrength::Strong,
                ));
                if hypothesis.status.is_terminal() {
                    // Terminal statuses only move to needs_revision on contradiction
                    hypothesis.status = HypothesisStatus::NeedsRevision;
                } else if new < REVISION_THRESHOLD {
                    hypothesis.status = HypothesisStatus::Falsified;
                }
            }
            ProbeOutcome::Confirmed => {
                if new >= STOP_THRESHOLD && hypothesis.status != HypothesisStatus::Falsified {
                    hypothesis.status = HypothesisStatus::Confirmed;
                }
            }
            ProbeOutcome::Inconclusive => {
                if !hypothesis.status.is_terminal() && new < REVISION_THRESHOLD {
                    hypothesis.status = HypothesisStatus::NeedsRevision;
                }
            }
        }

        Ok(hypothesis.clone())
    }

    /// Merge fresh endpoint observations into an existing schema hypothesis.
    /// Used by the analyst when `(kind, pattern, method)` already exists.
    pub fn merge_endpoint(
        &self,
        id: &HypothesisId,
        evidence: Vec<EvidenceRef>,
        request_schema: Option<serde_json::Value>,
        response_schema: Option<serde_json::Value>,
        agent: &str,
    ) -> Result<Hypothesis> {
        let mut map = self.lock()?;
        let hypothesis = get_mut(&mut map, id)?;

        let reason = format!("Merged {} observations", evidence.len());
        if already_applied(hypothesis, ConfidenceEventKind::Merged, &reason, agent) {
            return Ok(hypothesis.clone());
        }

        for item in evidence {
            if !hypothesis
                .supporting_evidence
                .iter()
                .any(|e| e.observation_id == item.observation_id)
            {
                hypothesis.supporting_evidence.push(item);
            }
        }

        if let Some(incoming) = response_schema {
            hypothesis.response_schema = Some(match &hypothesis.response_schema {
                Some(existing) => merge_schemas(existing, &incoming),
                None => incoming,
            });
        }
        if let Some(incoming) = request_schema {
            hypothesis.request_schema = Some(match &hypothesis.request_schema {
                Some(existing) => merge_schemas(existing, &incoming),
                None => incoming,
            });
        }

        let old = hypothesis.confidence;
        let recomputed = ConfidenceCalculator::initial_confidence(
            hypothesis.supporting_evidence.len(),
            hypothesis.competing_explanations.len(),
            hypothesis.untested_assumptions.len(),
        );
        let new = old.max(recomputed);

        apply_event(hypothesis, ConfidenceEventKind::Merged, new, reason, agent);
        Ok(hypothesis.clone())
    }

    /// Update status directly, enforcing the terminal-status invariant.
    pub fn update_status(
        &self,
        id: &HypothesisId,
        status: HypothesisStatus,
        agent: &str,
    ) -> Result<Hypothesis> {
        let mut map = self.lock()?;
        let hypothesis = get_mut(&mut map, id)?;

        if hypothesis.status.is_terminal()
            && status != HypothesisStatus::NeedsRevision
            && status != hypothesis.status
        {
            return Err(Error::invariant(format!(
                "hypothesis {} is {} and may only move to needs_revision",
                id, hypothesis.status
            )));
        }

        hypothesis.status = status;
        hypothesis.updated_at = Utc::now();
        hypothesis.last_modified_by = agent.to_string();
        hypothesis.revision += 1;
        Ok(hypothesis.clone())
    }

    /// Get a hypothesis by id.
    pub fn get(&self, id: &HypothesisId) -> Result<Option<Hypothesis>> {
        Ok(self.lock()?.get(id).cloned())
    }

    /// All hypotheses.
    pub fn list(&self) -> Result<Vec<Hypothesis>> {
        let mut all: Vec<Hypothesis> = self.lock()?.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    /// Hypotheses matching a filter.
    pub fn filter(&self, filter: &HypothesisFilter) -> Result<Vec<Hypothesis>> {
        let mut matched: Vec<Hypothesis> = self
            .lock()?
            .values()
            .filter(|h| filter.matches(h))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matched)
    }

    /// Find an endpoint-schema hypothesis by its dedup key.
    pub fn find_endpoint(&self, pattern: &str, method: &str) -> Result<Option<Hypothesis>> {
        self.find_by_kind_endpoint(HypothesisKind::EndpointSchema, pattern, method)
    }

    /// Find a hypothesis of any kind by its `(kind, pattern, method)` key.
    pub fn find_by_kind_endpoint(
        &self,
        kind: HypothesisKind,
        pattern: &str,
        method: &str,
    ) -> Result<Option<Hypothesis>> {
        let key = (pattern.to_string(), method.to_uppercase());
        Ok(self
            .lock()?
            .values()
            .find(|h| h.kind == kind && h.endpoint_key().as_ref() == Some(&key))
            .cloned())
    }

    /// Pairs of hypotheses whose (pattern, method) match but whose schemas
    /// or permission requirements disagree.
    pub fn find_contradictions(&self) -> Result<Vec<Contradiction>> {
        let all = self.list()?;
        let mut contradictions = Vec::new();

        for (i, first) in all.iter().enumerate() {
            for second in all.iter().skip(i + 1) {
                let (Some(key1), Some(key2)) = (first.endpoint_key(), second.endpoint_key())
                else {
                    continue;
                };
                if key1 != key2 {
                    continue;
                }

                if first.kind == HypothesisKind::EndpointSchema
                    && second.kind == HypothesisKind::EndpointSchema
                    && first.response_schema != second.response_schema
                {
                    contradictions.push(Contradiction {
                        first: first.id.clone(),
                        second: second.id.clone(),
                        description: format!("Conflicting schemas for {} {}", key1.1, key1.0),
                    });
                }

                if first.kind == HypothesisKind::PermissionGate
                    && second.kind == HypothesisKind::PermissionGate
                {
                    let requirement = |h: &Hypothesis| {
                        h.trigger_conditions
                            .as_ref()
                            .and_then(|t| t.get("requirement"))
                            .and_then(|v| v.as_str())
                            .map(String::from)
                    };
                    if requirement(first) != requirement(second) {
                        contradictions.push(Contradiction {
                            first: first.id.clone(),
                            second: second.id.clone(),
                            description: format!(
                                "Conflicting permission requirements for {} {}",
                                key1.1, key1.0
                            ),
                        });
                    }
                }
            }
        }

        Ok(contradictions)
    }

    /// Confidence breakdown across all hypotheses.
    pub fn confidence_summary(&self) -> Result<ConfidenceSummary> {
        let map = self.lock()?;
        if map.is_empty() {
            return Ok(ConfidenceSummary::default());
        }

        let mut summary = ConfidenceSummary {
            total: map.len(),
            ..Default::default()
        };
        let mut confidence_sum = 0.0;

        for hypothesis in map.values() {
            confidence_sum += hypothesis.confidence;
            if hypothesis.confidence >= 0.7 {
                summary.high_confidence += 1;
            }
            if hypothesis.confidence < 0.5 {
                summary.low_confidence += 1;
            }
            if hypothesis.status == HypothesisStatus::Confirmed {
                summary.confirmed += 1;
            }
            if hypothesis.status == HypothesisStatus::NeedsRevision {
                summary.needs_revision += 1;
            }
            *summary.by_kind.entry(hypothesis.kind).or_insert(0) += 1;
        }

        summary.mean_confidence = confidence_sum / map.len() as f64;
        Ok(summary)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<HypothesisId, Hypothesis>>> {
        self.inner
            .lock()
            .map_err(|e| Error::Internal(format!("hypothesis store lock poisoned: {}", e)))
    }
}

fn get_mut<'a>(
    map: &'a mut HashMap<HypothesisId, Hypothesis>,
    id: &HypothesisId,
) -> Result<&'a mut Hypothesis> {
    map.get_mut(id)
        .ok_or_else(|| Error::NotFound(format!("hypothesis {}", id)))
}

/// True when the most recent event carries the same idempotence key.
fn already_applied(
    hypothesis: &Hypothesis,
    kind: ConfidenceEventKind,
    reason: &str,
    agent: &str,
) -> bool {
    hypothesis
        .confidence_history
        .last()
        .map(|last| last.dedup_key() == (kind, reason, agent))
        .unwrap_or(false)
}

/// Append one confidence event and bump bookkeeping (invariant I1).
fn apply_event(
    hypothesis: &mut Hypothesis,
    kind: ConfidenceEventKind,
    new_confidence: f64,
    reason: String,
    agent: &str,
) {
    let old = hypothesis.confidence;
    hypothesis.confidence = new_confidence;
    hypothesis
        .confidence_history
        .push(ConfidenceEvent::new(kind, old, new_confidence, reason, agent));
    hypothesis.updated_at = Utc::now();
    hypothesis.last_modified_by = agent.to_string();
    hypothesis.revision += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypothesis::types::{EvidenceStrength, ProbeKind, ProbeRequest, RuleKind};
    use serde_json::json;
    use uuid::Uuid;

    fn evidence(id: &str) -> EvidenceRef {
        EvidenceRef::new(id, format!("observation {}", id), EvidenceStrength::Strong)
    }

    fn schema_hypothesis(store: &HypothesisStore) -> Hypothesis {
        store
            .create(
                NewHypothesis::new(
                    HypothesisKind::EndpointSchema,
                    "GET /api/users/{id} returns user data",
                    "analyst",
                )
                .with_endpoint("/api/users/{id}", "GET")
                .with_evidence(vec![evidence("obs-1")]),
            )
            .unwrap()
    }

    fn probe_result(
        hypothesis_id: HypothesisId,
        outcome: ProbeOutcome,
        notes: &str,
    ) -> ProbeResult {
        ProbeResult {
            id: Uuid::new_v4(),
            hypothesis_id,
            probe_kind: ProbeKind::ReplayExact,
            request: json!({"method": "GET", "url": "https://h/api/users/1"}),
            response_status: 200,
            response_body: None,
            outcome,
            confidence_delta: 0.15,
            notes: notes.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_create_single_observation() {
        let store = HypothesisStore::new();
        let hypothesis = schema_hypothesis(&store);

        assert!((hypothesis.confidence - 0.2).abs() < 1e-9);
        assert_eq!(hypothesis.status, HypothesisStatus::Active);
        assert_eq!(hypothesis.confidence_history.len(), 1);
        assert_eq!(hypothesis.revision, 1);
        assert_eq!(hypothesis.method.as_deref(), Some("GET"));
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let store = HypothesisStore::new();
        schema_hypothesis(&store);

        let duplicate = store.create(
            NewHypothesis::new(HypothesisKind::EndpointSchema, "same endpoint", "analyst")
                .with_endpoint("/api/users/{id}", "get"),
        );
        assert!(matches!(duplicate, Err(Error::Conflict(_))));
    }

    #[test]
    fn test_add_evidence_raises_confidence() {
        let store = HypothesisStore::new();
        let hypothesis = schema_hypothesis(&store);

        let updated = store
            .add_evidence(&hypothesis.id, evidence("obs-2"), "analyst")
            .unwrap();
        assert!((updated.confidence - 0.35).abs() < 1e-9);
        assert_eq!(updated.confidence_history.len(), 2);
        assert_eq!(updated.revision, 2);
    }

    #[test]
    fn test_evidence_never_decreases_confidence() {
        let store = HypothesisStore::new();
        let hypothesis = store
            .create(
                NewHypothesis::new(HypothesisKind::PermissionGate, "auth required", "business_logic")
                    .with_confidence(0.7)
                    .with_evidence(vec![evidence("obs-1")]),
            )
            .unwrap();

        // Recomputed rule would say 0.35 for two observations; keep 0.7
        let updated = store
            .add_evidence(&hypothesis.id, evidence("obs-2"), "business_logic")
            .unwrap();
        assert!((updated.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_history_chains_correctly() {
        let store = HypothesisStore::new();
        let hypothesis = schema_hypothesis(&store);
        store
            .add_evidence(&hypothesis.id, evidence("obs-2"), "analyst")
            .unwrap();
        let updated = store
            .apply_probe(
                &hypothesis.id,
                &probe_result(hypothesis.id.clone(), ProbeOutcome::Confirmed, "replay ok"),
            )
            .unwrap();

        // P1: each event's old confidence equals the previous event's new
        let history = &updated.confidence_history;
        for window in history.windows(2) {
            assert_eq!(window[1].old_confidence, window[0].new_confidence);
        }
        for (k, event) in history.iter().enumerate() {
            assert_eq!(updated.confidence_at(k), Some(event.new_confidence));
        }
        assert_eq!(updated.confidence, history.last().unwrap().new_confidence);
    }

    #[test]
    fn test_critic_challenge_scenario() {
        let store = HypothesisStore::new();
        let hypothesis = schema_hypothesis(&store);
        store
            .add_evidence(&hypothesis.id, evidence("obs-2"), "analyst")
            .unwrap();

        let review = CriticReview {
            hypothesis_id: hypothesis.id.clone(),
            verdict: CriticVerdict::Challenge,
            alternative_explanations: vec!["response may vary by role".into()],
            untested_assumptions: vec!["single auth level sampled".into()],
            missing_evidence: vec![],
            contradictions: vec![],
            original_confidence: 0.35,
            recommended_confidence: 0.28,
            adjustment_reason: "limited evidence".into(),
            required_probes: vec![ProbeRequest::new(
                ProbeKind::ReplayExact,
                hypothesis.id.clone(),
                "replay",
                "2xx",
            )],
            required_exploration: vec![],
        };

        let updated = store.apply_critic(&hypothesis.id, &review).unwrap();
        assert!((updated.confidence - 0.28).abs() < 1e-9);
        assert_eq!(updated.status, HypothesisStatus::Challenged);
        assert_eq!(updated.competing_explanations.len(), 1);

        // Probe chain from the same scenario
        let updated = store
            .apply_probe(
                &hypothesis.id,
                &probe_result(hypothesis.id.clone(), ProbeOutcome::Confirmed, "replay ok"),
            )
            .unwrap();
        assert!((updated.confidence - 0.424).abs() < 1e-9);

        let updated = store
            .apply_probe(
                &hypothesis.id,
                &probe_result(hypothesis.id.clone(), ProbeOutcome::Confirmed, "auth required"),
            )
            .unwrap();
        assert!((updated.confidence - 0.5392).abs() < 1e-9);
    }

    #[test]
    fn test_critic_idempotent() {
        let store = HypothesisStore::new();
        let hypothesis = schema_hypothesis(&store);

        let review = CriticReview {
            hypothesis_id: hypothesis.id.clone(),
            verdict: CriticVerdict::Challenge,
            alternative_explanations: vec![],
            untested_assumptions: vec![],
            missing_evidence: vec![],
            contradictions: vec![],
            original_confidence: 0.2,
            recommended_confidence: 0.15,
            adjustment_reason: "single observation".into(),
            required_probes: vec![],
            required_exploration: vec![],
        };

        let first = store.apply_critic(&hypothesis.id, &review).unwrap();
        let second = store.apply_critic(&hypothesis.id, &review).unwrap();

        assert_eq!(first.confidence, second.confidence);
        assert_eq!(
            first.confidence_history.len(),
            second.confidence_history.len()
        );
        assert_eq!(first.revision, second.revision);
    }

    #[test]
    fn test_probe_falsification_path() {
        let store = HypothesisStore::new();
        let hypothesis = store
            .create(
                NewHypothesis::new(
                    HypothesisKind::StateTransition,
                    "checkout requires cart",
                    "business_logic",
                )
                .with_confidence(0.3)
                .with_evidence(vec![evidence("obs-1")]),
            )
            .unwrap();

        let result = ProbeResult {
            probe_kind: ProbeKind::SequenceBreak,
            outcome: ProbeOutcome::Falsified,
            notes: "sequence not enforced".into(),
            ..probe_result(hypothesis.id.clone(), ProbeOutcome::Falsified, "")
        };
        let updated = store.apply_probe(&hypothesis.id, &result).unwrap();

        assert!((updated.confidence - 0.15).abs() < 1e-9);
        assert_eq!(updated.status, HypothesisStatus::Falsified);
        assert_eq!(updated.contradicting_evidence.len(), 1);
        assert!(!updated.is_exportable(0.7));
    }

    #[test]
    fn test_confirmed_never_regresses_to_active() {
        let store = HypothesisStore::new();
        let hypothesis = store
            .create(
                NewHypothesis::new(HypothesisKind::PermissionGate, "auth", "business_logic")
                    .with_confidence(0.82),
            )
            .unwrap();

        let updated = store
            .apply_probe(
                &hypothesis.id,
                &probe_result(hypothesis.id.clone(), ProbeOutcome::Confirmed, "401 without auth"),
            )
            .unwrap();
        assert_eq!(updated.status, HypothesisStatus::Confirmed);

        let back_to_active =
            store.update_status(&hypothesis.id, HypothesisStatus::Active, "test");
        assert!(matches!(back_to_active, Err(Error::Invariant(_))));

        // Contradiction may still demote to needs_revision
        let revised = store
            .update_status(&hypothesis.id, HypothesisStatus::NeedsRevision, "test")
            .unwrap();
        assert_eq!(revised.status, HypothesisStatus::NeedsRevision);
    }

    #[test]
    fn test_merge_endpoint_unions_schema() {
        let store = HypothesisStore::new();
        let hypothesis = store
            .create(
                NewHypothesis::new(HypothesisKind::EndpointSchema, "users", "analyst")
                    .with_endpoint("/api/users/{id}", "GET")
                    .with_evidence(vec![evidence("obs-1")])
                    .with_schemas(
                        None,
                        Some(crate::schema::infer_schema(&json!({"id": 42, "name": "A"}))),
                    ),
            )
            .unwrap();

        let updated = store
            .merge_endpoint(
                &hypothesis.id,
                vec![evidence("obs-2")],
                None,
                Some(crate::schema::infer_schema(
                    &json!({"id": 43, "name": "B", "email": "b@x.io"}),
                )),
                "analyst",
            )
            .unwrap();

        assert!((updated.confidence - 0.35).abs() < 1e-9);
        let schema = updated.response_schema.unwrap();
        let props = schema["properties"].as_object().unwrap();
        assert_eq!(props.len(), 3);
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(required, vec!["id", "name"]);
    }

    #[test]
    fn test_filter_queries() {
        let store = HypothesisStore::new();
        schema_hypothesis(&store);
        store
            .create(
                NewHypothesis::new(HypothesisKind::PermissionGate, "auth", "business_logic")
                    .with_confidence(0.7),
            )
            .unwrap();

        let gates = store
            .filter(&HypothesisFilter::new().kind(HypothesisKind::PermissionGate))
            .unwrap();
        assert_eq!(gates.len(), 1);

        let confident = store
            .filter(&HypothesisFilter::new().min_confidence(0.5))
            .unwrap();
        assert_eq!(confident.len(), 1);

        let active = store
            .filter(&HypothesisFilter::new().status(HypothesisStatus::Active))
            .unwrap();
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn test_find_contradictions_permission_mismatch() {
        let store = HypothesisStore::new();
        store
            .create(
                NewHypothesis::new(HypothesisKind::PermissionGate, "auth", "business_logic")
                    .with_endpoint("/api/orders", "POST")
                    .with_rule(
                        RuleKind::PermissionGate,
                        json!({"requirement": "authentication"}),
                    ),
            )
            .unwrap();
        store
            .create(
                NewHypothesis::new(HypothesisKind::PermissionGate, "role", "business_logic")
                    .with_endpoint("/api/orders", "POST")
                    .with_rule(
                        RuleKind::PermissionGate,
                        json!({"requirement": "elevated_role"}),
                    ),
            )
            .unwrap();

        let contradictions = store.find_contradictions().unwrap();
        assert_eq!(contradictions.len(), 1);
        assert!(contradictions[0].description.contains("permission"));
    }

    #[test]
    fn test_confidence_summary() {
        let store = HypothesisStore::new();
        schema_hypothesis(&store);
        store
            .create(
                NewHypothesis::new(HypothesisKind::RateLimit, "throttled", "business_logic")
                    .with_confidence(0.8),
            )
            .unwrap();

        let summary = store.confidence_summary().unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.high_confidence, 1);
        assert_eq!(summary.low_confidence, 1);
        assert!((summary.mean_confidence - 0.5).abs() < 1e-9);
        assert_eq!(summary.by_kind[&HypothesisKind::RateLimit], 1);
    }
}
