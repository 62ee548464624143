//! The scientific loop.
//!
//! A fixed phase cycle drives all learning: Explore discovers UI, Observe
//! quiesces captured traffic, Infer turns it into hypotheses, Critique
//! challenges them, Probe tests them, Update settles the books. The
//! supervisor owns the per-iteration context, enforces iteration and error
//! budgets, and decides termination.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::analyst::Analyst;
use crate::business_logic::BusinessLogic;
use crate::cancel::CancellationSignal;
use crate::critic::Critic;
use crate::error::{Error, ErrorCategory, Result};
use crate::events::SessionEvent;
use crate::fsm::FsmStore;
use crate::guardrails::Guardrails;
use crate::hypothesis::{CriticReview, Hypothesis, HypothesisStore, ProbeResult};
use crate::interceptor::{Interceptor, Observation};
use crate::navigator::Navigator;
use crate::verifier::Verifier;

/// Errors tolerated before the session terminates.
const ERROR_BUDGET: u32 = 10;

/// Confirmed hypotheses needed for the knowledge-based stop.
const CONFIRMED_STOP_COUNT: usize = 5;

/// Mean confidence needed for the knowledge-based stop.
const CONFIRMED_STOP_MEAN: f64 = 0.8;

/// Consecutive explore steps without a new observation before stopping.
const EXPLORE_EXHAUSTION_LIMIT: u32 = 15;

/// Phase of the scientific loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Explore,
    Observe,
    Infer,
    Critique,
    Probe,
    Update,
    Terminate,
}

impl Phase {
    /// Expected duration; a phase is abandoned at twice this.
    fn expected_duration(&self) -> Duration {
        match self {
            Phase::Init | Phase::Observe | Phase::Update => Duration::from_secs(10),
            Phase::Explore => Duration::from_secs(120),
            Phase::Infer | Phase::Critique => Duration::from_secs(120),
            Phase::Probe => Duration::from_secs(300),
            Phase::Terminate => Duration::from_secs(1),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Explore => write!(f, "explore"),
            Self::Observe => write!(f, "observe"),
            Self::Infer => write!(f, "infer"),
            Self::Critique => write!(f, "critique"),
            Self::Probe => write!(f, "probe"),
            Self::Update => write!(f, "update"),
            Self::Terminate => write!(f, "terminate"),
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    MaxIterations,
    TooManyErrors,
    ConfidentKnowledge,
    ExplorationExhausted,
    Cancelled,
    Failed(String),
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxIterations => write!(f, "maximum iterations reached"),
            Self::TooManyErrors => write!(f, "too many errors"),
            Self::ConfidentKnowledge => write!(f, "confident knowledge reached"),
            Self::ExplorationExhausted => write!(f, "exploration exhausted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Per-iteration shared context handed to each phase. The persistent stores
/// are never cleared; these buffers are.
#[derive(Debug, Default)]
pub struct LoopContext {
    pub current_url: String,
    pub new_observations: Vec<Observation>,
    pub pending_hypotheses: Vec<Hypothesis>,
    pub critic_reviews: Vec<CriticReview>,
    pub probe_results: Vec<ProbeResult>,
}

impl LoopContext {
    /// Clear the per-iteration buffers after the update phase.
    pub fn clear(&mut self) {
        self.new_observations.clear();
        self.pending_hypotheses.clear();
        self.critic_reviews.clear();
        self.probe_results.clear();
    }
}

/// Pure phase-transition function of the loop's fixed table.
pub fn next_phase(current: Phase, ctx: &LoopContext, terminate: bool) -> Phase {
    match current {
        Phase::Init => Phase::Explore,
        Phase::Explore => Phase::Observe,
        Phase::Observe => {
            if ctx.new_observations.is_empty() {
                Phase::Explore
            } else {
                Phase::Infer
            }
        }
        Phase::Infer => {
            if ctx.pending_hypotheses.is_empty() {
                Phase::Explore
            } else {
                Phase::Critique
            }
        }
        Phase::Critique => {
            if ctx
                .critic_reviews
                .iter()
                .any(|review| !review.required_probes.is_empty())
            {
                Phase::Probe
            } else {
                Phase::Update
            }
        }
        Phase::Probe => Phase::Update,
        Phase::Update => {
            if terminate {
                Phase::Terminate
            } else {
                Phase::Explore
            }
        }
        Phase::Terminate => Phase::Terminate,
    }
}

/// Live status snapshot exposed on the control surface.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionStatus {
    pub running: bool,
    pub iteration: u32,
    pub phase: Phase,
    pub current_url: String,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            running: false,
            iteration: 0,
            phase: Phase::Init,
            current_url: String::new(),
        }
    }
}

/// Scheme + host prefix of a URL, for probe targeting.
pub fn origin_of(url: &str) -> Option<String> {
    let scheme_end = url.find("://")?;
    let rest = &url[scheme_end + 3..];
    let host_end = rest.find('/').unwrap_or(rest.len());
    Some(format!("{}{}", &url[..scheme_end + 3], &rest[..host_end]))
}

/// Drives the six-phase loop for one session.
pub struct Supervisor {
    session_id: String,
    target_url: String,

    navigator: Navigator,
    analyst: Analyst,
    business_logic: BusinessLogic,
    critic: Critic,
    verifier: Arc<Verifier>,

    interceptor: Arc<Interceptor>,
    fsm: Arc<FsmStore>,
    hypotheses: Arc<HypothesisStore>,
    guardrails: Arc<Guardrails>,

    events: broadcast::Sender<SessionEvent>,
    status: Arc<Mutex<SessionStatus>>,
    cancel: CancellationSignal,

    ctx: LoopContext,
    phase: Phase,
    iteration: u32,
    consecutive_errors: u32,
    explore_exhaustion: u32,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        target_url: impl Into<String>,
        navigator: Navigator,
        analyst: Analyst,
        business_logic: BusinessLogic,
        critic: Critic,
        verifier: Arc<Verifier>,
        interceptor: Arc<Interceptor>,
        fsm: Arc<FsmStore>,
        hypotheses: Arc<HypothesisStore>,
        guardrails: Arc<Guardrails>,
        events: broadcast::Sender<SessionEvent>,
        status: Arc<Mutex<SessionStatus>>,
        cancel: CancellationSignal,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            target_url: target_url.into(),
            navigator,
            analyst,
            business_logic,
            critic,
            verifier,
            interceptor,
            fsm,
            hypotheses,
            guardrails,
            events,
            status,
            cancel,
            ctx: LoopContext::default(),
            phase: Phase::Init,
            iteration: 0,
            consecutive_errors: 0,
            explore_exhaustion: 0,
        }
    }

    /// Run the loop to termination.
    pub async fn run(&mut self) -> TerminationReason {
        info!(session = %self.session_id, target = %self.target_url, "scientific loop starting");
        self.ctx.current_url = self.target_url.clone();

        loop {
            if self.cancel.is_cancelled() {
                self.finish("completed").await;
                return TerminationReason::Cancelled;
            }

            // Budgets are checked every step, not only at update: a loop
            // stuck cycling explore/observe still has to stop
            if let Some(reason) = self.termination_reason() {
                info!(%reason, iterations = self.iteration, "scientific loop terminating");
                let status = if matches!(reason, TerminationReason::TooManyErrors) {
                    "failed"
                } else {
                    "completed"
                };
                self.finish(status).await;
                return reason;
            }

            let phase = self.phase;
            let budget = phase.expected_duration() * 2;

            let phase_result = tokio::time::timeout(budget, self.run_phase(phase)).await;
            let timed_out = phase_result.is_err();
            let step_error = match phase_result {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(_) => Some(Error::timeout(budget.as_millis() as u64)),
            };

            if let Some(error) = step_error {
                let category = error.category();
                let _ = self
                    .events
                    .send(SessionEvent::error(category, error.to_string()));

                if error.is_fatal() {
                    error!(%error, "invariant violation, session failed");
                    self.finish("failed").await;
                    return TerminationReason::Failed(error.to_string());
                }

                // Abandoned phases and store failures consume the error
                // budget; everything else recovers locally
                if error.counts_toward_budget() || timed_out {
                    self.consecutive_errors += 1;
                    warn!(%error, errors = self.consecutive_errors, "phase error");
                } else {
                    debug!(%error, "phase error recovered locally");
                }
            } else {
                self.consecutive_errors = 0;
            }

            // Advance: bump the loop counter, emit the phase change, move on
            self.iteration += 1;
            let terminate = self.termination_reason().is_some();
            let next = next_phase(self.phase, &self.ctx, terminate);
            let _ = self
                .events
                .send(SessionEvent::phase_changed(
                    &self.phase.to_string(),
                    &next.to_string(),
                    self.iteration,
                ));

            if self.phase == Phase::Update {
                self.ctx.clear();
            }
            self.phase = next;
            self.update_status();

            if self.phase == Phase::Terminate {
                let reason = self
                    .termination_reason()
                    .unwrap_or(TerminationReason::MaxIterations);
                info!(%reason, iterations = self.iteration, "scientific loop terminating");
                let status = if matches!(reason, TerminationReason::TooManyErrors) {
                    "failed"
                } else {
                    "completed"
                };
                self.finish(status).await;
                return reason;
            }
        }
    }

    fn termination_reason(&self) -> Option<TerminationReason> {
        if self.guardrails.validate_iteration(self.iteration).is_err() {
            return Some(TerminationReason::MaxIterations);
        }
        if self.consecutive_errors > ERROR_BUDGET {
            return Some(TerminationReason::TooManyErrors);
        }
        if self.explore_exhaustion >= EXPLORE_EXHAUSTION_LIMIT {
            return Some(TerminationReason::ExplorationExhausted);
        }
        if let Ok(summary) = self.hypotheses.confidence_summary() {
            if summary.confirmed > CONFIRMED_STOP_COUNT
                && summary.mean_confidence > CONFIRMED_STOP_MEAN
            {
                return Some(TerminationReason::ConfidentKnowledge);
            }
        }
        None
    }

    async fn run_phase(&mut self, phase: Phase) -> Result<()> {
        debug!(%phase, iteration = self.iteration, "running phase");
        match phase {
            Phase::Init => self.run_init().await,
            Phase::Explore => self.run_explore().await,
            Phase::Observe => self.run_observe().await,
            Phase::Infer => self.run_infer().await,
            Phase::Critique => self.run_critique().await,
            Phase::Probe => self.run_probe().await,
            Phase::Update => self.run_update().await,
            Phase::Terminate => Ok(()),
        }
    }

    async fn run_init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn run_explore(&mut self) -> Result<()> {
        let outcome = match self.navigator.explore_step(&self.cancel).await {
            Ok(outcome) => outcome,
            Err(error @ Error::Browser(_)) | Err(error @ Error::Timeout { .. }) => {
                // Transient browser trouble: swallowed, keep exploring
                warn!(%error, "explore step degraded");
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        if let Ok(url) = self.navigator.current_url().await {
            self.ctx.current_url = url;
        }

        if outcome.new_observations == 0 {
            self.explore_exhaustion += 1;
        } else {
            self.explore_exhaustion = 0;
        }
        Ok(())
    }

    async fn run_observe(&mut self) -> Result<()> {
        // Only quiesced captures: nothing newer than this phase boundary
        let boundary = Utc::now();
        let observations = self.interceptor.buffer().drain_before(boundary);

        for observation in &observations {
            self.fsm.insert_observation(observation)?;
            let _ = self.events.send(SessionEvent::observation_captured(
                &observation.method,
                &observation.url,
                observation.status,
            ));
        }

        // Harvested auth material keeps probes on the same footing as the UI
        let tokens = Interceptor::extract_auth_tokens(&observations);
        if !tokens.is_empty() {
            let mut headers = std::collections::HashMap::new();
            if let Some(bearer) = tokens.get("bearer") {
                headers.insert("Authorization".to_string(), format!("Bearer {}", bearer));
            }
            if let Some(api_key) = tokens.get("api_key") {
                headers.insert("X-Api-Key".to_string(), api_key.clone());
            }
            let cookies = tokens.get("session_cookie").map(|raw| {
                raw.split(';')
                    .filter_map(|pair| {
                        let (name, value) = pair.split_once('=')?;
                        Some((name.trim().to_string(), value.trim().to_string()))
                    })
                    .collect()
            });
            self.verifier.set_auth(Some(headers), cookies);
        }

        info!(count = observations.len(), "observations quiesced");
        self.ctx.new_observations = observations;
        Ok(())
    }

    async fn run_infer(&mut self) -> Result<()> {
        let mut pending = self.analyst.infer(&self.ctx.new_observations).await?;
        pending.extend(self.business_logic.infer(&self.ctx.new_observations).await?);

        for hypothesis in &pending {
            self.fsm.upsert_hypothesis(&self.session_id, hypothesis)?;
            if hypothesis.revision == 1 {
                let _ = self.events.send(SessionEvent::hypothesis_created(
                    &hypothesis.id.to_string(),
                    &hypothesis.kind.to_string(),
                    hypothesis.confidence,
                ));
            }
        }

        info!(pending = pending.len(), "inference complete");
        self.ctx.pending_hypotheses = pending;
        Ok(())
    }

    async fn run_critique(&mut self) -> Result<()> {
        let reviews = self.critic.review_all(&self.ctx.pending_hypotheses).await;

        for review in &reviews {
            let _ = self.events.send(SessionEvent::critic_review(
                &review.hypothesis_id.to_string(),
                &review.verdict.to_string(),
                review.recommended_confidence,
            ));

            let before = review.original_confidence;
            let updated = self.hypotheses.apply_critic(&review.hypothesis_id, review)?;
            self.fsm.upsert_hypothesis(&self.session_id, &updated)?;
            let _ = self.events.send(SessionEvent::confidence_changed(
                &updated.id.to_string(),
                before,
                updated.confidence,
                &review.adjustment_reason,
            ));
        }

        self.ctx.critic_reviews = reviews;
        Ok(())
    }

    async fn run_probe(&mut self) -> Result<()> {
        let origin = origin_of(&self.ctx.current_url)
            .or_else(|| origin_of(&self.target_url))
            .ok_or_else(|| Error::Internal("no probe origin available".to_string()))?;

        let results = self
            .verifier
            .execute_probes(&self.ctx.critic_reviews, &origin, &self.cancel)
            .await?;

        for result in &results {
            let _ = self.events.send(SessionEvent::probe_result(
                &result.hypothesis_id.to_string(),
                &result.probe_kind.to_string(),
                &result.outcome.to_string(),
            ));

            match self.hypotheses.apply_probe(&result.hypothesis_id, result) {
                Ok(updated) => {
                    self.fsm.upsert_hypothesis(&self.session_id, &updated)?;
                    self.fsm.insert_probe_result(&self.session_id, result)?;
                    let history = &updated.confidence_history;
                    if let Some(last) = history.last() {
                        let _ = self.events.send(SessionEvent::confidence_changed(
                            &updated.id.to_string(),
                            last.old_confidence,
                            last.new_confidence,
                            &last.reason,
                        ));
                    }
                }
                Err(Error::NotFound(_)) => {
                    debug!(hypothesis = %result.hypothesis_id, "probe result for vanished hypothesis");
                }
                Err(error) => return Err(error),
            }
        }

        self.ctx.probe_results = results;
        Ok(())
    }

    async fn run_update(&mut self) -> Result<()> {
        // Persist latest snapshots of everything touched this iteration;
        // the buffers themselves are cleared by the driver loop
        for hypothesis in self.hypotheses.list()? {
            self.fsm.upsert_hypothesis(&self.session_id, &hypothesis)?;
        }
        Ok(())
    }

    fn update_status(&self) {
        if let Ok(mut status) = self.status.lock() {
            status.running = self.phase != Phase::Terminate;
            status.iteration = self.iteration;
            status.phase = self.phase;
            status.current_url = self.ctx.current_url.clone();
        }
    }

    async fn finish(&mut self, session_status: &str) {
        if let Err(error) = self
            .fsm
            .update_session_status(&self.session_id, session_status)
        {
            warn!(%error, "failed to record session status");
        }
        if let Ok(mut status) = self.status.lock() {
            status.running = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> LoopContext {
        LoopContext::default()
    }

    fn observation() -> Observation {
        Observation {
            id: crate::interceptor::ObservationId::new(),
            session_id: "sess-1".into(),
            interaction_id: 1,
            timestamp: Utc::now(),
            method: "GET".into(),
            url: "https://h/api/users/1".into(),
            request_headers: Default::default(),
            request_body: None,
            status: 200,
            response_headers: Default::default(),
            response_body: None,
            page_url: "https://h/".into(),
            ui_action: None,
        }
    }

    #[test]
    fn test_fixed_transitions() {
        assert_eq!(next_phase(Phase::Init, &ctx(), false), Phase::Explore);
        assert_eq!(next_phase(Phase::Explore, &ctx(), false), Phase::Observe);
        assert_eq!(next_phase(Phase::Probe, &ctx(), false), Phase::Update);
    }

    #[test]
    fn test_observe_branches_on_observations() {
        let mut context = ctx();
        assert_eq!(next_phase(Phase::Observe, &context, false), Phase::Explore);

        context.new_observations.push(observation());
        assert_eq!(next_phase(Phase::Observe, &context, false), Phase::Infer);
    }

    #[test]
    fn test_infer_branches_on_pending() {
        let mut context = ctx();
        // Zero observations in Infer produces zero hypotheses: back to explore
        assert_eq!(next_phase(Phase::Infer, &context, false), Phase::Explore);

        let store = crate::hypothesis::HypothesisStore::new();
        let hypothesis = store
            .create(crate::hypothesis::NewHypothesis::new(
                crate::hypothesis::HypothesisKind::PermissionGate,
                "auth",
                "business_logic",
            ))
            .unwrap();
        context.pending_hypotheses.push(hypothesis);
        assert_eq!(next_phase(Phase::Infer, &context, false), Phase::Critique);
    }

    #[test]
    fn test_critique_branches_on_required_probes() {
        let store = crate::hypothesis::HypothesisStore::new();
        let hypothesis = store
            .create(crate::hypothesis::NewHypothesis::new(
                crate::hypothesis::HypothesisKind::PermissionGate,
                "auth",
                "business_logic",
            ))
            .unwrap();

        let mut context = ctx();
        context.critic_reviews.push(CriticReview {
            hypothesis_id: hypothesis.id.clone(),
            verdict: crate::hypothesis::CriticVerdict::Accept,
            alternative_explanations: vec![],
            untested_assumptions: vec![],
            missing_evidence: vec![],
            contradictions: vec![],
            original_confidence: 0.5,
            recommended_confidence: 0.5,
            adjustment_reason: "fine".into(),
            required_probes: vec![],
            required_exploration: vec![],
        });
        assert_eq!(next_phase(Phase::Critique, &context, false), Phase::Update);

        context.critic_reviews[0]
            .required_probes
            .push(crate::hypothesis::ProbeRequest::new(
                crate::hypothesis::ProbeKind::AuthVariation,
                hypothesis.id.clone(),
                "strip auth",
                "401",
            ));
        assert_eq!(next_phase(Phase::Critique, &context, false), Phase::Probe);
    }

    #[test]
    fn test_update_branches_on_termination() {
        assert_eq!(next_phase(Phase::Update, &ctx(), false), Phase::Explore);
        assert_eq!(next_phase(Phase::Update, &ctx(), true), Phase::Terminate);
    }

    #[test]
    fn test_loop_context_clear_keeps_url() {
        let mut context = ctx();
        context.current_url = "https://h/app".into();
        context.new_observations.push(observation());
        context.clear();

        assert!(context.new_observations.is_empty());
        assert_eq!(context.current_url, "https://h/app");
    }

    #[test]
    fn test_origin_of() {
        assert_eq!(
            origin_of("https://h.example/app/page?x=1").as_deref(),
            Some("https://h.example")
        );
        assert_eq!(
            origin_of("http://localhost:3000/x").as_deref(),
            Some("http://localhost:3000")
        );
        assert_eq!(origin_of("not-a-url"), None);
    }

    #[test]
    fn test_phase_display_round_trip() {
        for phase in [
            Phase::Init,
            Phase::Explore,
            Phase::Observe,
            Phase::Infer,
            Phase::Critique,
            Phase::Probe,
            Phase::Update,
            Phase::Terminate,
        ] {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json.trim_matches('"'), phase.to_string());
        }
    }
}
