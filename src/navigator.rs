//! UI exploration.
//!
//! The navigator drives the page to maximize state coverage and trigger API
//! traffic: it refreshes the element overlay, fills unseen forms with
//! synthetic data, and clicks a prioritized handful of interactive elements,
//! recording page states and transitions as it goes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser::{
    format_tree, ActionKind, ActionRecord, BrowserDriver, ClickTarget, FormField, OverlayElement,
    ScrollDirection,
};
use crate::cancel::CancellationSignal;
use crate::error::{Error, Result};
use crate::fsm::FsmStore;
use crate::guardrails::{url_host, Guardrails, RateLimiter};
use crate::interceptor::Interceptor;
use crate::statehash::{hash_page, StateHash};
use crate::vector::{find_semantic_match, VectorStore};

/// Vector-store collection holding page-state documents.
const STATE_COLLECTION: &str = "page_states";

/// Overlay refresh budget before falling back to a direct DOM query.
const OVERLAY_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Settle time after each click before re-hashing the page.
const POST_CLICK_WAIT: Duration = Duration::from_secs(1);

/// Interactive elements clicked per explore step.
const MAX_CLICKS_PER_STEP: usize = 5;

/// Consecutive clicks without a new observation before exploration is
/// considered exhausted.
const NO_OBSERVATION_LIMIT: u32 = 15;

/// Accessible-text tokens that mark an element as a logout control.
const LOGOUT_TOKENS: &[&str] = &["logout", "log out", "sign out", "signout", "sign-out"];

/// Outcome of one explore step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExploreOutcome {
    pub actions_executed: usize,
    pub new_observations: usize,
    pub new_states: usize,
    /// True once fifteen consecutive clicks produced no observation
    pub exhausted: bool,
}

/// Synthetic form values chosen by field name/type.
pub fn synthetic_value(field: &FormField, counter: u32) -> String {
    let name = field.name.to_lowercase();
    let input_type = field.input_type.to_lowercase();

    if input_type == "email" || name.contains("email") {
        format!("test{}@example.com", counter)
    } else if input_type == "password" || name.contains("password") {
        "TestPassword123!".to_string()
    } else if input_type == "tel" || name.contains("phone") {
        format!("+1555{:07}", counter)
    } else if input_type == "search" || name.contains("search") {
        "test search query".to_string()
    } else if input_type == "number" || name.contains("amount") || name.contains("qty") {
        "42".to_string()
    } else {
        format!("test_value_{}", counter)
    }
}

/// Stable transition target for an element: survives overlay re-numbering.
pub fn element_target(element: &OverlayElement) -> String {
    let label = element
        .href
        .as_deref()
        .filter(|href| !href.is_empty())
        .unwrap_or(&element.text);
    let label: String = label.chars().take(80).collect();
    format!("{}:{}", element.tag, label)
}

/// Whether an element must be skipped: logout controls and off-origin links.
pub fn should_skip_element(element: &OverlayElement, current_host: Option<&str>) -> bool {
    let text = element.text.to_lowercase();
    if LOGOUT_TOKENS.iter().any(|token| text.contains(token)) {
        return true;
    }

    if let Some(href) = &element.href {
        if href.starts_with("http") {
            match (url_host(href), current_host) {
                (Some(link_host), Some(page_host)) if link_host != page_host => return true,
                (None, _) => return true,
                _ => {}
            }
        }
    }

    false
}

/// Order candidate elements: unseen targets first, then anchors/buttons
/// before generic elements, then same-origin anchors.
pub fn prioritize_elements(
    elements: &[OverlayElement],
    current_host: Option<&str>,
    explored_targets: &HashSet<String>,
) -> Vec<OverlayElement> {
    let mut scored: Vec<(i32, &OverlayElement)> = elements
        .iter()
        .filter(|element| !should_skip_element(element, current_host))
        .map(|element| {
            let mut score = 0;
            if !explored_targets.contains(&element_target(element)) {
                score += 100;
            }
            match element.tag.as_str() {
                "a" | "button" => score += 10,
                "input" | "select" => score += 5,
                _ => {}
            }
            if element.tag == "a" {
                let same_origin = element
                    .href
                    .as_deref()
                    .map(|href| {
                        !href.starts_with("http")
                            || url_host(href) == current_host
                    })
                    .unwrap_or(false);
                if same_origin {
                    score += 3;
                }
            }
            (score, element)
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
    scored
        .into_iter()
        .take(MAX_CLICKS_PER_STEP)
        .map(|(_, element)| element.clone())
        .collect()
}

/// Drives exploration of the target UI for one session.
pub struct Navigator {
    session_id: String,
    driver: Arc<dyn BrowserDriver>,
    interceptor: Arc<Interceptor>,
    fsm: Arc<FsmStore>,
    guardrails: Arc<Guardrails>,
    rate_limiter: Arc<RateLimiter>,
    vector: Option<Arc<dyn VectorStore>>,
    semantic_threshold: f64,
    hamming_threshold: u32,
    seen_forms: HashSet<String>,
    synth_counter: u32,
    no_observation_streak: u32,
}

impl Navigator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        driver: Arc<dyn BrowserDriver>,
        interceptor: Arc<Interceptor>,
        fsm: Arc<FsmStore>,
        guardrails: Arc<Guardrails>,
        rate_limiter: Arc<RateLimiter>,
        hamming_threshold: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            driver,
            interceptor,
            fsm,
            guardrails,
            rate_limiter,
            vector: None,
            semantic_threshold: crate::vector::DEFAULT_SIMILARITY_THRESHOLD,
            hamming_threshold,
            seen_forms: HashSet::new(),
            synth_counter: 0,
            no_observation_streak: 0,
        }
    }

    /// Attach a vector store for the secondary semantic state-dedup check.
    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>, threshold: f64) -> Self {
        self.vector = Some(store);
        self.semantic_threshold = threshold;
        self
    }

    /// Run one explore step against the current page.
    pub async fn explore_step(&mut self, cancel: &CancellationSignal) -> Result<ExploreOutcome> {
        let mut outcome = ExploreOutcome::default();

        let current_url = self.driver.current_url().await?;
        let title = self.driver.title().await.unwrap_or_default();
        let current_hash = self.hash_current_page(&current_url).await?;

        if self
            .fsm
            .add_state(current_hash, &self.session_id, &current_url, &title, None)?
        {
            outcome.new_states += 1;
        }

        // Element overlay, with a bounded refresh and a direct-DOM fallback
        let elements = match cancel
            .bounded(OVERLAY_REFRESH_TIMEOUT, self.driver.overlay_elements())
            .await
        {
            Some(Ok(elements)) => elements,
            Some(Err(error)) => {
                warn!(%error, "overlay refresh failed, falling back to direct query");
                self.driver.query_clickables().await.unwrap_or_default()
            }
            None => {
                if cancel.is_cancelled() {
                    return Ok(outcome);
                }
                warn!("overlay refresh timed out, falling back to direct query");
                self.driver.query_clickables().await.unwrap_or_default()
            }
        };

        // Unseen forms first: synthetic fill plus submit
        let forms = self.driver.forms().await.unwrap_or_default();
        for form in &forms {
            let signature = format!("{}#{}:{}", current_url, form.index, form.action);
            if self.seen_forms.contains(&signature) {
                continue;
            }
            self.seen_forms.insert(signature);

            if cancel.is_cancelled() {
                return Ok(outcome);
            }
            match self.fill_and_submit_form(&current_url, form).await {
                Ok(observations) => {
                    outcome.actions_executed += 1;
                    outcome.new_observations += observations;
                    self.update_streak(observations);
                }
                Err(Error::Guardrail(reason)) => {
                    debug!(%reason, "form submit skipped by guardrail");
                }
                Err(error) => {
                    warn!(%error, "form submit failed");
                }
            }
        }

        // A page with nothing to act on is a dead end
        if elements.is_empty() && forms.is_empty() {
            self.fsm.mark_dead_end(current_hash)?;
        }

        // Prioritized clicks
        let current_host = url_host(&current_url).map(String::from);
        let candidates: Vec<(ActionKind, String)> = elements
            .iter()
            .map(|element| (ActionKind::Click, element_target(element)))
            .collect();
        let unexplored: HashSet<String> = self
            .fsm
            .unexplored_actions(current_hash, &candidates)?
            .into_iter()
            .map(|(_, target)| target)
            .collect();
        let explored: HashSet<String> = candidates
            .iter()
            .map(|(_, target)| target.clone())
            .filter(|target| !unexplored.contains(target))
            .collect();

        let selected = prioritize_elements(&elements, current_host.as_deref(), &explored);
        let mut from_hash = current_hash;

        for element in selected {
            if cancel.is_cancelled() || outcome.exhausted {
                break;
            }

            let target = element_target(&element);
            if let Err(Error::Guardrail(reason)) =
                self.guardrails
                    .validate_action(ActionKind::Click, &target, &current_url)
            {
                debug!(%reason, "click skipped by guardrail");
                continue;
            }

            match self.click_element(&element, from_hash, cancel).await {
                Ok(step) => {
                    outcome.actions_executed += 1;
                    outcome.new_observations += step.observations;
                    outcome.new_states += step.new_states;
                    self.update_streak(step.observations);
                    if let Some(next) = step.landed_on {
                        from_hash = next;
                    }
                }
                Err(error) => {
                    warn!(%error, "click failed");
                }
            }

            if self.no_observation_streak >= NO_OBSERVATION_LIMIT {
                outcome.exhausted = true;
            }
        }

        outcome.exhausted = outcome.exhausted || self.no_observation_streak >= NO_OBSERVATION_LIMIT;
        info!(
            actions = outcome.actions_executed,
            observations = outcome.new_observations,
            states = outcome.new_states,
            "explore step complete"
        );
        Ok(outcome)
    }

    /// Streak of clicks without new observations, for the exploration
    /// termination condition.
    pub fn no_observation_streak(&self) -> u32 {
        self.no_observation_streak
    }

    /// URL of the page currently loaded in the driver.
    pub async fn current_url(&self) -> Result<String> {
        self.driver.current_url().await
    }

    async fn hash_current_page(&self, url: &str) -> Result<StateHash> {
        let tree = self.driver.accessibility_snapshot().await?;
        let hash = match &tree {
            Some(tree) => hash_page(tree),
            None => {
                // No tree available: fall back to hashing the URL path
                crate::statehash::simhash(&[format!("url:{}", crate::cluster::url_path(url))])
            }
        };

        // Collapse to an already-recorded state within the Hamming threshold
        if let Some(existing) =
            self.fsm
                .find_similar_state(&self.session_id, hash, self.hamming_threshold)?
        {
            return Ok(existing);
        }

        // Secondary semantic check; a missing vector store degrades to none
        if let (Some(store), Some(tree)) = (&self.vector, &tree) {
            let document = format_tree(tree, false);
            match find_semantic_match(
                Some(store.as_ref()),
                STATE_COLLECTION,
                &document,
                self.semantic_threshold,
            )
            .await
            {
                Ok(Some(hit)) => {
                    if let Some(existing) = StateHash::parse(&hit.id) {
                        return Ok(existing);
                    }
                }
                Ok(None) => {
                    let _ = store
                        .add(
                            STATE_COLLECTION,
                            &hash.to_string(),
                            &document,
                            std::collections::HashMap::from([(
                                "url".to_string(),
                                serde_json::json!(url),
                            )]),
                        )
                        .await;
                }
                Err(error) => warn!(%error, "semantic state lookup failed"),
            }
        }

        Ok(hash)
    }

    async fn fill_and_submit_form(
        &mut self,
        current_url: &str,
        form: &crate::browser::FormInfo,
    ) -> Result<usize> {
        for field in &form.fields {
            if field.selector.is_empty() {
                continue;
            }
            self.guardrails
                .validate_action(ActionKind::Type, &field.selector, current_url)?;

            self.synth_counter += 1;
            let value = synthetic_value(field, self.synth_counter);
            self.driver.type_text(&field.selector, &value).await?;
        }

        let action = ActionRecord::new(ActionKind::Click, format!("form#{}", form.index))
            .with_payload(form.action.clone());
        self.interceptor.begin_interaction(Some(action), current_url);

        let before = self.interceptor.buffer().len();
        self.rate_limiter.acquire().await?;
        self.driver
            .page_eval(&format!(
                "document.forms[{}] && document.forms[{}].requestSubmit()",
                form.index, form.index
            ))
            .await?;
        tokio::time::sleep(POST_CLICK_WAIT).await;

        Ok(self.interceptor.buffer().len().saturating_sub(before))
    }

    async fn click_element(
        &mut self,
        element: &OverlayElement,
        from_hash: StateHash,
        cancel: &CancellationSignal,
    ) -> Result<ClickStep> {
        let target = element_target(element);
        let page_url = self.driver.current_url().await?;

        let action = ActionRecord::new(ActionKind::Click, target.clone());
        let interaction_id = self.interceptor.begin_interaction(Some(action), &page_url);

        let before = self.interceptor.buffer().len();
        self.rate_limiter.acquire().await?;
        let clicked = match self.driver.click(&ClickTarget::Element(element.id)).await {
            Err(error) => {
                // Stale overlays resolve after a scroll more often than not
                warn!(%error, "click failed, scrolling and retrying");
                let _ = self.driver.scroll(ScrollDirection::Down).await;
                self.driver.click(&ClickTarget::Element(element.id)).await
            }
            ok => ok,
        };

        if cancel.sleep(POST_CLICK_WAIT).await {
            return Ok(ClickStep::default());
        }

        let observations = self.interceptor.buffer().len().saturating_sub(before);
        let observation_ids = self.interceptor.buffer().ids_for_interaction(interaction_id);

        let mut step = ClickStep {
            observations,
            ..Default::default()
        };

        // Re-hash; a changed page means a state transition happened
        let new_url = self.driver.current_url().await?;
        let new_hash = self.hash_current_page(&new_url).await?;
        if new_hash != from_hash {
            let title = self.driver.title().await.unwrap_or_default();
            if self
                .fsm
                .add_state(new_hash, &self.session_id, &new_url, &title, None)?
            {
                step.new_states += 1;
            }
            self.fsm.add_transition(
                &self.session_id,
                from_hash,
                new_hash,
                ActionKind::Click,
                &target,
                None,
                &observation_ids,
                clicked.is_ok(),
            )?;
            step.landed_on = Some(new_hash);
        }

        clicked?;
        Ok(step)
    }

    fn update_streak(&mut self, observations: usize) {
        if observations == 0 {
            self.no_observation_streak += 1;
        } else {
            self.no_observation_streak = 0;
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ClickStep {
    observations: usize,
    new_states: usize,
    landed_on: Option<StateHash>,
}
