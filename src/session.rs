//! Session control surface.
//!
//! A session owns one browser context, one observation stream, one
//! hypothesis store, and one loop task. Sessions share nothing except
//! process-wide configuration and the deployment's relational store. The
//! manager exposes the six control operations: create, start, stop, status,
//! export, and event streaming.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analyst::Analyst;
use crate::browser::BrowserDriver;
use crate::business_logic::BusinessLogic;
use crate::cancel::CancellationSignal;
use crate::config::Settings;
use crate::critic::Critic;
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::fsm::FsmStore;
use crate::guardrails::{Guardrails, RateLimiter};
use crate::hypothesis::HypothesisStore;
use crate::interceptor::Interceptor;
use crate::llm::client_from_settings;
use crate::navigator::Navigator;
use crate::openapi;
use crate::supervisor::{SessionStatus, Supervisor};
use crate::verifier::Verifier;

/// Capacity of the per-session event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Factory producing a browser driver for each session.
pub type DriverFactory = Box<dyn Fn() -> Arc<dyn BrowserDriver> + Send + Sync>;

struct SessionHandle {
    target_url: String,
    settings: Settings,
    driver: Arc<dyn BrowserDriver>,
    interceptor: Arc<Interceptor>,
    hypotheses: Arc<HypothesisStore>,
    verifier: Arc<Verifier>,
    guardrails: Arc<Guardrails>,
    rate_limiter: Arc<RateLimiter>,
    status: Arc<Mutex<SessionStatus>>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Creates and drives exploration sessions.
pub struct SessionManager {
    fsm: Arc<FsmStore>,
    driver_factory: DriverFactory,
    vector: Option<Arc<dyn crate::vector::VectorStore>>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionManager {
    /// Open the manager over the deployment's relational store.
    pub fn new(settings: &Settings, driver_factory: DriverFactory) -> Result<Self> {
        let fsm = Arc::new(FsmStore::open(&settings.database_path)?);
        Ok(Self {
            fsm,
            driver_factory,
            vector: None,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Manager over an in-memory store (for testing).
    pub fn in_memory(driver_factory: DriverFactory) -> Result<Self> {
        Ok(Self {
            fsm: Arc::new(FsmStore::in_memory()?),
            driver_factory,
            vector: None,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a vector store for semantic state dedup. Optional; absence
    /// degrades to structural comparison only.
    pub fn with_vector_store(mut self, store: Arc<dyn crate::vector::VectorStore>) -> Self {
        self.vector = Some(store);
        self
    }

    /// Create a session for a target URL. The target must clear the
    /// guardrails before anything is provisioned.
    pub fn create_session(&self, target_url: &str, settings: Settings) -> Result<SessionId> {
        let guardrails = Arc::new(Guardrails::new(&settings));
        guardrails.validate_target_url(target_url)?;

        let session_id = SessionId::new();
        self.fsm.create_session(
            &session_id.to_string(),
            target_url,
            &serde_json::to_value(&settings)?,
        )?;

        let interceptor = Arc::new(Interceptor::new(session_id.to_string()));
        let hypotheses = Arc::new(HypothesisStore::new());
        let rate_limiter = Arc::new(RateLimiter::new(settings.max_requests_per_minute));
        let verifier = Arc::new(Verifier::new(
            hypotheses.clone(),
            guardrails.clone(),
            rate_limiter.clone(),
            settings.max_probes_per_iteration,
            settings.enable_probing,
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let handle = Arc::new(SessionHandle {
            target_url: target_url.to_string(),
            settings,
            driver: (self.driver_factory)(),
            interceptor,
            hypotheses,
            verifier,
            guardrails,
            rate_limiter,
            status: Arc::new(Mutex::new(SessionStatus::default())),
            events,
            cancel: CancellationSignal::new(),
            task: Mutex::new(None),
        });

        self.lock_sessions()?
            .insert(session_id.clone(), handle);
        info!(session = %session_id, target = %target_url, "session created");
        Ok(session_id)
    }

    /// Start the scientific loop for a session.
    pub fn start_exploration(&self, session_id: &SessionId) -> Result<()> {
        let handle = self.get_handle(session_id)?;
        let mut task_slot = handle
            .task
            .lock()
            .map_err(|e| Error::Internal(format!("session task lock poisoned: {}", e)))?;
        if task_slot.is_some() {
            return Err(Error::Conflict(format!(
                "session {} is already running",
                session_id
            )));
        }

        let llm = client_from_settings(&handle.settings);
        let mut navigator = Navigator::new(
            session_id.to_string(),
            handle.driver.clone(),
            handle.interceptor.clone(),
            self.fsm.clone(),
            handle.guardrails.clone(),
            handle.rate_limiter.clone(),
            handle.settings.state_hamming_threshold,
        );
        if let Some(vector) = &self.vector {
            navigator = navigator.with_vector_store(
                vector.clone(),
                handle.settings.semantic_similarity_threshold,
            );
        }
        let analyst = Analyst::new(handle.hypotheses.clone(), llm.clone());
        let business_logic = BusinessLogic::new(handle.hypotheses.clone(), llm.clone());
        let critic = Critic::new(llm);

        let mut supervisor = Supervisor::new(
            session_id.to_string(),
            handle.target_url.clone(),
            navigator,
            analyst,
            business_logic,
            critic,
            handle.verifier.clone(),
            handle.interceptor.clone(),
            self.fsm.clone(),
            handle.hypotheses.clone(),
            handle.guardrails.clone(),
            handle.events.clone(),
            handle.status.clone(),
            handle.cancel.clone(),
        );

        let driver = handle.driver.clone();
        let interceptor = handle.interceptor.clone();
        let target_url = handle.target_url.clone();
        let events = handle.events.clone();

        let task = tokio::spawn(async move {
            // Wire the network push stream before the first navigation
            let (sink, receiver) = tokio::sync::mpsc::unbounded_channel();
            driver.on_request_response(sink);
            let pump = {
                let interceptor = interceptor.clone();
                tokio::spawn(async move { interceptor.run_pump(receiver).await })
            };

            if let Err(error) = driver.start().await {
                warn!(%error, "browser start failed");
                let _ = events.send(SessionEvent::error(error.category(), error.to_string()));
            }
            // Navigation timeout is warn-only; the loop copes with a
            // partially loaded page
            match tokio::time::timeout(
                std::time::Duration::from_secs(60),
                driver.navigate(&target_url),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(%error, "initial navigation failed");
                    let _ = events.send(SessionEvent::error(error.category(), error.to_string()));
                }
                Err(_) => warn!(target = %target_url, "initial navigation timed out"),
            }

            let reason = supervisor.run().await;
            info!(%reason, "session loop finished");

            if let Err(error) = driver.stop().await {
                warn!(%error, "browser stop failed");
            }
            pump.abort();
        });

        *task_slot = Some(task);
        if let Ok(mut status) = handle.status.lock() {
            status.running = true;
            status.current_url = handle.target_url.clone();
        }
        Ok(())
    }

    /// Request the session's loop to stop. Honored within two seconds at
    /// every suspension point.
    pub fn stop_exploration(&self, session_id: &SessionId) -> Result<()> {
        let handle = self.get_handle(session_id)?;
        handle.cancel.cancel();
        Ok(())
    }

    /// Current status of a session.
    pub fn status(&self, session_id: &SessionId) -> Result<SessionStatus> {
        let handle = self.get_handle(session_id)?;
        handle
            .status
            .lock()
            .map(|status| status.clone())
            .map_err(|e| Error::Internal(format!("status lock poisoned: {}", e)))
    }

    /// Subscribe to the session's event stream.
    pub fn stream_events(&self, session_id: &SessionId) -> Result<broadcast::Receiver<SessionEvent>> {
        let handle = self.get_handle(session_id)?;
        Ok(handle.events.subscribe())
    }

    /// Export the session's knowledge as an OpenAPI document. Falls back to
    /// the persisted hypotheses when the in-memory store is empty (e.g. a
    /// re-opened deployment).
    pub fn export_openapi(&self, session_id: &SessionId, min_confidence: f64) -> Result<Value> {
        let handle = self.get_handle(session_id)?;
        let mut hypotheses = handle.hypotheses.list()?;
        if hypotheses.is_empty() {
            hypotheses = self.fsm.load_hypotheses(&session_id.to_string())?;
        }
        Ok(openapi::from_hypotheses(
            &hypotheses,
            min_confidence,
            Some(&handle.target_url),
        ))
    }

    /// Set authentication state inherited by the session's probes.
    pub fn set_auth(
        &self,
        session_id: &SessionId,
        headers: Option<HashMap<String, String>>,
        cookies: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let handle = self.get_handle(session_id)?;
        handle.verifier.set_auth(headers, cookies);
        Ok(())
    }

    /// The session's FSM graph for visualization.
    pub fn graph(&self, session_id: &SessionId) -> Result<crate::fsm::FsmGraph> {
        self.fsm.graph(&session_id.to_string())
    }

    /// Wait for the session's loop task to finish (used by embedders that
    /// need a join point after `stop_exploration`).
    pub async fn join(&self, session_id: &SessionId) -> Result<()> {
        let handle = self.get_handle(session_id)?;
        let task = {
            let mut slot = handle
                .task
                .lock()
                .map_err(|e| Error::Internal(format!("session task lock poisoned: {}", e)))?;
            slot.take()
        };
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Internal(format!("session task panicked: {}", e)))?;
        }
        Ok(())
    }

    fn get_handle(&self, session_id: &SessionId) -> Result<Arc<SessionHandle>> {
        self.lock_sessions()?
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))
    }

    fn lock_sessions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, Arc<SessionHandle>>>> {
        self.sessions
            .lock()
            .map_err(|e| Error::Internal(format!("session map lock poisoned: {}", e)))
    }
}

/// Adapt an event subscription into a `Stream`. Lagged gaps are skipped;
/// the stream ends when the session's sender is dropped.
pub fn event_stream(
    receiver: broadcast::Receiver<SessionEvent>,
) -> impl futures::Stream<Item = SessionEvent> {
    futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((event, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{
        AxNode, ClickTarget, FormInfo, NetworkSink, OverlayElement, RawExchange, ScrollDirection,
    };
    use async_trait::async_trait;

    /// A driver for a page with nothing to do: no elements, no forms,
    /// no traffic.
    struct InertDriver;

    #[async_trait]
    impl BrowserDriver for InertDriver {
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn navigate(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn click(&self, _target: &ClickTarget) -> Result<()> {
            Ok(())
        }
        async fn type_text(&self, _selector: &str, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn select(&self, _selector: &str, _value: &str) -> Result<()> {
            Ok(())
        }
        async fn scroll(&self, _direction: ScrollDirection) -> Result<()> {
            Ok(())
        }
        async fn go_back(&self) -> Result<()> {
            Ok(())
        }
        async fn hover(&self, _selector: &str) -> Result<()> {
            Ok(())
        }
        async fn current_url(&self) -> Result<String> {
            Ok("https://h.example/".to_string())
        }
        async fn title(&self) -> Result<String> {
            Ok("Empty".to_string())
        }
        async fn screenshot(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn page_eval(&self, _script: &str) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn accessibility_snapshot(&self) -> Result<Option<AxNode>> {
            Ok(Some(AxNode::new("main", "Empty")))
        }
        async fn overlay_elements(&self) -> Result<Vec<OverlayElement>> {
            Ok(Vec::new())
        }
        async fn query_clickables(&self) -> Result<Vec<OverlayElement>> {
            Ok(Vec::new())
        }
        async fn forms(&self) -> Result<Vec<FormInfo>> {
            Ok(Vec::new())
        }
        fn on_request_response(&self, _sink: NetworkSink) {}
    }

    fn manager() -> SessionManager {
        SessionManager::in_memory(Box::new(|| Arc::new(InertDriver))).unwrap()
    }

    fn settings() -> Settings {
        Settings::default()
            .with_authorized_domains(vec!["h.example".into()])
            .with_max_iterations(12)
    }

    #[test]
    fn test_create_session_validates_target() {
        let manager = manager();
        assert!(manager
            .create_session("https://google.com/", settings())
            .is_err());
        assert!(manager
            .create_session("https://h.example/", settings())
            .is_ok());
    }

    #[test]
    fn test_status_requires_known_session() {
        let manager = manager();
        let missing = SessionId::new();
        assert!(matches!(
            manager.status(&missing),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_runs_to_iteration_budget() {
        let manager = manager();
        let session_id = manager
            .create_session("https://h.example/", settings())
            .unwrap();

        let mut events = manager.stream_events(&session_id).unwrap();
        manager.start_exploration(&session_id).unwrap();

        // Double start is rejected
        assert!(matches!(
            manager.start_exploration(&session_id),
            Err(Error::Conflict(_))
        ));

        manager.join(&session_id).await.unwrap();

        let status = manager.status(&session_id).unwrap();
        assert!(!status.running);
        assert!(status.iteration >= 12);

        // Phase-change events were emitted along the way
        let mut saw_phase_change = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type == crate::events::SessionEventType::PhaseChanged {
                saw_phase_change = true;
                break;
            }
        }
        assert!(saw_phase_change);

        // The empty run still exports a valid (empty) document
        let document = manager.export_openapi(&session_id, 0.7).unwrap();
        assert_eq!(document["openapi"], "3.0.3");
        assert!(document["paths"].as_object().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_stream_adapter() {
        use futures::StreamExt;

        let (sender, receiver) = broadcast::channel(8);
        let stream = event_stream(receiver);
        futures::pin_mut!(stream);

        sender
            .send(SessionEvent::observation_captured("GET", "https://h/api", 200))
            .unwrap();
        let event = stream.next().await.unwrap();
        assert_eq!(
            event.event_type,
            crate::events::SessionEventType::ObservationCaptured
        );

        drop(sender);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_exploration_cancels() {
        let manager = manager();
        let session_id = manager
            .create_session(
                "https://h.example/",
                settings().with_max_iterations(100_000),
            )
            .unwrap();

        manager.start_exploration(&session_id).unwrap();
        manager.stop_exploration(&session_id).unwrap();
        manager.join(&session_id).await.unwrap();

        let status = manager.status(&session_id).unwrap();
        assert!(!status.running);
    }
}
