//! # apiscope-core
//!
//! Black-box API surface mapping: drive a live web application through a
//! real browser, intercept the traffic its UI produces, and grow a
//! calibrated knowledge base of endpoints, schemas, business rules, and
//! permission boundaries.
//!
//! ## Core Components
//!
//! - **Supervisor**: the scientific loop (Explore, Observe, Infer, Critique,
//!   Probe, Update)
//! - **Interceptor / Navigator**: traffic capture and UI exploration
//! - **Analyst / BusinessLogic / Critic / Verifier**: hypothesis inference,
//!   adversarial review, and probe-based verification
//! - **HypothesisStore / FsmStore**: confidence accounting and the persisted
//!   page-state graph
//!
//! ## Example
//!
//! ```rust,ignore
//! use apiscope_core::{SessionManager, Settings};
//!
//! let settings = Settings::from_env()?
//!     .with_authorized_domains(vec!["example.com".into()]);
//! let manager = SessionManager::new(&settings, driver_factory)?;
//!
//! let session = manager.create_session("https://example.com", settings)?;
//! manager.start_exploration(&session)?;
//!
//! let spec = manager.export_openapi(&session, 0.7)?;
//! println!("{}", serde_json::to_string_pretty(&spec)?);
//! ```
//!
//! This system is for authorized analysis only; guardrails enforce the
//! operator-supplied domain allowlist before any outbound action.

pub mod analyst;
pub mod browser;
pub mod business_logic;
pub mod cancel;
pub mod cluster;
pub mod config;
pub mod critic;
pub mod error;
pub mod events;
pub mod fsm;
pub mod guardrails;
pub mod hypothesis;
pub mod interceptor;
pub mod llm;
pub mod navigator;
pub mod openapi;
pub mod schema;
pub mod session;
pub mod statehash;
pub mod supervisor;
pub mod vector;
pub mod verifier;

// Re-exports for convenience
pub use analyst::Analyst;
pub use browser::{
    ActionKind, ActionRecord, AxNode, BrowserDriver, ClickTarget, FormField, FormInfo,
    InteractiveNode, NetworkSink, OverlayElement, RawExchange, ScrollDirection,
};
pub use business_logic::BusinessLogic;
pub use cancel::CancellationSignal;
pub use cluster::{ClusterStats, PathParam, UrlClusterer};
pub use config::Settings;
pub use critic::{default_probes, Critic};
pub use error::{Error, ErrorCategory, Result};
pub use events::{SessionEvent, SessionEventType};
pub use fsm::{FsmGraph, FsmStore, GraphEdge, GraphNode, PageStateRow, SessionRow, TransitionRow};
pub use guardrails::{Guardrails, RateLimiter};
pub use hypothesis::{
    CompetingExplanation, ConfidenceCalculator, ConfidenceEvent, ConfidenceEventKind,
    ConfidenceSummary, Contradiction, CriticReview, CriticVerdict, EvidenceRef, EvidenceStrength,
    Hypothesis, HypothesisFilter, HypothesisId, HypothesisKind, HypothesisStatus, HypothesisStore,
    NewHypothesis, ProbeKind, ProbeOutcome, ProbeRequest, ProbeResult, RuleKind,
};
pub use interceptor::{
    is_api_traffic, Interceptor, Observation, ObservationBuffer, ObservationId, ObservationStats,
};
pub use llm::{
    client_from_settings, AnthropicClient, ChatMessage, ChatRole, ClientConfig, InvokeRequest,
    InvokeResponse, LlmClient, OpenAiClient, Provider, ToolCall, ToolSpec,
};
pub use navigator::{ExploreOutcome, Navigator};
pub use openapi::{from_hypotheses, OpenApiBuilder};
pub use schema::{infer_schema, merge_schemas, validates, SchemaMerger};
pub use session::{event_stream, DriverFactory, SessionId, SessionManager};
pub use statehash::{hash_page, mask_dynamic, simhash, StateHash};
pub use supervisor::{
    next_phase, origin_of, LoopContext, Phase, SessionStatus, Supervisor, TerminationReason,
};
pub use vector::{find_semantic_match, VectorHit, VectorStore};
pub use verifier::{evaluate_outcome, fill_path_params, Verifier};
