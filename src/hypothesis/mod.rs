//! Hypotheses and their confidence calculus.
//!
//! A hypothesis is the central unit of inferred knowledge about the target
//! system: an endpoint schema, a business rule, a state transition, a
//! permission gate, a rate limit, or a field constraint. Every hypothesis
//! carries a confidence in [0, 1] that only moves by appending a confidence
//! event, so the full belief history stays auditable.
//!
//! ## Example
//!
//! ```rust,ignore
//! use apiscope_core::hypothesis::{HypothesisStore, NewHypothesis, HypothesisKind};
//!
//! let store = HypothesisStore::new();
//! let hypothesis = store.create(
//!     NewHypothesis::new(HypothesisKind::EndpointSchema, "GET /api/users/{id}", "analyst")
//!         .with_endpoint("/api/users/{id}", "GET"),
//! )?;
//! assert!(hypothesis.confidence > 0.0);
//! ```

mod confidence;
mod store;
mod types;

pub use confidence::{ConfidenceCalculator, EXPORT_THRESHOLD, REVISION_THRESHOLD, STOP_THRESHOLD};
pub use store::{ConfidenceSummary, Contradiction, HypothesisFilter, HypothesisStore};
pub use types::{
    CompetingExplanation, ConfidenceEvent, ConfidenceEventKind, CriticReview, CriticVerdict,
    EvidenceRef, EvidenceStrength, Hypothesis, HypothesisId, HypothesisKind, HypothesisStatus,
    NewHypothesis, ProbeKind, ProbeOutcome, ProbeRequest, ProbeResult, RuleKind,
};
