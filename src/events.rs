//! Session event types for observable exploration.
//!
//! The event stream is the user-visible surface of a running session: every
//! phase change, captured observation, hypothesis mutation, critic review,
//! and probe result is emitted here and can be rendered as live output or
//! exported for replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::ErrorCategory;

/// Types of events emitted on the session stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventType {
    /// The supervisor moved to a new loop phase
    PhaseChanged,
    /// The interceptor accepted a request/response pair
    ObservationCaptured,
    /// A new hypothesis was written to the store
    HypothesisCreated,
    /// A hypothesis confidence changed (evidence, critique, or probe)
    ConfidenceChanged,
    /// The critic produced a review
    CriticReview,
    /// The verifier completed a probe
    ProbeResult,
    /// An error occurred (tagged with its category)
    Error,
}

impl std::fmt::Display for SessionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PhaseChanged => "phase_changed",
            Self::ObservationCaptured => "observation_captured",
            Self::HypothesisCreated => "hypothesis_created",
            Self::ConfidenceChanged => "confidence_changed",
            Self::CriticReview => "critic_review",
            Self::ProbeResult => "probe_result",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// An event emitted during session execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Type of the event
    pub event_type: SessionEventType,
    /// Human-readable content describing the event
    pub content: String,
    /// Event-specific metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    /// Create a new session event.
    pub fn new(event_type: SessionEventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Add metadata to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Get a metadata value.
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.get(key)
    }

    // Convenience constructors for the enumerated event kinds

    /// A phase transition with its iteration counter.
    pub fn phase_changed(from: &str, to: &str, iteration: u32) -> Self {
        Self::new(
            SessionEventType::PhaseChanged,
            format!("Iteration {}: {} -> {}", iteration, from, to),
        )
        .with_metadata("from", from)
        .with_metadata("to", to)
        .with_metadata("iteration", iteration as i64)
    }

    /// A captured observation.
    pub fn observation_captured(method: &str, url: &str, status: u16) -> Self {
        Self::new(
            SessionEventType::ObservationCaptured,
            format!("{} {} -> {}", method, url, status),
        )
        .with_metadata("method", method)
        .with_metadata("url", url)
        .with_metadata("status", status as i64)
    }

    /// A newly created hypothesis.
    pub fn hypothesis_created(id: &str, kind: &str, confidence: f64) -> Self {
        Self::new(
            SessionEventType::HypothesisCreated,
            format!("New {} hypothesis ({:.2})", kind, confidence),
        )
        .with_metadata("hypothesis_id", id)
        .with_metadata("kind", kind)
        .with_metadata("confidence", confidence)
    }

    /// A confidence change on an existing hypothesis.
    pub fn confidence_changed(id: &str, old: f64, new: f64, reason: &str) -> Self {
        Self::new(
            SessionEventType::ConfidenceChanged,
            format!("Confidence {:.2} -> {:.2}: {}", old, new, reason),
        )
        .with_metadata("hypothesis_id", id)
        .with_metadata("old_confidence", old)
        .with_metadata("new_confidence", new)
    }

    /// A critic review verdict.
    pub fn critic_review(hypothesis_id: &str, verdict: &str, recommended: f64) -> Self {
        Self::new(
            SessionEventType::CriticReview,
            format!("Critic verdict: {} (recommended {:.2})", verdict, recommended),
        )
        .with_metadata("hypothesis_id", hypothesis_id)
        .with_metadata("verdict", verdict)
        .with_metadata("recommended_confidence", recommended)
    }

    /// A completed probe.
    pub fn probe_result(hypothesis_id: &str, probe_kind: &str, outcome: &str) -> Self {
        Self::new(
            SessionEventType::ProbeResult,
            format!("Probe {}: {}", probe_kind, outcome),
        )
        .with_metadata("hypothesis_id", hypothesis_id)
        .with_metadata("probe_kind", probe_kind)
        .with_metadata("outcome", outcome)
    }

    /// An error with its taxonomy category.
    pub fn error(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::new(SessionEventType::Error, message)
            .with_metadata("category", category.to_string())
    }

    /// Check if this is an error event.
    pub fn is_error(&self) -> bool {
        self.event_type == SessionEventType::Error
    }

    /// Format as a single-line log entry.
    pub fn as_log_line(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.event_type,
            self.content.lines().next().unwrap_or("")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_event() {
        let event = SessionEvent::phase_changed("explore", "observe", 3);
        assert_eq!(event.event_type, SessionEventType::PhaseChanged);
        assert_eq!(event.get_metadata("to"), Some(&Value::from("observe")));
        assert_eq!(event.get_metadata("iteration"), Some(&Value::from(3)));
    }

    #[test]
    fn test_error_event_carries_category() {
        let event = SessionEvent::error(ErrorCategory::Storage, "disk full");
        assert!(event.is_error());
        assert_eq!(
            event.get_metadata("category"),
            Some(&Value::from("storage"))
        );
    }

    #[test]
    fn test_log_line() {
        let event = SessionEvent::observation_captured("GET", "https://h/api/users/42", 200);
        let line = event.as_log_line();
        assert!(line.contains("observation_captured"));
        assert!(line.contains("/api/users/42"));
    }

    #[test]
    fn test_serde_round_trip() {
        let event = SessionEvent::probe_result("hyp-1", "replay_exact", "confirmed");
        let json = serde_json::to_string(&event).unwrap();
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, SessionEventType::ProbeResult);
    }
}
