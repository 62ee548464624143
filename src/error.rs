//! Error types for apiscope-core.

use thiserror::Error;

/// Result type alias using apiscope-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the scientific loop.
#[derive(Error, Debug)]
pub enum Error {
    /// A guardrail rejected the requested target, action, or probe
    #[error("Guardrail violation: {0}")]
    Guardrail(String),

    /// Transient browser automation failure (navigation timeout, stale overlay)
    #[error("Browser error: {0}")]
    Browser(String),

    /// Transient network failure on an outbound probe
    #[error("Probe network error: {0}")]
    ProbeNetwork(String),

    /// Store write failure (disk/IO)
    #[error("Store error: {0}")]
    Storage(String),

    /// LLM provider invocation or structured-parse failure
    #[error("LLM error: {provider} - {message}")]
    Llm { provider: String, message: String },

    /// A store invariant was violated; fatal for the session
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Timeout during a bounded operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown session, hypothesis, or state referenced by id
    #[error("Not found: {0}")]
    NotFound(String),

    /// An insert would duplicate an existing record; caller must merge
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy category, attached to `error` events on the session stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Guardrail,
    Browser,
    Network,
    Storage,
    Llm,
    Invariant,
    Other,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Guardrail => write!(f, "guardrail"),
            Self::Browser => write!(f, "browser"),
            Self::Network => write!(f, "network"),
            Self::Storage => write!(f, "storage"),
            Self::Llm => write!(f, "llm"),
            Self::Invariant => write!(f, "invariant"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl Error {
    /// Create a guardrail violation error.
    pub fn guardrail(message: impl Into<String>) -> Self {
        Self::Guardrail(message.into())
    }

    /// Create a browser error.
    pub fn browser(message: impl Into<String>) -> Self {
        Self::Browser(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create an LLM provider error.
    pub fn llm(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Llm {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an invariant violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Classify this error into the taxonomy of the session event stream.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Guardrail(_) => ErrorCategory::Guardrail,
            Self::Browser(_) | Self::Timeout { .. } => ErrorCategory::Browser,
            Self::ProbeNetwork(_) => ErrorCategory::Network,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Llm { .. } => ErrorCategory::Llm,
            Self::Invariant(_) => ErrorCategory::Invariant,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether the session error counter should increment for this error.
    ///
    /// Only store-write failures and unhandled errors count toward the
    /// ten-error session budget; guardrail, browser, network, and LLM
    /// failures recover locally.
    pub fn counts_toward_budget(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Storage | ErrorCategory::Other
        )
    }

    /// Whether this error is fatal for the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            Error::guardrail("blocked").category(),
            ErrorCategory::Guardrail
        );
        assert_eq!(Error::storage("disk full").category(), ErrorCategory::Storage);
        assert_eq!(
            Error::llm("anthropic", "overloaded").category(),
            ErrorCategory::Llm
        );
        assert_eq!(Error::timeout(5000).category(), ErrorCategory::Browser);
    }

    #[test]
    fn test_budget_policy() {
        assert!(Error::storage("io").counts_toward_budget());
        assert!(Error::Internal("boom".into()).counts_toward_budget());
        assert!(!Error::guardrail("rate limit").counts_toward_budget());
        assert!(!Error::llm("openai", "429").counts_toward_budget());
        assert!(!Error::browser("stale overlay").counts_toward_budget());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::invariant("unknown from-state").is_fatal());
        assert!(!Error::storage("io").is_fatal());
    }
}
