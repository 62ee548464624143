//! Session and process configuration.
//!
//! All knobs are plain struct fields with builder-style setters. `from_env`
//! reads the same keys from the environment (upper-cased), so deployments can
//! configure the engine without code changes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::llm::Provider;

/// Application configuration for one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Which LLM provider to use
    pub llm_provider: Provider,
    /// OpenAI API key
    pub openai_api_key: String,
    /// OpenAI model name
    pub openai_model: String,
    /// Anthropic API key
    pub anthropic_api_key: String,
    /// Anthropic model name
    pub anthropic_model: String,

    /// SQLite database path
    pub database_path: String,
    /// Vector store persistence directory
    pub vector_persist_dir: String,

    /// API host for the control surface
    pub api_host: String,
    /// API port for the control surface
    pub api_port: u16,

    /// Run the browser in headless mode
    pub headless: bool,
    /// Browser operation timeout in milliseconds
    pub browser_timeout_ms: u64,

    /// Maximum outbound requests per minute to the target
    pub max_requests_per_minute: u32,
    /// Maximum depth of exploration
    pub max_exploration_depth: u32,
    /// Maximum scientific loop iterations
    pub max_loop_iterations: u32,
    /// Minimum confidence for hypothesis export
    pub confidence_threshold: f64,

    /// Domains the operator is authorized to analyze
    pub authorized_domains: Vec<String>,
    /// Enable hypothesis probing/verification
    pub enable_probing: bool,
    /// Enable fuzzing-class probes (boundary values, type changes)
    pub enable_fuzzing: bool,

    /// Maximum probes executed per loop iteration
    pub max_probes_per_iteration: usize,
    /// Hamming distance at or below which two state hashes collide
    pub state_hamming_threshold: u32,
    /// Similarity threshold for vector-based semantic dedup
    pub semantic_similarity_threshold: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_provider: Provider::OpenAi,
            openai_api_key: String::new(),
            openai_model: "gpt-4o".to_string(),
            anthropic_api_key: String::new(),
            anthropic_model: "claude-3-5-sonnet-20241022".to_string(),
            database_path: "./data/apiscope.db".to_string(),
            vector_persist_dir: "./data/vectors".to_string(),
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            headless: true,
            browser_timeout_ms: 30_000,
            max_requests_per_minute: 60,
            max_exploration_depth: 50,
            max_loop_iterations: 1000,
            confidence_threshold: 0.7,
            authorized_domains: Vec::new(),
            enable_probing: true,
            enable_fuzzing: false,
            max_probes_per_iteration: 10,
            state_hamming_threshold: 3,
            semantic_similarity_threshold: 0.9,
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            settings.llm_provider = match provider.to_lowercase().as_str() {
                "openai" => Provider::OpenAi,
                "anthropic" => Provider::Anthropic,
                other => {
                    return Err(Error::Config(format!("unknown llm_provider: {}", other)))
                }
            };
        }

        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            settings.openai_api_key = v;
        }
        if let Ok(v) = std::env::var("OPENAI_MODEL") {
            settings.openai_model = v;
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            settings.anthropic_api_key = v;
        }
        if let Ok(v) = std::env::var("ANTHROPIC_MODEL") {
            settings.anthropic_model = v;
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            settings.database_path = v;
        }
        if let Ok(v) = std::env::var("VECTOR_PERSIST_DIR") {
            settings.vector_persist_dir = v;
        }
        if let Ok(v) = std::env::var("API_HOST") {
            settings.api_host = v;
        }

        settings.api_port = parse_env("API_PORT", settings.api_port)?;
        settings.headless = parse_env("HEADLESS", settings.headless)?;
        settings.browser_timeout_ms = parse_env("BROWSER_TIMEOUT", settings.browser_timeout_ms)?;
        settings.max_requests_per_minute =
            parse_env("MAX_REQUESTS_PER_MINUTE", settings.max_requests_per_minute)?;
        settings.max_exploration_depth =
            parse_env("MAX_EXPLORATION_DEPTH", settings.max_exploration_depth)?;
        settings.max_loop_iterations =
            parse_env("MAX_LOOP_ITERATIONS", settings.max_loop_iterations)?;
        settings.confidence_threshold =
            parse_env("CONFIDENCE_THRESHOLD", settings.confidence_threshold)?;
        settings.enable_probing = parse_env("ENABLE_PROBING", settings.enable_probing)?;
        settings.enable_fuzzing = parse_env("ENABLE_FUZZING", settings.enable_fuzzing)?;

        if let Ok(v) = std::env::var("AUTHORIZED_DOMAINS") {
            settings.authorized_domains = v
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
        }

        Ok(settings)
    }

    /// Set the authorized domains.
    pub fn with_authorized_domains(mut self, domains: Vec<String>) -> Self {
        self.authorized_domains = domains;
        self
    }

    /// Set the maximum loop iterations.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_loop_iterations = max;
        self
    }

    /// Set the outbound request budget per minute.
    pub fn with_max_requests_per_minute(mut self, max: u32) -> Self {
        self.max_requests_per_minute = max;
        self
    }

    /// Set the export confidence threshold.
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Enable or disable probing.
    pub fn with_probing(mut self, enabled: bool) -> Self {
        self.enable_probing = enabled;
        self
    }

    /// Enable or disable fuzzing-class probes.
    pub fn with_fuzzing(mut self, enabled: bool) -> Self {
        self.enable_fuzzing = enabled;
        self
    }

    /// API key for the configured provider.
    pub fn active_api_key(&self) -> &str {
        match self.llm_provider {
            Provider::OpenAi => &self.openai_api_key,
            Provider::Anthropic => &self.anthropic_api_key,
        }
    }

    /// Model name for the configured provider.
    pub fn active_model(&self) -> &str {
        match self.llm_provider {
            Provider::OpenAi => &self.openai_model,
            Provider::Anthropic => &self.anthropic_model,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_requests_per_minute, 60);
        assert_eq!(settings.max_loop_iterations, 1000);
        assert!((settings.confidence_threshold - 0.7).abs() < f64::EPSILON);
        assert!(settings.enable_probing);
        assert!(!settings.enable_fuzzing);
        assert_eq!(settings.state_hamming_threshold, 3);
    }

    #[test]
    fn test_builder_setters() {
        let settings = Settings::default()
            .with_authorized_domains(vec!["example.com".into()])
            .with_max_iterations(25)
            .with_confidence_threshold(1.5)
            .with_fuzzing(true);

        assert_eq!(settings.authorized_domains, vec!["example.com"]);
        assert_eq!(settings.max_loop_iterations, 25);
        assert!((settings.confidence_threshold - 1.0).abs() < f64::EPSILON);
        assert!(settings.enable_fuzzing);
    }

    #[test]
    fn test_active_provider_fields() {
        let mut settings = Settings::default();
        settings.llm_provider = Provider::Anthropic;
        settings.anthropic_api_key = "key-a".into();
        assert_eq!(settings.active_api_key(), "key-a");
        assert_eq!(settings.active_model(), "claude-3-5-sonnet-20241022");
    }
}
