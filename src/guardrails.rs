//! Scope and safety guardrails.
//!
//! Every outbound action passes through here before execution. This system
//! is for authorized analysis only: the operator supplies the domains they
//! may analyze, and the guardrails refuse everything else. Probing is
//! validation, not exploitation; fuzzing-class probes need explicit opt-in.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::browser::ActionKind;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::hypothesis::ProbeKind;

/// Action/target patterns that are never executed.
fn blocked_patterns() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"(?i).*logout.*",
            r"(?i).*sign[-_ ]?out.*",
            r"(?i).*delete.*account.*",
            r"(?i).*password.*reset.*",
            r"(?i).*/admin/.*delete.*",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid guardrail regex"))
        .collect()
    })
}

/// External domains that are never targets.
const EXTERNAL_BLOCKED: &[&str] = &[
    "google.com",
    "facebook.com",
    "twitter.com",
    "analytics.google.com",
    "googletagmanager.com",
    "doubleclick.net",
    "facebook.net",
];

/// Extract the host of a URL, without port.
pub fn url_host(url: &str) -> Option<&str> {
    let rest = url.split("://").nth(1)?;
    let host_port = rest.split(['/', '?', '#']).next()?;
    let host = host_port.split('@').last()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Safety and scope enforcement for one session.
#[derive(Debug)]
pub struct Guardrails {
    authorized_domains: Vec<String>,
    enable_probing: bool,
    enable_fuzzing: bool,
    max_loop_iterations: u32,
}

impl Guardrails {
    pub fn new(settings: &Settings) -> Self {
        Self {
            authorized_domains: settings
                .authorized_domains
                .iter()
                .map(|d| d.to_lowercase())
                .collect(),
            enable_probing: settings.enable_probing,
            enable_fuzzing: settings.enable_fuzzing,
            max_loop_iterations: settings.max_loop_iterations,
        }
    }

    /// Validate that a target URL is authorized for analysis.
    pub fn validate_target_url(&self, url: &str) -> Result<()> {
        let host = url_host(url)
            .ok_or_else(|| Error::guardrail(format!("cannot parse host from '{}'", url)))?
            .to_lowercase();

        for blocked in EXTERNAL_BLOCKED {
            if host == *blocked || host.ends_with(&format!(".{}", blocked)) {
                return Err(Error::guardrail(format!(
                    "domain '{}' is blocked (external service)",
                    host
                )));
            }
        }

        // Empty authorized list means operator takes responsibility per session
        if self.authorized_domains.is_empty() {
            return Ok(());
        }

        for domain in &self.authorized_domains {
            if host == *domain || host.ends_with(&format!(".{}", domain)) {
                return Ok(());
            }
        }

        Err(Error::guardrail(format!(
            "domain '{}' is not in authorized domains {:?}",
            host, self.authorized_domains
        )))
    }

    /// Validate that a proposed UI action is safe to execute.
    pub fn validate_action(
        &self,
        kind: ActionKind,
        target: &str,
        current_url: &str,
    ) -> Result<()> {
        let context = format!("{} {}", current_url, target);
        for pattern in blocked_patterns() {
            if pattern.is_match(&context) {
                return Err(Error::guardrail(format!(
                    "action blocked by safety pattern: {}",
                    pattern.as_str()
                )));
            }
        }

        if kind == ActionKind::Navigate {
            self.validate_target_url(target)?;
        }

        Ok(())
    }

    /// Validate that a probe may run under the current configuration.
    pub fn validate_probe(&self, kind: ProbeKind, session_enabled: bool) -> Result<()> {
        if !session_enabled {
            return Err(Error::guardrail("probing is disabled for this session"));
        }
        if !self.enable_probing {
            return Err(Error::guardrail("probing is disabled in configuration"));
        }
        if kind.is_fuzzing() && !self.enable_fuzzing {
            return Err(Error::guardrail(format!(
                "probe kind '{}' requires fuzzing to be enabled",
                kind
            )));
        }
        Ok(())
    }

    /// Validate the loop iteration budget.
    pub fn validate_iteration(&self, current_iteration: u32) -> Result<()> {
        if current_iteration >= self.max_loop_iterations {
            return Err(Error::guardrail(format!(
                "maximum iterations exceeded: {}",
                self.max_loop_iterations
            )));
        }
        Ok(())
    }

    /// Declaration of the active scope and safety settings.
    pub fn scope_declaration(&self) -> Value {
        json!({
            "authorized_domains": self.authorized_domains,
            "max_loop_iterations": self.max_loop_iterations,
            "probing_enabled": self.enable_probing,
            "fuzzing_enabled": self.enable_fuzzing,
            "blocked_patterns": blocked_patterns().iter().map(|r| r.as_str()).collect::<Vec<_>>(),
            "external_blocked": EXTERNAL_BLOCKED,
            "disclaimer": "Authorized use only. The engine performs validation probing, not exploitation.",
        })
    }
}

/// Per-session rate limiter: enforces a minimum interval between outbound
/// requests of `60 / max_requests_per_minute` seconds. `acquire` blocks
/// until a slot is free; rate limiting is never an error.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    next_slot: Instant,
    total_requests: u64,
}

impl RateLimiter {
    pub fn new(max_requests_per_minute: u32) -> Self {
        let per_minute = max_requests_per_minute.max(1);
        Self {
            interval: Duration::from_secs_f64(60.0 / per_minute as f64),
            state: Mutex::new(LimiterState {
                next_slot: Instant::now(),
                total_requests: 0,
            }),
        }
    }

    /// Take one token, sleeping until the inter-request interval has passed.
    pub async fn acquire(&self) -> Result<()> {
        let wait_until = {
            let mut state = self
                .state
                .lock()
                .map_err(|e| Error::Internal(format!("rate limiter lock poisoned: {}", e)))?;
            let now = Instant::now();
            let slot = state.next_slot.max(now);
            state.next_slot = slot + self.interval;
            state.total_requests += 1;
            slot
        };

        let now = Instant::now();
        if wait_until > now {
            tokio::time::sleep_until(wait_until).await;
        }
        Ok(())
    }

    /// Total requests admitted so far.
    pub fn total_requests(&self) -> u64 {
        self.state
            .lock()
            .map(|state| state.total_requests)
            .unwrap_or(0)
    }

    /// The enforced minimum inter-request interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}
