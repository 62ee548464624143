//! Confidence calculus.
//!
//! Three rules move confidence: the initial rule (evidence counts), the
//! critic rule (verdict-driven), and the probe rule (outcome-driven). All
//! values are clamped to sane ranges; the store is responsible for recording
//! each change as a confidence event.

use super::types::{CriticVerdict, ProbeOutcome};

/// Hypotheses below this confidence are excluded from the OpenAPI export.
pub const EXPORT_THRESHOLD: f64 = 0.7;

/// Hypotheses at or above this confidence count as stop-worthy/confirmed.
pub const STOP_THRESHOLD: f64 = 0.85;

/// Hypotheses below this confidence need revision.
pub const REVISION_THRESHOLD: f64 = 0.2;

/// Calculates confidence adjustments for hypothesis lifecycle events.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceCalculator;

impl ConfidenceCalculator {
    /// Initial confidence from evidence quantity, discounted by competing
    /// explanations and untested assumptions. Clamped to [0.1, 1.0].
    pub fn initial_confidence(
        evidence_count: usize,
        competing_count: usize,
        untested_count: usize,
    ) -> f64 {
        let base = match evidence_count {
            0 | 1 => 0.2,
            2 => 0.35,
            3..=5 => 0.5,
            _ => 0.6,
        };

        let competing_penalty = competing_count as f64 * 0.1;
        let assumption_penalty = untested_count as f64 * 0.05;

        (base - competing_penalty - assumption_penalty).clamp(0.1, 1.0)
    }

    /// Adjust confidence for a critic verdict.
    pub fn apply_critic(current: f64, verdict: CriticVerdict, recommended: f64) -> f64 {
        match verdict {
            CriticVerdict::Reject => current * 0.3,
            CriticVerdict::Challenge => current.min(recommended),
            CriticVerdict::Accept => (current * 1.1).min(1.0),
        }
    }

    /// Adjust confidence for a probe outcome.
    pub fn apply_probe(current: f64, outcome: ProbeOutcome) -> f64 {
        match outcome {
            // Asymptotic increase toward 1.0
            ProbeOutcome::Confirmed => current + (1.0 - current) * 0.2,
            ProbeOutcome::Falsified => current * 0.5,
            ProbeOutcome::Inconclusive => current * 0.95,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_confidence_base_tiers() {
        assert_eq!(ConfidenceCalculator::initial_confidence(1, 0, 0), 0.2);
        assert_eq!(ConfidenceCalculator::initial_confidence(2, 0, 0), 0.35);
        assert_eq!(ConfidenceCalculator::initial_confidence(3, 0, 0), 0.5);
        assert_eq!(ConfidenceCalculator::initial_confidence(5, 0, 0), 0.5);
        assert_eq!(ConfidenceCalculator::initial_confidence(6, 0, 0), 0.6);
    }

    #[test]
    fn test_initial_confidence_penalties() {
        // 0.5 - 2*0.1 - 1*0.05 = 0.25
        let conf = ConfidenceCalculator::initial_confidence(4, 2, 1);
        assert!((conf - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_initial_confidence_floor() {
        // Heavy penalties clamp at 0.1
        let conf = ConfidenceCalculator::initial_confidence(1, 5, 5);
        assert!((conf - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_critic_rules() {
        let rejected = ConfidenceCalculator::apply_critic(0.6, CriticVerdict::Reject, 0.5);
        assert!((rejected - 0.18).abs() < 1e-9);

        // Challenge takes the minimum of current and recommended
        let challenged = ConfidenceCalculator::apply_critic(0.6, CriticVerdict::Challenge, 0.28);
        assert!((challenged - 0.28).abs() < 1e-9);
        let unchanged = ConfidenceCalculator::apply_critic(0.2, CriticVerdict::Challenge, 0.5);
        assert!((unchanged - 0.2).abs() < 1e-9);

        let accepted = ConfidenceCalculator::apply_critic(0.6, CriticVerdict::Accept, 0.0);
        assert!((accepted - 0.66).abs() < 1e-9);
        let capped = ConfidenceCalculator::apply_critic(0.95, CriticVerdict::Accept, 0.0);
        assert!((capped - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_probe_rules() {
        let confirmed = ConfidenceCalculator::apply_probe(0.28, ProbeOutcome::Confirmed);
        assert!((confirmed - 0.424).abs() < 1e-9);

        let falsified = ConfidenceCalculator::apply_probe(0.6, ProbeOutcome::Falsified);
        assert!((falsified - 0.3).abs() < 1e-9);

        let inconclusive = ConfidenceCalculator::apply_probe(0.6, ProbeOutcome::Inconclusive);
        assert!((inconclusive - 0.57).abs() < 1e-9);
    }

    #[test]
    fn test_probe_monotonicity() {
        // Confirmed probes never decrease confidence; falsified strictly decrease
        for current in [0.1, 0.3, 0.5, 0.7, 0.9] {
            assert!(ConfidenceCalculator::apply_probe(current, ProbeOutcome::Confirmed) >= current);
            assert!(ConfidenceCalculator::apply_probe(current, ProbeOutcome::Falsified) < current);
        }
    }

    #[test]
    fn test_confirmed_chain_matches_scenario() {
        // challenge to 0.28, replay 200, then 401 on auth variation
        let after_critic = ConfidenceCalculator::apply_critic(0.35, CriticVerdict::Challenge, 0.28);
        assert!((after_critic - 0.28).abs() < 1e-9);
        let after_replay = ConfidenceCalculator::apply_probe(after_critic, ProbeOutcome::Confirmed);
        assert!((after_replay - 0.424).abs() < 1e-9);
        let after_auth = ConfidenceCalculator::apply_probe(after_replay, ProbeOutcome::Confirmed);
        assert!((after_auth - 0.5392).abs() < 1e-9);
    }
}
