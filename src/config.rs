//! Engine configuration.
//!
//! Every hand-tuned constant in the evaluation pipeline lives here as a
//! default rather than a hard-coded value: the qualifying-gate test set,
//! alert thresholds and dedup windows, per-mode invocation timeouts, and
//! the stateful checkpoint schedule. Callers construct one `EngineConfig`
//! and share it across components.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::TestMode;

/// Top-level configuration for the evaluation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ids of the qualifying-gate tests, run before any full battery.
    pub gate_test_ids: Vec<String>,

    /// Minimum resolver confidence for a tool call to count as attributed
    /// to the expected capability.
    pub resolver_min_confidence: u8,

    /// Failure-pattern count at which a threshold-breach alert fires.
    pub alert_threshold: u64,

    /// Multiplier over `alert_threshold` at which alerts escalate to
    /// `action_required`.
    pub action_required_multiplier: u64,

    /// Per-model failure count at which a recurring-failure alert fires.
    pub recurring_failure_threshold: u64,

    /// Seconds between background scans of the failure patterns.
    pub observer_scan_interval_secs: u64,

    /// Seconds within which a repeated alert for the same key is suppressed.
    pub alert_dedup_window_secs: u64,

    /// Size of the in-memory rolling alert buffer.
    pub alert_buffer_size: usize,

    /// Default simulated conversation length for stateful probes.
    pub stateful_total_turns: u32,

    /// Turns at which stateful probes are checkpointed.
    pub stateful_checkpoints: Vec<u32>,

    /// Context size requested when loading a model for evaluation.
    pub model_context_size: u32,

    /// Minimum teacher-over-student margin (in score points) before a
    /// distillation run synthesizes a prosthetic.
    pub distillation_margin: f64,

    /// Model-invocation timeout for quick-ish modes, in seconds.
    pub invoke_timeout_fast_secs: u64,

    /// Model-invocation timeout for deep modes, in seconds.
    pub invoke_timeout_slow_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gate_test_ids: vec![
                "CQG-1".to_string(),
                "CQG-2".to_string(),
                "CQG-3".to_string(),
            ],
            resolver_min_confidence: 50,
            alert_threshold: 5,
            action_required_multiplier: 2,
            recurring_failure_threshold: 10,
            observer_scan_interval_secs: 30,
            alert_dedup_window_secs: 3600,
            alert_buffer_size: 100,
            stateful_total_turns: 50,
            stateful_checkpoints: vec![5, 10, 25, 50],
            model_context_size: 8192,
            distillation_margin: 15.0,
            invoke_timeout_fast_secs: 30,
            invoke_timeout_slow_secs: 120,
        }
    }
}

impl EngineConfig {
    /// Invocation timeout for a given test mode. Deep and optimization
    /// batteries get the slow budget; everything else the fast one.
    pub fn invoke_timeout(&self, mode: TestMode) -> Duration {
        match mode {
            TestMode::Deep | TestMode::Optimization => {
                Duration::from_secs(self.invoke_timeout_slow_secs)
            }
            _ => Duration::from_secs(self.invoke_timeout_fast_secs),
        }
    }

    /// Pattern count at which an alert escalates to `action_required`.
    pub fn action_required_threshold(&self) -> u64 {
        self.alert_threshold * self.action_required_multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.gate_test_ids.len(), 3);
        assert_eq!(cfg.alert_threshold, 5);
        assert_eq!(cfg.action_required_threshold(), 10);
        assert_eq!(cfg.stateful_checkpoints, vec![5, 10, 25, 50]);
    }

    #[test]
    fn test_invoke_timeout_by_mode() {
        let cfg = EngineConfig::default();
        assert_eq!(
            cfg.invoke_timeout(TestMode::Quick),
            Duration::from_secs(30)
        );
        assert_eq!(
            cfg.invoke_timeout(TestMode::Deep),
            Duration::from_secs(120)
        );
    }
}
