//! Stateful degradation tester — does competence survive long sessions?
//!
//! Builds a synthetic conversation: the instruction turn, a canned
//! acknowledgement, filler turns drawn round-robin from a fixed pool, and
//! the probe's real prompt appended last. The model is evaluated only at
//! the configured checkpoint turns, not every turn, to bound cost.
//! Checkpoints run strictly in turn order because each later checkpoint's
//! transcript subsumes the earlier ones.
//!
//! The analysis keeps evaluating past the first failure: a model that
//! breaks at turn 25 and recovers at 50 is a different animal from one
//! that stays broken, and the curve shows the difference even though
//! `breakpoint_turn` stays at the first failed turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::interfaces::invocation::{ChatMessage, InvokeOptions, ModelInvoker};
use crate::registry::evaluators::{evaluate_test, EvaluatorRegistry};
use crate::registry::{ProbeResult, TestDefinition};
use crate::resolver::Resolver;

/// Benign filler exchanges, cycled round-robin between the instruction
/// turn and the probe.
const FILLER_POOL: &[(&str, &str)] = &[
    (
        "What's the difference between a Vec and a slice?",
        "A Vec owns its heap allocation and can grow; a slice is a borrowed view into contiguous memory.",
    ),
    (
        "Remind me what a merge commit is.",
        "A commit with two parents, recording the merge of one branch into another.",
    ),
    (
        "Is TOML or YAML better for config files?",
        "Both work; TOML is simpler and less ambiguous, YAML supports more structure.",
    ),
    (
        "How do I check disk usage on Linux?",
        "Use `df -h` for filesystems and `du -sh <dir>` for a directory total.",
    ),
    (
        "What does idempotent mean for an API endpoint?",
        "Calling it multiple times has the same effect as calling it once.",
    ),
];

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One evaluated checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointResult {
    pub turn: u32,
    pub result: ProbeResult,
}

/// Outcome of one stateful run across all checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatefulTestResult {
    /// The probe id exercised, e.g. `instruction_retention.1`.
    pub test_type: String,
    /// Score at each evaluated checkpoint turn.
    pub compliance_at_turn: BTreeMap<u32, u8>,
    /// Checkpoint scores in turn order.
    pub degradation_curve: Vec<u8>,
    /// First turn whose check failed; `None` means no degradation.
    pub breakpoint_turn: Option<u32>,
    /// True iff no breakpoint exists.
    pub passed: bool,
}

/// Walk checkpoint results in turn order: record every score, set the
/// breakpoint to the first failure, and never move it for later turns.
pub fn analyze(checkpoints: &[CheckpointResult], test_type: &str) -> StatefulTestResult {
    let mut ordered: Vec<&CheckpointResult> = checkpoints.iter().collect();
    ordered.sort_by_key(|c| c.turn);

    let mut compliance_at_turn = BTreeMap::new();
    let mut degradation_curve = Vec::with_capacity(ordered.len());
    let mut breakpoint_turn = None;

    for checkpoint in ordered {
        compliance_at_turn.insert(checkpoint.turn, checkpoint.result.score);
        degradation_curve.push(checkpoint.result.score);
        if !checkpoint.result.passed && breakpoint_turn.is_none() {
            breakpoint_turn = Some(checkpoint.turn);
        }
    }

    StatefulTestResult {
        test_type: test_type.to_string(),
        compliance_at_turn,
        degradation_curve,
        passed: breakpoint_turn.is_none(),
        breakpoint_turn,
    }
}

// ---------------------------------------------------------------------------
// Tester
// ---------------------------------------------------------------------------

/// Runs checkpointed long-session probes against one model.
pub struct StatefulTester {
    invoker: Arc<dyn ModelInvoker>,
    resolver: Arc<Resolver>,
    evaluators: Arc<EvaluatorRegistry>,
    config: EngineConfig,
}

impl StatefulTester {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        resolver: Arc<Resolver>,
        evaluators: Arc<EvaluatorRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            invoker,
            resolver,
            evaluators,
            config,
        }
    }

    /// Run one probe at every configured checkpoint.
    ///
    /// The instruction turn comes from the probe's own history (turn 1 and
    /// its canned acknowledgement); the probe prompt is always the final
    /// user turn of the simulated transcript.
    pub async fn run(&self, model_id: &str, probe: &TestDefinition) -> Result<StatefulTestResult> {
        let total_turns = self.config.stateful_total_turns;
        let mut checkpoints = Vec::new();

        for &turn in &self.config.stateful_checkpoints {
            if turn > total_turns {
                continue;
            }
            let messages = self.build_conversation(probe, turn);
            let response = self
                .invoker
                .invoke(
                    model_id,
                    &messages,
                    &self.resolver.catalog().capabilities,
                    &InvokeOptions::default(),
                )
                .await?;
            let result = evaluate_test(
                probe,
                &response,
                &self.resolver,
                &self.evaluators,
                self.config.resolver_min_confidence,
            );
            log::debug!(
                "stateful checkpoint turn {} for '{}': passed={}",
                turn,
                model_id,
                result.passed
            );
            checkpoints.push(CheckpointResult { turn, result });
        }

        Ok(analyze(&checkpoints, &probe.id))
    }

    /// Simulated transcript for a checkpoint: instruction exchange, filler
    /// up to `checkpoint_turn - 1`, probe prompt last.
    fn build_conversation(&self, probe: &TestDefinition, checkpoint_turn: u32) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = probe.history.clone();

        // Turn 1 is the instruction exchange from history; filler fills
        // turns 2..checkpoint, the probe prompt is the checkpoint turn.
        let instruction_turns = (probe.history.len() as u32 / 2).max(1);
        let filler_turns = checkpoint_turn.saturating_sub(instruction_turns + 1);

        for i in 0..filler_turns {
            let (user, assistant) = FILLER_POOL[i as usize % FILLER_POOL.len()];
            messages.push(ChatMessage::user(user));
            messages.push(ChatMessage::assistant(assistant));
        }
        messages.push(ChatMessage::user(probe.prompt.clone()));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CapabilityCatalog;
    use crate::interfaces::invocation::ModelResponse;
    use crate::registry::battery_data;
    use crate::registry::TestRegistry;
    use async_trait::async_trait;

    fn passing(turn: u32) -> CheckpointResult {
        CheckpointResult {
            turn,
            result: ProbeResult::pass("instruction_retention.1", "ok"),
        }
    }

    fn failing(turn: u32) -> CheckpointResult {
        CheckpointResult {
            turn,
            result: ProbeResult::fail("instruction_retention.1", "suffix dropped"),
        }
    }

    #[test]
    fn test_analyze_no_degradation() {
        let result = analyze(
            &[passing(5), passing(10), passing(25), passing(50)],
            "instruction_retention.1",
        );
        assert!(result.passed);
        assert_eq!(result.breakpoint_turn, None);
        assert_eq!(result.degradation_curve, vec![100, 100, 100, 100]);
    }

    #[test]
    fn test_analyze_breakpoint_is_first_failure() {
        // Complies at 5 and 10, drops the suffix at 25; turn 50 is still
        // evaluated and recorded even after the breakpoint.
        let result = analyze(
            &[passing(5), passing(10), failing(25), failing(50)],
            "instruction_retention.1",
        );
        assert!(!result.passed);
        assert_eq!(result.breakpoint_turn, Some(25));
        assert_eq!(result.degradation_curve, vec![100, 100, 0, 0]);
        assert_eq!(result.compliance_at_turn[&50], 0);
    }

    #[test]
    fn test_analyze_recovery_does_not_move_breakpoint() {
        let result = analyze(
            &[passing(5), failing(10), passing(25)],
            "instruction_retention.1",
        );
        assert_eq!(result.breakpoint_turn, Some(10));
        assert_eq!(result.degradation_curve, vec![100, 0, 100]);
    }

    /// Complies while the transcript is short, drops the suffix once it
    /// grows past a threshold.
    struct DecayingModel {
        decay_after_messages: usize,
    }

    #[async_trait]
    impl ModelInvoker for DecayingModel {
        async fn invoke(
            &self,
            _model_id: &str,
            messages: &[ChatMessage],
            _tools: &[crate::catalog::Capability],
            _options: &InvokeOptions,
        ) -> Result<ModelResponse> {
            let content = if messages.len() <= self.decay_after_messages {
                "A Makefile describes build targets and their dependencies. All clear."
            } else {
                "A Makefile describes build targets and their dependencies."
            };
            Ok(ModelResponse {
                content: content.to_string(),
                tool_calls: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_run_detects_decay_at_checkpoint() {
        let registry = TestRegistry::builtin();
        let probe = registry.get("instruction_retention.1").unwrap().clone();
        assert!(probe.history[0]
            .content
            .contains(battery_data::retention_instruction()));

        let tester = StatefulTester::new(
            // Turn 10's transcript has 19 messages (2 instruction + 16
            // filler + probe); decay past that hits the turn-25 checkpoint.
            Arc::new(DecayingModel {
                decay_after_messages: 19,
            }),
            Arc::new(Resolver::new(
                Arc::new(CapabilityCatalog::default_catalog()),
                50,
            )),
            Arc::new(EvaluatorRegistry::builtin()),
            EngineConfig::default(),
        );

        let result = tester.run("decaying", &probe).await.unwrap();
        assert_eq!(result.breakpoint_turn, Some(25));
        assert_eq!(result.degradation_curve, vec![100, 100, 0, 0]);
        assert!(!result.passed);
    }
}
