//! Distillation — teacher-to-student pattern transfer.
//!
//! Given a stronger teacher model and a weaker student, run both on one
//! capability category, and when the teacher is materially ahead, mine its
//! passing transcripts for behavioral patterns, synthesize a level-1
//! prosthetic prompt from them, and re-test the student with the prompt
//! installed. A non-improving attempt is still persisted for audit; the
//! prosthetic stays unverified either way until a dedicated verification
//! run confirms it.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::battery::{BatteryExecutor, CancelToken, ComboTestResult, RunRequest, TestTranscript};
use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::prosthetic::{ProstheticEdit, ProstheticManager};
use crate::registry::{Category, TestMode};

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// One distillation run: teacher, student, and the capability category to
/// transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillationRequest {
    pub teacher_model_id: String,
    pub student_model_id: String,
    pub capability: Category,
}

/// Ephemeral output of one distillation run. Only the prosthetic version
/// it may produce is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillationResult {
    pub teacher_model_id: String,
    pub student_model_id: String,
    pub capability: Category,
    pub teacher_score: f64,
    pub student_score_before: f64,
    pub student_score_after: f64,
    /// Behavioral patterns mined from the teacher's passing transcripts.
    pub patterns: Vec<String>,
    pub prosthetic_generated: bool,
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Pattern extraction
// ---------------------------------------------------------------------------

/// Pluggable heuristic that turns passing transcripts into teachable
/// behavioral patterns.
pub trait PatternExtractor: Send + Sync {
    fn extract(&self, transcripts: &[TestTranscript]) -> Vec<String>;
}

/// Default heuristics: tool-call ordering and argument completeness.
pub struct DefaultExtractor;

impl PatternExtractor for DefaultExtractor {
    fn extract(&self, transcripts: &[TestTranscript]) -> Vec<String> {
        // BTreeSet keeps the pattern list deterministic across runs.
        let mut patterns = BTreeSet::new();
        for transcript in transcripts.iter().filter(|t| t.passed) {
            let calls = &transcript.tool_calls;
            if let Some(first) = calls.first() {
                patterns.insert(format!("Start by calling `{}`.", first.name));
            }
            if calls.len() > 1 {
                let sequence: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                patterns.insert(format!(
                    "Sequence tool calls in order: {}.",
                    sequence.join(" then ")
                ));
            }
            for call in calls {
                if !call.arguments.is_empty() {
                    let mut keys: Vec<&str> =
                        call.arguments.keys().map(String::as_str).collect();
                    keys.sort_unstable();
                    patterns.insert(format!(
                        "When calling `{}`, always provide: {}.",
                        call.name,
                        keys.join(", ")
                    ));
                }
            }
            if calls.is_empty() && !transcript.response_content.trim().is_empty() {
                patterns.insert(
                    "Answer directly when no tool is needed; do not call tools speculatively."
                        .to_string(),
                );
            }
        }
        patterns.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs the distillation workflow end to end.
pub struct DistillationEngine {
    executor: Arc<BatteryExecutor>,
    manager: Arc<ProstheticManager>,
    extractor: Arc<dyn PatternExtractor>,
    config: EngineConfig,
}

impl DistillationEngine {
    pub fn new(
        executor: Arc<BatteryExecutor>,
        manager: Arc<ProstheticManager>,
        extractor: Arc<dyn PatternExtractor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor,
            manager,
            extractor,
            config,
        }
    }

    pub async fn run(&self, request: &DistillationRequest) -> Result<DistillationResult> {
        if request.teacher_model_id.trim().is_empty()
            || request.student_model_id.trim().is_empty()
        {
            return Err(EngineError::configuration(
                "distillation requires both a teacher and a student model",
            ));
        }
        if request.teacher_model_id == request.student_model_id {
            return Err(EngineError::configuration(
                "teacher and student must be distinct models",
            ));
        }

        let teacher_run = self
            .score_category(&request.teacher_model_id, request.capability, true, None)
            .await?;
        let student_run = self
            .score_category(&request.student_model_id, request.capability, false, None)
            .await?;

        let teacher_score = category_score_of(&teacher_run, request.capability);
        let student_score_before = category_score_of(&student_run, request.capability);

        let mut result = DistillationResult {
            teacher_model_id: request.teacher_model_id.clone(),
            student_model_id: request.student_model_id.clone(),
            capability: request.capability,
            teacher_score,
            student_score_before,
            student_score_after: student_score_before,
            patterns: Vec::new(),
            prosthetic_generated: false,
            success: false,
        };

        // Nothing to distill unless the teacher is materially ahead.
        if teacher_score - student_score_before < self.config.distillation_margin {
            log::info!(
                "distillation skipped for '{}': teacher {} vs student {} under margin {}",
                request.student_model_id,
                teacher_score,
                student_score_before,
                self.config.distillation_margin
            );
            return Ok(result);
        }

        result.patterns = self.extractor.extract(&teacher_run.transcripts);
        if result.patterns.is_empty() {
            log::info!(
                "no extractable patterns in teacher '{}' transcripts",
                request.teacher_model_id
            );
            return Ok(result);
        }

        let prompt = synthesize_prompt(request.capability, &result.patterns);
        let probes_fixed: Vec<String> = student_run
            .test_results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.id.clone())
            .collect();

        // Persist the attempt before the re-test so a non-improving run
        // still leaves an auditable version. Verification is a separate,
        // dedicated re-run; it is never set here.
        self.manager
            .create_or_edit(ProstheticEdit {
                model_id: request.student_model_id.clone(),
                prompt: prompt.clone(),
                level: super::MIN_LEVEL,
                probes_fixed,
                learned_from_model: Some(request.teacher_model_id.clone()),
            })
            .await?;
        result.prosthetic_generated = true;

        let retest = self
            .score_category(
                &request.student_model_id,
                request.capability,
                false,
                Some(prompt),
            )
            .await?;
        result.student_score_after = category_score_of(&retest, request.capability);
        result.success = result.student_score_after > result.student_score_before;
        Ok(result)
    }

    async fn score_category(
        &self,
        model_id: &str,
        capability: Category,
        collect_transcripts: bool,
        system_prompt: Option<String>,
    ) -> Result<ComboTestResult> {
        let request = RunRequest {
            main_model_id: model_id.to_string(),
            executor_model_id: None,
            mode: TestMode::Manual,
            manual_categories: vec![capability],
            system_prompt,
            collect_transcripts,
        };
        self.executor.run(&request, &CancelToken::new()).await
    }
}

/// Score of one category out of a run, zero when untested.
fn category_score_of(run: &ComboTestResult, capability: Category) -> f64 {
    run.category_scores
        .iter()
        .find(|c| c.category == capability)
        .map(|c| c.score as f64)
        .unwrap_or(0.0)
}

/// Turn mined patterns into level-1 prosthetic text.
fn synthesize_prompt(capability: Category, patterns: &[String]) -> String {
    let mut prompt = format!(
        "When handling {} tasks, follow these practices:\n",
        capability.id().replace('_', " ")
    );
    for pattern in patterns {
        prompt.push_str("- ");
        prompt.push_str(pattern);
        prompt.push('\n');
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::tests::{competent_invoker, executor_with, tool_response, ScriptedInvoker};
    use crate::interfaces::invocation::ModelResponse;
    use crate::interfaces::store::{EvalStore, MemoryStore};
    use crate::resolver::ObservedCall;
    use serde_json::json;
    use std::collections::HashMap;

    fn transcript(id: &str, passed: bool, calls: Vec<ObservedCall>) -> TestTranscript {
        TestTranscript {
            test_id: id.to_string(),
            prompt: String::new(),
            response_content: String::new(),
            tool_calls: calls,
            passed,
        }
    }

    #[test]
    fn test_extractor_orders_and_argument_completeness() {
        let mut args = HashMap::new();
        args.insert("filepath".to_string(), json!("README.md"));
        let transcripts = vec![transcript(
            "multi_tool.1",
            true,
            vec![
                ObservedCall::new("read_file", args.clone()),
                ObservedCall::new("write_file", args),
            ],
        )];
        let patterns = DefaultExtractor.extract(&transcripts);
        assert!(patterns.iter().any(|p| p.contains("read_file then write_file")));
        assert!(patterns.iter().any(|p| p.contains("always provide: filepath")));
    }

    #[test]
    fn test_extractor_skips_failing_transcripts() {
        let transcripts = vec![transcript(
            "multi_tool.1",
            false,
            vec![ObservedCall::bare("read_file")],
        )];
        assert!(DefaultExtractor.extract(&transcripts).is_empty());
    }

    #[test]
    fn test_prompt_synthesis() {
        let prompt = synthesize_prompt(
            Category::MultiTool,
            &["Start by calling `read_file`.".to_string()],
        );
        assert!(prompt.starts_with("When handling multi tool tasks"));
        assert!(prompt.contains("- Start by calling `read_file`."));
    }

    #[tokio::test]
    async fn test_validation_rejects_same_model() {
        let executor = Arc::new(executor_with(Arc::new(competent_invoker())));
        let manager = Arc::new(ProstheticManager::new(Arc::new(MemoryStore::new())));
        let engine = DistillationEngine::new(
            executor,
            manager,
            Arc::new(DefaultExtractor),
            EngineConfig::default(),
        );
        let err = engine
            .run(&DistillationRequest {
                teacher_model_id: "same".to_string(),
                student_model_id: "same".to_string(),
                capability: Category::SingleTool,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_under_margin_generates_nothing() {
        // The same invoker backs both models, so scores are equal and the
        // margin check stops the workflow.
        let invoker: Arc<ScriptedInvoker> = Arc::new(competent_invoker());
        invoker.script(
            "src/main.rs",
            tool_response("read_file", &[("filepath", json!("src/main.rs"))]),
        );
        invoker.script(
            "tests",
            tool_response("list_directory", &[("directory", json!("tests"))]),
        );
        let executor = Arc::new(executor_with(invoker));
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(ProstheticManager::new(store.clone()));
        let engine = DistillationEngine::new(
            executor,
            manager,
            Arc::new(DefaultExtractor),
            EngineConfig::default(),
        );

        let result = engine
            .run(&DistillationRequest {
                teacher_model_id: "teacher".to_string(),
                student_model_id: "student".to_string(),
                capability: Category::SingleTool,
            })
            .await
            .unwrap();

        assert!(!result.prosthetic_generated);
        assert!(!result.success);
        assert_eq!(result.teacher_score, result.student_score_before);
        assert!(store.get_prosthetic("student").await.unwrap().is_none());
    }
}
