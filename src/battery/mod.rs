//! Battery executor — runs the qualifying gate and the full test battery.
//!
//! Each evaluation run walks a small state machine:
//! `pending → qualifying → (disqualified | full_battery) → scoring →
//! complete`, with `cancelled` and `failed` as terminal exits. The
//! qualifying gate is a fixed, cheap test set; any gate failure
//! disqualifies the run before the full battery spends real compute.
//!
//! A single test's error is contained — it scores `passed=false, score=0`
//! with the error in `details` and the battery continues. Only a
//! transport-level failure (model unreachable) ends the run early, and it
//! does so with `status = failed` rather than an exception, so callers
//! always get a result object.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::failure::{FailureEntry, FailureLog};
use crate::interfaces::broadcast::EventChannel;
use crate::interfaces::invocation::{ChatMessage, InvokeOptions, ModelInvoker, ModelResponse};
use crate::interfaces::manager::ModelResourceManager;
use crate::interfaces::store::EvalStore;
use crate::registry::evaluators::{evaluate_test, EvaluatorRegistry};
use crate::registry::{Category, Expectation, ProbeResult, TestDefinition, TestMode, TestRegistry};
use crate::resolver::{ObservedCall, Resolver};
use crate::scoring::{self, CategoryScore, TierScore};

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Lifecycle of one evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Qualifying,
    Disqualified,
    FullBattery,
    Scoring,
    Complete,
    Cancelled,
    Failed,
}

/// Cooperative cancellation checkpoint: honored between tests, never
/// mid-call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// What to evaluate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub main_model_id: String,

    /// When set, the run is a combo: the main model plans, the executor
    /// makes the tool calls.
    #[serde(default)]
    pub executor_model_id: Option<String>,

    pub mode: TestMode,

    /// Category list for `TestMode::Manual`; ignored otherwise.
    #[serde(default)]
    pub manual_categories: Vec<Category>,

    /// Optional system prompt prepended to every test (prosthetic
    /// verification and distillation re-runs use this).
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Keep per-test transcripts on the result (distillation needs them).
    #[serde(default)]
    pub collect_transcripts: bool,
}

impl RunRequest {
    pub fn single(model_id: &str, mode: TestMode) -> Self {
        Self {
            main_model_id: model_id.to_string(),
            executor_model_id: None,
            mode,
            manual_categories: Vec::new(),
            system_prompt: None,
            collect_transcripts: false,
        }
    }
}

/// Raw record of one executed test, kept when transcripts are requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestTranscript {
    pub test_id: String,
    pub prompt: String,
    pub response_content: String,
    pub tool_calls: Vec<ObservedCall>,
    pub passed: bool,
}

/// Result of one evaluation run. One row per (main, executor) pair in the
/// store, created on first run and updated on re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboTestResult {
    pub main_model_id: String,
    pub executor_model_id: Option<String>,
    pub status: RunStatus,
    pub qualifying_gate_passed: bool,
    /// `"qualifying_gate"` when the gate disqualified the run.
    pub disqualified_at: Option<String>,
    pub overall_score: f64,
    pub tier_scores: Vec<TierScore>,
    pub category_scores: Vec<CategoryScore>,
    /// Gate results, recorded even when the full battery never ran.
    pub gate_results: Vec<ProbeResult>,
    /// Full-battery results. Empty when disqualified at the gate.
    pub test_results: Vec<ProbeResult>,
    /// Combo runs only: share of tests where the planner named the right
    /// capability.
    pub main_score: Option<f64>,
    /// Combo runs only: share of attributable tool-calling tests passed.
    pub executor_score: Option<f64>,
    /// True when the main model contributed no attributable decision.
    pub main_excluded: bool,
    /// False when the store was unavailable; the result is then only in
    /// memory.
    pub persisted: bool,
    /// Transport error message when `status == failed`.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transcripts: Vec<TestTranscript>,
}

impl ComboTestResult {
    pub(crate) fn started(request: &RunRequest) -> Self {
        Self {
            main_model_id: request.main_model_id.clone(),
            executor_model_id: request.executor_model_id.clone(),
            status: RunStatus::Pending,
            qualifying_gate_passed: false,
            disqualified_at: None,
            overall_score: 0.0,
            tier_scores: Vec::new(),
            category_scores: Vec::new(),
            gate_results: Vec::new(),
            test_results: Vec::new(),
            main_score: None,
            executor_score: None,
            main_excluded: false,
            persisted: false,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            transcripts: Vec::new(),
        }
    }
}

/// Outcome of dispatching one test to the model(s) under evaluation.
struct TestExecution {
    result: ProbeResult,
    transcript: TestTranscript,
    /// Combo runs: Some(true) if the planner named the expected tool,
    /// Some(false) if it named something else, None when the decision is
    /// not attributable to the planner (loop-level tests).
    planner_correct: Option<bool>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs evaluation batteries. One executor is shared by all runs; each
/// `run` call is an independent unit of concurrency.
pub struct BatteryExecutor {
    registry: Arc<TestRegistry>,
    evaluators: Arc<EvaluatorRegistry>,
    resolver: Arc<Resolver>,
    invoker: Arc<dyn ModelInvoker>,
    resources: Arc<ModelResourceManager>,
    store: Arc<dyn EvalStore>,
    failures: Arc<FailureLog>,
    events: EventChannel,
    config: EngineConfig,
}

impl BatteryExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TestRegistry>,
        evaluators: Arc<EvaluatorRegistry>,
        resolver: Arc<Resolver>,
        invoker: Arc<dyn ModelInvoker>,
        resources: Arc<ModelResourceManager>,
        store: Arc<dyn EvalStore>,
        failures: Arc<FailureLog>,
        events: EventChannel,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            evaluators,
            resolver,
            invoker,
            resources,
            store,
            failures,
            events,
            config,
        }
    }

    pub fn registry(&self) -> &TestRegistry {
        &self.registry
    }

    /// Execute one evaluation run: qualifying gate, then the full battery
    /// for the requested mode, then scoring.
    pub async fn run(&self, request: &RunRequest, cancel: &CancelToken) -> Result<ComboTestResult> {
        self.validate(request)?;

        let mut run = ComboTestResult::started(request);
        if let Err(e) = self.ensure_models_loaded(request).await {
            return Ok(self.fail_run(run, e));
        }
        run.status = RunStatus::Qualifying;
        self.publish_status(request, run.status);

        // Qualifying gate: any failure disqualifies before the battery.
        for test in self.registry.gate_tests(&self.config.gate_test_ids) {
            match self.execute_test(request, test).await {
                Ok(execution) => {
                    let passed = execution.result.passed;
                    if !passed {
                        self.record_failure(request, &execution.result).await;
                    }
                    run.gate_results.push(execution.result);
                    if !passed {
                        run.status = RunStatus::Disqualified;
                        run.disqualified_at = Some("qualifying_gate".to_string());
                        run.finished_at = Some(Utc::now());
                        self.publish_status(request, run.status);
                        self.persist(&mut run).await;
                        return Ok(run);
                    }
                }
                Err(e) => return Ok(self.fail_run(run, e)),
            }
        }
        run.qualifying_gate_passed = true;

        // Full battery, registry order, cancellation between tests.
        run.status = RunStatus::FullBattery;
        self.publish_status(request, run.status);

        let categories = request.mode.categories(&request.manual_categories);
        let tests = self.registry.tests_for_categories(&categories);
        let total = tests.len();
        let mut planner_decisions: Vec<bool> = Vec::new();

        for (index, test) in tests.into_iter().enumerate() {
            if cancel.is_cancelled() {
                run.status = RunStatus::Cancelled;
                break;
            }

            let execution = match self.execute_test(request, test).await {
                Ok(execution) => execution,
                Err(e) => return Ok(self.fail_run(run, e)),
            };

            if !execution.result.passed {
                self.record_failure(request, &execution.result).await;
            }
            if let Some(correct) = execution.planner_correct {
                planner_decisions.push(correct);
            }
            if request.collect_transcripts {
                run.transcripts.push(execution.transcript);
            }

            self.events.publish(
                "run.progress",
                json!({
                    "model": request.main_model_id,
                    "test": execution.result.id,
                    "passed": execution.result.passed,
                    "done": index + 1,
                    "total": total,
                }),
            );
            run.test_results.push(execution.result);
        }

        // Scoring. A cancelled run still scores its partial results.
        let cancelled = run.status == RunStatus::Cancelled;
        run.status = RunStatus::Scoring;
        let report = scoring::aggregate(&run.test_results);
        run.category_scores = report.category_scores;
        run.tier_scores = report.tier_scores;
        run.overall_score = report.composite;

        if request.executor_model_id.is_some() {
            self.attribute_combo(&mut run, &planner_decisions);
        }

        run.status = if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Complete
        };
        run.finished_at = Some(Utc::now());
        self.persist(&mut run).await;
        self.publish_status(request, run.status);
        Ok(run)
    }

    /// Execute a specific list of probes (gate or battery) outside the run
    /// state machine. Prosthetic verification and distillation re-tests
    /// use this; results are not persisted or logged as failures.
    pub async fn run_probes(
        &self,
        request: &RunRequest,
        test_ids: &[String],
    ) -> Result<Vec<ProbeResult>> {
        self.ensure_models_loaded(request).await?;
        let mut results = Vec::with_capacity(test_ids.len());
        for id in test_ids {
            let test = self
                .registry
                .get(id)
                .ok_or_else(|| EngineError::not_found(format!("test '{}'", id)))?;
            let execution = self.execute_test(request, test).await?;
            results.push(execution.result);
        }
        Ok(results)
    }

    /// Load every model the run touches before the first invocation.
    async fn ensure_models_loaded(&self, request: &RunRequest) -> Result<()> {
        self.resources
            .ensure_loaded(&request.main_model_id, self.config.model_context_size)
            .await?;
        if let Some(ref executor) = request.executor_model_id {
            self.resources
                .ensure_loaded(executor, self.config.model_context_size)
                .await?;
        }
        Ok(())
    }

    /// Reject bad requests before anything runs.
    fn validate(&self, request: &RunRequest) -> Result<()> {
        if request.main_model_id.trim().is_empty() {
            return Err(EngineError::configuration("main model id is empty"));
        }
        if request.mode == TestMode::Manual && request.manual_categories.is_empty() {
            return Err(EngineError::configuration(
                "manual mode requires at least one category",
            ));
        }
        if let Some(ref executor) = request.executor_model_id {
            if executor == &request.main_model_id {
                return Err(EngineError::configuration(
                    "combo requires distinct main and executor models",
                ));
            }
        }
        Ok(())
    }

    /// Dispatch one test and evaluate the response.
    ///
    /// Returns `Err` only for transport failures; anything else degrades
    /// to a failed `ProbeResult`.
    async fn execute_test(
        &self,
        request: &RunRequest,
        test: &TestDefinition,
    ) -> Result<TestExecution> {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.extend(test.history.iter().cloned());
        messages.push(ChatMessage::user(test.prompt.clone()));

        let (response, planner_correct) = match request.executor_model_id {
            Some(ref executor) => {
                let (response, correct) = self
                    .invoke_combo(&request.main_model_id, executor, &messages, test, request.mode)
                    .await?;
                (response, correct)
            }
            None => (
                self.invoke_checked(&request.main_model_id, &messages, true, request.mode, test)
                    .await?,
                None,
            ),
        };

        let result = match response {
            InvokeOutcome::Response(ref response) => evaluate_test(
                test,
                response,
                &self.resolver,
                &self.evaluators,
                self.config.resolver_min_confidence,
            ),
            InvokeOutcome::TimedOut => ProbeResult::fail(
                &test.id,
                format!(
                    "timed out after {}s",
                    self.config.invoke_timeout(request.mode).as_secs()
                ),
            ),
            InvokeOutcome::Errored(ref e) => {
                ProbeResult::fail(&test.id, format!("probe execution error: {}", e))
            }
        };

        let (content, tool_calls) = match response {
            InvokeOutcome::Response(r) => (r.content, r.tool_calls),
            InvokeOutcome::TimedOut | InvokeOutcome::Errored(_) => (String::new(), Vec::new()),
        };

        Ok(TestExecution {
            transcript: TestTranscript {
                test_id: test.id.clone(),
                prompt: test.prompt.clone(),
                response_content: content,
                tool_calls,
                passed: result.passed,
            },
            result,
            planner_correct,
        })
    }

    /// Combo dispatch: the main model plans without tools, the executor
    /// acts with tools and the plan in context.
    async fn invoke_combo(
        &self,
        main: &str,
        executor: &str,
        messages: &[ChatMessage],
        test: &TestDefinition,
        mode: TestMode,
    ) -> Result<(InvokeOutcome, Option<bool>)> {
        let mut plan_messages = messages.to_vec();
        plan_messages.push(ChatMessage::user(
            "Before anything runs: state which tool (if any) should be used and why. \
             Do not call tools yourself.",
        ));

        let plan = self
            .invoke_checked(main, &plan_messages, false, mode, test)
            .await?;

        // Attribute the tool-selection decision to the planner when the
        // test expects a specific tool; everything else is a loop-level
        // decision.
        let planner_correct = match (&plan, &test.expectation) {
            (InvokeOutcome::Response(plan), Expectation::ToolCall { expected }) => {
                let text = plan.content.to_lowercase();
                if text.trim().is_empty() {
                    None
                } else {
                    Some(text.contains(&expected.tool.to_lowercase()))
                }
            }
            _ => None,
        };

        let mut exec_messages = messages.to_vec();
        if let InvokeOutcome::Response(ref plan) = plan {
            if !plan.content.trim().is_empty() {
                exec_messages.push(ChatMessage::assistant(format!(
                    "Plan: {}",
                    plan.content.trim()
                )));
            }
        }

        let response = self
            .invoke_checked(executor, &exec_messages, true, mode, test)
            .await?;
        Ok((response, planner_correct))
    }

    /// Invoke one model with the per-mode timeout. A timeout becomes a
    /// scored outcome; a transport failure propagates.
    async fn invoke_checked(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        with_tools: bool,
        mode: TestMode,
        test: &TestDefinition,
    ) -> Result<InvokeOutcome> {
        let tools = if with_tools {
            self.resolver.catalog().capabilities.clone()
        } else {
            Vec::new()
        };
        let options = InvokeOptions::default();
        let timeout = self.config.invoke_timeout(mode);

        match tokio::time::timeout(
            timeout,
            self.invoker.invoke(model_id, messages, &tools, &options),
        )
        .await
        {
            Ok(Ok(response)) => Ok(InvokeOutcome::Response(response)),
            Ok(Err(e)) if e.aborts_run() => Err(e),
            Ok(Err(e)) => {
                // Non-transport invocation error. Never evaluated as
                // model output; it scores as a failed probe.
                log::debug!("test {} errored: {}", test.id, e);
                Ok(InvokeOutcome::Errored(e.to_string()))
            }
            Err(_) => Ok(InvokeOutcome::TimedOut),
        }
    }

    /// Combo attribution over the collected planner decisions.
    fn attribute_combo(&self, run: &mut ComboTestResult, planner_decisions: &[bool]) {
        if planner_decisions.is_empty() {
            run.main_excluded = true;
            run.main_score = None;
        } else {
            let correct = planner_decisions.iter().filter(|c| **c).count();
            run.main_score = Some(100.0 * correct as f64 / planner_decisions.len() as f64);
        }

        // Executor attribution: tool-calling tests it actually passed.
        let tool_tests: Vec<&ProbeResult> = run
            .test_results
            .iter()
            .filter(|r| {
                self.registry
                    .get(&r.id)
                    .map(|t| !matches!(t.expectation, Expectation::NoToolCall))
                    .unwrap_or(false)
            })
            .collect();
        if !tool_tests.is_empty() {
            let passed = tool_tests.iter().filter(|r| r.passed).count();
            run.executor_score = Some(100.0 * passed as f64 / tool_tests.len() as f64);
        }
    }

    async fn record_failure(&self, request: &RunRequest, result: &ProbeResult) {
        let model = request
            .executor_model_id
            .clone()
            .unwrap_or_else(|| request.main_model_id.clone());
        let entry = FailureEntry::new(&model, format!("{}: {}", result.id, result.details));
        self.failures.log_failure(entry).await;
    }

    /// Store the result; a store outage leaves it in memory and flags it.
    async fn persist(&self, run: &mut ComboTestResult) {
        match self.store.upsert_combo_result(run).await {
            Ok(()) => run.persisted = true,
            Err(e) => {
                run.persisted = false;
                log::warn!(
                    "run for '{}' not persisted: {}",
                    run.main_model_id,
                    e
                );
            }
        }
    }

    fn fail_run(&self, mut run: ComboTestResult, error: EngineError) -> ComboTestResult {
        log::error!("run aborted: {}", error);
        run.status = RunStatus::Failed;
        run.error = Some(error.to_string());
        run.finished_at = Some(Utc::now());
        run
    }

    fn publish_status(&self, request: &RunRequest, status: RunStatus) {
        self.events.publish(
            "run.status",
            json!({
                "model": request.main_model_id,
                "executor": request.executor_model_id,
                "status": status,
            }),
        );
    }
}

enum InvokeOutcome {
    Response(ModelResponse),
    TimedOut,
    Errored(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
