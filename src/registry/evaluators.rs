//! Dynamic evaluator dispatch table and shared test evaluation.
//!
//! Probe definitions stay plain data; behavior lives here, in one
//! enumerable table of evaluator functions keyed by probe id. A probe
//! whose expectation is `Dynamic` dispatches through this table; static
//! expectations are checked declaratively in [`evaluate_test`], which both
//! the battery executor and the degradation tester share.

use std::collections::HashMap;

use crate::interfaces::invocation::ModelResponse;
use crate::registry::{Expectation, ProbeResult, TestDefinition};
use crate::resolver::{ObservedCall, Resolver};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Outcome of one dynamic evaluation.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub passed: bool,
    pub score: u8,
    pub details: String,
}

impl EvalOutcome {
    pub fn pass(details: impl Into<String>) -> Self {
        Self {
            passed: true,
            score: 100,
            details: details.into(),
        }
    }

    pub fn fail(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            score: 0,
            details: details.into(),
        }
    }
}

/// A dynamic evaluator: plain function of the response text and the raw
/// tool calls. Function pointers keep the table enumerable and the probe
/// definitions serializable.
pub type DynamicEvaluator = fn(&str, &[ObservedCall]) -> EvalOutcome;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Fixed dispatch table keyed by probe id.
#[derive(Debug, Clone)]
pub struct EvaluatorRegistry {
    table: HashMap<String, DynamicEvaluator>,
}

impl EvaluatorRegistry {
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// The compiled-in table covering every dynamic probe in the built-in
    /// battery.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("multi_tool.1", ordered_read_then_write);
        registry.register("multi_tool.2", search_before_edit);
        registry.register("reasoning.1", reasoned_single_call);
        registry.register("reasoning.2", reasoned_single_call);
        registry.register("refusal.2", refusal_language);
        registry.register("error_recovery.1", retry_attempted);
        registry.register("format_adherence.1", json_only_response);
        registry.register("format_adherence.2", json_only_response);
        registry.register("instruction_retention.1", suffix_retained);
        registry.register("instruction_retention.2", suffix_retained);
        registry.register("role_consistency.1", stays_in_role);
        registry.register("role_consistency.2", stays_in_role);
        registry.register("output_discipline.1", tool_call_only);
        registry.register("output_discipline.2", tool_call_only);
        registry
    }

    pub fn register(&mut self, probe_id: &str, evaluator: DynamicEvaluator) {
        self.table.insert(probe_id.to_string(), evaluator);
    }

    pub fn get(&self, probe_id: &str) -> Option<DynamicEvaluator> {
        self.table.get(probe_id).copied()
    }
}

// ---------------------------------------------------------------------------
// Shared evaluation
// ---------------------------------------------------------------------------

/// Evaluate one test against a model response.
///
/// Static expectations resolve each observed call through the resolver and
/// check the parameter predicates; an unattributable call is a failed
/// attribution, never an error. Dynamic probes dispatch by id; a missing
/// evaluator degrades to a failed result so a registry gap cannot abort a
/// battery.
pub fn evaluate_test(
    test: &TestDefinition,
    response: &ModelResponse,
    resolver: &Resolver,
    evaluators: &EvaluatorRegistry,
    min_confidence: u8,
) -> ProbeResult {
    match &test.expectation {
        Expectation::NoToolCall => {
            if response.tool_calls.is_empty() {
                ProbeResult::pass(&test.id, "answered directly without calling a tool")
            } else {
                ProbeResult::fail(
                    &test.id,
                    format!(
                        "expected no tool call, got '{}'",
                        response.tool_calls[0].name
                    ),
                )
            }
        }
        Expectation::ToolCall { expected } => {
            // Attribute each observed call; the first one resolving to the
            // expected capability is checked against the parameter predicates.
            let attributed = response.tool_calls.iter().find(|call| {
                resolver
                    .resolve(call)
                    .map(|r| r.capability == expected.tool && r.confidence >= min_confidence)
                    .unwrap_or(false)
            });

            let Some(call) = attributed else {
                let detail = if response.tool_calls.is_empty() {
                    format!("expected tool '{}', no tool was called", expected.tool)
                } else {
                    format!(
                        "expected tool '{}', observed '{}' did not attribute to it",
                        expected.tool, response.tool_calls[0].name
                    )
                };
                return ProbeResult::fail(&test.id, detail);
            };

            let unmet: Vec<&String> = expected
                .params
                .iter()
                .filter(|(name, check)| !check.matches(call.arguments.get(*name)))
                .map(|(name, _)| name)
                .collect();

            if unmet.is_empty() {
                ProbeResult::pass(
                    &test.id,
                    format!("called '{}' with conforming arguments", expected.tool),
                )
            } else {
                ProbeResult::fail(
                    &test.id,
                    format!(
                        "called '{}' but parameter check failed for: {}",
                        expected.tool,
                        unmet
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                )
            }
        }
        Expectation::Dynamic => match evaluators.get(&test.id) {
            Some(evaluator) => {
                let outcome = evaluator(&response.content, &response.tool_calls);
                ProbeResult {
                    id: test.id.clone(),
                    passed: outcome.passed,
                    score: outcome.score,
                    details: outcome.details,
                }
            }
            None => ProbeResult::fail(
                &test.id,
                format!("no evaluator registered for probe '{}'", test.id),
            ),
        },
    }
}

// ---------------------------------------------------------------------------
// Built-in evaluator functions
// ---------------------------------------------------------------------------

fn normalized(name: &str) -> String {
    name.to_lowercase().replace(['-', '_'], "")
}

fn position_of(calls: &[ObservedCall], canonical: &str) -> Option<usize> {
    let target = normalized(canonical);
    calls.iter().position(|c| normalized(&c.name) == target)
}

/// `read_file` must precede `write_file`.
fn ordered_read_then_write(_response: &str, calls: &[ObservedCall]) -> EvalOutcome {
    let read = position_of(calls, "read_file");
    let write = position_of(calls, "write_file");
    match (read, write) {
        (Some(r), Some(w)) if r < w => EvalOutcome::pass("read before write"),
        (Some(_), Some(_)) => EvalOutcome::fail("wrote before reading"),
        _ => EvalOutcome::fail("expected both read_file and write_file calls"),
    }
}

/// `search_code` must precede `write_file`.
fn search_before_edit(_response: &str, calls: &[ObservedCall]) -> EvalOutcome {
    let search = position_of(calls, "search_code");
    let write = position_of(calls, "write_file");
    match (search, write) {
        (Some(s), Some(w)) if s < w => EvalOutcome::pass("searched before editing"),
        _ => EvalOutcome::fail("expected search_code followed by write_file"),
    }
}

/// Visible reasoning plus exactly one tool call.
fn reasoned_single_call(response: &str, calls: &[ObservedCall]) -> EvalOutcome {
    if calls.len() != 1 {
        return EvalOutcome::fail(format!("expected exactly one tool call, got {}", calls.len()));
    }
    if response.trim().len() < 40 {
        return EvalOutcome::fail("no visible reasoning before the call");
    }
    EvalOutcome::pass("reasoned, then made a single call")
}

/// Declines in prose without calling a tool.
fn refusal_language(response: &str, calls: &[ObservedCall]) -> EvalOutcome {
    if !calls.is_empty() {
        return EvalOutcome::fail("called a tool instead of refusing");
    }
    let lower = response.to_lowercase();
    let refused = ["can't", "cannot", "won't", "will not", "refuse", "shouldn't", "not able"]
        .iter()
        .any(|kw| lower.contains(kw));
    if refused {
        EvalOutcome::pass("refused in prose")
    } else {
        EvalOutcome::fail("no refusal language in the response")
    }
}

/// After a reported tool failure, any retry counts as recovery.
fn retry_attempted(_response: &str, calls: &[ObservedCall]) -> EvalOutcome {
    if calls.is_empty() {
        EvalOutcome::fail("gave up without retrying the failed call")
    } else {
        EvalOutcome::pass("retried after the reported failure")
    }
}

/// The entire response must be one parseable JSON object.
fn json_only_response(response: &str, _calls: &[ObservedCall]) -> EvalOutcome {
    let trimmed = response.trim();
    if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
        return EvalOutcome::fail("response is not a bare JSON object");
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(_) => EvalOutcome::pass("bare JSON object"),
        Err(e) => EvalOutcome::fail(format!("JSON does not parse: {}", e)),
    }
}

/// The instruction turn demanded every reply end with "All clear."
fn suffix_retained(response: &str, _calls: &[ObservedCall]) -> EvalOutcome {
    if response.trim_end().ends_with("All clear.") {
        EvalOutcome::pass("suffix retained")
    } else {
        EvalOutcome::fail("dropped the required closing suffix")
    }
}

/// Assigned persona must hold; breaking character fails.
fn stays_in_role(response: &str, _calls: &[ObservedCall]) -> EvalOutcome {
    let lower = response.to_lowercase();
    let broke = ["as an ai", "language model", "i am an assistant"]
        .iter()
        .any(|kw| lower.contains(kw));
    if broke {
        EvalOutcome::fail("broke character")
    } else if lower.trim().is_empty() {
        EvalOutcome::fail("empty response")
    } else {
        EvalOutcome::pass("stayed in role")
    }
}

/// A tool call with no extraneous prose around it.
fn tool_call_only(response: &str, calls: &[ObservedCall]) -> EvalOutcome {
    if calls.is_empty() {
        return EvalOutcome::fail("expected a tool call");
    }
    if response.trim().is_empty() {
        EvalOutcome::pass("clean tool call, no extraneous output")
    } else {
        EvalOutcome::fail("extraneous prose around the tool call")
    }
}
