//! Probe/test registry — the static battery definitions.
//!
//! Tests and probes are data: each is identified by a dotted
//! `"<category>.<n>"` id, belongs to one of 14 fixed categories across 3
//! difficulty tiers, and carries either a declarative expectation (a small
//! predicate tree over the expected tool call) or a reference to a dynamic
//! evaluator dispatched by probe id through [`evaluators::EvaluatorRegistry`].
//! Keeping behavior out of the definitions keeps them serializable and
//! diffable; the enumerable dispatch table is the only place evaluation
//! code lives.
//!
//! Modes select category subsets; their minute estimates are UI hints, not
//! deadlines.

pub mod battery_data;
pub mod evaluators;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::interfaces::invocation::ChatMessage;

// ---------------------------------------------------------------------------
// Categories and tiers
// ---------------------------------------------------------------------------

/// The 14 fixed test categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// The model should answer directly and *not* call a tool.
    Suppress,
    /// One obvious tool, one obvious call.
    SingleTool,
    /// Pick the right tool among plausible alternatives.
    ToolSelect,
    /// Extract call parameters faithfully from the prompt.
    ParamExtract,
    /// Ask for clarification instead of guessing.
    Clarify,
    /// Sequence multiple tools correctly.
    MultiTool,
    /// Reason before acting.
    Reasoning,
    /// Refuse calls that should not be made.
    Refusal,
    /// Recall facts stated earlier in the conversation.
    ContextRecall,
    /// Recover after a failed tool call.
    ErrorRecovery,
    /// Respect the requested output format.
    FormatAdherence,
    /// Keep following an instruction given turns ago.
    InstructionRetention,
    /// Stay in the assigned role.
    RoleConsistency,
    /// No extraneous output around tool calls.
    OutputDiscipline,
}

impl Category {
    /// All categories in canonical order.
    pub const ALL: [Category; 14] = [
        Category::Suppress,
        Category::SingleTool,
        Category::ToolSelect,
        Category::ParamExtract,
        Category::Clarify,
        Category::MultiTool,
        Category::Reasoning,
        Category::Refusal,
        Category::ContextRecall,
        Category::ErrorRecovery,
        Category::FormatAdherence,
        Category::InstructionRetention,
        Category::RoleConsistency,
        Category::OutputDiscipline,
    ];

    /// Stable string id, used as the prefix of dotted test ids.
    pub fn id(&self) -> &'static str {
        match self {
            Category::Suppress => "suppress",
            Category::SingleTool => "single_tool",
            Category::ToolSelect => "tool_select",
            Category::ParamExtract => "param_extract",
            Category::Clarify => "clarify",
            Category::MultiTool => "multi_tool",
            Category::Reasoning => "reasoning",
            Category::Refusal => "refusal",
            Category::ContextRecall => "context_recall",
            Category::ErrorRecovery => "error_recovery",
            Category::FormatAdherence => "format_adherence",
            Category::InstructionRetention => "instruction_retention",
            Category::RoleConsistency => "role_consistency",
            Category::OutputDiscipline => "output_discipline",
        }
    }

    /// Parse a category from its string id.
    pub fn from_id(id: &str) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.id() == id)
    }

    /// The difficulty tier this category belongs to.
    pub fn tier(&self) -> Tier {
        match self {
            Category::Suppress
            | Category::SingleTool
            | Category::FormatAdherence
            | Category::OutputDiscipline => Tier::Simple,
            Category::ToolSelect
            | Category::ParamExtract
            | Category::Clarify
            | Category::ContextRecall
            | Category::InstructionRetention => Tier::Medium,
            Category::MultiTool
            | Category::Reasoning
            | Category::Refusal
            | Category::ErrorRecovery
            | Category::RoleConsistency => Tier::Complex,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// The three difficulty tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Simple,
    Medium,
    Complex,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Simple, Tier::Medium, Tier::Complex];

    /// Share of the composite score carried by this tier. Sums to 1.00.
    pub fn weight(&self) -> f64 {
        match self {
            Tier::Simple => 0.20,
            Tier::Medium => 0.30,
            Tier::Complex => 0.50,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Tier::Simple => "simple",
            Tier::Medium => "medium",
            Tier::Complex => "complex",
        }
    }
}

/// Per-test difficulty rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[serde(alias = "simple")]
    Easy,
    Medium,
    #[serde(alias = "complex")]
    Hard,
}

// ---------------------------------------------------------------------------
// Expectations
// ---------------------------------------------------------------------------

/// Predicate over a single tool-call parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ParamCheck {
    /// The parameter must be present with any value.
    Exists,
    /// The parameter's string form must contain the needle.
    Contains { needle: String },
    /// The parameter must equal one of the listed values.
    OneOf { values: Vec<Value> },
    /// The parameter must equal the value exactly.
    Equals { value: Value },
}

impl ParamCheck {
    /// Evaluate the predicate against an argument value (or its absence).
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            ParamCheck::Exists => true,
            ParamCheck::Contains { needle } => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                text.contains(needle)
            }
            ParamCheck::OneOf { values } => values.contains(value),
            ParamCheck::Equals { value: expected } => value == expected,
        }
    }
}

/// Declarative expectation for a static test: the canonical tool that must
/// be called and the per-parameter predicates its arguments must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedCall {
    /// Canonical capability name expected.
    pub tool: String,

    /// Predicates keyed by parameter name.
    #[serde(default)]
    pub params: HashMap<String, ParamCheck>,
}

/// Static or dynamic expectation, as a tagged variant so definitions stay
/// plain data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    /// The model must call the expected tool with conforming arguments.
    ToolCall { expected: ExpectedCall },

    /// The model must *not* call any tool.
    NoToolCall,

    /// Dispatch to a registered dynamic evaluator keyed by this test's id.
    Dynamic,
}

// ---------------------------------------------------------------------------
// Test definition
// ---------------------------------------------------------------------------

/// One test or probe. Immutable after registry construction.
///
/// Static tests carry a declarative [`Expectation`]; dynamic probes use
/// `Expectation::Dynamic` and are evaluated by the function registered
/// under their id in the evaluator dispatch table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDefinition {
    /// Dotted id `"<category>.<n>"`, or a `CQG-<n>` id for gate tests.
    pub id: String,

    pub category: Category,
    pub difficulty: Difficulty,

    /// The prompt presented to the model under test.
    pub prompt: String,

    /// Optional conversation history prepended before the prompt
    /// (multi-tool and context-recall tests).
    #[serde(default)]
    pub history: Vec<ChatMessage>,

    pub expectation: Expectation,
}

/// Result of executing one probe. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub id: String,
    pub passed: bool,
    /// 0–100.
    pub score: u8,
    pub details: String,
}

impl ProbeResult {
    pub fn pass(id: &str, details: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            passed: true,
            score: 100,
            details: details.into(),
        }
    }

    pub fn fail(id: &str, details: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            passed: false,
            score: 0,
            details: details.into(),
        }
    }

    /// Category parsed from the dotted id prefix. Gate ids (`CQG-n`) have
    /// no category prefix and return `None`.
    pub fn category(&self) -> Option<Category> {
        self.id.split('.').next().and_then(Category::from_id)
    }
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Battery selection modes. Each maps to a fixed category subset and a
/// time budget used only as a UI estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    Quick,
    Standard,
    Deep,
    Optimization,
    KeepOnSuccess,
    Manual,
}

impl TestMode {
    /// Categories exercised by this mode. `Manual` uses the caller-supplied
    /// list and returns it unchanged.
    pub fn categories(&self, manual: &[Category]) -> Vec<Category> {
        match self {
            TestMode::Quick => vec![
                Category::SingleTool,
                Category::ToolSelect,
                Category::ParamExtract,
            ],
            TestMode::Standard | TestMode::KeepOnSuccess => vec![
                Category::SingleTool,
                Category::ToolSelect,
                Category::ParamExtract,
                Category::Suppress,
                Category::Clarify,
                Category::MultiTool,
                Category::FormatAdherence,
            ],
            TestMode::Deep => Category::ALL.to_vec(),
            TestMode::Optimization => vec![
                Category::MultiTool,
                Category::Reasoning,
                Category::ErrorRecovery,
            ],
            TestMode::Manual => manual.to_vec(),
        }
    }

    /// Rough wall-clock estimate in minutes, for progress UIs only.
    pub fn estimated_minutes(&self) -> u32 {
        match self {
            TestMode::Quick => 5,
            TestMode::Standard | TestMode::KeepOnSuccess => 15,
            TestMode::Deep => 45,
            TestMode::Optimization => 20,
            TestMode::Manual => 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The loaded battery: gate tests plus the full test list in declaration
/// order. Within one battery, tests execute in registry order per category.
#[derive(Debug, Clone)]
pub struct TestRegistry {
    gate: Vec<TestDefinition>,
    tests: Vec<TestDefinition>,
}

impl TestRegistry {
    pub fn new(gate: Vec<TestDefinition>, tests: Vec<TestDefinition>) -> Self {
        Self { gate, tests }
    }

    /// The compiled-in battery.
    pub fn builtin() -> Self {
        Self::new(battery_data::gate_tests(), battery_data::battery_tests())
    }

    /// The qualifying-gate tests, filtered to the configured ids, in the
    /// order the ids are given.
    pub fn gate_tests(&self, ids: &[String]) -> Vec<&TestDefinition> {
        ids.iter()
            .filter_map(|id| self.gate.iter().find(|t| &t.id == id))
            .collect()
    }

    /// Battery tests for the given categories, preserving registry order.
    pub fn tests_for_categories(&self, categories: &[Category]) -> Vec<&TestDefinition> {
        self.tests
            .iter()
            .filter(|t| categories.contains(&t.category))
            .collect()
    }

    /// Battery tests for a single category, in registry order.
    pub fn tests_for_category(&self, category: Category) -> Vec<&TestDefinition> {
        self.tests_for_categories(&[category])
    }

    /// Look up any test (gate or battery) by id.
    pub fn get(&self, id: &str) -> Option<&TestDefinition> {
        self.gate
            .iter()
            .chain(self.tests.iter())
            .find(|t| t.id == id)
    }

    /// Total number of battery tests.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_ids_round_trip() {
        for category in Category::ALL {
            assert_eq!(Category::from_id(category.id()), Some(category));
        }
    }

    #[test]
    fn test_every_category_has_a_tier() {
        let mut per_tier: HashMap<Tier, usize> = HashMap::new();
        for category in Category::ALL {
            *per_tier.entry(category.tier()).or_insert(0) += 1;
        }
        assert_eq!(per_tier[&Tier::Simple], 4);
        assert_eq!(per_tier[&Tier::Medium], 5);
        assert_eq!(per_tier[&Tier::Complex], 5);
    }

    #[test]
    fn test_tier_weights_sum_to_one() {
        let total: f64 = Tier::ALL.iter().map(|t| t.weight()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mode_category_subsets() {
        assert_eq!(TestMode::Quick.categories(&[]).len(), 3);
        assert_eq!(TestMode::Deep.categories(&[]).len(), 14);
        let manual = vec![Category::Refusal];
        assert_eq!(TestMode::Manual.categories(&manual), manual);
    }

    #[test]
    fn test_param_check_matching() {
        assert!(ParamCheck::Exists.matches(Some(&serde_json::json!(1))));
        assert!(!ParamCheck::Exists.matches(None));
        assert!(ParamCheck::Contains {
            needle: "src".into()
        }
        .matches(Some(&serde_json::json!("node-api/src"))));
        assert!(ParamCheck::OneOf {
            values: vec![serde_json::json!("GET"), serde_json::json!("POST")]
        }
        .matches(Some(&serde_json::json!("GET"))));
        assert!(ParamCheck::Equals {
            value: serde_json::json!(true)
        }
        .matches(Some(&serde_json::json!(true))));
    }

    #[test]
    fn test_probe_result_category_prefix() {
        let result = ProbeResult::pass("tool_select.2", "ok");
        assert_eq!(result.category(), Some(Category::ToolSelect));
        let gate = ProbeResult::fail("CQG-1", "missed");
        assert_eq!(gate.category(), None);
    }

    #[test]
    fn test_builtin_registry_covers_all_categories() {
        let registry = TestRegistry::builtin();
        for category in Category::ALL {
            assert!(
                !registry.tests_for_category(category).is_empty(),
                "no tests for category {}",
                category
            );
        }
    }

    #[test]
    fn test_registry_order_preserved() {
        let registry = TestRegistry::builtin();
        let single = registry.tests_for_category(Category::SingleTool);
        let ids: Vec<_> = single.iter().map(|t| t.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
