//! Tool-call resolver — maps an observed tool invocation to a canonical
//! capability with a confidence score.
//!
//! Models emit non-standard tool names under prompt pressure, so matching
//! is an explicit, ordered strategy cascade rather than a single fuzzy
//! score: exact → synonym → substring → keyword-overlap, with a secondary
//! schema-match pass over the observed arguments when no capability clears
//! the name-path confidence floor. Every result carries the method that
//! fired, so tests can assert match provenance and regressions cannot
//! silently change it.
//!
//! Resolution is a pure function of its inputs: the same observed call
//! against the same catalog always yields the same result, and ties break
//! to the first capability in catalog order.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{Capability, CapabilityCatalog};

// ---------------------------------------------------------------------------
// Observed call
// ---------------------------------------------------------------------------

/// A single tool invocation as emitted by a model under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedCall {
    /// The name the model used, which may be non-canonical.
    pub name: String,

    /// Arguments as a flat key/value map.
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

impl ObservedCall {
    pub fn new(name: impl Into<String>, arguments: HashMap<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// A call with no arguments.
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, HashMap::new())
    }
}

// ---------------------------------------------------------------------------
// Resolution result
// ---------------------------------------------------------------------------

/// Which matching strategy produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMethod {
    Exact,
    Synonym,
    Substring,
    KeywordOverlap,
    SchemaMatch,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MatchMethod::Exact => "exact",
            MatchMethod::Synonym => "synonym",
            MatchMethod::Substring => "substring",
            MatchMethod::KeywordOverlap => "keyword-overlap",
            MatchMethod::SchemaMatch => "schema-match",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of resolving one observed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    /// Canonical name of the matched capability.
    pub capability: String,

    /// Confidence 0–100.
    pub confidence: u8,

    /// The strategy that produced this match.
    pub method: MatchMethod,
}

// ---------------------------------------------------------------------------
// Name normalization
// ---------------------------------------------------------------------------

/// Lowercase and strip `-`/`_` so `Read-File`, `read_file`, and `readfile`
/// all compare equal.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Split a name on non-alphanumeric boundaries into lowercase tokens of at
/// least 3 characters.
fn tokens(name: &str) -> Vec<String> {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .collect()
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolves observed tool calls against a capability catalog.
#[derive(Debug, Clone)]
pub struct Resolver {
    catalog: Arc<CapabilityCatalog>,

    /// Name-path confidence floor below which the schema-match pass runs.
    min_confidence: u8,
}

impl Resolver {
    pub fn new(catalog: Arc<CapabilityCatalog>, min_confidence: u8) -> Self {
        Self {
            catalog,
            min_confidence,
        }
    }

    /// The catalog this resolver matches against.
    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    /// Resolve an observed call to the best-matching capability.
    ///
    /// Returns `None` when no capability reaches confidence >0 by either
    /// the name path or the schema path. Callers must treat `None` as
    /// "tool call unattributable", not as an error.
    pub fn resolve(&self, observed: &ObservedCall) -> Option<ResolutionResult> {
        let name_best = self.best_name_match(observed);

        if let Some(ref result) = name_best {
            if result.confidence >= self.min_confidence {
                return name_best;
            }
        }

        // Name path inconclusive: score arguments against each schema.
        if let Some(schema_result) = self.best_schema_match(observed) {
            return Some(schema_result);
        }

        // A weak name match still beats nothing.
        name_best.filter(|r| r.confidence > 0)
    }

    /// Best match via the name path. Strategies are tried in priority
    /// order per capability; ties across capabilities break to catalog
    /// order because only a strictly higher confidence replaces the
    /// current best.
    fn best_name_match(&self, observed: &ObservedCall) -> Option<ResolutionResult> {
        let normalized = normalize(&observed.name);
        if normalized.is_empty() {
            return None;
        }
        let observed_tokens = tokens(&observed.name);

        let mut best: Option<ResolutionResult> = None;
        for capability in &self.catalog.capabilities {
            let (confidence, method) =
                self.name_confidence(&normalized, &observed_tokens, capability);
            if confidence > 0 && best.as_ref().map(|b| b.confidence).unwrap_or(0) < confidence {
                best = Some(ResolutionResult {
                    capability: capability.name.clone(),
                    confidence,
                    method,
                });
            }
        }
        best
    }

    /// Confidence of the observed name against one capability, with the
    /// strategy that produced it. First matching strategy wins.
    fn name_confidence(
        &self,
        normalized: &str,
        observed_tokens: &[String],
        capability: &Capability,
    ) -> (u8, MatchMethod) {
        let canonical = normalize(&capability.name);

        if normalized == canonical {
            return (100, MatchMethod::Exact);
        }

        let is_synonym = self
            .catalog
            .aliases(&capability.name)
            .iter()
            .any(|alias| normalize(alias) == normalized);
        if is_synonym {
            return (95, MatchMethod::Synonym);
        }

        if normalized.contains(&canonical) || canonical.contains(normalized) {
            return (80, MatchMethod::Substring);
        }

        let capability_tokens = tokens(&capability.name);
        let overlap = observed_tokens
            .iter()
            .filter(|t| capability_tokens.contains(t))
            .count();
        let max_tokens = observed_tokens.len().max(capability_tokens.len());
        if overlap > 0 && max_tokens > 0 {
            let confidence = ((100.0 * overlap as f64) / max_tokens as f64).round() as u8;
            return (confidence, MatchMethod::KeywordOverlap);
        }

        (0, MatchMethod::KeywordOverlap)
    }

    /// Best match via the schema path: +40 per present required argument,
    /// +20 per present optional argument, −10 per unrecognized key,
    /// normalized against the capability's maximum attainable score and
    /// floored at 0.
    fn best_schema_match(&self, observed: &ObservedCall) -> Option<ResolutionResult> {
        let mut best: Option<ResolutionResult> = None;
        for capability in &self.catalog.capabilities {
            let score = schema_score(observed, capability);
            if score > 0 && best.as_ref().map(|b| b.confidence).unwrap_or(0) < score {
                best = Some(ResolutionResult {
                    capability: capability.name.clone(),
                    confidence: score,
                    method: MatchMethod::SchemaMatch,
                });
            }
        }
        best
    }
}

/// Score the observed arguments against one capability's schema,
/// normalized to 0–100.
fn schema_score(observed: &ObservedCall, capability: &Capability) -> u8 {
    let required = capability.required_args();
    let optional = capability.optional_args();
    let max = 40 * required.len() as i64 + 20 * optional.len() as i64;
    if max == 0 {
        return 0;
    }

    let mut raw: i64 = 0;
    for arg in &required {
        if observed.arguments.contains_key(*arg) {
            raw += 40;
        }
    }
    for arg in &optional {
        if observed.arguments.contains_key(*arg) {
            raw += 20;
        }
    }
    for key in observed.arguments.keys() {
        if !required.contains(&key.as_str()) && !optional.contains(&key.as_str()) {
            raw -= 10;
        }
    }

    let normalized = (100.0 * raw as f64 / max as f64).round();
    normalized.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> Resolver {
        Resolver::new(Arc::new(CapabilityCatalog::default_catalog()), 50)
    }

    #[test]
    fn test_exact_match() {
        let r = resolver();
        let result = r.resolve(&ObservedCall::bare("read_file")).unwrap();
        assert_eq!(result.capability, "read_file");
        assert_eq!(result.confidence, 100);
        assert_eq!(result.method, MatchMethod::Exact);
    }

    #[test]
    fn test_exact_match_ignores_case_and_separators() {
        let r = resolver();
        let result = r.resolve(&ObservedCall::bare("Read-File")).unwrap();
        assert_eq!(result.capability, "read_file");
        assert_eq!(result.confidence, 100);
        assert_eq!(result.method, MatchMethod::Exact);
    }

    #[test]
    fn test_synonym_match() {
        // Scenario: `cat` is a registered alias of `read_file`.
        let r = resolver();
        let mut args = HashMap::new();
        args.insert("filepath".to_string(), json!("a.ts"));
        let result = r.resolve(&ObservedCall::new("cat", args)).unwrap();
        assert_eq!(result.capability, "read_file");
        assert_eq!(result.confidence, 95);
        assert_eq!(result.method, MatchMethod::Synonym);
    }

    #[test]
    fn test_substring_match() {
        let r = resolver();
        let result = r.resolve(&ObservedCall::bare("read_file_contents")).unwrap();
        assert_eq!(result.capability, "read_file");
        assert_eq!(result.confidence, 80);
        assert_eq!(result.method, MatchMethod::Substring);
    }

    #[test]
    fn test_keyword_overlap_match() {
        let r = resolver();
        // Shares the token "directory" with `list_directory`, no substring
        // relation after normalization.
        let result = r.resolve(&ObservedCall::bare("show_directory_tree")).unwrap();
        assert_eq!(result.capability, "list_directory");
        assert_eq!(result.method, MatchMethod::KeywordOverlap);
        // overlap 1 of max(3, 2) tokens → 33, below the floor but above 0,
        // and no schema evidence to override it.
        assert_eq!(result.confidence, 33);
    }

    #[test]
    fn test_schema_match_beats_weak_name() {
        let r = resolver();
        let mut args = HashMap::new();
        args.insert("filepath".to_string(), json!("a.ts"));
        args.insert("content".to_string(), json!("hello"));
        let result = r.resolve(&ObservedCall::new("persist", args)).unwrap();
        assert_eq!(result.capability, "write_file");
        assert_eq!(result.method, MatchMethod::SchemaMatch);
        // 40 + 40 of a max of 40 + 40 + 20 = 80%.
        assert_eq!(result.confidence, 80);
    }

    #[test]
    fn test_unrecognized_keys_penalized() {
        let r = resolver();
        let mut args = HashMap::new();
        args.insert("filepath".to_string(), json!("a.ts"));
        args.insert("bogus".to_string(), json!(1));
        args.insert("extra".to_string(), json!(2));
        let result = r.resolve(&ObservedCall::new("xyz", args)).unwrap();
        assert_eq!(result.method, MatchMethod::SchemaMatch);
        assert!(result.confidence < 80);
    }

    #[test]
    fn test_unattributable_returns_none() {
        let r = resolver();
        assert!(r.resolve(&ObservedCall::bare("zzz")).is_none());
        assert!(r.resolve(&ObservedCall::bare("")).is_none());
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let r = resolver();
        let call = ObservedCall::bare("file_read");
        assert_eq!(r.resolve(&call), r.resolve(&call));
    }

    #[test]
    fn test_tokens_drop_short_fragments() {
        assert_eq!(tokens("do_a_thing"), vec!["thing"]);
        assert_eq!(tokens("read-file"), vec!["read", "file"]);
    }
}
