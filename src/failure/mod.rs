//! Failure log — append, classify, count.
//!
//! Every failing probe result lands here as a `FailureEntry`. On append
//! the entry is classified into a `FailurePattern` by a pluggable
//! classifier (the default derives a model-independent signature from the
//! failure details), the pattern counter is incremented atomically, the
//! entry is persisted, and any registered hooks fire synchronously so the
//! observer can raise critical alerts immediately. Counters never
//! decrement except on explicit reset.

pub mod observer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::interfaces::store::EvalStore;

// ---------------------------------------------------------------------------
// Entries and patterns
// ---------------------------------------------------------------------------

/// One logged failure. `resolved` flips true once a verified prosthetic
/// is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    /// Store-assigned id, `None` before persistence.
    #[serde(default)]
    pub id: Option<i64>,
    pub model_id: String,
    /// Pattern signature, filled in by classification.
    pub pattern: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub prosthetic_id: Option<String>,
}

impl FailureEntry {
    pub fn new(model_id: &str, details: impl Into<String>) -> Self {
        Self {
            id: None,
            model_id: model_id.to_string(),
            pattern: String::new(),
            details: details.into(),
            timestamp: Utc::now(),
            resolved: false,
            prosthetic_id: None,
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A recognized failure pattern with its running count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePattern {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub count: u64,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// How an entry maps onto a pattern.
#[derive(Debug, Clone)]
pub struct PatternDescriptor {
    pub id: String,
    pub name: String,
    pub severity: Severity,
}

/// Pluggable pattern identification.
pub trait PatternClassifier: Send + Sync {
    fn classify(&self, entry: &FailureEntry) -> PatternDescriptor;
}

/// Default classifier: a normalized signature of the model-independent
/// failure kind, keyed off the detail text the evaluators produce.
pub struct DefaultClassifier;

impl PatternClassifier for DefaultClassifier {
    fn classify(&self, entry: &FailureEntry) -> PatternDescriptor {
        let details = entry.details.to_lowercase();
        let (id, name, severity) = if details.contains("timed out") {
            ("timeout", "Model invocation timed out", Severity::Warning)
        } else if details.contains("probe execution error") {
            ("probe_error", "Probe raised during execution", Severity::Critical)
        } else if details.contains("no tool was called") {
            ("no_tool_call", "Expected tool never called", Severity::Warning)
        } else if details.contains("did not attribute") {
            ("wrong_tool", "Wrong tool selected", Severity::Warning)
        } else if details.contains("parameter check failed") {
            ("param_mismatch", "Tool called with wrong parameters", Severity::Warning)
        } else if details.contains("expected no tool call") {
            ("unexpected_tool_call", "Tool called when none expected", Severity::Critical)
        } else {
            ("behavioral_fail", "Behavioral expectation unmet", Severity::Info)
        };
        PatternDescriptor {
            id: id.to_string(),
            name: name.to_string(),
            severity,
        }
    }
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

/// Hook invoked synchronously after each append, with the entry and a
/// snapshot of its pattern.
pub type FailureHook = Box<dyn Fn(&FailureEntry, &FailurePattern) + Send + Sync>;

/// The failure log. Pattern counters are mutated by concurrent runs, so
/// they live in a `DashMap` and use entry-level atomic updates.
pub struct FailureLog {
    store: Arc<dyn EvalStore>,
    classifier: Arc<dyn PatternClassifier>,
    patterns: DashMap<String, FailurePattern>,
    model_counts: DashMap<String, u64>,
    hooks: RwLock<Vec<FailureHook>>,
}

impl FailureLog {
    pub fn new(store: Arc<dyn EvalStore>, classifier: Arc<dyn PatternClassifier>) -> Self {
        Self {
            store,
            classifier,
            patterns: DashMap::new(),
            model_counts: DashMap::new(),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Register a hook fired synchronously on every append.
    pub fn on_failure_logged(&self, hook: FailureHook) {
        self.hooks.write().push(hook);
    }

    /// Append a failure: classify, count, persist, notify.
    ///
    /// A store outage degrades to a warning — the in-memory counters stay
    /// authoritative for alerting either way.
    pub async fn log_failure(&self, mut entry: FailureEntry) -> FailurePattern {
        let descriptor = self.classifier.classify(&entry);
        entry.pattern = descriptor.id.clone();

        let snapshot = {
            let mut pattern = self
                .patterns
                .entry(descriptor.id.clone())
                .or_insert_with(|| FailurePattern {
                    id: descriptor.id.clone(),
                    name: descriptor.name.clone(),
                    severity: descriptor.severity,
                    count: 0,
                });
            pattern.count += 1;
            pattern.clone()
        };
        *self.model_counts.entry(entry.model_id.clone()).or_insert(0) += 1;

        match self.store.append_failure(&entry).await {
            Ok(id) => entry.id = Some(id),
            Err(e) => log::warn!("failure entry not persisted: {}", e),
        }

        for hook in self.hooks.read().iter() {
            hook(&entry, &snapshot);
        }
        snapshot
    }

    /// Snapshot of all patterns.
    pub fn patterns(&self) -> Vec<FailurePattern> {
        self.patterns.iter().map(|p| p.clone()).collect()
    }

    /// Snapshot of per-model failure totals.
    pub fn model_counts(&self) -> Vec<(String, u64)> {
        self.model_counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Explicitly reset one pattern counter.
    pub fn reset_pattern(&self, pattern_id: &str) -> bool {
        match self.patterns.get_mut(pattern_id) {
            Some(mut pattern) => {
                pattern.count = 0;
                true
            }
            None => false,
        }
    }

    /// Explicitly reset every counter.
    pub fn reset_all(&self) {
        self.patterns.clear();
        self.model_counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn log() -> FailureLog {
        FailureLog::new(Arc::new(MemoryStore::new()), Arc::new(DefaultClassifier))
    }

    #[tokio::test]
    async fn test_classification_and_counting() {
        let log = log();
        let p1 = log
            .log_failure(FailureEntry::new(
                "m1",
                "expected tool 'read_file', no tool was called",
            ))
            .await;
        assert_eq!(p1.id, "no_tool_call");
        assert_eq!(p1.count, 1);

        let p2 = log
            .log_failure(FailureEntry::new(
                "m2",
                "expected tool 'read_file', no tool was called",
            ))
            .await;
        assert_eq!(p2.count, 2);

        assert_eq!(log.patterns().len(), 1);
        assert_eq!(log.model_counts().len(), 2);
    }

    #[tokio::test]
    async fn test_hooks_fire_synchronously() {
        let log = log();
        static FIRED: AtomicU32 = AtomicU32::new(0);
        log.on_failure_logged(Box::new(|_, pattern| {
            assert!(pattern.count >= 1);
            FIRED.fetch_add(1, Ordering::SeqCst);
        }));
        log.log_failure(FailureEntry::new("m1", "probe execution error: boom"))
            .await;
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_pattern() {
        let log = log();
        log.log_failure(FailureEntry::new("m1", "timed out")).await;
        assert!(log.reset_pattern("timeout"));
        assert_eq!(log.patterns()[0].count, 0);
        assert!(!log.reset_pattern("missing"));
    }

    #[test]
    fn test_default_classifier_severity() {
        let classifier = DefaultClassifier;
        let critical = classifier.classify(&FailureEntry::new(
            "m1",
            "expected no tool call, got 'run_command'",
        ));
        assert_eq!(critical.severity, Severity::Critical);
        assert_eq!(critical.id, "unexpected_tool_call");
    }
}
