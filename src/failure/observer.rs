//! Failure observer — real-time and periodic alerting over the log.
//!
//! Two paths feed alerts: the synchronous hook on every append (immediate
//! alerts for critical patterns) and a background scan (default every 30s)
//! that checks for threshold breaches, newly recurring patterns, and
//! models accumulating failures across patterns. Each alert key is
//! deduplicated within a rolling window so a noisy pattern cannot storm
//! the channel. Alerts are pushed to the broadcast channel and kept only
//! in a bounded in-memory buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::EngineConfig;
use crate::failure::{FailureLog, FailurePattern, Severity};
use crate::interfaces::broadcast::EventChannel;

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// What triggered an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A pattern count crossed the configured threshold.
    ThresholdBreach,
    /// A pattern recurred for the first time (count reached 2).
    NewPattern,
    /// One model accumulated failures across any pattern.
    RecurringFailure,
    /// A critical pattern fired on append.
    CriticalPattern,
}

/// An emitted alert. Ephemeral: lives only in the rolling buffer and on
/// the broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureAlert {
    pub kind: AlertKind,
    /// Pattern id, or model id for recurring-failure alerts.
    pub key: String,
    pub severity: Severity,
    pub message: String,
    pub count: u64,
    pub action_required: bool,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

struct ObserverState {
    /// Last emission per dedup key.
    last_emitted: HashMap<String, DateTime<Utc>>,
    /// Rolling buffer of recent alerts.
    recent: VecDeque<FailureAlert>,
}

/// Watches the failure log and raises alerts.
pub struct FailureObserver {
    config: EngineConfig,
    events: EventChannel,
    state: Mutex<ObserverState>,
}

impl FailureObserver {
    pub fn new(config: EngineConfig, events: EventChannel) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            state: Mutex::new(ObserverState {
                last_emitted: HashMap::new(),
                recent: VecDeque::new(),
            }),
        })
    }

    /// Wire this observer into a log: the synchronous hook handles
    /// immediate critical alerts; callers separately spawn
    /// [`FailureObserver::run_periodic`] for the background scan.
    pub fn attach(self: &Arc<Self>, log: &FailureLog) {
        let observer = Arc::clone(self);
        log.on_failure_logged(Box::new(move |entry, pattern| {
            observer.on_failure_logged(&entry.model_id, pattern);
        }));
    }

    /// Immediate path: critical patterns alert on the very write that
    /// produced them.
    pub fn on_failure_logged(&self, model_id: &str, pattern: &FailurePattern) {
        if pattern.severity != Severity::Critical {
            return;
        }
        self.emit(FailureAlert {
            kind: AlertKind::CriticalPattern,
            key: pattern.id.clone(),
            severity: Severity::Critical,
            message: format!(
                "critical pattern '{}' hit by model '{}' (count {})",
                pattern.name, model_id, pattern.count
            ),
            count: pattern.count,
            action_required: pattern.count >= self.config.action_required_threshold(),
            timestamp: Utc::now(),
        });
    }

    /// One background scan over the current counters.
    pub fn scan(&self, log: &FailureLog) {
        for pattern in log.patterns() {
            if pattern.count >= self.config.alert_threshold {
                self.emit(FailureAlert {
                    kind: AlertKind::ThresholdBreach,
                    key: pattern.id.clone(),
                    severity: pattern.severity,
                    message: format!(
                        "pattern '{}' reached {} failures",
                        pattern.name, pattern.count
                    ),
                    count: pattern.count,
                    action_required: pattern.count >= self.config.action_required_threshold(),
                    timestamp: Utc::now(),
                });
            } else if pattern.count >= 2 {
                self.emit(FailureAlert {
                    kind: AlertKind::NewPattern,
                    key: format!("new:{}", pattern.id),
                    severity: Severity::Info,
                    message: format!("new recurring pattern '{}'", pattern.name),
                    count: pattern.count,
                    action_required: false,
                    timestamp: Utc::now(),
                });
            }
        }

        for (model_id, count) in log.model_counts() {
            if count >= self.config.recurring_failure_threshold {
                self.emit(FailureAlert {
                    kind: AlertKind::RecurringFailure,
                    key: format!("model:{}", model_id),
                    severity: Severity::Warning,
                    message: format!("model '{}' accumulated {} failures", model_id, count),
                    count,
                    action_required: false,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Background loop. Runs until the task is dropped.
    pub async fn run_periodic(self: Arc<Self>, log: Arc<FailureLog>) {
        let interval = Duration::from_secs(self.config.observer_scan_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.scan(&log);
        }
    }

    /// Recent alerts, newest last.
    pub fn recent_alerts(&self) -> Vec<FailureAlert> {
        self.state.lock().recent.iter().cloned().collect()
    }

    /// Emit unless the same key alerted within the dedup window.
    fn emit(&self, alert: FailureAlert) {
        let window = chrono::Duration::seconds(self.config.alert_dedup_window_secs as i64);
        let mut state = self.state.lock();

        let dedup_key = format!("{:?}:{}", alert.kind, alert.key);
        if let Some(last) = state.last_emitted.get(&dedup_key) {
            if alert.timestamp - *last < window {
                return;
            }
        }
        state.last_emitted.insert(dedup_key, alert.timestamp);

        state.recent.push_back(alert.clone());
        while state.recent.len() > self.config.alert_buffer_size {
            state.recent.pop_front();
        }
        drop(state);

        log::info!("failure alert: {}", alert.message);
        self.events.publish(
            "failure.alert",
            json!({
                "kind": alert.kind,
                "key": alert.key,
                "severity": alert.severity,
                "message": alert.message,
                "count": alert.count,
                "action_required": alert.action_required,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{DefaultClassifier, FailureEntry};
    use crate::interfaces::store::MemoryStore;

    fn setup() -> (Arc<FailureObserver>, Arc<FailureLog>) {
        let config = EngineConfig::default();
        let observer = FailureObserver::new(config, EventChannel::new());
        let log = Arc::new(FailureLog::new(
            Arc::new(MemoryStore::new()),
            Arc::new(DefaultClassifier),
        ));
        observer.attach(&log);
        (observer, log)
    }

    #[tokio::test]
    async fn test_critical_pattern_alerts_immediately() {
        let (observer, log) = setup();
        log.log_failure(FailureEntry::new("m1", "probe execution error: panic"))
            .await;
        let alerts = observer.recent_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::CriticalPattern);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_threshold_breach_and_action_required() {
        let (observer, log) = setup();
        for _ in 0..10 {
            log.log_failure(FailureEntry::new("m1", "timed out")).await;
        }
        observer.scan(&log);
        let alerts = observer.recent_alerts();
        let breach = alerts
            .iter()
            .find(|a| a.kind == AlertKind::ThresholdBreach)
            .unwrap();
        // 10 failures = 2× the default threshold of 5.
        assert!(breach.action_required);
    }

    #[tokio::test]
    async fn test_new_pattern_alert_below_threshold() {
        let (observer, log) = setup();
        log.log_failure(FailureEntry::new("m1", "timed out")).await;
        log.log_failure(FailureEntry::new("m2", "timed out")).await;
        observer.scan(&log);
        let alerts = observer.recent_alerts();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::NewPattern));
    }

    #[tokio::test]
    async fn test_alerts_deduplicated_within_window() {
        let (observer, log) = setup();
        for _ in 0..6 {
            log.log_failure(FailureEntry::new("m1", "timed out")).await;
        }
        observer.scan(&log);
        observer.scan(&log);
        let breaches = observer
            .recent_alerts()
            .iter()
            .filter(|a| a.kind == AlertKind::ThresholdBreach)
            .count();
        assert_eq!(breaches, 1);
    }

    #[tokio::test]
    async fn test_recurring_failure_per_model() {
        let (observer, log) = setup();
        for i in 0..10 {
            // Alternate details so several patterns accumulate for one model.
            let details = if i % 2 == 0 {
                "timed out"
            } else {
                "expected tool 'x', no tool was called"
            };
            log.log_failure(FailureEntry::new("flaky", details)).await;
        }
        observer.scan(&log);
        let alerts = observer.recent_alerts();
        assert!(alerts
            .iter()
            .any(|a| a.kind == AlertKind::RecurringFailure && a.key == "model:flaky"));
    }
}
