//! HTTP surface for the evaluation engine.
//!
//! Thin pass-throughs only: handlers validate nothing beyond JSON shape
//! and delegate straight to the battery executor, prosthetic manager,
//! distillation engine, and failure observer. Business logic stays in
//! those components.

pub mod routes;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::battery::{CancelToken, ComboTestResult, RunRequest, RunStatus};

pub use routes::{app_router, AppState};

/// One tracked evaluation run.
pub struct RunRecord {
    pub id: String,
    pub request: RunRequest,
    pub cancel: CancelToken,
    status: RwLock<RunStatus>,
    result: RwLock<Option<ComboTestResult>>,
}

impl RunRecord {
    fn new(id: String, request: RunRequest) -> Self {
        Self {
            id,
            request,
            cancel: CancelToken::new(),
            status: RwLock::new(RunStatus::Pending),
            result: RwLock::new(None),
        }
    }

    pub fn status(&self) -> RunStatus {
        *self.status.read()
    }

    pub fn result(&self) -> Option<ComboTestResult> {
        self.result.read().clone()
    }

    pub fn finish(&self, result: ComboTestResult) {
        *self.status.write() = result.status;
        *self.result.write() = Some(result);
    }
}

/// In-memory table of active and finished runs, keyed by run id, so the
/// HTTP surface can poll status while a run executes in its own task.
#[derive(Default)]
pub struct RunTable {
    runs: DashMap<String, Arc<RunRecord>>,
}

impl RunTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: String, request: RunRequest) -> Arc<RunRecord> {
        let record = Arc::new(RunRecord::new(id.clone(), request));
        self.runs.insert(id, Arc::clone(&record));
        record
    }

    pub fn get(&self, id: &str) -> Option<Arc<RunRecord>> {
        self.runs.get(id).map(|r| Arc::clone(&r))
    }

    pub fn ids(&self) -> Vec<String> {
        self.runs.iter().map(|r| r.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TestMode;

    #[test]
    fn test_run_table_lifecycle() {
        let table = RunTable::new();
        let record = table.insert(
            "run-1".to_string(),
            RunRequest::single("m1", TestMode::Quick),
        );
        assert_eq!(record.status(), RunStatus::Pending);
        assert!(record.result().is_none());
        assert!(table.get("run-1").is_some());
        assert!(table.get("run-2").is_none());

        let mut result = ComboTestResult::started(&record.request);
        result.status = RunStatus::Complete;
        record.finish(result);
        assert_eq!(table.get("run-1").unwrap().status(), RunStatus::Complete);
    }
}
