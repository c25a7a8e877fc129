//! Persistent-store boundary.
//!
//! The core only asks for CRUD plus upserts keyed by natural unique keys:
//! combo results by (main, executor) pair, failures by a store-assigned
//! rowid, prosthetics by model id. Rows hold a JSON payload column next to
//! the key columns, so the store never has to track the data model
//! field-by-field.
//!
//! Two implementations: an in-memory store for tests and ephemeral runs,
//! and SQLite via `rusqlite` with a fresh connection per operation wrapped
//! in `spawn_blocking`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use rusqlite::{params, Connection};

use crate::battery::ComboTestResult;
use crate::errors::{EngineError, Result};
use crate::failure::FailureEntry;
use crate::prosthetic::ProstheticEntry;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The persistent-store collaborator.
///
/// Implementations map their own errors to [`EngineError::Persistence`];
/// callers decide whether an outage degrades or propagates.
#[async_trait]
pub trait EvalStore: Send + Sync {
    /// Insert or update the row for this (main, executor) pair.
    async fn upsert_combo_result(&self, result: &ComboTestResult) -> Result<()>;

    async fn get_combo_result(
        &self,
        main: &str,
        executor: Option<&str>,
    ) -> Result<Option<ComboTestResult>>;

    async fn list_combo_results(&self) -> Result<Vec<ComboTestResult>>;

    /// Append a failure entry, returning its store-assigned id.
    async fn append_failure(&self, entry: &FailureEntry) -> Result<i64>;

    /// Failures, optionally filtered to one model, oldest first.
    async fn list_failures(&self, model_id: Option<&str>) -> Result<Vec<FailureEntry>>;

    /// Mark a model's unresolved failures resolved by a prosthetic
    /// version. Only entries whose details name one of `probe_ids` flip;
    /// unrelated failures stay open. Returns how many rows flipped.
    async fn resolve_failures(
        &self,
        model_id: &str,
        prosthetic_version: &str,
        probe_ids: &[String],
    ) -> Result<u64>;

    async fn upsert_prosthetic(&self, entry: &ProstheticEntry) -> Result<()>;

    async fn get_prosthetic(&self, model_id: &str) -> Result<Option<ProstheticEntry>>;

    async fn list_prosthetics(&self) -> Result<Vec<ProstheticEntry>>;

    /// Returns false when no entry existed.
    async fn delete_prosthetic(&self, model_id: &str) -> Result<bool>;
}

/// Composite key for the combo-result table. `None` executor maps to the
/// empty string so the pair can be a primary key.
fn pair_key(main: &str, executor: Option<&str>) -> (String, String) {
    (main.to_string(), executor.unwrap_or("").to_string())
}

/// Battery failures are recorded as `"<test id>: <details>"`; a failure
/// is attributable to a probe only when that prefix names it.
fn failure_references(details: &str, probe_ids: &[String]) -> bool {
    match details.split_once(':') {
        Some((id, _)) => probe_ids.iter().any(|p| p == id.trim()),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    combos: HashMap<(String, String), ComboTestResult>,
    failures: Vec<FailureEntry>,
    prosthetics: HashMap<String, ProstheticEntry>,
    next_failure_id: i64,
}

/// In-memory `EvalStore` for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvalStore for MemoryStore {
    async fn upsert_combo_result(&self, result: &ComboTestResult) -> Result<()> {
        let key = pair_key(&result.main_model_id, result.executor_model_id.as_deref());
        self.state.write().combos.insert(key, result.clone());
        Ok(())
    }

    async fn get_combo_result(
        &self,
        main: &str,
        executor: Option<&str>,
    ) -> Result<Option<ComboTestResult>> {
        let key = pair_key(main, executor);
        Ok(self.state.read().combos.get(&key).cloned())
    }

    async fn list_combo_results(&self) -> Result<Vec<ComboTestResult>> {
        Ok(self.state.read().combos.values().cloned().collect())
    }

    async fn append_failure(&self, entry: &FailureEntry) -> Result<i64> {
        let mut state = self.state.write();
        state.next_failure_id += 1;
        let id = state.next_failure_id;
        let mut entry = entry.clone();
        entry.id = Some(id);
        state.failures.push(entry);
        Ok(id)
    }

    async fn list_failures(&self, model_id: Option<&str>) -> Result<Vec<FailureEntry>> {
        Ok(self
            .state
            .read()
            .failures
            .iter()
            .filter(|f| model_id.map(|m| f.model_id == m).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn resolve_failures(
        &self,
        model_id: &str,
        prosthetic_version: &str,
        probe_ids: &[String],
    ) -> Result<u64> {
        let mut resolved = 0;
        for entry in self.state.write().failures.iter_mut() {
            if entry.model_id == model_id
                && !entry.resolved
                && failure_references(&entry.details, probe_ids)
            {
                entry.resolved = true;
                entry.prosthetic_id = Some(prosthetic_version.to_string());
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    async fn upsert_prosthetic(&self, entry: &ProstheticEntry) -> Result<()> {
        self.state
            .write()
            .prosthetics
            .insert(entry.model_id.clone(), entry.clone());
        Ok(())
    }

    async fn get_prosthetic(&self, model_id: &str) -> Result<Option<ProstheticEntry>> {
        Ok(self.state.read().prosthetics.get(model_id).cloned())
    }

    async fn list_prosthetics(&self) -> Result<Vec<ProstheticEntry>> {
        Ok(self.state.read().prosthetics.values().cloned().collect())
    }

    async fn delete_prosthetic(&self, model_id: &str) -> Result<bool> {
        Ok(self.state.write().prosthetics.remove(model_id).is_some())
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// SQLite-backed `EvalStore`. Opens a fresh connection per operation and
/// runs it on the blocking pool.
pub struct SqliteStore {
    db_path: PathBuf,
}

fn persist_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::persistence(e.to_string())
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(persist_err)?;
            }
        }
        let store = Self { db_path };
        store.initialize_db()?;
        Ok(store)
    }

    fn initialize_db(&self) -> Result<()> {
        let conn = Connection::open(&self.db_path).map_err(persist_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS combo_results (
                main_model_id TEXT NOT NULL,
                executor_model_id TEXT NOT NULL DEFAULT '',
                payload TEXT NOT NULL,
                PRIMARY KEY (main_model_id, executor_model_id)
            );
            CREATE TABLE IF NOT EXISTS failures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS prosthetics (
                model_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            );",
        )
        .map_err(persist_err)?;
        Ok(())
    }

    /// Run one closure against a fresh connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(persist_err)?;
            op(&conn)
        })
        .await
        .map_err(persist_err)?
    }
}

#[async_trait]
impl EvalStore for SqliteStore {
    async fn upsert_combo_result(&self, result: &ComboTestResult) -> Result<()> {
        let (main, executor) = pair_key(&result.main_model_id, result.executor_model_id.as_deref());
        let payload = serde_json::to_string(result).map_err(persist_err)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO combo_results (main_model_id, executor_model_id, payload)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (main_model_id, executor_model_id)
                 DO UPDATE SET payload = excluded.payload",
                params![main, executor, payload],
            )
            .map_err(persist_err)?;
            Ok(())
        })
        .await
    }

    async fn get_combo_result(
        &self,
        main: &str,
        executor: Option<&str>,
    ) -> Result<Option<ComboTestResult>> {
        let (main, executor) = pair_key(main, executor);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT payload FROM combo_results
                     WHERE main_model_id = ?1 AND executor_model_id = ?2",
                )
                .map_err(persist_err)?;
            let mut rows = stmt
                .query_map(params![main, executor], |row| row.get::<_, String>(0))
                .map_err(persist_err)?;
            match rows.next() {
                Some(payload) => {
                    let payload = payload.map_err(persist_err)?;
                    Ok(Some(serde_json::from_str(&payload).map_err(persist_err)?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_combo_results(&self) -> Result<Vec<ComboTestResult>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT payload FROM combo_results ORDER BY main_model_id")
                .map_err(persist_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(persist_err)?;
            let mut results = Vec::new();
            for payload in rows {
                let payload = payload.map_err(persist_err)?;
                results.push(serde_json::from_str(&payload).map_err(persist_err)?);
            }
            Ok(results)
        })
        .await
    }

    async fn append_failure(&self, entry: &FailureEntry) -> Result<i64> {
        let model_id = entry.model_id.clone();
        let resolved = entry.resolved;
        let payload = serde_json::to_string(entry).map_err(persist_err)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO failures (model_id, resolved, payload) VALUES (?1, ?2, ?3)",
                params![model_id, resolved as i64, payload],
            )
            .map_err(persist_err)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list_failures(&self, model_id: Option<&str>) -> Result<Vec<FailureEntry>> {
        let model_id = model_id.map(str::to_string);
        self.with_conn(move |conn| {
            let (sql, filter) = match model_id {
                Some(m) => (
                    "SELECT id, payload FROM failures WHERE model_id = ?1 ORDER BY id",
                    Some(m),
                ),
                None => ("SELECT id, payload FROM failures ORDER BY id", None),
            };
            let mut stmt = conn.prepare(sql).map_err(persist_err)?;
            let map_row = |row: &rusqlite::Row<'_>| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            };
            let rows = match filter {
                Some(m) => stmt.query_map(params![m], map_row),
                None => stmt.query_map([], map_row),
            }
            .map_err(persist_err)?;

            let mut results = Vec::new();
            for row in rows {
                let (id, payload) = row.map_err(persist_err)?;
                let mut entry: FailureEntry =
                    serde_json::from_str(&payload).map_err(persist_err)?;
                entry.id = Some(id);
                results.push(entry);
            }
            Ok(results)
        })
        .await
    }

    async fn resolve_failures(
        &self,
        model_id: &str,
        prosthetic_version: &str,
        probe_ids: &[String],
    ) -> Result<u64> {
        let model_id = model_id.to_string();
        let version = prosthetic_version.to_string();
        let probe_ids = probe_ids.to_vec();
        self.with_conn(move |conn| {
            // Payload and the resolved column both carry the flag, so the
            // rows are rewritten rather than column-patched.
            let mut stmt = conn
                .prepare("SELECT id, payload FROM failures WHERE model_id = ?1 AND resolved = 0")
                .map_err(persist_err)?;
            let rows = stmt
                .query_map(params![model_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(persist_err)?;

            let mut pending = Vec::new();
            for row in rows {
                let (id, payload) = row.map_err(persist_err)?;
                let mut entry: FailureEntry =
                    serde_json::from_str(&payload).map_err(persist_err)?;
                if !failure_references(&entry.details, &probe_ids) {
                    continue;
                }
                entry.id = Some(id);
                entry.resolved = true;
                entry.prosthetic_id = Some(version.clone());
                pending.push((id, serde_json::to_string(&entry).map_err(persist_err)?));
            }
            drop(stmt);

            let mut resolved = 0;
            for (id, payload) in pending {
                resolved += conn
                    .execute(
                        "UPDATE failures SET resolved = 1, payload = ?2 WHERE id = ?1",
                        params![id, payload],
                    )
                    .map_err(persist_err)? as u64;
            }
            Ok(resolved)
        })
        .await
    }

    async fn upsert_prosthetic(&self, entry: &ProstheticEntry) -> Result<()> {
        let model_id = entry.model_id.clone();
        let payload = serde_json::to_string(entry).map_err(persist_err)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO prosthetics (model_id, payload) VALUES (?1, ?2)
                 ON CONFLICT (model_id) DO UPDATE SET payload = excluded.payload",
                params![model_id, payload],
            )
            .map_err(persist_err)?;
            Ok(())
        })
        .await
    }

    async fn get_prosthetic(&self, model_id: &str) -> Result<Option<ProstheticEntry>> {
        let model_id = model_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT payload FROM prosthetics WHERE model_id = ?1")
                .map_err(persist_err)?;
            let mut rows = stmt
                .query_map(params![model_id], |row| row.get::<_, String>(0))
                .map_err(persist_err)?;
            match rows.next() {
                Some(payload) => {
                    let payload = payload.map_err(persist_err)?;
                    Ok(Some(serde_json::from_str(&payload).map_err(persist_err)?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_prosthetics(&self) -> Result<Vec<ProstheticEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT payload FROM prosthetics ORDER BY model_id")
                .map_err(persist_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(persist_err)?;
            let mut results = Vec::new();
            for payload in rows {
                let payload = payload.map_err(persist_err)?;
                results.push(serde_json::from_str(&payload).map_err(persist_err)?);
            }
            Ok(results)
        })
        .await
    }

    async fn delete_prosthetic(&self, model_id: &str) -> Result<bool> {
        let model_id = model_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute("DELETE FROM prosthetics WHERE model_id = ?1", params![model_id])
                .map_err(persist_err)?;
            Ok(deleted > 0)
        })
        .await
    }
}
