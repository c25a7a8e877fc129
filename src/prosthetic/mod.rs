//! Prosthetic prompts — versioned corrective patches per model.
//!
//! A prosthetic is a system-prompt patch attached to one model. Its
//! version history is append-only with a separate current pointer: every
//! edit appends a `ProstheticVersion` and moves the pointer, so prior
//! prompts stay retrievable and a revert is just pointing at an older
//! version. The level may only rise across edits; lowering it requires an
//! explicit revert.
//!
//! `verified` is earned, never assumed: it flips true only after a
//! dedicated battery re-run shows every probe in `probes_fixed` passing
//! with the current prompt installed, and any edit clears it again.

pub mod distillation;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::battery::{BatteryExecutor, RunRequest};
use crate::errors::{EngineError, Result};
use crate::interfaces::store::EvalStore;
use crate::registry::TestMode;

pub const MIN_LEVEL: u8 = 1;
pub const MAX_LEVEL: u8 = 4;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// One immutable snapshot in a prosthetic's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProstheticVersion {
    pub id: String,
    /// Intervention level 1..4, from gentle reminder to strict directive.
    pub level: u8,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub learned_from_model: Option<String>,
}

/// The prosthetic attached to one model. `prompt` and `level` mirror the
/// current version so readers never have to walk the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProstheticEntry {
    pub model_id: String,
    pub level: u8,
    pub prompt: String,
    /// Probe ids this prosthetic is meant to fix.
    #[serde(default)]
    pub probes_fixed: Vec<String>,
    /// Per-category score deltas observed after application.
    #[serde(default)]
    pub category_improvements: HashMap<String, f64>,
    pub verified: bool,
    /// Id of the version currently in effect. Always present in `versions`.
    pub current_version: String,
    pub versions: Vec<ProstheticVersion>,
    #[serde(default)]
    pub learned_from_model: Option<String>,
}

impl ProstheticEntry {
    pub fn current(&self) -> Option<&ProstheticVersion> {
        self.versions.iter().find(|v| v.id == self.current_version)
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns prosthetic lifecycle: create/edit, revert, verify, delete.
pub struct ProstheticManager {
    store: Arc<dyn EvalStore>,
}

/// Parameters for a create-or-edit call.
#[derive(Debug, Clone)]
pub struct ProstheticEdit {
    pub model_id: String,
    pub prompt: String,
    pub level: u8,
    pub probes_fixed: Vec<String>,
    pub learned_from_model: Option<String>,
}

impl ProstheticManager {
    pub fn new(store: Arc<dyn EvalStore>) -> Self {
        Self { store }
    }

    /// Create a model's prosthetic or append a new version to it.
    ///
    /// The level must stay within 1..4 and may not decrease relative to
    /// the current version; [`ProstheticManager::revert`] is the explicit
    /// path back down. Any edit clears `verified`.
    pub async fn create_or_edit(&self, edit: ProstheticEdit) -> Result<ProstheticEntry> {
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&edit.level) {
            return Err(EngineError::configuration(format!(
                "prosthetic level {} outside {}..{}",
                edit.level, MIN_LEVEL, MAX_LEVEL
            )));
        }
        if edit.prompt.trim().is_empty() {
            return Err(EngineError::configuration("prosthetic prompt is empty"));
        }

        let existing = self.store.get_prosthetic(&edit.model_id).await?;
        if let Some(ref entry) = existing {
            if edit.level < entry.level {
                return Err(EngineError::configuration(format!(
                    "prosthetic level may not decrease ({} -> {}); revert instead",
                    entry.level, edit.level
                )));
            }
        }

        let version = ProstheticVersion {
            id: Uuid::new_v4().to_string(),
            level: edit.level,
            prompt: edit.prompt.clone(),
            created_at: Utc::now(),
            learned_from_model: edit.learned_from_model.clone(),
        };

        let entry = match existing {
            Some(mut entry) => {
                entry.level = version.level;
                entry.prompt = version.prompt.clone();
                entry.current_version = version.id.clone();
                entry.verified = false;
                if !edit.probes_fixed.is_empty() {
                    entry.probes_fixed = edit.probes_fixed;
                }
                if edit.learned_from_model.is_some() {
                    entry.learned_from_model = edit.learned_from_model;
                }
                entry.versions.push(version);
                entry
            }
            None => ProstheticEntry {
                model_id: edit.model_id.clone(),
                level: version.level,
                prompt: version.prompt.clone(),
                probes_fixed: edit.probes_fixed,
                category_improvements: HashMap::new(),
                verified: false,
                current_version: version.id.clone(),
                versions: vec![version],
                learned_from_model: edit.learned_from_model,
            },
        };

        self.store.upsert_prosthetic(&entry).await?;
        log::info!(
            "prosthetic for '{}' now at version {} (level {})",
            entry.model_id,
            entry.current_version,
            entry.level
        );
        Ok(entry)
    }

    /// Point the current version at a prior one. History is untouched.
    pub async fn revert(&self, model_id: &str, version_id: &str) -> Result<ProstheticEntry> {
        let mut entry = self
            .store
            .get_prosthetic(model_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("prosthetic for '{}'", model_id)))?;

        let version = entry
            .versions
            .iter()
            .find(|v| v.id == version_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::not_found(format!("version '{}' of prosthetic '{}'", version_id, model_id))
            })?;

        entry.current_version = version.id.clone();
        entry.level = version.level;
        entry.prompt = version.prompt;
        entry.verified = false;
        self.store.upsert_prosthetic(&entry).await?;
        Ok(entry)
    }

    /// Re-run the probes in `probes_fixed` with the current prompt
    /// installed as the system prompt. `verified` flips true only when all
    /// of them pass, and the model's open failure entries for those probes
    /// are then marked resolved against this version.
    pub async fn verify(
        &self,
        model_id: &str,
        executor: &BatteryExecutor,
    ) -> Result<ProstheticEntry> {
        let mut entry = self
            .store
            .get_prosthetic(model_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("prosthetic for '{}'", model_id)))?;

        if entry.probes_fixed.is_empty() {
            return Err(EngineError::configuration(
                "prosthetic has no probes_fixed to verify against",
            ));
        }

        let mut request = RunRequest::single(model_id, TestMode::Quick);
        request.system_prompt = Some(entry.prompt.clone());
        let results = executor.run_probes(&request, &entry.probes_fixed).await?;

        entry.verified = results.iter().all(|r| r.passed);
        self.store.upsert_prosthetic(&entry).await?;

        if entry.verified {
            self.store
                .resolve_failures(model_id, &entry.current_version, &entry.probes_fixed)
                .await?;
            log::info!("prosthetic for '{}' verified", model_id);
        } else {
            let failed: Vec<&str> = results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| r.id.as_str())
                .collect();
            log::info!(
                "prosthetic for '{}' failed verification on {:?}",
                model_id,
                failed
            );
        }
        Ok(entry)
    }

    pub async fn get(&self, model_id: &str) -> Result<Option<ProstheticEntry>> {
        self.store.get_prosthetic(model_id).await
    }

    pub async fn list(&self) -> Result<Vec<ProstheticEntry>> {
        self.store.list_prosthetics().await
    }

    pub async fn delete(&self, model_id: &str) -> Result<bool> {
        self.store.delete_prosthetic(model_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::tests::{competent_invoker, executor_with};
    use crate::failure::FailureEntry;
    use crate::interfaces::store::MemoryStore;

    fn manager() -> ProstheticManager {
        ProstheticManager::new(Arc::new(MemoryStore::new()))
    }

    fn edit(model: &str, level: u8, prompt: &str) -> ProstheticEdit {
        ProstheticEdit {
            model_id: model.to_string(),
            prompt: prompt.to_string(),
            level,
            probes_fixed: vec!["single_tool.1".to_string()],
            learned_from_model: None,
        }
    }

    #[tokio::test]
    async fn test_edit_appends_versions() {
        let manager = manager();
        let first = manager.create_or_edit(edit("m1", 1, "Always read before writing.")).await.unwrap();
        assert_eq!(first.versions.len(), 1);
        assert_eq!(first.current_version, first.versions[0].id);

        let second = manager.create_or_edit(edit("m1", 2, "Read the file first, always.")).await.unwrap();
        assert_eq!(second.versions.len(), 2);
        assert_eq!(second.current_version, second.versions[1].id);
        assert_eq!(second.level, 2);
        assert!(!second.verified);
    }

    #[tokio::test]
    async fn test_level_cannot_decrease() {
        let manager = manager();
        manager.create_or_edit(edit("m1", 3, "v1")).await.unwrap();
        let err = manager.create_or_edit(edit("m1", 2, "v2")).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_level_bounds_and_empty_prompt_rejected() {
        let manager = manager();
        assert!(manager.create_or_edit(edit("m1", 0, "x")).await.is_err());
        assert!(manager.create_or_edit(edit("m1", 5, "x")).await.is_err());
        assert!(manager.create_or_edit(edit("m1", 1, "   ")).await.is_err());
    }

    #[tokio::test]
    async fn test_revert_moves_pointer_without_shrinking_history() {
        let manager = manager();
        let first = manager.create_or_edit(edit("m1", 1, "v1")).await.unwrap();
        let first_version = first.current_version.clone();
        manager.create_or_edit(edit("m1", 3, "v3")).await.unwrap();

        let reverted = manager.revert("m1", &first_version).await.unwrap();
        assert_eq!(reverted.current_version, first_version);
        assert_eq!(reverted.level, 1);
        assert_eq!(reverted.prompt, "v1");
        assert_eq!(reverted.versions.len(), 2);

        // A lower level is allowed again after the explicit revert.
        let next = manager.create_or_edit(edit("m1", 2, "v2")).await.unwrap();
        assert_eq!(next.level, 2);
        assert_eq!(next.versions.len(), 3);
    }

    #[tokio::test]
    async fn test_revert_unknown_version() {
        let manager = manager();
        manager.create_or_edit(edit("m1", 1, "v1")).await.unwrap();
        let err = manager.revert("m1", "nope").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_verify_flips_only_on_all_passing() {
        let invoker = Arc::new(competent_invoker());
        invoker.script(
            "src/main.rs",
            crate::battery::tests::tool_response(
                "read_file",
                &[("filepath", serde_json::json!("src/main.rs"))],
            ),
        );
        let executor = executor_with(invoker);
        let manager = ProstheticManager::new(Arc::new(MemoryStore::new()));
        manager
            .create_or_edit(ProstheticEdit {
                model_id: "m1".to_string(),
                prompt: "Use tools for file access.".to_string(),
                level: 1,
                probes_fixed: vec!["single_tool.1".to_string()],
                learned_from_model: None,
            })
            .await
            .unwrap();

        let entry = manager.verify("m1", &executor).await.unwrap();
        assert!(entry.verified);
    }

    #[tokio::test]
    async fn test_verify_resolves_only_covered_failures() {
        let invoker = Arc::new(competent_invoker());
        invoker.script(
            "src/main.rs",
            crate::battery::tests::tool_response(
                "read_file",
                &[("filepath", serde_json::json!("src/main.rs"))],
            ),
        );
        let executor = executor_with(invoker);

        let store = Arc::new(MemoryStore::new());
        store
            .append_failure(&FailureEntry::new("m1", "single_tool.1: no tool call"))
            .await
            .unwrap();
        store
            .append_failure(&FailureEntry::new("m1", "reasoning.2: no hypothesis stated"))
            .await
            .unwrap();

        let manager = ProstheticManager::new(store.clone());
        manager
            .create_or_edit(edit("m1", 1, "Use tools for file access."))
            .await
            .unwrap();
        let entry = manager.verify("m1", &executor).await.unwrap();
        assert!(entry.verified);

        // The reasoning failure is not in probes_fixed and stays open.
        let failures = store.list_failures(Some("m1")).await.unwrap();
        let resolved: Vec<_> = failures.iter().filter(|f| f.resolved).collect();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].details.starts_with("single_tool.1"));
    }
}
