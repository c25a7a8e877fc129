//! Model resource manager — exclusive load/unload with coalesced waits.
//!
//! Loading or unloading a model is exclusive per model identity. Rather
//! than a singleton with implicit global state, the manager is an explicit
//! instance passed to callers; internally each model gets one async mutex
//! so a second `ensure_loaded` caller awaits the first caller's in-flight
//! load instead of issuing a duplicate. Runs for *different* models
//! proceed concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::errors::Result;

/// Backend that actually loads and unloads model weights.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, model_id: &str, context_size: u32) -> Result<()>;
    async fn unload(&self, model_id: &str) -> Result<()>;
}

/// Loader for backends that keep models resident (remote APIs). Both
/// operations succeed immediately.
pub struct NoopLoader;

#[async_trait]
impl ModelLoader for NoopLoader {
    async fn load(&self, _model_id: &str, _context_size: u32) -> Result<()> {
        Ok(())
    }

    async fn unload(&self, _model_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SlotState {
    loaded: bool,
    context_size: u32,
}

/// Per-model load state guarded by one async mutex per model.
pub struct ModelResourceManager {
    loader: Arc<dyn ModelLoader>,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<SlotState>>>>,
}

impl ModelResourceManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, model_id: &str) -> Arc<AsyncMutex<SlotState>> {
        let mut slots = self.slots.lock();
        slots
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(SlotState::default())))
            .clone()
    }

    /// Ensure the model is loaded with at least the requested context
    /// size. Concurrent callers for the same model coalesce on the slot
    /// mutex: whoever arrives second finds the load already done.
    pub async fn ensure_loaded(&self, model_id: &str, context_size: u32) -> Result<()> {
        let slot = self.slot(model_id);
        let mut state = slot.lock().await;
        if state.loaded && state.context_size >= context_size {
            return Ok(());
        }
        log::debug!("loading model '{}' (ctx {})", model_id, context_size);
        self.loader.load(model_id, context_size).await?;
        state.loaded = true;
        state.context_size = context_size;
        Ok(())
    }

    /// Unload the model if loaded.
    pub async fn unload(&self, model_id: &str) -> Result<()> {
        let slot = self.slot(model_id);
        let mut state = slot.lock().await;
        if !state.loaded {
            return Ok(());
        }
        self.loader.unload(model_id).await?;
        state.loaded = false;
        state.context_size = 0;
        Ok(())
    }

    /// Whether the model is currently marked loaded.
    pub async fn is_loaded(&self, model_id: &str) -> bool {
        let slot = self.slot(model_id);
        let state = slot.lock().await;
        state.loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Loader that counts load calls and can stall to expose races.
    struct CountingLoader {
        loads: AtomicU32,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self, _model_id: &str, _context_size: u32) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(())
        }

        async fn unload(&self, _model_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_loads_coalesce() {
        let loader = Arc::new(CountingLoader {
            loads: AtomicU32::new(0),
        });
        let manager = Arc::new(ModelResourceManager::new(loader.clone()));

        let a = manager.clone();
        let b = manager.clone();
        let (ra, rb) = tokio::join!(
            a.ensure_loaded("m1", 8192),
            b.ensure_loaded("m1", 8192)
        );
        ra.unwrap();
        rb.unwrap();

        // The second caller waited on the slot mutex and found the model
        // already loaded.
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(manager.is_loaded("m1").await);
    }

    #[tokio::test]
    async fn test_larger_context_triggers_reload() {
        let loader = Arc::new(CountingLoader {
            loads: AtomicU32::new(0),
        });
        let manager = ModelResourceManager::new(loader.clone());
        manager.ensure_loaded("m1", 4096).await.unwrap();
        manager.ensure_loaded("m1", 8192).await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unload() {
        let loader = Arc::new(CountingLoader {
            loads: AtomicU32::new(0),
        });
        let manager = ModelResourceManager::new(loader);
        manager.ensure_loaded("m1", 4096).await.unwrap();
        manager.unload("m1").await.unwrap();
        assert!(!manager.is_loaded("m1").await);
    }
}
