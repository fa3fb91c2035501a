//! Cache abstraction (C6).
//!
//! Two backings behind one `Cache` trait: an unbounded in-process map, and
//! a remote eviction-aware store. Selection is a process-global, one-shot
//! decision enforced by [`CacheManager`], grounded in
//! `original_source/dataflow/cache.py`'s `CacheManager`/`CACHE_MANAGER`.

pub mod memory;
pub mod remote;

use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::config::{CacheBackendKind, EngineConfig};
use crate::error::{EngineError, EngineResult};

/// Keyed byte-store with `exists/get/set`. Implementations may block; the
/// engine itself holds no locks across a call to this trait.
pub trait Cache: Send + Sync {
    fn exists(&self, key: &str) -> bool;
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, bytes: Vec<u8>);
}

enum ManagerState {
    Unconfigured,
    Configured(CacheBackendKind, EngineConfig),
    Materialized(Arc<dyn Cache>),
}

/// Singleton manager with a one-shot `configure -> first_use` transition.
/// `configure` must precede the first `get_cache()`; calling it again
/// after materialization fails.
pub struct CacheManager {
    state: parking_lot::Mutex<ManagerState>,
}

impl CacheManager {
    const fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(ManagerState::Unconfigured),
        }
    }

    /// Selects the backend to use on first `get_cache()`. Must be called
    /// before that first call.
    pub fn configure(&self, backend: CacheBackendKind, config: EngineConfig) -> EngineResult<()> {
        let mut state = self.state.lock();
        match *state {
            ManagerState::Unconfigured => {
                *state = ManagerState::Configured(backend, config);
                Ok(())
            }
            _ => Err(EngineError::CacheAlreadyConfigured),
        }
    }

    /// Lazily materializes the configured backing on first call. If never
    /// explicitly configured, defaults to the in-process store (matching
    /// `EngineConfig::default()`'s backend).
    pub fn get_cache(&self) -> Arc<dyn Cache> {
        let mut state = self.state.lock();
        match &*state {
            ManagerState::Materialized(cache) => cache.clone(),
            ManagerState::Unconfigured => {
                let cache: Arc<dyn Cache> = Arc::new(memory::InProcessCache::new());
                *state = ManagerState::Materialized(cache.clone());
                cache
            }
            ManagerState::Configured(backend, config) => {
                let cache: Arc<dyn Cache> = match backend {
                    CacheBackendKind::InProcess => Arc::new(memory::InProcessCache::new()),
                    CacheBackendKind::Remote => match remote::RemoteCache::connect(config) {
                        Ok(remote_cache) => Arc::new(remote_cache),
                        Err(reason) => {
                            warn!(%reason, "remote cache unavailable, falling back to in-process store");
                            Arc::new(memory::InProcessCache::new())
                        }
                    },
                };
                *state = ManagerState::Materialized(cache.clone());
                cache
            }
        }
    }
}

static MANAGER: OnceLock<CacheManager> = OnceLock::new();

/// Package-level singleton accessor.
pub fn manager() -> &'static CacheManager {
    MANAGER.get_or_init(CacheManager::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_manager_defaults_to_in_process() {
        let manager = CacheManager::new();
        let cache = manager.get_cache();
        cache.set("a", b"1".to_vec());
        assert!(cache.exists("a"));
    }

    #[test]
    fn configure_after_first_use_fails() {
        let manager = CacheManager::new();
        let _ = manager.get_cache();
        let err = manager
            .configure(CacheBackendKind::InProcess, EngineConfig::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::CacheAlreadyConfigured));
    }

    #[test]
    fn configure_before_first_use_succeeds() {
        let manager = CacheManager::new();
        manager
            .configure(CacheBackendKind::InProcess, EngineConfig::default())
            .unwrap();
        let cache = manager.get_cache();
        assert!(!cache.exists("missing"));
    }
}
