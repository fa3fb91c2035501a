//! Process startup configuration (C12).
//!
//! Loaded exactly once at process start, before the cache singleton's first
//! use, so the "configure before first use" ordering `cache::manager`
//! enforces at runtime is always satisfied in practice.

use std::path::PathBuf;
use tracing::Level;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    InProcess,
    Remote,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub socket_path: PathBuf,
    pub cache_backend: CacheBackendKind,
    pub remote_cache_host: String,
    pub remote_cache_port: u16,
    pub remote_cache_max_memory_bytes: u64,
    pub log_level: Level,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/reduction-core.sock"),
            cache_backend: CacheBackendKind::InProcess,
            remote_cache_host: "127.0.0.1".to_string(),
            remote_cache_port: 6379,
            remote_cache_max_memory_bytes: 4 * 1024 * 1024 * 1024,
            log_level: Level::INFO,
        }
    }
}

impl EngineConfig {
    /// Reads the process environment, applying the defaults above for
    /// anything unset. Misconfiguration (an unparseable port, an unknown
    /// backend name) is a startup-time error, never a runtime one.
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("REDUCTION_SOCKET_PATH") {
            config.socket_path = PathBuf::from(path);
        }

        if let Ok(backend) = std::env::var("REDUCTION_CACHE_BACKEND") {
            config.cache_backend = match backend.as_str() {
                "in_process" | "memory" => CacheBackendKind::InProcess,
                "remote" | "redis" => CacheBackendKind::Remote,
                other => {
                    return Err(EngineError::Configuration {
                        message: format!("unknown REDUCTION_CACHE_BACKEND '{other}'"),
                    })
                }
            };
        }

        if let Ok(host) = std::env::var("REDUCTION_REDIS_HOST") {
            config.remote_cache_host = host;
        }

        if let Ok(port) = std::env::var("REDUCTION_REDIS_PORT") {
            config.remote_cache_port = port.parse().map_err(|_| EngineError::Configuration {
                message: format!("REDUCTION_REDIS_PORT '{port}' is not a valid port"),
            })?;
        }

        if let Ok(max_mem) = std::env::var("REDUCTION_REDIS_MAX_MEMORY") {
            config.remote_cache_max_memory_bytes =
                max_mem.parse().map_err(|_| EngineError::Configuration {
                    message: format!("REDUCTION_REDIS_MAX_MEMORY '{max_mem}' is not a valid byte count"),
                })?;
        }

        if let Ok(level) = std::env::var("REDUCTION_LOG_LEVEL") {
            config.log_level = level.parse().map_err(|_| EngineError::Configuration {
                message: format!("REDUCTION_LOG_LEVEL '{level}' is not a valid level"),
            })?;
        }

        Ok(config)
    }
}
