//! Remote eviction-aware cache backend, grounded in
//! `original_source/dataflow/cache.py`'s `redis_connect`: ping an existing
//! server first; if none answers on `host`, try to start one locally with
//! a memory cap and an LRU eviction policy; if that fails too, the caller
//! falls back to the in-process store (see `cache::manager::get_cache`).

use std::process::{Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use parking_lot::Mutex;
use redis::Commands;

use crate::config::EngineConfig;

use super::Cache;

pub struct RemoteCache {
    connection: Mutex<redis::Connection>,
}

impl RemoteCache {
    /// Connects to `config.remote_cache_host:remote_cache_port`. If the
    /// host is local and nothing answers, attempts to spawn
    /// `redis-server` with `maxmemory` / `maxmemory-policy allkeys-lru`
    /// set per `config.remote_cache_max_memory_bytes`, then retries once.
    pub fn connect(config: &EngineConfig) -> Result<Self, String> {
        let url = format!("redis://{}:{}", config.remote_cache_host, config.remote_cache_port);

        if let Ok(cache) = Self::try_connect(&url) {
            return Ok(cache);
        }

        let is_local = matches!(config.remote_cache_host.as_str(), "127.0.0.1" | "localhost" | "::1");
        if !is_local {
            return Err(format!("no cache server responding at {url}"));
        }

        let max_memory_mb = (config.remote_cache_max_memory_bytes / (1024 * 1024)).max(1);
        let spawned = Command::new("redis-server")
            .arg("--port")
            .arg(config.remote_cache_port.to_string())
            .arg("--maxmemory")
            .arg(format!("{max_memory_mb}mb"))
            .arg("--maxmemory-policy")
            .arg("allkeys-lru")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(_child) => {
                sleep(Duration::from_secs(1));
                Self::try_connect(&url).map_err(|e| format!("started redis-server but could not connect: {e}"))
            }
            Err(e) => Err(format!("could not start a local redis-server: {e}")),
        }
    }

    fn try_connect(url: &str) -> Result<Self, String> {
        let client = redis::Client::open(url).map_err(|e| e.to_string())?;
        let mut connection = client.get_connection().map_err(|e| e.to_string())?;
        redis::cmd("PING")
            .query::<String>(&mut connection)
            .map_err(|e| e.to_string())?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }
}

impl Cache for RemoteCache {
    fn exists(&self, key: &str) -> bool {
        let mut connection = self.connection.lock();
        connection.exists(key).unwrap_or(false)
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut connection = self.connection.lock();
        connection.get(key).ok()
    }

    fn set(&self, key: &str, bytes: Vec<u8>) {
        let mut connection = self.connection.lock();
        let _: Result<(), _> = connection.set(key, bytes);
    }
}
