//! Reduction engine server: loads configuration, installs logging,
//! configures the cache singleton, and serves the RPC surface.
//!
//! Usage: reduction-core-server
//! Configuration is entirely environment-driven (see `config::EngineConfig`).

use std::sync::Arc;

use tracing::{error, info};

use reduction_core::cache;
use reduction_core::config::EngineConfig;
use reduction_core::registry::Registry;
use reduction_core::rpc::{self, ServerState};
use reduction_core::{logging, EngineResult};

fn run() -> EngineResult<()> {
    let config = EngineConfig::from_env()?;
    logging::init_tracing(config.log_level)?;

    info!(socket_path = %config.socket_path.display(), backend = ?config.cache_backend, "reduction engine starting");

    cache::manager().configure(config.cache_backend, config.clone())?;
    let cache = cache::manager().get_cache();

    let registry = Arc::new(Registry::new());

    let state = ServerState { registry, cache };
    rpc::serve(&config.socket_path, state)
}

fn main() {
    if let Err(e) = run() {
        error!(error = %e, "reduction engine exited with an error");
        std::process::exit(1);
    }
}
