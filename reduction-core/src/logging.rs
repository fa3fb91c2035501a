//! Structured logging install (C11).
//!
//! The process installs a single global `tracing` subscriber at startup;
//! everything else in the crate narrates through `tracing::{debug,info,warn,error}`
//! rather than `println!`. Library code never installs its own subscriber —
//! only `main` calls `init_tracing`.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::error::{EngineError, EngineResult};

/// Installs the process-wide tracing subscriber. Safe to call at most once;
/// a second call returns an error rather than panicking, mirroring the
/// engine's general "no panics on caller-observable conditions" policy.
pub fn init_tracing(level: Level) -> EngineResult<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|e| EngineError::Configuration {
        message: format!("tracing subscriber already installed: {e}"),
    })
}
