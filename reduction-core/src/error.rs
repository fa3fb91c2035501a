//! Single error taxonomy for the engine (C10).
//!
//! Every fallible engine operation returns `Result<T, EngineError>`. Nothing
//! at the engine boundary panics on caller-supplied input; `unwrap`/`expect`
//! are reserved for invariants the engine itself establishes.

use thiserror::Error;

/// A single, structured error kind covering every failure category named
/// in the component design. Variants carry enough context (node index,
/// module id, terminal id) that a caller can render a useful message
/// without re-deriving it from the Template.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("datatype '{id}' already registered with a different definition")]
    RegistryConflict { id: String },

    #[error("module '{id}' not found in registry")]
    ModuleNotFound { id: String },

    #[error("datatype '{id}' not found in registry")]
    DataTypeNotFound { id: String },

    #[error("instrument '{id}' not found in registry")]
    InstrumentNotFound { id: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("Cyclic dependencies amongst {}", nodes.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Cycle { nodes: Vec<usize> },

    #[error("action failed at node {node} (module '{module_id}'): {cause}")]
    ActionFailed {
        node: usize,
        module_id: String,
        cause: String,
    },

    #[error("node {node}, terminal '{terminal}': expected arity 0, 1, or {expected}, got {actual}")]
    ArityMismatch {
        node: usize,
        terminal: String,
        expected: usize,
        actual: usize,
    },

    #[error("node {node}, terminal '{terminal}': required input has no value")]
    MissingRequiredInput { node: usize, terminal: String },

    #[error("cache backend unavailable, falling back to in-process store: {reason}")]
    CacheUnavailable { reason: String },

    #[error("cache manager already configured: call use_remote()/use_in_process() before first get_cache()")]
    CacheAlreadyConfigured,

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("rpc protocol error: {message}")]
    Protocol { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
