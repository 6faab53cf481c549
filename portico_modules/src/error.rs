use crate::ModuleState;
use thiserror::Error;

/// An error that might occur while managing a module.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Module {0} is already registered")]
    NameConflict(String),
    #[error("Module {0} is already loaded")]
    AlreadyLoaded(String),
    #[error("Module {0} not found")]
    NotFound(String),
    #[error("Module {0} is not running")]
    NotRunning(String),
    #[error("Module {name} is busy ({state})")]
    Busy { name: String, state: ModuleState },
    #[error("Module {name} is in use ({refcount} references)")]
    InUse { name: String, refcount: usize },
    #[error("Module {name} failed to load: {source:#}")]
    LoadFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Module {name} refused to unload: {source:#}")]
    UnloadRefused {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Module {name} failed to reconfigure: {source:#}")]
    ReconfigureFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Module {0} has no reload handler")]
    NoReloadHandler(String),
    #[error("Invalid configuration for module {name}: {message}")]
    Config { name: String, message: String },
    #[error("Could not open module image {name}: {message}")]
    Image { name: String, message: String },
    #[error("Module image {path} was built against ABI {actual}, expected {expected}")]
    AbiMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },
}

impl ModuleError {
    /// Whether this error means the module was referenced when the operation was attempted.
    pub fn is_in_use(&self) -> bool {
        matches!(self, Self::InUse { .. })
    }
}
