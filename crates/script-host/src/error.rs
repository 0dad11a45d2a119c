//! Error types for the script host

use crate::loader::ScriptError;
use crate::runtime::RuntimeError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced back to scripts through the bridge
#[derive(Error, Debug)]
pub enum HostError {
    /// Bad argument count/types in a bridge call
    #[error("bad arguments: {0}")]
    BadArgs(String),

    /// Rule definition rejected (`defineRule` throws back to the script)
    #[error("{0}")]
    RuleDefinition(String),

    /// Virtual-device definition rejected
    #[error("device definition error: {0}")]
    DeviceDefinition(String),

    /// `require` target not found in any modules directory
    #[error("cannot find module '{0}'")]
    NoSuchModule(String),

    /// Persistent storage was not configured at engine init
    #[error("persistent DB is not initialized")]
    StorageUnavailable,

    /// `readConfig` failure
    #[error("failed to read config file: {0}")]
    Config(String),
}

/// Engine-level failures; initialization errors are fatal
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("path '{0}' is not under the source root")]
    OutsideSourceRoot(String),
}
