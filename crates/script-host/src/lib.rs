//! Script host for the rule engine
//!
//! Owns the embedded scripting runtime through the capability contract in
//! [`runtime`], exposes the engine globals to scripts, and runs the engine
//! task that serializes all rule evaluation. One script thread per file;
//! reloading a file revokes the rules and timers it owns.

pub mod bridge;
pub mod engine;
pub mod error;
pub mod jsonc;
pub mod loader;
pub mod modules;
pub mod runtime;
pub mod storage;

pub use engine::{EngineConfig, EngineHandle, HostCore, LoadOutcome, ScriptEngine};
pub use error::{EngineError, HostError};
pub use loader::{ContentTracker, LocItem, ScriptError, SourceEntry};
pub use runtime::{
    CallContext, CellReadout, ChangeSource, EvalError, Frame, HostApi, LogLevel, ResolvedModule,
    RuleDef, RuntimeError, ScriptRuntime, SpawnOptions, SpawnResult, ThreadRef, TriggerDef,
};
pub use storage::{PersistentStore, StorageError};
