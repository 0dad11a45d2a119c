//! The capability contract between the engine and the embedded
//! scripting runtime
//!
//! The interpreter itself is a collaborator; the engine requires the
//! [`ScriptRuntime`] capabilities from it and offers the [`HostApi`]
//! surface back. Captured script functions and threads cross the
//! boundary as opaque handles; values cross as the tagged union from
//! `cell-model`.
//!
//! The runtime's library glue is expected to expose the fixed global
//! names (`defineVirtualDevice`, `defineRule`, `dev`, `timers`,
//! `startTimer`, `startTicker`, `setTimeout`, `setInterval`,
//! `clearTimeout`, `clearInterval`, `publish`, `runShellCommand`,
//! `spawn`, `log`, `debug`, `readConfig`, `runRules`, `cron`, and the
//! `module.*` variants) on a shared prototype that every per-script
//! thread's global object inherits from.

use crate::error::HostError;
use cell_model::Value;
use rule_engine::{FuncRef, RuleId, TimerId};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Opaque handle to a script thread (an isolated global environment
/// sharing the runtime heap)
pub type ThreadRef = u64;

/// One traceback frame as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub file: PathBuf,
    pub line: u32,
}

/// A raw script error with physical paths in its traceback
///
/// Frames are ordered outermost first; the loader rewrites them to
/// virtual paths for the source map.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
    pub traceback: Vec<Frame>,
}

/// Runtime bring-up failures; these are fatal at engine init
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("failed to load runtime library: {0}")]
    LibraryInit(String),

    #[error("script runtime error: {0}")]
    Internal(String),
}

/// Context the runtime supplies with each host call
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Physical path of the script owning the executing thread
    pub script: Option<PathBuf>,
    /// Module filename when the call came through a `module.*` global
    pub module: Option<PathBuf>,
    /// Traceback at the call site, outermost frame first
    pub traceback: Vec<Frame>,
}

impl CallContext {
    /// Line of the deepest frame inside the given file, used to locate
    /// device/rule declarations for the editor view.
    #[must_use]
    pub fn line_in(&self, file: &Path) -> Option<u32> {
        self.traceback
            .iter()
            .rev()
            .find(|frame| frame.file == file)
            .map(|frame| frame.line)
    }
}

/// One element of a `whenChanged` trigger
#[derive(Debug, Clone)]
pub enum ChangeSource {
    /// `"dev/cell"` reference
    Cell(String),
    /// Expression whose return value is watched
    Func(FuncRef),
}

/// Rule trigger as compiled by the script-side glue
///
/// The variants are mutually exclusive by construction; combining
/// `when` with `asSoonAs` etc. is diagnosed in the glue before the
/// definition reaches the host.
#[derive(Debug, Clone)]
pub enum TriggerDef {
    When(FuncRef),
    AsSoonAs(FuncRef),
    WhenChanged(Vec<ChangeSource>),
    Cron(String),
}

/// A rule definition crossing the boundary
#[derive(Debug, Clone)]
pub struct RuleDef {
    pub trigger: TriggerDef,
    pub then: Option<FuncRef>,
}

/// Tracked cell read result
#[derive(Debug, Clone)]
pub struct CellReadout {
    pub value: Value,
    pub complete: bool,
}

/// A module resolved for `require`
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    /// Physical path; becomes the module object's `filename` and keys
    /// the shared per-module storage object
    pub path: PathBuf,
    pub source: String,
}

/// Log levels of the `log.*` globals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Options for `spawn`
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub capture_output: bool,
    pub capture_error_output: bool,
    pub input: Option<String>,
}

/// Completion record of a spawned command
///
/// The exit callback receives `(exitStatus, capturedOutput,
/// capturedErrorOutput)`; the glue assembles its result object from
/// those.
#[derive(Debug, Clone, Default)]
pub struct SpawnResult {
    pub exit_status: i64,
    pub captured_output: String,
    pub captured_error_output: String,
}

/// What the engine offers to the runtime's library glue
///
/// Every method may be called re-entrantly from inside a
/// [`ScriptRuntime::call`]; implementations must not hold borrows across
/// host calls. Operations that would start a new scan (cell writes,
/// `runRules`) are deferred onto the engine task's queue instead of
/// running inline.
pub trait HostApi {
    /// `defineVirtualDevice(name, spec)`; returns the (possibly
    /// module-expanded) device id.
    fn define_virtual_device(
        &self,
        ctx: &CallContext,
        name: &str,
        spec: serde_json::Value,
    ) -> Result<String, HostError>;

    /// `module.virtualDeviceId(name)`
    fn virtual_device_id(&self, ctx: &CallContext, name: &str) -> String;

    /// `defineRule([name,] spec)`; returns the rule id.
    fn define_rule(
        &self,
        ctx: &CallContext,
        name: Option<&str>,
        def: RuleDef,
    ) -> Result<RuleId, HostError>;

    /// `runRules()`: schedules a full scan.
    fn run_rules(&self);

    /// Tracked read through the `dev` proxy (`dev["d/c"]`).
    fn cell_read(&self, cell: &str) -> Result<CellReadout, HostError>;

    /// Write through the `dev` proxy (`dev["d/c"] = v`).
    fn cell_write(&self, cell: &str, value: Value) -> Result<(), HostError>;

    /// `dev["d/c"].isComplete()`
    fn cell_is_complete(&self, cell: &str) -> bool;

    /// `startTimer` / `startTicker` / `setTimeout` / `setInterval`.
    fn start_timer(
        &self,
        ctx: &CallContext,
        name: Option<String>,
        interval_ms: f64,
        periodic: bool,
        callback: Option<FuncRef>,
    ) -> Result<TimerId, HostError>;

    /// `clearTimeout` / `clearInterval`.
    fn stop_timer_by_id(&self, id: TimerId);

    /// `timers[name].stop()`
    fn stop_timer_by_name(&self, name: &str);

    /// `timers[name].firing`; also records the timer as a dependency of
    /// the rule being scanned.
    fn timer_firing(&self, name: &str) -> bool;

    /// `publish(topic, payload, qos, retained)`
    fn publish(&self, topic: &str, payload: &str, qos: u8, retained: bool)
        -> Result<(), HostError>;

    /// `spawn(command, args, options)`: detached worker; the exit
    /// callback re-enters the engine task.
    fn spawn(
        &self,
        ctx: &CallContext,
        command: Vec<String>,
        options: SpawnOptions,
        callback: Option<FuncRef>,
    ) -> Result<(), HostError>;

    /// `log(...)`, `log.debug/info/warning/error(...)`, `debug(...)`.
    fn log(&self, level: LogLevel, message: &str);

    /// `readConfig(path)`: JSON with comments and trailing commas.
    fn read_config(&self, path: &str) -> Result<serde_json::Value, HostError>;

    /// Bucket name for `module.PersistentStorage(name)` /
    /// `PersistentStorage(name)`.
    fn persistent_name(&self, ctx: &CallContext, name: &str) -> Result<String, HostError>;

    /// `storage.get(key)`; `None` maps to `undefined` in scripts.
    fn persistent_get(&self, bucket: &str, key: &str) -> Option<serde_json::Value>;

    /// `storage.set(key, value)`; failures are logged and otherwise
    /// silent.
    fn persistent_set(&self, bucket: &str, key: &str, value: &serde_json::Value);

    /// `require(id)` source lookup; the runtime evaluates the returned
    /// source and attaches the per-module storage object keyed by the
    /// resolved physical path.
    fn resolve_module(&self, id: &str) -> Result<ResolvedModule, HostError>;
}

/// What the engine requires from the embedded interpreter
pub trait ScriptRuntime {
    /// Install the library glue and bind the host bridge. Called once at
    /// engine init; failure is fatal.
    fn bind(&self, host: Rc<dyn HostApi>) -> Result<(), RuntimeError>;

    /// Create a script thread: an isolated global environment whose
    /// prototype chain ends at the shared module prototype.
    fn spawn_thread(&self, script: &Path) -> Result<ThreadRef, RuntimeError>;

    /// Tear down a script thread.
    fn drop_thread(&self, thread: ThreadRef);

    /// Evaluate a script file inside the given thread.
    fn eval_file(&self, thread: ThreadRef, path: &Path) -> Result<(), EvalError>;

    /// Evaluate a string in the shared global environment.
    fn eval(&self, code: &str) -> Result<Value, EvalError>;

    /// Invoke a captured function.
    fn call(&self, func: FuncRef, args: &[Value]) -> Result<Value, EvalError>;

    /// Release a captured function handle.
    fn release(&self, func: FuncRef);
}
