//! Test doubles: a scripted runtime and a recording publisher
//!
//! `FakeRuntime` satisfies the `ScriptRuntime` contract with scripts
//! written as Rust closures over the host bridge, which is enough to
//! exercise the engine end-to-end without an embedded interpreter.

#![allow(dead_code)]

use script_host::engine::{EngineCall, EngineConfig, EngineHandle, ScriptEngine};
use script_host::runtime::{
    CallContext, EvalError, Frame, HostApi, ResolvedModule, ScriptRuntime, ThreadRef,
};
use cell_model::Value;
use mqtt_io::transport::{Publisher, TransportError};
use rule_engine::FuncRef;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type ScriptBody = Rc<dyn Fn(&ScriptCtx) -> Result<(), String>>;
type ScriptFunc = Rc<dyn Fn(&[Value]) -> Result<Value, String>>;

#[derive(Default)]
struct FakeInner {
    host: Option<Rc<dyn HostApi>>,
    scripts: HashMap<PathBuf, ScriptBody>,
    modules: HashMap<PathBuf, ScriptBody>,
    evaluated_modules: HashSet<PathBuf>,
    funcs: HashMap<FuncRef, ScriptFunc>,
    released: Vec<FuncRef>,
    next_func: FuncRef,
    threads: HashMap<ThreadRef, PathBuf>,
    next_thread: ThreadRef,
    module_storages: HashMap<PathBuf, u64>,
    next_object: u64,
}

/// Scripted stand-in for the embedded interpreter
#[derive(Clone, Default)]
pub struct FakeRuntime {
    inner: Rc<RefCell<FakeInner>>,
}

/// Execution context handed to script closures
#[derive(Clone)]
pub struct ScriptCtx {
    inner: Rc<RefCell<FakeInner>>,
    /// Physical path of the script owning the current thread
    pub script: Option<PathBuf>,
}

impl FakeRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body evaluated for a script path.
    pub fn register_script(
        &self,
        path: &Path,
        body: impl Fn(&ScriptCtx) -> Result<(), String> + 'static,
    ) {
        self.inner
            .borrow_mut()
            .scripts
            .insert(path.to_path_buf(), Rc::new(body));
    }

    /// Register the body evaluated the first time a module is required.
    pub fn register_module(
        &self,
        path: &Path,
        body: impl Fn(&ScriptCtx) -> Result<(), String> + 'static,
    ) {
        self.inner
            .borrow_mut()
            .modules
            .insert(path.to_path_buf(), Rc::new(body));
    }

    /// The bound host bridge.
    #[must_use]
    pub fn host(&self) -> Rc<dyn HostApi> {
        self.inner
            .borrow()
            .host
            .clone()
            .expect("runtime not bound to an engine")
    }

    /// Whether a captured function was released.
    #[must_use]
    pub fn is_released(&self, func: FuncRef) -> bool {
        self.inner.borrow().released.contains(&func)
    }

    fn ctx(&self, script: Option<PathBuf>) -> ScriptCtx {
        ScriptCtx {
            inner: Rc::clone(&self.inner),
            script,
        }
    }
}

impl ScriptCtx {
    #[must_use]
    pub fn host(&self) -> Rc<dyn HostApi> {
        self.inner
            .borrow()
            .host
            .clone()
            .expect("runtime not bound to an engine")
    }

    /// Capture a closure as a script function.
    pub fn capture(&self, func: impl Fn(&[Value]) -> Value + 'static) -> FuncRef {
        self.capture_fallible(move |args| Ok(func(args)))
    }

    /// Capture a closure that may throw.
    pub fn capture_fallible(
        &self,
        func: impl Fn(&[Value]) -> Result<Value, String> + 'static,
    ) -> FuncRef {
        let mut inner = self.inner.borrow_mut();
        inner.next_func += 1;
        let id = inner.next_func;
        inner.funcs.insert(id, Rc::new(func));
        id
    }

    /// Call context for a top-level statement at the given line.
    #[must_use]
    pub fn context_at(&self, line: u32) -> CallContext {
        CallContext {
            script: self.script.clone(),
            module: None,
            traceback: self
                .script
                .iter()
                .map(|file| Frame {
                    file: file.clone(),
                    line,
                })
                .collect(),
        }
    }

    /// Call context for a top-level statement.
    #[must_use]
    pub fn context(&self) -> CallContext {
        self.context_at(1)
    }

    /// Call context as seen from inside the given module.
    #[must_use]
    pub fn module_context(&self, module: &Path) -> CallContext {
        CallContext {
            module: Some(module.to_path_buf()),
            ..self.context()
        }
    }

    /// Convenience tracked read through the `dev` proxy.
    #[must_use]
    pub fn read_cell(&self, cell: &str) -> Value {
        self.host()
            .cell_read(cell)
            .map_or(Value::Null, |readout| readout.value)
    }

    /// `require(id)`: resolve through the host, evaluate the module body
    /// once, and return `(filename, storage)`; the storage handle is
    /// object-identical across requires from any thread.
    pub fn require(&self, id: &str) -> Result<(PathBuf, u64), String> {
        let resolved: ResolvedModule =
            self.host().resolve_module(id).map_err(|e| e.to_string())?;
        let (storage, first_eval, body) = {
            let mut inner = self.inner.borrow_mut();
            let next = inner.next_object + 1;
            let storage = match inner.module_storages.get(&resolved.path) {
                Some(existing) => *existing,
                None => {
                    inner.next_object = next;
                    inner.module_storages.insert(resolved.path.clone(), next);
                    next
                }
            };
            let first_eval = inner.evaluated_modules.insert(resolved.path.clone());
            let body = inner.modules.get(&resolved.path).cloned();
            (storage, first_eval, body)
        };
        if first_eval {
            if let Some(body) = body {
                let ctx = ScriptCtx {
                    inner: Rc::clone(&self.inner),
                    script: self.script.clone(),
                };
                body(&ctx)?;
            }
        }
        Ok((resolved.path, storage))
    }
}

impl ScriptRuntime for FakeRuntime {
    fn bind(&self, host: Rc<dyn HostApi>) -> Result<(), script_host::runtime::RuntimeError> {
        self.inner.borrow_mut().host = Some(host);
        Ok(())
    }

    fn spawn_thread(&self, script: &Path) -> Result<ThreadRef, script_host::runtime::RuntimeError> {
        let mut inner = self.inner.borrow_mut();
        inner.next_thread += 1;
        let id = inner.next_thread;
        inner.threads.insert(id, script.to_path_buf());
        Ok(id)
    }

    fn drop_thread(&self, thread: ThreadRef) {
        self.inner.borrow_mut().threads.remove(&thread);
    }

    fn eval_file(&self, thread: ThreadRef, path: &Path) -> Result<(), EvalError> {
        let body = {
            let inner = self.inner.borrow();
            if inner.threads.get(&thread) != Some(&path.to_path_buf()) {
                return Err(EvalError {
                    message: format!("thread/path mismatch for {}", path.display()),
                    traceback: Vec::new(),
                });
            }
            inner.scripts.get(path).cloned()
        };
        let Some(body) = body else {
            return Err(EvalError {
                message: format!("SyntaxError: no script registered for {}", path.display()),
                traceback: vec![Frame {
                    file: path.to_path_buf(),
                    line: 1,
                }],
            });
        };
        body(&self.ctx(Some(path.to_path_buf()))).map_err(|message| EvalError {
            message,
            traceback: vec![Frame {
                file: path.to_path_buf(),
                line: 1,
            }],
        })
    }

    fn eval(&self, _code: &str) -> Result<Value, EvalError> {
        Ok(Value::Null)
    }

    fn call(&self, func: FuncRef, args: &[Value]) -> Result<Value, EvalError> {
        let body = self.inner.borrow().funcs.get(&func).cloned();
        let Some(body) = body else {
            return Err(EvalError {
                message: format!("call of unknown function {func}"),
                traceback: Vec::new(),
            });
        };
        body(args).map_err(|message| EvalError {
            message,
            traceback: Vec::new(),
        })
    }

    fn release(&self, func: FuncRef) {
        let mut inner = self.inner.borrow_mut();
        inner.funcs.remove(&func);
        inner.released.push(func);
    }
}

/// Publisher that records every outgoing message
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, String, u8, bool)>>,
}

impl RecordingPublisher {
    /// `(topic, payload, qos, retained)` tuples in publish order.
    #[must_use]
    pub fn messages(&self) -> Vec<(String, String, u8, bool)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Payloads published to one topic, in order.
    #[must_use]
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(t, ..)| t == topic)
            .map(|(_, payload, ..)| payload)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.clear();
        }
    }
}

impl Publisher for RecordingPublisher {
    fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: u8,
        retained: bool,
    ) -> Result<(), TransportError> {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((topic.to_string(), payload.to_string(), qos, retained));
        }
        Ok(())
    }
}

/// In-process engine harness: the engine runs on the test thread and the
/// queue is pumped explicitly.
pub struct TestBench {
    pub engine: ScriptEngine,
    pub runtime: FakeRuntime,
    pub publisher: Arc<RecordingPublisher>,
    pub dir: tempfile::TempDir,
    rx: mpsc::UnboundedReceiver<EngineCall>,
}

impl TestBench {
    /// Build a bench; must run inside a tokio runtime (timers and cron
    /// spawn onto it).
    #[must_use]
    pub fn new() -> Self {
        Self::with_db(false)
    }

    /// Bench with the persistent KV enabled.
    #[must_use]
    pub fn with_db(persistent: bool) -> Self {
        Self::over_dir(tempfile::tempdir().expect("tempdir"), persistent)
    }

    /// Bench over an existing directory (e.g. to reopen a persistent DB).
    #[must_use]
    pub fn over_dir(dir: tempfile::TempDir, persistent: bool) -> Self {
        let config = EngineConfig {
            source_root: dir.path().to_path_buf(),
            modules_dirs: vec![dir.path().join("modules")],
            persistent_db: persistent.then(|| dir.path().join("persistent.db")),
        };
        let publisher = Arc::new(RecordingPublisher::default());
        let runtime = FakeRuntime::new();
        let (handle, rx) = EngineHandle::channel();
        let engine = ScriptEngine::new(
            config,
            Rc::new(runtime.clone()),
            publisher.clone(),
            tokio::runtime::Handle::current(),
            handle,
        )
        .expect("engine init");
        Self {
            engine,
            runtime,
            publisher,
            dir,
            rx,
        }
    }

    /// Drain every call already queued.
    pub fn pump(&mut self) {
        while let Ok(call) = self.rx.try_recv() {
            call(&mut self.engine);
        }
    }

    /// Keep draining the queue until `duration` elapses, waiting for
    /// timer/cron/spawn activity.
    pub async fn pump_for(&mut self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Some(call)) => call(&mut self.engine),
                _ => break,
            }
        }
    }

    /// Deliver an MQTT message and process its consequences.
    pub fn mqtt(&mut self, topic: &str, payload: &str) {
        self.engine.handle_mqtt(topic, payload);
        self.pump();
    }

    /// Declare an external cell with type and value in one step.
    pub fn external_cell(&mut self, device: &str, cell: &str, cell_type: &str, value: &str) {
        self.mqtt(
            &format!("/devices/{device}/controls/{cell}/meta/type"),
            cell_type,
        );
        self.mqtt(&format!("/devices/{device}/controls/{cell}"), value);
    }

    /// Create a script file under the source root and register its body.
    pub fn add_script(
        &mut self,
        name: &str,
        body: impl Fn(&ScriptCtx) -> Result<(), String> + 'static,
    ) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("// {name}")).expect("write script");
        self.runtime.register_script(&path, body);
        path
    }

    /// Create a module file under the modules directory.
    pub fn add_module(
        &mut self,
        name: &str,
        source: &str,
        body: impl Fn(&ScriptCtx) -> Result<(), String> + 'static,
    ) -> PathBuf {
        let dir = self.dir.path().join("modules");
        std::fs::create_dir_all(&dir).expect("modules dir");
        let path = dir.join(format!("{name}.js"));
        std::fs::write(&path, source).expect("write module");
        self.runtime.register_module(&path, body);
        path
    }
}

impl Default for TestBench {
    fn default() -> Self {
        Self::new()
    }
}
