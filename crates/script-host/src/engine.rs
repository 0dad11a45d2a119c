//! The engine object and its task
//!
//! A single engine task executes all rule evaluation and script-host
//! entries serially: public entry points post closures onto its queue
//! and the task drains them in arrival order, so no two script callbacks
//! or rule scans ever run concurrently and the scripting runtime is
//! never touched off-task. Timers, cron waits, MQTT I/O and `spawn`
//! workers live on the tokio runtime and re-enter through the queue.

use crate::bridge::{log_fanout, HostBridge};
use crate::error::EngineError;
use crate::loader::{
    check_source_path, check_virtual_path, rewrite_error, ContentTracker, ScriptError,
    SourceEntry,
};
use crate::modules::ModuleResolver;
use crate::runtime::{LogLevel, ScriptRuntime, SpawnResult, ThreadRef};
use crate::storage::PersistentStore;
use cell_model::{CellModel, CellSpec, Value, VirtualCellSpec, VirtualDeviceSpec};
use mqtt_io::transport::Publisher;
use mqtt_io::{topics, Topic};
use rule_engine::{
    CronDriver, CronSpec, DepTracker, FuncRef, RuleCondition, RuleEngine, RuleId, ScanDeps,
    ScanTrigger, TimerId, TimerRegistry,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the editable script tree; files under it get virtual
    /// paths and editor integration
    pub source_root: PathBuf,
    /// Directories searched by `require`, in order
    pub modules_dirs: Vec<PathBuf>,
    /// Persistent KV database file; storage stays disabled when absent
    pub persistent_db: Option<PathBuf>,
}

/// Closure executed on the engine task
pub type EngineCall = Box<dyn FnOnce(&mut ScriptEngine) + Send>;

/// Handle for posting work onto the engine task's queue
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCall>,
}

impl EngineHandle {
    /// Create the queue; the receiver side goes to the engine task.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire-and-forget; ordering is the arrival order at the queue.
    pub fn post(&self, call: impl FnOnce(&mut ScriptEngine) + Send + 'static) {
        if self.tx.send(Box::new(call)).is_err() {
            tracing::debug!("engine task is gone, dropping call");
        }
    }

    /// Post and wait for the result (async contexts).
    pub async fn call_sync<R: Send + 'static>(
        &self,
        call: impl FnOnce(&mut ScriptEngine) -> R + Send + 'static,
    ) -> Option<R> {
        let (tx, rx) = oneshot::channel();
        self.post(move |engine| {
            let _ = tx.send(call(engine));
        });
        rx.await.ok()
    }

    /// Post and wait for the result (blocking contexts).
    pub fn call_sync_blocking<R: Send + 'static>(
        &self,
        call: impl FnOnce(&mut ScriptEngine) -> R + Send + 'static,
    ) -> Option<R> {
        let (tx, rx) = oneshot::channel();
        self.post(move |engine| {
            let _ = tx.send(call(engine));
        });
        rx.blocking_recv().ok()
    }

    /// Ask the engine task to exit after draining the current call.
    pub fn stop(&self) {
        self.post(|engine| engine.stopped = true);
    }
}

/// State owned by the engine task
///
/// Shared with the [`HostBridge`] through `Rc<RefCell<_>>`; everything
/// stays on the engine thread. The `sources` map is the one cross-thread
/// read path (for the editor), guarded by its own mutex.
pub struct HostCore {
    pub model: CellModel,
    pub rules: RuleEngine,
    pub timers: TimerRegistry,
    pub cron: CronDriver,
    pub tracker: DepTracker,
    pub storage: Option<PersistentStore>,
    pub sources: Arc<Mutex<BTreeMap<String, SourceEntry>>>,
    pub current_source: Option<SourceEntry>,
    pub content: ContentTracker,
    pub threads: HashMap<PathBuf, ThreadRef>,
    /// Bumped by every cleanup of a script path; spawn callbacks from a
    /// previous epoch are dropped
    pub cleanup_epoch: HashMap<PathBuf, u64>,
    pub source_root: PathBuf,
    pub rule_debug: bool,
}

/// Result of loading a script file
#[derive(Debug)]
pub struct LoadOutcome {
    /// False when the content hash matched and the load was skipped
    pub loaded: bool,
    /// Script error captured during evaluation, if any; the file's
    /// successfully-defined rules and devices stay registered
    pub error: Option<ScriptError>,
}

/// Outcome of one condition evaluation
struct CondEval {
    new_condition: RuleCondition,
    fired: bool,
    value: Option<Value>,
    cell: Option<CellSpec>,
}

/// The engine: cell model, rule table, timers, cron, script runtime and
/// the reload controller, all driven from one task
pub struct ScriptEngine {
    core: Rc<RefCell<HostCore>>,
    runtime: Rc<dyn ScriptRuntime>,
    pub(crate) stopped: bool,
}

impl ScriptEngine {
    /// Build the engine. Fatal errors here (library load, persistent DB
    /// open) abort startup.
    pub fn new(
        config: EngineConfig,
        runtime: Rc<dyn ScriptRuntime>,
        publisher: Arc<dyn Publisher>,
        rt: tokio::runtime::Handle,
        handle: EngineHandle,
    ) -> Result<Self, EngineError> {
        let storage = match &config.persistent_db {
            Some(path) => Some(PersistentStore::open(path)?),
            None => None,
        };

        let timer_handle = handle.clone();
        let timers = TimerRegistry::new(
            rt.clone(),
            Arc::new(move |id| timer_handle.post(move |engine| engine.on_timer_fired(id))),
        );
        let cron_handle = handle.clone();
        let cron = CronDriver::new(
            rt.clone(),
            Arc::new(move |rule| cron_handle.post(move |engine| engine.on_cron_fired(rule))),
        );

        let core = Rc::new(RefCell::new(HostCore {
            model: CellModel::new(publisher),
            rules: RuleEngine::new(),
            timers,
            cron,
            tracker: DepTracker::default(),
            storage,
            sources: Arc::new(Mutex::new(BTreeMap::new())),
            current_source: None,
            content: ContentTracker::default(),
            threads: HashMap::new(),
            cleanup_epoch: HashMap::new(),
            source_root: crate::loader::normalize(&config.source_root),
            rule_debug: false,
        }));

        let bridge = Rc::new(HostBridge::new(
            Rc::clone(&core),
            handle.clone(),
            rt,
            ModuleResolver::new(config.modules_dirs),
        ));
        runtime.bind(bridge)?;

        Ok(Self {
            core,
            runtime,
            stopped: false,
        })
    }

    /// Define the engine's own settings device (the `Rule debugging`
    /// switch lives there).
    pub fn setup(&mut self) {
        let mut cells = BTreeMap::new();
        cells.insert(
            topics::RULE_DEBUG_CELL.to_string(),
            VirtualCellSpec {
                kind: "switch".to_string(),
                value: serde_json::Value::Bool(false),
                readonly: false,
                max: None,
            },
        );
        let spec = VirtualDeviceSpec {
            title: Some("Rule Engine Settings".to_string()),
            cells,
        };
        if let Err(e) = self
            .core
            .borrow_mut()
            .model
            .define_virtual_device(topics::ENGINE_DEVICE, &spec)
        {
            tracing::error!("failed to define engine settings device: {}", e);
        }
    }

    /// Full re-scan after retained values settle or script loading
    /// completes.
    pub fn refresh(&mut self) {
        self.reschedule_cron();
        self.run_scan(ScanTrigger::Init);
    }

    /// MQTT ingress entry point.
    pub fn handle_mqtt(&mut self, topic: &str, payload: &str) {
        let parsed = Topic::parse(topic);
        let event = self.core.borrow_mut().model.observe(&parsed, payload);
        if let Some(event) = event {
            self.apply_settings_event(&event.spec);
            self.run_scan(ScanTrigger::CellChange(event.spec));
        }
    }

    /// React to changes of the engine's own settings cells.
    pub fn apply_settings_event(&mut self, spec: &CellSpec) {
        if spec.device != topics::ENGINE_DEVICE || spec.cell != topics::RULE_DEBUG_CELL {
            return;
        }
        let mut core = self.core.borrow_mut();
        let enabled = core
            .model
            .cell(spec)
            .map(|cell| cell.value().is_truthy())
            .unwrap_or(false);
        core.rule_debug = enabled;
        tracing::info!(
            "rule debugging {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Evaluate a string in the shared global environment.
    pub fn eval(&mut self, code: &str) -> Result<Value, ScriptError> {
        let root = self.core.borrow().source_root.clone();
        self.runtime.eval(code).map_err(|e| {
            let error = rewrite_error(&root, &e);
            self.engine_log(LogLevel::Error, &format!("eval error: {error}"));
            error
        })
    }

    /// Sorted source entries for the editor read surface.
    #[must_use]
    pub fn list_source_files(&self) -> Vec<SourceEntry> {
        self.core
            .borrow()
            .sources
            .lock()
            .map(|sources| sources.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The cross-thread handle to the source map.
    #[must_use]
    pub fn sources_handle(&self) -> Arc<Mutex<BTreeMap<String, SourceEntry>>> {
        Arc::clone(&self.core.borrow().sources)
    }

    /// Number of registered rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.core.borrow().rules.len()
    }

    /// Number of armed timers.
    #[must_use]
    pub fn active_timer_count(&self) -> usize {
        self.core.borrow().timers.active_count()
    }

    /// Whether the rule's last scan raised a script error (shown in the
    /// editor view).
    #[must_use]
    pub fn rule_errored_last_scan(&self, id: RuleId) -> bool {
        self.core
            .borrow()
            .rules
            .rule(id)
            .is_some_and(|rule| rule.errored_last_scan)
    }

    pub(crate) fn release_funcs(&mut self, funcs: Vec<FuncRef>) {
        for func in funcs {
            self.runtime.release(func);
        }
    }

    fn engine_log(&self, level: LogLevel, message: &str) {
        log_fanout(&self.core.borrow(), level, message);
    }

    // ---- scanning ----

    /// Run one scan for the trigger; rules are evaluated in definition
    /// order.
    pub fn run_scan(&mut self, trigger: ScanTrigger) {
        let candidates = self.core.borrow().rules.candidates(&trigger);
        if candidates.is_empty() {
            return;
        }
        let trigger_cell = match &trigger {
            ScanTrigger::CellChange(spec) => self
                .core
                .borrow()
                .model
                .snapshot(spec)
                .map(|s| (spec.clone(), s.value)),
            _ => None,
        };
        for id in candidates {
            self.scan_rule(id, trigger_cell.as_ref());
        }
    }

    fn scan_rule(&mut self, id: RuleId, trigger_cell: Option<&(CellSpec, Value)>) {
        let Some((condition, then)) = self
            .core
            .borrow()
            .rules
            .rule(id)
            .map(|rule| (rule.condition.clone(), rule.then))
        else {
            return;
        };

        let mut deps = ScanDeps::default();
        let eval = match self.eval_condition(&condition, &mut deps) {
            Ok(eval) => eval,
            Err(error) => {
                self.engine_log(
                    LogLevel::Error,
                    &format!("error evaluating condition of rule {id}: {error}"),
                );
                // a thrown condition keeps its previous dependency set
                if let Some(rule) = self.core.borrow_mut().rules.rule_mut(id) {
                    rule.errored_last_scan = true;
                }
                return;
            }
        };

        let skipped = deps.touched_incomplete;
        {
            let mut core = self.core.borrow_mut();
            core.rules.commit_deps(id, deps);
            if skipped {
                tracing::debug!("rule {} skipped: incomplete cell touched", id);
                return;
            }
            if let Some(rule) = core.rules.rule_mut(id) {
                rule.condition = eval.new_condition;
                rule.errored_last_scan = false;
            }
        }

        if !eval.fired {
            return;
        }

        let cell_for_args = eval
            .cell
            .or_else(|| trigger_cell.map(|(spec, _)| spec.clone()));
        let args: Vec<Value> = match (eval.value, cell_for_args) {
            (Some(value), Some(spec)) => vec![
                value,
                Value::Text(spec.device),
                Value::Text(spec.cell),
            ],
            (Some(value), None) => vec![value],
            (None, _) => Vec::new(),
        };
        if let Err(error) = self.runtime.call(then, &args) {
            self.engine_log(
                LogLevel::Error,
                &format!("error running rule {id} actions: {error}"),
            );
            if let Some(rule) = self.core.borrow_mut().rules.rule_mut(id) {
                rule.errored_last_scan = true;
            }
        }
    }

    fn eval_condition(
        &mut self,
        condition: &RuleCondition,
        deps: &mut ScanDeps,
    ) -> Result<CondEval, crate::runtime::EvalError> {
        match condition {
            RuleCondition::Level { func } => {
                let value = self.call_tracked(*func, deps)?;
                Ok(CondEval {
                    new_condition: condition.clone(),
                    fired: value.is_truthy(),
                    value: None,
                    cell: None,
                })
            }
            RuleCondition::Edge { func, last } => {
                let truthy = self.call_tracked(*func, deps)?.is_truthy();
                Ok(CondEval {
                    new_condition: RuleCondition::Edge {
                        func: *func,
                        last: truthy,
                    },
                    fired: truthy && !*last,
                    value: None,
                    cell: None,
                })
            }
            RuleCondition::CellChanged { cell, last } => {
                let snapshot = self.core.borrow().model.snapshot(cell);
                match snapshot {
                    Some(s) if s.complete => {
                        // first encounter of a complete cell fires; this is
                        // the retained-startup semantics
                        let fired = s.pushbutton || last.as_ref() != Some(&s.value);
                        Ok(CondEval {
                            new_condition: RuleCondition::CellChanged {
                                cell: cell.clone(),
                                last: Some(s.value.clone()),
                            },
                            fired,
                            value: Some(s.value),
                            cell: Some(cell.clone()),
                        })
                    }
                    _ => {
                        deps.touched_incomplete = true;
                        Ok(CondEval {
                            new_condition: condition.clone(),
                            fired: false,
                            value: None,
                            cell: None,
                        })
                    }
                }
            }
            RuleCondition::FuncValueChanged { func, last } => {
                let value = self.call_tracked(*func, deps)?;
                let fired = last.as_ref() != Some(&value);
                Ok(CondEval {
                    new_condition: RuleCondition::FuncValueChanged {
                        func: *func,
                        last: Some(value.clone()),
                    },
                    fired,
                    value: Some(value),
                    cell: None,
                })
            }
            RuleCondition::Or { children } => {
                // every child is evaluated in declared order; no
                // short-circuit, so dependency tracking stays complete
                let mut new_children = Vec::with_capacity(children.len());
                let mut fired = false;
                let mut value = None;
                let mut cell = None;
                for child in children {
                    let eval = self.eval_condition(child, deps)?;
                    if eval.fired && !fired {
                        fired = true;
                        value = eval.value;
                        cell = eval.cell;
                    }
                    new_children.push(eval.new_condition);
                }
                Ok(CondEval {
                    new_condition: RuleCondition::Or {
                        children: new_children,
                    },
                    fired,
                    value,
                    cell,
                })
            }
            RuleCondition::Cron { .. } => Ok(CondEval {
                new_condition: condition.clone(),
                fired: true,
                value: None,
                cell: None,
            }),
        }
    }

    fn call_tracked(
        &mut self,
        func: FuncRef,
        deps: &mut ScanDeps,
    ) -> Result<Value, crate::runtime::EvalError> {
        self.core.borrow_mut().tracker.begin();
        let result = self.runtime.call(func, &[]);
        let tracked = self.core.borrow_mut().tracker.finish();
        deps.merge(tracked);
        result
    }

    // ---- timers, cron, spawn ----

    pub(crate) fn on_timer_fired(&mut self, id: TimerId) {
        let info = self
            .core
            .borrow()
            .timers
            .entry(id)
            .map(|entry| (entry.name.clone(), entry.callback, entry.periodic));
        // a fire queued before its timer was stopped is dropped here
        let Some((name, callback, periodic)) = info else {
            return;
        };

        if let Some(name) = name {
            self.core.borrow_mut().timers.set_firing(Some(id));
            self.run_scan(ScanTrigger::Timer(name));
            self.core.borrow_mut().timers.set_firing(None);
        } else if let Some(callback) = callback {
            if let Err(error) = self.runtime.call(callback, &[]) {
                self.engine_log(LogLevel::Error, &format!("timer callback error: {error}"));
            }
        }

        if !periodic {
            let released = self.core.borrow_mut().timers.complete_oneshot(id);
            if let Some(func) = released {
                self.runtime.release(func);
            }
        }
    }

    pub(crate) fn on_cron_fired(&mut self, rule: RuleId) {
        self.run_scan(ScanTrigger::Cron(rule));
    }

    pub(crate) fn on_spawn_done(
        &mut self,
        script: Option<PathBuf>,
        epoch: u64,
        callback: Option<FuncRef>,
        display: String,
        result: Option<SpawnResult>,
    ) {
        if let Some(script) = &script {
            let current = self
                .core
                .borrow()
                .cleanup_epoch
                .get(script)
                .copied()
                .unwrap_or(0);
            if current != epoch {
                tracing::debug!(
                    "dropping spawn callback: {} was reloaded",
                    script.display()
                );
                if let Some(func) = callback {
                    self.runtime.release(func);
                }
                return;
            }
        }
        let Some(result) = result else {
            if let Some(func) = callback {
                self.runtime.release(func);
            }
            return;
        };
        match callback {
            Some(func) => {
                let args = vec![
                    Value::Int(result.exit_status),
                    Value::Text(result.captured_output),
                    Value::Text(result.captured_error_output),
                ];
                if let Err(error) = self.runtime.call(func, &args) {
                    self.engine_log(
                        LogLevel::Error,
                        &format!("spawn callback error: {error}"),
                    );
                }
                self.runtime.release(func);
            }
            None if result.exit_status != 0 => {
                self.engine_log(
                    LogLevel::Error,
                    &format!(
                        "command '{}' failed with exit status {}",
                        display, result.exit_status
                    ),
                );
            }
            None => {}
        }
    }

    // ---- loading and reload ----

    /// Load a script file unconditionally (initial startup).
    pub fn load_file(&mut self, path: &Path) -> Result<LoadOutcome, EngineError> {
        self.load_script(path, true)
    }

    /// Load a script if its content changed since the last load; runs a
    /// full re-scan and publishes the change notice when it did.
    pub fn live_load_file(&mut self, path: &Path) -> Result<LoadOutcome, EngineError> {
        let outcome = self.load_script(path, false)?;
        if outcome.loaded {
            // refresh even when the script errored: a part of it was
            // probably still loaded
            self.refresh();
            self.publish_update("changed", path);
        }
        Ok(outcome)
    }

    /// Write a script under the source root and load it. The watcher's
    /// subsequent notification is suppressed because the content hash
    /// already matches.
    pub fn live_write_script(
        &mut self,
        virtual_path: &str,
        content: &str,
    ) -> Result<LoadOutcome, EngineError> {
        let physical = {
            let core = self.core.borrow();
            check_virtual_path(&core.source_root, virtual_path)
                .ok_or_else(|| EngineError::OutsideSourceRoot(virtual_path.to_string()))?
        };
        if let Some(parent) = physical.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // write atomically: temp file in the same directory, then rename
        let tmp = physical.with_extension("js.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &physical)?;

        let outcome = self.load_script(&physical, true)?;
        self.refresh();
        self.publish_update("changed", &physical);
        Ok(outcome)
    }

    /// Remove a script: revoke its rules and timers, re-scan, announce.
    pub fn live_remove_file(&mut self, path: &Path) {
        let physical = {
            let core = self.core.borrow();
            check_source_path(&core.source_root, path).0
        };
        self.run_cleanups(&physical);
        self.refresh();
        self.publish_update("removed", &physical);
    }

    fn load_script(
        &mut self,
        path: &Path,
        load_if_unchanged: bool,
    ) -> Result<LoadOutcome, EngineError> {
        let (physical, virtual_path) = {
            let core = self.core.borrow();
            check_source_path(&core.source_root, path)
        };
        let content = std::fs::read(&physical)?;
        let key = virtual_path
            .clone()
            .unwrap_or_else(|| physical.display().to_string());
        let changed = self.core.borrow_mut().content.track(&key, &content);
        if !load_if_unchanged && !changed {
            tracing::debug!(
                "script {} unchanged, not reloading (possibly just reloaded)",
                physical.display()
            );
            return Ok(LoadOutcome {
                loaded: false,
                error: None,
            });
        }

        self.run_cleanups(&physical);

        let thread = self.runtime.spawn_thread(&physical)?;
        {
            let mut core = self.core.borrow_mut();
            core.threads.insert(physical.clone(), thread);
            if let Some(vp) = &virtual_path {
                core.current_source = Some(SourceEntry::new(vp, &physical));
            }
        }

        tracing::info!("loading script {}", physical.display());
        let eval_result = self.runtime.eval_file(thread, &physical);
        let script_error = eval_result.err().map(|error| {
            let root = self.core.borrow().source_root.clone();
            rewrite_error(&root, &error)
        });

        {
            let mut core = self.core.borrow_mut();
            if let Some(mut entry) = core.current_source.take() {
                entry.error = script_error.clone();
                if let Ok(mut sources) = core.sources.lock() {
                    sources.insert(entry.virtual_path.clone(), entry);
                }
            }
        }

        // re-register cron rules whether or not the load succeeded: a
        // partial load may have created some
        self.reschedule_cron();

        if let Some(error) = &script_error {
            self.engine_log(LogLevel::Error, &format!("script error: {error}"));
        }
        Ok(LoadOutcome {
            loaded: true,
            error: script_error,
        })
    }

    fn run_cleanups(&mut self, path: &Path) {
        let (timer_funcs, removed_rules, thread) = {
            let mut core = self.core.borrow_mut();
            let timer_funcs = core.timers.stop_owned(path);
            let removed_rules = core.rules.remove_owned(path);
            let thread = core.threads.remove(path);
            *core.cleanup_epoch.entry(path.to_path_buf()).or_insert(0) += 1;
            let virtual_path = check_source_path(&core.source_root, path).1;
            if let Some(vp) = virtual_path {
                if let Ok(mut sources) = core.sources.lock() {
                    sources.remove(&vp);
                }
            }
            (timer_funcs, removed_rules, thread)
        };
        self.release_funcs(timer_funcs);
        for rule in removed_rules {
            self.release_funcs(rule.func_refs());
        }
        if let Some(thread) = thread {
            self.runtime.drop_thread(thread);
        }
    }

    fn publish_update(&self, kind: &str, physical: &Path) {
        let core = self.core.borrow();
        let Some(virtual_path) = check_source_path(&core.source_root, physical).1 else {
            return;
        };
        if let Err(e) =
            core.model
                .publisher()
                .publish(&topics::update(kind), &virtual_path, 1, false)
        {
            tracing::error!("update notice publish failed: {}", e);
        }
    }

    fn reschedule_cron(&mut self) {
        let mut core = self.core.borrow_mut();
        let entries = core
            .rules
            .cron_rules()
            .into_iter()
            .filter_map(|(id, expr)| CronSpec::parse(&expr).ok().map(|spec| (id, spec)))
            .collect();
        core.cron.reschedule(entries);
    }
}

/// Spawn the engine task on a dedicated thread.
///
/// The runtime factory runs on that thread (script runtimes are not
/// `Send`). Returns once the engine finished initializing; init failures
/// are returned here and are fatal.
pub fn spawn_engine_thread<F>(
    config: EngineConfig,
    publisher: Arc<dyn Publisher>,
    rt: tokio::runtime::Handle,
    make_runtime: F,
) -> Result<(EngineHandle, std::thread::JoinHandle<()>), EngineError>
where
    F: FnOnce() -> Rc<dyn ScriptRuntime> + Send + 'static,
{
    let (handle, mut rx) = EngineHandle::channel();
    let engine_handle = handle.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    let join = std::thread::Builder::new()
        .name("rule-engine".to_string())
        .spawn(move || {
            let runtime = make_runtime();
            match ScriptEngine::new(config, runtime, publisher, rt, engine_handle) {
                Ok(mut engine) => {
                    let _ = ready_tx.send(Ok(()));
                    while let Some(call) = rx.blocking_recv() {
                        call(&mut engine);
                        if engine.stopped {
                            break;
                        }
                    }
                }
                Err(error) => {
                    let _ = ready_tx.send(Err(error));
                }
            }
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok((handle, join)),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(EngineError::Runtime(crate::runtime::RuntimeError::Internal(
            "engine task died during startup".to_string(),
        ))),
    }
}
