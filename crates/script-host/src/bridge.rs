//! The globals bridge: what script calls land on
//!
//! Implements [`HostApi`] over the shared engine core. Methods are
//! re-entrant (they run while the engine is inside a script call), so
//! anything that would start a new scan is posted onto the engine task's
//! queue instead of running inline.

use crate::engine::{EngineHandle, HostCore};
use crate::error::HostError;
use crate::jsonc;
use crate::loader::LocItem;
use crate::modules::{local_object_id, ModuleResolver};
use crate::runtime::{
    CallContext, CellReadout, ChangeSource, HostApi, LogLevel, ResolvedModule, RuleDef,
    SpawnOptions, SpawnResult, TriggerDef,
};
use cell_model::{CellSpec, Value, VirtualDeviceSpec};
use mqtt_io::topics;
use rule_engine::{CronSpec, FuncRef, RuleCondition, RuleId, ScanTrigger, TimerId};
use std::cell::RefCell;
use std::path::Path;
use std::process::Stdio;
use std::rc::Rc;
use std::time::Duration;

/// Log both to the process logger and to the `/wbrules/log/<level>`
/// fan-out; debug lines are forwarded only while rule debugging is on.
pub(crate) fn log_fanout(core: &HostCore, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "rules", "{}", message),
        LogLevel::Info => tracing::info!(target: "rules", "{}", message),
        LogLevel::Warning => tracing::warn!(target: "rules", "{}", message),
        LogLevel::Error => tracing::error!(target: "rules", "{}", message),
    }
    if level != LogLevel::Debug || core.rule_debug {
        if let Err(e) =
            core.model
                .publisher()
                .publish(&topics::log(level.as_str()), message, 1, false)
        {
            tracing::error!("log publish failed: {}", e);
        }
    }
}

enum SourceItemKind {
    Device,
    Rule,
}

/// The bridge handed to the scripting runtime at init
pub struct HostBridge {
    core: Rc<RefCell<HostCore>>,
    handle: EngineHandle,
    rt: tokio::runtime::Handle,
    resolver: ModuleResolver,
}

impl HostBridge {
    #[must_use]
    pub fn new(
        core: Rc<RefCell<HostCore>>,
        handle: EngineHandle,
        rt: tokio::runtime::Handle,
        resolver: ModuleResolver,
    ) -> Self {
        Self {
            core,
            handle,
            rt,
            resolver,
        }
    }

    /// Expand a module-scoped name to its global id.
    fn expand_name(ctx: &CallContext, name: &str) -> String {
        match &ctx.module {
            Some(module) => local_object_id(module, name),
            None => name.to_string(),
        }
    }

    fn register_source_item(
        core: &mut HostCore,
        ctx: &CallContext,
        kind: &SourceItemKind,
        name: &str,
    ) {
        let Some(entry) = core.current_source.as_mut() else {
            return;
        };
        let Some(line) = ctx.line_in(&entry.physical_path) else {
            return;
        };
        let items = match kind {
            SourceItemKind::Device => &mut entry.devices,
            SourceItemKind::Rule => &mut entry.rules,
        };
        items.push(LocItem {
            line,
            name: name.to_string(),
        });
    }

    fn build_condition(trigger: TriggerDef) -> Result<RuleCondition, HostError> {
        match trigger {
            TriggerDef::When(func) => Ok(RuleCondition::Level { func }),
            TriggerDef::AsSoonAs(func) => Ok(RuleCondition::Edge { func, last: false }),
            TriggerDef::WhenChanged(sources) => {
                if sources.is_empty() {
                    return Err(HostError::RuleDefinition(
                        "whenChanged: non-empty array expected".to_string(),
                    ));
                }
                let mut children = Vec::with_capacity(sources.len());
                for source in sources {
                    children.push(match source {
                        ChangeSource::Cell(name) => {
                            let cell = CellSpec::parse(&name).ok_or_else(|| {
                                HostError::RuleDefinition(format!(
                                    "invalid whenChanged spec: '{name}'"
                                ))
                            })?;
                            RuleCondition::CellChanged { cell, last: None }
                        }
                        ChangeSource::Func(func) => {
                            RuleCondition::FuncValueChanged { func, last: None }
                        }
                    });
                }
                if children.len() == 1 {
                    Ok(children.remove(0))
                } else {
                    Ok(RuleCondition::Or { children })
                }
            }
            TriggerDef::Cron(expr) => {
                CronSpec::parse(&expr)
                    .map_err(|e| HostError::RuleDefinition(e.to_string()))?;
                Ok(RuleCondition::Cron { expr })
            }
        }
    }
}

impl HostApi for HostBridge {
    fn define_virtual_device(
        &self,
        ctx: &CallContext,
        name: &str,
        spec: serde_json::Value,
    ) -> Result<String, HostError> {
        let global = Self::expand_name(ctx, name);
        let spec: VirtualDeviceSpec = serde_json::from_value(spec)
            .map_err(|e| HostError::DeviceDefinition(e.to_string()))?;

        let mut core = self.core.borrow_mut();
        core.model
            .define_virtual_device(&global, &spec)
            .map_err(|e| HostError::DeviceDefinition(e.to_string()))?;
        Self::register_source_item(&mut core, ctx, &SourceItemKind::Device, &global);
        Ok(global)
    }

    fn virtual_device_id(&self, ctx: &CallContext, name: &str) -> String {
        Self::expand_name(ctx, name)
    }

    fn define_rule(
        &self,
        ctx: &CallContext,
        name: Option<&str>,
        def: RuleDef,
    ) -> Result<RuleId, HostError> {
        let Some(then) = def.then else {
            return Err(HostError::RuleDefinition("invalid rule -- no then".to_string()));
        };
        let condition = Self::build_condition(def.trigger)?;

        let display = match (name, &ctx.script) {
            (Some(short), Some(script)) => format!("{}/{}", script.display(), short),
            (Some(short), None) => short.to_string(),
            (None, _) => String::new(),
        };

        let mut core = self.core.borrow_mut();
        let id = core
            .rules
            .define(&display, condition, then, ctx.script.clone())
            .map_err(|e| HostError::RuleDefinition(e.to_string()))?;
        Self::register_source_item(
            &mut core,
            ctx,
            &SourceItemKind::Rule,
            name.unwrap_or_default(),
        );
        Ok(id)
    }

    fn run_rules(&self) {
        self.handle.post(|engine| engine.run_scan(ScanTrigger::RunRules));
    }

    fn cell_read(&self, cell: &str) -> Result<CellReadout, HostError> {
        let spec = CellSpec::parse(cell)
            .ok_or_else(|| HostError::BadArgs(format!("bad cell reference '{cell}'")))?;
        let mut core = self.core.borrow_mut();
        let snapshot = core.model.snapshot(&spec);
        let complete = snapshot.as_ref().is_some_and(|s| s.complete);
        core.tracker.record_cell(&spec, complete);
        Ok(CellReadout {
            value: snapshot.map_or(Value::Null, |s| s.value),
            complete,
        })
    }

    fn cell_write(&self, cell: &str, value: Value) -> Result<(), HostError> {
        let spec = CellSpec::parse(cell)
            .ok_or_else(|| HostError::BadArgs(format!("bad cell reference '{cell}'")))?;
        let event = {
            let mut core = self.core.borrow_mut();
            match core.model.set_value(&spec, value) {
                Ok(event) => event,
                Err(e) => {
                    // a write to a read-only cell is a script mistake, not
                    // a reason to abort the running rule
                    tracing::error!("cell write failed: {}", e);
                    return Ok(());
                }
            }
        };
        if let Some(event) = event {
            self.handle.post(move |engine| {
                engine.apply_settings_event(&event.spec);
                engine.run_scan(ScanTrigger::CellChange(event.spec));
            });
        }
        Ok(())
    }

    fn cell_is_complete(&self, cell: &str) -> bool {
        let Some(spec) = CellSpec::parse(cell) else {
            return false;
        };
        let mut core = self.core.borrow_mut();
        let complete = core
            .model
            .snapshot(&spec)
            .is_some_and(|s| s.complete);
        core.tracker.record_cell(&spec, complete);
        complete
    }

    fn start_timer(
        &self,
        ctx: &CallContext,
        name: Option<String>,
        interval_ms: f64,
        periodic: bool,
        callback: Option<FuncRef>,
    ) -> Result<TimerId, HostError> {
        match (&name, callback) {
            (None, None) => {
                return Err(HostError::BadArgs(
                    "anonymous timer requires a callback".to_string(),
                ))
            }
            (Some(n), _) if n.is_empty() => {
                return Err(HostError::BadArgs("empty timer name".to_string()))
            }
            _ => {}
        }
        let interval = Duration::from_secs_f64(interval_ms.max(0.0) / 1000.0);
        let mut core = self.core.borrow_mut();
        let replaced = name.as_deref().and_then(|n| core.timers.stop_by_name(n));
        if let Some(func) = replaced {
            self.handle.post(move |engine| engine.release_funcs(vec![func]));
        }
        Ok(core
            .timers
            .start(name, interval, periodic, callback, ctx.script.clone()))
    }

    fn stop_timer_by_id(&self, id: TimerId) {
        let callback = self.core.borrow_mut().timers.stop_by_id(id);
        if let Some(func) = callback {
            self.handle.post(move |engine| engine.release_funcs(vec![func]));
        }
    }

    fn stop_timer_by_name(&self, name: &str) {
        let callback = self.core.borrow_mut().timers.stop_by_name(name);
        if let Some(func) = callback {
            self.handle.post(move |engine| engine.release_funcs(vec![func]));
        }
    }

    fn timer_firing(&self, name: &str) -> bool {
        let mut core = self.core.borrow_mut();
        core.tracker.record_timer(name);
        core.timers.is_firing(name)
    }

    fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: u8,
        retained: bool,
    ) -> Result<(), HostError> {
        if qos > 2 {
            return Err(HostError::BadArgs(format!("QoS out of range: {qos}")));
        }
        let core = self.core.borrow();
        if let Err(e) = core.model.publisher().publish(topic, payload, qos, retained) {
            tracing::error!("publish to {} failed: {}", topic, e);
        }
        Ok(())
    }

    fn spawn(
        &self,
        ctx: &CallContext,
        command: Vec<String>,
        options: SpawnOptions,
        callback: Option<FuncRef>,
    ) -> Result<(), HostError> {
        if command.is_empty() {
            return Err(HostError::BadArgs("spawn: empty command".to_string()));
        }
        let script = ctx.script.clone();
        let epoch = {
            let core = self.core.borrow();
            script
                .as_ref()
                .and_then(|s| core.cleanup_epoch.get(s).copied())
                .unwrap_or(0)
        };
        let handle = self.handle.clone();
        let display = command.join(" ");
        self.rt.spawn(async move {
            let result = match run_command(&command, options).await {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::error!("external command failed: {}", e);
                    None
                }
            };
            handle.post(move |engine| {
                engine.on_spawn_done(script, epoch, callback, display, result);
            });
        });
        Ok(())
    }

    fn log(&self, level: LogLevel, message: &str) {
        log_fanout(&self.core.borrow(), level, message);
    }

    fn read_config(&self, path: &str) -> Result<serde_json::Value, HostError> {
        jsonc::read_config(Path::new(path))
    }

    fn persistent_name(&self, ctx: &CallContext, name: &str) -> Result<String, HostError> {
        if self.core.borrow().storage.is_none() {
            return Err(HostError::StorageUnavailable);
        }
        let global = Self::expand_name(ctx, name);
        tracing::debug!("create local storage name: {}", global);
        Ok(global)
    }

    fn persistent_get(&self, bucket: &str, key: &str) -> Option<serde_json::Value> {
        let core = self.core.borrow();
        let storage = core.storage.as_ref()?;
        match storage.get(bucket, key) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::error!("corrupt persistent value {}/{}: {}", bucket, key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::error!("persistent get failed: {}", e);
                None
            }
        }
    }

    fn persistent_set(&self, bucket: &str, key: &str, value: &serde_json::Value) {
        let core = self.core.borrow();
        let Some(storage) = core.storage.as_ref() else {
            tracing::error!("persistent DB is not initialized");
            return;
        };
        if let Err(e) = storage.set(bucket, key, &value.to_string()) {
            tracing::error!("persistent set failed: {}", e);
        }
    }

    fn resolve_module(&self, id: &str) -> Result<ResolvedModule, HostError> {
        self.resolver.resolve(id)
    }
}

async fn run_command(
    argv: &[String],
    options: SpawnOptions,
) -> std::io::Result<SpawnResult> {
    let mut command = tokio::process::Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(if options.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if options.capture_output {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(if options.capture_error_output {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    let mut child = command.spawn()?;
    if let Some(input) = options.input {
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(input.as_bytes()).await?;
        }
    }
    // reads the pipes to EOF before reaping the child
    let output = child.wait_with_output().await?;
    Ok(SpawnResult {
        exit_status: i64::from(output.status.code().unwrap_or(-1)),
        captured_output: String::from_utf8_lossy(&output.stdout).to_string(),
        captured_error_output: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
