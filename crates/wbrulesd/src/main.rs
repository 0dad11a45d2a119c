//! Rule engine daemon: MQTT wiring, script loading and shutdown

use anyhow::Context;
use clap::Parser;
use mqtt_io::MqttTransport;
use script_host::engine::{spawn_engine_thread, EngineConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod runtime;

/// How long after subscribing we let retained values settle before the
/// first full scan
const RETAINED_SETTLE: Duration = Duration::from_millis(500);

/// Default persistent DB location; storage is disabled when its parent
/// directory does not exist (override with `WB_RULES_DB`)
const DEFAULT_DB: &str = "/var/lib/wb-rules/wbrules-persistent.db";

const DEFAULT_MODULES_DIR: &str = "/usr/share/wb-rules-modules";

#[derive(Parser, Debug)]
#[command(name = "wbrulesd", about = "MQTT rule engine daemon")]
struct Args {
    /// MQTT broker URL
    #[arg(long, default_value = "tcp://localhost:1883")]
    broker: String,

    /// Editable script root (defaults to the first script directory)
    #[arg(long, value_name = "PATH")]
    editdir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log without colors or timestamps, for syslog capture
    #[arg(long)]
    syslog: bool,

    /// Log MQTT traffic
    #[arg(long)]
    mqttdebug: bool,

    /// Write a CPU profile to this file on exit
    #[arg(long, value_name = "FILE")]
    cpuprofile: Option<PathBuf>,

    /// Script files or directories
    #[arg(required = true, value_name = "SCRIPT")]
    scripts: Vec<PathBuf>,
}

fn init_tracing(args: &Args) {
    let default_filter = if args.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(!args.syslog)
        .without_time();
    if args.syslog {
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(filter)
            .init();
    }
}

/// Expand script arguments: directories contribute their `*.js` files in
/// name order.
fn collect_scripts(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut scripts = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("can't read script directory {}", path.display()))?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "js"))
                .collect();
            entries.sort();
            scripts.extend(entries);
        } else {
            scripts.push(path.clone());
        }
    }
    Ok(scripts)
}

fn source_root_for(args: &Args) -> PathBuf {
    if let Some(editdir) = &args.editdir {
        return editdir.clone();
    }
    let first = &args.scripts[0];
    if first.is_dir() {
        first.clone()
    } else {
        first
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }
}

fn persistent_db_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("WB_RULES_DB") {
        return Some(PathBuf::from(path));
    }
    let default = PathBuf::from(DEFAULT_DB);
    match default.parent() {
        Some(parent) if parent.is_dir() => Some(default),
        _ => {
            tracing::warn!(
                "{} is not available, persistent storage disabled",
                DEFAULT_DB
            );
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let profiler = match &args.cpuprofile {
        Some(_) => Some(
            pprof::ProfilerGuard::new(100).context("failed to start the CPU profiler")?,
        ),
        None => None,
    };

    let scripts = collect_scripts(&args.scripts)?;
    if scripts.is_empty() {
        anyhow::bail!("no scripts found");
    }

    let (transport, mut messages) =
        MqttTransport::connect(&args.broker, "wbrules", args.mqttdebug)
            .await
            .with_context(|| format!("can't connect to MQTT broker at {}", args.broker))?;
    let transport = Arc::new(transport);

    let source_root = source_root_for(&args);
    let config = EngineConfig {
        source_root: source_root.clone(),
        modules_dirs: vec![
            source_root.join("modules"),
            PathBuf::from(DEFAULT_MODULES_DIR),
        ],
        persistent_db: persistent_db_path(),
    };

    let (engine, engine_thread) = spawn_engine_thread(
        config,
        transport.clone(),
        tokio::runtime::Handle::current(),
        runtime::make_runtime,
    )
    .context("engine initialization failed")?;

    // forward broker traffic onto the engine task's queue
    let ingress = engine.clone();
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            ingress.post(move |eng| eng.handle_mqtt(&message.topic, &message.payload));
        }
    });

    engine.call_sync(|eng| eng.setup()).await;
    transport
        .subscribe_all()
        .await
        .context("subscription failed")?;
    tokio::time::sleep(RETAINED_SETTLE).await;

    let mut valid = 0usize;
    for script in &scripts {
        let path = script.clone();
        match engine.call_sync(move |eng| eng.load_file(&path)).await {
            Some(Ok(outcome)) if outcome.error.is_none() => valid += 1,
            Some(Ok(_)) => {
                tracing::warn!("script {} loaded with errors", script.display());
            }
            Some(Err(e)) => {
                tracing::error!("failed to load {}: {}", script.display(), e);
            }
            None => tracing::error!("engine task is gone"),
        }
    }
    if valid == 0 {
        anyhow::bail!("no valid scripts loaded");
    }

    engine.call_sync(|eng| eng.refresh()).await;
    tracing::info!("rule engine is running ({} scripts)", valid);

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    tracing::info!("shutting down");

    engine.stop();
    let _ = tokio::task::spawn_blocking(move || engine_thread.join()).await;

    if let (Some(guard), Some(path)) = (profiler, &args.cpuprofile) {
        match guard.report().build() {
            Ok(report) => {
                let file = std::fs::File::create(path)
                    .with_context(|| format!("can't create {}", path.display()))?;
                report
                    .flamegraph(file)
                    .context("failed to write the CPU profile")?;
            }
            Err(e) => tracing::warn!("CPU profile unavailable: {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_scripts_expands_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.js"), "").unwrap();
        std::fs::write(dir.path().join("a.js"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let scripts = collect_scripts(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(
            scripts,
            vec![dir.path().join("a.js"), dir.path().join("b.js")]
        );
    }

    #[test]
    fn test_args_require_scripts() {
        assert!(Args::try_parse_from(["wbrulesd"]).is_err());
        let args =
            Args::try_parse_from(["wbrulesd", "--debug", "/etc/wb-rules"]).unwrap();
        assert!(args.debug);
        assert_eq!(args.broker, "tcp://localhost:1883");
        assert_eq!(args.scripts, vec![PathBuf::from("/etc/wb-rules")]);
    }
}
