mod logging;
mod reload;
mod scanner;
mod scene;
mod scripts;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use vellum_engine::config::ConfigLoadError;
use vellum_engine::{
    CompileOutcome, FileStateStore, ItemId, ObjectId, Scheduler, ScriptEvent, VellumConfig,
    WasmRuntime,
};

use crate::scanner::ScriptScanner;
use crate::scene::LoggingScene;
use crate::scripts::ScriptDirectory;

/// How long to wait for a script to compile before giving up on reporting it
const COMPILE_REPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enables debug logging; repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Config file (default: the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of `.wat` scripts, overriding the config
    #[arg(short, long)]
    scripts: Option<PathBuf>,

    /// Object the scripts are attached to
    #[arg(long, default_value_t = 1)]
    object: u32,

    /// Event to send to every script once they are loaded; repeatable
    #[arg(long)]
    fire: Vec<String>,
}

fn load_config(cli: &Cli) -> anyhow::Result<VellumConfig> {
    let loaded = match &cli.config {
        Some(path) => VellumConfig::load_from(path),
        None => VellumConfig::load(),
    };

    let mut config = match loaded {
        Ok(config) => config,
        Err(ConfigLoadError::NotFound) => VellumConfig::default(),
        Err(err) => return Err(err).context("loading config"),
    };
    if let Some(scripts) = &cli.scripts {
        config.script_dir = Some(scripts.clone());
    }
    Ok(config)
}

/// Log the compile outcome of each submitted script once it arrives
fn report_outcomes(scheduler: &Arc<Scheduler>, submitted: Vec<(PathBuf, ItemId)>) {
    for (path, item) in submitted {
        let scheduler = Arc::clone(scheduler);
        tokio::spawn(async move {
            match tokio::time::timeout(COMPILE_REPORT_TIMEOUT, scheduler.compile_outcome(item)).await {
                Ok(Ok(CompileOutcome::Compiled)) => {
                    info!(target: "scripts", "{} compiled", path.display());
                }
                Ok(Ok(CompileOutcome::Failed(errors))) => {
                    error!(target: "scripts", "{} failed to compile:", path.display());
                    for line in errors {
                        error!(target: "scripts", "  {}", line);
                    }
                }
                Ok(Err(err)) => warn!(target: "scripts", "No outcome for {}: {}", path.display(), err),
                Err(_) => warn!(target: "scripts", "Timed out waiting for {} to compile", path.display()),
            }
        });
    }
}

/// Wait for the first compile of every script, then send the requested events
async fn fire_events(scheduler: &Scheduler, object: ObjectId, items: &[ItemId], events: &[String]) {
    for item in items {
        let _ = tokio::time::timeout(COMPILE_REPORT_TIMEOUT, scheduler.compile_outcome(*item)).await;
    }
    for name in events {
        if scheduler.submit_object_event(object, ScriptEvent::new(name.as_str())) {
            info!("Sent {} to object {}", name, object);
        } else {
            warn!("Object {} did not take {}", object, name);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let _log_guard = logging::init_logging(config.logging.file, cli.debug)?;

    info!("Starting vellum...");

    let runtime = Arc::new(WasmRuntime::from_config(&config.sandbox)?);
    let store = Arc::new(FileStateStore::new(config.state_dir())?);
    let scheduler = Arc::new(
        Scheduler::builder(config.scheduler.clone())
            .runtime(runtime)
            .persistence(store)
            .scene(Arc::new(LoggingScene))
            .build()?,
    );
    scheduler.start()?;

    let object = ObjectId(cli.object);
    let scripts = ScriptDirectory::new(object);
    let mut scanner = ScriptScanner::new(config.script_dir());
    info!(
        "Watching scripts in {} for object {}",
        scanner.script_dir().display(),
        scripts.object()
    );

    let initial = scripts.apply(&scheduler, &scanner.scan_changes());
    let items: Vec<ItemId> = initial.iter().map(|(_, item)| *item).collect();
    info!("Submitted {} script(s)", items.len());

    if cli.fire.is_empty() {
        report_outcomes(&scheduler, initial);
    } else {
        fire_events(&scheduler, object, &items, &cli.fire).await;
    }

    let mut reload_rx = reload::setup_reload_signal();
    let mut reload_enabled = true;
    let mut ticker = tokio::time::interval(scanner::DEFAULT_SCAN_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            changed = reload_rx.changed(), if reload_enabled => {
                if changed.is_err() {
                    reload_enabled = false;
                    continue;
                }
                let known: Vec<PathBuf> = scanner.known_scripts().cloned().collect();
                let submitted = scripts.reload_all(&scheduler, &known);
                report_outcomes(&scheduler, submitted);
            }
            _ = ticker.tick() => {
                if !scanner.should_scan() {
                    continue;
                }
                let scan = scanner.scan_changes();
                if scan.has_changes() {
                    let submitted = scripts.apply(&scheduler, &scan);
                    report_outcomes(&scheduler, submitted);
                }
            }
        }
    }

    let stats = scheduler.queue_stats();
    info!(
        "Queues at shutdown: {} load/unload, {} events, {} checkpoints",
        stats.load_unload, stats.events, stats.checkpoints
    );
    let stopping = Arc::clone(&scheduler);
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .context("scheduler shutdown")?;

    info!("Goodbye");
    Ok(())
}
