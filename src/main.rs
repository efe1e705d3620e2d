//! steward daemon entry point.
//!
//! Startup order matters: logging first, then the one-shot recovery sweep
//! for every workspace, and only then the queue managers and file watchers —
//! normal scheduling must not race boot-time reconciliation.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use steward::config::{DaemonConfig, QueueConfig};
use steward::events::EventBroadcaster;
use steward::session::command::CommandSessionDriver;
use steward::tasks::{TaskPhase, TaskStore};
use steward::workspace::WorkspaceRegistry;
use steward::AppContext;

#[derive(Parser)]
#[command(name = "steward", version, about = "Workspace task pipeline daemon")]
struct Args {
    /// Workspace roots to schedule (repeatable).
    #[arg(long = "workspace", short = 'w', env = "STEWARD_WORKSPACES")]
    workspaces: Vec<PathBuf>,

    /// Daemon data directory (logs). Defaults to ~/.steward.
    #[arg(long, env = "STEWARD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "info,steward=debug".
    #[arg(long, env = "STEWARD_LOG")]
    log: Option<String>,

    /// Agent program handed each execution.
    #[arg(long, env = "STEWARD_AGENT", default_value = "claude")]
    agent: String,

    /// Extra arguments for the agent program (repeatable).
    #[arg(long = "agent-arg")]
    agent_args: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default).
    Run,
    /// Print a workspace's task counts per phase and exit.
    Status { workspace: PathBuf },
    /// Print a workspace's effective queue configuration and exit.
    Config { workspace: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    match args.command.take() {
        Some(Command::Status { workspace }) => print_status(&workspace),
        Some(Command::Config { workspace }) => print_config(&workspace),
        Some(Command::Run) | None => run_daemon(args).await,
    }
}

async fn run_daemon(args: Args) -> Result<()> {
    let workspaces = if args.workspaces.is_empty() {
        vec![std::env::current_dir().context("cannot resolve current directory")?]
    } else {
        args.workspaces.clone()
    };
    let config = Arc::new(DaemonConfig::new(args.data_dir, workspaces, args.log));

    let _log_guard = setup_logging(&config.log, &config.data_dir.join("logs"));
    info!(version = env!("CARGO_PKG_VERSION"), "steward starting");

    let broadcaster = Arc::new(EventBroadcaster::new());
    let driver = Arc::new(CommandSessionDriver::new(
        args.agent.clone(),
        args.agent_args.clone(),
    ));
    let workspaces = Arc::new(WorkspaceRegistry::new(driver, Arc::clone(&broadcaster)));

    let app = AppContext {
        config: Arc::clone(&config),
        broadcaster,
        workspaces: Arc::clone(&workspaces),
        started_at: std::time::Instant::now(),
    };

    // Boot-time reconciliation, then normal scheduling.
    for root in &config.workspaces {
        let root = root
            .canonicalize()
            .with_context(|| format!("workspace not found: {}", root.display()))?;
        let manager = app.workspaces.get_or_create(&root).await?;

        match manager.sweep().await {
            Ok(0) => {}
            Ok(n) => info!(workspace = %root.display(), recovered = n, "recovery sweep done"),
            Err(e) => warn!(workspace = %root.display(), err = %e, "recovery sweep failed"),
        }

        if manager.enabled().await {
            manager.start().await;
        } else {
            info!(workspace = %root.display(), "queue disabled — not scheduling");
        }
    }

    // Watch each workspace's task directory; changes kick the manager.
    let mut watchers = Vec::new();
    let runtime = tokio::runtime::Handle::current();
    for manager in app.workspaces.all().await {
        let tasks_dir = manager.store().tasks_dir();
        std::fs::create_dir_all(&tasks_dir)
            .with_context(|| format!("cannot create {}", tasks_dir.display()))?;

        let kick_target = Arc::clone(&manager);
        let handle = runtime.clone();
        match start_task_watcher(&tasks_dir, move || {
            let manager = Arc::clone(&kick_target);
            handle.spawn(async move {
                manager.run_pass().await;
            });
        }) {
            Ok(watcher) => watchers.push(watcher),
            Err(e) => warn!(dir = %tasks_dir.display(), err = %e, "task watcher failed to start"),
        }
    }

    info!(workspaces = config.workspaces.len(), "steward running — ctrl-c to exit");
    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    // The persisted enabled flags are left as configured; in-flight sessions
    // die with the process and the next start's sweep reclaims their tasks.
    info!("shutting down");
    Ok(())
}

/// Debounced watcher on a workspace's task directory.
fn start_task_watcher<F>(
    dir: &Path,
    on_change: F,
) -> Result<
    notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
>
where
    F: Fn() + Send + 'static,
{
    use notify_debouncer_full::{
        new_debouncer, notify::RecursiveMode, notify::Watcher, DebounceEventResult,
    };

    let mut debouncer = new_debouncer(
        std::time::Duration::from_millis(300),
        None,
        move |result: DebounceEventResult| match result {
            Ok(_events) => on_change(),
            Err(errors) => {
                for e in errors {
                    warn!(err = %e, "task watcher error");
                }
            }
        },
    )?;
    debouncer.watcher().watch(dir, RecursiveMode::Recursive)?;
    Ok(debouncer)
}

fn print_status(workspace: &Path) -> Result<()> {
    let store = TaskStore::new(workspace);
    let tasks = store.discover()?;
    for phase in [
        TaskPhase::Backlog,
        TaskPhase::Ready,
        TaskPhase::Executing,
        TaskPhase::Complete,
        TaskPhase::Archived,
    ] {
        let count = tasks.iter().filter(|t| t.phase == phase).count();
        println!("{:>10}: {count}", phase.as_str());
    }
    Ok(())
}

fn print_config(workspace: &Path) -> Result<()> {
    let config = QueueConfig::load(workspace)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Initialize the tracing subscriber: compact stdout plus a daily-rolling
/// file under the data dir. Returns a guard that must stay alive for the
/// process lifetime. Falls back to stdout-only if the log directory cannot
/// be created — never panics.
fn setup_logging(
    log_level: &str,
    log_dir: &Path,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "warn: could not create log directory '{}': {e} — falling back to stdout",
            log_dir.display()
        );
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(log_dir, "steward.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(fmt::layer().compact())
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Some(guard)
}
