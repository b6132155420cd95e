//! marimo-host CLI entry point.
//!
//! Owns the single [`ServerLifecycleCoordinator`] for a workspace and hands
//! it to the watchdog and the kernel bridge. Servers launched here run in
//! the foreground and are stopped on Ctrl-C; `status`, `sessions`,
//! `shutdown-session` and `stop` act on a server recorded by another
//! running host.

mod prompt;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bridge::{BridgeEvent, BridgeOptions, KernelBridge};
use clap::{Args, Parser, Subcommand};
use kernel_launch::process::pid_is_alive;
use kernel_launch::ShellTransport;
use log::{info, warn};
use serde::Serialize;
use supervisor::health::HealthProbe;
use supervisor::settings::{load_settings, settings_path};
use supervisor::state::{default_state_path, scope_key};
use supervisor::{
    LifecycleState, Prompter, RecoveryOutcome, RecoveryPolicy, ServerLifecycleCoordinator,
    ServerSettings, StateStore, Watchdog,
};

use crate::prompt::TerminalPrompter;

#[derive(Parser, Debug)]
#[command(name = "marimo-host")]
#[command(about = "Run and supervise a marimo server for a workspace")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace directory or notebook the server is for (default: current directory)
    #[arg(long, global = true)]
    target: Option<PathBuf>,

    /// Settings file (default: <config dir>/marimo-host/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// State file (default: <cache dir>/marimo-host/state.json)
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(flatten)]
    overrides: SettingsOverrides,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

/// Per-invocation overrides of the settings file.
#[derive(Args, Debug, Default)]
struct SettingsOverrides {
    /// Path to the marimo executable
    #[arg(long, global = true)]
    marimo_path: Option<String>,

    /// Python interpreter to run `-m marimo` with
    #[arg(long, global = true)]
    python_path: Option<String>,

    #[arg(long, global = true)]
    host: Option<String>,

    /// First port to try
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Protect the server with this password
    #[arg(long, global = true)]
    token_password: Option<String>,

    /// Run marimo with debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Run notebooks in isolated sandboxes
    #[arg(long, global = true)]
    sandbox: bool,

    /// Reload notebooks when their files change on disk
    #[arg(long, global = true)]
    watch_files: bool,

    /// Adopt a healthy server left by a previous run instead of stopping it
    #[arg(long, global = true)]
    reuse: bool,
}

impl SettingsOverrides {
    fn apply(self, settings: &mut ServerSettings) {
        if self.marimo_path.is_some() {
            settings.marimo_path = self.marimo_path;
        }
        if self.python_path.is_some() {
            settings.python_path = self.python_path;
        }
        if let Some(host) = self.host {
            settings.host = host;
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(password) = self.token_password {
            settings.enable_token = true;
            settings.token_password = Some(password);
        }
        settings.debug |= self.debug;
        settings.sandbox |= self.sandbox;
        settings.watch |= self.watch_files;
        if self.reuse {
            settings.recovery = RecoveryPolicy::Reuse;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server and keep it running until Ctrl-C
    Start {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Show the recorded server and whether it is healthy
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// List notebook sessions on the recorded server
    Sessions {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Shut down one notebook session on the recorded server
    ShutdownSession { session_id: String },
    /// Stop the recorded server
    Stop,
    /// Start the server and watch its health until Ctrl-C
    Watch,
    /// Open a notebook session and print its events as JSON lines
    Open {
        /// Notebook file
        file: PathBuf,
        /// Run every cell once the notebook is hydrated
        #[arg(long)]
        run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = load_settings(&cli.settings.unwrap_or_else(settings_path));
    cli.overrides.apply(&mut settings);
    let target = match cli.target {
        Some(target) => target,
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let store = Arc::new(StateStore::new(cli.state.unwrap_or_else(default_state_path)));

    match cli.command {
        Commands::Start { json } => start(settings, target, store, json).await,
        Commands::Status { json } => status(&settings, &target, &store, json).await,
        Commands::Sessions { json } => sessions(settings, target, store, json).await,
        Commands::ShutdownSession { session_id } => {
            shutdown_session(settings, target, store, &session_id).await
        }
        Commands::Stop => stop(settings, target, store).await,
        Commands::Watch => watch(settings, target, store).await,
        Commands::Open { file, run } => open(settings, file, store, run).await,
    }
}

/// Build the coordinator for `target`. This is the only place one is made.
fn coordinator(
    settings: ServerSettings,
    target: PathBuf,
    store: Arc<StateStore>,
) -> Result<ServerLifecycleCoordinator> {
    let cwd = if target.is_dir() {
        Some(target.clone())
    } else {
        target.parent().map(Path::to_path_buf)
    };
    let transport = Arc::new(ShellTransport::new(cwd));
    ServerLifecycleCoordinator::new(settings, target, transport, store)
        .context("Failed to create HTTP clients")
}

/// Adopt the server another host recorded for this target, if it is healthy.
async fn adopt(
    mut settings: ServerSettings,
    target: PathBuf,
    store: Arc<StateStore>,
) -> Result<Option<ServerLifecycleCoordinator>> {
    settings.recovery = RecoveryPolicy::Reuse;
    let coordinator = coordinator(settings, target, store)?;
    match coordinator.recover().await {
        RecoveryOutcome::Reused { .. } => Ok(Some(coordinator)),
        RecoveryOutcome::Stopped { pid } => {
            eprintln!("Recorded server {} was unresponsive and has been stopped", pid);
            Ok(None)
        }
        RecoveryOutcome::NothingToRecover => {
            eprintln!("No marimo server is running for this target");
            Ok(None)
        }
    }
}

async fn start_server(coordinator: &ServerLifecycleCoordinator, json: bool) -> Result<()> {
    let outcome = coordinator.recover().await;
    info!("Recovery: {:?}", outcome);
    let result = coordinator.start().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(result.as_ref())?);
    } else {
        let url = coordinator.settings().base_url(result.port)?;
        println!("marimo {} running at {}", result.version, url);
    }
    Ok(())
}

async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, shutting down");
    Ok(())
}

async fn start(
    settings: ServerSettings,
    target: PathBuf,
    store: Arc<StateStore>,
    json: bool,
) -> Result<()> {
    let coordinator = coordinator(settings, target, store)?;
    start_server(&coordinator, json).await?;
    wait_for_ctrl_c().await?;
    coordinator.stop_server().await;
    Ok(())
}

async fn watch(settings: ServerSettings, target: PathBuf, store: Arc<StateStore>) -> Result<()> {
    let coordinator = coordinator(settings, target, store)?;
    start_server(&coordinator, false).await?;
    let prompter: Arc<dyn Prompter> = Arc::new(TerminalPrompter::new());
    let watchdog = Watchdog::spawn(coordinator.clone(), prompter);
    wait_for_ctrl_c().await?;
    watchdog.stop();
    coordinator.stop_server().await;
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    scope: String,
    pid: Option<u32>,
    port: Option<u16>,
    alive: bool,
    healthy: bool,
    package_manager: Option<String>,
}

/// Read-only: reports what is recorded without touching the server.
async fn status(
    settings: &ServerSettings,
    target: &Path,
    store: &StateStore,
    json: bool,
) -> Result<()> {
    let scope = scope_key(target);
    let recorded = store.get(&scope);
    let alive = recorded.server_pid.is_some_and(pid_is_alive);
    let healthy = match (alive, recorded.server_port) {
        (true, Some(port)) => {
            let probe = HealthProbe::new(settings.health_timeout())?;
            probe.is_healthy(&settings.base_url(port)?).await
        }
        _ => false,
    };
    let report = StatusReport {
        scope,
        pid: recorded.server_pid,
        port: recorded.server_port,
        alive,
        healthy,
        package_manager: recorded.package_manager,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    let state = if report.healthy {
        LifecycleState::Started
    } else {
        LifecycleState::Stopped
    };
    println!("Target:  {}", target.display());
    println!("Scope:   {}", report.scope);
    println!("State:   {}", state);
    match (report.pid, report.port) {
        (Some(pid), Some(port)) => {
            println!("Server:  pid {} on port {}", pid, port);
            if report.alive && !report.healthy {
                println!("         (process is alive but not answering /health)");
            }
        }
        _ => println!("Server:  none recorded"),
    }
    if let Some(manager) = report.package_manager {
        println!("Package manager: {}", manager);
    }
    Ok(())
}

async fn sessions(
    settings: ServerSettings,
    target: PathBuf,
    store: Arc<StateStore>,
    json: bool,
) -> Result<()> {
    let Some(coordinator) = adopt(settings, target, store).await? else {
        return Ok(());
    };
    let sessions = coordinator.get_active_sessions().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No running notebooks");
    }
    for session in sessions {
        println!(
            "{:<10} {:<8} {}",
            session.session_id,
            session.mode.as_deref().unwrap_or("-"),
            session.path
        );
    }
    Ok(())
}

async fn shutdown_session(
    settings: ServerSettings,
    target: PathBuf,
    store: Arc<StateStore>,
    session_id: &str,
) -> Result<()> {
    if let Some(coordinator) = adopt(settings, target, store).await? {
        coordinator.shutdown_session(session_id).await;
        println!("Requested shutdown of {}", session_id);
    }
    Ok(())
}

async fn stop(mut settings: ServerSettings, target: PathBuf, store: Arc<StateStore>) -> Result<()> {
    settings.recovery = RecoveryPolicy::ForceRestart;
    let coordinator = coordinator(settings, target, store)?;
    match coordinator.recover().await {
        RecoveryOutcome::Stopped { pid } => println!("Stopped marimo server {}", pid),
        _ => println!("No marimo server is running for this target"),
    }
    Ok(())
}

async fn open(
    settings: ServerSettings,
    file: PathBuf,
    store: Arc<StateStore>,
    run: bool,
) -> Result<()> {
    let file = std::fs::canonicalize(&file)
        .with_context(|| format!("Notebook not found: {}", file.display()))?;
    let coordinator = coordinator(settings.clone(), file.clone(), store.clone())?;
    let reused = matches!(
        coordinator.recover().await,
        RecoveryOutcome::Reused { .. }
    );
    let startup = coordinator.start().await?;

    let prompter: Arc<dyn Prompter> = Arc::new(TerminalPrompter::new());
    let (bridge, mut events) = KernelBridge::start(BridgeOptions {
        settings,
        startup,
        file,
        store,
        prompter,
    })
    .await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if let (true, BridgeEvent::Hydrate { cells, .. }) = (run, &event) {
                    run_all(&bridge, cells.iter().map(|c| (c.id.clone(), c.code.clone())).unzip());
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    bridge.dispose().await;
    if !reused {
        coordinator.stop_server().await;
    }
    Ok(())
}

/// Run cells in the background so the event loop keeps draining.
fn run_all(bridge: &KernelBridge, (cell_ids, codes): (Vec<String>, Vec<String>)) {
    let bridge = bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = bridge.run(cell_ids, codes).await {
            warn!("Failed to run notebook: {}", e);
        }
    });
}
