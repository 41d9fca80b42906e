//! PromptDock Server
//!
//! Streams chat turns from a CLI text worker over WebSocket and runs
//! configured prompts as background tasks on a schedule or on demand.

mod api;
mod auth;
mod chat_session;
mod chat_turn;
mod config;
mod config_watcher;
mod logging;
mod notifications;
mod paths;
mod runs;
mod scheduler;
mod state;
mod tasks;
mod websocket;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use promptdock_protocol::OutputStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{ApiAuthKind, AppConfig};
use crate::config_watcher::ConfigWatcher;
use crate::logging::LoggingHandle;
use crate::notifications::Notifier;
use crate::scheduler::TaskScheduler;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "promptdock", version, about = "Chat with a CLI text worker and run scheduled prompts")]
struct Cli {
    /// Directory holding config.json, tasks.json and apis.json
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Directory served as static files
    #[arg(long, global = true, env = "PROMPTDOCK_PUBLIC_DIR", default_value = concat!(env!("CARGO_MANIFEST_DIR"), "/public"))]
    public_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP/WebSocket server (default)
    Serve,
    /// Run one task to completion and print its output
    Run { task: String },
    /// Load the configuration and validate task schedules
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_dir = paths::resolve_config_dir(cli.config_dir.as_deref());

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config_dir, &cli.public_dir).await,
        Command::Run { task } => {
            let code = run_once(&config_dir, &task).await?;
            std::process::exit(code);
        }
        Command::CheckConfig => check_config(&config_dir),
    }
}

fn load_config(config_dir: &Path) -> anyhow::Result<AppConfig> {
    AppConfig::load(config_dir)
        .with_context(|| format!("loading config from {}", config_dir.display()))
}

enum ServeExit {
    Shutdown(&'static str),
    Rebind,
}

async fn serve(config_dir: &Path, public_dir: &Path) -> anyhow::Result<()> {
    let config = load_config(config_dir)?;
    let logging = logging::init_logging(&config.log_dir)?;

    info!(
        component = "server",
        event = "server.starting",
        config_dir = %config_dir.display(),
        public_dir = %public_dir.display(),
        tasks = config.tasks.len(),
        "Starting PromptDock server"
    );

    let state = Arc::new(AppState::new(
        config,
        Notifier::new(reqwest::Client::new()),
    ));

    let (trigger_tx, mut trigger_rx) = mpsc::channel::<String>(32);
    let mut scheduler = TaskScheduler::new(trigger_tx);
    let scheduled = scheduler.schedule_tasks(&state.config());
    info!(
        component = "server",
        event = "server.tasks_scheduled",
        scheduled,
        "Scheduled tasks"
    );

    let trigger_state = state.clone();
    let trigger_task = tokio::spawn(async move {
        while let Some(name) = trigger_rx.recv().await {
            if let Err(e) = tasks::run_task(&trigger_state, &name) {
                warn!(
                    component = "server",
                    event = "server.scheduled_run_skipped",
                    task = %name,
                    error = %e,
                    "Scheduled task could not start"
                );
            }
        }
    });

    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
    let watcher = match ConfigWatcher::start(
        &paths::watch_dirs(config_dir),
        config_watcher::DEBOUNCE,
        reload_tx,
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            error!(
                component = "server",
                event = "server.watcher_failed",
                error = %e,
                "Config hot reload disabled"
            );
            None
        }
    };

    let mut shutdown = pin!(shutdown_signal());
    let signal = loop {
        let addr = state.config().server.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!(
            component = "server",
            event = "server.listening",
            addr = %addr,
            "Server listening"
        );

        let app = api::router(state.clone(), public_dir);
        let mut server = pin!(axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future());

        let exit = loop {
            tokio::select! {
                result = &mut server => {
                    result?;
                    break ServeExit::Shutdown("server stopped");
                }
                signal = &mut shutdown => break ServeExit::Shutdown(signal),
                Some(()) = reload_rx.recv() => {
                    if hot_reload(&state, config_dir, &logging, &mut scheduler) {
                        break ServeExit::Rebind;
                    }
                }
            }
        };

        match exit {
            // Dropping `server` stops accepting; open connections keep running.
            ServeExit::Rebind => continue,
            ServeExit::Shutdown(signal) => break signal,
        }
    };

    info!(
        component = "server",
        event = "server.shutdown",
        signal,
        "Shutting down gracefully"
    );
    if let Some(watcher) = watcher {
        watcher.stop();
    }
    scheduler.stop_all();
    trigger_task.abort();
    info!(
        component = "server",
        event = "server.shutdown_complete",
        "Shutdown complete"
    );
    drop(logging);
    Ok(())
}

/// Reload config from disk. A failed load keeps the running config.
/// Returns true when the listen address changed and the listener must be
/// rebound.
fn hot_reload(
    state: &Arc<AppState>,
    config_dir: &Path,
    logging: &LoggingHandle,
    scheduler: &mut TaskScheduler,
) -> bool {
    info!(
        component = "server",
        event = "server.reload_started",
        "Hot reloading configuration"
    );
    let next = match AppConfig::load(config_dir) {
        Ok(config) => config,
        Err(e) => {
            error!(
                component = "server",
                event = "server.reload_failed",
                error = %e,
                "Failed to reload config; keeping previous configuration"
            );
            return false;
        }
    };

    if let Err(e) = logging.reopen(&next.log_dir) {
        warn!(
            component = "server",
            event = "server.log_reopen_failed",
            log_dir = %next.log_dir.display(),
            error = %e,
            "Failed to reopen log directory"
        );
    }
    let scheduled = scheduler.schedule_tasks(&next);
    let new_addr = next.server.socket_addr().ok();
    let previous = state.replace_config(next);
    let rebind = previous.server.socket_addr().ok() != new_addr;

    info!(
        component = "server",
        event = "server.reload_complete",
        scheduled,
        rebind,
        "Hot reload complete"
    );
    rebind
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(
                component = "server",
                event = "server.signal_failed",
                error = %e,
                "Failed to listen for SIGINT"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Run one task in the foreground. Returns the worker's exit code.
async fn run_once(config_dir: &Path, task: &str) -> anyhow::Result<i32> {
    let config = load_config(config_dir)?;
    let logging = match logging::init_logging(&config.log_dir) {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!(
                "warning: logging to {} unavailable: {e}",
                config.log_dir.display()
            );
            None
        }
    };

    let state = Arc::new(AppState::new(
        config,
        Notifier::new(reqwest::Client::new()),
    ));
    let (started, handle) = tasks::run_task(&state, task)?;
    let finished = handle.await.context("task run panicked")?;

    if let Some(detail) = state.runs.get(&started.id) {
        for chunk in detail.output {
            match chunk.stream {
                OutputStream::Stdout => print!("{}", chunk.data),
                OutputStream::Stderr => eprint!("{}", chunk.data),
            }
        }
    }
    drop(logging);

    Ok(finished.and_then(|summary| summary.exit_code).unwrap_or(1))
}

fn check_config(config_dir: &Path) -> anyhow::Result<()> {
    let config = load_config(config_dir)?;
    let mut problems = Vec::new();

    println!("Config directory: {}", config_dir.display());
    println!(
        "Server: {} (api key {}, {} allowed IPs)",
        config.server.socket_addr()?,
        if config.server.api_key.is_empty() { "off" } else { "on" },
        config.server.allowed_ips.len()
    );
    println!(
        "Worker: {} {:?} (max {} attempts, sessions in {})",
        config.chat.worker_program,
        config.chat.worker_args,
        config.chat.max_attempts,
        config.chat.session_root.display()
    );

    let mut names: Vec<&String> = config.tasks.keys().collect();
    names.sort();
    for name in names {
        let Some(task) = config.task(name) else {
            continue;
        };
        let schedule = match task.schedule.as_deref() {
            Some(expr) => match scheduler::parse_schedule(expr) {
                Ok(s) => format!("every {}m", s.every.as_secs() / 60),
                Err(e) => {
                    problems.push(format!("task {name}: {e}"));
                    format!("invalid ({expr})")
                }
            },
            None => "manual".to_string(),
        };
        println!(
            "Task {name}: {schedule}{}, dir {}",
            if task.enabled { "" } else { ", disabled" },
            task.working_dir.display()
        );
    }

    for (name, api) in &config.apis {
        if let Some(auth) = &api.auth {
            if auth.token.is_empty() {
                problems.push(format!("api {name}: empty auth token"));
            }
            if auth.kind == ApiAuthKind::Header && auth.header.is_none() {
                problems.push(format!("api {name}: header auth without a header name"));
            }
        }
        println!(
            "API {name}: {:?} {}",
            api.kind,
            api.base_url.as_deref().unwrap_or("-")
        );
    }

    if config.pushbullet.token.is_empty() {
        println!("Pushbullet: not configured");
    }

    if problems.is_empty() {
        println!("Config OK");
        Ok(())
    } else {
        for problem in &problems {
            eprintln!("error: {problem}");
        }
        anyhow::bail!("{} config problem(s)", problems.len())
    }
}
