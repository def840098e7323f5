//! wanfail: multi-WAN failover daemon.
//!
//! - Probes every configured uplink each tick (or simulates them with
//!   `--simulate`)
//! - Scores, ranks and switches the primary through the router's routing
//!   backend
//! - Reloads its configuration on SIGHUP
//! - Serves status, history, audit events and operator actions on a local
//!   control API

mod api;
mod collector;
mod logging;
mod notify;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use wanfail_core::config::DEFAULT_CONFIG_PATH;
use wanfail_core::{Controller, FailoverConfig, Supervisor, SupervisorHandle};

use collector::{AgentCollector, PingCollector, SimCollector};

const NOTIFICATION_QUEUE: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Multi-WAN failover daemon.
#[derive(Parser, Debug)]
#[command(name = "wanfail", version, about = "Multi-WAN failover daemon")]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter when RUST_LOG is unset (e.g. `debug`, `wanfail_core=trace`).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Generate link metrics instead of probing.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Control API listen address.
    #[arg(long, default_value = "127.0.0.1:8090")]
    listen: SocketAddr,

    /// Validate the configuration and exit.
    #[arg(long, default_value_t = false)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log = logging::init(&cli.log_level)?;

    let cfg = FailoverConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.check {
        tracing::info!(
            config = %cli.config.display(),
            links = cfg.links.len(),
            backend = ?cfg.controller.backend,
            "configuration valid"
        );
        return Ok(());
    }

    tracing::info!(
        config = %cli.config.display(),
        links = cfg.links.len(),
        simulate = cli.simulate,
        dry_run = cfg.controller.dry_run,
        "wanfail starting"
    );

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let collector = if cli.simulate {
        AgentCollector::Sim(SimCollector::default())
    } else {
        AgentCollector::Ping(PingCollector::default())
    };
    let controller = Controller::from_config(&cfg.controller);
    let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_QUEUE);
    let (supervisor, handle) = Supervisor::new(cfg, collector, controller);
    let supervisor = supervisor.with_notifications(notify_tx);

    // ── Task 1: Tick loop ───────────────────────────────────────
    let mut supervisor_task = tokio::spawn(supervisor.run(shutdown_rx.clone()));

    // ── Task 2: Notification sink ───────────────────────────────
    let _notify_task = tokio::spawn(notify::run(notify_rx));

    // ── Task 3: Control API ─────────────────────────────────────
    let api_state = api::ApiState {
        handle: handle.clone(),
        log,
    };
    let mut api_task = tokio::spawn(api::serve(api_state, cli.listen, shutdown_rx.clone()));

    // ── Task 4: SIGHUP reload ───────────────────────────────────
    let _reload_task = tokio::spawn(reload_on_hup(
        cli.config.clone(),
        handle,
        shutdown_rx.clone(),
    ));

    // ── Shutdown handling ───────────────────────────────────────
    tokio::select! {
        signal = shutdown_signal() => {
            tracing::info!(signal, "shutting down");
        }
        result = &mut supervisor_task => {
            if let Err(e) = result {
                tracing::error!("supervisor task failed: {e}");
            }
        }
        result = &mut api_task => {
            match result {
                Ok(Err(e)) => tracing::error!("control API failed: {e:#}"),
                Err(e) => tracing::error!("control API task failed: {e}"),
                Ok(Ok(())) => {}
            }
        }
    }
    let _ = shutdown_tx.send(true);

    if !supervisor_task.is_finished()
        && tokio::time::timeout(SHUTDOWN_GRACE, supervisor_task)
            .await
            .is_err()
    {
        tracing::warn!("tick loop did not stop within {SHUTDOWN_GRACE:?}");
    }

    tracing::info!("wanfail stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        },
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

/// Re-read `path` on every SIGHUP. A config that fails to load is recorded as
/// rejected and the running one stays in force.
#[cfg(unix)]
async fn reload_on_hup(path: PathBuf, handle: SupervisorHandle, mut shutdown: watch::Receiver<bool>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("cannot listen for SIGHUP, reload disabled: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = hup.recv() => {
                if received.is_none() {
                    break;
                }
                tracing::info!(config = %path.display(), "SIGHUP, reloading configuration");
                if reload(&path, &handle).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hup(_path: PathBuf, _handle: SupervisorHandle, _shutdown: watch::Receiver<bool>) {}

async fn reload(path: &Path, handle: &SupervisorHandle) -> Result<(), wanfail_core::SupervisorError> {
    match FailoverConfig::load(path) {
        Ok(cfg) => {
            let changes = handle.reload(cfg).await?;
            tracing::info!(changes = changes.len(), "configuration reloaded");
        }
        Err(e) => {
            tracing::warn!(error = %e, "configuration rejected, keeping the running one");
            handle.reject(e.to_string()).await?;
        }
    }
    Ok(())
}
