//! The manager process event loop.
//!
//! One current-thread runtime drives everything: the restart tick, forwarded
//! signals and messages from workers. Worker deaths are noticed on `SIGCHLD`
//! (and on every tick, in case a signal was coalesced) but only respawned on
//! the tick, so a crashing worker is restarted at most once per interval.

use super::protocol::ControlMessage;
use super::signals::{self, SignalEvents, ignore_sigpipe};
use super::spawn::ProcessLauncher;
use super::supervisor::{Supervisor, SupervisorStats};
use crate::config::Config;
use crate::error::{KimError, Result};
use nix::sys::signal::Signal;
use std::path::Path;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Run the manager until `SIGTERM` or `SIGINT`, then stop every worker.
pub fn run_manager(config: Config, config_path: &Path) -> Result<SupervisorStats> {
    ignore_sigpipe();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let signals = signals::install(&config.server_name)?;
        let work_dir = std::env::current_dir()?;
        let launcher = ProcessLauncher::current(config_path)?;
        let tick = config.restart_interval();
        let grace = config.shutdown_grace();

        info!(
            server = %config.server_name,
            workers = config.worker_cnt,
            pid = std::process::id(),
            work_dir = %work_dir.display(),
            "manager starting"
        );
        let supervisor = Supervisor::new(config, work_dir, Box::new(launcher));
        supervise(supervisor, signals, tick, grace).await
    })
}

/// Spawn every worker and keep them alive until asked to stop.
pub async fn supervise(
    mut supervisor: Supervisor,
    mut signals: SignalEvents,
    tick: Duration,
    grace: Duration,
) -> Result<SupervisorStats> {
    let mut inbound = supervisor
        .take_inbound()
        .ok_or_else(|| KimError::Channel("worker message queue already taken".into()))?;

    let started = supervisor.spawn_all();
    info!(started, "workers spawned");

    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                supervisor.reap_children();
                let restarted = supervisor.drain_restarts();
                if restarted > 0 {
                    debug!(restarted, live = supervisor.len(), "restart tick");
                }
            }
            signal = signals.recv() => match signal {
                Ok(Signal::SIGCHLD) => {
                    supervisor.reap_children();
                }
                Ok(Signal::SIGHUP) => {
                    let notified = supervisor.broadcast(&ControlMessage::reload(None)).await;
                    info!(notified, "module reload requested");
                }
                Ok(signal @ (Signal::SIGTERM | Signal::SIGINT)) => {
                    info!(signal = ?signal, "stop requested");
                    break;
                }
                Ok(other) => debug!(signal = ?other, "ignoring signal"),
                Err(e) => {
                    error!(error = %e, "signal delivery failed, stopping");
                    break;
                }
            },
            Some(message) = inbound.recv() => supervisor.handle_inbound(message),
        }
    }

    supervisor.shutdown(grace).await;
    let stats = supervisor.stats();
    info!(
        spawned = stats.spawned,
        exits = stats.exits,
        spawn_failures = stats.spawn_failures,
        restarts = stats.restarts.values().sum::<u64>(),
        "manager stopped"
    );
    Ok(stats)
}
