//! The manager's worker table.
//!
//! The supervisor owns one [`WorkerRecord`] per live worker, keyed by index
//! and by pid. Worker deaths are detected by [`Supervisor::reap_children`]
//! (driven by `SIGCHLD` and the restart tick); each dead worker's index is
//! queued once and respawned by the next [`Supervisor::drain_restarts`].

use super::channel::{ChannelPair, Endpoints, LineReader, LineWriter};
use super::protocol::{ControlMessage, WorkerEvent};
use super::restart::RestartQueue;
use super::signals::{TerminationReason, analyze_wait_status};
use super::spawn::{Launcher, WorkerInit};
use crate::config::Config;
use crate::error::{KimError, Result};
use crate::module::{Request, Response};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which of a worker's two channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Data,
}

/// Something a worker sent, or the end of one of its channels.
#[derive(Debug)]
pub enum Inbound {
    Event {
        index: usize,
        pid: Pid,
        event: WorkerEvent,
    },
    Response {
        index: usize,
        pid: Pid,
        response: Response,
    },
    Closed {
        index: usize,
        pid: Pid,
        channel: ChannelKind,
    },
}

/// A live worker as seen by the manager.
pub struct WorkerRecord {
    pub index: usize,
    pub pid: Pid,
    pub name: String,
    pub work_dir: PathBuf,
    /// Set once the worker reports it is serving.
    pub ready: bool,
    pub started_at: Instant,
    control: LineWriter<OwnedWriteHalf>,
    data: LineWriter<OwnedWriteHalf>,
    readers: [JoinHandle<()>; 2],
}

impl Drop for WorkerRecord {
    fn drop(&mut self) {
        // Dropping the read halves with the tasks closes the manager's ends.
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Counters reported by [`Supervisor::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub live_workers: usize,
    pub spawned: u64,
    pub spawn_failures: u64,
    pub exits: u64,
    /// Successful restarts per worker index.
    pub restarts: BTreeMap<usize, u64>,
}

pub struct Supervisor {
    config: Config,
    work_dir: PathBuf,
    launcher: Box<dyn Launcher>,
    workers: BTreeMap<usize, WorkerRecord>,
    pids: HashMap<Pid, usize>,
    restarts: RestartQueue,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    shutting_down: bool,
    stats: SupervisorStats,
}

impl Supervisor {
    pub fn new(config: Config, work_dir: PathBuf, launcher: Box<dyn Launcher>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            restarts: RestartQueue::new(config.worker_cnt),
            config,
            work_dir,
            launcher,
            workers: BTreeMap::new(),
            pids: HashMap::new(),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            shutting_down: false,
            stats: SupervisorStats::default(),
        }
    }

    /// Receiver of everything workers send. Can be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.inbound_rx.take()
    }

    /// Start the worker for `index` and register its channels.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&mut self, index: usize) -> Result<Pid> {
        if index == 0 || index > self.config.worker_cnt {
            return Err(KimError::InvalidWorkerIndex(index));
        }
        if self.workers.contains_key(&index) {
            return Err(KimError::WorkerIndexBusy(index));
        }

        let result = self.try_spawn(index);
        match &result {
            Ok(pid) => {
                self.stats.spawned += 1;
                info!(
                    worker_index = index,
                    pid = pid.as_raw(),
                    name = %self.config.worker_name(index),
                    "worker spawned"
                );
            }
            Err(e) => {
                self.stats.spawn_failures += 1;
                error!(worker_index = index, error = %e, "failed to spawn worker");
            }
        }
        result
    }

    fn try_spawn(&mut self, index: usize) -> Result<Pid> {
        let ChannelPair { manager, worker } = ChannelPair::new()?;
        let init = WorkerInit::new(index, self.config.worker_name(index), &self.work_dir);
        let pid = self.launcher.launch(&init, &worker)?;
        drop(worker);

        match self.attach(&init, pid, manager) {
            Ok(record) => {
                self.pids.insert(pid, index);
                self.workers.insert(index, record);
                Ok(pid)
            }
            Err(e) => {
                warn!(worker_index = index, pid = pid.as_raw(), error = %e, "channel registration failed, killing worker");
                let _ = signal::kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                Err(e)
            }
        }
    }

    fn attach(&self, init: &WorkerInit, pid: Pid, ends: Endpoints) -> Result<WorkerRecord> {
        let (control, data) = self.launcher.register(ends)?;
        let (control_rd, control_wr) = control.into_split();
        let (data_rd, data_wr) = data.into_split();
        let index = init.index;

        let readers = [
            spawn_reader(
                index,
                pid,
                ChannelKind::Control,
                control_rd,
                self.inbound_tx.clone(),
                move |event: WorkerEvent| Inbound::Event { index, pid, event },
            ),
            spawn_reader(
                index,
                pid,
                ChannelKind::Data,
                data_rd,
                self.inbound_tx.clone(),
                move |response: Response| Inbound::Response {
                    index,
                    pid,
                    response,
                },
            ),
        ];

        Ok(WorkerRecord {
            index,
            pid,
            name: init.name.clone(),
            work_dir: init.work_dir.clone(),
            ready: false,
            started_at: Instant::now(),
            control: LineWriter::new(control_wr),
            data: LineWriter::new(data_wr),
            readers,
        })
    }

    /// Spawn every index `1..=worker_cnt`. Returns how many started.
    pub fn spawn_all(&mut self) -> usize {
        (1..=self.config.worker_cnt)
            .filter(|&index| self.spawn(index).is_ok())
            .count()
    }

    /// Collect the exit status of every worker that has terminated.
    ///
    /// Only known worker pids are waited for.
    pub fn reap_children(&mut self) -> Vec<(usize, TerminationReason)> {
        let pids: Vec<Pid> = self.pids.keys().copied().collect();
        let mut reaped = Vec::new();
        for pid in pids {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    if let Some(index) = self.on_child_terminated(pid, status) {
                        reaped.push((index, analyze_wait_status(status)));
                    }
                }
                Err(Errno::ECHILD) => {
                    warn!(pid = pid.as_raw(), "worker vanished without an exit status");
                    if let Some(index) = self.retire(pid, &TerminationReason::Unknown) {
                        reaped.push((index, TerminationReason::Unknown));
                    }
                }
                Err(e) => warn!(pid = pid.as_raw(), error = %e, "waitpid failed"),
            }
        }
        reaped
    }

    /// Record the termination of `pid` and queue its index for restart.
    ///
    /// Returns the worker index, or `None` for unknown pids and statuses
    /// that do not end the process.
    pub fn on_child_terminated(&mut self, pid: Pid, status: WaitStatus) -> Option<usize> {
        let reason = analyze_wait_status(status);
        if !reason.is_terminal() {
            debug!(pid = pid.as_raw(), reason = %reason, "ignoring non-terminal child status");
            return None;
        }
        self.retire(pid, &reason)
    }

    fn retire(&mut self, pid: Pid, reason: &TerminationReason) -> Option<usize> {
        let Some(index) = self.pids.remove(&pid) else {
            debug!(pid = pid.as_raw(), "ignoring exit of unknown child");
            return None;
        };
        drop(self.workers.remove(&index));
        self.stats.exits += 1;

        if reason.is_init_failure() {
            error!(worker_index = index, pid = pid.as_raw(), reason = %reason, "worker failed to initialise");
        } else if self.shutting_down {
            info!(worker_index = index, pid = pid.as_raw(), reason = %reason, "worker exited");
        } else {
            warn!(worker_index = index, pid = pid.as_raw(), reason = %reason, "worker terminated");
        }

        if !self.shutting_down && self.restarts.push(index) {
            debug!(worker_index = index, pending = self.restarts.len(), "worker restart queued");
        }
        Some(index)
    }

    /// Respawn every queued index. Returns how many restarted.
    ///
    /// An index whose spawn fails is queued again for the next call.
    pub fn drain_restarts(&mut self) -> usize {
        if self.shutting_down {
            self.restarts.clear();
            return 0;
        }
        let mut restarted = 0;
        let mut retry = Vec::new();
        while let Some(index) = self.restarts.pop() {
            match self.spawn(index) {
                Ok(pid) => {
                    *self.stats.restarts.entry(index).or_default() += 1;
                    restarted += 1;
                    info!(worker_index = index, pid = pid.as_raw(), "worker restarted");
                }
                Err(KimError::WorkerIndexBusy(_)) => {}
                Err(_) => retry.push(index),
            }
        }
        for index in retry {
            self.restarts.push(index);
        }
        restarted
    }

    /// Log what a worker reported.
    pub fn handle_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::Event { index, pid, event } => {
                // Late messages from a previous occupant of the slot.
                let Some(record) = self.workers.get_mut(&index).filter(|r| r.pid == pid) else {
                    debug!(worker_index = index, pid = pid.as_raw(), "dropping event from stale worker");
                    return;
                };
                match event {
                    WorkerEvent::Ready { .. } => {
                        record.ready = true;
                        info!(
                            worker_index = index,
                            pid = pid.as_raw(),
                            startup_ms = record.started_at.elapsed().as_millis() as u64,
                            "worker ready"
                        );
                    }
                    WorkerEvent::Reloaded { module, seq } => {
                        info!(worker_index = index, module = %module, seq, "worker reloaded module");
                    }
                    WorkerEvent::ReloadFailed { module, message } => {
                        warn!(worker_index = index, module = %module, error = %message, "worker failed to reload module");
                    }
                }
            }
            Inbound::Response {
                index,
                pid,
                response,
            } => {
                debug!(
                    worker_index = index,
                    pid = pid.as_raw(),
                    cmd = response.cmd,
                    seq = response.seq,
                    code = response.code,
                    "response from worker"
                );
            }
            Inbound::Closed {
                index,
                pid,
                channel,
            } => {
                debug!(worker_index = index, pid = pid.as_raw(), channel = ?channel, "worker channel closed");
            }
        }
    }

    /// Send a control message to one worker.
    pub async fn send_control(&mut self, index: usize, message: &ControlMessage) -> Result<()> {
        let record = self
            .workers
            .get_mut(&index)
            .ok_or(KimError::InvalidWorkerIndex(index))?;
        record.control.send(message).await
    }

    /// Send a control message to every worker. Returns how many accepted it.
    pub async fn broadcast(&mut self, message: &ControlMessage) -> usize {
        let indices: Vec<usize> = self.workers.keys().copied().collect();
        let mut delivered = 0;
        for index in indices {
            match self.send_control(index, message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(worker_index = index, error = %e, "control message not delivered"),
            }
        }
        delivered
    }

    /// Forward a request on a worker's data channel.
    pub async fn send_request(&mut self, index: usize, request: &Request) -> Result<()> {
        let record = self
            .workers
            .get_mut(&index)
            .ok_or(KimError::InvalidWorkerIndex(index))?;
        record.data.send(request).await
    }

    /// Deliver `signal` to the worker at `index`.
    pub fn signal(&self, index: usize, signal: Signal) -> Result<()> {
        let pid = self.pid_of(index).ok_or(KimError::InvalidWorkerIndex(index))?;
        signal::kill(pid, signal)?;
        Ok(())
    }

    /// Stop every worker: ask politely, wait up to `grace`, then SIGKILL.
    ///
    /// No worker is restarted once shutdown has begun.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.shutting_down = true;
        self.restarts.clear();

        let notified = self.broadcast(&ControlMessage::Shutdown).await;
        info!(
            workers = self.workers.len(),
            notified,
            grace_ms = grace.as_millis() as u64,
            "stopping workers"
        );

        let deadline = Instant::now() + grace;
        loop {
            self.reap_children();
            if self.workers.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stragglers: Vec<(usize, Pid)> =
            self.workers.values().map(|r| (r.index, r.pid)).collect();
        for (index, pid) in stragglers {
            warn!(worker_index = index, pid = pid.as_raw(), "worker did not stop in time, killing");
            let _ = signal::kill(pid, Signal::SIGKILL);
            match waitpid(pid, None) {
                Ok(status) => {
                    self.on_child_terminated(pid, status);
                }
                Err(_) => {
                    self.retire(pid, &TerminationReason::Unknown);
                }
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn worker(&self, index: usize) -> Option<&WorkerRecord> {
        self.workers.get(&index)
    }

    /// Live workers in index order.
    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn pid_of(&self, index: usize) -> Option<Pid> {
        self.workers.get(&index).map(|r| r.pid)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn is_restart_pending(&self, index: usize) -> bool {
        self.restarts.is_pending(index)
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            live_workers: self.workers.len(),
            ..self.stats.clone()
        }
    }
}

/// Forward every message read from a worker channel to the inbound queue.
fn spawn_reader<T, F>(
    index: usize,
    pid: Pid,
    channel: ChannelKind,
    half: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Inbound>,
    wrap: F,
) -> JoinHandle<()>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Inbound + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = LineReader::new(half);
        loop {
            match reader.read::<T>().await {
                Ok(Some(message)) => {
                    if tx.send(wrap(message)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(KimError::Json(e)) => {
                    warn!(worker_index = index, channel = ?channel, error = %e, "undecodable message from worker");
                }
                Err(e) => {
                    debug!(worker_index = index, channel = ?channel, error = %e, "worker channel read failed");
                    break;
                }
            }
        }
        let _ = tx.send(Inbound::Closed {
            index,
            pid,
            channel,
        });
    })
}
