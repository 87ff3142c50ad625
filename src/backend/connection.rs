//! One backend connection and the fiber that drains its task queue.

use super::{BackendTarget, Command, Connector, MuxSettings, Reply, Transport};
use crate::error::{KimError, Result};
use std::cell::Cell;
use std::rc::Rc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Ready,
    /// The drainer has exited; the connection is never used again.
    Closed,
}

/// A submitted command waiting for its reply.
pub(crate) struct Task {
    pub command: Command,
    pub reply: oneshot::Sender<Result<Reply>>,
}

/// State shared between the pool and the drainer.
pub(crate) struct ConnShared {
    pub id: u64,
    /// Tasks queued or in flight.
    pub pending: Cell<usize>,
    pub state: Cell<ConnState>,
}

/// Pool-side handle to a connection.
pub(crate) struct ConnectionHandle {
    shared: Rc<ConnShared>,
    tx: mpsc::UnboundedSender<Task>,
}

impl ConnectionHandle {
    /// Create a connection and start its drainer on the current `LocalSet`.
    ///
    /// The transport is opened lazily by the drainer when the first task arrives.
    pub fn open(
        id: u64,
        target: Rc<BackendTarget>,
        connector: Rc<dyn Connector>,
        settings: Rc<MuxSettings>,
        shutting_down: Rc<Cell<bool>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Rc::new(ConnShared {
            id,
            pending: Cell::new(0),
            state: Cell::new(ConnState::Disconnected),
        });
        let drainer = Drainer {
            shared: shared.clone(),
            target,
            connector,
            settings,
            shutting_down,
            transport: None,
            rx,
        };
        tokio::task::spawn_local(drainer.run());
        Self { shared, tx }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.get()
    }

    pub fn state(&self) -> ConnState {
        self.shared.state.get()
    }

    /// False once the drainer has stopped accepting tasks.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Append a task to this connection's queue.
    pub fn enqueue(&self, task: Task) -> std::result::Result<(), Task> {
        self.shared.pending.set(self.shared.pending.get() + 1);
        self.tx.send(task).map_err(|e| {
            self.shared.pending.set(self.shared.pending.get() - 1);
            e.0
        })
    }
}

/// The fiber owning one transport. Only it ever touches the transport.
struct Drainer {
    shared: Rc<ConnShared>,
    target: Rc<BackendTarget>,
    connector: Rc<dyn Connector>,
    settings: Rc<MuxSettings>,
    shutting_down: Rc<Cell<bool>>,
    transport: Option<Box<dyn Transport>>,
    rx: mpsc::UnboundedReceiver<Task>,
}

impl Drainer {
    async fn run(mut self) {
        debug!(backend = %self.target.name, conn_id = self.shared.id, "connection fiber started");

        while let Some(task) = self.next_task().await {
            self.process(task).await;
        }

        self.transport = None;
        self.shared.state.set(ConnState::Closed);
        debug!(backend = %self.target.name, conn_id = self.shared.id, "connection fiber stopped");
    }

    /// Wait for the next task, or `None` when the connection should stop:
    /// every sender is gone, or the connection sat idle with nothing pending.
    async fn next_task(&mut self) -> Option<Task> {
        let Some(idle) = self.settings.idle_timeout else {
            return self.rx.recv().await;
        };
        loop {
            match timeout(idle, self.rx.recv()).await {
                Ok(task) => return task,
                Err(_) if self.shared.pending.get() == 0 => {
                    debug!(
                        backend = %self.target.name,
                        conn_id = self.shared.id,
                        idle_secs = idle.as_secs(),
                        "reaping idle connection"
                    );
                    self.rx.close();
                    return None;
                }
                Err(_) => continue,
            }
        }
    }

    async fn process(&mut self, task: Task) {
        if self.shutting_down.get() {
            self.resolve(task, Err(KimError::Shutdown));
            return;
        }
        if task.reply.is_closed() {
            trace!(conn_id = self.shared.id, cmd = %task.command.name(), "caller gone, skipping task");
            self.finish_one();
            return;
        }

        if self.transport.is_none() {
            match self.connect().await {
                Ok(transport) => self.transport = Some(transport),
                Err(e) => {
                    let message = e.to_string();
                    self.resolve(task, Err(e));
                    self.fail_queued(&message);
                    return;
                }
            }
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        let limit = self.settings.command_timeout;
        match timeout(limit, transport.execute(&task.command)).await {
            Ok(Ok(reply)) => self.resolve(task, Ok(reply)),
            Ok(Err(e)) => {
                warn!(
                    backend = %self.target.name,
                    conn_id = self.shared.id,
                    error = %e,
                    "backend I/O failed, dropping connection"
                );
                self.disconnect();
                let message = e.to_string();
                self.resolve(task, Err(e));
                self.fail_queued(&message);
            }
            Err(_) => {
                warn!(
                    backend = %self.target.name,
                    conn_id = self.shared.id,
                    cmd = %task.command.name(),
                    timeout_ms = limit.as_millis() as u64,
                    "command timed out, dropping connection"
                );
                // A late reply would otherwise be read as the next task's reply.
                self.disconnect();
                self.resolve(task, Err(KimError::Timeout(limit)));
            }
        }
    }

    async fn connect(&mut self) -> Result<Box<dyn Transport>> {
        self.shared.state.set(ConnState::Connecting);
        let limit = self.settings.connect_timeout;
        let result = match timeout(limit, self.connector.connect(&self.target)).await {
            Ok(result) => result,
            Err(_) => Err(KimError::BackendConnect {
                target: self.target.name.clone(),
                message: format!("connect timed out after {:?}", limit),
            }),
        };
        match &result {
            Ok(_) => {
                self.shared.state.set(ConnState::Ready);
                debug!(
                    backend = %self.target.name,
                    conn_id = self.shared.id,
                    addr = %self.target.addr(),
                    "backend connected"
                );
            }
            Err(e) => {
                self.shared.state.set(ConnState::Disconnected);
                warn!(
                    backend = %self.target.name,
                    conn_id = self.shared.id,
                    error = %e,
                    "backend connect failed"
                );
            }
        }
        result
    }

    fn disconnect(&mut self) {
        self.transport = None;
        self.shared.state.set(ConnState::Disconnected);
    }

    /// Fail every task already waiting in the queue.
    fn fail_queued(&mut self, message: &str) {
        let mut failed = 0usize;
        while let Ok(task) = self.rx.try_recv() {
            let err = KimError::BackendDisconnected {
                target: self.target.name.clone(),
                message: message.to_string(),
            };
            self.resolve(task, Err(err));
            failed += 1;
        }
        if failed > 0 {
            debug!(backend = %self.target.name, conn_id = self.shared.id, failed, "failed queued tasks");
        }
    }

    fn resolve(&self, task: Task, result: Result<Reply>) {
        // The caller may have given up; nothing to deliver then.
        let _ = task.reply.send(result);
        self.finish_one();
    }

    fn finish_one(&self) {
        self.shared
            .pending
            .set(self.shared.pending.get().saturating_sub(1));
    }
}
