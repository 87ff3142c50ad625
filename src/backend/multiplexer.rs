//! Command multiplexer over a bounded pool of backend connections.
//!
//! Each target gets at most `max_conn_cnt` connections, opened on first use.
//! [`Multiplexer::submit`] queues a command on the least busy connection and
//! waits for the reply that connection's drainer posts back.

use super::connection::{ConnectionHandle, Task};
use super::resp::RespConnector;
use super::{BackendTarget, Command, ConnState, Connector, MuxSettings, Reply};
use crate::error::{KimError, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument};

/// Snapshot of one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub target: String,
    pub conn_id: u64,
    pub state: ConnState,
    /// Tasks queued or in flight.
    pub pending: usize,
}

/// Routes backend commands from handler fibers onto pooled connections.
///
/// Cloning is cheap and every clone shares the same pools. A multiplexer must
/// be used from inside the `LocalSet` that created its connections.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Rc<Inner>,
}

struct Inner {
    targets: HashMap<String, Rc<BackendTarget>>,
    pools: RefCell<HashMap<String, Vec<ConnectionHandle>>>,
    connector: Rc<dyn Connector>,
    settings: Rc<MuxSettings>,
    shutting_down: Rc<Cell<bool>>,
    next_conn_id: Cell<u64>,
}

impl Multiplexer {
    pub fn new(
        targets: Vec<BackendTarget>,
        settings: MuxSettings,
        connector: Rc<dyn Connector>,
    ) -> Self {
        let targets = targets
            .into_iter()
            .map(|t| (t.name.clone(), Rc::new(t)))
            .collect();
        Self {
            inner: Rc::new(Inner {
                targets,
                pools: RefCell::new(HashMap::new()),
                connector,
                settings: Rc::new(settings),
                shutting_down: Rc::new(Cell::new(false)),
                next_conn_id: Cell::new(1),
            }),
        }
    }

    /// Multiplexer speaking RESP over TCP.
    pub fn with_resp(targets: Vec<BackendTarget>, settings: MuxSettings) -> Self {
        Self::new(targets, settings, Rc::new(RespConnector))
    }

    /// Queue `command` on a connection to `target` and wait for its reply.
    ///
    /// Commands submitted to the same connection are executed in submission
    /// order. The call never blocks the thread; only the calling task waits.
    #[instrument(level = "trace", skip_all, fields(backend = %target, cmd = %command.name()))]
    pub async fn submit(&self, target: &str, command: Command) -> Result<Reply> {
        if self.inner.shutting_down.get() {
            return Err(KimError::Shutdown);
        }
        let def = self
            .inner
            .targets
            .get(target)
            .cloned()
            .ok_or_else(|| KimError::UnknownTarget(target.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let conn_id = self.enqueue(&def, Task { command, reply: tx })?;

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                debug!(backend = %def.name, conn_id, "connection fiber dropped task");
                Err(KimError::BackendDisconnected {
                    target: def.name.clone(),
                    message: "connection closed before reply".into(),
                })
            }
        }
    }

    fn enqueue(&self, target: &Rc<BackendTarget>, task: Task) -> Result<u64> {
        let mut pools = self.inner.pools.borrow_mut();
        let pool = pools.entry(target.name.clone()).or_default();
        pool.retain(ConnectionHandle::is_alive);

        let idx = self.select(pool, target);
        let conn = &pool[idx];
        conn.enqueue(task).map_err(|_| KimError::BackendDisconnected {
            target: target.name.clone(),
            message: "connection fiber is gone".into(),
        })?;
        Ok(conn.id())
    }

    /// Pick a connection: an idle one, else a new one while under the cap,
    /// else the one with the shortest queue.
    fn select(&self, pool: &mut Vec<ConnectionHandle>, target: &Rc<BackendTarget>) -> usize {
        if let Some(idx) = pool.iter().position(|c| c.pending() == 0) {
            return idx;
        }
        if pool.len() < target.max_conn_cnt.max(1) {
            pool.push(self.open(target));
            return pool.len() - 1;
        }
        pool.iter()
            .enumerate()
            .min_by_key(|(_, c)| c.pending())
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    fn open(&self, target: &Rc<BackendTarget>) -> ConnectionHandle {
        let id = self.inner.next_conn_id.get();
        self.inner.next_conn_id.set(id + 1);
        debug!(backend = %target.name, conn_id = id, "opening backend connection");
        ConnectionHandle::open(
            id,
            target.clone(),
            self.inner.connector.clone(),
            self.inner.settings.clone(),
            self.inner.shutting_down.clone(),
        )
    }

    /// Refuse new commands and close every connection once its queue is empty.
    ///
    /// Commands already in flight finish; commands still queued fail with
    /// [`KimError::Shutdown`].
    pub fn shutdown(&self) {
        if self.inner.shutting_down.replace(true) {
            return;
        }
        let mut pools = self.inner.pools.borrow_mut();
        let connections: usize = pools.values().map(Vec::len).sum();
        pools.clear();
        info!(connections, "backend multiplexer shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.get()
    }

    /// Live connections to `target`.
    pub fn connection_count(&self, target: &str) -> usize {
        self.inner
            .pools
            .borrow()
            .get(target)
            .map(|pool| pool.iter().filter(|c| c.is_alive()).count())
            .unwrap_or(0)
    }

    /// Per-connection snapshot, ordered by target then connection id.
    pub fn stats(&self) -> Vec<ConnectionStats> {
        let pools = self.inner.pools.borrow();
        let mut stats: Vec<ConnectionStats> = pools
            .iter()
            .flat_map(|(target, pool)| {
                pool.iter().filter(|c| c.is_alive()).map(|c| ConnectionStats {
                    target: target.clone(),
                    conn_id: c.id(),
                    state: c.state(),
                    pending: c.pending(),
                })
            })
            .collect();
        stats.sort_by(|a, b| a.target.cmp(&b.target).then(a.conn_id.cmp(&b.conn_id)));
        stats
    }
}
