//! Backend command multiplexing.
//!
//! Handlers inside a worker talk to key-value backends through a
//! [`Multiplexer`]. Each named target owns at most `max_conn_cnt` persistent
//! connections; every connection is driven by one local task (its *drainer*)
//! that pops queued commands in FIFO order, performs the round trip and hands
//! the reply back to the suspended caller.
//!
//! ```text
//!   handler fiber ──submit──▶ Multiplexer ──Task──▶ queue ─▶ drainer ─▶ transport
//!        ▲                                                      │
//!        └───────────────────── oneshot reply ◀─────────────────┘
//! ```
//!
//! Everything here runs on a single-threaded runtime inside a `LocalSet`, so
//! shared state uses `Rc`/`Cell` and no locks.

mod connection;
mod multiplexer;
pub mod resp;

pub use connection::ConnState;
pub use multiplexer::{ConnectionStats, Multiplexer};

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// A backend target as declared in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    /// Logical name callers submit to.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Upper bound on live connections to this target.
    pub max_conn_cnt: usize,
}

impl BackendTarget {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Timeouts applied by every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxSettings {
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Bound on one round trip, measured from when the drainer starts it.
    pub command_timeout: Duration,
    /// Connections idle this long are closed. `None` keeps them open.
    pub idle_timeout: Option<Duration>,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(3),
            idle_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// A backend command: a name followed by binary-safe arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Self {
            args: vec![name.as_ref().to_vec()],
        }
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(arg.as_ref().to_vec());
        self
    }

    /// Split a whitespace-separated command line such as `SET key value`.
    ///
    /// Returns `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let first = parts.next()?;
        Some(parts.fold(Self::new(first), |cmd, part| cmd.arg(part)))
    }

    /// Upper-cased command name, for logging and routing decisions.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_uppercase()
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

/// A backend reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    /// An error reported by the backend itself; the round trip succeeded.
    Error(String),
    Integer(i64),
    /// `None` is the nil bulk string.
    Bulk(Option<Vec<u8>>),
    /// `None` is the nil array.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Textual view of scalar replies.
    pub fn as_string(&self) -> Option<String> {
        match self {
            Reply::Status(s) => Some(s.clone()),
            Reply::Bulk(Some(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            Reply::Integer(i) => Some(i.to_string()),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Bulk(None) | Reply::Array(None))
    }

    /// JSON rendering used when a reply is returned to a client.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Reply::Status(s) => Value::String(s.clone()),
            Reply::Error(e) => serde_json::json!({ "error": e }),
            Reply::Integer(i) => Value::from(*i),
            Reply::Bulk(Some(b)) => Value::String(String::from_utf8_lossy(b).into_owned()),
            Reply::Bulk(None) | Reply::Array(None) => Value::Null,
            Reply::Array(Some(items)) => Value::Array(items.iter().map(Reply::to_json).collect()),
        }
    }
}

/// Opens transports to a backend target.
///
/// Implementations are driven from a single thread, so neither trait requires `Send`.
#[async_trait(?Send)]
pub trait Connector {
    async fn connect(&self, target: &BackendTarget) -> Result<Box<dyn Transport>>;
}

/// One live backend connection.
#[async_trait(?Send)]
pub trait Transport {
    /// Send `command` and wait for its reply.
    ///
    /// An `Err` means the transport is unusable; the caller drops it.
    async fn execute(&mut self, command: &Command) -> Result<Reply>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parse() {
        let cmd = Command::parse("  set greeting   hello ").unwrap();
        assert_eq!(cmd.name(), "SET");
        assert_eq!(cmd.args().len(), 3);
        assert_eq!(cmd.to_string(), "set greeting hello");
        assert!(Command::parse("   ").is_none());
    }

    #[test]
    fn test_command_builder_binary_args() {
        let cmd = Command::new("SET").arg("k").arg([0u8, 159, 146, 150]);
        assert_eq!(cmd.args()[2], vec![0u8, 159, 146, 150]);
    }

    #[test]
    fn test_reply_views() {
        assert_eq!(Reply::Status("OK".into()).as_string().as_deref(), Some("OK"));
        assert_eq!(Reply::Integer(7).as_string().as_deref(), Some("7"));
        assert!(Reply::Bulk(None).is_nil());
        assert_eq!(Reply::Error("ERR".into()).as_string(), None);
        let nested = Reply::Array(Some(vec![
            Reply::Bulk(Some(b"a".to_vec())),
            Reply::Bulk(None),
        ]));
        assert_eq!(nested.to_json(), serde_json::json!(["a", null]));
    }

    #[test]
    fn test_target_addr() {
        let target = BackendTarget {
            name: "cache".into(),
            host: "10.0.0.5".into(),
            port: 6379,
            max_conn_cnt: 2,
        };
        assert_eq!(target.addr(), "10.0.0.5:6379");
    }
}
