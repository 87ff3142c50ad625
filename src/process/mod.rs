//! Process model: one manager supervising `worker_cnt` worker processes.
//!
//! The manager re-executes its own binary for every worker and talks to it
//! over a control channel and a data channel (see [`channel`]). Workers that
//! die are queued in a [`RestartQueue`] and respawned on the next restart tick.

pub mod channel;
pub mod manager;
pub mod protocol;
pub mod restart;
pub mod signals;
pub mod spawn;
pub mod supervisor;
pub mod worker_main;

pub use channel::{ChannelPair, Endpoints, LineReader, LineWriter};
pub use manager::run_manager;
pub use protocol::{ControlMessage, WorkerEvent};
pub use restart::RestartQueue;
pub use signals::TerminationReason;
pub use spawn::{Launcher, ProcessLauncher, WorkerInit};
pub use supervisor::{Inbound, Supervisor, SupervisorStats, WorkerRecord};
pub use worker_main::run_worker_main;
