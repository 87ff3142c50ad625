//! kim - multi-process server runtime.
//!
//! A manager process keeps `worker_cnt` worker processes alive, restarting any
//! that die. Each worker routes requests to handler modules and reaches
//! backend servers through a per-worker command multiplexer.

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod module;
pub mod process;

pub use error::{KimError, Result};
