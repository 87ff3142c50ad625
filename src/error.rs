//! Error types for kim.

use std::time::Duration;
use thiserror::Error;

/// Broad classification of a failure, independent of where it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request, unknown command, invalid parameters.
    InvalidInput,
    /// A channel or backend connection could not be established or was lost.
    Connectivity,
    /// A process, channel pair or other OS resource could not be created.
    Resource,
    /// A payload could not be decoded.
    Protocol,
    /// No target or node matches the requested name.
    Routing,
    /// An operation exceeded its allotted time.
    Timeout,
    /// Anything that does not fit the categories above.
    Internal,
}

/// Numeric result codes carried in responses.
pub mod code {
    pub const OK: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const INVALID_MSG_DATA: i32 = 2;
    pub const INVALID_WORKER_INDEX: i32 = 3;
    pub const UNKNOWN_CMD: i32 = 4;
    pub const INVALID_PARAMS: i32 = 5;
    pub const INVALID_CONN: i32 = 6;
    pub const INVALID_PACKET: i32 = 10;
    pub const INVALID_RESPONSE: i32 = 11;
    pub const CAN_NOT_FIND_NODE: i32 = 15;
    pub const EXEC_CMD_TIMEOUT: i32 = 102;
    pub const BACKEND_CONNECT_FAILED: i32 = 11001;
    pub const BACKEND_DISCONNECT: i32 = 11002;
}

/// Main error type for kim.
#[derive(Error, Debug)]
pub enum KimError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(u32),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Invalid worker index: {0}")]
    InvalidWorkerIndex(usize),

    #[error("Worker index {0} is already occupied")]
    WorkerIndexBusy(usize),

    #[error("Failed to create channel pair: {0}")]
    ChannelCreate(#[source] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Failed to spawn worker {index}: {message}")]
    Spawn { index: usize, message: String },

    #[error("Unknown backend target: {0}")]
    UnknownTarget(String),

    #[error("Cannot connect to backend '{target}': {message}")]
    BackendConnect { target: String, message: String },

    #[error("Backend '{target}' disconnected: {message}")]
    BackendDisconnected { target: String, message: String },

    #[error("Backend protocol error: {0}")]
    Protocol(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend multiplexer is shutting down")]
    Shutdown,

    #[error("Failed to load module '{name}': {message}")]
    ModuleLoad { name: String, message: String },

    #[error("Module '{0}' is not loaded")]
    ModuleNotFound(String),

    #[error("Module '{name}' collides with active module '{existing}'")]
    ModuleCollision { name: String, existing: String },

    #[error("Command {cmd} of module '{name}' is already owned by module '{owner}'")]
    CommandConflict {
        cmd: u32,
        name: String,
        owner: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

impl KimError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_)
            | Self::UnknownCommand(_)
            | Self::InvalidParams(_)
            | Self::InvalidWorkerIndex(_)
            | Self::Config(_) => ErrorKind::InvalidInput,
            Self::Channel(_)
            | Self::BackendConnect { .. }
            | Self::BackendDisconnected { .. }
            | Self::Shutdown => ErrorKind::Connectivity,
            Self::ChannelCreate(_) | Self::Spawn { .. } | Self::WorkerIndexBusy(_) => {
                ErrorKind::Resource
            }
            Self::Protocol(_) | Self::Json(_) => ErrorKind::Protocol,
            Self::UnknownTarget(_) => ErrorKind::Routing,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ModuleLoad { .. }
            | Self::ModuleNotFound(_)
            | Self::ModuleCollision { .. }
            | Self::CommandConflict { .. }
            | Self::Io(_)
            | Self::Sys(_) => ErrorKind::Internal,
        }
    }

    /// Numeric code reported to clients for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) => code::INVALID_MSG_DATA,
            Self::UnknownCommand(_) => code::UNKNOWN_CMD,
            Self::InvalidParams(_) => code::INVALID_PARAMS,
            Self::InvalidWorkerIndex(_) => code::INVALID_WORKER_INDEX,
            Self::Channel(_) => code::INVALID_CONN,
            Self::Protocol(_) => code::INVALID_RESPONSE,
            Self::Json(_) => code::INVALID_PACKET,
            Self::UnknownTarget(_) => code::CAN_NOT_FIND_NODE,
            Self::BackendConnect { .. } => code::BACKEND_CONNECT_FAILED,
            Self::BackendDisconnected { .. } | Self::Shutdown => code::BACKEND_DISCONNECT,
            Self::Timeout(_) => code::EXEC_CMD_TIMEOUT,
            _ => code::FAILED,
        }
    }
}

/// Result type alias for kim operations.
pub type Result<T> = std::result::Result<T, KimError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_unknown_command_kind_and_code() {
        let err = KimError::UnknownCommand(4242);
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.code(), code::UNKNOWN_CMD);
        assert!(err.to_string().contains("4242"));
    }

    #[test]
    fn test_backend_errors_are_connectivity() {
        let connect = KimError::BackendConnect {
            target: "cache".into(),
            message: "refused".into(),
        };
        let lost = KimError::BackendDisconnected {
            target: "cache".into(),
            message: "reset by peer".into(),
        };
        assert_eq!(connect.kind(), ErrorKind::Connectivity);
        assert_eq!(lost.kind(), ErrorKind::Connectivity);
        assert_eq!(KimError::Shutdown.kind(), ErrorKind::Connectivity);
        assert_eq!(connect.code(), code::BACKEND_CONNECT_FAILED);
        assert_eq!(lost.code(), code::BACKEND_DISCONNECT);
        assert!(connect.to_string().contains("cache"));
    }

    #[test]
    fn test_timeout_kind_and_code() {
        let err = KimError::Timeout(Duration::from_millis(250));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.code(), code::EXEC_CMD_TIMEOUT);
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_routing_and_resource_kinds() {
        assert_eq!(
            KimError::UnknownTarget("nope".into()).kind(),
            ErrorKind::Routing
        );
        assert_eq!(
            KimError::UnknownTarget("nope".into()).code(),
            code::CAN_NOT_FIND_NODE
        );
        let err = KimError::ChannelCreate(io::Error::other("EMFILE"));
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(err.code(), code::FAILED);
    }

    #[test]
    fn test_json_error_is_protocol() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: KimError = json_err.into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: KimError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_command_conflict_message() {
        let err = KimError::CommandConflict {
            cmd: 1001,
            name: "chat".into(),
            owner: "test".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("1001"));
        assert!(msg.contains("chat"));
        assert!(msg.contains("test"));
    }
}
