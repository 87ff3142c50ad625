//! Control channel messages.
//!
//! Messages are JSON-serialized and newline-delimited. The data channel
//! carries [`Request`](crate::module::Request) and
//! [`Response`](crate::module::Response) values in the same framing.

use serde::{Deserialize, Serialize};

/// Manager to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Stop serving and exit.
    #[serde(rename = "shutdown")]
    Shutdown,

    /// Reload one module, or every active module when `module` is absent.
    #[serde(rename = "reload")]
    Reload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        module: Option<String>,
    },
}

/// Worker to manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// Initialisation finished; the worker is serving.
    #[serde(rename = "ready")]
    Ready { index: usize, pid: i32 },

    #[serde(rename = "reloaded")]
    Reloaded { module: String, seq: u64 },

    /// The previous version of `module` is still active.
    #[serde(rename = "reload_failed")]
    ReloadFailed { module: String, message: String },
}

impl ControlMessage {
    pub fn reload(module: Option<&str>) -> Self {
        Self::Reload {
            module: module.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_wire_format() {
        let line = serde_json::to_string(&ControlMessage::Shutdown).unwrap();
        assert_eq!(line, r#"{"type":"shutdown"}"#);

        let line = serde_json::to_string(&ControlMessage::reload(None)).unwrap();
        assert_eq!(line, r#"{"type":"reload"}"#);

        let parsed: ControlMessage =
            serde_json::from_str(r#"{"type":"reload","module":"test"}"#).unwrap();
        assert_eq!(parsed, ControlMessage::reload(Some("test")));
    }

    #[test]
    fn test_worker_event_wire_format() {
        let ready: WorkerEvent =
            serde_json::from_str(r#"{"type":"ready","index":2,"pid":4242}"#).unwrap();
        assert_eq!(ready, WorkerEvent::Ready { index: 2, pid: 4242 });

        let failed = WorkerEvent::ReloadFailed {
            module: "test".into(),
            message: "boom".into(),
        };
        let line = serde_json::to_string(&failed).unwrap();
        assert!(line.contains(r#""type":"reload_failed""#));
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"explode"}"#).is_err());
    }
}
