//! Protocol types for client-server IPC.
//!
//! The corral CLI (client) and the corral server exchange newline-delimited
//! JSON `Request`/`Response` messages over a Unix socket.

use crate::health::ProcessHealth;
use crate::inbox::{InboxId, MessageId};
use crate::router::DeliveryReceipt;
use crate::session::DeliveryMode;
use serde::{Deserialize, Serialize};

/// Requests from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping the server (for health checks / auto-start detection).
    Ping,

    /// Start a new agent session.
    Spawn {
        /// Session name. Generated when absent.
        #[serde(default)]
        name: Option<String>,
        /// Agent backend name. Falls back to `[agent] default` in config.
        #[serde(default)]
        agent: Option<String>,
        /// How messages reach the session.
        #[serde(default)]
        mode: DeliveryMode,
        /// Extra arguments appended verbatim to the agent command.
        #[serde(default)]
        args: Option<String>,
        /// Replace the agent's command (the backend still decides health patterns).
        #[serde(default)]
        command: Option<String>,
        /// Terminal rows (default: 24).
        #[serde(default = "default_rows")]
        rows: u16,
        /// Terminal columns (default: 80).
        #[serde(default = "default_cols")]
        cols: u16,
    },

    /// List all sessions.
    List,

    /// Run a fresh health check on a session.
    Status { name: String },

    /// Deliver a message to a session.
    Inject {
        name: String,
        message: String,
        /// Caller-chosen message ID, for idempotent retries in inbox mode.
        #[serde(default)]
        id: Option<MessageId>,
    },

    /// Signal a session's process.
    Kill {
        name: String,
        /// Unix signal number (default: SIGTERM = 15).
        #[serde(default = "default_signal")]
        signal: i32,
    },

    /// Recent terminal output of a session.
    Tail {
        name: String,
        /// Number of lines to return.
        #[serde(default = "default_tail_lines")]
        lines: usize,
    },

    /// Forget an exited session and delete its PID file.
    Remove { name: String },

    /// Request server shutdown.
    Shutdown,
}

/// Process state as the server last observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Exited,
}

/// Information about a single session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub agent: String,
    pub mode: DeliveryMode,
    /// PID of the PTY child.
    pub pid: u32,
    pub state: SessionState,
    pub health: ProcessHealth,
    pub command: String,
    pub inbox: InboxId,
    /// Unix timestamp when the session was spawned (millis).
    pub started_at: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Responses from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Generic success.
    Ok,

    /// Response to ping.
    Pong,

    /// Session was spawned.
    Spawned {
        name: String,
        pid: u32,
        agent: String,
        mode: DeliveryMode,
    },

    /// List of sessions.
    Sessions { sessions: Vec<SessionInfo> },

    /// Result of a health check.
    Status {
        name: String,
        health: ProcessHealth,
        /// PID-file reads the check made.
        attempts: u32,
        #[serde(default)]
        exit_code: Option<i32>,
    },

    /// Result of an injection.
    Receipt { receipt: DeliveryReceipt },

    /// Terminal output (lossy UTF-8).
    Output { data: String },

    /// Error response.
    Error { message: String },
}

impl Response {
    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

const fn default_rows() -> u16 {
    24
}
const fn default_cols() -> u16 {
    80
}
const fn default_signal() -> i32 {
    15 // SIGTERM
}
const fn default_tail_lines() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::DeliveryOutcome;

    #[test]
    fn test_spawn_defaults() {
        let req: Request = serde_json::from_str(r#"{"type":"spawn","agent":"codex"}"#).unwrap();
        let Request::Spawn {
            name,
            agent,
            mode,
            args,
            command,
            rows,
            cols,
        } = req
        else {
            panic!("expected spawn");
        };
        assert_eq!(name, None);
        assert_eq!(agent.as_deref(), Some("codex"));
        assert_eq!(mode, DeliveryMode::Pty);
        assert_eq!(args, None);
        assert_eq!(command, None);
        assert_eq!((rows, cols), (24, 80));
    }

    #[test]
    fn test_request_wire_format() {
        let req = Request::Inject {
            name: "fleet-1".into(),
            message: "hello".into(),
            id: Some(MessageId::from("m-1")),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "inject");
        assert_eq!(json["name"], "fleet-1");
        assert_eq!(json["id"], "m-1");

        let req: Request = serde_json::from_str(r#"{"type":"kill","name":"x"}"#).unwrap();
        assert!(matches!(req, Request::Kill { signal: 15, .. }));

        let req: Request = serde_json::from_str(r#"{"type":"tail","name":"x"}"#).unwrap();
        assert!(matches!(req, Request::Tail { lines: 20, .. }));
    }

    #[test]
    fn test_status_response_wire_format() {
        let resp = Response::Status {
            name: "s".into(),
            health: ProcessHealth::Alive { pid: 42 },
            attempts: 2,
            exit_code: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["health"]["status"], "alive");
        assert_eq!(json["health"]["pid"], 42);
        assert_eq!(json["attempts"], 2);
    }

    #[test]
    fn test_receipt_response_roundtrip() {
        let resp = Response::Receipt {
            receipt: DeliveryReceipt {
                session: "s".into(),
                mode: DeliveryMode::Pty,
                outcome: DeliveryOutcome::Typed,
            },
        };
        let json = serde_json::to_string(&resp).unwrap();
        let Response::Receipt { receipt } = serde_json::from_str(&json).unwrap() else {
            panic!("expected receipt");
        };
        assert_eq!(receipt.outcome, DeliveryOutcome::Typed);
    }

    #[test]
    fn test_unknown_request_type_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"type":"attach","name":"x"}"#).is_err());
    }
}
