//! Wire schemas shared by the client, the worker, and the PTY engine.
//!
//! Every struct here mirrors a JSON record as laid out in the on-disk
//! session protocol: one request, one status, and three append-only
//! logs (`stream.jsonl`, `stdin.jsonl`, `control.jsonl`), plus the
//! worker heartbeat file.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `request.json`. Written once by the client, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub session_id: String,
    pub cwd: String,
    pub argv: Vec<String>,
    #[serde(default)]
    pub use_shell: bool,
    #[serde(default)]
    pub env_overrides: HashMap<String, String>,
    #[serde(default)]
    pub route: Option<String>,
    pub terminal: TerminalSize,
    pub created_at: f64,
    pub client: ClientInfo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub host: String,
    pub pid: u32,
    pub user: String,
    /// Crate version of the client that created the session, carried
    /// for forward-compatible debugging when a fleet mixes versions.
    #[serde(default)]
    pub version: String,
}

/// `status.json`. Transitions are monotonic: absent -> running -> terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum Status {
    #[serde(rename = "running")]
    Running {
        worker: WorkerRef,
        started_at: f64,
        /// Process group id of the spawned child, needed to deliver
        /// `signal` control records to the whole process group and
        /// useful on its own for debugging.
        #[serde(default)]
        pgid: Option<i32>,
    },
    #[serde(rename = "exited")]
    Exited {
        code: i32,
        started_at: f64,
        ended_at: f64,
    },
    #[serde(rename = "signaled")]
    Signaled {
        signal: String,
        started_at: f64,
        ended_at: f64,
    },
    #[serde(rename = "error")]
    Error { message: String, ended_at: f64 },
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Running { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRef {
    pub host: String,
    pub pid: u32,
}

/// `worker.claim`. Created with exclusive-create semantics; this is the
/// claim arbitration primitive between workers racing over the same
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub host: String,
    pub pid: u32,
    pub epoch: f64,
}

/// One line of `stream.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub t: f64,
    pub fd: u8,
    pub data_b64: String,
}

/// One line of `stdin.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdinRecord {
    pub t: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub eof: bool,
}

/// One line of `control.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ControlRecord {
    #[serde(rename = "signal")]
    Signal { t: f64, signal: SignalName },
    #[serde(rename = "resize")]
    Resize { t: f64, cols: u16, rows: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalName {
    SIGINT,
    SIGTERM,
    SIGQUIT,
}

impl SignalName {
    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            SignalName::SIGINT => Signal::SIGINT,
            SignalName::SIGTERM => Signal::SIGTERM,
            SignalName::SIGQUIT => Signal::SIGQUIT,
        }
    }

    pub fn number(self) -> i32 {
        self.to_nix() as i32
    }
}

/// `workers/<host>-<pid>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub host: String,
    pub pid: u32,
    #[serde(default)]
    pub route: Option<String>,
    pub started_at: f64,
    pub updated_at: f64,
    pub max_jobs: usize,
    pub active: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_json() {
        let s = Status::Exited {
            code: 7,
            started_at: 1.0,
            ended_at: 2.5,
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"state\":\"exited\""));
        let back: Status = serde_json::from_str(&json).unwrap();
        match back {
            Status::Exited { code, .. } => assert_eq!(code, 7),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn status_is_terminal() {
        let running = Status::Running {
            worker: WorkerRef {
                host: "h".into(),
                pid: 1,
            },
            started_at: 0.0,
            pgid: None,
        };
        assert!(!running.is_terminal());
        let errored = Status::Error {
            message: "boom".into(),
            ended_at: 0.0,
        };
        assert!(errored.is_terminal());
    }

    #[test]
    fn stdin_record_omits_eof_when_false() {
        let rec = StdinRecord {
            t: 0.0,
            data_b64: Some("aGk=".into()),
            eof: false,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("eof"));
    }

    #[test]
    fn control_record_signal_round_trips() {
        let rec = ControlRecord::Signal {
            t: 1.5,
            signal: SignalName::SIGINT,
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: ControlRecord = serde_json::from_str(&json).unwrap();
        match back {
            ControlRecord::Signal { signal, .. } => assert_eq!(signal, SignalName::SIGINT),
            _ => panic!("wrong variant"),
        }
    }
}
