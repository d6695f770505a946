//! Container-daemon message set.

use std::path::PathBuf;

use bpf_manager::{BpfMetrics, PolicySpec};
use containerv::{LayerSpec, MountEntry};
use serde::{Deserialize, Serialize};

/// Envelope carried in every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Request { seq: u64, body: Request },
    Reply { seq: u64, body: Reply },
    Event { body: Event },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Create {
        #[serde(default)]
        id: Option<String>,
        layers: Vec<LayerSpec>,
        #[serde(default)]
        mounts: Vec<MountEntry>,
        #[serde(default)]
        policy: Option<PolicySpec>,
        #[serde(default)]
        hostname: Option<String>,
    },
    Spawn {
        id: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
        #[serde(default)]
        user: Option<u32>,
        #[serde(default)]
        wait: bool,
    },
    Kill {
        id: String,
        pid: i32,
    },
    Upload {
        id: String,
        src: PathBuf,
        dst: PathBuf,
        #[serde(default)]
        user: Option<u32>,
    },
    Download {
        id: String,
        src: PathBuf,
        dst: PathBuf,
    },
    Destroy {
        id: String,
    },
    /// Lookup used by diagnostic tooling (`cvd info`, `cvd join`).
    Info {
        id: String,
    },
    Metrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reply {
    Created {
        id: String,
        cgroup_id: u64,
    },
    Spawned {
        pid: i32,
        #[serde(default)]
        exit_status: Option<i32>,
    },
    Ok,
    Info {
        id: String,
        cgroup_id: u64,
        init_pid: i32,
        rootfs: PathBuf,
        /// Namespace capability bits the container was created with.
        capabilities: u32,
        children: Vec<i32>,
    },
    Metrics {
        bpf: BpfMetrics,
        containers: u64,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// One-way broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ContainerCreated { id: String },
    ContainerDestroyed { id: String },
    SpawnExited { id: String, pid: i32, status: i32 },
}

/// Error taxonomy carried on the wire; kinds, not type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    InvalidPattern,
    InvalidProfile,
    OutOfMemory,
    NotSupported,
    CompileFailed,
    Busy,
    NotFound,
    Io,
    Transient,
}

impl ErrorKind {
    /// CLI exit code for this kind: 1 user error, 2 system error, 3
    /// unsupported.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::InvalidArgument
            | ErrorKind::InvalidPattern
            | ErrorKind::InvalidProfile
            | ErrorKind::NotFound => 1,

            ErrorKind::OutOfMemory
            | ErrorKind::CompileFailed
            | ErrorKind::Busy
            | ErrorKind::Io
            | ErrorKind::Transient => 2,

            ErrorKind::NotSupported => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::InvalidPattern => "invalid-pattern",
            ErrorKind::InvalidProfile => "invalid-profile",
            ErrorKind::OutOfMemory => "out-of-memory",
            ErrorKind::NotSupported => "not-supported",
            ErrorKind::CompileFailed => "compile-failed",
            ErrorKind::Busy => "busy",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Io => "io",
            ErrorKind::Transient => "transient",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_round_trip() {
        let msg = Message::Request {
            seq: 1,
            body: Request::Create {
                id: Some("build-7".into()),
                layers: vec![LayerSpec::BaseRootfs {
                    path: "/tmp/rootfs".into(),
                }],
                mounts: vec![],
                policy: None,
                hostname: Some("builder".into()),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        match back {
            Message::Request {
                seq: 1,
                body: Request::Create { id, layers, .. },
            } => {
                assert_eq!(id.as_deref(), Some("build-7"));
                assert_eq!(layers.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        assert_eq!(ErrorKind::InvalidArgument.exit_code(), 1);
        assert_eq!(ErrorKind::NotFound.exit_code(), 1);
        assert_eq!(ErrorKind::Io.exit_code(), 2);
        assert_eq!(ErrorKind::Busy.exit_code(), 2);
        assert_eq!(ErrorKind::NotSupported.exit_code(), 3);
    }

    #[test]
    fn events_are_tagged() {
        let ev = Message::Event {
            body: Event::SpawnExited {
                id: "c1".into(),
                pid: 42,
                status: 0,
            },
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"kind\":\"event\""));
        assert!(json.contains("\"event\":\"spawn_exited\""));
    }
}
