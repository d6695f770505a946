use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not supported on this platform: {0}")]
    NotSupported(&'static str),

    #[error("busy: {0}")]
    Busy(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("container '{id}' did not become ready within {timeout_secs}s")]
    ReadyTimeout { id: String, timeout_secs: u64 },

    #[error("control channel closed")]
    ControlClosed,

    #[error("child reported: {0}")]
    Child(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(target_os = "linux")]
    #[error("syscall failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("control codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ContainerError>;
