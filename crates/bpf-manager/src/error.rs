use thiserror::Error;

#[derive(Debug, Error)]
pub enum BpfError {
    #[error("bpf-lsm enforcement is not available")]
    NotSupported,

    #[error("policy map full ({capacity} entries)")]
    CapacityExceeded { capacity: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("container '{0}' not tracked")]
    NotFound(String),

    #[error("pattern error: {0}")]
    Pattern(#[from] protecc::ProteccError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(target_os = "linux")]
    #[error("bpf load error: {0}")]
    Load(#[from] aya::EbpfError),

    #[cfg(target_os = "linux")]
    #[error("map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[cfg(target_os = "linux")]
    #[error("program error: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[cfg(target_os = "linux")]
    #[error("btf error: {0}")]
    Btf(#[from] aya::BtfError),

    #[cfg(target_os = "linux")]
    #[error("pin error: {0}")]
    Pin(#[from] aya::pin::PinError),

    #[cfg(target_os = "linux")]
    #[error("map '{name}' not found in object")]
    MapNotFound { name: &'static str },

    #[cfg(target_os = "linux")]
    #[error("program '{name}' not found in object")]
    ProgramNotFound { name: &'static str },
}

pub type Result<T> = std::result::Result<T, BpfError>;
