//! Map library errors onto the wire taxonomy.

use bpf_manager::BpfError;
use containerv::ContainerError;
use cvd_protocol::ErrorKind;
use protecc::ProteccError;

pub fn container_kind(err: &ContainerError) -> ErrorKind {
    match err {
        ContainerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        ContainerError::NotFound(_) => ErrorKind::NotFound,
        ContainerError::NotSupported(_) => ErrorKind::NotSupported,
        ContainerError::Busy(_) => ErrorKind::Busy,
        ContainerError::Transient(_) | ContainerError::ReadyTimeout { .. } => ErrorKind::Transient,
        ContainerError::ControlClosed
        | ContainerError::Child(_)
        | ContainerError::Io(_)
        | ContainerError::Codec(_) => ErrorKind::Io,
        #[cfg(target_os = "linux")]
        ContainerError::Errno(_) => ErrorKind::Io,
    }
}

pub fn bpf_kind(err: &BpfError) -> ErrorKind {
    match err {
        BpfError::NotSupported => ErrorKind::NotSupported,
        BpfError::CapacityExceeded { .. } => ErrorKind::Busy,
        BpfError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        BpfError::NotFound(_) => ErrorKind::NotFound,
        BpfError::Pattern(inner) => protecc_kind(inner),
        _ => ErrorKind::Io,
    }
}

pub fn protecc_kind(err: &ProteccError) -> ErrorKind {
    match err {
        ProteccError::InvalidPattern { .. } => ErrorKind::InvalidPattern,
        ProteccError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        ProteccError::InvalidProfile(_) => ErrorKind::InvalidProfile,
        ProteccError::CompileFailed(_) => ErrorKind::CompileFailed,
        ProteccError::Io(_) | ProteccError::Ruleset(_) => ErrorKind::Io,
    }
}
