//! Wire protocol between the container daemon and its clients.
//!
//! Frames are a 4-byte little-endian length prefix followed by a JSON
//! body. Each endpoint binds one protocol; messages are a tagged
//! envelope of requests, sequence-matched replies, and one-way event
//! broadcasts. Endpoints are Unix domain sockets (filesystem paths or
//! abstract names starting with `@`) or inet4 TCP addresses.

mod endpoint;
mod frame;
mod message;

pub use endpoint::{Conn, Endpoint, Listener};
pub use frame::{read_message, write_message, MAX_FRAME};
pub use message::{ErrorKind, Event, Message, Reply, Request};

use thiserror::Error;

/// Default control socket for a system-wide daemon.
pub const DEFAULT_SOCKET: &str = "/run/cvd.sock";

/// Environment override for the control socket.
pub const SOCKET_ENV: &str = "CVD_SOCKET";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the cap")]
    FrameTooLarge(usize),

    #[error("peer closed the connection")]
    Closed,

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
