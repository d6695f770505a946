//! Framed control channel between the runtime and a container's init
//! process: 4-byte little-endian length prefix, JSON body.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ContainerError, Result};

/// Upper bound on a single control frame; uploads stream in chunks
/// below this.
pub(crate) const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ChildRequest {
    Spawn {
        path: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        user: Option<u32>,
        wait: bool,
    },
    Kill {
        pid: i32,
    },
    Upload {
        path: String,
        mode: u32,
        data: Vec<u8>,
    },
    Download {
        path: String,
    },
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ChildReply {
    Spawned { pid: i32 },
    Exited { status: i32 },
    Data { data: Vec<u8> },
    Ok,
    Err { message: String },
}

pub(crate) fn write_frame<T: Serialize>(stream: &mut impl Write, msg: &T) -> Result<()> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME {
        return Err(ContainerError::InvalidArgument(format!(
            "control frame of {} bytes exceeds the cap",
            body.len()
        )));
    }
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}

pub(crate) fn read_frame<T: DeserializeOwned>(stream: &mut impl Read) -> Result<T> {
    let mut len_raw = [0u8; 4];
    stream.read_exact(&mut len_raw)?;
    let len = u32::from_le_bytes(len_raw) as usize;
    if len > MAX_FRAME {
        return Err(ContainerError::InvalidArgument(format!(
            "control frame of {len} bytes exceeds the cap"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trip() {
        let req = ChildRequest::Spawn {
            path: "/usr/bin/true".into(),
            args: vec![],
            env: vec![("PATH".into(), "/usr/bin".into())],
            user: None,
            wait: true,
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &req).unwrap();
        let got: ChildRequest = read_frame(&mut Cursor::new(&buf)).unwrap();
        match got {
            ChildRequest::Spawn { path, wait, .. } => {
                assert_eq!(path, "/usr/bin/true");
                assert!(wait);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn short_read_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ChildReply::Ok).unwrap();
        buf.truncate(buf.len() - 1);
        let got: Result<ChildReply> = read_frame(&mut Cursor::new(&buf));
        assert!(got.is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME as u32 + 1).to_le_bytes());
        let got: Result<ChildReply> = read_frame(&mut Cursor::new(&buf));
        assert!(got.is_err());
    }
}
