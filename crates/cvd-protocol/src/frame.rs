//! Async length-prefixed JSON framing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ProtocolError, Result};

/// Upper bound on one frame; uploads chunk below this.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_raw = [0u8; 4];
    match reader.read_exact(&mut len_raw).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Closed)
        }
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(len_raw) as usize;
    if len > MAX_FRAME {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Request};

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Message::Request {
            seq: 7,
            body: Request::Destroy { id: "c1".into() },
        };
        write_message(&mut a, &msg).await.unwrap();
        let got: Message = read_message(&mut b).await.unwrap();
        match got {
            Message::Request { seq, body } => {
                assert_eq!(seq, 7);
                assert!(matches!(body, Request::Destroy { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_peer_reports_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let got: Result<Message> = read_message(&mut b).await;
        assert!(matches!(got, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME as u32 + 1).to_le_bytes())
            .await
            .unwrap();
        let got: Result<Message> = read_message(&mut b).await;
        assert!(matches!(got, Err(ProtocolError::FrameTooLarge(_))));
    }
}
