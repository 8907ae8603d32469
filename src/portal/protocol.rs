//! Wire protocol for one portal stream's handshake.
//! Framed as a single length-prefixed JSON message in each direction before
//! the stream turns into a raw byte pipe.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{CoreError, Result};

const MAX_FRAME_LEN: u32 = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub token: String,
    pub remote_host: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin, T: Serialize>(w: &mut W, value: &T) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    if body.len() as u32 > MAX_FRAME_LEN {
        return Err(CoreError::MuxSession("handshake frame too large".into()));
    }
    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
    w.write_all(&body).await?;
    Ok(())
}

pub async fn read_frame<R: tokio::io::AsyncRead + Unpin, T: for<'de> Deserialize<'de>>(r: &mut R) -> Result<T> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CoreError::MuxSession("handshake frame too large".into()));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_roundtrips_through_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let handshake = Handshake {
            token: "t".into(),
            remote_host: "db.internal".into(),
            remote_port: 5432,
        };
        write_frame(&mut client, &handshake).await.unwrap();
        let received: Handshake = read_frame(&mut server).await.unwrap();
        assert_eq!(received.remote_port, 5432);

        write_frame(&mut server, &HandshakeReply::ok()).await.unwrap();
        let reply: HandshakeReply = read_frame(&mut client).await.unwrap();
        assert!(reply.success);
    }
}
