//! Wire framing: a u32 big-endian length prefix, then a JSON document.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Nat64Error, Result};

/// Upper bound on one frame; a page of sessions is far below this.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

/// Reads one message. `Ok(None)` is a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes);
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(Nat64Error::Message(format!("frame length {len} out of range")));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let value = serde_json::from_slice(&payload)
        .map_err(|e| Nat64Error::Message(e.to_string()))?;
    Ok(Some(value))
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|e| Nat64Error::Message(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Nat64Error::Message("frame too large".into()))?;
    if len > MAX_FRAME_LEN {
        return Err(Nat64Error::Message(format!("frame length {len} out of range")));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::message::{Request, RequestHeader, RequestOp};
    use crate::instance::XlatorKind;

    #[tokio::test]
    async fn round_trips_a_request() {
        let request = Request {
            header: RequestHeader::new(XlatorKind::Nat64, "default"),
            op: RequestOp::InstanceHello,
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &request).await.unwrap();

        let mut reader = std::io::Cursor::new(buf);
        let decoded: Request = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded.header.instance, "default");
        assert!(matches!(decoded.op, RequestOp::InstanceHello));

        // Nothing left: clean EOF.
        let eof: Option<Request> = read_frame(&mut reader).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn rejects_oversized_frames() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut reader = std::io::Cursor::new(buf);
        let result: Result<Option<Request>> = read_frame(&mut reader).await;
        assert!(result.is_err());
    }
}
