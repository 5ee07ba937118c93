//! Length-prefixed message framing.
//!
//! Each frame is a 4-byte big-endian length followed by a MessagePack
//! `Message`. Works over any tokio byte stream, so the same code serves
//! iroh QUIC streams and in-memory pipes.

use crate::error::{ProtocolError, ProtocolResult};
use sync_types::{CodecError, Message};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame. Returns `None` if the stream ended cleanly before a frame.
pub async fn read_message<R>(recv: &mut R, max_frame: usize) -> ProtocolResult<Option<Message>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = recv
            .read(&mut len_buf[filled..])
            .await
            .map_err(|e| ProtocolError::Stream(e.to_string()))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Stream(
                "stream ended inside a frame header".to_string(),
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(CodecError::FrameTooLarge {
            size: len,
            limit: max_frame,
        }
        .into());
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| ProtocolError::Stream(e.to_string()))?;

    Ok(Some(Message::from_bytes(&buf)?))
}

/// Write one frame and flush it.
pub async fn write_message<W>(send: &mut W, message: &Message) -> ProtocolResult<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = message.to_bytes()?;
    let len = u32::try_from(bytes.len()).map_err(|_| ProtocolError::InvalidMessage {
        reason: format!("message of {} bytes exceeds frame limit", bytes.len()),
    })?;

    send.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| ProtocolError::Stream(e.to_string()))?;
    send.write_all(&bytes)
        .await
        .map_err(|e| ProtocolError::Stream(e.to_string()))?;
    send.flush()
        .await
        .map_err(|e| ProtocolError::Stream(e.to_string()))?;

    Ok(bytes.len() + 4)
}
