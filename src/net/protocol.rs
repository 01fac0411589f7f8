use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{NetFsError, Result};

/// Maximum frame size (16 MiB) to prevent unbounded allocations.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Largest data payload one read or write request carries. Leaves room in a
/// frame for the path and the rest of the message.
pub const MAX_PAYLOAD_SIZE: u32 = 8 * 1024 * 1024;

/// Write a length-prefixed, postcard-serialized message.
pub async fn write_message<W, T>(send: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = postcard::to_allocvec(msg)?;
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    if len > MAX_MESSAGE_SIZE {
        return Err(NetFsError::MessageTooLarge(len));
    }
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(&bytes).await?;
    send.flush().await?;
    Ok(())
}

/// Read a length-prefixed, postcard-serialized message.
pub async fn read_message<R, T>(recv: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(NetFsError::MessageTooLarge(len));
    }

    let mut buf = vec![0u8; len as usize];
    recv.read_exact(&mut buf).await?;
    Ok(postcard::from_bytes(&buf)?)
}

/// True when `err` means the peer closed the stream between frames.
pub fn is_disconnect(err: &NetFsError) -> bool {
    matches!(err, NetFsError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}
