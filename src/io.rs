use std::io::ErrorKind;

use anyhow::{bail, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_PACKET: usize = 16 * 1024 * 1024;

/// Reads one length-prefixed MessagePack packet. `None` on a clean EOF
/// between packets.
pub(crate) async fn read_packet<R, T>(r: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = [0u8; 4];
    match r.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_le_bytes(buf) as usize;
    if length > MAX_PACKET {
        bail!("packet of {} bytes exceeds limit of {}", length, MAX_PACKET);
    }
    let mut buf = vec![0u8; length];
    r.read_exact(&mut buf).await?;
    let res = rmp_serde::from_slice::<T>(&buf)?;
    Ok(Some(res))
}

pub(crate) async fn write_packet<W, T>(w: &mut W, packet: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = rmp_serde::to_vec_named(packet)?;
    if buf.len() > MAX_PACKET {
        bail!("packet of {} bytes exceeds limit of {}", buf.len(), MAX_PACKET);
    }
    let length = buf.len() as u32;
    w.write_all(&u32::to_le_bytes(length)).await?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}
