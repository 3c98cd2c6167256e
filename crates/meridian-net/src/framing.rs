//! Frame read/write helpers over async streams.

use meridian_proto::{FrameHeader, MessageType, FRAME_HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{NetError, Result};

/// Reads one frame from the stream.
///
/// Returns `None` on a clean end-of-stream at a frame boundary. The
/// payload length is validated against the protocol's frame size limit
/// before the payload is read.
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<(FrameHeader, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    match stream.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FrameHeader::parse(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await?;

    Ok(Some((header, payload)))
}

/// Reads one frame, requiring a specific message type.
pub async fn read_frame_expecting<S>(stream: &mut S, expected: MessageType) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let (header, payload) = read_frame(stream)
        .await?
        .ok_or_else(|| NetError::UnexpectedMessage("connection closed mid-exchange".to_owned()))?;

    if header.message_type != expected {
        return Err(NetError::UnexpectedMessage(format!(
            "expected {expected:?} frame, got {:?}",
            header.message_type
        )));
    }

    Ok(payload)
}

/// Writes a pre-encoded frame (header + payload) and flushes.
pub async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Connects to a `host:port` address, mapping refusal to a typed error.
pub async fn connect(addr: &str) -> Result<TcpStream> {
    TcpStream::connect(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::ConnectionRefused {
            NetError::ConnectionRefused(addr.to_owned())
        } else {
            NetError::Io(e)
        }
    })
}
