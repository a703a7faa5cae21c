//! Wire framing for the two media streams
//!
//! Video frames are sent as:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: JPEG payload
//!
//! Audio is a plain sequence of fixed-size PCM chunks. The chunk size is a
//! configuration constant shared by both ends and never appears on the wire.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;
use crate::model::{MediaFrame, MediaKind};

pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Result of reading one unit from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete frame or chunk.
    Frame(Bytes),
    /// The stream ended inside a unit. The partial data is discarded; the
    /// next read reports `Closed`.
    Truncated { expected: usize, received: usize },
    /// The stream ended cleanly on a unit boundary.
    Closed,
}

/// Reads until `buf` is full or the stream ends. Returns the bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one length-prefixed video frame.
pub async fn read_video_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Inbound, TransportError> {
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    match read_full(reader, &mut len_bytes).await? {
        0 => return Ok(Inbound::Closed),
        n if n < LENGTH_PREFIX_SIZE => {
            return Ok(Inbound::Truncated {
                expected: LENGTH_PREFIX_SIZE,
                received: n,
            })
        }
        _ => {}
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(TransportError::FrameTooLarge { len, max: max_len });
    }

    let mut buf = vec![0u8; len];
    let received = read_full(reader, &mut buf).await?;
    if received < len {
        return Ok(Inbound::Truncated {
            expected: len,
            received,
        });
    }

    Ok(Inbound::Frame(Bytes::from(buf)))
}

/// Read one fixed-size audio chunk.
pub async fn read_audio_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    chunk_len: usize,
) -> Result<Inbound, TransportError> {
    let mut buf = vec![0u8; chunk_len];
    match read_full(reader, &mut buf).await? {
        0 => Ok(Inbound::Closed),
        n if n < chunk_len => Ok(Inbound::Truncated {
            expected: chunk_len,
            received: n,
        }),
        _ => Ok(Inbound::Frame(Bytes::from(buf))),
    }
}

/// Write one video frame with its length prefix.
pub async fn write_video_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), TransportError> {
    let len = prefix_for(payload.len())?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

fn prefix_for(len: usize) -> Result<u32, TransportError> {
    u32::try_from(len).map_err(|_| TransportError::FrameTooLarge {
        len,
        max: u32::MAX as usize,
    })
}

/// Serialize a frame into exactly the bytes that go on the wire.
///
/// The relay builds this once per frame and hands the same buffer to every
/// peer.
pub fn wire_bytes(frame: &MediaFrame) -> Result<Bytes, TransportError> {
    match frame.kind {
        MediaKind::Audio => Ok(frame.payload.clone()),
        MediaKind::Video => {
            let len = prefix_for(frame.payload.len())?;
            let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame.payload.len());
            buf.put_u32(len);
            buf.put_slice(&frame.payload);
            Ok(buf.freeze())
        }
    }
}

/// Reads frames of one media kind from a stream.
pub struct FrameReader<R> {
    reader: R,
    kind: MediaKind,
    audio_chunk_len: usize,
    max_video_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, kind: MediaKind, audio_chunk_len: usize, max_video_len: usize) -> Self {
        Self {
            reader,
            kind,
            audio_chunk_len,
            max_video_len,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Receive the next frame from the stream.
    pub async fn next(&mut self) -> Result<Inbound, TransportError> {
        match self.kind {
            MediaKind::Audio => read_audio_chunk(&mut self.reader, self.audio_chunk_len).await,
            MediaKind::Video => read_video_frame(&mut self.reader, self.max_video_len).await,
        }
    }
}
