//! Wire format for pullwire streams.
//!
//! A response body is the 8-byte stream id followed by frames:
//!
//! ```text
//! [id: i64 BE]
//! repeated {
//!   [len: i32 BE]
//!   len >= 0         -> [len bytes: item payload]
//!   len == i32::MIN  -> completion, stream ends
//!   len <  0         -> [-len bytes: UTF-8 error text], stream ends
//! }
//! ```
//!
//! One frame is exactly one item, completion or error. Empty items are valid
//! and distinct from completion. Any length up to `i32::MAX` is valid on the
//! wire; readers may opt into a lower limit with [`read_frame_with_limit`].

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, StreamError};
use crate::streaming::channel::StreamId;

/// Length value marking clean completion
pub const COMPLETION_SENTINEL: i32 = i32::MIN;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the stream id header
pub const STREAM_ID_SIZE: usize = 8;

/// Largest payload a length prefix can announce
pub const MAX_PAYLOAD_SIZE: usize = i32::MAX as usize;

// =============================================================================
// Frame
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A data item
    Item(Bytes),
    /// Clean end of stream
    Complete,
    /// Producer failure; the stream ends
    Error(String),
}

impl Frame {
    pub fn item(payload: impl Into<Bytes>) -> Self {
        Self::Item(payload.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error(text.into())
    }

    /// Bytes this frame occupies on the wire, prefix included
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_SIZE
            + match self {
                Self::Item(b) => b.len(),
                Self::Complete => 0,
                Self::Error(t) => t.len(),
            }
    }

    /// Length prefix as written on the wire
    pub fn length_prefix(&self) -> Result<i32> {
        match self {
            Self::Item(b) => checked_len(b.len()),
            Self::Complete => Ok(COMPLETION_SENTINEL),
            // the payload of an error frame is never empty on the wire:
            // -0 would read back as an empty item
            Self::Error(t) if t.is_empty() => Ok(-1),
            Self::Error(t) => checked_len(t.len()).map(|n| -n),
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let len = self.length_prefix()?;
        buf.reserve(self.encoded_len() + 1);
        buf.put_i32(len);
        match self {
            Self::Item(b) => buf.put_slice(b),
            Self::Complete => {}
            Self::Error(t) if t.is_empty() => buf.put_u8(b' '),
            Self::Error(t) => buf.put_slice(t.as_bytes()),
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len() + 1);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn checked_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| {
        StreamError::protocol(format!(
            "payload of {} bytes does not fit a length prefix (max {})",
            len, MAX_PAYLOAD_SIZE
        ))
    })
}

/// What a length prefix announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    Item(usize),
    Complete,
    Error(usize),
}

fn parse_header(len: i32, limit: Option<usize>) -> Result<Header> {
    let header = match len {
        COMPLETION_SENTINEL => Header::Complete,
        n if n >= 0 => Header::Item(n as usize),
        n => Header::Error(n.unsigned_abs() as usize),
    };
    match (header, limit) {
        (Header::Item(n) | Header::Error(n), Some(max)) if n > max => {
            Err(StreamError::protocol(format!(
                "frame size {} exceeds configured limit {}",
                n, max
            )))
        }
        (h, _) => Ok(h),
    }
}

fn frame_from_payload(header: Header, payload: Bytes) -> Frame {
    match header {
        Header::Item(_) => Frame::Item(payload),
        Header::Complete => Frame::Complete,
        Header::Error(_) => Frame::Error(String::from_utf8_lossy(&payload).into_owned()),
    }
}

// =============================================================================
// Stream id header
// =============================================================================

pub async fn write_stream_id<W: AsyncWrite + Unpin>(w: &mut W, id: StreamId) -> Result<()> {
    w.write_i64(id.as_i64()).await?;
    Ok(())
}

pub fn encode_stream_id(id: StreamId) -> Bytes {
    Bytes::copy_from_slice(&id.as_i64().to_be_bytes())
}

/// Read the id that precedes the first frame. Zero is never a valid id.
pub async fn read_stream_id<R: AsyncRead + Unpin>(r: &mut R) -> Result<StreamId> {
    let raw = match r.read_i64().await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(StreamError::protocol(
                "stream ended before the stream id was read",
            ))
        }
        Err(e) => return Err(e.into()),
    };
    StreamId::new(raw).ok_or_else(|| StreamError::protocol("peer sent the reserved stream id 0"))
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame, waiting until its payload is complete.
///
/// EOF anywhere inside a frame, or before the first byte of a frame, is a
/// protocol violation: a well-formed stream always ends with a terminal frame.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    read_frame_with_limit(r, None).await
}

/// [`read_frame`] that rejects payloads larger than `limit` before reading them.
///
/// The payload buffer grows with the bytes that actually arrive, so a corrupt
/// length prefix costs no more memory than the peer really sends.
pub async fn read_frame_with_limit<R: AsyncRead + Unpin>(
    r: &mut R,
    limit: Option<usize>,
) -> Result<Frame> {
    let len = match r.read_i32().await {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(StreamError::protocol(
                "stream ended without a completion or error frame",
            ))
        }
        Err(e) => return Err(e.into()),
    };

    let header = parse_header(len, limit)?;
    let payload_len = match header {
        Header::Item(n) | Header::Error(n) => n,
        Header::Complete => return Ok(Frame::Complete),
    };

    let mut payload = Vec::with_capacity(payload_len.min(READ_CHUNK));
    let read = (&mut *r)
        .take(payload_len as u64)
        .read_to_end(&mut payload)
        .await?;
    if read < payload_len {
        return Err(StreamError::protocol(
            "encountered EOF before expected length was read",
        ));
    }

    Ok(frame_from_payload(header, Bytes::from(payload)))
}

/// Initial payload allocation; larger payloads grow as they arrive
const READ_CHUNK: usize = 64 * 1024;

// =============================================================================
// Tests
// =============================================================================
