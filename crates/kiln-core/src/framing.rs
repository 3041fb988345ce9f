//! Length-delimited control framing shared by host and workers.
//!
//! Every control message (host↔runner and host↔worker) travels as one
//! frame:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! The host uses [`FrameCodec`] with `tokio_util::codec::Framed`; the
//! worker side of the rendezvous socket is a plain blocking fd, so the
//! [`read_frame`]/[`write_frame`] helpers mirror the codec over
//! `std::io` streams.
//!
//! Frame length is validated before any allocation. A peer closing the
//! stream mid-frame is a protocol error, distinct from a clean close at a
//! frame boundary.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Hard protocol ceiling on frame payload size (16 MiB).
///
/// Configured maxima may be lower, never higher.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length of the frame header.
const HEADER_LEN: usize = 4;

/// Framing and transport errors for the control stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Declared payload length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    Oversize {
        /// Declared payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The peer closed the stream in the middle of a frame.
    #[error("stream closed mid-frame ({got} of {want} bytes)")]
    TruncatedFrame {
        /// Bytes received before the close.
        got: usize,
        /// Bytes the header promised.
        want: usize,
    },

    /// Underlying I/O failure.
    #[error("frame i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame codec for `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Creates a codec with the protocol-ceiling maximum.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Creates a codec with a lower maximum frame length.
    ///
    /// # Panics
    ///
    /// Panics if `max` exceeds [`MAX_FRAME_LEN`].
    #[must_use]
    pub fn with_max_frame_len(max: usize) -> Self {
        assert!(
            max <= MAX_FRAME_LEN,
            "max {max} exceeds protocol ceiling {MAX_FRAME_LEN}"
        );
        Self { max_frame_len: max }
    }

    /// Returns the configured maximum payload length.
    #[must_use]
    pub const fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Validate before reserving or splitting.
        if len > self.max_frame_len {
            return Err(FrameError::Oversize {
                len,
                max: self.max_frame_len,
            });
        }
        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if item.len() > self.max_frame_len {
            return Err(FrameError::Oversize {
                len: item.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by max_frame_len
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), FrameError> {
        self.encode(Bytes::from(item), dst)
    }
}

/// Reads one frame from a blocking stream.
///
/// Returns `Ok(None)` on a clean close at a frame boundary. A close after
/// a partial header or partial payload is [`FrameError::TruncatedFrame`].
///
/// # Errors
///
/// Returns [`FrameError`] on oversize declarations, truncation, or I/O
/// failure.
pub fn read_frame<R: Read>(reader: &mut R, max_frame_len: usize) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    match read_exact_or_eof(reader, &mut header)? {
        0 => return Ok(None),
        HEADER_LEN => {}
        got => {
            return Err(FrameError::TruncatedFrame {
                got,
                want: HEADER_LEN,
            })
        }
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_len {
        return Err(FrameError::Oversize {
            len,
            max: max_frame_len,
        });
    }
    let mut payload = vec![0u8; len];
    let got = read_exact_or_eof(reader, &mut payload)?;
    if got != len {
        return Err(FrameError::TruncatedFrame { got, want: len });
    }
    Ok(Some(payload))
}

/// Writes one frame to a blocking stream and flushes it.
///
/// # Errors
///
/// Returns [`FrameError`] if the payload exceeds `max_frame_len` or the
/// write fails.
pub fn write_frame<W: Write>(
    writer: &mut W,
    payload: &[u8],
    max_frame_len: usize,
) -> Result<(), FrameError> {
    if payload.len() > max_frame_len {
        return Err(FrameError::Oversize {
            len: payload.len(),
            max: max_frame_len,
        });
    }
    #[allow(clippy::cast_possible_truncation)] // bounded by max_frame_len
    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Fills `buf` from the reader, tolerating EOF. Returns the number of
/// bytes actually read, which is less than `buf.len()` only at EOF.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
