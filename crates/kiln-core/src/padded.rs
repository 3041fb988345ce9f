//! Power-of-two padded framing for tenant payloads.
//!
//! Used where tenant payloads cross a trust boundary or are cached
//! externally, so observable frame sizes leak only a coarse bucket of the
//! true payload length. Wire layout:
//!
//! ```text
//! byte 0        version (3 bits) | compression (5 bits)
//! bytes 1..5    payload length, big-endian u32
//! bytes 5..5+L  payload
//! bytes 5+L..N  zero padding
//! ```
//!
//! `N` is the smallest power of two that fits header plus payload, clamped
//! from below by the configured floor. Compression itself is applied by
//! the caller; this codec only carries the flag.

/// Bits reserved for the framing version in byte 0.
const VERSION_BITS: u32 = 3;

/// Bits reserved for the compression kind in byte 0.
const COMPRESSION_BITS: u32 = 8 - VERSION_BITS;

/// Mask extracting the compression kind from byte 0.
const COMPRESSION_MASK: u8 = (1 << COMPRESSION_BITS) - 1;

/// Current framing version.
pub const PADDED_VERSION: u8 = 0;

/// Header length: flags byte plus the 4-byte payload length.
pub const PADDED_HEADER_LEN: usize = 5;

/// Default lower clamp on total frame size (64 bytes).
pub const DEFAULT_MIN_FRAME_LEN: usize = 64;

/// Compression applied to the payload by the caller, carried in the flags
/// byte so the receiving side knows how to undo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionKind {
    /// No compression.
    None,
    /// Brotli.
    Brotli,
    /// Gzip.
    Gzip,
}

impl CompressionKind {
    const fn to_bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Brotli => 1,
            Self::Gzip => 2,
        }
    }

    const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::None),
            1 => Some(Self::Brotli),
            2 => Some(Self::Gzip),
            _ => None,
        }
    }
}

/// Errors from encoding or decoding a padded frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaddedFrameError {
    /// Input shorter than the fixed header.
    #[error("padded frame header truncated: {0} bytes")]
    HeaderTruncated(usize),

    /// Unknown framing version.
    #[error("unsupported padded framing version {0}")]
    Version(u8),

    /// Unknown compression bits.
    #[error("unknown compression kind {0}")]
    Compression(u8),

    /// Declared payload does not fit the provided bytes.
    #[error("payload truncated: header declares {want}, frame holds {got}")]
    PayloadTruncated {
        /// Declared payload length.
        want: usize,
        /// Bytes available after the header.
        got: usize,
    },

    /// Frame would exceed the configured maximum.
    #[error("padded frame of {len} bytes exceeds maximum {max}")]
    Oversize {
        /// Total frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// A decoded padded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedFrame {
    /// Framing version from the flags byte.
    pub version: u8,
    /// Compression the caller applied to the payload.
    pub compression: CompressionKind,
    /// The payload, padding stripped.
    pub payload: Vec<u8>,
}

/// Encoder/decoder for padded frames with configured clamps.
#[derive(Debug, Clone)]
pub struct PaddedCodec {
    min_frame_len: usize,
    max_frame_len: usize,
}

impl PaddedCodec {
    /// Creates a codec with the given total-frame clamps.
    ///
    /// `min_frame_len` is rounded up to a power of two so every emitted
    /// frame size stays a power of two.
    #[must_use]
    pub fn new(min_frame_len: usize, max_frame_len: usize) -> Self {
        Self {
            min_frame_len: min_frame_len.max(1).next_power_of_two(),
            max_frame_len,
        }
    }

    /// Total frame length that `payload_len` bytes will occupy.
    #[must_use]
    pub fn frame_len(&self, payload_len: usize) -> usize {
        (PADDED_HEADER_LEN + payload_len)
            .next_power_of_two()
            .max(self.min_frame_len)
    }

    /// Encodes `payload` into one padded frame.
    ///
    /// # Errors
    ///
    /// Returns [`PaddedFrameError::Oversize`] if the padded frame would
    /// exceed the configured maximum.
    pub fn encode(
        &self,
        compression: CompressionKind,
        payload: &[u8],
    ) -> Result<Vec<u8>, PaddedFrameError> {
        let total = self.frame_len(payload.len());
        if total > self.max_frame_len {
            return Err(PaddedFrameError::Oversize {
                len: total,
                max: self.max_frame_len,
            });
        }
        let mut frame = vec![0u8; total];
        frame[0] = (PADDED_VERSION << COMPRESSION_BITS) | compression.to_bits();
        #[allow(clippy::cast_possible_truncation)] // bounded by max_frame_len
        let len_be = (payload.len() as u32).to_be_bytes();
        frame[1..PADDED_HEADER_LEN].copy_from_slice(&len_be);
        frame[PADDED_HEADER_LEN..PADDED_HEADER_LEN + payload.len()].copy_from_slice(payload);
        // Remainder is already zeroed padding.
        Ok(frame)
    }

    /// Decodes one padded frame, discarding padding.
    ///
    /// # Errors
    ///
    /// Returns [`PaddedFrameError`] on truncated input, an unknown
    /// version, unknown compression bits, or an oversize declaration.
    pub fn decode(&self, frame: &[u8]) -> Result<PaddedFrame, PaddedFrameError> {
        if frame.len() < PADDED_HEADER_LEN {
            return Err(PaddedFrameError::HeaderTruncated(frame.len()));
        }
        let version = frame[0] >> COMPRESSION_BITS;
        if version != PADDED_VERSION {
            return Err(PaddedFrameError::Version(version));
        }
        let compression = CompressionKind::from_bits(frame[0] & COMPRESSION_MASK)
            .ok_or(PaddedFrameError::Compression(frame[0] & COMPRESSION_MASK))?;
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        if PADDED_HEADER_LEN + len > self.max_frame_len {
            return Err(PaddedFrameError::Oversize {
                len: PADDED_HEADER_LEN + len,
                max: self.max_frame_len,
            });
        }
        let body = &frame[PADDED_HEADER_LEN..];
        if body.len() < len {
            return Err(PaddedFrameError::PayloadTruncated {
                want: len,
                got: body.len(),
            });
        }
        Ok(PaddedFrame {
            version,
            compression,
            payload: body[..len].to_vec(),
        })
    }
}

impl Default for PaddedCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FRAME_LEN, super::framing::MAX_FRAME_LEN)
    }
}
