//! Frame encoding and incremental decoding.
//!
//! Layout: `SOF | kind | seq (LE u16) | len (LE u16) | payload | crc32 (LE u32)`.

use crate::error::{ProtocolError, ProtocolResult};

/// Start-of-frame marker.
pub const START_OF_FRAME: u8 = 0x7E;

/// SOF, kind, seq and len.
pub const FRAME_HEADER_LEN: usize = 6;

const CRC_LEN: usize = 4;

/// Header plus trailing CRC.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + CRC_LEN;

/// Largest firmware chunk a single `Write` request may carry.
pub const MAX_CHUNK_LEN: usize = 4096;

/// Block index and offset that precede the data in a `Write` payload.
pub const WRITE_HEADER_LEN: usize = 8;

/// Largest payload any frame may carry.
pub const MAX_PAYLOAD_LEN: usize = MAX_CHUNK_LEN + WRITE_HEADER_LEN;

/// A decoded frame whose checksum has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message kind
    pub kind: u8,
    /// Sequence number
    pub seq: u16,
    /// Raw payload
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame from its parts.
    pub fn new(kind: u8, seq: u16, payload: Vec<u8>) -> Self {
        Self { kind, seq, payload }
    }

    /// Encode this frame into wire bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_frame(self.kind, self.seq, &self.payload)
    }

    /// Decode exactly one complete frame from `bytes`.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut decoder = FrameDecoder::new();
        decoder.push(bytes);
        match decoder.next_frame()? {
            Some(frame) if decoder.buffered() == 0 => Ok(frame),
            Some(frame) => Err(ProtocolError::InvalidLength {
                what: "frame",
                expected: FRAME_OVERHEAD + frame.payload.len(),
                actual: bytes.len(),
            }),
            None => Err(ProtocolError::InvalidLength {
                what: "frame",
                expected: FRAME_OVERHEAD,
                actual: bytes.len(),
            }),
        }
    }
}

fn frame_crc(kind: u8, seq: [u8; 2], len: [u8; 2], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(&seq);
    hasher.update(&len);
    hasher.update(payload);
    hasher.finalize()
}

/// Encode a frame.
///
/// Fails with [`ProtocolError::PayloadTooLarge`] when `payload` exceeds
/// [`MAX_PAYLOAD_LEN`].
pub fn encode_frame(kind: u8, seq: u16, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    let len = u16::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_PAYLOAD_LEN)
        .ok_or(ProtocolError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        })?;

    let seq = seq.to_le_bytes();
    let len = len.to_le_bytes();
    let crc = frame_crc(kind, seq, len, payload);

    let mut out = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    out.push(START_OF_FRAME);
    out.push(kind);
    out.extend_from_slice(&seq);
    out.extend_from_slice(&len);
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Incremental decoder for a byte stream that may deliver frames in pieces.
///
/// On a framing error the offending bytes are discarded so that the next call
/// can resynchronise on the following start-of-frame marker.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Take the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> ProtocolResult<Option<Frame>> {
        let Some(&first) = self.buf.first() else {
            return Ok(None);
        };

        if first != START_OF_FRAME {
            let skip = self
                .buf
                .iter()
                .position(|&b| b == START_OF_FRAME)
                .unwrap_or(self.buf.len());
            self.buf.drain(..skip);
            return Err(ProtocolError::BadStartOfFrame { found: first });
        }

        let Some(header) = self
            .buf
            .get(..FRAME_HEADER_LEN)
            .and_then(|h| <[u8; FRAME_HEADER_LEN]>::try_from(h).ok())
        else {
            return Ok(None);
        };
        let [_, kind, s0, s1, l0, l1] = header;
        let len = usize::from(u16::from_le_bytes([l0, l1]));

        if len > MAX_PAYLOAD_LEN {
            self.buf.drain(..1);
            return Err(ProtocolError::PayloadTooLarge {
                len,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let total = FRAME_OVERHEAD + len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let raw: Vec<u8> = self.buf.drain(..total).collect();
        let payload = raw
            .get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len)
            .unwrap_or_default()
            .to_vec();
        let expected = raw
            .get(FRAME_HEADER_LEN + len..)
            .and_then(|c| <[u8; CRC_LEN]>::try_from(c).ok())
            .map(u32::from_le_bytes)
            .unwrap_or_default();
        let actual = frame_crc(kind, [s0, s1], [l0, l1], &payload);

        if expected != actual {
            return Err(ProtocolError::CrcMismatch { expected, actual });
        }

        Ok(Some(Frame {
            kind,
            seq: u16::from_le_bytes([s0, s1]),
            payload,
        }))
    }
}
