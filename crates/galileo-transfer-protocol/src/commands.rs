//! Typed requests and responses carried inside frames.

use crate::DIGEST_LEN;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{Frame, MAX_CHUNK_LEN, WRITE_HEADER_LEN, encode_frame};

const KIND_SYNC: u8 = 0x01;
const KIND_ERASE: u8 = 0x02;
const KIND_WRITE: u8 = 0x03;
const KIND_VERIFY: u8 = 0x04;
const KIND_ABORT: u8 = 0x05;

const KIND_ACK: u8 = 0x80;
const KIND_NACK: u8 = 0x81;
const KIND_DIGEST: u8 = 0x82;

/// Request discriminant, used for logging and history tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Reset the board's transfer state
    Sync,
    /// Erase the image region
    Erase,
    /// Write one block
    Write,
    /// Read back the image digest
    Verify,
    /// Abandon the current transfer
    Abort,
}

impl RequestKind {
    /// Map a frame kind byte to a request kind.
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            KIND_SYNC => Some(Self::Sync),
            KIND_ERASE => Some(Self::Erase),
            KIND_WRITE => Some(Self::Write),
            KIND_VERIFY => Some(Self::Verify),
            KIND_ABORT => Some(Self::Abort),
            _ => None,
        }
    }

    /// Frame kind byte.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Sync => KIND_SYNC,
            Self::Erase => KIND_ERASE,
            Self::Write => KIND_WRITE,
            Self::Verify => KIND_VERIFY,
            Self::Abort => KIND_ABORT,
        }
    }

    /// Short name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Erase => "erase",
            Self::Write => "write",
            Self::Verify => "verify",
            Self::Abort => "abort",
        }
    }
}

/// Host to board request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    /// Reset any half-finished transfer
    Sync,
    /// Erase space for an image of `image_len` bytes
    Erase {
        /// Total image length
        image_len: u32,
    },
    /// Write one block of image data
    Write {
        /// Zero-based block index; must be written in order
        block: u32,
        /// Byte offset of `data` within the image
        offset: u32,
        /// Block contents, at most [`MAX_CHUNK_LEN`] bytes
        data: &'a [u8],
    },
    /// Ask the board for the SHA-256 of the first `image_len` bytes written
    Verify {
        /// Total image length
        image_len: u32,
    },
    /// Abandon the transfer and return to idle
    Abort,
}

impl<'a> Request<'a> {
    /// Kind of this request.
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Sync => RequestKind::Sync,
            Request::Erase { .. } => RequestKind::Erase,
            Request::Write { .. } => RequestKind::Write,
            Request::Verify { .. } => RequestKind::Verify,
            Request::Abort => RequestKind::Abort,
        }
    }

    /// Encode into a complete frame.
    pub fn encode(&self, seq: u16) -> ProtocolResult<Vec<u8>> {
        let kind = self.kind().to_u8();
        match self {
            Request::Sync | Request::Abort => encode_frame(kind, seq, &[]),
            Request::Erase { image_len } | Request::Verify { image_len } => {
                encode_frame(kind, seq, &image_len.to_le_bytes())
            }
            Request::Write {
                block,
                offset,
                data,
            } => {
                if data.len() > MAX_CHUNK_LEN {
                    return Err(ProtocolError::PayloadTooLarge {
                        len: data.len(),
                        max: MAX_CHUNK_LEN,
                    });
                }
                let mut payload = Vec::with_capacity(WRITE_HEADER_LEN + data.len());
                payload.extend_from_slice(&block.to_le_bytes());
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(data);
                encode_frame(kind, seq, &payload)
            }
        }
    }

    /// Decode a request, borrowing write data from the frame.
    pub fn decode(frame: &'a Frame) -> ProtocolResult<Self> {
        let kind = RequestKind::from_u8(frame.kind).ok_or(ProtocolError::UnknownKind(frame.kind))?;
        let payload = frame.payload.as_slice();
        match kind {
            RequestKind::Sync => expect_empty(payload, "sync").map(|()| Request::Sync),
            RequestKind::Abort => expect_empty(payload, "abort").map(|()| Request::Abort),
            RequestKind::Erase => {
                read_u32(payload, "erase").map(|image_len| Request::Erase { image_len })
            }
            RequestKind::Verify => {
                read_u32(payload, "verify").map(|image_len| Request::Verify { image_len })
            }
            RequestKind::Write => {
                let (header, data) = payload.split_at_checked(WRITE_HEADER_LEN).ok_or(
                    ProtocolError::InvalidLength {
                        what: "write",
                        expected: WRITE_HEADER_LEN,
                        actual: payload.len(),
                    },
                )?;
                let (block, offset) = header.split_at(4);
                Ok(Request::Write {
                    block: read_u32(block, "write block")?,
                    offset: read_u32(offset, "write offset")?,
                    data,
                })
            }
        }
    }
}

/// Reason code carried by a negative acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackCode {
    /// Request could not be parsed
    Malformed,
    /// Block arrived out of sequence
    OutOfOrder,
    /// Write falls outside the erased region
    OutOfRange,
    /// Write or verify before erase
    EraseRequired,
    /// Flash programming failed on the board
    FlashWrite,
    /// Board is busy with another operation
    Busy,
    /// Code not known to this host
    Other(u8),
}

impl NackCode {
    /// Decode a wire code.
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Malformed,
            2 => Self::OutOfOrder,
            3 => Self::OutOfRange,
            4 => Self::EraseRequired,
            5 => Self::FlashWrite,
            6 => Self::Busy,
            other => Self::Other(other),
        }
    }

    /// Wire code.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Malformed => 1,
            Self::OutOfOrder => 2,
            Self::OutOfRange => 3,
            Self::EraseRequired => 4,
            Self::FlashWrite => 5,
            Self::Busy => 6,
            Self::Other(code) => code,
        }
    }
}

impl std::fmt::Display for NackCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed request"),
            Self::OutOfOrder => write!(f, "block out of order"),
            Self::OutOfRange => write!(f, "write out of range"),
            Self::EraseRequired => write!(f, "erase required"),
            Self::FlashWrite => write!(f, "flash write failed"),
            Self::Busy => write!(f, "board busy"),
            Self::Other(code) => write!(f, "code {code}"),
        }
    }
}

/// Board to host response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Request accepted
    Ack,
    /// Request rejected
    Nack(NackCode),
    /// SHA-256 of the written image
    Digest([u8; DIGEST_LEN]),
}

impl Response {
    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Response::Ack => "ack",
            Response::Nack(_) => "nack",
            Response::Digest(_) => "digest",
        }
    }

    /// Encode into a complete frame.
    pub fn encode(&self, seq: u16) -> ProtocolResult<Vec<u8>> {
        match self {
            Response::Ack => encode_frame(KIND_ACK, seq, &[]),
            Response::Nack(code) => encode_frame(KIND_NACK, seq, &[code.to_u8()]),
            Response::Digest(digest) => encode_frame(KIND_DIGEST, seq, digest),
        }
    }

    /// Decode a response frame.
    pub fn decode(frame: &Frame) -> ProtocolResult<Self> {
        let payload = frame.payload.as_slice();
        match frame.kind {
            KIND_ACK => expect_empty(payload, "ack").map(|()| Response::Ack),
            KIND_NACK => match payload {
                [code] => Ok(Response::Nack(NackCode::from_u8(*code))),
                _ => Err(ProtocolError::InvalidLength {
                    what: "nack",
                    expected: 1,
                    actual: payload.len(),
                }),
            },
            KIND_DIGEST => <[u8; DIGEST_LEN]>::try_from(payload)
                .map(Response::Digest)
                .map_err(|_| ProtocolError::InvalidLength {
                    what: "digest",
                    expected: DIGEST_LEN,
                    actual: payload.len(),
                }),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

fn expect_empty(payload: &[u8], what: &'static str) -> ProtocolResult<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::InvalidLength {
            what,
            expected: 0,
            actual: payload.len(),
        })
    }
}

fn read_u32(bytes: &[u8], what: &'static str) -> ProtocolResult<u32> {
    <[u8; 4]>::try_from(bytes)
        .map(u32::from_le_bytes)
        .map_err(|_| ProtocolError::InvalidLength {
            what,
            expected: 4,
            actual: bytes.len(),
        })
}
