//! Board transfer protocol for Galileo firmware flashing.
//!
//! This crate is intentionally I/O-free. It provides the frame codec, the
//! typed request/response set, and a pure simulated board that can be driven
//! by tests without hardware or a serial port.
//!
//! # Wire format
//!
//! Every message is a single frame:
//!
//! ```text
//! +------+------+---------+---------+-----------------+-----------+
//! | 0x7E | kind | seq u16 | len u16 | payload[len]    | crc32 u32 |
//! +------+------+---------+---------+-----------------+-----------+
//! ```
//!
//! Integers are little-endian. The CRC (CRC-32/ISO-HDLC) covers `kind`
//! through the end of the payload. The host keeps exactly one request
//! outstanding; the board answers with a response carrying the same `seq`.
//!
//! | Request | Payload | Response |
//! |---------|---------|----------|
//! | `Sync` (0x01) | none | `Ack` |
//! | `Erase` (0x02) | image length u32 | `Ack` |
//! | `Write` (0x03) | block u32, offset u32, data | `Ack` or `Nack` |
//! | `Verify` (0x04) | image length u32 | `Digest` (SHA-256) |
//! | `Abort` (0x05) | none | `Ack` |

#![deny(unsafe_op_in_unsafe_fn)]
#![deny(static_mut_refs)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod board;
pub mod commands;
pub mod error;
pub mod frame;

pub use board::{BoardFaults, SimulatedBoard};
pub use commands::{NackCode, Request, RequestKind, Response};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    FRAME_HEADER_LEN, FRAME_OVERHEAD, Frame, FrameDecoder, MAX_CHUNK_LEN, MAX_PAYLOAD_LEN,
    START_OF_FRAME, WRITE_HEADER_LEN, encode_frame,
};

/// Length of the image digest carried by a `Digest` response.
pub const DIGEST_LEN: usize = 32;
