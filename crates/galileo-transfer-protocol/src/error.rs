//! Transfer protocol error types.

use thiserror::Error;

/// Errors produced while encoding or decoding protocol frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload is shorter or longer than the message requires
    #[error("Invalid payload length for {what}: expected {expected}, got {actual}")]
    InvalidLength {
        /// Message being decoded
        what: &'static str,
        /// Expected byte count
        expected: usize,
        /// Actual byte count
        actual: usize,
    },

    /// Stream did not start with the start-of-frame marker
    #[error("Expected start of frame 0x7e, found {found:#04x}")]
    BadStartOfFrame {
        /// Byte found where the marker was expected
        found: u8,
    },

    /// Frame kind byte is not part of the protocol
    #[error("Unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    /// Frame checksum did not match its contents
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// CRC carried by the frame
        expected: u32,
        /// CRC computed over the received bytes
        actual: u32,
    },

    /// Payload exceeds the protocol maximum
    #[error("Payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Offending payload length
        len: usize,
        /// Maximum permitted length
        max: usize,
    },

    /// Response carried a sequence number other than the outstanding request's
    #[error("Sequence mismatch: sent {sent}, received {received}")]
    SequenceMismatch {
        /// Sequence number of the outstanding request
        sent: u16,
        /// Sequence number in the response
        received: u16,
    },

    /// Board answered with a response that makes no sense for the request
    #[error("Unexpected response to {request}: {response}")]
    UnexpectedResponse {
        /// Request that was outstanding
        request: &'static str,
        /// Response that arrived
        response: &'static str,
    },
}

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
