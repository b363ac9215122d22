//! Error types for firmware update operations

use std::fmt;

use galileo_transfer_protocol::{NackCode, ProtocolError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::session::UpdatePhase;

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Informational, no action required
    Info,
    /// Something the user should know about
    Warning,
    /// The operation failed
    Error,
    /// The board may be left in an unusable state
    Critical,
}

/// Errors from parsing or comparing firmware versions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// Version string could not be parsed
    #[error("Invalid firmware version '{input}': {reason}")]
    Parse {
        /// Offending input
        input: String,
        /// Why parsing failed
        reason: String,
    },

    /// The two versions come from different version schemes
    #[error("Incomparable firmware versions '{left}' and '{right}'")]
    IncomparableVersions {
        /// Left-hand version
        left: String,
        /// Right-hand version
        right: String,
    },
}

/// Structural problems found while validating a capsule
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedCapsule {
    /// File is too short to hold a header
    #[error("capsule is {actual} bytes, header needs {expected}")]
    TooShort {
        /// Minimum length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Magic bytes do not identify a capsule
    #[error("bad magic {found:02x?}")]
    BadMagic {
        /// First four bytes found
        found: [u8; 4],
    },

    /// Container format version is not supported
    #[error("unsupported container format version {0}")]
    UnsupportedFormat(u16),

    /// Header length field disagrees with the header contents
    #[error("header length {declared} does not match expected {expected}")]
    HeaderLength {
        /// Value of the header length field
        declared: usize,
        /// Length implied by the version string
        expected: usize,
    },

    /// Declared payload size differs from the bytes present
    #[error("declared payload size {declared} does not match actual size {actual}")]
    SizeMismatch {
        /// Size recorded in the header
        declared: u64,
        /// Bytes following the header
        actual: u64,
    },

    /// Capsule carries no firmware
    #[error("payload is empty")]
    EmptyPayload,

    /// Payload is larger than the board can hold
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Payload length
        len: u64,
        /// Configured maximum
        max: u64,
    },

    /// Payload digest does not match the header
    #[error("payload digest mismatch: header {expected}, computed {actual}")]
    DigestMismatch {
        /// Hex digest from the header
        expected: String,
        /// Hex digest of the payload
        actual: String,
    },

    /// Header carries no version string
    #[error("missing version string")]
    MissingVersion,

    /// Version string is not valid UTF-8
    #[error("version string is not valid UTF-8")]
    VersionNotUtf8,

    /// Version string does not parse
    #[error("invalid embedded version: {0}")]
    Version(VersionError),

    /// Version string is longer than the header can encode
    #[error("version string of {0} bytes is too long")]
    VersionTooLong(usize),

    /// Embedded version differs from the version the capsule was opened as
    #[error("capsule is labelled {declared} but carries {embedded}")]
    VersionMismatch {
        /// Version the caller expects
        declared: String,
        /// Version in the header
        embedded: String,
    },
}

/// Errors from capsule validation
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Capsule does not exist or cannot be read
    #[error("Capsule not found or unreadable: {location}")]
    NotFound {
        /// Path or resource name
        location: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Capsule exists but the process may not read it
    #[error("Permission denied reading capsule: {location}")]
    PermissionDenied {
        /// Path or resource name
        location: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Capsule failed a structural check
    #[error("Malformed capsule {location}: {reason}")]
    Malformed {
        /// Path or resource name
        location: String,
        /// What was wrong
        reason: MalformedCapsule,
    },
}

impl ValidationError {
    pub(crate) fn from_io(location: String, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => {
                ValidationError::PermissionDenied { location, source }
            }
            _ => ValidationError::NotFound { location, source },
        }
    }

    /// Path or resource name the error refers to.
    pub fn location(&self) -> &str {
        match self {
            ValidationError::NotFound { location, .. }
            | ValidationError::PermissionDenied { location, .. }
            | ValidationError::Malformed { location, .. } => location,
        }
    }
}

/// Failure of a single request/acknowledge exchange on the channel
#[derive(Debug, Error)]
pub enum ChannelFault {
    /// Reading or writing the channel failed
    #[error("channel I/O error")]
    Io(#[source] std::io::Error),

    /// Board did not answer in time
    #[error("no response within {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Board rejected the request
    #[error("board rejected request: {0}")]
    Nack(NackCode),

    /// Board closed the channel
    #[error("channel closed by board")]
    Closed,

    /// Board sent something the protocol does not allow
    #[error("protocol violation")]
    Protocol(#[source] ProtocolError),
}

impl ChannelFault {
    /// Whether the board itself reported the problem, as opposed to the link
    /// failing underneath the protocol.
    pub fn is_board_reported(&self) -> bool {
        matches!(self, ChannelFault::Nack(_) | ChannelFault::Timeout { .. })
    }
}

/// Where in the transfer sequence a write failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStage {
    /// Initial resynchronisation
    Sync,
    /// Erasing the image region
    Erase,
    /// Writing the block with this zero-based index
    Block(u32),
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStage::Sync => write!(f, "sync"),
            TransferStage::Erase => write!(f, "erase"),
            TransferStage::Block(block) => write!(f, "block {block}"),
        }
    }
}

/// Failure of the post-write verification pass
#[derive(Debug, Error)]
pub enum VerifyFault {
    /// Board digest differs from the capsule digest
    #[error("digest mismatch: expected {expected}, board reported {actual}")]
    DigestMismatch {
        /// Capsule digest (hex)
        expected: String,
        /// Board digest (hex)
        actual: String,
    },

    /// Digest could not be read back
    #[error("readback failed")]
    Readback(#[source] ChannelFault),
}

/// Errors from the transfer engine
#[derive(Debug, Error)]
pub enum TransferError {
    /// A request before or during the write phase failed
    #[error("Write failed at {stage}")]
    WriteFailed {
        /// Stage that failed
        stage: TransferStage,
        /// What went wrong on the channel
        #[source]
        source: ChannelFault,
    },

    /// Image was written but did not verify
    #[error("Verification failed")]
    VerificationFailed(#[source] VerifyFault),

    /// Transfer was cancelled with the board idle: either nothing had been
    /// sent yet or the board acknowledged the abort
    #[error("Transfer cancelled")]
    Cancelled,

    /// Transfer was cancelled but the board never acknowledged the abort,
    /// so its state is unknown
    #[error("Transfer cancelled but abort was not acknowledged")]
    CancelUnconfirmed(#[source] ChannelFault),
}

/// Errors that can occur during firmware update operations
#[derive(Debug, Error)]
pub enum FirmwareUpdateError {
    /// Capsule validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Version handling failed
    #[error(transparent)]
    Version(#[from] VersionError),

    /// Transfer to the board failed
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Another update session owns the channel
    #[error("Update already in progress (session {session_id})")]
    UpdateAlreadyInProgress {
        /// Session currently holding the channel
        session_id: Uuid,
    },

    /// Orchestrator is not ready to start an update
    #[error("Not ready for update: {0}")]
    NotReady(String),

    /// Required human confirmation was not given
    #[error("Update not confirmed: {0}")]
    ConsentWithheld(&'static str),

    /// Session phase would move backwards or skip a step
    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition {
        /// Current phase
        from: UpdatePhase,
        /// Requested phase
        to: UpdatePhase,
    },

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Reading configuration failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Background worker stopped without producing a report
    #[error("Update worker failed: {0}")]
    Worker(String),
}

impl From<serde_json::Error> for FirmwareUpdateError {
    fn from(e: serde_json::Error) -> Self {
        FirmwareUpdateError::Serialization(e.to_string())
    }
}

impl FirmwareUpdateError {
    /// Whether the user can fix this without touching hardware.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            FirmwareUpdateError::Validation(_)
                | FirmwareUpdateError::NotReady(_)
                | FirmwareUpdateError::ConsentWithheld(_)
                | FirmwareUpdateError::Config(_)
        )
    }

    /// Whether this is the user backing out rather than a fault.
    pub fn is_user_abort(&self) -> bool {
        matches!(
            self,
            FirmwareUpdateError::ConsentWithheld(_)
                | FirmwareUpdateError::Transfer(TransferError::Cancelled)
        )
    }

    /// Whether the failure is an anticipated "update did not complete"
    /// outcome, as opposed to an unexpected fault whose cause should be
    /// shown to the user.
    pub fn is_handled(&self) -> bool {
        match self {
            FirmwareUpdateError::Validation(_)
            | FirmwareUpdateError::Version(_)
            | FirmwareUpdateError::UpdateAlreadyInProgress { .. }
            | FirmwareUpdateError::NotReady(_)
            | FirmwareUpdateError::ConsentWithheld(_) => true,
            FirmwareUpdateError::Transfer(err) => match err {
                TransferError::Cancelled => true,
                TransferError::CancelUnconfirmed(_) => false,
                TransferError::WriteFailed { source, .. } => source.is_board_reported(),
                TransferError::VerificationFailed(VerifyFault::DigestMismatch { .. }) => true,
                TransferError::VerificationFailed(VerifyFault::Readback(source)) => {
                    source.is_board_reported()
                }
            },
            FirmwareUpdateError::InvalidPhaseTransition { .. }
            | FirmwareUpdateError::Config(_)
            | FirmwareUpdateError::Io(_)
            | FirmwareUpdateError::Serialization(_)
            | FirmwareUpdateError::Worker(_) => false,
        }
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            FirmwareUpdateError::ConsentWithheld(_)
            | FirmwareUpdateError::Transfer(TransferError::Cancelled) => ErrorSeverity::Info,
            FirmwareUpdateError::UpdateAlreadyInProgress { .. }
            | FirmwareUpdateError::NotReady(_)
            | FirmwareUpdateError::Version(_) => ErrorSeverity::Warning,
            FirmwareUpdateError::Transfer(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Render an error and every source beneath it, outermost first, joined
/// with `": "`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_failed(source: ChannelFault) -> FirmwareUpdateError {
        TransferError::WriteFailed {
            stage: TransferStage::Block(3),
            source,
        }
        .into()
    }

    #[test]
    fn test_io_permission_maps_to_permission_denied() {
        let err = ValidationError::from_io(
            "fw.gcap".to_string(),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, ValidationError::PermissionDenied { .. }));
        assert_eq!(err.location(), "fw.gcap");
    }

    #[test]
    fn test_io_missing_maps_to_not_found() {
        let err = ValidationError::from_io(
            "fw.gcap".to_string(),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(err, ValidationError::NotFound { .. }));
    }

    #[test]
    fn test_nack_write_failure_is_handled() {
        assert!(write_failed(ChannelFault::Nack(NackCode::FlashWrite)).is_handled());
        assert!(write_failed(ChannelFault::Timeout { timeout_ms: 10 }).is_handled());
    }

    #[test]
    fn test_io_write_failure_is_unexpected() {
        let err = write_failed(ChannelFault::Io(std::io::Error::from(
            std::io::ErrorKind::BrokenPipe,
        )));
        assert!(!err.is_handled());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_error_chain_preserves_causes() {
        let err = write_failed(ChannelFault::Nack(NackCode::FlashWrite));
        assert_eq!(
            error_chain(&err),
            "Write failed at block 3: board rejected request: flash write failed"
        );
    }

    #[test]
    fn test_user_abort_classification() {
        assert!(FirmwareUpdateError::ConsentWithheld("external power").is_user_abort());
        assert!(FirmwareUpdateError::from(TransferError::Cancelled).is_user_abort());
        assert!(!FirmwareUpdateError::NotReady("x".into()).is_user_abort());
    }

    #[test]
    fn test_unconfirmed_cancel_is_unexpected() {
        let err = FirmwareUpdateError::from(TransferError::CancelUnconfirmed(
            ChannelFault::Timeout { timeout_ms: 2000 },
        ));
        assert!(!err.is_handled());
        assert!(!err.is_user_abort());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(
            error_chain(&err),
            "Transfer cancelled but abort was not acknowledged: no response within 2000ms"
        );
    }
}
