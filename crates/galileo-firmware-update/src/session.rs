//! Update session state
//!
//! A session moves strictly forward through
//! `Validating -> Confirming -> Transferring -> Verifying -> Complete`
//! and can drop to `Failed` from any non-terminal phase.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FirmwareUpdateError;
use crate::version::FirmwareVersion;

/// Phase of an update session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdatePhase {
    /// Re-checking the capsule and readiness
    Validating,
    /// Checking the user's confirmation
    Confirming,
    /// Erasing and writing the image
    Transferring,
    /// Board is hashing the written image
    Verifying,
    /// Update succeeded
    Complete,
    /// Update did not complete
    Failed,
}

impl UpdatePhase {
    fn successor(self) -> Option<UpdatePhase> {
        match self {
            UpdatePhase::Validating => Some(UpdatePhase::Confirming),
            UpdatePhase::Confirming => Some(UpdatePhase::Transferring),
            UpdatePhase::Transferring => Some(UpdatePhase::Verifying),
            UpdatePhase::Verifying => Some(UpdatePhase::Complete),
            UpdatePhase::Complete | UpdatePhase::Failed => None,
        }
    }

    /// Whether the session has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdatePhase::Complete | UpdatePhase::Failed)
    }

    /// Whether `next` is a legal transition from `self`.
    pub fn can_advance_to(self, next: UpdatePhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == UpdatePhase::Failed || self.successor() == Some(next)
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdatePhase::Validating => "validating",
            UpdatePhase::Confirming => "confirming",
            UpdatePhase::Transferring => "transferring",
            UpdatePhase::Verifying => "verifying",
            UpdatePhase::Complete => "complete",
            UpdatePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One update attempt
#[derive(Debug, Clone)]
pub struct UpdateSession {
    id: Uuid,
    board_version: FirmwareVersion,
    capsule_version: FirmwareVersion,
    phase: UpdatePhase,
    progress: Option<u8>,
    status_message: Option<String>,
    started_at: DateTime<Utc>,
}

impl UpdateSession {
    /// New session in the `Validating` phase.
    pub fn new(board_version: FirmwareVersion, capsule_version: FirmwareVersion) -> Self {
        Self {
            id: Uuid::new_v4(),
            board_version,
            capsule_version,
            phase: UpdatePhase::Validating,
            progress: None,
            status_message: None,
            started_at: Utc::now(),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current phase.
    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// Last reported progress percentage.
    pub fn progress(&self) -> Option<u8> {
        self.progress
    }

    /// Move to `next`, rejecting backwards or skipped transitions.
    pub fn advance(&mut self, next: UpdatePhase) -> Result<(), FirmwareUpdateError> {
        if !self.phase.can_advance_to(next) {
            return Err(FirmwareUpdateError::InvalidPhaseTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Record a progress percentage. Returns `true` if it is higher than
    /// anything recorded so far.
    pub fn record_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if self.progress.is_some_and(|last| percent <= last) {
            return false;
        }
        self.progress = Some(percent);
        true
    }

    /// Record the latest status message.
    pub fn record_message(&mut self, message: &str) {
        self.status_message = Some(message.to_string());
    }

    /// Point-in-time copy for observers.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            board_version: self.board_version.clone(),
            capsule_version: self.capsule_version.clone(),
            phase: self.phase,
            progress: self.progress,
            status_message: self.status_message.clone(),
            started_at: self.started_at,
        }
    }
}

/// Serializable view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session identifier
    pub id: Uuid,
    /// Firmware on the board when the session started
    pub board_version: FirmwareVersion,
    /// Firmware carried by the capsule
    pub capsule_version: FirmwareVersion,
    /// Current phase
    pub phase: UpdatePhase,
    /// Last reported progress percentage
    pub progress: Option<u8>,
    /// Last status message
    pub status_message: Option<String>,
    /// When the session started
    pub started_at: DateTime<Utc>,
}
