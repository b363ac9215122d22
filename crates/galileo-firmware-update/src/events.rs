//! Progress events and final reports

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::{FirmwareUpdateError, error_chain};
use crate::session::{UpdatePhase, UpdateSession};
use crate::transfer::{TransferListener, TransferStatus};
use crate::version::FirmwareVersion;

/// Observer for status text and completion percentage
///
/// Implemented by whatever presents progress to the user.
pub trait ProgressNotification {
    /// Replace the current status line.
    fn update_message(&mut self, message: &str);

    /// Report completion in percent (0..=100).
    fn update_progress(&mut self, percent: u8);
}

/// Event emitted by a running update session
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// Session entered a new phase
    Phase(UpdatePhase),
    /// Status message
    Message(String),
    /// Completion percentage; strictly increasing within a session
    Progress(u8),
    /// Session ended; always the last event
    Finished(UpdateReport),
}

/// How an update session ended
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Board runs the new firmware
    Updated,
    /// Update did not happen for an anticipated reason
    NotUpdated(Arc<FirmwareUpdateError>),
    /// Update failed unexpectedly
    Error(Arc<FirmwareUpdateError>),
}

impl UpdateOutcome {
    /// Sort a failure into anticipated or unexpected.
    pub fn from_error(err: FirmwareUpdateError) -> Self {
        if err.is_handled() {
            UpdateOutcome::NotUpdated(Arc::new(err))
        } else {
            UpdateOutcome::Error(Arc::new(err))
        }
    }

    /// Whether the board now runs the capsule firmware.
    pub fn succeeded(&self) -> bool {
        matches!(self, UpdateOutcome::Updated)
    }

    /// Failure cause, if any.
    pub fn cause(&self) -> Option<&FirmwareUpdateError> {
        match self {
            UpdateOutcome::Updated => None,
            UpdateOutcome::NotUpdated(err) | UpdateOutcome::Error(err) => Some(err),
        }
    }
}

/// Final report of an update session
#[derive(Debug, Clone)]
pub struct UpdateReport {
    /// Session identifier
    pub session_id: Uuid,
    /// How the session ended
    pub outcome: UpdateOutcome,
    /// Firmware on the board before the update
    pub board_version: FirmwareVersion,
    /// Firmware carried by the capsule
    pub capsule_version: FirmwareVersion,
    /// Phase the session ended in
    pub final_phase: UpdatePhase,
    /// Wall-clock duration of the session
    pub duration: Duration,
}

impl UpdateReport {
    /// `Ok(true)` when updated, `Ok(false)` when not updated for an
    /// anticipated reason, `Err` with the cause otherwise.
    pub fn into_result(self) -> Result<bool, Arc<FirmwareUpdateError>> {
        match self.outcome {
            UpdateOutcome::Updated => Ok(true),
            UpdateOutcome::NotUpdated(_) => Ok(false),
            UpdateOutcome::Error(err) => Err(err),
        }
    }

    /// One-line summary for logs and status bars.
    pub fn summary(&self) -> String {
        match &self.outcome {
            UpdateOutcome::Updated => format!(
                "Updated to {} in {:.1}s",
                self.capsule_version.to_presentation_string(),
                self.duration.as_secs_f64()
            ),
            UpdateOutcome::NotUpdated(err) => format!("Not updated: {}", error_chain(err.as_ref())),
            UpdateOutcome::Error(err) => format!("Update error: {}", error_chain(err.as_ref())),
        }
    }
}

/// Publishes a session's events and mirrors them into the session record
pub(crate) struct ProgressReporter {
    events: mpsc::UnboundedSender<UpdateEvent>,
    session: Arc<Mutex<UpdateSession>>,
}

impl ProgressReporter {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<UpdateEvent>,
        session: Arc<Mutex<UpdateSession>>,
    ) -> Self {
        Self { events, session }
    }

    fn emit(&self, event: UpdateEvent) {
        if self.events.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }

    pub(crate) fn started(&self) {
        let phase = self.session.lock().phase();
        self.emit(UpdateEvent::Phase(phase));
    }

    pub(crate) fn advance(&self, phase: UpdatePhase) -> Result<(), FirmwareUpdateError> {
        self.session.lock().advance(phase)?;
        if !phase.is_terminal() {
            self.emit(UpdateEvent::Phase(phase));
        }
        Ok(())
    }

    pub(crate) fn message(&self, message: &str) {
        self.session.lock().record_message(message);
        self.emit(UpdateEvent::Message(message.to_string()));
    }

    pub(crate) fn progress(&self, percent: u8) {
        let increased = self.session.lock().record_progress(percent);
        if increased {
            self.emit(UpdateEvent::Progress(percent.min(100)));
        }
    }

    pub(crate) fn finish(&self, report: UpdateReport) {
        self.emit(UpdateEvent::Finished(report));
    }
}

impl TransferListener for ProgressReporter {
    fn on_status(&mut self, status: TransferStatus) {
        if status == TransferStatus::Verifying {
            if let Err(e) = self.advance(UpdatePhase::Verifying) {
                warn!(error = %e, "could not enter verifying phase");
            }
        }
        self.message(&status.to_string());
    }

    fn on_progress(&mut self, percent: u8) {
        self.progress(percent);
    }
}
