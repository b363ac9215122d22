//! Update orchestrator
//!
//! [`UpdateOrchestrator`] owns the board channel and runs at most one update
//! session at a time. A session is started in two steps so the caller can
//! show a confirmation prompt in between:
//!
//! ```ignore
//! let prepared = orchestrator.prepare(capsule, board_version)?;
//! println!("{}", prepared.prompt().description());
//! let handle = orchestrator.start(prepared, Consent::granted())?;
//! let report = handle.wait().await?;
//! ```
//!
//! The session runs on a background task. Its events arrive on the
//! [`UpdateHandle`], ending with exactly one [`UpdateEvent::Finished`]. The
//! channel returns to the orchestrator after that event has been sent, so
//! callers starting another session should go through
//! [`UpdateHandle::wait`] or [`UpdateHandle::forward_to`].

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capsule::{CapsuleValidator, FirmwareCapsule, ValidatedCapsule};
use crate::config::OrchestratorConfig;
use crate::error::{FirmwareUpdateError, TransferError};
use crate::events::{ProgressNotification, ProgressReporter, UpdateEvent, UpdateOutcome, UpdateReport};
use crate::session::{SessionSnapshot, UpdatePhase, UpdateSession};
use crate::transfer::{CancelSignal, CancelTrigger, TransferEngine, cancel_channel};
use crate::version::{FirmwareVersion, VersionChangePrompt};

/// Confirmations the user must give before flashing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Consent {
    /// Board is on external power, not USB alone
    pub external_power_confirmed: bool,
    /// User accepted the version change shown in the prompt
    pub version_change_accepted: bool,
}

impl Consent {
    /// Both confirmations given.
    pub fn granted() -> Self {
        Self {
            external_power_confirmed: true,
            version_change_accepted: true,
        }
    }

    /// First missing confirmation, if any.
    pub fn missing(&self) -> Option<&'static str> {
        if !self.external_power_confirmed {
            Some("external power not confirmed")
        } else if !self.version_change_accepted {
            Some("version change not accepted")
        } else {
            None
        }
    }

    /// Whether every confirmation was given.
    pub fn is_granted(&self) -> bool {
        self.missing().is_none()
    }
}

/// A capsule that validated and is waiting for the user's answer
#[derive(Debug, Clone)]
pub struct PreparedUpdate {
    capsule: FirmwareCapsule,
    validated: ValidatedCapsule,
    board_version: FirmwareVersion,
    prompt: VersionChangePrompt,
}

impl PreparedUpdate {
    /// Prompt describing the version change.
    pub fn prompt(&self) -> &VersionChangePrompt {
        &self.prompt
    }

    /// Capsule that will be flashed.
    pub fn capsule(&self) -> &FirmwareCapsule {
        &self.capsule
    }

    /// Result of the pre-confirmation validation.
    pub fn validated(&self) -> &ValidatedCapsule {
        &self.validated
    }

    /// Firmware currently on the board.
    pub fn board_version(&self) -> &FirmwareVersion {
        &self.board_version
    }

    /// The user said no. Nothing is sent to the board.
    pub fn decline(self) {
        warn!(
            "Update cancelled by user: keeping firmware {}",
            self.board_version.to_presentation_string()
        );
    }
}

struct SessionSlot<C> {
    channel: Option<C>,
    active: Option<Arc<Mutex<UpdateSession>>>,
}

/// Exclusive claim on the channel for one session
///
/// Dropping the lease puts the channel back and clears the active session.
struct SessionLease<C> {
    slot: Arc<Mutex<SessionSlot<C>>>,
    channel: Option<C>,
}

impl<C> SessionLease<C> {
    fn acquire(
        slot: &Arc<Mutex<SessionSlot<C>>>,
        session: &Arc<Mutex<UpdateSession>>,
    ) -> Result<Self, FirmwareUpdateError> {
        let mut guard = slot.lock();
        if let Some(active) = &guard.active {
            return Err(FirmwareUpdateError::UpdateAlreadyInProgress {
                session_id: active.lock().id(),
            });
        }
        let channel = guard
            .channel
            .take()
            .ok_or_else(|| FirmwareUpdateError::NotReady("board channel unavailable".into()))?;
        guard.active = Some(Arc::clone(session));
        Ok(Self {
            slot: Arc::clone(slot),
            channel: Some(channel),
        })
    }

    fn channel_mut(&mut self) -> Option<&mut C> {
        self.channel.as_mut()
    }
}

impl<C> Drop for SessionLease<C> {
    fn drop(&mut self) {
        let mut guard = self.slot.lock();
        if let Some(channel) = self.channel.take() {
            guard.channel = Some(channel);
        }
        guard.active = None;
    }
}

/// Runs firmware updates against one board
pub struct UpdateOrchestrator<C> {
    slot: Arc<Mutex<SessionSlot<C>>>,
    config: OrchestratorConfig,
    validator: CapsuleValidator,
}

impl<C> UpdateOrchestrator<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Orchestrator that flashes through `channel`.
    pub fn new(channel: C, config: OrchestratorConfig) -> Self {
        let validator = CapsuleValidator::new(config.max_capsule_payload);
        Self {
            slot: Arc::new(Mutex::new(SessionSlot {
                channel: Some(channel),
                active: None,
            })),
            config,
            validator,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn check_ready(&self) -> Result<(), FirmwareUpdateError> {
        self.config.validate()?;
        let slot = self.slot.lock();
        if let Some(active) = &slot.active {
            return Err(FirmwareUpdateError::UpdateAlreadyInProgress {
                session_id: active.lock().id(),
            });
        }
        if slot.channel.is_none() {
            return Err(FirmwareUpdateError::NotReady(
                "board channel unavailable".into(),
            ));
        }
        Ok(())
    }

    /// Whether an update could start now.
    pub fn is_ready_for_update(&self) -> bool {
        self.check_ready().is_ok()
    }

    /// Snapshot of the running session, if any.
    pub fn active_session(&self) -> Option<SessionSnapshot> {
        let slot = self.slot.lock();
        slot.active.as_ref().map(|session| session.lock().snapshot())
    }

    /// Validate `capsule` and frame the version change for confirmation.
    pub fn prepare(
        &self,
        capsule: FirmwareCapsule,
        board_version: FirmwareVersion,
    ) -> Result<PreparedUpdate, FirmwareUpdateError> {
        self.check_ready()?;
        let validated = self.validator.validate(&capsule).inspect_err(|e| {
            warn!("Capsule rejected: {}", e);
        })?;
        let prompt = VersionChangePrompt::new(&board_version, validated.version());
        info!(
            board = %board_version,
            capsule = %validated.version(),
            framing = ?prompt.framing(),
            "Firmware update prepared"
        );
        Ok(PreparedUpdate {
            capsule,
            validated,
            board_version,
            prompt,
        })
    }

    /// Start a session for `prepared` if `consent` is complete.
    ///
    /// Fails immediately, without touching the board, when consent is
    /// missing or another session is running.
    pub fn start(
        &self,
        prepared: PreparedUpdate,
        consent: Consent,
    ) -> Result<UpdateHandle, FirmwareUpdateError> {
        if let Some(missing) = consent.missing() {
            warn!("Update cancelled by user: {}", missing);
            return Err(FirmwareUpdateError::ConsentWithheld(missing));
        }

        let session = Arc::new(Mutex::new(UpdateSession::new(
            prepared.board_version.clone(),
            prepared.validated.version().clone(),
        )));
        let session_id = session.lock().id();
        let lease = SessionLease::acquire(&self.slot, &session)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_trigger, cancel) = cancel_channel();

        let worker = SessionWorker {
            session_id,
            lease,
            config: self.config.clone(),
            validator: self.validator.clone(),
            engine: TransferEngine::new(self.config.transfer.clone()),
            reporter: ProgressReporter::new(events_tx, Arc::clone(&session)),
            prepared,
            consent,
            cancel,
        };

        info!("Starting firmware update session {}", session_id);
        let task = tokio::spawn(worker.run());

        Ok(UpdateHandle {
            session_id,
            events: events_rx,
            cancel: cancel_trigger,
            task,
        })
    }

    /// Prepare and start in one call.
    pub fn update(
        &self,
        capsule: FirmwareCapsule,
        board_version: FirmwareVersion,
        consent: Consent,
    ) -> Result<UpdateHandle, FirmwareUpdateError> {
        let prepared = self.prepare(capsule, board_version)?;
        self.start(prepared, consent)
    }

    /// Take the channel back. Returns `None` while a session holds it.
    pub fn into_channel(self) -> Option<C> {
        let mut slot = self.slot.lock();
        if slot.active.is_some() {
            return None;
        }
        slot.channel.take()
    }
}

/// Handle to a running update session
pub struct UpdateHandle {
    session_id: Uuid,
    events: mpsc::UnboundedReceiver<UpdateEvent>,
    cancel: CancelTrigger,
    task: JoinHandle<UpdateReport>,
}

impl std::fmt::Debug for UpdateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl UpdateHandle {
    /// Session identifier.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Next event, or `None` once the session has finished and every event
    /// has been received.
    ///
    /// Receiving `Finished` does not mean the channel is back with the
    /// orchestrator yet; [`UpdateHandle::wait`] does.
    pub async fn next_event(&mut self) -> Option<UpdateEvent> {
        self.events.recv().await
    }

    /// Ordered event receiver, for callers that select over it directly.
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<UpdateEvent> {
        &mut self.events
    }

    /// Ask the session to stop. Takes effect at the next request boundary.
    pub fn request_cancel(&self) {
        info!("Cancel requested for session {}", self.session_id);
        self.cancel.cancel();
    }

    /// Request cancellation and wait for the session to end.
    pub async fn cancel(self) -> Result<UpdateReport, FirmwareUpdateError> {
        self.request_cancel();
        self.wait().await
    }

    /// Wait for the session to end. Once this returns the channel has been
    /// returned and a new session can start.
    pub async fn wait(self) -> Result<UpdateReport, FirmwareUpdateError> {
        self.task.await.map_err(|e| {
            error!("Update worker for session {} failed: {}", self.session_id, e);
            FirmwareUpdateError::Worker(e.to_string())
        })
    }

    /// Feed messages and progress to `observer` until the session ends, then
    /// wait for the channel to be released.
    pub async fn forward_to(
        mut self,
        observer: &mut dyn ProgressNotification,
    ) -> Result<UpdateReport, FirmwareUpdateError> {
        loop {
            let event = self.events.recv().await;
            match event {
                Some(UpdateEvent::Message(message)) => observer.update_message(&message),
                Some(UpdateEvent::Progress(percent)) => observer.update_progress(percent),
                Some(UpdateEvent::Phase(_)) => {}
                Some(UpdateEvent::Finished(report)) => {
                    observer.update_message(&report.summary());
                    break;
                }
                None => break,
            }
        }
        // The worker releases the channel after publishing `Finished`.
        self.wait().await
    }
}

struct SessionWorker<C> {
    session_id: Uuid,
    lease: SessionLease<C>,
    config: OrchestratorConfig,
    validator: CapsuleValidator,
    engine: TransferEngine,
    reporter: ProgressReporter,
    prepared: PreparedUpdate,
    consent: Consent,
    cancel: CancelSignal,
}

impl<C> SessionWorker<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) -> UpdateReport {
        let started = Instant::now();
        let result = self.execute().await;

        let (outcome, final_phase) = match result {
            Ok(()) => match self.reporter.advance(UpdatePhase::Complete) {
                Ok(()) => (UpdateOutcome::Updated, UpdatePhase::Complete),
                Err(e) => self.fail(e),
            },
            Err(e) => self.fail(e),
        };

        let report = UpdateReport {
            session_id: self.session_id,
            outcome,
            board_version: self.prepared.board_version.clone(),
            capsule_version: self.prepared.validated.version().clone(),
            final_phase,
            duration: started.elapsed(),
        };

        match &report.outcome {
            UpdateOutcome::Updated => info!(
                "Firmware update session {} completed in {:?}",
                self.session_id, report.duration
            ),
            UpdateOutcome::NotUpdated(_) => warn!("Session {}: {}", self.session_id, report.summary()),
            UpdateOutcome::Error(_) => error!("Session {}: {}", self.session_id, report.summary()),
        }

        self.reporter.finish(report.clone());
        drop(self.lease);
        report
    }

    fn fail(&self, err: FirmwareUpdateError) -> (UpdateOutcome, UpdatePhase) {
        if let Err(e) = self.reporter.advance(UpdatePhase::Failed) {
            warn!("Session {} could not enter failed phase: {}", self.session_id, e);
        }
        (UpdateOutcome::from_error(err), UpdatePhase::Failed)
    }

    async fn execute(&mut self) -> Result<(), FirmwareUpdateError> {
        self.reporter.started();
        self.reporter.message("Validating firmware capsule");
        self.config.validate()?;
        let capsule = self.validator.validate_async(&self.prepared.capsule).await?;
        if capsule.digest() != self.prepared.validated.digest() {
            warn!(
                "Capsule {} changed since confirmation, using current contents",
                capsule.location()
            );
        }

        self.reporter.advance(UpdatePhase::Confirming)?;
        if let Some(missing) = self.consent.missing() {
            return Err(FirmwareUpdateError::ConsentWithheld(missing));
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled.into());
        }

        self.reporter.advance(UpdatePhase::Transferring)?;
        let channel = self
            .lease
            .channel_mut()
            .ok_or_else(|| FirmwareUpdateError::NotReady("board channel unavailable".into()))?;
        self.engine
            .transfer(&capsule, channel, &mut self.reporter, &self.cancel)
            .await?;
        Ok(())
    }
}
