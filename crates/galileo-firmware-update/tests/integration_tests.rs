//! Integration tests for the firmware update lifecycle against a simulated board

mod common;

use anyhow::Result;
use common::*;
use galileo_firmware_update::prelude::*;
use galileo_firmware_update::{ChannelFault, MalformedCapsule, TransferStage, VerifyFault};
use galileo_transfer_protocol::{BoardFaults, NackCode, RequestKind, SimulatedBoard};

fn cause(report: &UpdateReport) -> Option<&FirmwareUpdateError> {
    report.outcome.cause()
}

#[tokio::test]
async fn test_successful_update_reports_full_progress() -> Result<()> {
    let (channel, board) = healthy_board();
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(64));
    let image = payload(1000);

    let mut handle = orchestrator.update(
        capsule("1.0.4", &image)?,
        "1.0.2".parse()?,
        Consent::granted(),
    )?;
    let events = collect_events(&mut handle).await;
    let report = handle.wait().await?;

    assert!(report.outcome.succeeded());
    assert_eq!(report.final_phase, UpdatePhase::Complete);
    assert_eq!(report.capsule_version.to_string(), "1.0.4");

    let progress = progress_of(&events);
    assert_eq!(progress.first(), Some(&0));
    assert_eq!(progress.last(), Some(&100));
    assert!(
        progress.iter().zip(progress.iter().skip(1)).all(|(a, b)| a < b),
        "progress not increasing: {progress:?}"
    );
    assert_eq!(progress.iter().filter(|p| **p == 100).count(), 1);

    let mut tail = events.iter().rev();
    assert!(matches!(tail.next(), Some(UpdateEvent::Finished(_))));
    assert!(matches!(tail.next(), Some(UpdateEvent::Progress(100))));

    let messages = messages_of(&events);
    assert!(messages.contains(&"Erasing".to_string()));
    assert!(messages.contains(&"Writing block 1 of 16".to_string()));
    assert!(messages.contains(&"Writing block 16 of 16".to_string()));
    assert!(messages.contains(&"Verifying".to_string()));

    let phases: Vec<UpdatePhase> = events
        .iter()
        .filter_map(|e| match e {
            UpdateEvent::Phase(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            UpdatePhase::Validating,
            UpdatePhase::Confirming,
            UpdatePhase::Transferring,
            UpdatePhase::Verifying
        ]
    );

    assert!(orchestrator.is_ready_for_update());
    drop(orchestrator.into_channel());
    let board = board.finish().await?;
    assert_eq!(board.committed_image(), Some(image.as_slice()));
    assert_eq!(board.history().first(), Some(&RequestKind::Sync));
    assert_eq!(board.history().get(1), Some(&RequestKind::Erase));
    assert_eq!(board.history().last(), Some(&RequestKind::Verify));
    Ok(())
}

#[tokio::test]
async fn test_events_end_after_finished() -> Result<()> {
    let (channel, _board) = healthy_board();
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(256));

    let mut handle = orchestrator.update(
        capsule("2.0.0", &payload(600))?,
        "1.0.0".parse()?,
        Consent::granted(),
    )?;
    let events = collect_events(&mut handle).await;
    assert!(matches!(events.last(), Some(UpdateEvent::Finished(_))));
    assert!(handle.events().recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_missing_capsule_never_touches_board() -> Result<()> {
    let (channel, board) = healthy_board();
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(64));
    let dir = tempfile::tempdir()?;
    let capsule = FirmwareCapsule::from_path(dir.path().join("nope.gcap"), "1.0.0".parse()?);

    let result = orchestrator.prepare(capsule, "0.9.0".parse()?);
    assert!(matches!(
        result,
        Err(FirmwareUpdateError::Validation(ValidationError::NotFound { .. }))
    ));

    drop(orchestrator.into_channel());
    assert!(board.finish().await?.history().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_corrupted_capsule_file_rejected() -> Result<()> {
    let (channel, board) = healthy_board();
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(64));
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fw.gcap");
    let mut bytes = CapsuleBuilder::new("1.1.0".parse()?).build(&payload(300))?;
    if let Some(b) = bytes.get_mut(100) {
        *b ^= 0x80;
    }
    std::fs::write(&path, bytes)?;

    let capsule = FirmwareCapsule::open(&path)?;
    let result = orchestrator.prepare(capsule, "1.0.0".parse()?);
    match result {
        Err(FirmwareUpdateError::Validation(ValidationError::Malformed { reason, .. })) => {
            assert!(matches!(reason, MalformedCapsule::DigestMismatch { .. }));
        }
        other => anyhow::bail!("expected digest mismatch, got {other:?}"),
    }

    drop(orchestrator.into_channel());
    assert!(board.finish().await?.history().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_nack_stops_transfer_without_full_progress() -> Result<()> {
    let (channel, board) = faulty_board(BoardFaults {
        nack_on_block: Some(2),
        ..BoardFaults::default()
    });
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(100));

    let mut handle = orchestrator.update(
        capsule("1.0.4", &payload(1000))?,
        "1.0.2".parse()?,
        Consent::granted(),
    )?;
    let events = collect_events(&mut handle).await;
    let report = handle.wait().await?;

    assert!(matches!(report.outcome, UpdateOutcome::NotUpdated(_)));
    assert_eq!(report.final_phase, UpdatePhase::Failed);
    assert!(matches!(
        cause(&report),
        Some(FirmwareUpdateError::Transfer(TransferError::WriteFailed {
            stage: TransferStage::Block(2),
            source: ChannelFault::Nack(NackCode::FlashWrite),
        }))
    ));
    assert!(progress_of(&events).iter().all(|p| *p < 100));

    drop(orchestrator.into_channel());
    let board = board.finish().await?;
    assert!(!board.history().contains(&RequestKind::Verify));
    assert!(board.committed_image().is_none());
    Ok(())
}

#[tokio::test]
async fn test_readback_mismatch_is_verification_failure() -> Result<()> {
    let (channel, _board) = faulty_board(BoardFaults {
        corrupt_readback: true,
        ..BoardFaults::default()
    });
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(128));

    let handle = orchestrator.update(
        capsule("1.0.4", &payload(512))?,
        "1.0.4".parse()?,
        Consent::granted(),
    )?;
    let report = handle.wait().await?;

    assert!(matches!(
        cause(&report),
        Some(FirmwareUpdateError::Transfer(TransferError::VerificationFailed(
            VerifyFault::DigestMismatch { .. }
        )))
    ));
    assert_eq!(report.into_result().ok(), Some(false));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stalled_board_times_out() -> Result<()> {
    let (channel, _board) = spawn_board(
        SimulatedBoard::new(),
        LinkScript {
            stall_at_block: Some(1),
            ..LinkScript::default()
        },
    );
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(64));

    let handle = orchestrator.update(
        capsule("1.0.4", &payload(256))?,
        "1.0.2".parse()?,
        Consent::granted(),
    )?;
    let report = handle.wait().await?;

    assert!(matches!(
        cause(&report),
        Some(FirmwareUpdateError::Transfer(TransferError::WriteFailed {
            stage: TransferStage::Block(1),
            source: ChannelFault::Timeout { timeout_ms: 500 },
        }))
    ));
    assert!(orchestrator.is_ready_for_update());
    Ok(())
}

#[tokio::test]
async fn test_closed_channel_is_unexpected_error() -> Result<()> {
    let (channel, _board) = spawn_board(
        SimulatedBoard::new(),
        LinkScript {
            close_at_block: Some(0),
            ..LinkScript::default()
        },
    );
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(64));

    let handle = orchestrator.update(
        capsule("1.0.4", &payload(256))?,
        "1.0.2".parse()?,
        Consent::granted(),
    )?;
    let report = handle.wait().await?;

    assert!(matches!(report.outcome, UpdateOutcome::Error(_)));
    let err = report.into_result().err();
    assert!(matches!(
        err.as_deref(),
        Some(FirmwareUpdateError::Transfer(TransferError::WriteFailed {
            source: ChannelFault::Closed,
            ..
        }))
    ));
    Ok(())
}

#[tokio::test]
async fn test_second_update_rejected_while_first_runs() -> Result<()> {
    let (channel, mut board) = spawn_board(
        SimulatedBoard::new(),
        LinkScript {
            hold_at_block: Some(0),
            ..LinkScript::default()
        },
    );
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(64));
    let first = orchestrator.prepare(capsule("1.0.4", &payload(256))?, "1.0.2".parse()?)?;
    let second = orchestrator.prepare(capsule("1.0.5", &payload(256))?, "1.0.2".parse()?)?;

    let handle = orchestrator.start(first, Consent::granted())?;
    let hold = board.hold.take().ok_or_else(|| anyhow::anyhow!("no hold"))?;
    hold.reached.await?;

    assert!(!orchestrator.is_ready_for_update());
    let active = orchestrator
        .active_session()
        .ok_or_else(|| anyhow::anyhow!("no active session"))?;
    assert_eq!(active.id, handle.session_id());
    assert_eq!(active.phase, UpdatePhase::Transferring);

    match orchestrator.start(second, Consent::granted()) {
        Err(FirmwareUpdateError::UpdateAlreadyInProgress { session_id }) => {
            assert_eq!(session_id, handle.session_id());
        }
        other => anyhow::bail!("expected UpdateAlreadyInProgress, got {other:?}"),
    }
    assert!(matches!(
        orchestrator.update(
            capsule("1.0.6", &payload(64))?,
            "1.0.2".parse()?,
            Consent::granted()
        ),
        Err(FirmwareUpdateError::UpdateAlreadyInProgress { .. })
    ));

    anyhow::ensure!(hold.release.send(()).is_ok(), "board task exited");
    let report = handle.wait().await?;
    assert!(report.outcome.succeeded());
    assert!(orchestrator.active_session().is_none());

    let again = orchestrator.update(
        capsule("1.0.6", &payload(64))?,
        "1.0.4".parse()?,
        Consent::granted(),
    )?;
    assert!(again.wait().await?.outcome.succeeded());
    Ok(())
}

#[tokio::test]
async fn test_cancel_mid_transfer_aborts_and_allows_retry() -> Result<()> {
    let (channel, mut board) = spawn_board(
        SimulatedBoard::new(),
        LinkScript {
            hold_at_block: Some(2),
            ..LinkScript::default()
        },
    );
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(64));
    let image = payload(512);

    let handle = orchestrator.update(capsule("1.0.4", &image)?, "1.0.2".parse()?, Consent::granted())?;
    let hold = board.hold.take().ok_or_else(|| anyhow::anyhow!("no hold"))?;
    hold.reached.await?;
    handle.request_cancel();
    anyhow::ensure!(hold.release.send(()).is_ok(), "board task exited");

    let report = handle.wait().await?;
    assert!(matches!(
        cause(&report),
        Some(FirmwareUpdateError::Transfer(TransferError::Cancelled))
    ));
    assert!(matches!(report.outcome, UpdateOutcome::NotUpdated(_)));

    let retry = orchestrator.update(capsule("1.0.4", &image)?, "1.0.2".parse()?, Consent::granted())?;
    assert!(retry.wait().await?.outcome.succeeded());

    drop(orchestrator.into_channel());
    let board = board.finish().await?;
    let history = board.history();
    let abort_at = history
        .iter()
        .position(|k| *k == RequestKind::Abort)
        .ok_or_else(|| anyhow::anyhow!("abort never sent"))?;
    assert!(history.iter().take(abort_at).all(|k| *k != RequestKind::Verify));
    assert_eq!(history.get(abort_at + 1), Some(&RequestKind::Sync));
    assert_eq!(history.get(abort_at + 2), Some(&RequestKind::Erase));
    assert_eq!(board.committed_image(), Some(image.as_slice()));
    Ok(())
}

#[tokio::test]
async fn test_consent_withheld_never_touches_board() -> Result<()> {
    let (channel, board) = healthy_board();
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(64));

    let result = orchestrator.update(
        capsule("1.0.4", &payload(128))?,
        "1.0.2".parse()?,
        Consent {
            external_power_confirmed: true,
            version_change_accepted: false,
        },
    );
    match result {
        Err(err @ FirmwareUpdateError::ConsentWithheld(_)) => {
            assert!(err.is_user_abort());
            assert!(err.is_handled());
        }
        other => anyhow::bail!("expected ConsentWithheld, got {other:?}"),
    }

    drop(orchestrator.into_channel());
    assert!(board.finish().await?.history().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_legacy_board_overwritten_with_semantic_capsule() -> Result<()> {
    let (channel, _board) = healthy_board();
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(64));

    let prepared = orchestrator.prepare(capsule("1.0.4", &payload(128))?, "732".parse()?)?;
    assert_eq!(prepared.prompt().framing(), VersionFraming::OverwriteWith);
    assert_eq!(
        prepared.prompt().description(),
        "Target firmware is version 'build 732' now.\n\nDo you wish to overwrite with version '1.0.4' firmware?"
    );

    let report = orchestrator.start(prepared, Consent::granted())?.wait().await?;
    assert!(report.outcome.succeeded());
    Ok(())
}

#[derive(Default)]
struct RecordingObserver {
    messages: Vec<String>,
    progress: Vec<u8>,
}

impl ProgressNotification for RecordingObserver {
    fn update_message(&mut self, message: &str) {
        self.messages.push(message.to_string());
    }

    fn update_progress(&mut self, percent: u8) {
        self.progress.push(percent);
    }
}

#[tokio::test]
async fn test_forward_to_observer() -> Result<()> {
    let (channel, _board) = healthy_board();
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(200));
    let mut observer = RecordingObserver::default();

    let handle = orchestrator.update(
        capsule("1.1.0", &payload(1000))?,
        "1.0.0".parse()?,
        Consent::granted(),
    )?;
    let report = handle.forward_to(&mut observer).await?;

    assert!(report.outcome.succeeded());
    assert_eq!(observer.progress.last(), Some(&100));
    assert_eq!(observer.messages.first().map(String::as_str), Some("Validating firmware capsule"));
    assert!(
        observer
            .messages
            .last()
            .is_some_and(|m| m.starts_with("Updated to 1.1.0"))
    );
    Ok(())
}

struct NullObserver;

impl ProgressNotification for NullObserver {
    fn update_message(&mut self, _message: &str) {}

    fn update_progress(&mut self, _percent: u8) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forward_to_returns_channel_before_resolving() -> Result<()> {
    let (channel, _board) = healthy_board();
    let orchestrator = UpdateOrchestrator::new(channel, fast_config(64));
    let image = payload(128);

    for round in 0..100u32 {
        let handle = orchestrator
            .update(capsule("1.0.4", &image)?, "1.0.2".parse()?, Consent::granted())
            .map_err(|e| anyhow::anyhow!("round {round}: {e}"))?;
        let report = handle.forward_to(&mut NullObserver).await?;
        assert!(report.outcome.succeeded(), "round {round}: {}", report.summary());
        assert!(orchestrator.is_ready_for_update(), "round {round}");
        assert!(orchestrator.active_session().is_none());
    }
    Ok(())
}
