//! Firmware update orchestration for Intel Galileo boards
//!
//! This crate flashes a firmware capsule onto a board over a serial link:
//! - Capsule validation before anything reaches the board
//! - Version comparison across semantic and legacy build-number schemes
//! - Chunked transfer with per-request acknowledgement and timeouts
//! - Read-back verification against the capsule digest
//! - At most one update session at a time, with cooperative cancellation
//!
//! # Architecture
//!
//! - [`version`]: Firmware version parsing, comparison and prompts
//! - [`capsule`]: `.gcap` capsule format and validation
//! - [`transfer`]: Request/acknowledge transfer engine
//! - [`orchestrator`]: Session lifecycle and single-update exclusion
//! - [`session`]: Session phases and snapshots
//! - [`events`]: Progress events and final reports
//! - [`config`]: Orchestrator and transfer configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```ignore
//! use galileo_firmware_update::prelude::*;
//!
//! # async fn example(port: tokio::io::DuplexStream) -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = UpdateOrchestrator::new(port, OrchestratorConfig::default());
//!
//! let capsule = FirmwareCapsule::open("firmware-1.0.4.gcap")?;
//! let prepared = orchestrator.prepare(capsule, "1.0.2".parse()?)?;
//! println!("{}", prepared.prompt().description());
//!
//! let handle = orchestrator.start(prepared, Consent::granted())?;
//! let report = handle.wait().await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod capsule;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod prelude;
pub mod session;
pub mod transfer;
pub mod version;

pub use capsule::{
    CapsuleBuilder, CapsuleHeader, CapsuleSource, CapsuleValidator, FirmwareCapsule,
    ValidatedCapsule,
};
pub use config::{OrchestratorConfig, TransferConfig};
pub use error::{
    ChannelFault, ErrorSeverity, FirmwareUpdateError, MalformedCapsule, TransferError,
    TransferStage, ValidationError, VerifyFault, VersionError, error_chain,
};
pub use events::{ProgressNotification, UpdateEvent, UpdateOutcome, UpdateReport};
pub use orchestrator::{Consent, PreparedUpdate, UpdateHandle, UpdateOrchestrator};
pub use session::{SessionSnapshot, UpdatePhase, UpdateSession};
pub use transfer::{
    CancelSignal, CancelTrigger, TransferEngine, TransferListener, TransferStatus, cancel_channel,
};
pub use version::{FirmwareVersion, VersionChangePrompt, VersionFraming, VersionOrdering};
