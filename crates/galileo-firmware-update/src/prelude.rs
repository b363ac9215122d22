//! Convenience re-exports for common firmware update types

pub use crate::capsule::{CapsuleBuilder, CapsuleValidator, FirmwareCapsule, ValidatedCapsule};
pub use crate::config::{OrchestratorConfig, TransferConfig};
pub use crate::error::{FirmwareUpdateError, TransferError, ValidationError, VersionError};
pub use crate::events::{ProgressNotification, UpdateEvent, UpdateOutcome, UpdateReport};
pub use crate::orchestrator::{Consent, PreparedUpdate, UpdateHandle, UpdateOrchestrator};
pub use crate::session::{SessionSnapshot, UpdatePhase};
pub use crate::version::{FirmwareVersion, VersionChangePrompt, VersionFraming};
