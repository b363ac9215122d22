//! Orchestrator and transfer configuration
//!
//! Configuration is plain serde data. Durations are encoded as integer
//! milliseconds so a JSON file reads naturally:
//!
//! ```json
//! { "transfer": { "chunk_size": 1024, "ack_timeout": 2000 } }
//! ```
//!
//! Missing fields take their defaults.

use std::path::Path;
use std::time::Duration;

use galileo_transfer_protocol::MAX_CHUNK_LEN;
use serde::{Deserialize, Serialize};

use crate::error::FirmwareUpdateError;

/// Largest image the Galileo SPI flash region accepts.
pub const DEFAULT_MAX_CAPSULE_PAYLOAD: u64 = 8 * 1024 * 1024;

/// Transfer engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per write block
    pub chunk_size: usize,

    /// Time to wait for an acknowledgement of sync, write and abort requests
    #[serde(with = "duration_ms")]
    pub ack_timeout: Duration,

    /// Time to wait for the board to finish erasing
    #[serde(with = "duration_ms")]
    pub erase_timeout: Duration,

    /// Time to wait for the board to hash the written image
    #[serde(with = "duration_ms")]
    pub verify_timeout: Duration,

    /// Emit a "Writing block" status every this many blocks
    pub status_interval_blocks: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            ack_timeout: Duration::from_secs(2),
            erase_timeout: Duration::from_secs(30),
            verify_timeout: Duration::from_secs(10),
            status_interval_blocks: 64,
        }
    }
}

impl TransferConfig {
    /// Check values are usable.
    pub fn validate(&self) -> Result<(), FirmwareUpdateError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_LEN {
            return Err(FirmwareUpdateError::Config(format!(
                "chunk_size must be between 1 and {MAX_CHUNK_LEN}, got {}",
                self.chunk_size
            )));
        }
        for (name, value) in [
            ("ack_timeout", self.ack_timeout),
            ("erase_timeout", self.erase_timeout),
            ("verify_timeout", self.verify_timeout),
        ] {
            if value.is_zero() {
                return Err(FirmwareUpdateError::Config(format!(
                    "{name} must be non-zero"
                )));
            }
        }
        Ok(())
    }
}

/// Update orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Transfer engine settings
    pub transfer: TransferConfig,

    /// Largest capsule payload accepted, in bytes
    pub max_capsule_payload: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            max_capsule_payload: DEFAULT_MAX_CAPSULE_PAYLOAD,
        }
    }
}

impl OrchestratorConfig {
    /// Check values are usable.
    pub fn validate(&self) -> Result<(), FirmwareUpdateError> {
        self.transfer.validate()?;
        if self.max_capsule_payload == 0 || self.max_capsule_payload > u64::from(u32::MAX) {
            return Err(FirmwareUpdateError::Config(format!(
                "max_capsule_payload must be between 1 and {}, got {}",
                u32::MAX,
                self.max_capsule_payload
            )));
        }
        Ok(())
    }

    /// Parse and validate configuration from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, FirmwareUpdateError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FirmwareUpdateError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
