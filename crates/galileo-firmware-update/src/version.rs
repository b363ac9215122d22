//! Firmware version parsing and comparison
//!
//! Galileo boards report one of two version schemes:
//!
//! - **Semantic**: `major.minor.patch[-pre][+build]`. A two-component
//!   `major.minor` is accepted and normalised to `major.minor.0`.
//! - **Legacy**: a bare decimal build number such as `732`, used by early
//!   board support packages.
//!
//! Versions within a scheme form a total order. Versions from different
//! schemes cannot be compared.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::VersionError;

/// A parsed firmware version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FirmwareVersion {
    /// Semantic version
    Semantic(semver::Version),
    /// Legacy build number
    Legacy {
        /// Build number
        build: u64,
    },
}

/// Result of comparing two versions of the same scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionOrdering {
    /// Left-hand side is older
    Older,
    /// Same precedence
    Equal,
    /// Left-hand side is newer
    Newer,
}

impl From<Ordering> for VersionOrdering {
    fn from(ordering: Ordering) -> Self {
        match ordering {
            Ordering::Less => VersionOrdering::Older,
            Ordering::Equal => VersionOrdering::Equal,
            Ordering::Greater => VersionOrdering::Newer,
        }
    }
}

impl FirmwareVersion {
    /// Parse a version string in either scheme.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let fail = |reason: &str| VersionError::Parse {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(fail("empty version string"));
        }

        if trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return trimmed
                .parse::<u64>()
                .map(|build| FirmwareVersion::Legacy { build })
                .map_err(|e| fail(&e.to_string()));
        }

        semver::Version::parse(&normalize_semantic(trimmed))
            .map(FirmwareVersion::Semantic)
            .map_err(|e| fail(&e.to_string()))
    }

    /// Build a semantic version from its numeric components.
    pub fn semantic(major: u64, minor: u64, patch: u64) -> Self {
        FirmwareVersion::Semantic(semver::Version::new(major, minor, patch))
    }

    /// Build a legacy version from a build number.
    pub fn legacy(build: u64) -> Self {
        FirmwareVersion::Legacy { build }
    }

    /// Human-readable form used in prompts and status messages.
    pub fn to_presentation_string(&self) -> String {
        match self {
            FirmwareVersion::Semantic(v) => v.to_string(),
            FirmwareVersion::Legacy { build } => format!("build {build}"),
        }
    }

    /// Name of the version scheme.
    pub fn scheme(&self) -> &'static str {
        match self {
            FirmwareVersion::Semantic(_) => "semantic",
            FirmwareVersion::Legacy { .. } => "legacy",
        }
    }

    /// Compare `self` against `other`.
    ///
    /// Semantic versions follow SemVer precedence, so build metadata is
    /// ignored and a pre-release sorts before its release.
    pub fn compare(&self, other: &Self) -> Result<VersionOrdering, VersionError> {
        match (self, other) {
            (FirmwareVersion::Semantic(a), FirmwareVersion::Semantic(b)) => {
                Ok(a.cmp_precedence(b).into())
            }
            (FirmwareVersion::Legacy { build: a }, FirmwareVersion::Legacy { build: b }) => {
                Ok(a.cmp(b).into())
            }
            _ => Err(VersionError::IncomparableVersions {
                left: self.to_string(),
                right: other.to_string(),
            }),
        }
    }
}

/// Compare two versions; see [`FirmwareVersion::compare`].
pub fn compare(a: &FirmwareVersion, b: &FirmwareVersion) -> Result<VersionOrdering, VersionError> {
    a.compare(b)
}

/// Expand `major.minor[-pre][+build]` to `major.minor.0[-pre][+build]`.
fn normalize_semantic(input: &str) -> String {
    let core_end = input.find(['-', '+']).unwrap_or(input.len());
    let (core, suffix) = input.split_at(core_end);
    if core.matches('.').count() == 1 {
        format!("{core}.0{suffix}")
    } else {
        input.to_string()
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareVersion::Semantic(v) => write!(f, "{v}"),
            FirmwareVersion::Legacy { build } => write!(f, "{build}"),
        }
    }
}

impl FromStr for FirmwareVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FirmwareVersion> for String {
    fn from(version: FirmwareVersion) -> Self {
        version.to_string()
    }
}

/// How a version change is framed to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionFraming {
    /// Capsule is older than the board firmware
    UpdateWithOlder,
    /// Capsule is newer than the board firmware
    UpdateWithNewer,
    /// Capsule matches the board firmware
    RewriteWithEquivalent,
    /// Versions cannot be compared
    OverwriteWith,
}

impl VersionFraming {
    fn phrase(self) -> &'static str {
        match self {
            VersionFraming::UpdateWithOlder => "update with older",
            VersionFraming::UpdateWithNewer => "update with newer",
            VersionFraming::RewriteWithEquivalent => "rewrite with equivalent",
            VersionFraming::OverwriteWith => "overwrite with",
        }
    }
}

/// Confirmation prompt describing a pending version change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChangePrompt {
    board: FirmwareVersion,
    capsule: FirmwareVersion,
    framing: VersionFraming,
}

impl VersionChangePrompt {
    /// Frame a change from `board` to `capsule`.
    pub fn new(board: &FirmwareVersion, capsule: &FirmwareVersion) -> Self {
        let framing = match capsule.compare(board) {
            Ok(VersionOrdering::Older) => VersionFraming::UpdateWithOlder,
            Ok(VersionOrdering::Newer) => VersionFraming::UpdateWithNewer,
            Ok(VersionOrdering::Equal) => VersionFraming::RewriteWithEquivalent,
            Err(e) => {
                debug!(error = %e, "versions not comparable, framing as overwrite");
                VersionFraming::OverwriteWith
            }
        };
        Self {
            board: board.clone(),
            capsule: capsule.clone(),
            framing,
        }
    }

    /// Framing chosen for the change.
    pub fn framing(&self) -> VersionFraming {
        self.framing
    }

    /// Whether the capsule carries the version already on the board.
    pub fn is_equivalent(&self) -> bool {
        self.framing == VersionFraming::RewriteWithEquivalent
    }

    /// Board version the prompt was built for.
    pub fn board_version(&self) -> &FirmwareVersion {
        &self.board
    }

    /// Capsule version the prompt was built for.
    pub fn capsule_version(&self) -> &FirmwareVersion {
        &self.capsule
    }

    /// Text shown to the user.
    pub fn description(&self) -> String {
        let target = if self.is_equivalent() {
            String::new()
        } else {
            format!(" version '{}'", self.capsule.to_presentation_string())
        };
        format!(
            "Target firmware is version '{}' now.\n\nDo you wish to {}{} firmware?",
            self.board.to_presentation_string(),
            self.framing.phrase(),
            target
        )
    }
}
