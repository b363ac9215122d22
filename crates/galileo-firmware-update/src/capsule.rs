//! Firmware capsule (`.gcap`) format and validation
//!
//! A capsule is a single file holding one firmware image:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "GCAP"
//! 4       2     container format version (u16 LE, currently 1)
//! 6       2     header length (u16 LE, 45 + N)
//! 8       4     payload length (u32 LE)
//! 12      32    SHA-256 of the payload
//! 44      1     version string length N (1..=255)
//! 45      N     version string (UTF-8)
//! 45+N    ...   payload
//! ```
//!
//! [`CapsuleValidator`] checks a capsule before anything is sent to the
//! board, producing a [`ValidatedCapsule`] that the transfer engine consumes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::DEFAULT_MAX_CAPSULE_PAYLOAD;
use crate::error::{MalformedCapsule, ValidationError};
use crate::version::FirmwareVersion;

/// Magic bytes at the start of every capsule
pub const CAPSULE_MAGIC: [u8; 4] = *b"GCAP";

/// Container format version this crate reads and writes
pub const CAPSULE_FORMAT_VERSION: u16 = 1;

/// Header length excluding the version string
pub const CAPSULE_FIXED_HEADER_LEN: usize = 45;

/// Conventional file extension
pub const CAPSULE_EXTENSION: &str = "gcap";

/// Where capsule bytes come from
#[derive(Debug, Clone)]
pub enum CapsuleSource {
    /// File on disk
    Path(PathBuf),
    /// Image shipped with the application
    Bundled {
        /// Resource name used in messages
        name: String,
        /// Capsule bytes
        data: Arc<[u8]>,
    },
}

impl CapsuleSource {
    /// Path or resource name used in messages.
    pub fn describe(&self) -> String {
        match self {
            CapsuleSource::Path(path) => path.display().to_string(),
            CapsuleSource::Bundled { name, .. } => format!("bundled:{name}"),
        }
    }

    fn read_blocking(&self) -> Result<Vec<u8>, ValidationError> {
        match self {
            CapsuleSource::Path(path) => std::fs::read(path)
                .map_err(|e| ValidationError::from_io(self.describe(), e)),
            CapsuleSource::Bundled { data, .. } => Ok(data.to_vec()),
        }
    }

    async fn read(&self) -> Result<Vec<u8>, ValidationError> {
        match self {
            CapsuleSource::Path(path) => tokio::fs::read(path)
                .await
                .map_err(|e| ValidationError::from_io(self.describe(), e)),
            CapsuleSource::Bundled { data, .. } => Ok(data.to_vec()),
        }
    }
}

/// A firmware capsule together with the version it is expected to carry
#[derive(Debug, Clone)]
pub struct FirmwareCapsule {
    source: CapsuleSource,
    version: FirmwareVersion,
}

impl FirmwareCapsule {
    /// Capsule at `path` expected to carry `version`.
    pub fn from_path(path: impl Into<PathBuf>, version: FirmwareVersion) -> Self {
        Self {
            source: CapsuleSource::Path(path.into()),
            version,
        }
    }

    /// Bundled capsule expected to carry `version`.
    pub fn bundled(
        name: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
        version: FirmwareVersion,
    ) -> Self {
        Self {
            source: CapsuleSource::Bundled {
                name: name.into(),
                data: data.into(),
            },
            version,
        }
    }

    /// Open the capsule at `path`, taking its version from the header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let source = CapsuleSource::Path(path.as_ref().to_path_buf());
        let bytes = source.read_blocking()?;
        let version = read_header(&source, &bytes)?.version;
        Ok(Self { source, version })
    }

    /// Wrap bundled capsule bytes, taking the version from the header.
    pub fn from_bundled(
        name: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<Self, ValidationError> {
        let data: Arc<[u8]> = data.into();
        let source = CapsuleSource::Bundled {
            name: name.into(),
            data: Arc::clone(&data),
        };
        let version = read_header(&source, &data)?.version;
        Ok(Self { source, version })
    }

    /// Where the capsule is read from.
    pub fn source(&self) -> &CapsuleSource {
        &self.source
    }

    /// Version the capsule is expected to carry.
    pub fn version(&self) -> &FirmwareVersion {
        &self.version
    }

    /// Path or resource name used in messages.
    pub fn location(&self) -> String {
        self.source.describe()
    }
}

/// Parsed capsule header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleHeader {
    /// Container format version
    pub format_version: u16,
    /// Total header length in bytes
    pub header_len: usize,
    /// Declared payload length
    pub payload_len: u32,
    /// SHA-256 of the payload
    pub digest: [u8; 32],
    /// Embedded firmware version
    pub version: FirmwareVersion,
}

fn take<const N: usize>(cursor: &mut &[u8]) -> Option<[u8; N]> {
    let (head, rest) = cursor.split_at_checked(N)?;
    *cursor = rest;
    head.try_into().ok()
}

impl CapsuleHeader {
    /// Parse the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, MalformedCapsule> {
        let too_short = |expected: usize| MalformedCapsule::TooShort {
            expected,
            actual: bytes.len(),
        };
        let mut cursor = bytes;

        let magic: [u8; 4] = take(&mut cursor).ok_or(too_short(CAPSULE_FIXED_HEADER_LEN))?;
        if magic != CAPSULE_MAGIC {
            return Err(MalformedCapsule::BadMagic { found: magic });
        }
        if bytes.len() < CAPSULE_FIXED_HEADER_LEN {
            return Err(too_short(CAPSULE_FIXED_HEADER_LEN));
        }

        let format_version =
            u16::from_le_bytes(take(&mut cursor).ok_or(too_short(CAPSULE_FIXED_HEADER_LEN))?);
        if format_version != CAPSULE_FORMAT_VERSION {
            return Err(MalformedCapsule::UnsupportedFormat(format_version));
        }
        let header_len = usize::from(u16::from_le_bytes(
            take(&mut cursor).ok_or(too_short(CAPSULE_FIXED_HEADER_LEN))?,
        ));
        let payload_len =
            u32::from_le_bytes(take(&mut cursor).ok_or(too_short(CAPSULE_FIXED_HEADER_LEN))?);
        let digest: [u8; 32] = take(&mut cursor).ok_or(too_short(CAPSULE_FIXED_HEADER_LEN))?;
        let [version_len] = take::<1>(&mut cursor).ok_or(too_short(CAPSULE_FIXED_HEADER_LEN))?;

        if version_len == 0 {
            return Err(MalformedCapsule::MissingVersion);
        }
        let expected = CAPSULE_FIXED_HEADER_LEN + usize::from(version_len);
        if header_len != expected {
            return Err(MalformedCapsule::HeaderLength {
                declared: header_len,
                expected,
            });
        }

        let raw = cursor
            .get(..usize::from(version_len))
            .ok_or(too_short(expected))?;
        let text = std::str::from_utf8(raw).map_err(|_| MalformedCapsule::VersionNotUtf8)?;
        let version = FirmwareVersion::parse(text).map_err(MalformedCapsule::Version)?;

        Ok(Self {
            format_version,
            header_len,
            payload_len,
            digest,
            version,
        })
    }
}

fn read_header(source: &CapsuleSource, bytes: &[u8]) -> Result<CapsuleHeader, ValidationError> {
    CapsuleHeader::parse(bytes).map_err(|reason| ValidationError::Malformed {
        location: source.describe(),
        reason,
    })
}

/// A capsule that passed every structural check
#[derive(Debug, Clone)]
pub struct ValidatedCapsule {
    header: CapsuleHeader,
    payload: Arc<[u8]>,
    location: String,
}

impl ValidatedCapsule {
    /// Firmware version carried by the capsule.
    pub fn version(&self) -> &FirmwareVersion {
        &self.header.version
    }

    /// Parsed header.
    pub fn header(&self) -> &CapsuleHeader {
        &self.header
    }

    /// Firmware image bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Image length as sent on the wire.
    pub fn image_len(&self) -> u32 {
        self.header.payload_len
    }

    /// SHA-256 of the image.
    pub fn digest(&self) -> &[u8; 32] {
        &self.header.digest
    }

    /// SHA-256 of the image, hex encoded.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.header.digest)
    }

    /// Path or resource name the capsule was read from.
    pub fn location(&self) -> &str {
        &self.location
    }
}

/// Checks capsules before they are offered to the board
#[derive(Debug, Clone)]
pub struct CapsuleValidator {
    max_payload_len: u64,
}

impl Default for CapsuleValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPSULE_PAYLOAD)
    }
}

impl CapsuleValidator {
    /// Validator accepting payloads up to `max_payload_len` bytes.
    pub fn new(max_payload_len: u64) -> Self {
        Self { max_payload_len }
    }

    /// Read and validate `capsule`, blocking on file I/O.
    pub fn validate(&self, capsule: &FirmwareCapsule) -> Result<ValidatedCapsule, ValidationError> {
        let bytes = capsule.source().read_blocking()?;
        self.validate_bytes(capsule, bytes)
    }

    /// Read and validate `capsule` without blocking the runtime.
    pub async fn validate_async(
        &self,
        capsule: &FirmwareCapsule,
    ) -> Result<ValidatedCapsule, ValidationError> {
        let bytes = capsule.source().read().await?;
        self.validate_bytes(capsule, bytes)
    }

    /// Validate capsule bytes already in memory.
    pub fn validate_bytes(
        &self,
        capsule: &FirmwareCapsule,
        mut bytes: Vec<u8>,
    ) -> Result<ValidatedCapsule, ValidationError> {
        let location = capsule.location();
        let malformed = |reason| ValidationError::Malformed {
            location: location.clone(),
            reason,
        };

        let header = CapsuleHeader::parse(&bytes).map_err(malformed)?;
        let payload = bytes.split_off(header.header_len);
        let declared = u64::from(header.payload_len);
        let actual = u64::try_from(payload.len()).unwrap_or(u64::MAX);

        if declared != actual {
            return Err(malformed(MalformedCapsule::SizeMismatch { declared, actual }));
        }
        if payload.is_empty() {
            return Err(malformed(MalformedCapsule::EmptyPayload));
        }
        if actual > self.max_payload_len {
            return Err(malformed(MalformedCapsule::PayloadTooLarge {
                len: actual,
                max: self.max_payload_len,
            }));
        }

        let computed: [u8; 32] = Sha256::digest(&payload).into();
        if computed != header.digest {
            return Err(malformed(MalformedCapsule::DigestMismatch {
                expected: hex::encode(header.digest),
                actual: hex::encode(computed),
            }));
        }

        if &header.version != capsule.version() {
            return Err(malformed(MalformedCapsule::VersionMismatch {
                declared: capsule.version().to_string(),
                embedded: header.version.to_string(),
            }));
        }

        debug!(
            location = %location,
            version = %header.version,
            len = actual,
            digest = %hex::encode(header.digest),
            "capsule validated"
        );

        Ok(ValidatedCapsule {
            header,
            payload: payload.into(),
            location,
        })
    }
}

/// Writes capsules in the `.gcap` format
#[derive(Debug, Clone)]
pub struct CapsuleBuilder {
    version: FirmwareVersion,
}

impl CapsuleBuilder {
    /// Builder for capsules carrying `version`.
    pub fn new(version: FirmwareVersion) -> Self {
        Self { version }
    }

    /// Encode `payload` as a complete capsule.
    pub fn build(&self, payload: &[u8]) -> Result<Vec<u8>, MalformedCapsule> {
        if payload.is_empty() {
            return Err(MalformedCapsule::EmptyPayload);
        }
        let payload_len =
            u32::try_from(payload.len()).map_err(|_| MalformedCapsule::PayloadTooLarge {
                len: u64::try_from(payload.len()).unwrap_or(u64::MAX),
                max: u64::from(u32::MAX),
            })?;

        let version = self.version.to_string();
        let version_len = u8::try_from(version.len())
            .map_err(|_| MalformedCapsule::VersionTooLong(version.len()))?;
        let header_len = CAPSULE_FIXED_HEADER_LEN + usize::from(version_len);
        let header_len_field =
            u16::try_from(header_len).map_err(|_| MalformedCapsule::VersionTooLong(version.len()))?;

        let digest: [u8; 32] = Sha256::digest(payload).into();

        let mut out = Vec::with_capacity(header_len + payload.len());
        out.extend_from_slice(&CAPSULE_MAGIC);
        out.extend_from_slice(&CAPSULE_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&header_len_field.to_le_bytes());
        out.extend_from_slice(&payload_len.to_le_bytes());
        out.extend_from_slice(&digest);
        out.push(version_len);
        out.extend_from_slice(version.as_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Encode `payload` and write it to `path`.
    pub fn write_to(&self, path: impl AsRef<Path>, payload: &[u8]) -> std::io::Result<()> {
        let bytes = self
            .build(payload)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        std::fs::write(path, bytes)
    }
}
