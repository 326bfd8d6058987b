//! Core types for shadow copy orchestration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::str::FromStr;
use uuid::Uuid;

/// The single operation a provider (and its session) is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationMode {
    Backup,
    Restore,
    Query,
    Delete,
}

impl OperationMode {
    /// All operation modes
    pub const ALL: [OperationMode; 4] = [
        OperationMode::Backup,
        OperationMode::Restore,
        OperationMode::Query,
        OperationMode::Delete,
    ];

    /// Get the mode name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Backup => "backup",
            OperationMode::Restore => "restore",
            OperationMode::Query => "query",
            OperationMode::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "backup" => Ok(OperationMode::Backup),
            "restore" => Ok(OperationMode::Restore),
            "query" => Ok(OperationMode::Query),
            "delete" => Ok(OperationMode::Delete),
            _ => Err(Error::InvalidArgument(format!(
                "Invalid operation mode '{}'. Must be backup, restore, query, or delete",
                s
            ))),
        }
    }
}

/// Opaque 128-bit identifier assigned by the shadow copy engine.
///
/// Every identifier string in the crate goes through [`ObjectId::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Parse `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`, optionally wrapped in braces.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(ObjectId)
            .map_err(|_| Error::InvalidIdentifier(s.to_string()))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        ObjectId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Fresh random identifier, used by engines that mint their own ids
    pub fn new_random() -> Self {
        ObjectId(Uuid::new_v4())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ObjectId::parse(s)
    }
}

macro_rules! object_id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(ObjectId);

        impl $name {
            pub fn parse(s: &str) -> Result<Self> {
                ObjectId::parse(s).map($name)
            }

            pub fn new(id: ObjectId) -> Self {
                $name(id)
            }

            pub fn id(&self) -> ObjectId {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                $name::parse(s)
            }
        }
    };
}

object_id_newtype!(
    /// Identifier of a snapshot set
    SetId
);

object_id_newtype!(
    /// Identifier of a single volume's shadow copy
    SnapshotId
);

/// A drive letter, always stored uppercase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriveLetter(char);

impl DriveLetter {
    pub fn new(c: char) -> Result<Self> {
        if c.is_ascii_alphabetic() {
            Ok(DriveLetter(c.to_ascii_uppercase()))
        } else {
            Err(Error::InvalidDriveLetter(c.to_string()))
        }
    }

    pub fn as_char(&self) -> char {
        self.0
    }

    /// `C:`
    pub fn drive_spec(&self) -> String {
        format!("{}:", self.0)
    }

    /// `C:\`
    pub fn root(&self) -> String {
        format!("{}:\\", self.0)
    }
}

impl fmt::Display for DriveLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.0)
    }
}

impl FromStr for DriveLetter {
    type Err = Error;

    /// Accepts `C`, `C:` and `C:\`
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim_end_matches('\\');
        let trimmed = trimmed.strip_suffix(':').unwrap_or(trimmed);
        let mut chars = trimmed.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => DriveLetter::new(c),
            _ => Err(Error::InvalidDriveLetter(s.to_string())),
        }
    }
}

/// A volume as the engine accepts it for snapshotting (`C:\`, a mount point, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeName(String);

impl VolumeName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument("Volume name cannot be empty".to_string()));
        }
        // Bare drive specs are normalized to their root so that created and
        // queried sets compare equal.
        if name.len() == 2 && name.ends_with(':') {
            let letter: DriveLetter = name.parse()?;
            return Ok(VolumeName(letter.root()));
        }
        Ok(VolumeName(name))
    }

    pub fn from_drive(letter: DriveLetter) -> Self {
        VolumeName(letter.root())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// The drive letter when this volume is a drive root
    pub fn drive_letter(&self) -> Option<DriveLetter> {
        let bytes = self.0.as_bytes();
        if bytes.len() == 3 && bytes[1] == b':' && bytes[2] == b'\\' {
            DriveLetter::new(bytes[0] as char).ok()
        } else {
            None
        }
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VolumeName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        VolumeName::new(s)
    }
}

/// Opaque device identifier of a volume, e.g. `\\?\Volume{3f422e46-...}\`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Device ids are compared case-insensitively, the way the OS reports them
    pub fn matches(&self, other: &DeviceId) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot context and volume snapshot attribute flags.
///
/// The engine receives this as a signed 32-bit value. The all-ones mask
/// overflows that conversion and is refused by the engine, so it cannot be
/// built through this type. Only the composites in [`SnapshotContext::NAMED`]
/// are accepted as a session context; the single flags describe snapshot
/// attributes and exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SnapshotContext(u32);

impl SnapshotContext {
    pub const BACKUP: Self = Self(0);
    pub const PERSISTENT: Self = Self(0x0000_0001);
    pub const NO_AUTO_RECOVERY: Self = Self(0x0000_0002);
    pub const CLIENT_ACCESSIBLE_FLAG: Self = Self(0x0000_0004);
    pub const NO_AUTO_RELEASE: Self = Self(0x0000_0008);
    pub const NO_WRITERS: Self = Self(0x0000_0010);
    pub const TRANSPORTABLE: Self = Self(0x0000_0020);
    pub const NOT_SURFACED: Self = Self(0x0000_0040);
    pub const NOT_TRANSACTED: Self = Self(0x0000_0080);
    pub const HARDWARE_ASSISTED: Self = Self(0x0001_0000);
    pub const DIFFERENTIAL: Self = Self(0x0002_0000);
    pub const PLEX: Self = Self(0x0004_0000);
    pub const IMPORTED: Self = Self(0x0008_0000);
    pub const EXPOSED_LOCALLY: Self = Self(0x0010_0000);
    pub const EXPOSED_REMOTELY: Self = Self(0x0020_0000);
    pub const AUTO_RECOVER: Self = Self(0x0040_0000);
    pub const ROLLBACK_RECOVERY: Self = Self(0x0080_0000);
    pub const DELAYED_POST_SNAPSHOT: Self = Self(0x0100_0000);
    pub const TXF_RECOVERY: Self = Self(0x0200_0000);

    /// Persistent, not released with the session
    pub const APP_ROLLBACK: Self = Self(0x1 | 0x8);
    pub const FILE_SHARE_BACKUP: Self = Self(0x10);
    pub const NAS_ROLLBACK: Self = Self(0x10 | 0x1 | 0x8);
    pub const CLIENT_ACCESSIBLE: Self = Self(0x1 | 0x4 | 0x8 | 0x10);
    pub const CLIENT_ACCESSIBLE_WRITERS: Self = Self(0x1 | 0x4 | 0x8);

    /// Union of every defined flag (0x03FF_00FF), used to mask attribute
    /// values; the engine does not accept it as a context
    pub const ALL_KNOWN: Self = Self(0x03FF_00FF);

    const RESERVED_ALL: u32 = u32::MAX;

    /// Session contexts the engine accepts, in the order the CLI lists them
    pub const NAMED: [(&'static str, SnapshotContext); 6] = [
        ("backup", Self::BACKUP),
        ("app-rollback", Self::APP_ROLLBACK),
        ("file-share-backup", Self::FILE_SHARE_BACKUP),
        ("nas-rollback", Self::NAS_ROLLBACK),
        ("client-accessible", Self::CLIENT_ACCESSIBLE),
        ("client-accessible-writers", Self::CLIENT_ACCESSIBLE_WRITERS),
    ];

    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits == Self::RESERVED_ALL {
            return Err(Error::ReservedContext);
        }
        if bits & !Self::ALL_KNOWN.0 != 0 {
            return Err(Error::InvalidContext(bits));
        }
        Ok(Self(bits))
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// The value handed to the engine's `LONG` context parameter
    pub fn engine_value(&self) -> i32 {
        // ALL_KNOWN < i32::MAX, so every constructible value fits
        self.0 as i32
    }

    pub fn contains(&self, other: SnapshotContext) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: SnapshotContext) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_persistent(&self) -> bool {
        self.contains(Self::PERSISTENT)
    }

    /// Whether the engine accepts this value as a session context
    pub fn is_context(&self) -> bool {
        self.name().is_some()
    }

    /// Name of the composite this value equals, if any
    pub fn name(&self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(_, ctx)| ctx == self)
            .map(|(name, _)| *name)
    }
}

impl BitOr for SnapshotContext {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for SnapshotContext {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl TryFrom<u32> for SnapshotContext {
    type Error = Error;

    fn try_from(bits: u32) -> Result<Self> {
        SnapshotContext::from_bits(bits)
    }
}

impl From<SnapshotContext> for u32 {
    fn from(ctx: SnapshotContext) -> u32 {
        ctx.0
    }
}

impl fmt::Display for SnapshotContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({:#x})", name, self.0),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

impl FromStr for SnapshotContext {
    type Err = Error;

    /// A composite name, or a decimal / `0x` hex mask
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let lowered = s.to_lowercase();
        if let Some((_, ctx)) = Self::NAMED.iter().find(|(name, _)| *name == lowered) {
            return Ok(*ctx);
        }
        if lowered == "all" {
            return Err(Error::ReservedContext);
        }
        let bits = match lowered.strip_prefix("0x") {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => lowered.parse::<u32>(),
        }
        .map_err(|_| Error::InvalidArgument(format!("Unknown snapshot context '{}'", s)))?;
        SnapshotContext::from_bits(bits)
    }
}

/// Backup type passed to set-backup-state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Undefined = 0,
    #[default]
    Full = 1,
    Incremental = 2,
    Differential = 3,
    Log = 4,
    Copy = 5,
    Other = 6,
}

impl BackupType {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

impl FromStr for BackupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "undefined" => Ok(BackupType::Undefined),
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "differential" => Ok(BackupType::Differential),
            "log" => Ok(BackupType::Log),
            "copy" => Ok(BackupType::Copy),
            "other" => Ok(BackupType::Other),
            _ => Err(Error::InvalidArgument(format!("Invalid backup type '{}'", s))),
        }
    }
}

/// Where an exposed snapshot becomes visible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Locality {
    /// Drive letter or empty directory on this machine
    Local,
    /// Network share
    Remote,
}

impl Locality {
    /// Exactly one of the two exposure flags must be present.
    pub fn from_attributes(attributes: SnapshotContext) -> Result<Self> {
        let local = attributes.contains(SnapshotContext::EXPOSED_LOCALLY);
        let remote = attributes.contains(SnapshotContext::EXPOSED_REMOTELY);
        match (local, remote) {
            (true, false) => Ok(Locality::Local),
            (false, true) => Ok(Locality::Remote),
            (true, true) => Err(Error::InvalidArgument(
                "Snapshot cannot be exposed both locally and remotely".to_string(),
            )),
            (false, false) => Err(Error::InvalidArgument(
                "Expose attributes must include ExposedLocally or ExposedRemotely".to_string(),
            )),
        }
    }

    pub fn attribute(&self) -> SnapshotContext {
        match self {
            Locality::Local => SnapshotContext::EXPOSED_LOCALLY,
            Locality::Remote => SnapshotContext::EXPOSED_REMOTELY,
        }
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locality::Local => write!(f, "locally"),
            Locality::Remote => write!(f, "remotely"),
        }
    }
}

/// A snapshot as reported by the engine's query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: SnapshotId,
    pub set_id: SetId,
    /// Device id of the volume the snapshot was taken from
    pub original_volume: DeviceId,
    pub context: SnapshotContext,
    pub exposed_name: Option<String>,
    pub exposed_path: Option<String>,
}

/// Result of an expose attempt.
///
/// Conflicts the engine reports during exposure are expected states, so they
/// come back here rather than as [`Error`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExposeOutcome {
    /// Exposed at the given path or share name
    Exposed(String),
    /// The snapshot is already exposed somewhere
    AlreadyExposed,
    /// The session is not in a state that allows exposure
    BadState,
    /// The engine does not know this snapshot (wrong context, or deleted)
    ObjectNotFound,
}

impl ExposeOutcome {
    pub fn is_exposed(&self) -> bool {
        matches!(self, ExposeOutcome::Exposed(_))
    }

    /// Short explanation of a refused exposure
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            ExposeOutcome::Exposed(_) => None,
            ExposeOutcome::AlreadyExposed => Some("the snapshot is already exposed"),
            ExposeOutcome::BadState => Some("the session is in a bad state for exposing"),
            ExposeOutcome::ObjectNotFound => {
                Some("snapshot not found (wrong context, or it no longer exists)")
            }
        }
    }
}
