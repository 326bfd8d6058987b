//! Error types for shadow-set

use crate::types::{DeviceId, OperationMode, SnapshotId, VolumeName};
use std::fmt;
use thiserror::Error;

/// Result type alias for shadow-set operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why the engine could not hand out a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactoryFailure {
    /// The native library was built for another architecture, or the
    /// process bitness does not match the host
    IncompatibleBinary(String),
    /// A library the native engine depends on could not be loaded
    MissingDependency(String),
    Other(String),
}

impl fmt::Display for FactoryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactoryFailure::IncompatibleBinary(msg) => write!(f, "incompatible binary: {}", msg),
            FactoryFailure::MissingDependency(msg) => write!(f, "missing native dependency: {}", msg),
            FactoryFailure::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Failures reported by a shadow copy engine implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Shadow copy provider is not available: {0}")]
    Unavailable(String),

    #[error("Could not create engine session: {0}")]
    Factory(FactoryFailure),

    #[error("Object already exists")]
    ObjectAlreadyExists,

    #[error("Object not found")]
    ObjectNotFound,

    #[error("Operation not valid in the current session state")]
    BadState,

    #[error("Snapshot is in use")]
    InUse,

    #[error("Volume not supported: {0}")]
    VolumeNotSupported(String),

    #[error("Engine call failed (code {code:#010x}): {message}")]
    Failed { code: u32, message: String },
}

/// A step of the snapshot-set creation protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolStep {
    StartSet,
    AddToSet(VolumeName),
    SetBackupState,
    PrepareForBackup,
    Commit,
}

impl fmt::Display for ProtocolStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolStep::StartSet => write!(f, "start snapshot set"),
            ProtocolStep::AddToSet(volume) => write!(f, "add {} to snapshot set", volume),
            ProtocolStep::SetBackupState => write!(f, "set backup state"),
            ProtocolStep::PrepareForBackup => write!(f, "prepare for backup"),
            ProtocolStep::Commit => write!(f, "commit snapshot set"),
        }
    }
}

/// Errors that can occur during shadow-set operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shadow copy engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Shadow copy factory error: {0}")]
    Factory(FactoryFailure),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Session was already used for a {0} operation and cannot be reused")]
    SessionReused(String),

    #[error("Operation '{operation}' is not valid for a {mode} provider")]
    InvalidOperation { mode: OperationMode, operation: String },

    #[error("Volume {0} is not supported for shadow copies")]
    UnsupportedVolume(VolumeName),

    #[error("Resolved {resolved} volume(s) for {snapshots} snapshot(s)")]
    VolumeResolutionMismatch { snapshots: usize, resolved: usize },

    #[error("No drive letter maps to volume {device} of snapshot {snapshot}")]
    VolumeNotResolved { snapshot: SnapshotId, device: DeviceId },

    #[error("Could not resolve the volume of snapshot {0}")]
    VolumeResolutionFailed(SnapshotId),

    #[error("Invalid share name '{0}': colons and path separators are not allowed")]
    InvalidShareName(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid drive letter '{0}'")]
    InvalidDriveLetter(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Engine exposed the snapshot at '{actual}' instead of '{requested}'")]
    ExposeMismatch { requested: String, actual: String },

    #[error("Invalid identifier '{0}': expected xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx")]
    InvalidIdentifier(String),

    #[error("The all-flags snapshot context is rejected by the engine; use a named composite")]
    ReservedContext,

    #[error("Snapshot context {0:#x} contains undefined flags")]
    InvalidContext(u32),

    #[error("Snapshot set step '{step}' failed: {source}")]
    Protocol {
        step: ProtocolStep,
        #[source]
        source: EngineError,
    },

    #[error("Error unexposing snapshot {snapshot}: {source}")]
    Unexpose {
        snapshot: SnapshotId,
        #[source]
        source: EngineError,
    },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map the factory-level engine failures onto the provider's error kinds
    pub(crate) fn from_factory(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => Error::EngineUnavailable(msg),
            EngineError::Factory(failure) => Error::Factory(failure),
            other => Error::Factory(FactoryFailure::Other(other.to_string())),
        }
    }
}
