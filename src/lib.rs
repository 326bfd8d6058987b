//! shadow-set: Orchestrate Volume Shadow Copy snapshot sets
//!
//! This library drives a shadow copy engine through its stateful protocol:
//! a [`Provider`] hands out single-use sessions, a [`SnapshotSet`] creates,
//! reconstructs or deletes a group of point-in-time volume snapshots, and a
//! [`Snapshot`] can be exposed at a drive letter, an empty directory or a
//! network share. The engine itself sits behind the traits in [`engine`], so
//! everything above it runs the same against the native Windows service or
//! the in-memory engine.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod provider;
pub mod snapshot;
pub mod snapshot_set;
pub mod types;
pub mod volume;

pub use config::EngineConfig;
pub use engine::{default_engine, EngineSession, MemoryEngine, ShadowCopyEngine};
pub use error::{EngineError, Error, FactoryFailure, ProtocolStep, Result};
pub use provider::{Host, Provider, Session};
pub use snapshot::Snapshot;
pub use snapshot_set::{BackupOptions, Resolution, SetState, SnapshotSet, VolumeSelection};
pub use types::{
    BackupType, DeviceId, DriveLetter, ExposeOutcome, Locality, OperationMode, SetId,
    SnapshotContext, SnapshotId, SnapshotRecord, VolumeName,
};
