//! Shadow copy engine traits and implementations

pub mod memory;
#[cfg(windows)]
mod native;

pub use memory::MemoryEngine;
#[cfg(windows)]
pub use native::WindowsEngine;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::types::{BackupType, SetId, SnapshotContext, SnapshotId, SnapshotRecord, VolumeName};
use std::sync::Arc;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Entry point of a shadow copy engine
///
/// Only the default provider is supported; alternate hardware or software
/// providers are not selectable.
pub trait ShadowCopyEngine {
    /// Obtain the default provider's session factory
    fn default_provider(&self) -> EngineResult<Box<dyn SessionFactory>>;
}

/// Hands out fresh engine sessions
pub trait SessionFactory {
    fn create_session(&self) -> EngineResult<Box<dyn EngineSession>>;
}

/// One stateful engine session
///
/// Calls block until the engine answers. The engine tracks protocol state per
/// session, so callers must issue the creation steps strictly in order.
pub trait EngineSession {
    // === Initialization ===

    fn initialize_for_backup(&self) -> EngineResult<()>;

    fn initialize_for_restore(&self) -> EngineResult<()>;

    fn set_context(&self, context: SnapshotContext) -> EngineResult<()>;

    fn gather_writer_metadata(&self) -> EngineResult<()>;

    // === Snapshot Set Creation ===

    fn is_volume_supported(&self, volume: &VolumeName) -> EngineResult<bool>;

    fn start_set(&self) -> EngineResult<SetId>;

    fn add_to_set(&self, volume: &VolumeName) -> EngineResult<SnapshotId>;

    fn set_backup_state(
        &self,
        component_mode: bool,
        system_state: bool,
        backup_type: BackupType,
        partial_file_support: bool,
    ) -> EngineResult<()>;

    /// Notify writers; may do nothing depending on the context
    fn prepare_for_backup(&self) -> EngineResult<()>;

    /// Materialize every snapshot staged in the current set
    fn commit_set(&self) -> EngineResult<()>;

    /// Drop a partially built set after a failed step
    fn abort_backup(&self) -> EngineResult<()>;

    // === Query / Expose / Delete ===

    fn query_snapshots(&self) -> EngineResult<Vec<SnapshotRecord>>;

    /// Expose a snapshot; returns the path or share name actually used
    fn expose(
        &self,
        snapshot: SnapshotId,
        path_from_root: Option<&str>,
        attributes: SnapshotContext,
        target: &str,
    ) -> EngineResult<String>;

    fn unexpose(&self, snapshot: SnapshotId) -> EngineResult<()>;

    /// Delete every snapshot in a set; returns how many were removed
    fn delete_set(&self, set: SetId, force: bool) -> EngineResult<u32>;
}

/// The engine for this platform
#[cfg(windows)]
pub fn default_engine(config: &EngineConfig) -> Result<Arc<dyn ShadowCopyEngine>> {
    Ok(Arc::new(WindowsEngine::new(config.clone())))
}

/// The engine for this platform
#[cfg(not(windows))]
pub fn default_engine(config: &EngineConfig) -> Result<Arc<dyn ShadowCopyEngine>> {
    Err(crate::error::Error::EngineUnavailable(format!(
        "the Volume Shadow Copy service requires Windows (host architecture: {})",
        config.host_arch
    )))
}
