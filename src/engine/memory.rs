//! In-memory shadow copy engine
//!
//! Follows the native engine's stateful rules: sessions are initialized once,
//! the creation steps must come in order, queries only see snapshots of the
//! session's context, non-persistent snapshots vanish when the session that
//! made them is dropped, exposed snapshots are protected from deletion unless
//! forced. Individual calls can be made to fail for testing.

use super::{EngineResult, EngineSession, SessionFactory, ShadowCopyEngine};
use crate::error::{EngineError, FactoryFailure};
use crate::types::{
    BackupType, DeviceId, Locality, ObjectId, SetId, SnapshotContext, SnapshotId, SnapshotRecord,
    VolumeName,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Engine calls that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateSession,
    InitializeForBackup,
    InitializeForRestore,
    SetContext,
    GatherWriterMetadata,
    IsVolumeSupported,
    StartSet,
    AddToSet,
    SetBackupState,
    PrepareForBackup,
    Commit,
    Query,
    Expose,
    Unexpose,
    Delete,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    record: SnapshotRecord,
    session: u64,
}

#[derive(Debug, Default)]
struct EngineState {
    /// Supported volumes, keyed by uppercased volume name
    volumes: BTreeMap<String, DeviceId>,
    snapshots: Vec<StoredSnapshot>,
    failures: HashMap<FailPoint, EngineError>,
    unavailable: Option<String>,
    next_session: u64,
    expose_suffix: Option<String>,
    calls: Vec<String>,
}

impl EngineState {
    fn enter(&mut self, call: &str, point: Option<FailPoint>) -> EngineResult<()> {
        self.calls.push(call.to_string());
        match point.and_then(|p| self.failures.remove(&p)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Shared handle to one in-memory engine; clones see the same state
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a volume that can be snapshotted
    pub fn with_volume(self, volume: &str, device: &str) -> Self {
        self.state
            .lock()
            .volumes
            .insert(volume.to_uppercase(), DeviceId::new(device));
        self
    }

    /// Make the next call at `point` fail with `error`
    pub fn fail_at(&self, point: FailPoint, error: EngineError) {
        self.state.lock().failures.insert(point, error);
    }

    /// Make the default provider unobtainable
    pub fn set_unavailable(&self, reason: &str) {
        self.state.lock().unavailable = Some(reason.to_string());
    }

    /// Make session creation fail with a factory error
    pub fn fail_factory(&self, failure: FactoryFailure) {
        self.fail_at(FailPoint::CreateSession, EngineError::Factory(failure));
    }

    /// Expose snapshots at `target + suffix` instead of the requested target
    pub fn rewrite_exposed_paths(&self, suffix: &str) {
        self.state.lock().expose_suffix = Some(suffix.to_string());
    }

    /// Every snapshot the engine holds, regardless of context
    pub fn snapshots(&self) -> Vec<SnapshotRecord> {
        self.state
            .lock()
            .snapshots
            .iter()
            .map(|s| s.record.clone())
            .collect()
    }

    /// Names of the engine calls made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Insert a committed snapshot directly, as if left by an earlier process
    pub fn seed_snapshot(&self, set: SetId, volume: &str, context: SnapshotContext) -> SnapshotId {
        let mut state = self.state.lock();
        let device = state
            .volumes
            .get(&volume.to_uppercase())
            .cloned()
            .unwrap_or_else(|| DeviceId::new(volume));
        let snapshot_id = SnapshotId::new(ObjectId::new_random());
        state.snapshots.push(StoredSnapshot {
            record: SnapshotRecord {
                snapshot_id,
                set_id: set,
                original_volume: device,
                context,
                exposed_name: None,
                exposed_path: None,
            },
            session: 0,
        });
        snapshot_id
    }
}

impl ShadowCopyEngine for MemoryEngine {
    fn default_provider(&self) -> EngineResult<Box<dyn SessionFactory>> {
        if let Some(reason) = &self.state.lock().unavailable {
            return Err(EngineError::Unavailable(reason.clone()));
        }
        Ok(Box::new(MemoryFactory {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryFactory {
    state: Arc<Mutex<EngineState>>,
}

impl SessionFactory for MemoryFactory {
    fn create_session(&self) -> EngineResult<Box<dyn EngineSession>> {
        let mut state = self.state.lock();
        state.enter("create_session", Some(FailPoint::CreateSession))?;
        state.next_session += 1;
        Ok(Box::new(MemorySession {
            id: state.next_session,
            engine: Arc::clone(&self.state),
            session: Mutex::new(SessionState::default()),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Init {
    Backup,
    Restore,
}

#[derive(Debug)]
struct PendingSet {
    set_id: SetId,
    members: Vec<(SnapshotId, DeviceId)>,
    backup_state: bool,
    prepared: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    init: Option<Init>,
    context: SnapshotContext,
    pending: Option<PendingSet>,
}

impl SessionState {
    fn require_backup(&self) -> EngineResult<()> {
        match self.init {
            Some(Init::Backup) => Ok(()),
            _ => Err(EngineError::BadState),
        }
    }

    fn visible(&self, record: &SnapshotRecord) -> bool {
        record.context == self.context
    }
}

struct MemorySession {
    id: u64,
    engine: Arc<Mutex<EngineState>>,
    session: Mutex<SessionState>,
}

impl EngineSession for MemorySession {
    fn initialize_for_backup(&self) -> EngineResult<()> {
        let mut session = self.session.lock();
        self.engine
            .lock()
            .enter("initialize_for_backup", Some(FailPoint::InitializeForBackup))?;
        if session.init.is_some() {
            return Err(EngineError::BadState);
        }
        session.init = Some(Init::Backup);
        Ok(())
    }

    fn initialize_for_restore(&self) -> EngineResult<()> {
        let mut session = self.session.lock();
        self.engine
            .lock()
            .enter("initialize_for_restore", Some(FailPoint::InitializeForRestore))?;
        if session.init.is_some() {
            return Err(EngineError::BadState);
        }
        session.init = Some(Init::Restore);
        Ok(())
    }

    fn set_context(&self, context: SnapshotContext) -> EngineResult<()> {
        let mut session = self.session.lock();
        self.engine.lock().enter("set_context", Some(FailPoint::SetContext))?;
        session.require_backup()?;
        if !context.is_context() {
            return Err(EngineError::Failed {
                code: 0x8007_0057,
                message: format!("{} is not a snapshot context", context),
            });
        }
        session.context = context;
        Ok(())
    }

    fn gather_writer_metadata(&self) -> EngineResult<()> {
        let session = self.session.lock();
        self.engine
            .lock()
            .enter("gather_writer_metadata", Some(FailPoint::GatherWriterMetadata))?;
        session.require_backup()
    }

    fn is_volume_supported(&self, volume: &VolumeName) -> EngineResult<bool> {
        let session = self.session.lock();
        let mut engine = self.engine.lock();
        engine.enter("is_volume_supported", Some(FailPoint::IsVolumeSupported))?;
        session.require_backup()?;
        Ok(engine.volumes.contains_key(&volume.name().to_uppercase()))
    }

    fn start_set(&self) -> EngineResult<SetId> {
        let mut session = self.session.lock();
        self.engine.lock().enter("start_set", Some(FailPoint::StartSet))?;
        session.require_backup()?;
        if session.pending.is_some() {
            return Err(EngineError::BadState);
        }
        let set_id = SetId::new(ObjectId::new_random());
        session.pending = Some(PendingSet {
            set_id,
            members: Vec::new(),
            backup_state: false,
            prepared: false,
        });
        Ok(set_id)
    }

    fn add_to_set(&self, volume: &VolumeName) -> EngineResult<SnapshotId> {
        let mut session = self.session.lock();
        let mut engine = self.engine.lock();
        engine.enter("add_to_set", Some(FailPoint::AddToSet))?;
        let device = engine
            .volumes
            .get(&volume.name().to_uppercase())
            .cloned()
            .ok_or_else(|| EngineError::VolumeNotSupported(volume.to_string()))?;

        let pending = session.pending.as_mut().ok_or(EngineError::BadState)?;
        if pending.backup_state {
            return Err(EngineError::BadState);
        }
        if pending.members.iter().any(|(_, d)| d.matches(&device)) {
            return Err(EngineError::ObjectAlreadyExists);
        }
        let snapshot_id = SnapshotId::new(ObjectId::new_random());
        pending.members.push((snapshot_id, device));
        Ok(snapshot_id)
    }

    fn set_backup_state(
        &self,
        _component_mode: bool,
        _system_state: bool,
        _backup_type: BackupType,
        _partial_file_support: bool,
    ) -> EngineResult<()> {
        let mut session = self.session.lock();
        self.engine
            .lock()
            .enter("set_backup_state", Some(FailPoint::SetBackupState))?;
        let pending = session.pending.as_mut().ok_or(EngineError::BadState)?;
        pending.backup_state = true;
        Ok(())
    }

    fn prepare_for_backup(&self) -> EngineResult<()> {
        let mut session = self.session.lock();
        self.engine
            .lock()
            .enter("prepare_for_backup", Some(FailPoint::PrepareForBackup))?;
        let pending = session.pending.as_mut().ok_or(EngineError::BadState)?;
        if !pending.backup_state {
            return Err(EngineError::BadState);
        }
        pending.prepared = true;
        Ok(())
    }

    fn commit_set(&self) -> EngineResult<()> {
        let mut session = self.session.lock();
        let mut engine = self.engine.lock();
        engine.enter("commit_set", Some(FailPoint::Commit))?;
        match &session.pending {
            Some(pending) if pending.prepared => {}
            _ => return Err(EngineError::BadState),
        }
        let context = session.context;
        if let Some(pending) = session.pending.take() {
            for (snapshot_id, device) in pending.members {
                engine.snapshots.push(StoredSnapshot {
                    record: SnapshotRecord {
                        snapshot_id,
                        set_id: pending.set_id,
                        original_volume: device,
                        context,
                        exposed_name: None,
                        exposed_path: None,
                    },
                    session: self.id,
                });
            }
        }
        Ok(())
    }

    fn abort_backup(&self) -> EngineResult<()> {
        let mut session = self.session.lock();
        self.engine.lock().enter("abort_backup", None)?;
        session.pending = None;
        Ok(())
    }

    fn query_snapshots(&self) -> EngineResult<Vec<SnapshotRecord>> {
        let session = self.session.lock();
        let mut engine = self.engine.lock();
        engine.enter("query_snapshots", Some(FailPoint::Query))?;
        session.require_backup()?;
        Ok(engine
            .snapshots
            .iter()
            .filter(|s| session.visible(&s.record))
            .map(|s| s.record.clone())
            .collect())
    }

    fn expose(
        &self,
        snapshot: SnapshotId,
        path_from_root: Option<&str>,
        attributes: SnapshotContext,
        target: &str,
    ) -> EngineResult<String> {
        let session = self.session.lock();
        let mut engine = self.engine.lock();
        engine.enter("expose", Some(FailPoint::Expose))?;
        session.require_backup()?;
        let locality = Locality::from_attributes(attributes).map_err(|_| EngineError::Failed {
            code: 0x8000_4005,
            message: "invalid expose attributes".to_string(),
        })?;

        let taken = engine.snapshots.iter().any(|s| {
            s.record.exposed_name.as_deref().map_or(false, |name| name.eq_ignore_ascii_case(target))
        });
        let suffix = engine.expose_suffix.clone().unwrap_or_default();
        let stored = engine
            .snapshots
            .iter_mut()
            .find(|s| s.record.snapshot_id == snapshot && session.visible(&s.record))
            .ok_or(EngineError::ObjectNotFound)?;
        if stored.record.exposed_name.is_some() || taken {
            return Err(EngineError::ObjectAlreadyExists);
        }

        let actual = format!("{}{}", target, suffix);
        stored.record.exposed_name = Some(actual.clone());
        stored.record.exposed_path = match locality {
            Locality::Local => None,
            Locality::Remote => path_from_root.map(str::to_string),
        };
        Ok(actual)
    }

    fn unexpose(&self, snapshot: SnapshotId) -> EngineResult<()> {
        let session = self.session.lock();
        let mut engine = self.engine.lock();
        engine.enter("unexpose", Some(FailPoint::Unexpose))?;
        session.require_backup()?;
        let stored = engine
            .snapshots
            .iter_mut()
            .find(|s| s.record.snapshot_id == snapshot)
            .ok_or(EngineError::ObjectNotFound)?;
        if stored.record.exposed_name.take().is_none() {
            return Err(EngineError::BadState);
        }
        stored.record.exposed_path = None;
        Ok(())
    }

    fn delete_set(&self, set: SetId, force: bool) -> EngineResult<u32> {
        let session = self.session.lock();
        let mut engine = self.engine.lock();
        engine.enter("delete_set", Some(FailPoint::Delete))?;
        session.require_backup()?;

        let members: Vec<&StoredSnapshot> = engine
            .snapshots
            .iter()
            .filter(|s| s.record.set_id == set)
            .collect();
        if members.is_empty() {
            return Err(EngineError::ObjectNotFound);
        }
        if !force && members.iter().any(|s| s.record.exposed_name.is_some()) {
            return Err(EngineError::InUse);
        }
        let before = engine.snapshots.len();
        engine.snapshots.retain(|s| s.record.set_id != set);
        Ok((before - engine.snapshots.len()) as u32)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut engine = self.engine.lock();
        engine.snapshots.retain(|s| {
            s.session != self.id || s.record.context.contains(SnapshotContext::NO_AUTO_RELEASE)
        });
    }
}
