//! Snapshot sets: atomic creation, query reconstruction and deletion

use crate::error::{EngineError, Error, ProtocolStep, Result};
use crate::provider::{Host, Provider, Session, SessionUse};
use crate::snapshot::Snapshot;
use crate::types::{
    BackupType, OperationMode, SetId, SnapshotContext, SnapshotId, SnapshotRecord, VolumeName,
};
use crate::volume::resolve_volumes;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Lifecycle of a [`SnapshotSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetState {
    Empty,
    Created,
    Queried,
    Deleted,
}

impl fmt::Display for SetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetState::Empty => write!(f, "empty"),
            SetState::Created => write!(f, "created"),
            SetState::Queried => write!(f, "queried"),
            SetState::Deleted => write!(f, "deleted"),
        }
    }
}

/// Backup state handed to the engine before the set is prepared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupOptions {
    /// Include the bootable system state
    pub system_state: bool,
    /// Select writer components explicitly (passed through, no selection is made)
    pub component_mode: bool,
    pub partial_file_support: bool,
    pub backup_type: BackupType,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            system_state: true,
            component_mode: false,
            partial_file_support: false,
            backup_type: BackupType::Full,
        }
    }
}

/// Which volumes a new set covers
#[derive(Debug, Clone)]
pub enum VolumeSelection {
    /// These volumes, snapshotted in this order
    Explicit(Vec<VolumeName>),
    /// The volumes the given snapshots were taken from
    FromSnapshots(Vec<SnapshotRecord>),
}

/// What to do with a queried snapshot whose volume has no drive letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    /// Fail with [`Error::VolumeNotResolved`]
    #[default]
    Strict,
    /// Keep the snapshot without a volume and list it in [`SnapshotSet::unresolved`]
    Flag,
}

/// A group of shadow copies taken at one instant
pub struct SnapshotSet {
    set_id: Option<SetId>,
    snapshots: Vec<Snapshot>,
    unresolved: Vec<SnapshotId>,
    mode: OperationMode,
    context: SnapshotContext,
    options: BackupOptions,
    state: SetState,
    session: Rc<Session>,
    host: Host,
}

impl SnapshotSet {
    /// An empty set with a freshly initialized session from `provider`
    pub fn new(provider: &Provider, options: BackupOptions) -> Result<Self> {
        let session = provider.open_session()?;
        if options.component_mode {
            warn!("component mode is passed through without selecting writer components");
        }
        Ok(Self {
            set_id: None,
            snapshots: Vec::new(),
            unresolved: Vec::new(),
            mode: provider.mode(),
            context: provider.context(),
            options,
            state: SetState::Empty,
            session: Rc::new(session),
            host: provider.host().clone(),
        })
    }

    /// An empty set standing for an existing set id, to be deleted
    pub fn existing(provider: &Provider, set_id: SetId, options: BackupOptions) -> Result<Self> {
        let mut set = Self::new(provider, options)?;
        set.set_id = Some(set_id);
        Ok(set)
    }

    pub fn set_id(&self) -> Option<SetId> {
        self.set_id
    }

    /// The volume of each snapshot, position for position
    ///
    /// A queried snapshot whose volume has no drive letter shows up as `None`.
    pub fn volume_names(&self) -> Vec<Option<&VolumeName>> {
        self.snapshots.iter().map(Snapshot::volume).collect()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn snapshots_mut(&mut self) -> &mut [Snapshot] {
        &mut self.snapshots
    }

    pub fn snapshot_mut(&mut self, id: SnapshotId) -> Option<&mut Snapshot> {
        self.snapshots.iter_mut().find(|s| s.id() == id)
    }

    /// Queried snapshots whose volume could not be mapped to a drive letter
    pub fn unresolved(&self) -> &[SnapshotId] {
        &self.unresolved
    }

    pub fn state(&self) -> SetState {
        self.state
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn context(&self) -> SnapshotContext {
        self.context
    }

    pub fn options(&self) -> &BackupOptions {
        &self.options
    }

    fn transition(&self, allowed: &[SetState], to: SetState) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            })
        }
    }

    fn require_mode(&self, allowed: &[OperationMode], operation: &str) -> Result<()> {
        if allowed.contains(&self.mode) {
            Ok(())
        } else {
            Err(Error::InvalidOperation {
                mode: self.mode,
                operation: operation.to_string(),
            })
        }
    }

    /// Snapshot the selected volumes as one set
    ///
    /// Every volume is checked for engine support before the set is started.
    /// On failure of any protocol step the staged set is aborted, nothing is
    /// recorded on `self`, and the error names the step.
    pub fn create(&mut self, selection: VolumeSelection) -> Result<()> {
        self.transition(&[SetState::Empty], SetState::Created)?;
        self.require_mode(&[OperationMode::Backup], "create")?;

        let volumes = match selection {
            VolumeSelection::Explicit(volumes) => volumes,
            VolumeSelection::FromSnapshots(records) => {
                resolve_volumes(self.host.volumes.as_ref(), &records)?
            }
        };
        if volumes.is_empty() {
            return Err(Error::InvalidArgument(
                "a snapshot set needs at least one volume".to_string(),
            ));
        }

        for volume in &volumes {
            if !self.session.engine().is_volume_supported(volume)? {
                return Err(Error::UnsupportedVolume(volume.clone()));
            }
        }

        self.session.claim(SessionUse::Create)?;
        let (set_id, snapshots) = match self.run_create_protocol(&volumes) {
            Ok(created) => created,
            Err((step, source)) => {
                warn!(%step, error = %source, "snapshot set creation failed, aborting");
                if let Err(e) = self.session.engine().abort_backup() {
                    warn!(error = %e, "abort after failed snapshot set creation also failed");
                }
                return Err(Error::Protocol { step, source });
            }
        };

        info!(
            %set_id,
            volumes = %volumes.iter().map(VolumeName::name).collect::<Vec<_>>().join(", "),
            "created snapshot set"
        );
        for snapshot in &snapshots {
            debug!(snapshot = %snapshot.id(), volume = ?snapshot.volume(), "snapshot in set");
        }

        self.set_id = Some(set_id);
        self.snapshots = snapshots;
        self.state = SetState::Created;
        Ok(())
    }

    fn run_create_protocol(
        &self,
        volumes: &[VolumeName],
    ) -> std::result::Result<(SetId, Vec<Snapshot>), (ProtocolStep, EngineError)> {
        let engine = self.session.engine();

        let set_id = engine
            .start_set()
            .map_err(|e| (ProtocolStep::StartSet, e))?;
        debug!(%set_id, "started snapshot set");

        let mut snapshots = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let snapshot_id = engine
                .add_to_set(volume)
                .map_err(|e| (ProtocolStep::AddToSet(volume.clone()), e))?;
            debug!(snapshot = %snapshot_id, %volume, "added volume to snapshot set");
            snapshots.push(Snapshot::staged(
                Rc::clone(&self.session),
                self.host.clone(),
                self.mode,
                set_id,
                snapshot_id,
                volume.clone(),
            ));
        }

        engine
            .set_backup_state(
                self.options.component_mode,
                self.options.system_state,
                self.options.backup_type,
                self.options.partial_file_support,
            )
            .map_err(|e| (ProtocolStep::SetBackupState, e))?;
        engine
            .prepare_for_backup()
            .map_err(|e| (ProtocolStep::PrepareForBackup, e))?;
        engine.commit_set().map_err(|e| (ProtocolStep::Commit, e))?;

        Ok((set_id, snapshots))
    }

    /// Rebuild this set from the engine's snapshots with `set_id`
    ///
    /// Returns `Ok(false)` when no snapshot matches, which usually means none
    /// exist under the provider's context.
    pub fn query(&mut self, set_id: SetId, resolution: Resolution) -> Result<bool> {
        self.transition(&[SetState::Empty], SetState::Queried)?;
        self.require_mode(&[OperationMode::Query], "query")?;
        self.session.claim(SessionUse::Query)?;

        let records = self.session.engine().query_snapshots()?;
        debug!(%set_id, reported = records.len(), "looking for snapshot set");
        let matching: Vec<&SnapshotRecord> =
            records.iter().filter(|r| r.set_id == set_id).collect();
        if matching.is_empty() {
            warn!(%set_id, context = %self.context, "no snapshots found for set; check the context");
            return Ok(false);
        }

        let devices = self.host.volumes.list_fixed_volumes(None)?;
        let mut snapshots = Vec::with_capacity(matching.len());
        let mut unresolved = Vec::new();

        for record in matching {
            let letter = devices
                .iter()
                .find(|(_, device)| device.matches(&record.original_volume))
                .map(|(letter, _)| *letter);
            let volume = match (letter, resolution) {
                (Some(letter), _) => Some(VolumeName::from_drive(letter)),
                (None, Resolution::Strict) => {
                    return Err(Error::VolumeNotResolved {
                        snapshot: record.snapshot_id,
                        device: record.original_volume.clone(),
                    })
                }
                (None, Resolution::Flag) => {
                    warn!(
                        snapshot = %record.snapshot_id,
                        device = %record.original_volume,
                        "snapshot volume is not mounted"
                    );
                    unresolved.push(record.snapshot_id);
                    None
                }
            };
            snapshots.push(Snapshot::from_record(
                Rc::clone(&self.session),
                self.host.clone(),
                self.mode,
                record,
                volume,
            ));
        }

        self.set_id = Some(set_id);
        self.snapshots = snapshots;
        self.unresolved = unresolved;
        self.state = SetState::Queried;
        Ok(true)
    }

    /// Delete every snapshot in the set
    ///
    /// `force` deletes even snapshots that are in use. Returns how many
    /// snapshots the engine removed; fewer than expected (including none) is
    /// not an error, they may already be gone.
    ///
    /// Deletion needs a session of its own. A set that was just created or
    /// queried has spent its session and fails with [`Error::SessionReused`];
    /// delete it through [`SnapshotSet::existing`] on a fresh provider.
    pub fn delete(&mut self, force: bool) -> Result<u32> {
        self.transition(
            &[SetState::Empty, SetState::Created, SetState::Queried],
            SetState::Deleted,
        )?;
        self.require_mode(
            &[OperationMode::Backup, OperationMode::Query, OperationMode::Delete],
            "delete",
        )?;
        let set_id = self.set_id.ok_or_else(|| {
            Error::InvalidArgument("no snapshot set id to delete".to_string())
        })?;
        self.session.claim(SessionUse::Delete)?;

        let deleted = match self.session.engine().delete_set(set_id, force) {
            Ok(count) => count,
            Err(EngineError::ObjectNotFound) => 0,
            Err(e) => return Err(Error::Engine(e)),
        };
        if (deleted as usize) < self.snapshots.len() || deleted == 0 {
            warn!(%set_id, deleted, expected = self.snapshots.len(), "fewer snapshots deleted than expected");
        } else {
            info!(%set_id, deleted, "deleted snapshot set");
        }

        self.snapshots.clear();
        self.state = SetState::Deleted;
        Ok(deleted)
    }
}

impl fmt::Debug for SnapshotSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotSet")
            .field("set_id", &self.set_id)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("context", &self.context)
            .field("snapshots", &self.snapshots)
            .field("unresolved", &self.unresolved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{FailPoint, MemoryEngine};
    use crate::volume::{LocalPaths, StaticVolumes};

    const C_DEVICE: &str = "\\\\?\\Volume{3f422e46-1e27-4436-872b-e2f2eea8102b}\\";
    const D_DEVICE: &str = "\\\\?\\Volume{3cbee176-7af0-4a8b-b498-44b51afbc3c7}\\";

    fn engine() -> MemoryEngine {
        MemoryEngine::new()
            .with_volume("C:\\", C_DEVICE)
            .with_volume("D:\\", D_DEVICE)
    }

    fn host() -> Host {
        let volumes = StaticVolumes::new()
            .with('C', C_DEVICE)
            .unwrap()
            .with('D', D_DEVICE)
            .unwrap();
        Host::new(volumes, LocalPaths)
    }

    fn provider(engine: &MemoryEngine, mode: OperationMode) -> Provider {
        Provider::new(engine, mode, SnapshotContext::APP_ROLLBACK, host()).unwrap()
    }

    fn explicit(names: &[&str]) -> VolumeSelection {
        VolumeSelection::Explicit(names.iter().map(|n| VolumeName::new(*n).unwrap()).collect())
    }

    #[test]
    fn create_issues_protocol_steps_in_order() {
        let engine = engine();
        let provider = provider(&engine, OperationMode::Backup);
        let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
        engine.clear_calls();

        set.create(explicit(&["C:\\", "D:\\"])).unwrap();

        assert_eq!(
            engine.calls(),
            vec![
                "is_volume_supported",
                "is_volume_supported",
                "start_set",
                "add_to_set",
                "add_to_set",
                "set_backup_state",
                "prepare_for_backup",
                "commit_set",
            ]
        );
        assert_eq!(set.state(), SetState::Created);
        assert!(set.set_id().is_some());
    }

    #[test]
    fn failed_step_aborts_and_names_the_step() {
        let cases = [
            (FailPoint::StartSet, ProtocolStep::StartSet),
            (
                FailPoint::AddToSet,
                ProtocolStep::AddToSet(VolumeName::new("C:\\").unwrap()),
            ),
            (FailPoint::SetBackupState, ProtocolStep::SetBackupState),
            (FailPoint::PrepareForBackup, ProtocolStep::PrepareForBackup),
            (FailPoint::Commit, ProtocolStep::Commit),
        ];
        for (point, expected) in cases {
            let engine = engine();
            let provider = provider(&engine, OperationMode::Backup);
            let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
            engine.fail_at(point, EngineError::BadState);

            let err = set.create(explicit(&["C:\\", "D:\\"])).unwrap_err();
            match err {
                Error::Protocol { step, source } => {
                    assert_eq!(step, expected);
                    assert_eq!(source, EngineError::BadState);
                }
                other => panic!("expected protocol error, got {:?}", other),
            }
            assert!(engine.calls().contains(&"abort_backup".to_string()));
            assert!(set.snapshots().is_empty());
            assert!(set.set_id().is_none());
            assert_eq!(set.state(), SetState::Empty);
            assert!(engine.snapshots().is_empty(), "{:?} left snapshots behind", point);
        }
    }

    #[test]
    fn unsupported_volume_fails_before_the_set_is_started() {
        let engine = engine();
        let provider = provider(&engine, OperationMode::Backup);
        let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();

        let err = set.create(explicit(&["C:\\", "Q:\\"])).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVolume(ref v) if v.name() == "Q:\\"));
        assert!(!engine.calls().contains(&"start_set".to_string()));
        assert_eq!(set.state(), SetState::Empty);
    }

    #[test]
    fn empty_volume_list_is_rejected() {
        let engine = engine();
        let provider = provider(&engine, OperationMode::Backup);
        let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
        assert!(matches!(
            set.create(VolumeSelection::Explicit(Vec::new())),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn a_set_is_created_only_once() {
        let engine = engine();
        let provider = provider(&engine, OperationMode::Backup);
        let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
        set.create(explicit(&["C:\\"])).unwrap();
        assert!(matches!(
            set.create(explicit(&["D:\\"])),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn create_needs_backup_mode_and_query_needs_query_mode() {
        let engine = engine();
        let query = provider(&engine, OperationMode::Query);
        let mut set = SnapshotSet::new(&query, BackupOptions::default()).unwrap();
        assert!(matches!(
            set.create(explicit(&["C:\\"])),
            Err(Error::InvalidOperation { mode: OperationMode::Query, .. })
        ));

        let backup = provider(&engine, OperationMode::Backup);
        let mut set = SnapshotSet::new(&backup, BackupOptions::default()).unwrap();
        let id = SetId::new(crate::types::ObjectId::new_random());
        assert!(matches!(
            set.query(id, Resolution::Strict),
            Err(Error::InvalidOperation { mode: OperationMode::Backup, .. })
        ));
    }

    #[test]
    fn query_with_no_match_leaves_the_set_empty() {
        let engine = engine();
        let provider = provider(&engine, OperationMode::Query);
        let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
        let id = SetId::new(crate::types::ObjectId::new_random());

        assert!(!set.query(id, Resolution::Strict).unwrap());
        assert_eq!(set.state(), SetState::Empty);
        assert!(set.snapshots().is_empty());
        assert!(set.set_id().is_none());
    }

    #[test]
    fn strict_query_fails_on_unmounted_volume() {
        let engine = engine();
        let id = SetId::new(crate::types::ObjectId::new_random());
        engine.seed_snapshot(id, "C:\\", SnapshotContext::APP_ROLLBACK);
        engine.seed_snapshot(id, "\\\\?\\Volume{gone}\\", SnapshotContext::APP_ROLLBACK);

        let provider = provider(&engine, OperationMode::Query);
        let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
        assert!(matches!(
            set.query(id, Resolution::Strict),
            Err(Error::VolumeNotResolved { .. })
        ));
    }

    #[test]
    fn restore_mode_cannot_delete() {
        let engine = engine();
        let provider = provider(&engine, OperationMode::Restore);
        let id = SetId::new(crate::types::ObjectId::new_random());
        let mut set = SnapshotSet::existing(&provider, id, BackupOptions::default()).unwrap();
        assert!(matches!(
            set.delete(false),
            Err(Error::InvalidOperation { mode: OperationMode::Restore, .. })
        ));
    }

    #[test]
    fn delete_needs_a_set_id() {
        let engine = engine();
        let provider = provider(&engine, OperationMode::Delete);
        let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
        assert!(matches!(set.delete(false), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn queried_set_cannot_delete_on_its_session() {
        let engine = engine();
        let id = SetId::new(crate::types::ObjectId::new_random());
        engine.seed_snapshot(id, "C:\\", SnapshotContext::APP_ROLLBACK);

        let provider = provider(&engine, OperationMode::Query);
        let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
        assert!(set.query(id, Resolution::Strict).unwrap());
        assert!(matches!(set.delete(true), Err(Error::SessionReused(_))));
        assert_eq!(set.state(), SetState::Queried);
        assert_eq!(engine.snapshots().len(), 1);
    }

    #[test]
    fn deleting_a_missing_set_reports_zero() {
        let engine = engine();
        let provider = provider(&engine, OperationMode::Delete);
        let id = SetId::new(crate::types::ObjectId::new_random());
        let mut set = SnapshotSet::existing(&provider, id, BackupOptions::default()).unwrap();
        assert_eq!(set.delete(false).unwrap(), 0);
        assert_eq!(set.state(), SetState::Deleted);
        assert!(matches!(
            set.delete(false),
            Err(Error::InvalidStateTransition { .. })
        ));
    }
}
