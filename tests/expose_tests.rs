//! Exposure Tests
//!
//! Exposing snapshots at drive letters, directories and shares, and the
//! soft failures the engine reports for conflicting requests.

mod common;

use common::{engine, paths, provider, vol, volumes, SharedPaths, EMPTY_DIR};
use shadow_set::{
    BackupOptions, Error, ExposeOutcome, Host, MemoryEngine, OperationMode, Provider, Resolution,
    SetId, SnapshotContext, SnapshotSet, VolumeSelection,
};
use std::cell::RefCell;
use std::rc::Rc;

const PERSISTENT: SnapshotContext = SnapshotContext::CLIENT_ACCESSIBLE;
const LOCAL: SnapshotContext = SnapshotContext::EXPOSED_LOCALLY;
const REMOTE: SnapshotContext = SnapshotContext::EXPOSED_REMOTELY;

fn created_set(engine: &MemoryEngine) -> SetId {
    let backup = provider(engine, OperationMode::Backup, PERSISTENT);
    let mut set = SnapshotSet::new(&backup, BackupOptions::default()).unwrap();
    set.create(VolumeSelection::Explicit(vec![vol("C:\\"), vol("D:\\")]))
        .unwrap();
    set.set_id().unwrap()
}

fn exposed_name(engine: &MemoryEngine, index: usize) -> Option<String> {
    engine.snapshots()[index].exposed_name.clone()
}

#[test]
fn test_expose_unexpose_then_expose_elsewhere() {
    let engine = engine();
    let set_id = created_set(&engine);
    let provider = provider(&engine, OperationMode::Query, PERSISTENT);
    let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
    assert!(set.query(set_id, Resolution::Strict).unwrap());
    let snapshot = &mut set.snapshots_mut()[0];

    // Drive letter
    let outcome = snapshot.expose("M:", LOCAL, None).unwrap();
    assert_eq!(outcome, ExposeOutcome::Exposed("M:".to_string()));
    assert_eq!(snapshot.exposed_path(), Some("M:"));
    assert_eq!(exposed_name(&engine, 0).as_deref(), Some("M:"));

    snapshot.unexpose().unwrap();
    assert!(!snapshot.is_exposed());
    assert_eq!(exposed_name(&engine, 0), None);

    // Empty directory, normalized with a trailing separator
    let outcome = snapshot.expose(EMPTY_DIR, LOCAL, None).unwrap();
    let expected = format!("{}\\", EMPTY_DIR);
    assert_eq!(outcome, ExposeOutcome::Exposed(expected.clone()));
    assert_eq!(snapshot.exposed_path(), Some(expected.as_str()));
}

#[test]
fn test_second_expose_is_refused_and_keeps_the_first() {
    let engine = engine();
    let set_id = created_set(&engine);
    let provider = provider(&engine, OperationMode::Query, PERSISTENT);
    let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
    assert!(set.query(set_id, Resolution::Strict).unwrap());
    let snapshot = &mut set.snapshots_mut()[0];

    snapshot.expose("M:", LOCAL, None).unwrap();
    let outcome = snapshot.expose("N:", LOCAL, None).unwrap();

    assert_eq!(outcome, ExposeOutcome::AlreadyExposed);
    assert!(!outcome.is_exposed());
    assert_eq!(snapshot.exposed_path(), Some("M:"));
    assert_eq!(exposed_name(&engine, 0).as_deref(), Some("M:"));
}

#[test]
fn test_reexposing_to_the_mounted_target_is_soft() {
    // GIVEN a host whose drive letters and directories reflect earlier exposures
    let engine = engine();
    let shared = SharedPaths(Rc::new(RefCell::new(paths())));
    let host = Host::new(volumes(&['C', 'D', 'E']), shared.clone());
    let backup = Provider::new(&engine, OperationMode::Backup, PERSISTENT, host).unwrap();
    let mut set = SnapshotSet::new(&backup, BackupOptions::default()).unwrap();
    set.create(VolumeSelection::Explicit(vec![vol("C:\\"), vol("D:\\")]))
        .unwrap();

    // WHEN each snapshot is exposed and its target becomes occupied
    let exposed_dir = format!("{}\\", EMPTY_DIR);
    assert_eq!(
        set.snapshots_mut()[0].expose("M:", LOCAL, None).unwrap(),
        ExposeOutcome::Exposed("M:".to_string())
    );
    shared.mount('M');
    assert_eq!(
        set.snapshots_mut()[1].expose(EMPTY_DIR, LOCAL, None).unwrap(),
        ExposeOutcome::Exposed(exposed_dir.clone())
    );
    shared.fill(EMPTY_DIR);
    engine.clear_calls();

    // THEN exposing them to the same targets again is refused softly
    assert_eq!(
        set.snapshots_mut()[0].expose("M:", LOCAL, None).unwrap(),
        ExposeOutcome::AlreadyExposed
    );
    assert_eq!(
        set.snapshots_mut()[1].expose(EMPTY_DIR, LOCAL, None).unwrap(),
        ExposeOutcome::AlreadyExposed
    );
    assert_eq!(set.snapshots()[0].exposed_path(), Some("M:"));
    assert_eq!(set.snapshots()[1].exposed_path(), Some(exposed_dir.as_str()));
    assert!(engine.calls().is_empty());
}

#[test]
fn test_queried_snapshot_knows_it_is_exposed() {
    // GIVEN a snapshot exposed by an earlier provider
    let engine = engine();
    let set_id = created_set(&engine);
    {
        let provider = provider(&engine, OperationMode::Query, PERSISTENT);
        let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
        set.query(set_id, Resolution::Strict).unwrap();
        set.snapshots_mut()[1].expose("snap-d", REMOTE, None).unwrap();
    }

    // WHEN it is queried again and exposed elsewhere
    let provider = provider(&engine, OperationMode::Query, PERSISTENT);
    let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
    set.query(set_id, Resolution::Strict).unwrap();
    let snapshot = &mut set.snapshots_mut()[1];
    assert_eq!(snapshot.exposed_path(), Some("snap-d"));

    // THEN the request is refused without touching the engine
    engine.clear_calls();
    assert_eq!(
        snapshot.expose("P:", LOCAL, None).unwrap(),
        ExposeOutcome::AlreadyExposed
    );
    assert!(engine.calls().is_empty());
}

#[test]
fn test_target_taken_by_another_snapshot_is_a_soft_failure() {
    let engine = engine();
    let set_id = created_set(&engine);
    let provider = provider(&engine, OperationMode::Query, PERSISTENT);
    let mut set = SnapshotSet::new(&provider, BackupOptions::default()).unwrap();
    set.query(set_id, Resolution::Strict).unwrap();

    set.snapshots_mut()[0].expose("M:", LOCAL, None).unwrap();
    let outcome = set.snapshots_mut()[1].expose("M:", LOCAL, None).unwrap();

    assert_eq!(outcome, ExposeOutcome::AlreadyExposed);
    assert!(!set.snapshots()[1].is_exposed());
    assert_eq!(set.snapshots()[0].exposed_path(), Some("M:"));
}

#[test]
fn test_deleted_snapshot_is_not_found() {
    let engine = engine();
    let backup = provider(&engine, OperationMode::Backup, PERSISTENT);
    let mut set = SnapshotSet::new(&backup, BackupOptions::default()).unwrap();
    set.create(VolumeSelection::Explicit(vec![vol("C:\\")])).unwrap();
    let set_id = set.set_id().unwrap();

    let delete = provider(&engine, OperationMode::Delete, PERSISTENT);
    let mut gone = SnapshotSet::existing(&delete, set_id, BackupOptions::default()).unwrap();
    assert_eq!(gone.delete(true).unwrap(), 1);

    let outcome = set.snapshots_mut()[0].expose("M:", LOCAL, None).unwrap();
    assert_eq!(outcome, ExposeOutcome::ObjectNotFound);
    assert!(outcome.reason().is_some());
}

#[test]
fn test_engine_choosing_another_path_is_fatal() {
    let engine = engine();
    let backup = provider(&engine, OperationMode::Backup, PERSISTENT);
    let mut set = SnapshotSet::new(&backup, BackupOptions::default()).unwrap();
    set.create(VolumeSelection::Explicit(vec![vol("C:\\")])).unwrap();
    engine.rewrite_exposed_paths("\\");

    let err = set.snapshots_mut()[0].expose("M:", LOCAL, None).unwrap_err();
    match err {
        Error::ExposeMismatch { requested, actual } => {
            assert_eq!(requested, "M:");
            assert_eq!(actual, "M:\\");
        }
        other => panic!("expected expose mismatch, got {:?}", other),
    }
    assert!(!set.snapshots()[0].is_exposed());
}

#[test]
fn test_remote_exposure_with_path_from_root() {
    let engine = engine();
    let backup = provider(&engine, OperationMode::Backup, PERSISTENT);
    let mut set = SnapshotSet::new(&backup, BackupOptions::default()).unwrap();
    set.create(VolumeSelection::Explicit(vec![vol("C:\\")])).unwrap();

    let outcome = set.snapshots_mut()[0]
        .expose("snapshot-c$", REMOTE, Some("\\Windows"))
        .unwrap();
    assert_eq!(outcome, ExposeOutcome::Exposed("snapshot-c$".to_string()));
    assert_eq!(engine.snapshots()[0].exposed_path.as_deref(), Some("\\Windows"));
}

#[test]
fn test_invalid_targets_never_reach_the_engine() {
    let engine = engine();
    let backup = provider(&engine, OperationMode::Backup, PERSISTENT);
    let mut set = SnapshotSet::new(&backup, BackupOptions::default()).unwrap();
    set.create(VolumeSelection::Explicit(vec![vol("C:\\")])).unwrap();
    let snapshot = &mut set.snapshots_mut()[0];
    engine.clear_calls();

    assert!(matches!(snapshot.expose("4:", LOCAL, None), Err(Error::InvalidDriveLetter(_))));
    assert!(matches!(snapshot.expose("D:", LOCAL, None), Err(Error::InvalidDriveLetter(_))));
    assert!(matches!(snapshot.expose("A$", LOCAL, None), Err(Error::InvalidPath { .. })));
    assert!(matches!(snapshot.expose("share:1", REMOTE, None), Err(Error::InvalidShareName(_))));
    assert!(matches!(
        snapshot.expose("M:", LOCAL, Some("\\Windows")),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        snapshot.expose("M:", LOCAL | REMOTE, None),
        Err(Error::InvalidArgument(_))
    ));
    assert!(engine.calls().is_empty());
}

#[test]
fn test_unexpose_failure_is_an_error() {
    let engine = engine();
    let backup = provider(&engine, OperationMode::Backup, PERSISTENT);
    let mut set = SnapshotSet::new(&backup, BackupOptions::default()).unwrap();
    set.create(VolumeSelection::Explicit(vec![vol("C:\\")])).unwrap();

    assert!(matches!(
        set.snapshots_mut()[0].unexpose(),
        Err(Error::Unexpose { .. })
    ));
}

#[test]
fn test_created_snapshot_resolves_its_volume() {
    let engine = engine();
    let backup = provider(&engine, OperationMode::Backup, PERSISTENT);
    let mut set = SnapshotSet::new(&backup, BackupOptions::default()).unwrap();
    set.create(VolumeSelection::Explicit(vec![vol("D:\\")])).unwrap();

    let snapshot = &mut set.snapshots_mut()[0];
    assert_eq!(snapshot.resolve_volume().unwrap(), &vol("D:\\"));
    assert!(snapshot.device_id().is_some());
}
