//! A single volume's shadow copy and its exposure

use crate::error::{EngineError, Error, Result};
use crate::provider::{Host, Session};
use crate::types::{
    DeviceId, DriveLetter, ExposeOutcome, Locality, OperationMode, SetId, SnapshotContext,
    SnapshotId, SnapshotRecord, VolumeName,
};
use crate::volume::{drive_for_device, DirectoryState, PathProbe};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info, warn};

const SEPARATOR: char = '\\';

/// One shadow copy, belonging to a snapshot set
///
/// A snapshot is exposed at no more than one place at a time. Exposures are
/// not removed when the value is dropped; call [`Snapshot::unexpose`] first.
pub struct Snapshot {
    id: SnapshotId,
    set_id: SetId,
    volume: Option<VolumeName>,
    device: Option<DeviceId>,
    exposed_path: Option<String>,
    mode: OperationMode,
    session: Rc<Session>,
    host: Host,
}

impl Snapshot {
    /// A snapshot just added to a set being created
    pub(crate) fn staged(
        session: Rc<Session>,
        host: Host,
        mode: OperationMode,
        set_id: SetId,
        id: SnapshotId,
        volume: VolumeName,
    ) -> Self {
        Self {
            id,
            set_id,
            volume: Some(volume),
            device: None,
            exposed_path: None,
            mode,
            session,
            host,
        }
    }

    /// A snapshot reconstructed from an engine query
    pub(crate) fn from_record(
        session: Rc<Session>,
        host: Host,
        mode: OperationMode,
        record: &SnapshotRecord,
        volume: Option<VolumeName>,
    ) -> Self {
        Self {
            id: record.snapshot_id,
            set_id: record.set_id,
            volume,
            device: Some(record.original_volume.clone()),
            exposed_path: record.exposed_name.clone(),
            mode,
            session,
            host,
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn set_id(&self) -> SetId {
        self.set_id
    }

    /// The originating volume, `None` while unresolved
    pub fn volume(&self) -> Option<&VolumeName> {
        self.volume.as_ref()
    }

    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    pub fn exposed_path(&self) -> Option<&str> {
        self.exposed_path.as_deref()
    }

    pub fn is_exposed(&self) -> bool {
        self.exposed_path.is_some()
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    fn require_expose_mode(&self, operation: &str) -> Result<()> {
        match self.mode {
            OperationMode::Backup | OperationMode::Query => Ok(()),
            OperationMode::Restore | OperationMode::Delete => Err(Error::InvalidOperation {
                mode: self.mode,
                operation: operation.to_string(),
            }),
        }
    }

    /// Expose the snapshot at a drive letter, an empty directory or a share
    ///
    /// `attributes` must carry exactly one of
    /// [`SnapshotContext::EXPOSED_LOCALLY`] / [`SnapshotContext::EXPOSED_REMOTELY`].
    /// `path_from_root` roots a share at a subdirectory and is refused for
    /// local exposure. Conflicts reported by the engine come back as a
    /// non-exposed [`ExposeOutcome`], and leave any existing exposure alone.
    pub fn expose(
        &mut self,
        target: &str,
        attributes: SnapshotContext,
        path_from_root: Option<&str>,
    ) -> Result<ExposeOutcome> {
        self.require_expose_mode("expose")?;
        // An exposed target is mounted or no longer empty, so check before validating it
        if let Some(current) = &self.exposed_path {
            warn!(snapshot = %self.id, %current, "snapshot is already exposed");
            return Ok(ExposeOutcome::AlreadyExposed);
        }

        let locality = Locality::from_attributes(attributes)?;
        let target = validate_expose_target(self.host.paths.as_ref(), target, locality, path_from_root)?;

        debug!(snapshot = %self.id, %target, %locality, "exposing snapshot");
        let outcome = match self
            .session
            .engine()
            .expose(self.id, path_from_root, attributes, &target)
        {
            Ok(actual) => actual,
            Err(EngineError::ObjectAlreadyExists) => return Ok(self.refused(ExposeOutcome::AlreadyExposed)),
            Err(EngineError::BadState) => return Ok(self.refused(ExposeOutcome::BadState)),
            Err(EngineError::ObjectNotFound) => return Ok(self.refused(ExposeOutcome::ObjectNotFound)),
            Err(e) => return Err(Error::Engine(e)),
        };

        if outcome != target {
            return Err(Error::ExposeMismatch {
                requested: target,
                actual: outcome,
            });
        }

        match (locality, path_from_root) {
            (Locality::Remote, Some(root)) => {
                info!(snapshot = %self.id, share = %outcome, path_from_root = root, "exposed snapshot remotely")
            }
            _ => info!(snapshot = %self.id, path = %outcome, "exposed snapshot {}", locality),
        }
        self.exposed_path = Some(outcome.clone());
        Ok(ExposeOutcome::Exposed(outcome))
    }

    fn refused(&self, outcome: ExposeOutcome) -> ExposeOutcome {
        warn!(
            snapshot = %self.id,
            reason = outcome.reason().unwrap_or_default(),
            "snapshot was not exposed"
        );
        outcome
    }

    /// Remove the snapshot's exposure
    ///
    /// Any engine failure is returned as an error, including unexposing a
    /// snapshot that is not exposed.
    pub fn unexpose(&mut self) -> Result<()> {
        self.require_expose_mode("unexpose")?;
        self.session
            .engine()
            .unexpose(self.id)
            .map_err(|source| Error::Unexpose {
                snapshot: self.id,
                source,
            })?;

        debug!(snapshot = %self.id, from = ?self.exposed_path, "unexposed snapshot");
        self.exposed_path = None;
        Ok(())
    }

    /// Look up this snapshot's drive letter from the device id the engine reports
    pub fn resolve_volume(&mut self) -> Result<&VolumeName> {
        let device = self
            .session
            .engine()
            .query_snapshots()?
            .into_iter()
            .find(|record| record.snapshot_id == self.id)
            .map(|record| record.original_volume)
            .ok_or(Error::VolumeResolutionFailed(self.id))?;

        let letter = drive_for_device(self.host.volumes.as_ref(), &device)?
            .ok_or(Error::VolumeResolutionFailed(self.id))?;

        self.device = Some(device);
        Ok(self.volume.insert(VolumeName::from_drive(letter)))
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("set_id", &self.set_id)
            .field("volume", &self.volume)
            .field("device", &self.device)
            .field("exposed_path", &self.exposed_path)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Check an expose target and return the exact string to hand to the engine
///
/// Local targets are a free drive spec (`R:` or `R:\`) or an existing empty
/// directory, which gets a trailing separator. Remote targets are share names
/// without colons or path separators (`snapshot-c$` is fine).
pub fn validate_expose_target(
    paths: &dyn PathProbe,
    target: &str,
    locality: Locality,
    path_from_root: Option<&str>,
) -> Result<String> {
    match locality {
        Locality::Remote => {
            if target.is_empty() || target.contains(&[':', '\\', '/'][..]) {
                return Err(Error::InvalidShareName(target.to_string()));
            }
            Ok(target.to_string())
        }
        Locality::Local => {
            if path_from_root.is_some() {
                return Err(Error::InvalidArgument(
                    "path_from_root only applies to remote exposure; a local exposure covers the whole snapshot"
                        .to_string(),
                ));
            }
            let chars: Vec<char> = target.chars().collect();
            let is_drive_spec = chars.len() == 2 || (chars.len() == 3 && chars[2] == SEPARATOR);
            if is_drive_spec {
                validate_drive_spec(paths, target, &chars)?;
                return Ok(target.to_string());
            }
            if chars.len() < 2 {
                return Err(Error::InvalidPath {
                    path: target.to_string(),
                    reason: "not a drive letter or directory".to_string(),
                });
            }

            let reason = match paths.directory_state(target)? {
                DirectoryState::Empty => None,
                DirectoryState::Missing => Some("directory does not exist"),
                DirectoryState::NotEmpty => Some("directory is not empty"),
                DirectoryState::NotADirectory => Some("not a directory"),
            };
            if let Some(reason) = reason {
                return Err(Error::InvalidPath {
                    path: target.to_string(),
                    reason: reason.to_string(),
                });
            }

            let mut normalized = target.to_string();
            if !normalized.ends_with(SEPARATOR) {
                normalized.push(SEPARATOR);
            }
            Ok(normalized)
        }
    }
}

fn validate_drive_spec(paths: &dyn PathProbe, target: &str, chars: &[char]) -> Result<()> {
    if !chars[0].is_ascii_alphabetic() {
        return Err(Error::InvalidDriveLetter(chars[0].to_string()));
    }
    if chars[1] != ':' {
        return Err(Error::InvalidPath {
            path: target.to_string(),
            reason: "a drive letter must be followed by a colon".to_string(),
        });
    }
    let letter = DriveLetter::new(chars[0])?;
    if paths.drive_mounted(letter) {
        return Err(Error::InvalidDriveLetter(format!("{} is already in use", letter)));
    }
    Ok(())
}
