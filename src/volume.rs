//! Volume directory: drive letter <-> device id mapping, and expose-target probing

use crate::error::{Error, Result};
use crate::types::{DeviceId, DriveLetter, SnapshotRecord, VolumeName};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Mapping of drive letters to the device ids of fixed volumes
pub type DeviceMap = BTreeMap<DriveLetter, DeviceId>;

/// Read-only view of the mounted fixed volumes
///
/// Answers reflect live OS state; two calls may disagree if a volume is
/// mounted or dismounted in between, and a miss is a legitimate answer.
pub trait VolumeDirectory {
    /// List fixed volumes, optionally only the one with the given letter
    fn list_fixed_volumes(&self, filter: Option<DriveLetter>) -> Result<DeviceMap>;
}

/// Drive letter of the volume with this device id, if one is mounted
pub fn drive_for_device(
    directory: &dyn VolumeDirectory,
    device: &DeviceId,
) -> Result<Option<DriveLetter>> {
    let found = directory
        .list_fixed_volumes(None)?
        .into_iter()
        .find(|(_, id)| id.matches(device))
        .map(|(letter, _)| letter);

    if let Some(letter) = found {
        debug!(%letter, %device, "found drive letter for device id");
    }
    Ok(found)
}

/// Resolve the originating volume of every snapshot record
///
/// Fails with [`Error::VolumeResolutionMismatch`] unless exactly one volume is
/// found per record.
pub fn resolve_volumes(
    directory: &dyn VolumeDirectory,
    records: &[SnapshotRecord],
) -> Result<Vec<VolumeName>> {
    let map = directory.list_fixed_volumes(None)?;
    let mut volumes = Vec::with_capacity(records.len());
    let mut resolved = 0usize;

    for record in records {
        let mut hits = map
            .iter()
            .filter(|(_, id)| id.matches(&record.original_volume))
            .map(|(letter, _)| *letter);

        if let (Some(letter), None) = (hits.next(), hits.next()) {
            resolved += 1;
            debug!(%letter, device = %record.original_volume, "resolved snapshot volume");
            volumes.push(VolumeName::from_drive(letter));
        }
    }

    if resolved != records.len() {
        return Err(Error::VolumeResolutionMismatch {
            snapshots: records.len(),
            resolved,
        });
    }
    Ok(volumes)
}

/// A fixed mapping, for hosts whose volumes are known up front
#[derive(Debug, Clone, Default)]
pub struct StaticVolumes {
    volumes: DeviceMap,
}

impl StaticVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, letter: char, device: impl Into<String>) -> Result<Self> {
        self.insert(DriveLetter::new(letter)?, DeviceId::new(device));
        Ok(self)
    }

    pub fn insert(&mut self, letter: DriveLetter, device: DeviceId) {
        self.volumes.insert(letter, device);
    }

    /// Simulate a dismount
    pub fn remove(&mut self, letter: DriveLetter) -> Option<DeviceId> {
        self.volumes.remove(&letter)
    }
}

impl VolumeDirectory for StaticVolumes {
    fn list_fixed_volumes(&self, filter: Option<DriveLetter>) -> Result<DeviceMap> {
        Ok(self
            .volumes
            .iter()
            .filter(|(letter, _)| filter.map_or(true, |f| f == **letter))
            .map(|(letter, id)| (*letter, id.clone()))
            .collect())
    }
}

/// What an expose target path currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    Missing,
    Empty,
    NotEmpty,
    NotADirectory,
}

/// Filesystem checks run before a local exposure
pub trait PathProbe {
    /// Whether a drive with this letter is currently mounted (any device class)
    fn drive_mounted(&self, letter: DriveLetter) -> bool;

    fn directory_state(&self, path: &str) -> Result<DirectoryState>;
}

/// [`PathProbe`] backed by the real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPaths;

impl PathProbe for LocalPaths {
    fn drive_mounted(&self, letter: DriveLetter) -> bool {
        Path::new(&letter.root()).exists()
    }

    fn directory_state(&self, path: &str) -> Result<DirectoryState> {
        let path = Path::new(path);
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DirectoryState::Missing)
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Ok(DirectoryState::NotADirectory);
        }
        if fs::read_dir(path)?.next().is_some() {
            Ok(DirectoryState::NotEmpty)
        } else {
            Ok(DirectoryState::Empty)
        }
    }
}

#[cfg(windows)]
pub use fixed::FixedVolumes;

#[cfg(windows)]
mod fixed {
    use super::{DeviceMap, VolumeDirectory};
    use crate::error::Result;
    use crate::types::{DeviceId, DriveLetter};
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::{
        FindFirstVolumeW, FindNextVolumeW, FindVolumeClose, GetDriveTypeW,
        GetVolumePathNamesForVolumeNameW,
    };

    const MAX_VOLUME_NAME: usize = 50;
    const DRIVE_FIXED: u32 = 3;

    /// Fixed volumes enumerated through the volume management API
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FixedVolumes;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn from_wide(buf: &[u16]) -> String {
        let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        String::from_utf16_lossy(&buf[..end])
    }

    /// Mount paths of a volume, e.g. `["C:\\"]`
    fn path_names(volume: &[u16]) -> Vec<String> {
        let mut buf = vec![0u16; 261];
        let mut needed = 0u32;
        let ok = unsafe {
            GetVolumePathNamesForVolumeNameW(
                PCWSTR(volume.as_ptr()),
                Some(&mut buf),
                &mut needed,
            )
        };
        if ok.is_err() && needed as usize > buf.len() {
            buf = vec![0u16; needed as usize];
            if unsafe {
                GetVolumePathNamesForVolumeNameW(PCWSTR(volume.as_ptr()), Some(&mut buf), &mut needed)
            }
            .is_err()
            {
                return Vec::new();
            }
        }
        buf.split(|&c| c == 0)
            .filter(|s| !s.is_empty())
            .map(String::from_utf16_lossy)
            .collect()
    }

    impl VolumeDirectory for FixedVolumes {
        fn list_fixed_volumes(&self, filter: Option<DriveLetter>) -> Result<DeviceMap> {
            let mut volumes = DeviceMap::new();
            let mut name = [0u16; MAX_VOLUME_NAME];
            let handle = unsafe { FindFirstVolumeW(&mut name) }
                .map_err(|e| crate::error::Error::Other(format!("FindFirstVolumeW: {}", e)))?;

            loop {
                let device = from_wide(&name);
                let device_w = wide(&device);
                if unsafe { GetDriveTypeW(PCWSTR(device_w.as_ptr())) } == DRIVE_FIXED {
                    for path in path_names(&device_w) {
                        let bytes = path.as_bytes();
                        if bytes.len() != 3 || bytes[1] != b':' {
                            continue;
                        }
                        if let Ok(letter) = DriveLetter::new(bytes[0] as char) {
                            if filter.map_or(true, |f| f == letter) {
                                volumes.entry(letter).or_insert_with(|| DeviceId::new(device.clone()));
                            }
                        }
                    }
                }

                name = [0u16; MAX_VOLUME_NAME];
                if unsafe { FindNextVolumeW(handle, &mut name) }.is_err() {
                    break;
                }
            }

            let _ = unsafe { FindVolumeClose(handle) };
            Ok(volumes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SetId, SnapshotContext, SnapshotId};

    const C_DEVICE: &str = "\\\\?\\Volume{3f422e46-1e27-4436-872b-e2f2eea8102b}\\";
    const D_DEVICE: &str = "\\\\?\\Volume{3cbee176-7af0-4a8b-b498-44b51afbc3c7}\\";

    fn directory() -> StaticVolumes {
        StaticVolumes::new()
            .with('c', C_DEVICE)
            .unwrap()
            .with('D', D_DEVICE)
            .unwrap()
    }

    fn record(device: &str) -> SnapshotRecord {
        SnapshotRecord {
            snapshot_id: SnapshotId::parse("61eb9eea-9578-4c9e-b3ef-a2c4269bedd9").unwrap(),
            set_id: SetId::parse("0a8d4f25-2b1f-4b4f-9d1e-6ad1f0c1a001").unwrap(),
            original_volume: DeviceId::new(device),
            context: SnapshotContext::BACKUP,
            exposed_name: None,
            exposed_path: None,
        }
    }

    #[test]
    fn filter_returns_single_letter() {
        let dir = directory();
        let only_d = dir
            .list_fixed_volumes(Some(DriveLetter::new('d').unwrap()))
            .unwrap();
        assert_eq!(only_d.len(), 1);
        assert_eq!(only_d.values().next().unwrap().as_str(), D_DEVICE);
    }

    #[test]
    fn device_lookup_ignores_case() {
        let dir = directory();
        let letter = drive_for_device(&dir, &DeviceId::new(C_DEVICE.to_uppercase())).unwrap();
        assert_eq!(letter, Some(DriveLetter::new('C').unwrap()));
        assert_eq!(drive_for_device(&dir, &DeviceId::new("\\\\?\\Volume{nope}\\")).unwrap(), None);
    }

    #[test]
    fn resolves_one_volume_per_record_in_order() {
        let dir = directory();
        let volumes = resolve_volumes(&dir, &[record(D_DEVICE), record(C_DEVICE)]).unwrap();
        assert_eq!(volumes, vec![VolumeName::new("D:\\").unwrap(), VolumeName::new("C:\\").unwrap()]);
    }

    #[test]
    fn unmounted_volume_is_a_count_mismatch() {
        let mut dir = directory();
        dir.remove(DriveLetter::new('D').unwrap());
        let err = resolve_volumes(&dir, &[record(C_DEVICE), record(D_DEVICE)]).unwrap_err();
        assert!(matches!(
            err,
            Error::VolumeResolutionMismatch { snapshots: 2, resolved: 1 }
        ));
    }

    #[test]
    fn local_paths_report_directory_state() {
        let dir = tempfile::tempdir().unwrap();
        let probe = LocalPaths;
        let root = dir.path().to_str().unwrap().to_string();
        assert_eq!(probe.directory_state(&root).unwrap(), DirectoryState::Empty);

        let file = dir.path().join("file.txt");
        fs::write(&file, b"x").unwrap();
        assert_eq!(probe.directory_state(&root).unwrap(), DirectoryState::NotEmpty);
        assert_eq!(
            probe.directory_state(file.to_str().unwrap()).unwrap(),
            DirectoryState::NotADirectory
        );
        assert_eq!(
            probe
                .directory_state(dir.path().join("missing").to_str().unwrap())
                .unwrap(),
            DirectoryState::Missing
        );
    }
}
