//! Volume Shadow Copy Service engine (Windows only)

use super::{EngineResult, EngineSession, SessionFactory, ShadowCopyEngine};
use crate::config::EngineConfig;
use crate::error::{EngineError, FactoryFailure};
use crate::types::{
    BackupType, DeviceId, ObjectId, SetId, SnapshotContext, SnapshotId, SnapshotRecord,
    VolumeName,
};
use tracing::{debug, warn};
use uuid::Uuid;
use windows::core::{Interface, BOOL, BSTR, GUID, HRESULT, HSTRING, PWSTR};
use windows::Win32::Storage::Vss::{
    CreateVssBackupComponentsInternal, IVssAsync, IVssBackupComponents, IVssBackupComponentsEx2,
    VssFreeSnapshotPropertiesInternal, VSS_BACKUP_TYPE, VSS_E_BAD_STATE,
    VSS_E_OBJECT_ALREADY_EXISTS, VSS_E_OBJECT_NOT_FOUND, VSS_E_VOLUME_NOT_SUPPORTED,
    VSS_E_VOLUME_NOT_SUPPORTED_BY_PROVIDER, VSS_OBJECT_NONE, VSS_OBJECT_PROP, VSS_OBJECT_SNAPSHOT,
    VSS_OBJECT_SNAPSHOT_SET, VSS_SNAPSHOT_PROP,
};
use windows::Win32::System::Com::{
    CoInitializeEx, CoTaskMemFree, COINIT_MULTITHREADED, RPC_E_CHANGED_MODE,
};
use windows::Win32::System::LibraryLoader::SetDllDirectoryW;

const WAIT_INFINITE: u32 = u32::MAX;
const E_MOD_NOT_FOUND: HRESULT = HRESULT(0x8007_007Eu32 as i32);
const E_BAD_EXE_FORMAT: HRESULT = HRESULT(0x8007_00C1u32 as i32);
const E_SNAPSHOT_IN_USE: HRESULT = HRESULT(0x8004_230Au32 as i32);

/// The default VSS software provider, driven through `vssapi.dll`
#[derive(Debug, Clone)]
pub struct WindowsEngine {
    config: EngineConfig,
}

impl WindowsEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

fn guid(id: ObjectId) -> GUID {
    GUID::from_u128(id.as_uuid().as_u128())
}

fn object_id(guid: GUID) -> ObjectId {
    ObjectId::from_uuid(Uuid::from_u128(guid.to_u128()))
}

fn engine_error(err: windows::core::Error) -> EngineError {
    hresult_error(err.code(), err.message())
}

fn hresult_error(code: HRESULT, message: String) -> EngineError {
    match code {
        VSS_E_OBJECT_ALREADY_EXISTS => EngineError::ObjectAlreadyExists,
        VSS_E_OBJECT_NOT_FOUND => EngineError::ObjectNotFound,
        VSS_E_BAD_STATE => EngineError::BadState,
        E_SNAPSHOT_IN_USE => EngineError::InUse,
        VSS_E_VOLUME_NOT_SUPPORTED | VSS_E_VOLUME_NOT_SUPPORTED_BY_PROVIDER => {
            EngineError::VolumeNotSupported(message)
        }
        _ => EngineError::Failed {
            code: code.0 as u32,
            message,
        },
    }
}

fn factory_error(err: windows::core::Error) -> EngineError {
    let failure = match err.code() {
        E_MOD_NOT_FOUND => FactoryFailure::MissingDependency(err.message()),
        E_BAD_EXE_FORMAT => FactoryFailure::IncompatibleBinary(err.message()),
        _ => FactoryFailure::Other(err.message()),
    };
    EngineError::Factory(failure)
}

/// Block on an async VSS job and surface its final status
fn wait(job: windows::core::Result<IVssAsync>) -> EngineResult<()> {
    let job = job.map_err(engine_error)?;
    unsafe { job.Wait(WAIT_INFINITE) }.map_err(engine_error)?;
    let mut status = HRESULT(0);
    unsafe { job.QueryStatus(&mut status, std::ptr::null_mut()) }.map_err(engine_error)?;
    if status.is_err() {
        return Err(hresult_error(status, windows::core::Error::from(status).message()));
    }
    Ok(())
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

unsafe fn read_wide(p: *mut u16) -> Option<String> {
    if p.is_null() {
        None
    } else {
        PWSTR(p).to_string().ok()
    }
}

impl ShadowCopyEngine for WindowsEngine {
    fn default_provider(&self) -> EngineResult<Box<dyn SessionFactory>> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        // An apartment set up by the host program is fine
        if hr.is_err() && hr != RPC_E_CHANGED_MODE {
            return Err(EngineError::Unavailable(format!(
                "COM initialization failed: {}",
                windows::core::Error::from(hr).message()
            )));
        }
        if let Some(dir) = &self.config.native_library_dir {
            let dir = HSTRING::from(dir.as_os_str());
            unsafe { SetDllDirectoryW(&dir) }
                .map_err(|e| EngineError::Unavailable(format!("native library directory: {}", e)))?;
        }
        Ok(Box::new(WindowsFactory {
            config: self.config.clone(),
        }))
    }
}

struct WindowsFactory {
    config: EngineConfig,
}

impl SessionFactory for WindowsFactory {
    fn create_session(&self) -> EngineResult<Box<dyn EngineSession>> {
        if self.config.is_wow64() {
            return Err(EngineError::Factory(FactoryFailure::IncompatibleBinary(format!(
                "a {} process cannot use the shadow copy service of a {} host",
                self.config.process_arch, self.config.host_arch
            ))));
        }
        let backup = unsafe { CreateVssBackupComponentsInternal() }.map_err(factory_error)?;
        debug!("created VSS backup components");
        Ok(Box::new(WindowsSession { backup }))
    }
}

/// Snapshot attributes as reported, with undefined bits dropped
fn attributes_context(raw: i32) -> SnapshotContext {
    let bits = raw as u32;
    let known = bits & SnapshotContext::ALL_KNOWN.bits();
    if known != bits {
        warn!(attributes = bits, "dropping undefined snapshot attribute bits");
    }
    match SnapshotContext::from_bits(known) {
        Ok(context) => context,
        Err(e) => {
            warn!(attributes = bits, error = %e, "unreadable snapshot attributes, recording as backup context");
            SnapshotContext::BACKUP
        }
    }
}

struct WindowsSession {
    backup: IVssBackupComponents,
}

impl WindowsSession {
    fn record(prop: &VSS_SNAPSHOT_PROP) -> SnapshotRecord {
        SnapshotRecord {
            snapshot_id: SnapshotId::new(object_id(prop.m_SnapshotId)),
            set_id: SetId::new(object_id(prop.m_SnapshotSetId)),
            original_volume: DeviceId::new(
                unsafe { read_wide(prop.m_pwszOriginalVolumeName) }.unwrap_or_default(),
            ),
            context: attributes_context(prop.m_lSnapshotAttributes),
            exposed_name: unsafe { read_wide(prop.m_pwszExposedName) },
            exposed_path: unsafe { read_wide(prop.m_pwszExposedPath) },
        }
    }
}

impl EngineSession for WindowsSession {
    fn initialize_for_backup(&self) -> EngineResult<()> {
        unsafe { self.backup.InitializeForBackup(&BSTR::new()) }.map_err(engine_error)
    }

    fn initialize_for_restore(&self) -> EngineResult<()> {
        unsafe { self.backup.InitializeForRestore(&BSTR::new()) }.map_err(engine_error)
    }

    fn set_context(&self, context: SnapshotContext) -> EngineResult<()> {
        unsafe { self.backup.SetContext(context.engine_value()) }.map_err(engine_error)
    }

    fn gather_writer_metadata(&self) -> EngineResult<()> {
        wait(unsafe { self.backup.GatherWriterMetadata() })
    }

    fn is_volume_supported(&self, volume: &VolumeName) -> EngineResult<bool> {
        let mut name = wide(volume.name());
        let mut supported = BOOL(0);
        unsafe {
            self.backup
                .IsVolumeSupported(GUID::zeroed(), PWSTR(name.as_mut_ptr()), &mut supported)
        }
        .map_err(engine_error)?;
        Ok(supported.as_bool())
    }

    fn start_set(&self) -> EngineResult<SetId> {
        let id = unsafe { self.backup.StartSnapshotSet() }.map_err(engine_error)?;
        Ok(SetId::new(object_id(id)))
    }

    fn add_to_set(&self, volume: &VolumeName) -> EngineResult<SnapshotId> {
        let mut name = wide(volume.name());
        let id = unsafe {
            self.backup
                .AddToSnapshotSet(PWSTR(name.as_mut_ptr()), GUID::zeroed())
        }
        .map_err(engine_error)?;
        Ok(SnapshotId::new(object_id(id)))
    }

    fn set_backup_state(
        &self,
        component_mode: bool,
        system_state: bool,
        backup_type: BackupType,
        partial_file_support: bool,
    ) -> EngineResult<()> {
        unsafe {
            self.backup.SetBackupState(
                component_mode,
                system_state,
                VSS_BACKUP_TYPE(backup_type.as_i32()),
                partial_file_support,
            )
        }
        .map_err(engine_error)
    }

    fn prepare_for_backup(&self) -> EngineResult<()> {
        wait(unsafe { self.backup.PrepareForBackup() })
    }

    fn commit_set(&self) -> EngineResult<()> {
        wait(unsafe { self.backup.DoSnapshotSet() })
    }

    fn abort_backup(&self) -> EngineResult<()> {
        unsafe { self.backup.AbortBackup() }.map_err(engine_error)
    }

    fn query_snapshots(&self) -> EngineResult<Vec<SnapshotRecord>> {
        let objects = match unsafe {
            self.backup
                .Query(GUID::zeroed(), VSS_OBJECT_NONE, VSS_OBJECT_SNAPSHOT)
        } {
            Ok(objects) => objects,
            Err(e) if e.code() == VSS_E_OBJECT_NOT_FOUND => return Ok(Vec::new()),
            Err(e) => return Err(engine_error(e)),
        };

        let mut records = Vec::new();
        loop {
            let mut props = [VSS_OBJECT_PROP::default()];
            let mut fetched = 0u32;
            let hr = unsafe { objects.Next(&mut props, &mut fetched) };
            if hr.is_err() {
                return Err(hresult_error(hr, windows::core::Error::from(hr).message()));
            }
            if fetched == 0 {
                break;
            }
            let snap = unsafe { props[0].Obj.Snap };
            records.push(Self::record(&snap));
            unsafe { VssFreeSnapshotPropertiesInternal(&snap) };
        }
        debug!(count = records.len(), "queried snapshots");
        Ok(records)
    }

    fn expose(
        &self,
        snapshot: SnapshotId,
        path_from_root: Option<&str>,
        attributes: SnapshotContext,
        target: &str,
    ) -> EngineResult<String> {
        let mut root = path_from_root.map(wide);
        let root_ptr = root
            .as_mut()
            .map_or(PWSTR::null(), |r| PWSTR(r.as_mut_ptr()));
        let mut expose = wide(target);
        let exposed = unsafe {
            self.backup.ExposeSnapshot(
                guid(snapshot.id()),
                root_ptr,
                attributes.engine_value(),
                PWSTR(expose.as_mut_ptr()),
            )
        }
        .map_err(engine_error)?;

        let actual = unsafe { read_wide(exposed.0) };
        unsafe { CoTaskMemFree(Some(exposed.0 as *const _)) };
        actual.ok_or_else(|| EngineError::Failed {
            code: 0,
            message: "engine returned no exposed name".to_string(),
        })
    }

    fn unexpose(&self, snapshot: SnapshotId) -> EngineResult<()> {
        let ex2: IVssBackupComponentsEx2 = self.backup.cast().map_err(engine_error)?;
        unsafe { ex2.UnexposeSnapshot(guid(snapshot.id())) }.map_err(engine_error)
    }

    fn delete_set(&self, set: SetId, force: bool) -> EngineResult<u32> {
        let mut deleted = 0i32;
        let mut not_deleted = GUID::zeroed();
        unsafe {
            self.backup.DeleteSnapshots(
                guid(set.id()),
                VSS_OBJECT_SNAPSHOT_SET,
                force,
                &mut deleted,
                &mut not_deleted,
            )
        }
        .map_err(|e| {
            if not_deleted != GUID::zeroed() {
                warn!(snapshot = %object_id(not_deleted), "snapshot could not be deleted");
            }
            engine_error(e)
        })?;
        Ok(deleted.max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_conversion_keeps_the_identifier() {
        let id = ObjectId::parse("3f422e46-1e27-4436-872b-e2f2eea8102b").unwrap();
        assert_eq!(object_id(guid(id)), id);
    }

    #[test]
    fn conflict_codes_map_to_engine_errors() {
        assert_eq!(
            hresult_error(VSS_E_OBJECT_ALREADY_EXISTS, String::new()),
            EngineError::ObjectAlreadyExists
        );
        assert_eq!(hresult_error(VSS_E_BAD_STATE, String::new()), EngineError::BadState);
        assert_eq!(
            hresult_error(VSS_E_OBJECT_NOT_FOUND, String::new()),
            EngineError::ObjectNotFound
        );
        assert!(matches!(
            hresult_error(HRESULT(0x8000_4005u32 as i32), "unspecified".to_string()),
            EngineError::Failed { code: 0x8000_4005, .. }
        ));
    }

    #[test]
    fn reported_attributes_keep_only_defined_flags() {
        let exposed = (SnapshotContext::APP_ROLLBACK | SnapshotContext::EXPOSED_LOCALLY).bits();
        assert_eq!(
            attributes_context(exposed as i32),
            SnapshotContext::APP_ROLLBACK | SnapshotContext::EXPOSED_LOCALLY
        );
        assert_eq!(attributes_context(-1), SnapshotContext::ALL_KNOWN);
        assert_eq!(attributes_context(0x0000_0100), SnapshotContext::BACKUP);
    }

    #[test]
    fn wow64_process_is_an_incompatible_binary() {
        let config = EngineConfig {
            process_arch: crate::config::Architecture::X86,
            host_arch: crate::config::Architecture::X64,
            ..EngineConfig::default()
        };
        let factory = WindowsFactory { config };
        assert!(matches!(
            factory.create_session(),
            Err(EngineError::Factory(FactoryFailure::IncompatibleBinary(_)))
        ));
    }
}
