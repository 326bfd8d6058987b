use shadow_set::engine::MemoryEngine;
use shadow_set::volume::{DirectoryState, PathProbe, StaticVolumes};
use shadow_set::{
    DriveLetter, Host, OperationMode, Provider, Result, SnapshotContext, VolumeName,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

pub const C_DEVICE: &str = "\\\\?\\Volume{3f422e46-1e27-4436-872b-e2f2eea8102b}\\";
pub const D_DEVICE: &str = "\\\\?\\Volume{3cbee176-7af0-4a8b-b498-44b51afbc3c7}\\";
pub const E_DEVICE: &str = "\\\\?\\Volume{9a1d58e0-55b8-4c7e-a7a4-0f6b8d5c2e11}\\";

pub const EMPTY_DIR: &str = "C:\\temp\\existing_empty_dir";

/// Path probe with a fixed set of mounted letters and directories
#[derive(Debug, Clone, Default)]
pub struct FakePaths {
    pub mounted: HashSet<char>,
    pub dirs: HashMap<String, DirectoryState>,
}

impl PathProbe for FakePaths {
    fn drive_mounted(&self, letter: DriveLetter) -> bool {
        self.mounted.contains(&letter.as_char())
    }

    fn directory_state(&self, path: &str) -> Result<DirectoryState> {
        Ok(self
            .dirs
            .get(path.trim_end_matches('\\'))
            .copied()
            .unwrap_or(DirectoryState::Missing))
    }
}

/// Path probe whose state a test can change after handing it to a host
#[derive(Debug, Clone, Default)]
pub struct SharedPaths(pub Rc<RefCell<FakePaths>>);

#[allow(dead_code)]
impl SharedPaths {
    pub fn mount(&self, letter: char) {
        self.0.borrow_mut().mounted.insert(letter);
    }

    pub fn fill(&self, dir: &str) {
        self.0
            .borrow_mut()
            .dirs
            .insert(dir.to_string(), DirectoryState::NotEmpty);
    }
}

impl PathProbe for SharedPaths {
    fn drive_mounted(&self, letter: DriveLetter) -> bool {
        self.0.borrow().drive_mounted(letter)
    }

    fn directory_state(&self, path: &str) -> Result<DirectoryState> {
        self.0.borrow().directory_state(path)
    }
}

/// Engine that can snapshot C:, D: and E:
pub fn engine() -> MemoryEngine {
    MemoryEngine::new()
        .with_volume("C:\\", C_DEVICE)
        .with_volume("D:\\", D_DEVICE)
        .with_volume("E:\\", E_DEVICE)
}

/// Volume directory with the given letters mounted
#[allow(dead_code)]
pub fn volumes(letters: &[char]) -> StaticVolumes {
    let mut volumes = StaticVolumes::new();
    for letter in letters {
        let device = match letter {
            'C' => C_DEVICE,
            'D' => D_DEVICE,
            'E' => E_DEVICE,
            _ => continue,
        };
        volumes = volumes.with(*letter, device).unwrap();
    }
    volumes
}

#[allow(dead_code)]
pub fn paths() -> FakePaths {
    let mut paths = FakePaths::default();
    paths.mounted.extend(['C', 'D', 'E']);
    paths.dirs.insert(EMPTY_DIR.to_string(), DirectoryState::Empty);
    paths
}

/// Host where C:, D: and E: are mounted
#[allow(dead_code)]
pub fn host() -> Host {
    Host::new(volumes(&['C', 'D', 'E']), paths())
}

#[allow(dead_code)]
pub fn provider(engine: &MemoryEngine, mode: OperationMode, context: SnapshotContext) -> Provider {
    Provider::new(engine, mode, context, host()).unwrap()
}

#[allow(dead_code)]
pub fn vol(name: &str) -> VolumeName {
    VolumeName::new(name).unwrap()
}
