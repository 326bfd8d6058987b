//! Process bootstrap configuration
//!
//! Everything environment-dependent (architecture detection, where the native
//! shadow copy library lives, defaults for the CLI) is resolved once here and
//! passed down as an [`EngineConfig`].

use crate::error::{Error, Result};
use crate::types::SnapshotContext;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable overriding the default snapshot context
pub const CONTEXT_ENV: &str = "SHADOW_SET_CONTEXT";

/// Drive letters tried, in order, when auto-exposing snapshots.
/// The low letters are left alone since they are usually taken.
pub const DEFAULT_EXPOSE_LETTERS: &str = "MNOPQRSTUVWXYZ";

/// CPU architecture as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86,
    X64,
    Arm64,
    Unknown,
}

impl Architecture {
    /// The architecture this binary was compiled for
    pub fn current() -> Self {
        if cfg!(target_arch = "x86_64") {
            Architecture::X64
        } else if cfg!(target_arch = "x86") {
            Architecture::X86
        } else if cfg!(target_arch = "aarch64") {
            Architecture::Arm64
        } else {
            Architecture::Unknown
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "x86"),
            Architecture::X64 => write!(f, "x64"),
            Architecture::Arm64 => write!(f, "arm64"),
            Architecture::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for Architecture {
    type Err = Error;

    /// Accepts both `PROCESSOR_ARCHITECTURE` values and short names
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "x86" => Ok(Architecture::X86),
            "amd64" | "x64" => Ok(Architecture::X64),
            "arm64" => Ok(Architecture::Arm64),
            _ => Err(Error::Config(format!("Unknown processor architecture '{}'", s))),
        }
    }
}

/// On-disk configuration file, every key optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    native_library_dir: Option<PathBuf>,
    context: Option<String>,
    expose_letters: Option<String>,
}

/// Bootstrap configuration injected into the engine and the CLI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Architecture of this process
    pub process_arch: Architecture,
    /// Architecture of the host OS
    pub host_arch: Architecture,
    /// Extra directory searched for the native shadow copy library
    pub native_library_dir: Option<PathBuf>,
    /// Default context for new providers
    pub context: SnapshotContext,
    /// Drive-letter pool for auto-exposure
    pub expose_letters: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_arch: Architecture::current(),
            host_arch: Architecture::current(),
            native_library_dir: None,
            context: SnapshotContext::BACKUP,
            expose_letters: DEFAULT_EXPOSE_LETTERS.to_string(),
        }
    }
}

impl EngineConfig {
    /// Resolve the configuration from an optional file and the process environment
    pub fn resolve(file: Option<&Path>) -> Result<Self> {
        Self::resolve_with(file, |key| std::env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup
    pub fn resolve_with<F>(file: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();

        if let Some(path) = file {
            let content = fs::read_to_string(path)?;
            let parsed: FileConfig = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            config.apply_file(parsed)?;
        }

        // A WOW64 process sees its own bitness in PROCESSOR_ARCHITECTURE and
        // the host's in PROCESSOR_ARCHITEW6432.
        if let Some(arch) = env("PROCESSOR_ARCHITECTURE") {
            config.process_arch = arch.parse()?;
            config.host_arch = config.process_arch;
        }
        if let Some(arch) = env("PROCESSOR_ARCHITEW6432") {
            config.host_arch = arch.parse()?;
        }
        if let Some(ctx) = env(CONTEXT_ENV) {
            config.context = ctx.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        if let Some(dir) = file.native_library_dir {
            self.native_library_dir = Some(dir);
        }
        if let Some(ctx) = file.context {
            self.context = ctx.parse()?;
        }
        if let Some(letters) = file.expose_letters {
            self.expose_letters = letters.to_uppercase();
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if let Some(bad) = self.expose_letters.chars().find(|c| !c.is_ascii_alphabetic()) {
            return Err(Error::Config(format!(
                "expose_letters may only contain drive letters, found '{}'",
                bad
            )));
        }
        Ok(())
    }

    /// A 32-bit process on a 64-bit host cannot drive the native engine
    pub fn is_wow64(&self) -> bool {
        self.process_arch != self.host_arch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn detects_wow64_from_environment() {
        let config = EngineConfig::resolve_with(
            None,
            env_of(&[("PROCESSOR_ARCHITECTURE", "x86"), ("PROCESSOR_ARCHITEW6432", "AMD64")]),
        )
        .unwrap();
        assert_eq!(config.process_arch, Architecture::X86);
        assert_eq!(config.host_arch, Architecture::X64);
        assert!(config.is_wow64());
    }

    #[test]
    fn native_process_is_not_wow64() {
        let config =
            EngineConfig::resolve_with(None, env_of(&[("PROCESSOR_ARCHITECTURE", "AMD64")])).unwrap();
        assert!(!config.is_wow64());
    }

    #[test]
    fn file_then_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "native_library_dir = 'C:\\vss'\ncontext = 'app-rollback'\nexpose_letters = 'xyz'"
        )
        .unwrap();

        let config = EngineConfig::resolve_with(Some(file.path()), env_of(&[])).unwrap();
        assert_eq!(config.context, SnapshotContext::APP_ROLLBACK);
        assert_eq!(config.expose_letters, "XYZ");
        assert_eq!(config.native_library_dir, Some(PathBuf::from("C:\\vss")));

        let config = EngineConfig::resolve_with(
            Some(file.path()),
            env_of(&[(CONTEXT_ENV, "nas-rollback")]),
        )
        .unwrap();
        assert_eq!(config.context, SnapshotContext::NAS_ROLLBACK);
    }

    #[test]
    fn reserved_context_in_environment_is_rejected() {
        let err = EngineConfig::resolve_with(None, env_of(&[(CONTEXT_ENV, "0xffffffff")])).unwrap_err();
        assert!(matches!(err, Error::ReservedContext));
    }

    #[test]
    fn bad_expose_letters_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "expose_letters = 'M1'").unwrap();
        let err = EngineConfig::resolve_with(Some(file.path()), env_of(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
