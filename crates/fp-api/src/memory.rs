//! Memory-pressure probe backed by the cgroup filesystem.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use fp_config::HealthConfig;

#[derive(Error, Debug)]
pub enum MemoryError {
    /// No cgroup memory accounting, or no limit set.
    #[error("memory accounting not supported")]
    NotSupported,

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid value in {path}: {value:?}")]
    Parse { path: String, value: String },
}

pub trait MemoryGetter: Send + Sync {
    fn used_bytes(&self) -> Result<u64, MemoryError>;

    fn total_bytes(&self) -> Result<u64, MemoryError>;
}

/// Reads usage and limit from cgroup v1 (`memory/memory.usage_in_bytes`,
/// `memory/memory.limit_in_bytes`) or, failing that, cgroup v2
/// (`memory.current`, `memory.max`).
#[derive(Debug, Clone)]
pub struct CgroupMemoryGetter {
    root: PathBuf,
}

impl CgroupMemoryGetter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_first(&self, candidates: [&str; 2]) -> Result<u64, MemoryError> {
        for relative in candidates {
            let path = self.root.join(relative);
            match read_value(&path)? {
                Some(value) => return Ok(value),
                None => continue,
            }
        }
        Err(MemoryError::NotSupported)
    }
}

impl Default for CgroupMemoryGetter {
    fn default() -> Self {
        Self::new("/sys/fs/cgroup")
    }
}

impl MemoryGetter for CgroupMemoryGetter {
    fn used_bytes(&self) -> Result<u64, MemoryError> {
        self.read_first(["memory/memory.usage_in_bytes", "memory.current"])
    }

    fn total_bytes(&self) -> Result<u64, MemoryError> {
        self.read_first(["memory/memory.limit_in_bytes", "memory.max"])
    }
}

/// `Ok(None)` when the file does not exist. cgroup v2 writes `max` for an
/// unlimited group, which is reported as unsupported.
fn read_value(path: &Path) -> Result<Option<u64>, MemoryError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(MemoryError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };

    let value = raw.trim();
    if value == "max" {
        return Err(MemoryError::NotSupported);
    }
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|_| MemoryError::Parse {
            path: path.display().to_string(),
            value: value.to_string(),
        })
}

/// True once usage reaches `threshold_percent` of the limit, compared in
/// whole megabytes. A disabled check or an unsupported platform is never
/// low on memory; any other read failure is returned.
pub fn is_in_low_memory(
    getter: &dyn MemoryGetter,
    enabled: bool,
    threshold_percent: u8,
) -> Result<bool, MemoryError> {
    if !enabled {
        return Ok(false);
    }

    let total = match getter.total_bytes() {
        Ok(total) => total,
        Err(MemoryError::NotSupported) => return Ok(false),
        Err(e) => return Err(e),
    };
    let total_mb = total / 1024 / 1024;
    let threshold_mb = total_mb.saturating_mul(u64::from(threshold_percent)) / 100;

    let used_mb = getter.used_bytes()? / 1024 / 1024;
    Ok(used_mb >= threshold_mb)
}

/// The memory part of the health check.
#[derive(Clone)]
pub struct MemoryCheck {
    getter: Arc<dyn MemoryGetter>,
    enabled: bool,
    threshold_percent: u8,
}

impl MemoryCheck {
    pub fn new(getter: Arc<dyn MemoryGetter>, enabled: bool, threshold_percent: u8) -> Self {
        Self {
            getter,
            enabled,
            threshold_percent,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(CgroupMemoryGetter::default()), false, 100)
    }

    pub fn is_low(&self) -> Result<bool, MemoryError> {
        is_in_low_memory(self.getter.as_ref(), self.enabled, self.threshold_percent)
    }
}

impl From<&HealthConfig> for MemoryCheck {
    fn from(config: &HealthConfig) -> Self {
        Self::new(
            Arc::new(CgroupMemoryGetter::new(&config.cgroup_root)),
            config.memory_check_enabled,
            config.memory_threshold_percent,
        )
    }
}
