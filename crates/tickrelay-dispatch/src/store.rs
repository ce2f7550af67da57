//! Optional persistence of the degraded-service state across restarts.

use crate::degraded::DegradedServiceState;
use crate::error::{DispatchError, DispatchResult};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Loads and saves `DegradedServiceState`.
pub trait GuardStateStore: Send + Sync {
    fn load(&self) -> DispatchResult<Option<DegradedServiceState>>;
    fn save(&self, state: &DegradedServiceState) -> DispatchResult<()>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<DegradedServiceState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GuardStateStore for MemoryStateStore {
    fn load(&self) -> DispatchResult<Option<DegradedServiceState>> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &DegradedServiceState) -> DispatchResult<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

/// Single JSON document on disk.
///
/// Writes go to a sibling `.tmp` file that is then renamed over the target,
/// so a crash mid-write leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl GuardStateStore for JsonFileStateStore {
    fn load(&self) -> DispatchResult<Option<DegradedServiceState>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved guard state");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let state: DegradedServiceState = serde_json::from_str(&text).map_err(|e| {
            DispatchError::Store(format!("corrupt state file {}: {e}", self.path.display()))
        })?;
        info!(
            path = %self.path.display(),
            attempts = state.connection_attempts,
            paused = state.paused,
            "Loaded guard state"
        );
        Ok(Some(state))
    }

    fn save(&self, state: &DegradedServiceState) -> DispatchResult<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let tmp = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, state)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
