use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use super::types::MonitorState;

/// Durable storage for [`MonitorState`]
pub trait StateStore: Send + Sync {
    /// Load the record; a missing record is an empty state
    fn load(&self) -> Result<MonitorState>;

    /// Replace the record atomically
    fn save(&self, state: &MonitorState) -> Result<()>;
}

/// JSON file store
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<MonitorState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(MonitorState::default())
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read state file: {:?}", self.path))
            }
        };

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {:?}", self.path))
    }

    fn save(&self, state: &MonitorState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
        let temp_path = self.path.with_extension("tmp");

        // Leftover from a crashed write
        let _ = fs::remove_file(&temp_path);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp state file: {:?}", temp_path))?;

        file.write_all(json.as_bytes())
            .with_context(|| format!("Failed to write temp state file: {:?}", temp_path))?;

        file.sync_all()
            .with_context(|| format!("Failed to sync temp state file: {:?}", temp_path))?;

        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename state file: {:?}", self.path))?;

        Ok(())
    }
}

/// In-memory store for tests and dry runs
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<MonitorState>>,
    writes: Mutex<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MonitorState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            writes: Mutex::new(0),
        }
    }

    /// Last saved (or seeded) record
    pub fn snapshot(&self) -> Option<MonitorState> {
        *self.state.lock()
    }

    /// Number of `save` calls so far
    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<MonitorState> {
        Ok(self.state.lock().unwrap_or_default())
    }

    fn save(&self, state: &MonitorState) -> Result<()> {
        *self.state.lock() = Some(*state);
        *self.writes.lock() += 1;
        Ok(())
    }
}
