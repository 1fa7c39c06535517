use std::path::{Path, PathBuf};

use crate::state::Slot;

/// Manages the state directory layout (default `~/.pnl-guard/`).
///
/// Everything the monitor and the watchdog share lives under one root.
/// This struct provides accessors for each well-known path and handles initialization.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The default root: `~/.pnl-guard`, or `.pnl-guard` when no home directory exists.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(".pnl-guard"))
            .unwrap_or_else(|| PathBuf::from(".pnl-guard"))
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the monitor's ProcessRecord.
    pub fn process_record(&self) -> PathBuf {
        self.root.join("monitor.json")
    }

    /// Path to the cached brokerage credential.
    pub fn credential(&self) -> PathBuf {
        self.root.join("credential.json")
    }

    /// Path to the authoritative launch configuration.
    pub fn launch_spec(&self) -> PathBuf {
        self.root.join("launch.json")
    }

    /// Path to the watchdog's identity record.
    pub fn watchdog_record(&self) -> PathBuf {
        self.root.join("watchdog.json")
    }

    /// Path to the stop marker written by the gated stop command.
    pub fn stop_request(&self) -> PathBuf {
        self.root.join("stop-request.json")
    }

    /// Path to the monitor status snapshot.
    pub fn status(&self) -> PathBuf {
        self.root.join("status.json")
    }

    /// Path to the advisory lock file backing a slot.
    pub fn slot_lock(&self, slot: Slot) -> PathBuf {
        self.root.join(format!("{}.lock", slot.name()))
    }

    /// Path to the metadata written by a slot's holder.
    pub fn slot_meta(&self, slot: Slot) -> PathBuf {
        self.root.join(format!("{}-lock.json", slot.name()))
    }

    /// Path to the log directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Initialize the directory structure.
    /// Returns Ok(true) if the root was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(created)
    }
}
