use chrono::Utc;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{
    CachedCredential, Claim, LaunchSpec, ProcessRecord, SessionLock, Slot, StateStore,
    StopRequest, WatchdogRecord,
};
use crate::data_dir::DataDir;
use crate::error::StoreError;
use crate::status::MonitorStatus;

/// `is_held` and `reclaim_stale` take the lock for a moment to test it, so a
/// contended claim is retried this many times before it is reported as held.
const CLAIM_ATTEMPTS: u32 = 10;
const CLAIM_RETRY: Duration = Duration::from_millis(10);

/// File-backed state store.
///
/// Records are JSON files replaced by writing a temp file in the same directory
/// and renaming it over the target, so a concurrent reader sees either the old
/// or the new record, never a partial one. Temp files are created 0600, which
/// covers the credential cache.
pub struct FsStateStore {
    dir: DataDir,
    held: Mutex<HashMap<Slot, File>>,
}

impl FsStateStore {
    pub fn new(dir: DataDir) -> Self {
        Self {
            dir,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<Slot, File>> {
        // A poisoned map still holds valid file handles.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_root(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(self.dir.root()).map_err(|e| StoreError::Io {
            path: self.dir.root().to_path_buf(),
            source: e,
        })
    }

    fn open_lock_file(&self, slot: Slot) -> Result<File, StoreError> {
        self.ensure_root()?;
        let path = self.dir.slot_lock(slot);
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::Io { path, source: e })
    }

    /// Try the advisory lock. `Ok(None)` means another open file description holds it.
    fn try_lock(&self, slot: Slot) -> Result<Option<File>, StoreError> {
        let file = self.open_lock_file(slot)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(StoreError::Io {
                path: self.dir.slot_lock(slot),
                source: e,
            }),
        }
    }

    fn claim_lock(&self, slot: Slot) -> Result<Option<File>, StoreError> {
        for attempt in 1..=CLAIM_ATTEMPTS {
            if let Some(file) = self.try_lock(slot)? {
                return Ok(Some(file));
            }
            if attempt < CLAIM_ATTEMPTS {
                std::thread::sleep(CLAIM_RETRY);
            }
        }
        Ok(None)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        self.ensure_root()?;
        atomic_write_json(path, value)
    }
}

impl StateStore for FsStateStore {
    fn try_acquire(&self, slot: Slot, owner_pid: u32) -> Result<Claim, StoreError> {
        let mut held = self.held();
        if held.contains_key(&slot) {
            return Ok(Claim::Acquired);
        }

        let Some(file) = self.claim_lock(slot)? else {
            let owner_pid = read_json::<SessionLock>(&self.dir.slot_meta(slot))
                .ok()
                .flatten()
                .map(|meta| meta.owner_pid);
            return Ok(Claim::Held { owner_pid });
        };

        let meta = SessionLock {
            acquired_at: Utc::now(),
            owner_pid,
        };
        if let Err(e) = self.write_json(&self.dir.slot_meta(slot), &meta) {
            let _ = file.unlock();
            return Err(e);
        }
        held.insert(slot, file);
        tracing::debug!(slot = slot.name(), owner_pid, "slot acquired");
        Ok(Claim::Acquired)
    }

    fn release(&self, slot: Slot) -> Result<(), StoreError> {
        let Some(file) = self.held().remove(&slot) else {
            return Ok(());
        };
        // Metadata goes first: once unlocked, a new holder may write its own.
        let removed = remove_if_exists(&self.dir.slot_meta(slot));
        let _ = file.unlock();
        removed
    }

    fn is_held(&self, slot: Slot) -> Result<bool, StoreError> {
        if self.held().contains_key(&slot) {
            return Ok(true);
        }
        if !self.dir.slot_lock(slot).exists() {
            return Ok(false);
        }
        match self.try_lock(slot)? {
            Some(file) => {
                let _ = file.unlock();
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn slot_owner(&self, slot: Slot) -> Result<Option<SessionLock>, StoreError> {
        read_json(&self.dir.slot_meta(slot))
    }

    fn reclaim_stale(&self, slot: Slot) -> Result<bool, StoreError> {
        if self.held().contains_key(&slot) {
            return Ok(false);
        }
        let meta_path = self.dir.slot_meta(slot);
        if !meta_path.exists() {
            return Ok(false);
        }
        // Hold the lock while removing so a monitor starting right now cannot
        // have its fresh metadata deleted.
        let Some(file) = self.try_lock(slot)? else {
            return Ok(false);
        };
        let removed = remove_if_exists(&meta_path);
        let _ = file.unlock();
        removed.map(|_| true)
    }

    fn write_process_record(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        self.write_json(&self.dir.process_record(), record)
    }

    fn read_process_record(&self) -> Result<Option<ProcessRecord>, StoreError> {
        read_json(&self.dir.process_record())
    }

    fn clear_process_record(&self) -> Result<(), StoreError> {
        remove_if_exists(&self.dir.process_record())
    }

    fn load_credential(&self) -> Result<Option<CachedCredential>, StoreError> {
        read_json(&self.dir.credential())
    }

    fn save_credential(&self, credential: &CachedCredential) -> Result<(), StoreError> {
        self.write_json(&self.dir.credential(), credential)
    }

    fn read_launch_spec(&self) -> Result<Option<LaunchSpec>, StoreError> {
        read_json(&self.dir.launch_spec())
    }

    fn write_launch_spec(&self, spec: &LaunchSpec) -> Result<(), StoreError> {
        self.write_json(&self.dir.launch_spec(), spec)
    }

    fn read_watchdog_record(&self) -> Result<Option<WatchdogRecord>, StoreError> {
        read_json(&self.dir.watchdog_record())
    }

    fn write_watchdog_record(&self, record: &WatchdogRecord) -> Result<(), StoreError> {
        self.write_json(&self.dir.watchdog_record(), record)
    }

    fn clear_watchdog_record(&self) -> Result<(), StoreError> {
        remove_if_exists(&self.dir.watchdog_record())
    }

    fn read_stop_request(&self) -> Result<Option<StopRequest>, StoreError> {
        read_json(&self.dir.stop_request())
    }

    fn write_stop_request(&self, request: &StopRequest) -> Result<(), StoreError> {
        self.write_json(&self.dir.stop_request(), request)
    }

    fn clear_stop_request(&self) -> Result<(), StoreError> {
        remove_if_exists(&self.dir.stop_request())
    }

    fn write_status(&self, status: &MonitorStatus) -> Result<(), StoreError> {
        self.write_json(&self.dir.status(), status)
    }

    fn read_status(&self) -> Result<Option<MonitorStatus>, StoreError> {
        read_json(&self.dir.status())
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Write `value` as JSON to a temp file next to `path`, fsync it, then rename it over `path`.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(StoreError::Serialize)?;
    let dir = path.parent().unwrap_or(Path::new("."));

    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&json).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| StoreError::Persist {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
