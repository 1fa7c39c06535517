//! In-memory `StateStore` for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use super::{
    CachedCredential, Claim, LaunchSpec, ProcessRecord, SessionLock, Slot, StateStore,
    StopRequest, WatchdogRecord,
};
use crate::error::StoreError;
use crate::status::MonitorStatus;

#[derive(Default)]
struct Inner {
    /// Slots whose holder is alive.
    held: HashSet<Slot>,
    meta: HashMap<Slot, SessionLock>,
    process: Option<ProcessRecord>,
    credential: Option<CachedCredential>,
    launch: Option<LaunchSpec>,
    watchdog: Option<WatchdogRecord>,
    stop: Option<StopRequest>,
    status: Option<MonitorStatus>,
    status_history: Vec<MonitorStatus>,
}

/// Shared by every component in a test the way the state directory is shared
/// by real processes. Wrap in an `Arc` to hand out to several owners.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Simulate the holder of `slot` dying: the lock drops, its metadata stays.
    pub fn crash(&self, slot: Slot) {
        self.inner().held.remove(&slot);
    }

    /// Every status snapshot written so far, oldest first.
    pub fn status_history(&self) -> Vec<MonitorStatus> {
        self.inner().status_history.clone()
    }
}

impl StateStore for MemoryStateStore {
    fn try_acquire(&self, slot: Slot, owner_pid: u32) -> Result<Claim, StoreError> {
        let mut inner = self.inner();
        if inner.held.contains(&slot) {
            let owner_pid = inner.meta.get(&slot).map(|m| m.owner_pid);
            return Ok(Claim::Held { owner_pid });
        }
        inner.held.insert(slot);
        inner.meta.insert(
            slot,
            SessionLock {
                acquired_at: Utc::now(),
                owner_pid,
            },
        );
        Ok(Claim::Acquired)
    }

    fn release(&self, slot: Slot) -> Result<(), StoreError> {
        let mut inner = self.inner();
        if inner.held.remove(&slot) {
            inner.meta.remove(&slot);
        }
        Ok(())
    }

    fn is_held(&self, slot: Slot) -> Result<bool, StoreError> {
        Ok(self.inner().held.contains(&slot))
    }

    fn slot_owner(&self, slot: Slot) -> Result<Option<SessionLock>, StoreError> {
        Ok(self.inner().meta.get(&slot).cloned())
    }

    fn reclaim_stale(&self, slot: Slot) -> Result<bool, StoreError> {
        let mut inner = self.inner();
        if inner.held.contains(&slot) {
            return Ok(false);
        }
        Ok(inner.meta.remove(&slot).is_some())
    }

    fn write_process_record(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        self.inner().process = Some(record.clone());
        Ok(())
    }

    fn read_process_record(&self) -> Result<Option<ProcessRecord>, StoreError> {
        Ok(self.inner().process.clone())
    }

    fn clear_process_record(&self) -> Result<(), StoreError> {
        self.inner().process = None;
        Ok(())
    }

    fn load_credential(&self) -> Result<Option<CachedCredential>, StoreError> {
        Ok(self.inner().credential.clone())
    }

    fn save_credential(&self, credential: &CachedCredential) -> Result<(), StoreError> {
        self.inner().credential = Some(credential.clone());
        Ok(())
    }

    fn read_launch_spec(&self) -> Result<Option<LaunchSpec>, StoreError> {
        Ok(self.inner().launch.clone())
    }

    fn write_launch_spec(&self, spec: &LaunchSpec) -> Result<(), StoreError> {
        self.inner().launch = Some(spec.clone());
        Ok(())
    }

    fn read_watchdog_record(&self) -> Result<Option<WatchdogRecord>, StoreError> {
        Ok(self.inner().watchdog.clone())
    }

    fn write_watchdog_record(&self, record: &WatchdogRecord) -> Result<(), StoreError> {
        self.inner().watchdog = Some(record.clone());
        Ok(())
    }

    fn clear_watchdog_record(&self) -> Result<(), StoreError> {
        self.inner().watchdog = None;
        Ok(())
    }

    fn read_stop_request(&self) -> Result<Option<StopRequest>, StoreError> {
        Ok(self.inner().stop.clone())
    }

    fn write_stop_request(&self, request: &StopRequest) -> Result<(), StoreError> {
        self.inner().stop = Some(request.clone());
        Ok(())
    }

    fn clear_stop_request(&self) -> Result<(), StoreError> {
        self.inner().stop = None;
        Ok(())
    }

    fn write_status(&self, status: &MonitorStatus) -> Result<(), StoreError> {
        let mut inner = self.inner();
        inner.status = Some(status.clone());
        inner.status_history.push(status.clone());
        Ok(())
    }

    fn read_status(&self) -> Result<Option<MonitorStatus>, StoreError> {
        Ok(self.inner().status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_leaves_stale_metadata() {
        let store = MemoryStateStore::new();
        assert_eq!(store.try_acquire(Slot::Session, 9).unwrap(), Claim::Acquired);
        assert_eq!(
            store.try_acquire(Slot::Session, 10).unwrap(),
            Claim::Held { owner_pid: Some(9) }
        );
        store.crash(Slot::Session);
        assert!(!store.is_held(Slot::Session).unwrap());
        assert!(store.slot_owner(Slot::Session).unwrap().is_some());
        assert!(store.reclaim_stale(Slot::Session).unwrap());
        assert_eq!(store.try_acquire(Slot::Session, 10).unwrap(), Claim::Acquired);
    }
}
