//! State store shared by the monitor, the watchdog and the operator CLI.
//!
//! The two supervised processes share no memory; every piece of coordination
//! goes through this interface. The file-backed implementation replaces each
//! record atomically (temp file + rename) and backs the single-instance slots
//! with advisory file locks, which the kernel drops when the holder dies.
//! Tests swap in the in-memory fake.

mod fs;
#[cfg(test)]
pub mod memory;
pub mod types;

pub use fs::FsStateStore;
pub use types::{
    CachedCredential, LaunchSpec, ProcessRecord, Secret, SessionLock, StopRequest, WatchdogRecord,
};

use crate::error::StoreError;
use crate::status::MonitorStatus;

/// A single-instance slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The session lock: at most one active monitor.
    Session,
    /// At most one watchdog.
    Watchdog,
}

impl Slot {
    pub fn name(&self) -> &'static str {
        match self {
            Slot::Session => "session",
            Slot::Watchdog => "watchdog",
        }
    }
}

/// Outcome of trying to claim a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Acquired,
    /// Someone alive holds the slot; `owner_pid` comes from its metadata if readable.
    Held { owner_pid: Option<u32> },
}

pub trait StateStore {
    // Single-instance slots
    fn try_acquire(&self, slot: Slot, owner_pid: u32) -> Result<Claim, StoreError>;
    fn release(&self, slot: Slot) -> Result<(), StoreError>;
    /// True while a live process (this one included) holds the slot.
    fn is_held(&self, slot: Slot) -> Result<bool, StoreError>;
    fn slot_owner(&self, slot: Slot) -> Result<Option<SessionLock>, StoreError>;
    /// Drop metadata left behind by a dead holder. Returns true if anything was reclaimed.
    fn reclaim_stale(&self, slot: Slot) -> Result<bool, StoreError>;

    // Monitor identity
    fn write_process_record(&self, record: &ProcessRecord) -> Result<(), StoreError>;
    fn read_process_record(&self) -> Result<Option<ProcessRecord>, StoreError>;
    fn clear_process_record(&self) -> Result<(), StoreError>;

    // Credential cache
    fn load_credential(&self) -> Result<Option<CachedCredential>, StoreError>;
    fn save_credential(&self, credential: &CachedCredential) -> Result<(), StoreError>;

    // Launch configuration
    fn read_launch_spec(&self) -> Result<Option<LaunchSpec>, StoreError>;
    fn write_launch_spec(&self, spec: &LaunchSpec) -> Result<(), StoreError>;

    // Watchdog identity
    fn read_watchdog_record(&self) -> Result<Option<WatchdogRecord>, StoreError>;
    fn write_watchdog_record(&self, record: &WatchdogRecord) -> Result<(), StoreError>;
    fn clear_watchdog_record(&self) -> Result<(), StoreError>;

    // Gated stop marker
    fn read_stop_request(&self) -> Result<Option<StopRequest>, StoreError>;
    fn write_stop_request(&self, request: &StopRequest) -> Result<(), StoreError>;
    fn clear_stop_request(&self) -> Result<(), StoreError>;

    // Monitor status snapshot
    fn write_status(&self, status: &MonitorStatus) -> Result<(), StoreError>;
    fn read_status(&self) -> Result<Option<MonitorStatus>, StoreError>;
}
