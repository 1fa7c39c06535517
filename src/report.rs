//! Read-only summary for `pnl-guard status`.
use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::StoreError;
use crate::process::ProcessInspector;
use crate::state::{LaunchSpec, SessionLock, Slot, StateStore, StopRequest};
use crate::status::MonitorStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum Liveness {
    NotRecorded,
    Alive { pid: u32, started_at: DateTime<Utc> },
    /// Recorded, but the pid is gone or now belongs to another process.
    Dead { pid: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CredentialView {
    Missing,
    Unreadable(String),
    Present {
        expires_at: Option<DateTime<Utc>>,
        expired: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub monitor: Liveness,
    pub watchdog: Liveness,
    pub session_held: bool,
    pub session_lock: Option<SessionLock>,
    pub stop: Option<StopRequest>,
    pub launch: Option<LaunchSpec>,
    pub credential: CredentialView,
    pub status: Option<MonitorStatus>,
}

fn liveness(inspector: &impl ProcessInspector, recorded: Option<(u32, DateTime<Utc>)>) -> Liveness {
    match recorded {
        None => Liveness::NotRecorded,
        Some((pid, started_at)) if inspector.is_same_process(pid, started_at) => {
            Liveness::Alive { pid, started_at }
        }
        Some((pid, _)) => Liveness::Dead { pid },
    }
}

impl Report {
    pub fn gather<S: StateStore>(
        store: &S,
        inspector: &impl ProcessInspector,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let monitor = liveness(
            inspector,
            store.read_process_record()?.map(|r| (r.pid, r.started_at)),
        );
        let watchdog = liveness(
            inspector,
            store.read_watchdog_record()?.map(|r| (r.pid, r.started_at)),
        );
        let credential = match store.load_credential() {
            Ok(None) => CredentialView::Missing,
            Ok(Some(c)) => CredentialView::Present {
                expires_at: c.expires_at,
                expired: c.is_expired(now),
            },
            Err(e) => CredentialView::Unreadable(e.to_string()),
        };
        Ok(Self {
            monitor,
            watchdog,
            session_held: store.is_held(Slot::Session)?,
            session_lock: store.slot_owner(Slot::Session)?,
            stop: store.read_stop_request()?,
            launch: store.read_launch_spec()?,
            credential,
            status: store.read_status().unwrap_or(None),
        })
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::NotRecorded => write!(f, "not running"),
            Liveness::Alive { pid, started_at } => {
                write!(f, "alive (pid {pid}, started {})", started_at.format("%Y-%m-%d %H:%M:%S UTC"))
            }
            Liveness::Dead { pid } => write!(f, "DEAD (recorded pid {pid})"),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Monitor:     {}", self.monitor)?;
        writeln!(f, "Watchdog:    {}", self.watchdog)?;
        match (&self.session_lock, self.session_held) {
            (Some(lock), true) => writeln!(
                f,
                "Session:     held by pid {} since {}",
                lock.owner_pid,
                lock.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            )?,
            (_, true) => writeln!(f, "Session:     held")?,
            (Some(lock), false) => {
                writeln!(f, "Session:     stale (last holder pid {})", lock.owner_pid)?
            }
            (None, false) => writeln!(f, "Session:     free")?,
        }
        match &self.stop {
            Some(stop) => writeln!(
                f,
                "Stop:        requested {} by pid {}: {}",
                stop.requested_at.format("%Y-%m-%d %H:%M:%S UTC"),
                stop.requested_by_pid,
                stop.reason
            )?,
            None => writeln!(f, "Stop:        none")?,
        }
        match &self.launch {
            Some(spec) => writeln!(
                f,
                "Launch spec: {} every {}s ({}){}",
                spec.threshold,
                spec.threshold.check_interval_secs,
                spec.fingerprint,
                if spec.test_mode { " [test mode]" } else { "" }
            )?,
            None => writeln!(f, "Launch spec: none")?,
        }
        match &self.credential {
            CredentialView::Missing => writeln!(f, "Credential:  none cached")?,
            CredentialView::Unreadable(e) => writeln!(f, "Credential:  unreadable ({e})")?,
            CredentialView::Present { expires_at, expired } => {
                let expiry = expires_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let flag = if *expired { " EXPIRED" } else { "" };
                writeln!(f, "Credential:  expires {expiry}{flag}")?
            }
        }
        if let Some(status) = &self.status {
            write!(f, "Last cycle:  #{} {}", status.cycle, status.state)?;
            if let Some(sample) = &status.last_sample {
                write!(f, ", P/L {:.2}", sample.value)?;
            }
            if let Some(prox) = status.proximity {
                write!(f, " ({prox:?})")?;
            }
            if status.degraded {
                write!(
                    f,
                    " DEGRADED (auth failures {}, fetch failures {})",
                    status.auth_failures, status.fetch_failures
                )?;
            }
            writeln!(f, ", updated {}", status.last_update.format("%Y-%m-%d %H:%M:%S UTC"))?;
        } else {
            writeln!(f, "Last cycle:  none")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeProcesses;
    use crate::state::memory::MemoryStateStore;
    use crate::state::{ProcessRecord, WatchdogRecord};

    #[test]
    fn test_empty_store() {
        let store = MemoryStateStore::new();
        let report = Report::gather(&store, &FakeProcesses::new(), Utc::now()).unwrap();
        assert_eq!(report.monitor, Liveness::NotRecorded);
        assert_eq!(report.credential, CredentialView::Missing);
        let text = report.to_string();
        assert!(text.contains("Monitor:     not running"));
        assert!(text.contains("Session:     free"));
        assert!(text.contains("Last cycle:  none"));
    }

    #[test]
    fn test_alive_and_dead_records() {
        let store = MemoryStateStore::new();
        let processes = FakeProcesses::new();
        let started = Utc::now();
        processes.spawn(10, started);
        store
            .write_process_record(&ProcessRecord {
                pid: 10,
                started_at: started,
                config_fingerprint: "fp".to_string(),
            })
            .unwrap();
        store
            .write_watchdog_record(&WatchdogRecord {
                pid: 11,
                started_at: started,
            })
            .unwrap();
        store.try_acquire(Slot::Session, 10).unwrap();

        let report = Report::gather(&store, &processes, Utc::now()).unwrap();
        assert!(matches!(report.monitor, Liveness::Alive { pid: 10, .. }));
        assert_eq!(report.watchdog, Liveness::Dead { pid: 11 });
        let text = report.to_string();
        assert!(text.contains("DEAD (recorded pid 11)"));
        assert!(text.contains("held by pid 10"));
    }
}
