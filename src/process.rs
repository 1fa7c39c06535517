//! Process inspection: existence, zombie state and OS start time, used to tell a
//! recorded process apart from an unrelated one that reused its pid.
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System};

/// Allowed drift between a recorded start time and the OS-reported one.
/// The OS value is derived from boot time at second granularity.
const START_TIME_TOLERANCE_SECS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub zombie: bool,
}

pub trait ProcessInspector {
    fn inspect(&self, pid: u32) -> Option<ProcessInfo>;

    /// Send SIGKILL.
    fn kill(&self, pid: u32) -> Result<(), nix::Error>;

    /// True when `pid` is running (not a zombie) and started at `started_at`.
    fn is_same_process(&self, pid: u32, started_at: DateTime<Utc>) -> bool {
        match self.inspect(pid) {
            Some(info) if !info.zombie => {
                (info.started_at - started_at).num_seconds().abs() <= START_TIME_TOLERANCE_SECS
            }
            _ => false,
        }
    }
}

impl<P: ProcessInspector> ProcessInspector for &P {
    fn inspect(&self, pid: u32) -> Option<ProcessInfo> {
        (**self).inspect(pid)
    }

    fn kill(&self, pid: u32) -> Result<(), nix::Error> {
        (**self).kill(pid)
    }
}

/// Real inspector backed by sysinfo, refreshing one pid at a time.
pub struct SysinfoInspector {
    sys: Mutex<System>,
}

impl SysinfoInspector {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SysinfoInspector {
    fn inspect(&self, pid: u32) -> Option<ProcessInfo> {
        let mut sys = self.sys.lock().unwrap_or_else(|p| p.into_inner());
        let sys_pid = Pid::from(pid as usize);
        if !sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new()) {
            return None;
        }
        let process = sys.process(sys_pid)?;
        let started_at = DateTime::from_timestamp(i64::try_from(process.start_time()).ok()?, 0)?;
        Some(ProcessInfo {
            pid,
            started_at,
            zombie: matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        })
    }

    fn kill(&self, pid: u32) -> Result<(), nix::Error> {
        let pid = i32::try_from(pid).map_err(|_| nix::Error::EINVAL)?;
        signal::kill(NixPid::from_raw(pid), Signal::SIGKILL)
    }
}

/// OS start time of `pid`, or now if it cannot be read.
pub fn start_time_of(inspector: &impl ProcessInspector, pid: u32) -> DateTime<Utc> {
    inspector
        .inspect(pid)
        .map(|info| info.started_at)
        .unwrap_or_else(Utc::now)
}
