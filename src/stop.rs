//! Gated "stop everything" operator action, and `resume`.
//!
//! Stopping writes a [`StopRequest`] first, so neither process restarts the
//! other. Both then get a grace period to exit on their own before any survivor
//! is SIGKILLed (watchdog first). Pids are verified against their recorded start
//! time before every kill.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::process::ProcessInspector;
use crate::state::{Slot, StateStore, StopRequest};

pub const CONFIRM_PHRASE: &str = "STOP MONITORING";

/// A random 6-digit challenge the operator must echo back.
pub fn challenge_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

/// Two-step confirmation. Returns true only if the phrase and then `code` were typed exactly.
pub fn confirm<R: BufRead, W: Write>(input: &mut R, out: &mut W, code: &str) -> io::Result<bool> {
    writeln!(out, "This stops the P/L monitor and its watchdog.")?;
    write!(out, "Type {CONFIRM_PHRASE} to continue: ")?;
    out.flush()?;
    if read_answer(input)?.as_deref() != Some(CONFIRM_PHRASE) {
        writeln!(out, "Confirmation phrase did not match, nothing was stopped.")?;
        return Ok(false);
    }

    write!(out, "Enter the code {code} to confirm: ")?;
    out.flush()?;
    if read_answer(input)?.as_deref() != Some(code) {
        writeln!(out, "Code did not match, nothing was stopped.")?;
        return Ok(false);
    }
    Ok(true)
}

fn read_answer<R: BufRead>(input: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

#[derive(Debug, Clone, Copy)]
pub struct StopSettings {
    pub grace: Duration,
    pub poll: Duration,
}

impl Default for StopSettings {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(45),
            poll: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    NotRunning,
    ExitedCleanly { pid: u32 },
    Killed { pid: u32 },
    KillFailed { pid: u32, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub monitor: Termination,
    pub watchdog: Termination,
    /// Slots whose stale metadata was swept.
    pub reclaimed: Vec<Slot>,
}

#[derive(Debug, Clone, Copy)]
struct Target {
    pid: u32,
    started_at: DateTime<Utc>,
}

pub async fn stop_all<S, P, C>(
    store: &S,
    inspector: &P,
    clock: &C,
    settings: StopSettings,
    reason: &str,
    requested_by_pid: u32,
) -> Result<StopReport, StoreError>
where
    S: StateStore,
    P: ProcessInspector,
    C: Clock,
{
    let live = |pid: u32, started_at: DateTime<Utc>| {
        inspector
            .is_same_process(pid, started_at)
            .then_some(Target { pid, started_at })
    };
    let monitor = store
        .read_process_record()?
        .and_then(|r| live(r.pid, r.started_at));
    let watchdog = store
        .read_watchdog_record()?
        .and_then(|r| live(r.pid, r.started_at));

    store.write_stop_request(&StopRequest {
        requested_at: clock.now(),
        reason: reason.to_string(),
        requested_by_pid,
    })?;
    info!(
        monitor = ?monitor.map(|t| t.pid),
        watchdog = ?watchdog.map(|t| t.pid),
        grace_secs = settings.grace.as_secs(),
        "stop requested, waiting for clean exit"
    );

    let alive = |t: &Option<Target>| {
        t.is_some_and(|t| inspector.is_same_process(t.pid, t.started_at))
    };
    let mut waited = Duration::ZERO;
    while waited < settings.grace && (alive(&monitor) || alive(&watchdog)) {
        clock.sleep(settings.poll).await;
        waited += settings.poll;
    }

    let watchdog = terminate(inspector, watchdog, "watchdog");
    let monitor = terminate(inspector, monitor, "monitor");
    if matches!(watchdog, Termination::Killed { .. }) || matches!(monitor, Termination::Killed { .. }) {
        // Let the kernel drop the killed holders' file locks.
        clock.sleep(settings.poll).await;
    }

    store.clear_process_record()?;
    store.clear_watchdog_record()?;
    let mut reclaimed = Vec::new();
    for slot in [Slot::Session, Slot::Watchdog] {
        if store.reclaim_stale(slot)? {
            reclaimed.push(slot);
        }
    }

    info!(?monitor, ?watchdog, ?reclaimed, "stop complete");
    Ok(StopReport {
        monitor,
        watchdog,
        reclaimed,
    })
}

fn terminate<P: ProcessInspector>(inspector: &P, target: Option<Target>, role: &str) -> Termination {
    let Some(target) = target else {
        return Termination::NotRunning;
    };
    if !inspector.is_same_process(target.pid, target.started_at) {
        info!(role, pid = target.pid, "exited cleanly");
        return Termination::ExitedCleanly { pid: target.pid };
    }
    match inspector.kill(target.pid) {
        Ok(()) => {
            warn!(role, pid = target.pid, "did not exit within grace period, sent SIGKILL");
            Termination::Killed { pid: target.pid }
        }
        Err(nix::Error::ESRCH) => Termination::ExitedCleanly { pid: target.pid },
        Err(e) => {
            warn!(role, pid = target.pid, error = %e, "failed to kill");
            Termination::KillFailed {
                pid: target.pid,
                error: e.to_string(),
            }
        }
    }
}

/// Clear the stop request. Returns the request that was cleared, if any.
pub fn resume<S: StateStore>(store: &S) -> Result<Option<StopRequest>, StoreError> {
    let previous = store.read_stop_request()?;
    if previous.is_some() {
        store.clear_stop_request()?;
        info!("stop request cleared, supervision may start again");
    }
    Ok(previous)
}
