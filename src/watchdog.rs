//! Liveness supervisor for the monitor.
//!
//! Runs as its own process next to the monitor. Every check interval it verifies
//! the recorded monitor is the same live process (pid plus OS start time) and
//! respawns it from the persisted launch spec when it is not. It never kills a
//! monitor and never gives up: failed respawns back off and retry.

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::error::WatchdogError;
use crate::monitor::ProcessIdentity;
use crate::notify::{Event, Notifier, Severity};
use crate::process::ProcessInspector;
use crate::spawn::{MonitorSpawner, WatchdogSpawner};
use crate::state::{Claim, LaunchSpec, ProcessRecord, Slot, StateStore, WatchdogRecord};

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub check_interval: Duration,
    pub wake_interval: Duration,
    pub respawn_backoff: Backoff,
    /// Replace a differing persisted launch spec instead of keeping it.
    pub adopt_config: bool,
}

impl WatchdogSettings {
    pub fn from_config(config: &GuardConfig, adopt_config: bool) -> Self {
        Self {
            check_interval: config.watchdog.check_interval(),
            wake_interval: Duration::from_secs(config.monitor.wake_interval_secs),
            respawn_backoff: config.watchdog.respawn_backoff(),
            adopt_config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Alive { pid: u32 },
    Respawned { previous_pid: Option<u32>, new_pid: u32 },
    RespawnFailed { delay: Duration },
    /// A stop request is present.
    StoodDown,
    /// The live monitor runs a configuration other than the launch spec. Reported, never killed.
    ConfigMismatch { pid: u32, expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogExit {
    StopRequested { reason: String },
    Signal(Signal),
}

pub struct Watchdog<S, P, M, N, C> {
    settings: WatchdogSettings,
    store: Arc<S>,
    inspector: P,
    spawner: M,
    notifier: N,
    clock: C,
    identity: ProcessIdentity,
    launch: LaunchSpec,
    backoff: Backoff,
    /// Consecutive respawns since the monitor was last seen alive.
    respawns: u32,
    /// Pid of a mismatched monitor already escalated, so each one notifies once.
    escalated_mismatch: Option<u32>,
    shutdown_signals: Option<mpsc::UnboundedReceiver<Signal>>,
}

impl<S, P, M, N, C> Watchdog<S, P, M, N, C>
where
    S: StateStore,
    P: ProcessInspector,
    M: MonitorSpawner,
    N: Notifier,
    C: Clock,
{
    /// Claim the watchdog slot and settle the authoritative launch spec.
    ///
    /// `proposed` is this watchdog's own configuration. It is written when no
    /// launch spec exists yet. A differing persisted spec is kept (and escalated)
    /// unless `adopt_config` is set.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        settings: WatchdogSettings,
        store: Arc<S>,
        inspector: P,
        spawner: M,
        notifier: N,
        clock: C,
        identity: ProcessIdentity,
        proposed: LaunchSpec,
    ) -> Result<Self, WatchdogError> {
        if let Some(stop) = store.read_stop_request()? {
            return Err(WatchdogError::StopRequested {
                reason: stop.reason,
            });
        }
        if let Claim::Held { owner_pid } = store.try_acquire(Slot::Watchdog, identity.pid)? {
            return Err(WatchdogError::AlreadyRunning {
                holder_pid: owner_pid,
            });
        }

        let record = WatchdogRecord {
            pid: identity.pid,
            started_at: identity.started_at,
        };
        let launch = match store
            .write_watchdog_record(&record)
            .and_then(|()| reconcile_launch_spec(store.as_ref(), proposed, settings.adopt_config))
        {
            Ok(resolved) => resolved,
            Err(e) => {
                let _ = store.clear_watchdog_record();
                let _ = store.release(Slot::Watchdog);
                return Err(e.into());
            }
        };

        if let Some(rejected) = &launch.rejected {
            error!(
                expected = %launch.spec.fingerprint,
                proposed = %rejected.fingerprint,
                "configuration differs from the persisted launch spec, keeping last known good"
            );
            notifier
                .notify(
                    Event::new(
                        "Watchdog configuration mismatch",
                        format!(
                            "keeping launch spec {} ({}); rerun with --adopt-config to replace it",
                            launch.spec.threshold, launch.spec.fingerprint
                        ),
                    ),
                    Severity::Critical,
                )
                .await;
        }

        info!(
            pid = identity.pid,
            threshold = %launch.spec.threshold,
            fingerprint = %launch.spec.fingerprint,
            check_interval_secs = settings.check_interval.as_secs(),
            "watchdog started"
        );

        Ok(Self {
            backoff: settings.respawn_backoff.clone(),
            settings,
            store,
            inspector,
            spawner,
            notifier,
            clock,
            identity,
            launch: launch.spec,
            respawns: 0,
            escalated_mismatch: None,
            shutdown_signals: None,
        })
    }

    pub fn with_shutdown_signals(mut self, rx: mpsc::UnboundedReceiver<Signal>) -> Self {
        self.shutdown_signals = Some(rx);
        self
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.launch
    }

    pub async fn run(mut self) -> Result<WatchdogExit, WatchdogError> {
        let result = self.run_loop().await;
        match &result {
            Ok(exit) => info!(
                pid = self.identity.pid,
                reason = ?exit,
                respawns = self.respawns,
                "watchdog shutting down"
            ),
            Err(e) => error!(error = %e, "watchdog failed"),
        }
        if let Err(e) = self.store.clear_watchdog_record() {
            warn!(error = %e, "failed to clear watchdog record");
        }
        if let Err(e) = self.store.release(Slot::Watchdog) {
            warn!(error = %e, "failed to release watchdog lock");
        }
        result
    }

    async fn run_loop(&mut self) -> Result<WatchdogExit, WatchdogError> {
        loop {
            if let Some(sig) = self.pending_signal() {
                return Ok(WatchdogExit::Signal(sig));
            }
            let pause = match self.check_once().await? {
                CheckOutcome::StoodDown => return self.stop_exit(),
                CheckOutcome::RespawnFailed { delay } => delay,
                _ => self.settings.check_interval,
            };
            let mut remaining = pause;
            while !remaining.is_zero() {
                let slice = remaining.min(self.settings.wake_interval);
                self.clock.sleep(slice).await;
                remaining = remaining.saturating_sub(slice);
                if self.store.read_stop_request()?.is_some() {
                    return self.stop_exit();
                }
                if let Some(sig) = self.pending_signal() {
                    return Ok(WatchdogExit::Signal(sig));
                }
            }
        }
    }

    /// One liveness check, respawning the monitor if it is gone.
    pub async fn check_once(&mut self) -> Result<CheckOutcome, WatchdogError> {
        if self.store.read_stop_request()?.is_some() {
            info!("stop request present, standing down");
            return Ok(CheckOutcome::StoodDown);
        }
        self.spawner.reap();

        let record = self.store.read_process_record()?;
        if let Some(record) = &record {
            if self.inspector.is_same_process(record.pid, record.started_at) {
                return Ok(self.observe_alive(record).await);
            }
        }
        if self.store.is_held(Slot::Session)? {
            // Between taking the lock and writing its record.
            let pid = self
                .store
                .slot_owner(Slot::Session)?
                .map(|lock| lock.owner_pid)
                .unwrap_or_default();
            debug!(pid, "session lock held without a live record, treating monitor as alive");
            self.backoff.reset();
            self.respawns = 0;
            return Ok(CheckOutcome::Alive { pid });
        }

        let previous_pid = record.as_ref().map(|r| r.pid);
        self.respawn(previous_pid).await
    }

    async fn observe_alive(&mut self, record: &ProcessRecord) -> CheckOutcome {
        self.backoff.reset();
        self.respawns = 0;
        if record.config_fingerprint == self.launch.fingerprint {
            self.escalated_mismatch = None;
            debug!(pid = record.pid, "monitor alive");
            return CheckOutcome::Alive { pid: record.pid };
        }

        error!(
            pid = record.pid,
            expected = %self.launch.fingerprint,
            actual = %record.config_fingerprint,
            "live monitor runs a configuration other than the launch spec"
        );
        if self.escalated_mismatch != Some(record.pid) {
            self.escalated_mismatch = Some(record.pid);
            self.notifier
                .notify(
                    Event::new(
                        "Monitor configuration mismatch",
                        format!(
                            "monitor pid {} is not running launch spec {}",
                            record.pid, self.launch.threshold
                        ),
                    ),
                    Severity::Critical,
                )
                .await;
        }
        CheckOutcome::ConfigMismatch {
            pid: record.pid,
            expected: self.launch.fingerprint.clone(),
            actual: record.config_fingerprint.clone(),
        }
    }

    async fn respawn(&mut self, previous_pid: Option<u32>) -> Result<CheckOutcome, WatchdogError> {
        if self.store.reclaim_stale(Slot::Session)? {
            debug!("reclaimed stale session lock");
        }
        self.store.clear_process_record()?;

        let detected_at = self.clock.now();
        warn!(
            previous_pid = ?previous_pid,
            detected_at = %detected_at,
            "monitor not running, respawning"
        );

        match self.spawner.spawn_monitor(&self.launch).await {
            Ok(child) => {
                self.store.write_process_record(&ProcessRecord {
                    pid: child.pid,
                    started_at: child.started_at,
                    config_fingerprint: self.launch.fingerprint.clone(),
                })?;
                self.respawns += 1;
                self.backoff.reset();
                warn!(
                    previous_pid = ?previous_pid,
                    new_pid = child.pid,
                    respawns = self.respawns,
                    threshold = %self.launch.threshold,
                    "monitor respawned"
                );
                self.notifier
                    .notify(
                        Event::new(
                            "P/L monitor respawned",
                            format!(
                                "monitor {} was not running at {}; started pid {}",
                                previous_pid.map_or("(none)".to_string(), |p| p.to_string()),
                                detected_at.format("%Y-%m-%d %H:%M:%S UTC"),
                                child.pid
                            ),
                        ),
                        Severity::Warning,
                    )
                    .await;
                Ok(CheckOutcome::Respawned {
                    previous_pid,
                    new_pid: child.pid,
                })
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                error!(
                    error = %e,
                    attempt = self.backoff.consecutive(),
                    delay_secs = delay.as_secs(),
                    "failed to respawn monitor"
                );
                self.notifier
                    .notify(
                        Event::new(
                            "P/L monitor respawn FAILED",
                            format!("{e}; retrying in {}s", delay.as_secs()),
                        ),
                        Severity::Critical,
                    )
                    .await;
                Ok(CheckOutcome::RespawnFailed { delay })
            }
        }
    }

    fn stop_exit(&self) -> Result<WatchdogExit, WatchdogError> {
        let reason = self
            .store
            .read_stop_request()?
            .map(|s| s.reason)
            .unwrap_or_default();
        Ok(WatchdogExit::StopRequested { reason })
    }

    fn pending_signal(&mut self) -> Option<Signal> {
        self.shutdown_signals.as_mut()?.try_recv().ok()
    }
}

struct ResolvedLaunch {
    spec: LaunchSpec,
    /// The proposed spec, when it lost to a differing persisted one.
    rejected: Option<LaunchSpec>,
}

fn reconcile_launch_spec<S: StateStore>(
    store: &S,
    proposed: LaunchSpec,
    adopt: bool,
) -> Result<ResolvedLaunch, crate::error::StoreError> {
    match store.read_launch_spec()? {
        None => {
            store.write_launch_spec(&proposed)?;
            info!(fingerprint = %proposed.fingerprint, "recorded launch spec");
            Ok(ResolvedLaunch {
                spec: proposed,
                rejected: None,
            })
        }
        Some(existing) if existing.same_config(&proposed) => Ok(ResolvedLaunch {
            spec: existing,
            rejected: None,
        }),
        Some(existing) if adopt => {
            warn!(
                previous = %existing.fingerprint,
                adopted = %proposed.fingerprint,
                "adopting new launch configuration"
            );
            store.write_launch_spec(&proposed)?;
            Ok(ResolvedLaunch {
                spec: proposed,
                rejected: None,
            })
        }
        Some(existing) => Ok(ResolvedLaunch {
            spec: existing,
            rejected: Some(proposed),
        }),
    }
}

/// Start a watchdog unless one is alive or supervision is halted.
///
/// Returns the new watchdog's pid if one was started.
pub async fn ensure_watchdog<S, W>(
    store: &S,
    spawner: &W,
    spec: &LaunchSpec,
    now: DateTime<Utc>,
) -> Result<Option<u32>, WatchdogError>
where
    S: StateStore,
    W: WatchdogSpawner,
{
    if store.read_stop_request()?.is_some() || store.is_held(Slot::Watchdog)? {
        return Ok(None);
    }
    store.reclaim_stale(Slot::Watchdog)?;
    let child = spawner.spawn_watchdog(spec).await?;
    info!(pid = child.pid, at = %now, "started watchdog");
    Ok(Some(child.pid))
}
