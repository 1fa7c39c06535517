//! The supervised poll loop.
//!
//! One monitor per state directory, enforced by the session lock. Each cycle
//! makes sure a usable credential exists, fetches a P/L sample, evaluates it and
//! on a fresh breach runs the kill action exactly once. Recoverable failures
//! back off and never end the loop; only a stop request, an honored signal, a
//! `halt` trigger policy or a state-store failure does.

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::{CredentialSource, PnlSource};
use crate::clock::Clock;
use crate::config::{BackoffConfig, GuardConfig, TriggerPolicy};
use crate::error::{AuthError, ConfigError, FetchError, KillActionError, MonitorError};
use crate::kill_action::KillAction;
use crate::market_hours::MarketHours;
use crate::notify::{Event, Notifier, Severity};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state::{CachedCredential, Claim, ProcessRecord, Slot, StateStore, StopRequest};
use crate::status::{MonitorState, StatusTracker};
use crate::threshold::{proximity, should_trigger, PnlSample, Proximity, ThresholdConfig};

/// Reason recorded when the `halt` policy stops supervision.
pub const HALT_REASON: &str = "threshold breached";

/// Shortest pause, so a loop sitting exactly on a window edge still moves forward.
const MIN_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub threshold: ThresholdConfig,
    pub market_hours: MarketHours,
    pub test_mode: bool,
    pub trigger_policy: TriggerPolicy,
    pub trigger_cooldown: Duration,
    pub off_hours_recheck: Duration,
    pub wake_interval: Duration,
    pub auth_timeout: Duration,
    pub fetch_timeout: Duration,
    pub kill_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Fingerprint the watchdog launched us with; startup refuses any other.
    pub expect_fingerprint: Option<String>,
}

impl MonitorSettings {
    pub fn from_config(
        config: &GuardConfig,
        expect_fingerprint: Option<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            threshold: config.threshold(),
            market_hours: config.market_hours()?,
            test_mode: config.monitor.test_mode,
            trigger_policy: config.monitor.trigger_policy,
            trigger_cooldown: Duration::from_secs(config.monitor.trigger_cooldown_secs),
            off_hours_recheck: Duration::from_secs(config.monitor.off_hours_recheck_secs),
            wake_interval: Duration::from_secs(config.monitor.wake_interval_secs),
            auth_timeout: config.timeouts.auth(),
            fetch_timeout: config.timeouts.fetch(),
            kill_timeout: config.timeouts.kill_action(),
            backoff: config.backoff.clone(),
            expect_fingerprint,
        })
    }
}

/// Who this monitor is, as recorded for the watchdog.
#[derive(Debug, Clone, Copy)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// OS-reported start time.
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Sampled { breached: bool },
    /// A fresh breach; the kill action ran (successfully or not).
    Triggered { kill_ok: bool },
    AuthFailed { delay: Duration },
    FetchFailed { delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    StopRequested { reason: String },
    /// The `halt` trigger policy wrote a stop request.
    Halted,
    Signal(Signal),
}

enum Wake {
    Elapsed,
    Exit(MonitorExit),
}

enum CredentialStep {
    Ready(CachedCredential),
    Failed(Duration),
}

pub struct Monitor<S, B, K, N, C> {
    settings: MonitorSettings,
    store: Arc<S>,
    broker: B,
    kill: K,
    notifier: N,
    clock: C,
    identity: ProcessIdentity,
    status: StatusTracker<S>,
    credential: Option<CachedCredential>,
    /// Set when the broker rejected the current credential.
    credential_stale: bool,
    auth_retry: RetryPolicy,
    fetch_retry: RetryPolicy,
    /// Set once the kill action ran for the current breach; cleared by a non-triggering sample.
    latched: bool,
    cycle: u64,
    shutdown_signals: Option<mpsc::UnboundedReceiver<Signal>>,
}

impl<S, B, K, N, C> Monitor<S, B, K, N, C>
where
    S: StateStore,
    B: CredentialSource + PnlSource,
    K: KillAction,
    N: Notifier,
    C: Clock,
{
    /// Claim the session and record this process.
    ///
    /// Refuses to start while a stop request is present, when another monitor is
    /// alive, or when the configuration does not match the expected fingerprint.
    /// None of the refusals write any state.
    pub fn start(
        settings: MonitorSettings,
        store: Arc<S>,
        broker: B,
        kill: K,
        notifier: N,
        clock: C,
        identity: ProcessIdentity,
    ) -> Result<Self, MonitorError> {
        if let Some(stop) = store.read_stop_request()? {
            return Err(MonitorError::StopRequested {
                reason: stop.reason,
            });
        }

        let fingerprint = settings.threshold.fingerprint();
        if let Some(expected) = &settings.expect_fingerprint {
            if *expected != fingerprint {
                return Err(MonitorError::ConfigMismatch {
                    expected: expected.clone(),
                    actual: fingerprint,
                });
            }
        }

        if let Claim::Held { owner_pid } = store.try_acquire(Slot::Session, identity.pid)? {
            return Err(MonitorError::AlreadyRunning {
                holder_pid: owner_pid,
            });
        }

        let record = ProcessRecord {
            pid: identity.pid,
            started_at: identity.started_at,
            config_fingerprint: fingerprint,
        };
        if let Err(e) = store.write_process_record(&record) {
            let _ = store.release(Slot::Session);
            return Err(e.into());
        }

        let credential = match store.load_credential() {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable credential cache");
                None
            }
        };

        let mut status = StatusTracker::new(store.clone(), identity.pid, settings.threshold);
        status.update(MonitorState::Starting);

        info!(
            pid = identity.pid,
            threshold = %settings.threshold,
            interval_secs = settings.threshold.check_interval_secs,
            test_mode = settings.test_mode,
            fingerprint = %record.config_fingerprint,
            "monitor started"
        );

        let degraded_after = settings.backoff.degraded_after;
        Ok(Self {
            auth_retry: RetryPolicy::new("auth", settings.backoff.build(), degraded_after),
            fetch_retry: RetryPolicy::new("fetch", settings.backoff.build(), degraded_after),
            settings,
            store,
            broker,
            kill,
            notifier,
            clock,
            identity,
            status,
            credential,
            credential_stale: false,
            latched: false,
            cycle: 0,
            shutdown_signals: None,
        })
    }

    /// Honored termination signals arrive here and end the loop cleanly.
    pub fn with_shutdown_signals(mut self, rx: mpsc::UnboundedReceiver<Signal>) -> Self {
        self.shutdown_signals = Some(rx);
        self
    }

    /// Poll until told to stop, then shut down cleanly.
    ///
    /// On a fatal error the process record and session lock are still released.
    pub async fn run(mut self) -> Result<MonitorExit, MonitorError> {
        let hours = &self.settings.market_hours;
        self.notifier
            .notify(
                Event::new(
                    "P/L monitor started",
                    format!(
                        "pid {}, threshold {}, hours {}-{} {}",
                        self.identity.pid,
                        self.settings.threshold,
                        hours.open().format("%H:%M"),
                        hours.close().format("%H:%M"),
                        hours.timezone()
                    ),
                ),
                Severity::Info,
            )
            .await;

        let result = self.run_loop().await;
        match &result {
            Ok(exit) => self.shutdown(exit).await,
            Err(e) => {
                error!(error = %e, "monitor failed");
                self.release_identity();
            }
        }
        result
    }

    async fn run_loop(&mut self) -> Result<MonitorExit, MonitorError> {
        loop {
            if let Some(exit) = self.exit_requested()? {
                return Ok(exit);
            }

            let now = self.clock.now();
            if !self.settings.market_hours.is_active(now, self.settings.test_mode) {
                let pause = self.off_hours_pause(now);
                if let Wake::Exit(exit) = self.sleep_watchful(pause).await? {
                    return Ok(exit);
                }
                continue;
            }

            let pause = match self.run_cycle().await? {
                CycleOutcome::Triggered { kill_ok } => match self.settings.trigger_policy {
                    TriggerPolicy::Halt => {
                        self.store.write_stop_request(&StopRequest {
                            requested_at: self.clock.now(),
                            reason: HALT_REASON.to_string(),
                            requested_by_pid: self.identity.pid,
                        })?;
                        info!(kill_ok, "trigger policy is halt, stopping supervision");
                        return Ok(MonitorExit::Halted);
                    }
                    TriggerPolicy::Continue => {
                        info!(
                            kill_ok,
                            cooldown_secs = self.settings.trigger_cooldown.as_secs(),
                            "resuming monitoring after cooldown"
                        );
                        self.settings.trigger_cooldown
                    }
                },
                CycleOutcome::AuthFailed { delay } | CycleOutcome::FetchFailed { delay } => delay,
                CycleOutcome::Sampled { .. } => self.poll_pause(self.clock.now()),
            };

            if let Wake::Exit(exit) = self.sleep_watchful(pause).await? {
                return Ok(exit);
            }
        }
    }

    /// One poll cycle: credential, fetch, evaluate, and trigger on a fresh breach.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, MonitorError> {
        self.cycle += 1;
        self.status.set_cycle(self.cycle);
        if self.status.state() == MonitorState::Suspended {
            info!("market open, resuming polling");
        }

        let credential = match self.ensure_credential().await? {
            CredentialStep::Ready(credential) => credential,
            CredentialStep::Failed(delay) => return Ok(CycleOutcome::AuthFailed { delay }),
        };

        let limit = self.settings.fetch_timeout;
        let fetched = timeout(limit, self.broker.fetch_pnl(&credential))
            .await
            .unwrap_or(Err(FetchError::Timeout(limit)));

        let sample = match fetched {
            Ok(sample) => {
                if self.fetch_retry.on_success() {
                    self.notify_recovered("P/L fetch").await;
                }
                self.sync_failures();
                sample
            }
            Err(e @ FetchError::Unauthorized { .. }) => {
                self.credential_stale = true;
                let decision = self.auth_retry.on_failure(&e);
                self.after_failure(&decision, "Broker authentication failing").await;
                return Ok(CycleOutcome::AuthFailed {
                    delay: decision.delay(),
                });
            }
            Err(e) => {
                let decision = self.fetch_retry.on_failure(&e);
                self.after_failure(&decision, "P/L fetch failing").await;
                return Ok(CycleOutcome::FetchFailed {
                    delay: decision.delay(),
                });
            }
        };

        let threshold = self.settings.threshold;
        let breached = should_trigger(&sample, &threshold);
        let prox = proximity(&sample, &threshold);
        self.log_sample(&sample, prox);
        self.status.set_sample(sample.clone(), prox);

        if !breached {
            if self.latched {
                info!(pnl = sample.value, "P/L back above threshold, kill switch re-armed");
            }
            self.latched = false;
            self.status.update(MonitorState::Polling);
            return Ok(CycleOutcome::Sampled { breached: false });
        }

        if self.latched {
            debug!(pnl = sample.value, "threshold still breached, kill action already ran");
            self.status.update(MonitorState::Polling);
            return Ok(CycleOutcome::Sampled { breached: true });
        }

        self.latched = true;
        let kill_ok = self.trigger(&sample).await;
        Ok(CycleOutcome::Triggered { kill_ok })
    }

    async fn ensure_credential(&mut self) -> Result<CredentialStep, MonitorError> {
        let now = self.clock.now();
        let current = match &self.credential {
            Some(c) if !self.credential_stale && !c.is_expired(now) => {
                return Ok(CredentialStep::Ready(c.clone()));
            }
            other => other.clone(),
        };

        self.status.update(MonitorState::Authenticating);
        let result = match &current {
            None => self.authenticate().await,
            Some(credential) => {
                debug!(stale = self.credential_stale, "refreshing credential");
                match self.refresh(credential).await {
                    Err(e @ (AuthError::NoRefreshToken | AuthError::Rejected { .. })) => {
                        debug!(error = %e, "refresh unavailable, authenticating from seed");
                        self.authenticate().await
                    }
                    other => other,
                }
            }
        };

        match result {
            Ok(credential) => {
                self.store.save_credential(&credential)?;
                info!(expires_at = ?credential.expires_at, "credential updated");
                self.credential = Some(credential.clone());
                self.credential_stale = false;
                if self.auth_retry.on_success() {
                    self.notify_recovered("Broker authentication").await;
                }
                self.sync_failures();
                self.status.update(MonitorState::Polling);
                Ok(CredentialStep::Ready(credential))
            }
            Err(e) => {
                let decision = self.auth_retry.on_failure(&e);
                self.after_failure(&decision, "Broker authentication failing").await;
                Ok(CredentialStep::Failed(decision.delay()))
            }
        }
    }

    async fn authenticate(&self) -> Result<CachedCredential, AuthError> {
        let limit = self.settings.auth_timeout;
        timeout(limit, self.broker.authenticate())
            .await
            .unwrap_or(Err(AuthError::Timeout(limit)))
    }

    async fn refresh(&self, credential: &CachedCredential) -> Result<CachedCredential, AuthError> {
        let limit = self.settings.auth_timeout;
        timeout(limit, self.broker.refresh(credential))
            .await
            .unwrap_or(Err(AuthError::Timeout(limit)))
    }

    /// Run the kill action once for this breach. Returns whether it succeeded.
    async fn trigger(&mut self, sample: &PnlSample) -> bool {
        self.status.update(MonitorState::Triggering);
        warn!(
            pnl = sample.value,
            threshold = %self.settings.threshold,
            observed_at = %sample.observed_at,
            source = ?sample.source,
            "threshold breached, executing kill action"
        );

        let limit = self.settings.kill_timeout;
        let result = timeout(limit, self.kill.execute())
            .await
            .unwrap_or(Err(KillActionError::Timeout(limit)));

        let kill_ok = match result {
            Ok(()) => {
                info!("kill action completed");
                true
            }
            Err(e) => {
                error!(error = %e, "kill action failed");
                self.notifier
                    .notify(
                        Event::new("Kill switch FAILED", format!("kill action failed: {e}")),
                        Severity::Critical,
                    )
                    .await;
                false
            }
        };

        self.notifier
            .notify(
                Event::new(
                    "Kill switch triggered",
                    format!(
                        "P/L {:.2} reached threshold {}",
                        sample.value, self.settings.threshold
                    ),
                ),
                Severity::Critical,
            )
            .await;
        self.status.update(MonitorState::Polling);
        kill_ok
    }

    async fn after_failure(&mut self, decision: &RetryDecision, title: &str) {
        self.sync_failures();
        self.status.update(MonitorState::Polling);
        if let RetryDecision::Degraded {
            attempt,
            newly: true,
            ..
        } = decision
        {
            self.notifier
                .notify(
                    Event::new(title, format!("{attempt} consecutive failures, still retrying")),
                    Severity::Critical,
                )
                .await;
        }
    }

    async fn notify_recovered(&self, what: &str) {
        self.notifier
            .notify(
                Event::new(format!("{what} recovered"), "monitoring resumed normally"),
                Severity::Info,
            )
            .await;
    }

    fn sync_failures(&mut self) {
        let degraded = self.auth_retry.is_degraded() || self.fetch_retry.is_degraded();
        self.status.set_failures(
            self.auth_retry.failures(),
            self.fetch_retry.failures(),
            degraded,
        );
    }

    fn log_sample(&self, sample: &PnlSample, prox: Proximity) {
        let pct = sample.percent_of_balance().unwrap_or(0.0);
        match prox {
            Proximity::Normal => info!(
                cycle = self.cycle,
                pnl = %format!("{:.2}", sample.value),
                balance = ?sample.balance,
                pnl_pct = %format!("{pct:.2}"),
                "P/L status"
            ),
            Proximity::Approaching | Proximity::Breached => warn!(
                cycle = self.cycle,
                pnl = %format!("{:.2}", sample.value),
                balance = ?sample.balance,
                pnl_pct = %format!("{pct:.2}"),
                proximity = ?prox,
                "P/L status: approaching threshold"
            ),
        }
    }

    /// Pause after a normal cycle: the poll interval, cut short at the close.
    fn poll_pause(&self, now: DateTime<Utc>) -> Duration {
        let interval = self.settings.threshold.check_interval();
        match self.settings.market_hours.until_close(now) {
            Some(remaining) if remaining < interval => remaining.max(MIN_PAUSE),
            _ => interval,
        }
    }

    /// Pause while the gate is closed: until the next open, at most `off_hours_recheck`.
    fn off_hours_pause(&mut self, now: DateTime<Utc>) -> Duration {
        let next_open = self.settings.market_hours.next_open(now);
        if self.status.state() != MonitorState::Suspended {
            info!(next_open = ?next_open, "market closed, idling until next open");
            self.status.update(MonitorState::Suspended);
        }
        let recheck = self.settings.off_hours_recheck;
        next_open
            .and_then(|open| (open - now).to_std().ok())
            .map_or(recheck, |until| until.min(recheck))
            .max(MIN_PAUSE)
    }

    /// Sleep `total` in `wake_interval` slices, checking for a stop after each slice.
    async fn sleep_watchful(&mut self, total: Duration) -> Result<Wake, MonitorError> {
        let mut remaining = total;
        while !remaining.is_zero() {
            let slice = remaining.min(self.settings.wake_interval);
            self.clock.sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
            if let Some(exit) = self.exit_requested()? {
                return Ok(Wake::Exit(exit));
            }
        }
        Ok(Wake::Elapsed)
    }

    fn exit_requested(&mut self) -> Result<Option<MonitorExit>, MonitorError> {
        if let Some(stop) = self.store.read_stop_request()? {
            return Ok(Some(MonitorExit::StopRequested {
                reason: stop.reason,
            }));
        }
        if let Some(rx) = self.shutdown_signals.as_mut() {
            if let Ok(sig) = rx.try_recv() {
                return Ok(Some(MonitorExit::Signal(sig)));
            }
        }
        Ok(None)
    }

    async fn shutdown(&mut self, exit: &MonitorExit) {
        info!(reason = ?exit, cycles = self.cycle, "monitor shutting down");
        self.status.update(MonitorState::Terminated);
        self.release_identity();
        self.notifier
            .notify(
                Event::new("P/L monitor stopped", format!("pid {} exited: {exit:?}", self.identity.pid)),
                Severity::Warning,
            )
            .await;
    }

    fn release_identity(&self) {
        if let Err(e) = self.store.clear_process_record() {
            warn!(error = %e, "failed to clear process record");
        }
        if let Err(e) = self.store.release(Slot::Session) {
            warn!(error = %e, "failed to release session lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::notify::fake::RecordingNotifier;
    use crate::state::memory::MemoryStateStore;
    use crate::state::Secret;
    use crate::threshold::ThresholdKind;
    use chrono::TimeZone;
    use chrono_tz::America::Los_Angeles;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    // ─── fakes ────────────────────────────────────────────────────────

    #[derive(Debug, Clone, Copy)]
    enum Fetch {
        Value(f64),
        Unauthorized,
        Unavailable,
        Hang,
    }

    #[derive(Debug, Clone, Copy)]
    enum Auth {
        Ok,
        Fail,
    }

    struct FakeBroker {
        fetches: Mutex<VecDeque<Fetch>>,
        fallback: f64,
        auths: Mutex<VecDeque<Auth>>,
        auth_calls: AtomicU32,
        refresh_calls: AtomicU32,
        fetch_calls: AtomicU32,
        /// After this many fetches, write a stop request (ends `run`).
        stop_after: Option<(u32, Arc<MemoryStateStore>)>,
    }

    impl FakeBroker {
        fn fixed(value: f64) -> Self {
            Self {
                fetches: Mutex::new(VecDeque::new()),
                fallback: value,
                auths: Mutex::new(VecDeque::new()),
                auth_calls: AtomicU32::new(0),
                refresh_calls: AtomicU32::new(0),
                fetch_calls: AtomicU32::new(0),
                stop_after: None,
            }
        }

        fn script(self, fetches: &[Fetch]) -> Self {
            *self.fetches.lock().unwrap() = fetches.iter().copied().collect();
            self
        }

        fn auth_script(self, auths: &[Auth]) -> Self {
            *self.auths.lock().unwrap() = auths.iter().copied().collect();
            self
        }

        fn stop_after(mut self, n: u32, store: Arc<MemoryStateStore>) -> Self {
            self.stop_after = Some((n, store));
            self
        }

        fn credential(refresh: bool) -> CachedCredential {
            CachedCredential {
                token: Secret::new("tok"),
                refresh_token: refresh.then(|| Secret::new("ref")),
                device_id: "dev".to_string(),
                account_id: "acct".to_string(),
                fetched_at: Utc::now(),
                expires_at: None,
            }
        }
    }

    impl CredentialSource for &FakeBroker {
        async fn authenticate(&self) -> Result<CachedCredential, AuthError> {
            self.auth_calls.fetch_add(1, Ordering::SeqCst);
            match self.auths.lock().unwrap().pop_front().unwrap_or(Auth::Ok) {
                Auth::Ok => Ok(FakeBroker::credential(true)),
                Auth::Fail => Err(AuthError::Rejected { status: 500 }),
            }
        }

        async fn refresh(&self, c: &CachedCredential) -> Result<CachedCredential, AuthError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if c.refresh_token.is_none() {
                return Err(AuthError::NoRefreshToken);
            }
            Ok(FakeBroker::credential(true))
        }
    }

    impl PnlSource for &FakeBroker {
        async fn fetch_pnl(&self, _c: &CachedCredential) -> Result<PnlSample, FetchError> {
            let n = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, store)) = &self.stop_after {
                if n >= *limit {
                    store
                        .write_stop_request(&StopRequest {
                            requested_at: Utc::now(),
                            reason: "test over".to_string(),
                            requested_by_pid: 1,
                        })
                        .unwrap();
                }
            }
            let step = self
                .fetches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Fetch::Value(self.fallback));
            match step {
                Fetch::Value(v) => Ok(PnlSample::simulated(v)),
                Fetch::Unauthorized => Err(FetchError::Unauthorized { status: 403 }),
                Fetch::Unavailable => Err(FetchError::Http { status: 503 }),
                Fetch::Hang => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct CountingKill {
        runs: AtomicU32,
        fail: bool,
    }

    impl KillAction for &CountingKill {
        async fn execute(&self) -> Result<(), KillActionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(KillActionError::NotConfigured)
            } else {
                Ok(())
            }
        }
    }

    // ─── helpers ──────────────────────────────────────────────────────

    fn pacific(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Los_Angeles
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    /// Wednesday mid-session.
    fn market_open() -> DateTime<Utc> {
        pacific(2025, 3, 5, 9, 0)
    }

    fn settings(threshold: f64) -> MonitorSettings {
        let mut config = GuardConfig::default();
        config.threshold.value = threshold;
        config.backoff.jitter_ratio = 0.0;
        config.backoff.degraded_after = 3;
        MonitorSettings::from_config(&config, None).unwrap()
    }

    fn identity(pid: u32) -> ProcessIdentity {
        ProcessIdentity {
            pid,
            started_at: Utc::now(),
        }
    }

    type TestMonitor<'a> = Monitor<
        MemoryStateStore,
        &'a FakeBroker,
        &'a CountingKill,
        &'a RecordingNotifier,
        &'a FakeClock,
    >;

    struct Harness {
        store: Arc<MemoryStateStore>,
        kill: CountingKill,
        notifier: RecordingNotifier,
        clock: FakeClock,
    }

    impl Harness {
        fn new(now: DateTime<Utc>) -> Self {
            Self {
                store: Arc::new(MemoryStateStore::new()),
                kill: CountingKill::default(),
                notifier: RecordingNotifier::default(),
                clock: FakeClock::at(now),
            }
        }

        fn start<'a>(
            &'a self,
            settings: MonitorSettings,
            broker: &'a FakeBroker,
        ) -> Result<TestMonitor<'a>, MonitorError> {
            Monitor::start(
                settings,
                self.store.clone(),
                broker,
                &self.kill,
                &self.notifier,
                &self.clock,
                identity(4242),
            )
        }
    }

    // ─── startup ──────────────────────────────────────────────────────

    #[test]
    fn test_startup_records_identity_and_lock() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(0.0);
        let settings = settings(-500.0);
        let fingerprint = settings.threshold.fingerprint();
        let _monitor = h.start(settings, &broker).unwrap();

        let record = h.store.read_process_record().unwrap().unwrap();
        assert_eq!(record.pid, 4242);
        assert_eq!(record.config_fingerprint, fingerprint);
        assert!(h.store.is_held(Slot::Session).unwrap());
        assert_eq!(h.store.read_status().unwrap().unwrap().state, MonitorState::Starting);
    }

    #[test]
    fn test_second_instance_is_already_running() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(0.0);
        let _first = h.start(settings(-500.0), &broker).unwrap();
        let second = Monitor::start(
            settings(-500.0),
            h.store.clone(),
            &broker,
            &h.kill,
            &h.notifier,
            &h.clock,
            identity(5000),
        );
        assert!(matches!(
            second,
            Err(MonitorError::AlreadyRunning {
                holder_pid: Some(4242)
            })
        ));
        // The live monitor's record is untouched.
        assert_eq!(h.store.read_process_record().unwrap().unwrap().pid, 4242);
    }

    #[test]
    fn test_fingerprint_mismatch_writes_nothing() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(0.0);
        let mut settings = settings(-500.0);
        settings.expect_fingerprint = Some("not-this-one".to_string());
        let result = h.start(settings, &broker);
        assert!(matches!(result, Err(MonitorError::ConfigMismatch { .. })));
        assert!(!h.store.is_held(Slot::Session).unwrap());
        assert_eq!(h.store.read_process_record().unwrap(), None);
        assert_eq!(h.store.read_status().unwrap(), None);
    }

    #[test]
    fn test_matching_fingerprint_starts() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(0.0);
        let mut settings = settings(-500.0);
        settings.expect_fingerprint = Some(settings.threshold.fingerprint());
        assert!(h.start(settings, &broker).is_ok());
    }

    #[test]
    fn test_stop_request_blocks_startup() {
        let h = Harness::new(market_open());
        h.store
            .write_stop_request(&StopRequest {
                requested_at: Utc::now(),
                reason: "operator".to_string(),
                requested_by_pid: 1,
            })
            .unwrap();
        let broker = FakeBroker::fixed(0.0);
        let result = h.start(settings(-500.0), &broker);
        assert!(matches!(result, Err(MonitorError::StopRequested { .. })));
        assert!(!h.store.is_held(Slot::Session).unwrap());
    }

    // ─── cycles ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_exact_threshold_triggers_once_in_one_cycle() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(-650.0);
        let mut monitor = h.start(settings(-650.0), &broker).unwrap();

        let outcome = monitor.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Triggered { kill_ok: true });
        assert_eq!(h.kill.runs.load(Ordering::SeqCst), 1);

        // Breach persists: latched, no second kill.
        for _ in 0..3 {
            assert_eq!(
                monitor.run_cycle().await.unwrap(),
                CycleOutcome::Sampled { breached: true }
            );
        }
        assert_eq!(h.kill.runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.notifier.count(Severity::Critical), 1);
    }

    #[tokio::test]
    async fn test_comfortable_pnl_never_triggers() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(-100.0);
        let mut monitor = h.start(settings(-500.0), &broker).unwrap();
        for _ in 0..10 {
            assert_eq!(
                monitor.run_cycle().await.unwrap(),
                CycleOutcome::Sampled { breached: false }
            );
        }
        assert_eq!(h.kill.runs.load(Ordering::SeqCst), 0);
        assert_eq!(broker.fetch_calls.load(Ordering::SeqCst), 10);
        let status = h.store.read_status().unwrap().unwrap();
        assert_eq!(status.cycle, 10);
        assert_eq!(status.proximity, Some(Proximity::Normal));
    }

    #[tokio::test]
    async fn test_latch_rearms_after_recovery() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(-100.0).script(&[
            Fetch::Value(-600.0),
            Fetch::Value(-700.0),
            Fetch::Value(-200.0),
            Fetch::Value(-550.0),
        ]);
        let mut monitor = h.start(settings(-500.0), &broker).unwrap();
        let outcomes: Vec<CycleOutcome> = {
            let mut v = Vec::new();
            for _ in 0..4 {
                v.push(monitor.run_cycle().await.unwrap());
            }
            v
        };
        assert_eq!(
            outcomes,
            vec![
                CycleOutcome::Triggered { kill_ok: true },
                CycleOutcome::Sampled { breached: true },
                CycleOutcome::Sampled { breached: false },
                CycleOutcome::Triggered { kill_ok: true },
            ]
        );
        assert_eq!(h.kill.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_kill_action_stays_latched() {
        let mut h = Harness::new(market_open());
        h.kill.fail = true;
        let broker = FakeBroker::fixed(-900.0);
        let mut monitor = h.start(settings(-500.0), &broker).unwrap();

        assert_eq!(
            monitor.run_cycle().await.unwrap(),
            CycleOutcome::Triggered { kill_ok: false }
        );
        assert_eq!(
            monitor.run_cycle().await.unwrap(),
            CycleOutcome::Sampled { breached: true }
        );
        assert_eq!(h.kill.runs.load(Ordering::SeqCst), 1);
        assert!(h.notifier.titles().contains(&"Kill switch FAILED".to_string()));
    }

    #[tokio::test]
    async fn test_auth_failures_back_off_and_degrade_once() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(-100.0).auth_script(&[
            Auth::Fail,
            Auth::Fail,
            Auth::Fail,
            Auth::Fail,
            Auth::Ok,
        ]);
        let mut monitor = h.start(settings(-500.0), &broker).unwrap();

        let mut delays = Vec::new();
        for _ in 0..4 {
            match monitor.run_cycle().await.unwrap() {
                CycleOutcome::AuthFailed { delay } => delays.push(delay.as_secs()),
                other => panic!("expected auth failure, got {other:?}"),
            }
        }
        assert_eq!(delays, vec![2, 4, 8, 16]);
        let status = h.store.read_status().unwrap().unwrap();
        assert_eq!(status.auth_failures, 4);
        assert!(status.degraded);
        assert_eq!(h.notifier.count(Severity::Critical), 1);

        assert_eq!(
            monitor.run_cycle().await.unwrap(),
            CycleOutcome::Sampled { breached: false }
        );
        let status = h.store.read_status().unwrap().unwrap();
        assert_eq!(status.auth_failures, 0);
        assert!(!status.degraded);
        assert!(h.store.load_credential().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rejected_credential_is_refreshed_next_cycle() {
        let h = Harness::new(market_open());
        h.store.save_credential(&FakeBroker::credential(true)).unwrap();
        let broker = FakeBroker::fixed(-100.0).script(&[Fetch::Unauthorized]);
        let mut monitor = h.start(settings(-500.0), &broker).unwrap();

        assert!(matches!(
            monitor.run_cycle().await.unwrap(),
            CycleOutcome::AuthFailed { .. }
        ));
        assert_eq!(broker.refresh_calls.load(Ordering::SeqCst), 0);

        assert_eq!(
            monitor.run_cycle().await.unwrap(),
            CycleOutcome::Sampled { breached: false }
        );
        assert_eq!(broker.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.auth_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_credential_without_refresh_token_reauthenticates() {
        let h = Harness::new(market_open());
        let mut cached = FakeBroker::credential(false);
        cached.expires_at = Some(market_open() - chrono::Duration::hours(1));
        h.store.save_credential(&cached).unwrap();
        let broker = FakeBroker::fixed(-100.0);
        let mut monitor = h.start(settings(-500.0), &broker).unwrap();

        assert_eq!(
            monitor.run_cycle().await.unwrap(),
            CycleOutcome::Sampled { breached: false }
        );
        assert_eq!(broker.auth_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failures_are_retried_with_growing_delay() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(-100.0).script(&[Fetch::Unavailable, Fetch::Unavailable]);
        let mut monitor = h.start(settings(-500.0), &broker).unwrap();
        assert_eq!(
            monitor.run_cycle().await.unwrap(),
            CycleOutcome::FetchFailed {
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            monitor.run_cycle().await.unwrap(),
            CycleOutcome::FetchFailed {
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(h.store.read_status().unwrap().unwrap().fetch_failures, 2);
        assert_eq!(
            monitor.run_cycle().await.unwrap(),
            CycleOutcome::Sampled { breached: false }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_fetch_times_out() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(-100.0).script(&[Fetch::Hang]);
        let mut monitor = h.start(settings(-500.0), &broker).unwrap();
        assert!(matches!(
            monitor.run_cycle().await.unwrap(),
            CycleOutcome::FetchFailed { .. }
        ));
    }

    // ─── full loop ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_halt_policy_writes_stop_and_shuts_down() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(-800.0);
        let mut settings = settings(-500.0);
        settings.trigger_policy = TriggerPolicy::Halt;
        let monitor = h.start(settings, &broker).unwrap();

        let exit = monitor.run().await.unwrap();
        assert_eq!(exit, MonitorExit::Halted);
        assert_eq!(h.kill.runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.read_stop_request().unwrap().unwrap().reason, HALT_REASON);
        assert_eq!(h.store.read_process_record().unwrap(), None);
        assert!(!h.store.is_held(Slot::Session).unwrap());
        assert_eq!(h.store.read_status().unwrap().unwrap().state, MonitorState::Terminated);
    }

    #[tokio::test]
    async fn test_continue_policy_cools_down_and_resumes() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(-100.0)
            .script(&[Fetch::Value(-800.0), Fetch::Value(-100.0)])
            .stop_after(2, h.store.clone());
        let monitor = h.start(settings(-500.0), &broker).unwrap();

        let exit = monitor.run().await.unwrap();
        assert!(matches!(exit, MonitorExit::StopRequested { .. }));
        assert_eq!(h.kill.runs.load(Ordering::SeqCst), 1);
        // The cooldown (300 s) sits between the two fetches, in 30 s slices.
        let slept = h.clock.total_slept();
        assert!(slept >= Duration::from_secs(300), "slept {slept:?}");
        assert!(h.clock.sleeps().iter().all(|s| *s <= Duration::from_secs(30)));
        assert_eq!(h.store.read_process_record().unwrap(), None);
        assert!(h.notifier.titles().contains(&"P/L monitor stopped".to_string()));
    }

    #[tokio::test]
    async fn test_stop_request_ends_loop_within_one_wake_interval() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(-100.0).stop_after(1, h.store.clone());
        let monitor = h.start(settings(-500.0), &broker).unwrap();
        let exit = monitor.run().await.unwrap();
        assert_eq!(
            exit,
            MonitorExit::StopRequested {
                reason: "test over".to_string()
            }
        );
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn test_off_hours_idles_until_next_open() {
        // Friday after close; next open is Monday 06:30 PDT.
        let h = Harness::new(pacific(2025, 3, 7, 14, 0));
        let broker = FakeBroker::fixed(-100.0).stop_after(1, h.store.clone());
        let mut settings = settings(-500.0);
        settings.wake_interval = Duration::from_secs(900);
        let monitor = h.start(settings, &broker).unwrap();

        monitor.run().await.unwrap();
        assert_eq!(broker.fetch_calls.load(Ordering::SeqCst), 1);
        assert!(h.clock.now() >= pacific(2025, 3, 10, 6, 30));
        assert!(h.clock.sleeps().iter().all(|s| *s <= Duration::from_secs(900)));

        let states: Vec<MonitorState> = h.store.status_history().iter().map(|s| s.state).collect();
        let suspended = states.iter().position(|s| *s == MonitorState::Suspended).unwrap();
        let polling = states.iter().position(|s| *s == MonitorState::Polling).unwrap();
        assert!(suspended < polling);
        // Suspended is written once on entry, not on every recheck.
        assert_eq!(states.iter().filter(|s| **s == MonitorState::Suspended).count(), 1);
    }

    #[tokio::test]
    async fn test_test_mode_polls_on_weekends() {
        let h = Harness::new(pacific(2025, 3, 8, 3, 0));
        let broker = FakeBroker::fixed(-100.0).stop_after(1, h.store.clone());
        let mut settings = settings(-500.0);
        settings.test_mode = true;
        let monitor = h.start(settings, &broker).unwrap();
        monitor.run().await.unwrap();
        assert_eq!(broker.fetch_calls.load(Ordering::SeqCst), 1);
        assert!(h.store.status_history().iter().all(|s| s.state != MonitorState::Suspended));
    }

    #[tokio::test]
    async fn test_pause_is_cut_short_at_close() {
        let h = Harness::new(pacific(2025, 3, 5, 13, 14) + chrono::Duration::seconds(30));
        let broker = FakeBroker::fixed(-100.0);
        let monitor = h.start(settings(-500.0), &broker).unwrap();
        assert_eq!(monitor.poll_pause(h.clock.now()), Duration::from_secs(30));
        assert_eq!(monitor.poll_pause(market_open()), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_honored_signal_shuts_down_cleanly() {
        let h = Harness::new(market_open());
        let broker = FakeBroker::fixed(-100.0);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Signal::SIGTERM).unwrap();
        let monitor = h.start(settings(-500.0), &broker).unwrap().with_shutdown_signals(rx);
        let exit = monitor.run().await.unwrap();
        assert_eq!(exit, MonitorExit::Signal(Signal::SIGTERM));
        assert_eq!(broker.fetch_calls.load(Ordering::SeqCst), 0);
        assert!(!h.store.is_held(Slot::Session).unwrap());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = GuardConfig::default();
        config.threshold.kind = ThresholdKind::Percent;
        config.threshold.value = -2.0;
        let settings = MonitorSettings::from_config(&config, Some("abc".to_string())).unwrap();
        assert_eq!(settings.threshold.kind, ThresholdKind::Percent);
        assert_eq!(settings.trigger_cooldown, Duration::from_secs(300));
        assert_eq!(settings.off_hours_recheck, Duration::from_secs(1800));
        assert_eq!(settings.expect_fingerprint.as_deref(), Some("abc"));
    }
}
