//! Status snapshot: rewritten through the state store on every monitor state transition,
//! read back by `pnl-guard status`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::state::StateStore;
use crate::threshold::{PnlSample, Proximity, ThresholdConfig};

/// Monitor states written to the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Starting,
    Authenticating,
    Polling,
    /// Polling, but the market-hours gate is closed.
    Suspended,
    Triggering,
    Terminated,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonitorState::Starting => "starting",
            MonitorState::Authenticating => "authenticating",
            MonitorState::Polling => "polling",
            MonitorState::Suspended => "suspended",
            MonitorState::Triggering => "triggering",
            MonitorState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// The JSON payload written to `status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub pid: u32,
    pub state: MonitorState,
    pub cycle: u64,
    pub last_sample: Option<PnlSample>,
    pub threshold: ThresholdConfig,
    pub proximity: Option<Proximity>,
    pub auth_failures: u32,
    pub fetch_failures: u32,
    pub degraded: bool,
    pub last_update: DateTime<Utc>,
}

/// Mutable state tracker that builds a MonitorStatus for each update.
pub struct StatusTracker<S> {
    store: Arc<S>,
    pid: u32,
    threshold: ThresholdConfig,
    state: MonitorState,
    cycle: u64,
    last_sample: Option<PnlSample>,
    proximity: Option<Proximity>,
    auth_failures: u32,
    fetch_failures: u32,
    degraded: bool,
}

impl<S: StateStore> StatusTracker<S> {
    pub fn new(store: Arc<S>, pid: u32, threshold: ThresholdConfig) -> Self {
        Self {
            store,
            pid,
            threshold,
            state: MonitorState::Starting,
            cycle: 0,
            last_sample: None,
            proximity: None,
            auth_failures: 0,
            fetch_failures: 0,
            degraded: false,
        }
    }

    /// Move to `state` and write the snapshot.
    ///
    /// A failed write is logged and otherwise ignored: the snapshot is advisory.
    pub fn update(&mut self, state: MonitorState) {
        self.state = state;
        let snapshot = self.snapshot();
        if let Err(e) = self.store.write_status(&snapshot) {
            tracing::warn!(error = %e, "failed to write status snapshot");
        }
    }

    pub fn snapshot(&self) -> MonitorStatus {
        MonitorStatus {
            pid: self.pid,
            state: self.state,
            cycle: self.cycle,
            last_sample: self.last_sample.clone(),
            threshold: self.threshold,
            proximity: self.proximity,
            auth_failures: self.auth_failures,
            fetch_failures: self.fetch_failures,
            degraded: self.degraded,
            last_update: Utc::now(),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn set_cycle(&mut self, cycle: u64) {
        self.cycle = cycle;
    }

    pub fn set_sample(&mut self, sample: PnlSample, proximity: Proximity) {
        self.last_sample = Some(sample);
        self.proximity = Some(proximity);
    }

    pub fn set_failures(&mut self, auth: u32, fetch: u32, degraded: bool) {
        self.auth_failures = auth;
        self.fetch_failures = fetch;
        self.degraded = degraded;
    }
}
