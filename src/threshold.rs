//! Threshold evaluation: decides whether a P/L sample breaches the configured loss floor.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Fraction of the threshold at which a sample is reported as approaching it.
const APPROACH_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    /// Absolute P/L in account currency.
    Dollar,
    /// P/L as a percentage of account equity, normalized by the P/L source.
    Percent,
}

impl fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdKind::Dollar => write!(f, "dollar"),
            ThresholdKind::Percent => write!(f, "percent"),
        }
    }
}

impl std::str::FromStr for ThresholdKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dollar" | "usd" => Ok(ThresholdKind::Dollar),
            "percent" | "pct" | "%" => Ok(ThresholdKind::Percent),
            other => Err(format!("unknown threshold kind {other:?}")),
        }
    }
}

/// Immutable for the lifetime of one monitor; reproduced exactly on every respawn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub value: f64,
    pub kind: ThresholdKind,
    pub check_interval_secs: u64,
}

impl ThresholdConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Stable identity of this configuration, compared across respawns.
    ///
    /// md5 over a canonical JSON rendering (field order is fixed by the struct).
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "value": self.value,
            "kind": self.kind,
            "check_interval_secs": self.check_interval_secs,
        });
        format!("{:x}", md5::compute(canonical.to_string()))
    }
}

impl fmt::Display for ThresholdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ThresholdKind::Dollar => write!(f, "${:.2}", self.value),
            ThresholdKind::Percent => write!(f, "{:.2}%", self.value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    Live,
    Simulated,
}

/// One poll cycle's P/L observation. Never persisted beyond logs and the status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlSample {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    pub source: SampleSource,
    /// Account balance seen alongside the P/L, when the source reports one.
    pub balance: Option<f64>,
}

impl PnlSample {
    pub fn simulated(value: f64) -> Self {
        Self {
            value,
            observed_at: Utc::now(),
            source: SampleSource::Simulated,
            balance: None,
        }
    }

    /// P/L relative to balance, in percent, if a non-zero balance is known.
    pub fn percent_of_balance(&self) -> Option<f64> {
        match self.balance {
            Some(balance) if balance != 0.0 => Some(self.value / balance * 100.0),
            _ => None,
        }
    }
}

/// Trigger iff `sample.value <= cfg.value`. The boundary is inclusive for both kinds.
pub fn should_trigger(sample: &PnlSample, cfg: &ThresholdConfig) -> bool {
    sample.value <= cfg.value
}

/// How close a sample is to the floor, for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proximity {
    Normal,
    Approaching,
    Breached,
}

pub fn proximity(sample: &PnlSample, cfg: &ThresholdConfig) -> Proximity {
    if should_trigger(sample, cfg) {
        Proximity::Breached
    } else if cfg.value < 0.0 && sample.value <= cfg.value * APPROACH_RATIO {
        Proximity::Approaching
    } else {
        Proximity::Normal
    }
}
