use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::data_dir::DataDir;
use crate::error::ConfigError;
use crate::market_hours::MarketHours;
use crate::threshold::{ThresholdConfig, ThresholdKind};

pub const ENV_THRESHOLD: &str = "PNL_GUARD_THRESHOLD";
pub const ENV_CHECK_INTERVAL: &str = "PNL_GUARD_CHECK_INTERVAL";
pub const ENV_TEST_PNL: &str = "PNL_GUARD_TEST_PNL";
pub const ENV_TEST_MODE: &str = "PNL_GUARD_TEST_MODE";

/// Top-level configuration loaded from pnl-guard.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct GuardConfig {
    pub threshold: ThresholdSection,
    pub market_hours: MarketHoursConfig,
    pub monitor: MonitorConfig,
    pub backoff: BackoffConfig,
    pub timeouts: TimeoutConfig,
    pub watchdog: WatchdogConfig,
    pub state: StateConfig,
    pub broker: BrokerConfig,
    pub kill_action: KillActionConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdSection {
    pub value: f64,
    pub kind: ThresholdKind,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketHoursConfig {
    /// IANA zone name of the exchange's civil time.
    pub timezone: String,
    /// "HH:MM", inclusive.
    pub open: String,
    /// "HH:MM", inclusive.
    pub close: String,
    pub weekdays: Vec<String>,
}

/// What the monitor does after running the kill action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Keep polling after a cooldown; the breach latch re-arms on a non-triggering sample.
    Continue,
    /// Write a stop request and shut down; the watchdog stands down.
    Halt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub test_mode: bool,
    /// P/L reported by the simulated source in test mode.
    pub test_pnl: Option<f64>,
    pub trigger_policy: TriggerPolicy,
    pub trigger_cooldown_secs: u64,
    pub off_hours_recheck_secs: u64,
    pub wake_interval_secs: u64,
    pub harden_signals: bool,
    pub ensure_watchdog: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub jitter_ratio: f64,
    pub degraded_after: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub fetch_secs: u64,
    pub auth_secs: u64,
    pub kill_action_secs: u64,
    pub notify_secs: u64,
    pub spawn_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_secs: u64,
    pub respawn_initial_delay_secs: u64,
    pub respawn_max_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct StateConfig {
    /// Defaults to `~/.pnl-guard`.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub summary_url: String,
    pub refresh_url: String,
    /// Seed credential written by the external token tool.
    /// Relative paths resolve against the state directory.
    pub seed_credential: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct KillActionConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct NotifyConfig {
    /// Spawned per notification with `{title}` and `{message}` substituted in `args`.
    pub command: Option<String>,
    pub args: Vec<String>,
}

// --- Default implementations ---

impl Default for ThresholdSection {
    fn default() -> Self {
        Self {
            value: -300.0,
            kind: ThresholdKind::Dollar,
            check_interval_secs: 60,
        }
    }
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            timezone: "America/Los_Angeles".to_string(),
            open: "06:30".to_string(),
            close: "13:15".to_string(),
            weekdays: ["Mon", "Tue", "Wed", "Thu", "Fri"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            test_mode: false,
            test_pnl: None,
            trigger_policy: TriggerPolicy::Continue,
            trigger_cooldown_secs: 300,
            off_hours_recheck_secs: 1800,
            wake_interval_secs: 30,
            harden_signals: true,
            ensure_watchdog: true,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 2,
            max_delay_secs: 300,
            jitter_ratio: 0.25,
            degraded_after: 5,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch_secs: 15,
            auth_secs: 20,
            kill_action_secs: 30,
            notify_secs: 10,
            spawn_secs: 10,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            respawn_initial_delay_secs: 5,
            respawn_max_delay_secs: 300,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            summary_url:
                "https://ustrade.webullfinance.com/api/trading/v1/webull/asset/future/summary"
                    .to_string(),
            refresh_url: "https://userapi.webull.com/api/passport/refreshToken/refresh"
                .to_string(),
            seed_credential: PathBuf::from("seed-credential.json"),
        }
    }
}

// --- Loading and validation ---

impl GuardConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents, path)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply the `PNL_GUARD_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = lookup(ENV_THRESHOLD) {
            self.threshold.value = parse_env(ENV_THRESHOLD, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CHECK_INTERVAL) {
            self.threshold.check_interval_secs = parse_env(ENV_CHECK_INTERVAL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TEST_PNL) {
            self.monitor.test_pnl = Some(parse_env(ENV_TEST_PNL, &raw)?);
        }
        if let Some(raw) = lookup(ENV_TEST_MODE) {
            self.monitor.test_mode = parse_bool(&raw).ok_or_else(|| ConfigError::BadEnv {
                key: ENV_TEST_MODE.to_string(),
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    /// Reject configurations the monitor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.value.is_finite() || self.threshold.value >= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "threshold.value must be negative, got {}",
                self.threshold.value
            )));
        }
        if self.threshold.kind == ThresholdKind::Percent && self.threshold.value <= -100.0 {
            return Err(ConfigError::Invalid(format!(
                "percent threshold {} is below -100%",
                self.threshold.value
            )));
        }
        for (name, value) in [
            ("threshold.check_interval_secs", self.threshold.check_interval_secs),
            ("monitor.wake_interval_secs", self.monitor.wake_interval_secs),
            ("monitor.off_hours_recheck_secs", self.monitor.off_hours_recheck_secs),
            ("watchdog.check_interval_secs", self.watchdog.check_interval_secs),
            ("backoff.initial_delay_secs", self.backoff.initial_delay_secs),
            ("watchdog.respawn_initial_delay_secs", self.watchdog.respawn_initial_delay_secs),
            ("timeouts.fetch_secs", self.timeouts.fetch_secs),
            ("timeouts.auth_secs", self.timeouts.auth_secs),
            ("timeouts.kill_action_secs", self.timeouts.kill_action_secs),
            ("timeouts.notify_secs", self.timeouts.notify_secs),
            ("timeouts.spawn_secs", self.timeouts.spawn_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_ratio) {
            return Err(ConfigError::Invalid(format!(
                "backoff.jitter_ratio must be within [0, 1], got {}",
                self.backoff.jitter_ratio
            )));
        }
        if self.backoff.max_delay_secs < self.backoff.initial_delay_secs {
            return Err(ConfigError::Invalid(
                "backoff.max_delay_secs is smaller than backoff.initial_delay_secs".to_string(),
            ));
        }
        if self.watchdog.respawn_max_delay_secs < self.watchdog.respawn_initial_delay_secs {
            return Err(ConfigError::Invalid(
                "watchdog.respawn_max_delay_secs is smaller than respawn_initial_delay_secs"
                    .to_string(),
            ));
        }
        self.market_hours()?;
        Ok(())
    }

    pub fn threshold(&self) -> ThresholdConfig {
        ThresholdConfig {
            value: self.threshold.value,
            kind: self.threshold.kind,
            check_interval_secs: self.threshold.check_interval_secs,
        }
    }

    pub fn market_hours(&self) -> Result<MarketHours, ConfigError> {
        self.market_hours.build()
    }

    pub fn data_dir(&self) -> DataDir {
        DataDir::new(self.state.dir.clone().unwrap_or_else(DataDir::default_root))
    }

    pub fn seed_credential_path(&self) -> PathBuf {
        let seed = &self.broker.seed_credential;
        if seed.is_absolute() {
            seed.clone()
        } else {
            self.data_dir().root().join(seed)
        }
    }
}

impl MarketHoursConfig {
    pub fn build(&self) -> Result<MarketHours, ConfigError> {
        let tz: Tz = self.timezone.parse().map_err(|_| {
            ConfigError::Invalid(format!("unknown time zone {:?}", self.timezone))
        })?;
        let open = parse_time("market_hours.open", &self.open)?;
        let close = parse_time("market_hours.close", &self.close)?;
        if open >= close {
            return Err(ConfigError::Invalid(format!(
                "market window is inverted: open {} is not before close {}",
                self.open, self.close
            )));
        }
        let weekdays = self
            .weekdays
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| ConfigError::Invalid(format!("unknown weekday {d:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MarketHours::new(tz, open, close, weekdays))
    }
}

impl BackoffConfig {
    pub fn build(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.initial_delay_secs),
            Duration::from_secs(self.max_delay_secs),
            self.jitter_ratio,
        )
    }
}

impl WatchdogConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn respawn_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.respawn_initial_delay_secs),
            Duration::from_secs(self.respawn_max_delay_secs),
            0.0,
        )
    }
}

impl TimeoutConfig {
    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }

    pub fn auth(&self) -> Duration {
        Duration::from_secs(self.auth_secs)
    }

    pub fn kill_action(&self) -> Duration {
        Duration::from_secs(self.kill_action_secs)
    }

    pub fn notify(&self) -> Duration {
        Duration::from_secs(self.notify_secs)
    }

    pub fn spawn(&self) -> Duration {
        Duration::from_secs(self.spawn_secs)
    }
}

fn parse_time(field: &str, raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| ConfigError::Invalid(format!("{field} {raw:?} is not HH:MM")))
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::BadEnv {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
