//! Records persisted in the state directory.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::threshold::ThresholdConfig;

/// Expiry margin: a credential this close to `expires_at` is refreshed early.
const EXPIRY_MARGIN_MINS: i64 = 5;

/// Identity of the running monitor, written once at startup.
///
/// `started_at` is the OS-reported process start time, so a reader can tell the
/// recorded process apart from an unrelated one that reuses the pid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub config_fingerprint: String,
}

/// Metadata for the single-instance slot held by a monitor (or watchdog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLock {
    pub acquired_at: DateTime<Utc>,
    pub owner_pid: u32,
}

/// The watchdog's own identity, so the operator CLI can find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Present while supervision is deliberately halted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub requested_at: DateTime<Utc>,
    pub reason: String,
    pub requested_by_pid: u32,
}

/// Authoritative last-known-good configuration for respawning the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub threshold: ThresholdConfig,
    pub config_path: Option<PathBuf>,
    pub test_mode: bool,
    pub test_pnl: Option<f64>,
    pub fingerprint: String,
    pub recorded_at: DateTime<Utc>,
}

impl LaunchSpec {
    pub fn new(
        threshold: ThresholdConfig,
        config_path: Option<PathBuf>,
        test_mode: bool,
        test_pnl: Option<f64>,
    ) -> Self {
        Self {
            fingerprint: threshold.fingerprint(),
            threshold,
            config_path,
            test_mode,
            test_pnl,
            recorded_at: Utc::now(),
        }
    }

    /// Same launch configuration, ignoring when it was recorded.
    pub fn same_config(&self, other: &LaunchSpec) -> bool {
        self.fingerprint == other.fingerprint
            && self.config_path == other.config_path
            && self.test_mode == other.test_mode
            && self.test_pnl == other.test_pnl
    }
}

/// Secret string that never prints its contents.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCredential {
    pub token: Secret,
    #[serde(default)]
    pub refresh_token: Option<Secret>,
    pub device_id: String,
    pub account_id: String,
    pub fetched_at: DateTime<Utc>,
    /// `None` means unknown; the credential is used until the broker rejects it.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + Duration::minutes(EXPIRY_MARGIN_MINS),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::ThresholdKind;

    fn credential(expires_at: Option<DateTime<Utc>>) -> CachedCredential {
        CachedCredential {
            token: Secret::new("tok-123"),
            refresh_token: Some(Secret::new("ref-456")),
            device_id: "dev".to_string(),
            account_id: "acct".to_string(),
            fetched_at: Utc::now(),
            expires_at,
        }
    }

    #[test]
    fn test_secret_never_prints() {
        let cred = credential(None);
        let debug = format!("{cred:?}");
        assert!(!debug.contains("tok-123"));
        assert!(!debug.contains("ref-456"));
        assert!(debug.contains("[redacted]"));
        assert_eq!(cred.token.to_string(), "[redacted]");
        assert_eq!(cred.token.expose(), "tok-123");
    }

    #[test]
    fn test_secret_serializes_plainly() {
        let json = serde_json::to_value(credential(None)).unwrap();
        assert_eq!(json["token"], "tok-123");
    }

    #[test]
    fn test_expiry_margin() {
        let now = Utc::now();
        assert!(credential(Some(now - Duration::minutes(1))).is_expired(now));
        assert!(credential(Some(now + Duration::minutes(4))).is_expired(now));
        assert!(!credential(Some(now + Duration::minutes(30))).is_expired(now));
        assert!(!credential(None).is_expired(now));
    }

    #[test]
    fn test_launch_spec_same_config_ignores_timestamp() {
        let threshold = ThresholdConfig {
            value: -650.0,
            kind: ThresholdKind::Dollar,
            check_interval_secs: 60,
        };
        let a = LaunchSpec::new(threshold, None, true, Some(-100.0));
        let mut b = a.clone();
        b.recorded_at = a.recorded_at + Duration::hours(3);
        assert!(a.same_config(&b));
        b.test_pnl = Some(-200.0);
        assert!(!a.same_config(&b));
    }
}
