//! Error types for the monitor, the watchdog and the state store.
//!
//! Recoverable errors (`AuthError`, `FetchError`, `KillActionError`) are handled
//! inside the poll loop. `StoreError` and `ConfigError` are the only ones that
//! end a process.

use std::path::PathBuf;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────
// External collaborator errors
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credential rejected by broker (status {status})")]
    Rejected { status: u16 },

    #[error("no seed credential at {path}")]
    MissingSeed { path: PathBuf },

    #[error("seed credential {path} is malformed: {details}")]
    MalformedSeed { path: PathBuf, details: String },

    #[error("credential has no refresh token")]
    NoRefreshToken,

    #[error("auth request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("auth response malformed: {0}")]
    MalformedResponse(String),

    #[error("auth call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The broker refused the credential; the caller must refresh before retrying.
    #[error("P/L request unauthorized (status {status})")]
    Unauthorized { status: u16 },

    #[error("P/L request failed with status {status}")]
    Http { status: u16 },

    #[error("P/L request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("P/L response malformed: {0}")]
    Malformed(String),

    #[error("account balance is zero, cannot normalize P/L to a percentage")]
    ZeroBalance,

    #[error("P/L fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum KillActionError {
    #[error("no kill action command configured")]
    NotConfigured,

    #[error("failed to spawn kill action {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kill action {command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("kill action timed out after {0:?}")]
    Timeout(Duration),
}

// ─────────────────────────────────────────────────────────────────────
// State store and configuration
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store I/O error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize state record: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to commit state file {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("environment override {key}={value} is not valid")]
    BadEnv { key: String, value: String },
}

// ─────────────────────────────────────────────────────────────────────
// Process-level errors
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("another monitor already holds the session lock (pid {holder_pid:?})")]
    AlreadyRunning { holder_pid: Option<u32> },

    #[error("configuration fingerprint mismatch: expected {expected}, have {actual}")]
    ConfigMismatch { expected: String, actual: String },

    #[error("supervision is halted by a stop request: {reason}")]
    StopRequested { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("another watchdog is already running (pid {holder_pid:?})")]
    AlreadyRunning { holder_pid: Option<u32> },

    #[error("supervision is halted by a stop request: {reason}")]
    StopRequested { reason: String },

    #[error("failed to spawn monitor: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("monitor spawn timed out after {0:?}")]
    SpawnTimeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything the binary can fail with.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Watchdog(#[from] WatchdogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}
