//! Launching detached `pnl-guard` processes.
//!
//! The watchdog respawns monitors and the monitor may start a watchdog. Both run
//! the current executable in a new process group so a terminal Ctrl-C aimed at
//! the parent never reaches them. The spawner keeps the child handles and reaps
//! exited children, so a dead monitor never lingers as a zombie.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::WatchdogError;
use crate::process::{ProcessInspector, SysinfoInspector};
use crate::state::LaunchSpec;

const VISIBLE_POLL: Duration = Duration::from_millis(50);

/// A freshly started child: pid plus the OS-reported start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnedChild {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

pub trait MonitorSpawner {
    /// Start a monitor that reproduces `spec` exactly.
    async fn spawn_monitor(&self, spec: &LaunchSpec) -> Result<SpawnedChild, WatchdogError>;

    /// Collect exited children.
    fn reap(&self);
}

pub trait WatchdogSpawner {
    /// Start a watchdog that will propose `spec` as its launch configuration.
    async fn spawn_watchdog(&self, spec: &LaunchSpec) -> Result<SpawnedChild, WatchdogError>;
}

/// Arguments that make a `monitor` subcommand reproduce `spec`.
pub fn monitor_args(spec: &LaunchSpec, state_dir: &Path, verbose: bool) -> Vec<String> {
    let mut args = launch_args("monitor", spec, state_dir, verbose);
    args.push(format!("--expect-fingerprint={}", spec.fingerprint));
    args
}

pub fn watchdog_args(spec: &LaunchSpec, state_dir: &Path, verbose: bool) -> Vec<String> {
    launch_args("watchdog", spec, state_dir, verbose)
}

/// Values go in `--flag=value` form so negative thresholds are not read as flags.
fn launch_args(subcommand: &str, spec: &LaunchSpec, state_dir: &Path, verbose: bool) -> Vec<String> {
    let threshold = &spec.threshold;
    let mut args = vec![
        subcommand.to_string(),
        format!("--state-dir={}", state_dir.display()),
        format!("--threshold={}", threshold.value),
        format!("--threshold-kind={}", threshold.kind),
        format!("--interval={}", threshold.check_interval_secs),
    ];
    if let Some(path) = &spec.config_path {
        args.push(format!("--config={}", path.display()));
    }
    if spec.test_mode {
        args.push("--test-mode".to_string());
    }
    if let Some(pnl) = spec.test_pnl {
        args.push(format!("--test-pnl={pnl}"));
    }
    if verbose {
        args.push("--verbose".to_string());
    }
    args
}

pub struct CommandSpawner {
    program: PathBuf,
    /// Inserted before the subcommand arguments.
    prefix: Vec<String>,
    state_dir: PathBuf,
    verbose: bool,
    timeout: Duration,
    inspector: SysinfoInspector,
    children: Mutex<Vec<Child>>,
}

impl CommandSpawner {
    pub fn new(
        program: impl Into<PathBuf>,
        prefix: Vec<String>,
        state_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            prefix,
            state_dir: state_dir.into(),
            verbose: false,
            timeout,
            inspector: SysinfoInspector::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    /// Spawner that runs this very executable.
    pub fn current_exe(state_dir: impl Into<PathBuf>, timeout: Duration) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, Vec::new(), state_dir, timeout))
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    async fn spawn(&self, args: Vec<String>) -> Result<SpawnedChild, WatchdogError> {
        debug!(program = %self.program.display(), ?args, "spawning detached child");
        let child = Command::new(&self.program)
            .args(&self.prefix)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(WatchdogError::Spawn)?;

        let pid = child.id().ok_or_else(|| {
            WatchdogError::Spawn(std::io::Error::other("child exited before reporting a pid"))
        })?;
        self.children
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(child);

        let started_at = tokio::time::timeout(self.timeout, async {
            loop {
                if let Some(info) = self.inspector.inspect(pid) {
                    return info.started_at;
                }
                tokio::time::sleep(VISIBLE_POLL).await;
            }
        })
        .await
        .map_err(|_| WatchdogError::SpawnTimeout(self.timeout))?;

        Ok(SpawnedChild { pid, started_at })
    }

    /// Reap exited children, returning their pids and exit statuses.
    pub fn reap_exited(&self) -> Vec<(u32, ExitStatus)> {
        let mut children = self.children.lock().unwrap_or_else(|p| p.into_inner());
        let mut exited = Vec::new();
        children.retain_mut(|child| {
            let pid = child.id();
            match child.try_wait() {
                Ok(Some(status)) => {
                    if let Some(pid) = pid {
                        exited.push((pid, status));
                    }
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            }
        });
        exited
    }

    #[cfg(test)]
    pub fn live_children(&self) -> usize {
        self.children
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

impl MonitorSpawner for CommandSpawner {
    async fn spawn_monitor(&self, spec: &LaunchSpec) -> Result<SpawnedChild, WatchdogError> {
        self.spawn(monitor_args(spec, &self.state_dir, self.verbose)).await
    }

    fn reap(&self) {
        for (pid, status) in self.reap_exited() {
            info!(pid, status = %status, "reaped exited monitor");
        }
    }
}

impl WatchdogSpawner for CommandSpawner {
    async fn spawn_watchdog(&self, spec: &LaunchSpec) -> Result<SpawnedChild, WatchdogError> {
        self.spawn(watchdog_args(spec, &self.state_dir, self.verbose)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::{ThresholdConfig, ThresholdKind};

    fn spec() -> LaunchSpec {
        LaunchSpec::new(
            ThresholdConfig {
                value: -650.0,
                kind: ThresholdKind::Dollar,
                check_interval_secs: 45,
            },
            Some(PathBuf::from("/etc/pnl-guard.toml")),
            true,
            Some(-650.5),
        )
    }

    #[test]
    fn test_monitor_args_reproduce_launch_spec() {
        let spec = spec();
        let args = monitor_args(&spec, Path::new("/tmp/state"), false);
        assert_eq!(
            args,
            vec![
                "monitor".to_string(),
                "--state-dir=/tmp/state".to_string(),
                "--threshold=-650".to_string(),
                "--threshold-kind=dollar".to_string(),
                "--interval=45".to_string(),
                "--config=/etc/pnl-guard.toml".to_string(),
                "--test-mode".to_string(),
                "--test-pnl=-650.5".to_string(),
                format!("--expect-fingerprint={}", spec.fingerprint),
            ]
        );
    }

    #[test]
    fn test_watchdog_args_carry_the_same_launch_config() {
        let spec = LaunchSpec::new(spec().threshold, None, false, None);
        let args = watchdog_args(&spec, Path::new("/tmp/state"), true);
        assert_eq!(
            args,
            vec![
                "watchdog",
                "--state-dir=/tmp/state",
                "--threshold=-650",
                "--threshold-kind=dollar",
                "--interval=45",
                "--verbose",
            ]
        );
    }

    #[tokio::test]
    async fn test_spawned_child_is_detached_and_reaped() {
        let dir = tempfile::tempdir().unwrap();
        // `sh -c CMD NAME ARGS...` ignores the subcommand arguments.
        let spawner = CommandSpawner::new(
            "sh",
            vec!["-c".to_string(), "exit 0".to_string(), "pnl-guard".to_string()],
            dir.path(),
            Duration::from_secs(5),
        );
        let child = spawner.spawn_monitor(&spec()).await.unwrap();
        assert!(child.pid > 0);

        let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(child.pid as i32)));
        // A fast child may already be gone; when visible it leads its own group.
        if let Ok(pgid) = pgid {
            assert_eq!(pgid.as_raw(), child.pid as i32);
        }

        let mut reaped = Vec::new();
        for _ in 0..100 {
            reaped.extend(spawner.reap_exited());
            if !reaped.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, child.pid);
        assert_eq!(spawner.live_children(), 0);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = CommandSpawner::new(
            "/nonexistent/pnl-guard",
            Vec::new(),
            dir.path(),
            Duration::from_secs(1),
        );
        let err = spawner.spawn_watchdog(&spec()).await.unwrap_err();
        assert!(matches!(err, WatchdogError::Spawn(_)));
    }
}
