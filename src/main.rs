mod backoff;
mod broker;
mod clock;
mod config;
mod data_dir;
mod error;
mod kill_action;
mod logging;
mod market_hours;
mod monitor;
mod notify;
mod process;
mod report;
mod retry;
mod signals;
mod spawn;
mod state;
mod status;
mod stop;
mod threshold;
mod watchdog;

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{Broker, HttpBroker, SimulatedBroker};
use crate::clock::{Clock, SystemClock};
use crate::config::GuardConfig;
use crate::data_dir::DataDir;
use crate::error::{GuardError, MonitorError, WatchdogError};
use crate::kill_action::CommandKillAction;
use crate::monitor::{Monitor, MonitorSettings, ProcessIdentity};
use crate::notify::CommandNotifier;
use crate::process::{start_time_of, SysinfoInspector};
use crate::report::Report;
use crate::signals::SignalPolicy;
use crate::spawn::CommandSpawner;
use crate::state::{FsStateStore, LaunchSpec};
use crate::stop::StopSettings;
use crate::threshold::ThresholdKind;
use crate::watchdog::{Watchdog, WatchdogSettings};

/// P/L kill switch: polls account P/L during market hours and closes the
/// trading application when losses reach the configured floor.
#[derive(Parser, Debug)]
#[command(name = "pnl-guard", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "pnl-guard.toml", global = true)]
    config: PathBuf,

    /// State directory (overrides config)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervised poll loop
    Monitor {
        #[command(flatten)]
        overrides: Overrides,

        /// Refuse to start unless the threshold fingerprint matches
        #[arg(long)]
        expect_fingerprint: Option<String>,
    },
    /// Run the liveness supervisor
    Watchdog {
        #[command(flatten)]
        overrides: Overrides,

        /// Replace a differing persisted launch configuration
        #[arg(long)]
        adopt_config: bool,
    },
    /// Stop the monitor and the watchdog (asks for confirmation)
    Stop {
        /// Seconds to wait for a clean exit before SIGKILL
        #[arg(long, default_value_t = 45)]
        grace_secs: u64,

        #[arg(long, default_value = "operator stop")]
        reason: String,
    },
    /// Clear a stop request so supervision can start again
    Resume,
    /// Print liveness, lock, credential and last cycle status
    Status,
    /// Validate config, print resolved settings and the gate decision
    Check {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Overrides applied on top of the config file and environment.
#[derive(Args, Debug, Clone, Default)]
struct Overrides {
    /// Loss threshold (negative)
    #[arg(long, allow_negative_numbers = true)]
    threshold: Option<f64>,

    /// dollar or percent
    #[arg(long)]
    threshold_kind: Option<ThresholdKind>,

    /// Poll interval in seconds
    #[arg(long)]
    interval: Option<u64>,

    /// Ignore market hours and use the simulated P/L source
    #[arg(long)]
    test_mode: bool,

    /// P/L reported by the simulated source
    #[arg(long, allow_negative_numbers = true)]
    test_pnl: Option<f64>,
}

impl Overrides {
    fn apply(&self, config: &mut GuardConfig) {
        if let Some(value) = self.threshold {
            config.threshold.value = value;
        }
        if let Some(kind) = self.threshold_kind {
            config.threshold.kind = kind;
        }
        if let Some(secs) = self.interval {
            config.threshold.check_interval_secs = secs;
        }
        if self.test_mode {
            config.monitor.test_mode = true;
        }
        if let Some(pnl) = self.test_pnl {
            config.monitor.test_pnl = Some(pnl);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            eprintln!("pnl-guard: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, GuardError> {
    let empty = Overrides::default();
    let overrides = match &cli.command {
        Commands::Monitor { overrides, .. }
        | Commands::Watchdog { overrides, .. }
        | Commands::Check { overrides } => overrides,
        _ => &empty,
    };
    let config = resolve_config(&cli, overrides)?;
    let data_dir = config.data_dir();

    match &cli.command {
        Commands::Monitor {
            expect_fingerprint, ..
        } => {
            init_data_dir(&data_dir)?;
            let _log_guard = logging::init(cli.verbose, Some(&data_dir.logs_dir()), "monitor.log");
            run_monitor(&cli, &config, data_dir, expect_fingerprint.clone()).await
        }
        Commands::Watchdog { adopt_config, .. } => {
            init_data_dir(&data_dir)?;
            let _log_guard = logging::init(cli.verbose, Some(&data_dir.logs_dir()), "watchdog.log");
            run_watchdog(&cli, &config, data_dir, *adopt_config).await
        }
        Commands::Stop { grace_secs, reason } => {
            let _log_guard = logging::init(cli.verbose, None, "stop.log");
            run_stop(data_dir, Duration::from_secs(*grace_secs), reason).await
        }
        Commands::Resume => {
            let _log_guard = logging::init(cli.verbose, None, "resume.log");
            let store = FsStateStore::new(data_dir);
            match stop::resume(&store)? {
                Some(previous) => println!(
                    "Cleared stop request from {} ({}). Start the monitor to resume supervision.",
                    previous.requested_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    previous.reason
                ),
                None => println!("No stop request present."),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let store = FsStateStore::new(data_dir);
            let report = Report::gather(&store, &SysinfoInspector::new(), SystemClock.now())?;
            print!("{report}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { .. } => {
            print_check(&config, &data_dir)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Config file, then `PNL_GUARD_*` environment, then CLI flags.
fn resolve_config(cli: &Cli, overrides: &Overrides) -> Result<GuardConfig, GuardError> {
    let mut config = GuardConfig::load(&cli.config)?;
    config.apply_env()?;
    overrides.apply(&mut config);
    if let Some(dir) = &cli.state_dir {
        config.state.dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn init_data_dir(data_dir: &DataDir) -> Result<(), GuardError> {
    data_dir.init().map_err(|e| GuardError::Io {
        context: format!("failed to create state directory {}", data_dir.root().display()),
        source: e,
    })?;
    Ok(())
}

/// The launch configuration this process would hand to a respawned monitor.
fn launch_spec(cli: &Cli, config: &GuardConfig) -> LaunchSpec {
    LaunchSpec::new(
        config.threshold(),
        existing_config_path(&cli.config),
        config.monitor.test_mode,
        config.monitor.test_pnl,
    )
}

fn existing_config_path(path: &Path) -> Option<PathBuf> {
    std::fs::canonicalize(path).ok()
}

fn own_identity(inspector: &SysinfoInspector) -> ProcessIdentity {
    let pid = std::process::id();
    ProcessIdentity {
        pid,
        started_at: start_time_of(inspector, pid),
    }
}

fn install_signals(
    policy: &SignalPolicy,
) -> Result<tokio::sync::mpsc::UnboundedReceiver<nix::sys::signal::Signal>, GuardError> {
    policy.install().map_err(|e| GuardError::Io {
        context: "failed to install signal handlers".to_string(),
        source: e,
    })
}

async fn run_monitor(
    cli: &Cli,
    config: &GuardConfig,
    data_dir: DataDir,
    expect_fingerprint: Option<String>,
) -> Result<ExitCode, GuardError> {
    let store = Arc::new(FsStateStore::new(data_dir.clone()));
    let identity = own_identity(&SysinfoInspector::new());
    let settings = MonitorSettings::from_config(config, expect_fingerprint)?;

    let broker = if config.monitor.test_mode {
        let pnl = config.monitor.test_pnl.unwrap_or_else(|| {
            tracing::warn!("test mode without test_pnl, simulating a flat P/L of 0.00");
            0.0
        });
        Broker::Simulated(SimulatedBroker::new(pnl))
    } else {
        Broker::Live(HttpBroker::new(
            config.broker.summary_url.clone(),
            config.broker.refresh_url.clone(),
            config.seed_credential_path(),
            config.threshold.kind,
        )?)
    };
    let kill = CommandKillAction::new(&config.kill_action, config.timeouts.kill_action());
    let notifier = CommandNotifier::new(&config.notify, config.timeouts.notify());

    let monitor = match Monitor::start(
        settings,
        store.clone(),
        broker,
        kill,
        notifier,
        SystemClock,
        identity,
    ) {
        Ok(monitor) => monitor,
        Err(MonitorError::AlreadyRunning { holder_pid }) => {
            tracing::info!(holder_pid = ?holder_pid, "monitor already running, exiting");
            return Ok(ExitCode::SUCCESS);
        }
        Err(MonitorError::StopRequested { reason }) => {
            tracing::info!(%reason, "stop request present, not starting; run `pnl-guard resume` first");
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e.into()),
    };

    let policy = SignalPolicy::from_config(config.monitor.harden_signals);
    let monitor = monitor.with_shutdown_signals(install_signals(&policy)?);

    if config.monitor.ensure_watchdog {
        let spawner = CommandSpawner::current_exe(data_dir.root(), config.timeouts.spawn())
            .map_err(|e| GuardError::Io {
                context: "failed to locate the pnl-guard executable".to_string(),
                source: e,
            })?
            .with_verbose(cli.verbose);
        let spec = launch_spec(cli, config);
        if let Err(e) = watchdog::ensure_watchdog(store.as_ref(), &spawner, &spec, SystemClock.now()).await {
            tracing::warn!(error = %e, "failed to start a watchdog, continuing unsupervised");
        }
    }

    let exit = monitor.run().await?;
    tracing::info!(?exit, "monitor exited");
    Ok(ExitCode::SUCCESS)
}

async fn run_watchdog(
    cli: &Cli,
    config: &GuardConfig,
    data_dir: DataDir,
    adopt_config: bool,
) -> Result<ExitCode, GuardError> {
    let store = Arc::new(FsStateStore::new(data_dir.clone()));
    let inspector = SysinfoInspector::new();
    let identity = own_identity(&inspector);
    let spawner = CommandSpawner::current_exe(data_dir.root(), config.timeouts.spawn())
        .map_err(|e| GuardError::Io {
            context: "failed to locate the pnl-guard executable".to_string(),
            source: e,
        })?
        .with_verbose(cli.verbose);
    let notifier = CommandNotifier::new(&config.notify, config.timeouts.notify());

    let watchdog = match Watchdog::start(
        WatchdogSettings::from_config(config, adopt_config),
        store,
        inspector,
        spawner,
        notifier,
        SystemClock,
        identity,
        launch_spec(cli, config),
    )
    .await
    {
        Ok(watchdog) => watchdog,
        Err(WatchdogError::AlreadyRunning { holder_pid }) => {
            tracing::info!(holder_pid = ?holder_pid, "watchdog already running, exiting");
            return Ok(ExitCode::SUCCESS);
        }
        Err(WatchdogError::StopRequested { reason }) => {
            tracing::info!(%reason, "stop request present, not starting");
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e.into()),
    };

    let policy = SignalPolicy::from_config(config.monitor.harden_signals);
    let exit = watchdog
        .with_shutdown_signals(install_signals(&policy)?)
        .run()
        .await?;
    tracing::info!(?exit, "watchdog exited");
    Ok(ExitCode::SUCCESS)
}

async fn run_stop(data_dir: DataDir, grace: Duration, reason: &str) -> Result<ExitCode, GuardError> {
    let code = stop::challenge_code();
    let stdin = std::io::stdin();
    let confirmed = stop::confirm(&mut stdin.lock(), &mut std::io::stdout(), &code).map_err(|e| {
        GuardError::Io {
            context: "failed to read confirmation".to_string(),
            source: e,
        }
    })?;
    if !confirmed {
        return Ok(ExitCode::FAILURE);
    }

    let store = FsStateStore::new(data_dir);
    let settings = StopSettings {
        grace,
        ..StopSettings::default()
    };
    let report = stop::stop_all(
        &store,
        &SysinfoInspector::new(),
        &SystemClock,
        settings,
        reason,
        std::process::id(),
    )
    .await?;
    println!("Monitor:  {:?}", report.monitor);
    println!("Watchdog: {:?}", report.watchdog);
    if !report.reclaimed.is_empty() {
        println!("Reclaimed stale locks: {:?}", report.reclaimed);
    }
    println!("Supervision halted. Run `pnl-guard resume` to allow it to start again.");
    Ok(ExitCode::SUCCESS)
}

fn print_check(config: &GuardConfig, data_dir: &DataDir) -> Result<(), GuardError> {
    let threshold = config.threshold();
    let hours = config.market_hours()?;
    let now = SystemClock.now();
    let active = hours.is_active(now, config.monitor.test_mode);

    println!("Config valid.");
    println!("Threshold:     {threshold} ({})", threshold.kind);
    println!("Interval:      {}s", threshold.check_interval_secs);
    println!("Fingerprint:   {}", threshold.fingerprint());
    println!(
        "Market hours:  {}-{} {} {:?}",
        hours.open().format("%H:%M"),
        hours.close().format("%H:%M"),
        hours.timezone(),
        config.market_hours.weekdays
    );
    println!(
        "Test mode:     {}{}",
        config.monitor.test_mode,
        config
            .monitor
            .test_pnl
            .map(|p| format!(" (simulated P/L {p:.2})"))
            .unwrap_or_default()
    );
    println!("Trigger:       {:?}", config.monitor.trigger_policy);
    println!("State dir:     {}", data_dir.root().display());
    println!(
        "Kill action:   {}",
        config.kill_action.command.as_deref().unwrap_or("(not configured)")
    );
    if active {
        println!("Gate:          open now");
    } else {
        match hours.next_open(now) {
            Some(open) => println!(
                "Gate:          closed, opens {}",
                open.with_timezone(&hours.timezone()).format("%a %Y-%m-%d %H:%M %Z")
            ),
            None => println!("Gate:          closed, no trading day configured"),
        }
    }
    Ok(())
}
