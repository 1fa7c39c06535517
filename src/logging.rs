use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Install the global subscriber: a terminal layer plus, when `log_dir` is given,
/// a daily-rolling `<log_dir>/<file_name>.YYYY-MM-DD` file.
///
/// The returned guard flushes the file writer when dropped, so it must live until exit.
pub fn init(verbose: bool, log_dir: Option<&Path>, file_name: &str) -> Option<WorkerGuard> {
    let filter = || {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        }
    };

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let Some(dir) = log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) else {
        tracing_subscriber::registry().with(stderr_layer).init();
        return None;
    };

    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Some(guard)
}
