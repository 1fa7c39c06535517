//! Notification sink. Fire-and-forget: a failed notification is logged and
//! never changes what the caller does next.
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::NotifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub title: String,
    pub message: String,
}

impl Event {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }
}

pub trait Notifier {
    async fn notify(&self, event: Event, severity: Severity);
}

impl<T: Notifier> Notifier for &T {
    async fn notify(&self, event: Event, severity: Severity) {
        (**self).notify(event, severity).await
    }
}

/// Logs every event and, if configured, runs a desktop notification command.
pub struct CommandNotifier {
    command: Option<String>,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(config: &NotifyConfig, timeout: Duration) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout,
        }
    }
}

fn build_args(args: &[String], event: &Event) -> Vec<String> {
    args.iter()
        .map(|arg| {
            arg.replace("{title}", &event.title)
                .replace("{message}", &event.message)
        })
        .collect()
}

impl Notifier for CommandNotifier {
    async fn notify(&self, event: Event, severity: Severity) {
        match severity {
            Severity::Info => tracing::info!(title = %event.title, "{}", event.message),
            Severity::Warning => tracing::warn!(title = %event.title, "{}", event.message),
            Severity::Critical => tracing::error!(title = %event.title, "{}", event.message),
        }

        let Some(command) = self.command.as_deref() else {
            return;
        };
        let args = build_args(&self.args, &event);
        let child = Command::new(command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(command, error = %e, "failed to spawn notification command");
                return;
            }
        };
        // Reaped off the caller's path; the trigger path never waits on a notifier.
        let command = command.to_string();
        let timeout = self.timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) if !status.success() => {
                    tracing::debug!(command, code = ?status.code(), "notification command failed");
                }
                Ok(Err(e)) => tracing::debug!(command, error = %e, "notification command failed"),
                Err(_) => {
                    tracing::debug!(command, "notification command timed out, killing it");
                    let _ = child.kill().await;
                }
                Ok(Ok(_)) => {}
            }
        });
    }
}
