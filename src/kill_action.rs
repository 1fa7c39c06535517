//! Kill action: runs the operator-configured command that closes the trading application.
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::KillActionConfig;
use crate::error::KillActionError;

pub trait KillAction {
    /// Run the action. Running it again after success must be harmless.
    async fn execute(&self) -> Result<(), KillActionError>;
}

pub struct CommandKillAction {
    command: Option<String>,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandKillAction {
    pub fn new(config: &KillActionConfig, timeout: Duration) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout,
        }
    }
}

impl KillAction for CommandKillAction {
    async fn execute(&self) -> Result<(), KillActionError> {
        let command = self
            .command
            .as_deref()
            .ok_or(KillActionError::NotConfigured)?;
        tracing::info!(command, args = ?self.args, "running kill action");

        let child = Command::new(command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KillActionError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| KillActionError::Timeout(self.timeout))?
            .map_err(|e| KillActionError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(KillActionError::Failed {
                command: command.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
