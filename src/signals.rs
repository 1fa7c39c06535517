//! Soft-signal policy for the monitor.
//!
//! Each catchable termination signal maps to an action. The hardened table
//! ignores all of them (logging each one), so only SIGKILL, which no process can
//! catch, or the gated stop command ends the monitor. The permissive table
//! honors them with a clean shutdown.

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    IgnoreAndLog,
    /// Request a clean shutdown.
    Honor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalPolicy {
    table: Vec<(Signal, SignalAction)>,
}

/// The signals the policy covers. SIGKILL and SIGSTOP cannot be caught.
pub const SOFT_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

impl SignalPolicy {
    pub fn hardened() -> Self {
        Self::uniform(SignalAction::IgnoreAndLog)
    }

    pub fn permissive() -> Self {
        Self::uniform(SignalAction::Honor)
    }

    pub fn from_config(harden: bool) -> Self {
        if harden {
            Self::hardened()
        } else {
            Self::permissive()
        }
    }

    fn uniform(action: SignalAction) -> Self {
        Self {
            table: SOFT_SIGNALS.iter().map(|s| (*s, action)).collect(),
        }
    }

    pub fn action(&self, signal: Signal) -> Option<SignalAction> {
        self.table
            .iter()
            .find(|(s, _)| *s == signal)
            .map(|(_, action)| *action)
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[(Signal, SignalAction)] {
        &self.table
    }

    /// Install a listener per table entry. Honored signals arrive on the returned channel;
    /// ignored ones are logged and dropped.
    ///
    /// Installing a tokio listener replaces the default disposition, so an ignored
    /// signal no longer terminates the process.
    pub fn install(&self) -> std::io::Result<mpsc::UnboundedReceiver<Signal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        for (sig, action) in self.table.iter().copied() {
            let mut stream = signal(SignalKind::from_raw(sig as i32))?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    match action {
                        SignalAction::IgnoreAndLog => {
                            warn!(signal = %sig, "ignoring termination signal; use `pnl-guard stop`");
                        }
                        SignalAction::Honor => {
                            info!(signal = %sig, "termination signal received, shutting down");
                            if tx.send(sig).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        Ok(rx)
    }
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self::hardened()
    }
}
