//! Termination requests for a running command.
//!
//! A [`Canceller`] is owned by the task that owns the child process. It
//! resolves when the first of these fires: an explicit kill through the
//! [`ProcessHandle`](crate::ProcessHandle), the caller's
//! [`CancellationToken`], the command's deadline, or an interrupt/terminate
//! signal delivered to this process.

use std::future::pending;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a process was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The command's deadline elapsed.
    Timeout,
    /// The caller's cancellation token fired.
    Token,
    /// Ctrl+C or SIGTERM reached this process.
    Signal,
    /// [`ProcessHandle::kill`](crate::ProcessHandle::kill) was called.
    Kill,
}

#[derive(Debug, Clone)]
pub struct Canceller {
    kill: CancellationToken,
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
    signals: bool,
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

impl Canceller {
    /// A canceller that only reacts to explicit kills.
    pub fn new() -> Self {
        Self {
            kill: CancellationToken::new(),
            token: None,
            deadline: None,
            signals: false,
        }
    }

    pub fn with_token(mut self, token: Option<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Arm a deadline `timeout` from now; `None` or zero leaves it unbounded.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout
            .filter(|timeout| !timeout.is_zero())
            .map(|timeout| Instant::now() + timeout);
        self
    }

    pub fn listen_for_signals(mut self, enabled: bool) -> Self {
        self.signals = enabled;
        self
    }

    /// Token whose cancellation requests an immediate kill.
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Resolves with the first trigger that fires. Never resolves if nothing
    /// is armed and nobody kills.
    pub async fn cancelled(&self) -> CancelReason {
        let token = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };
        let signal = async {
            if self.signals {
                shutdown_signal().await;
            } else {
                pending::<()>().await;
            }
        };

        tokio::select! {
            _ = self.kill.cancelled() => CancelReason::Kill,
            _ = deadline => CancelReason::Timeout,
            _ = token => CancelReason::Token,
            _ = signal => CancelReason::Signal,
        }
    }
}

/// Resolves when Ctrl+C, or SIGTERM on Unix, is delivered to this process.
///
/// A listener that cannot be installed stays pending instead of failing.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => debug!("received Ctrl+C"),
            Err(err) => {
                warn!(error = %err, "failed to install Ctrl+C handler");
                pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                debug!("received SIGTERM");
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
