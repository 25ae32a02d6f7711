//! Terminal state of a command and its aggregation into [`ExecResult`].

use std::process::ExitStatus;
use std::time::Duration;

use pipexec_events::ProcessExitedEvent;

use crate::cancel::CancelReason;

/// Exit code reported when no status was ever obtained.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// What the OS reported when the process was reaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub success: bool,
    /// Terminating signal on Unix.
    pub signal: Option<i32>,
    /// Set when the engine killed the process.
    pub cancel_reason: Option<CancelReason>,
    /// Time from spawn to reaping.
    pub duration: Duration,
}

impl ExitInfo {
    pub(crate) fn from_status(
        status: ExitStatus,
        cancel_reason: Option<CancelReason>,
        duration: Duration,
    ) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            success: status.success(),
            signal,
            cancel_reason,
            duration,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(UNKNOWN_EXIT_CODE)
    }

    pub fn timed_out(&self) -> bool {
        self.cancel_reason == Some(CancelReason::Timeout)
    }

    pub fn cancelled(&self) -> bool {
        matches!(
            self.cancel_reason,
            Some(CancelReason::Token | CancelReason::Signal | CancelReason::Kill)
        )
    }
}

impl From<&ExitInfo> for ProcessExitedEvent {
    fn from(info: &ExitInfo) -> Self {
        Self {
            exit_code: info.exit_code(),
            success: info.success,
            timed_out: info.timed_out(),
            cancelled: info.cancelled(),
            signal: info.signal,
        }
    }
}

/// Outcome of [`Command::start`](crate::Command::start) or
/// [`Command::wait`](crate::Command::wait).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// The process was spawned.
    pub start_ok: bool,
    /// The process was spawned, waited on, and exited with status 0.
    pub done_ok: bool,
    /// OS exit code, or [`UNKNOWN_EXIT_CODE`] before wait or after a signal.
    pub exit_code: i32,
    /// Captured text from the scanned streams; empty unless capture was on.
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub signal: Option<i32>,
    pub duration: Option<Duration>,
}

impl Default for ExecResult {
    fn default() -> Self {
        Self {
            start_ok: false,
            done_ok: false,
            exit_code: UNKNOWN_EXIT_CODE,
            output: String::new(),
            timed_out: false,
            cancelled: false,
            signal: None,
            duration: None,
        }
    }
}

impl ExecResult {
    /// A process that is running and has not been waited on.
    pub fn started() -> Self {
        Self {
            start_ok: true,
            ..Self::default()
        }
    }
}

/// Fold the terminal state of a command into a result.
pub fn aggregate(started: bool, exit: Option<&ExitInfo>, output: String) -> ExecResult {
    let mut result = ExecResult {
        start_ok: started,
        output,
        ..ExecResult::default()
    };
    if let Some(exit) = exit.filter(|_| started) {
        result.done_ok = exit.success;
        result.exit_code = exit.exit_code();
        result.timed_out = exit.timed_out();
        result.cancelled = exit.cancelled();
        result.signal = exit.signal;
        result.duration = Some(exit.duration);
    }
    result
}
