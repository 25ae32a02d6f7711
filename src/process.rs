//! Live handle to a spawned command.
//!
//! The child itself is owned by the supervisor task in
//! [`command`](crate::command); a [`ProcessHandle`] only observes its phase
//! and forwards kill requests to that task, so the component that owns the
//! child is the only one that ever signals it.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::SharedWaitError;
use crate::result::ExitInfo;

/// Everything a command leaves behind once it is fully drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Terminal {
    pub(crate) exit: Result<ExitInfo, SharedWaitError>,
    pub(crate) output: String,
}

/// Lifecycle as published by the owner of the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProcessPhase {
    /// Declared but not spawned.
    Pending,
    Running,
    /// Reaped; forwarding pipes may close, scanners may still be draining.
    Exited(Result<ExitInfo, SharedWaitError>),
    /// Reaped and every scanner drained.
    Terminated(Arc<Terminal>),
    /// Never spawned.
    Failed(SharedWaitError),
}

impl ProcessPhase {
    pub(crate) fn has_exited(&self) -> bool {
        !matches!(self, ProcessPhase::Pending | ProcessPhase::Running)
    }

    pub(crate) fn is_final(&self) -> bool {
        matches!(self, ProcessPhase::Terminated(_) | ProcessPhase::Failed(_))
    }

    fn exit(&self) -> Option<&ExitInfo> {
        match self {
            ProcessPhase::Exited(Ok(exit)) => Some(exit),
            ProcessPhase::Terminated(terminal) => terminal.exit.as_ref().ok(),
            _ => None,
        }
    }
}

struct HandleInner {
    program: String,
    pid: Option<u32>,
    kill: CancellationToken,
    phase: watch::Receiver<ProcessPhase>,
}

/// Cheap, cloneable view of a running (or finished) process.
///
/// Passed to observer callbacks and returned by
/// [`Command::process`](crate::Command::process).
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("program", &self.inner.program)
            .field("pid", &self.inner.pid)
            .field("has_exited", &self.has_exited())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

impl ProcessHandle {
    pub(crate) fn new(
        program: impl Into<String>,
        pid: Option<u32>,
        kill: CancellationToken,
        phase: watch::Receiver<ProcessPhase>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                program: program.into(),
                pid,
                kill,
                phase,
            }),
        }
    }

    /// A handle bound to no OS process, for scanning arbitrary readers.
    /// Killing it does nothing, it never reports an exit code, and
    /// [`exited`](Self::exited) returns immediately.
    pub fn detached(label: impl Into<String>) -> Self {
        let (_tx, phase) = watch::channel(ProcessPhase::Running);
        Self::new(label, None, CancellationToken::new(), phase)
    }

    pub fn program(&self) -> &str {
        &self.inner.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Request termination. Idempotent; a no-op once the process exited.
    pub fn kill(&self) {
        self.inner.kill.cancel();
    }

    pub fn kill_requested(&self) -> bool {
        self.inner.kill.is_cancelled()
    }

    /// True once the OS reaped the process.
    pub fn has_exited(&self) -> bool {
        self.inner.phase.borrow().has_exited()
    }

    /// Exit code once the process exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.phase.borrow().exit().and_then(|exit| exit.code)
    }

    /// Wait until the process has been reaped.
    pub async fn exited(&self) {
        let mut phase = self.inner.phase.clone();
        // A dropped sender means the supervisor is gone; nothing left to wait on.
        let _ = phase.wait_for(ProcessPhase::has_exited).await;
    }
}
