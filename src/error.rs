//! Error types surfaced by [`Command::start`](crate::Command::start) and
//! [`Command::wait`](crate::Command::wait).
//!
//! A process that runs and exits with a nonzero status is *not* an error; it
//! is reported through [`ExecResult`](crate::ExecResult). The variants below
//! cover failures of the engine itself.

use std::io;

use pipexec_events::StreamKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The host could not create the child process (not found, permission
    /// denied, resource limits).
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Obtaining the exit status failed. Distinct from "ran and failed".
    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The host did not hand out a requested redirection pipe.
    #[error("failed to create {stream} pipe for `{program}`")]
    PipeCreation { program: String, stream: StreamKind },

    /// The upstream command of a pipe chain failed to be waited on.
    #[error("upstream `{upstream}` failed: {source}")]
    UpstreamWait {
        upstream: String,
        #[source]
        source: Box<ExecError>,
    },

    #[error("`{program}` was already started")]
    AlreadyStarted { program: String },

    #[error("`{program}` has not been started")]
    NotStarted { program: String },

    /// Invalid pipe declaration.
    #[error("invalid pipe topology: {0}")]
    Topology(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ExecError {
    /// Whether the error happened before any process was created.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, ExecError::Spawn { .. } | ExecError::PipeCreation { .. })
    }
}

/// Terminal errors are shared between a command and every downstream waiting
/// on it, so the supervisor keeps a cloneable rendition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SharedWaitError {
    pub(crate) program: String,
    pub(crate) kind: io::ErrorKind,
    pub(crate) message: String,
}

impl SharedWaitError {
    pub(crate) fn from_io(program: &str, err: &io::Error) -> Self {
        Self {
            program: program.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub(crate) fn to_exec_error(&self) -> ExecError {
        ExecError::Wait {
            program: self.program.clone(),
            source: io::Error::new(self.kind, self.message.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
