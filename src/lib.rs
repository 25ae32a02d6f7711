//! # pipexec
//!
//! Launch external programs, observe their output character by character and
//! line by line while they run, and chain them like shell pipes without a
//! shell.
//!
//! ## Highlights
//!
//! - **Live scanning**: stdout and stderr are decoded incrementally (UTF-8 or
//!   any WHATWG encoding) and handed to `on_char` / `on_line` callbacks or a
//!   [`StreamObserver`] as soon as bytes arrive.
//! - **Pipe chains**: [`Command::pipe_stdout_to`] and
//!   [`Command::pipe_stderr_to`] connect commands through in-memory links; a
//!   stream can be scanned and forwarded at the same time.
//! - **Cancellation**: per-command deadline, caller cancellation token, and
//!   Ctrl+C / SIGTERM handling that kills the whole process group.
//! - **Results**: [`ExecResult`] reports start/exit state, the exit code and
//!   the captured text.
//!
//! ## Quickstart
//!
//! ```no_run
//! # async fn run() -> pipexec::Result<()> {
//! use pipexec::{Command, CommandSpec, StartConfig};
//!
//! let mut echo = Command::new(CommandSpec::new("echo").arg("hello"));
//! let result = echo
//!     .start(
//!         StartConfig::new()
//!             .wait(true)
//!             .capture(true)
//!             .scan_stdout(true)
//!             .on_line(|line, process| println!("[{}] {line}", process.program())),
//!     )
//!     .await?;
//! assert_eq!(result.output, "hello\n");
//! # Ok(())
//! # }
//! ```
//!
//! Defaults for many invocations can be kept in a TOML file, see
//! [`ExecDefaults`].

pub mod cancel;
pub mod command;
pub mod config;
pub mod decode;
pub mod error;
pub mod observer;
pub mod pipe;
pub mod process;
pub mod process_group;
pub mod result;
pub mod scanner;
mod spawn;
pub mod spec;

pub use cancel::{CancelReason, Canceller, shutdown_signal};
pub use command::{Command, CommandState};
pub use config::{ExecDefaults, StartConfig, StartFlags};
pub use decode::{TextDecoder, encoding_for_label};
pub use error::{ExecError, Result};
pub use observer::{
    ChannelEmitter, ChannelObserver, EmitterObserver, StreamObserver, TextCallback, event_channel,
};
pub use pipe::{LinkReader, LinkWriter, PipeLink, Tee, TeeSummary};
pub use process::ProcessHandle;
pub use result::{ExecResult, ExitInfo, UNKNOWN_EXIT_CODE, aggregate};
pub use scanner::{Capture, LineAccumulator, ScanSummary, StreamScanner};
pub use spec::CommandSpec;

pub use pipexec_events::{ExecEvent, StreamKind};
