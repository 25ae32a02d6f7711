//! One external-program invocation and its place in a pipe chain.
//!
//! ```no_run
//! # async fn run() -> pipexec::Result<()> {
//! use pipexec::{Command, CommandSpec, StartConfig};
//!
//! let mut producer = Command::new(CommandSpec::new("printf").arg("X\nY\n"));
//! let mut consumer = Command::new(CommandSpec::new("grep").arg("X"));
//! producer.pipe_stdout_to(&mut consumer)?;
//!
//! producer.start(StartConfig::new()).await?;
//! let result = consumer.start(StartConfig::collect()).await?;
//! assert_eq!(result.output, "X\n");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pipexec_events::StreamKind;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::{CancelReason, Canceller};
use crate::config::StartConfig;
use crate::error::{ExecError, Result, SharedWaitError};
use crate::observer::StreamObserver;
use crate::pipe::{PipeLink, Tee, TeeSummary, feed_stdin};
use crate::process::{ProcessHandle, ProcessPhase, Terminal};
use crate::result::{ExecResult, ExitInfo, aggregate};
use crate::scanner::{Capture, ScanSummary, StreamScanner};
use crate::spawn::{self, InputMode, OutputMode, SpawnPlan};
use crate::spec::CommandSpec;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// How long a killed command's output may keep flowing before its readers
/// are abandoned.
const KILLED_OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Where a command is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Constructed; pipes may still be declared.
    Configured,
    Started,
    /// A caller is blocked in [`Command::wait`].
    Waiting,
    /// Exited, every scanner drained, result fixed.
    Terminated,
    /// The process could not be created.
    Failed,
}

struct UpstreamRef {
    id: u64,
    program: String,
    phase: watch::Receiver<ProcessPhase>,
    link: Arc<PipeLink>,
}

type StdinSource = Box<dyn AsyncRead + Send + Unpin>;

/// An external program, its pipe declarations and its lifecycle.
pub struct Command {
    id: u64,
    spec: CommandSpec,
    state: CommandState,
    phase: Arc<watch::Sender<ProcessPhase>>,
    stdout_link: Option<Arc<PipeLink>>,
    stderr_link: Option<Arc<PipeLink>>,
    upstream: Option<UpstreamRef>,
    stdin_source: Option<StdinSource>,
    process: Option<ProcessHandle>,
    result: Option<ExecResult>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("spec", &self.spec)
            .field("state", &self.state)
            .field("stdout_link", &self.stdout_link)
            .field("stderr_link", &self.stderr_link)
            .field(
                "upstream",
                &self.upstream.as_ref().map(|upstream| &upstream.program),
            )
            .field("custom_stdin", &self.stdin_source.is_some())
            .field("process", &self.process)
            .finish()
    }
}

impl Command {
    /// A configured command; nothing runs until [`start`](Self::start).
    pub fn new(spec: CommandSpec) -> Self {
        let (phase, _) = watch::channel(ProcessPhase::Pending);
        Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            spec,
            state: CommandState::Configured,
            phase: Arc::new(phase),
            stdout_link: None,
            stderr_link: None,
            upstream: None,
            stdin_source: None,
            process: None,
            result: None,
        }
    }

    /// The invocation this command runs.
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Program name, as used in logs and errors.
    pub fn program(&self) -> &str {
        &self.spec.program
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CommandState {
        self.state
    }

    /// The live process, present between a successful start and the end of
    /// [`wait`](Self::wait).
    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    /// Feed this command's stdout into `downstream`'s stdin.
    pub fn pipe_stdout_to(&mut self, downstream: &mut Command) -> Result<()> {
        self.attach(StreamKind::Stdout, downstream)
    }

    /// Feed this command's stderr into `downstream`'s stdin. Piping both
    /// streams to the same downstream merges them.
    pub fn pipe_stderr_to(&mut self, downstream: &mut Command) -> Result<()> {
        self.attach(StreamKind::Stderr, downstream)
    }

    /// Copy `reader` into the child's stdin, then close it. Without a source
    /// or an upstream the child reads the parent's stdin.
    pub fn set_stdin<R>(&mut self, reader: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.state != CommandState::Configured {
            return Err(ExecError::Topology(format!(
                "cannot set stdin of `{}` after it started",
                self.spec.program
            )));
        }
        if let Some(upstream) = &self.upstream {
            return Err(ExecError::Topology(format!(
                "`{}` already reads its stdin from `{}`",
                self.spec.program, upstream.program
            )));
        }
        self.stdin_source = Some(Box::new(reader));
        Ok(())
    }

    fn attach(&mut self, stream: StreamKind, downstream: &mut Command) -> Result<()> {
        // `&mut self` and `&mut downstream` cannot alias, so a command can
        // never be piped into itself.
        if self.state != CommandState::Configured {
            return Err(ExecError::Topology(format!(
                "cannot pipe {stream} of `{}` after it started",
                self.spec.program
            )));
        }
        if downstream.state != CommandState::Configured {
            return Err(ExecError::Topology(format!(
                "cannot pipe into `{}` after it started",
                downstream.spec.program
            )));
        }
        let slot_taken = match stream {
            StreamKind::Stdout => self.stdout_link.is_some(),
            StreamKind::Stderr => self.stderr_link.is_some(),
        };
        if slot_taken {
            return Err(ExecError::Topology(format!(
                "{stream} of `{}` is already piped",
                self.spec.program
            )));
        }
        if downstream.stdin_source.is_some() {
            return Err(ExecError::Topology(format!(
                "`{}` already reads a custom stdin",
                downstream.spec.program
            )));
        }

        let link = match &downstream.upstream {
            Some(upstream) if upstream.id == self.id => Arc::clone(&upstream.link),
            Some(upstream) => {
                return Err(ExecError::Topology(format!(
                    "`{}` already receives input from `{}`",
                    downstream.spec.program, upstream.program
                )));
            }
            None => {
                let link = Arc::new(PipeLink::new(
                    self.spec.program.clone(),
                    downstream.spec.program.clone(),
                ));
                downstream.upstream = Some(UpstreamRef {
                    id: self.id,
                    program: self.spec.program.clone(),
                    phase: self.phase.subscribe(),
                    link: Arc::clone(&link),
                });
                link
            }
        };

        debug!(
            upstream = %self.spec.program,
            downstream = %downstream.spec.program,
            stream = %stream,
            "declared pipe"
        );
        match stream {
            StreamKind::Stdout => self.stdout_link = Some(link),
            StreamKind::Stderr => self.stderr_link = Some(link),
        }
        Ok(())
    }

    /// Spawn the process, wire its pipes and scanners, and (when
    /// `config.wait` is set) wait for it.
    ///
    /// A nonzero exit is reported through the result, not as an error.
    /// Starting twice fails with [`ExecError::AlreadyStarted`].
    pub async fn start(&mut self, config: StartConfig) -> Result<ExecResult> {
        if self.state != CommandState::Configured {
            return Err(ExecError::AlreadyStarted {
                program: self.spec.program.clone(),
            });
        }

        let console = config.console_mode();
        let scan_stdout = config.scan_stdout && !console;
        let scan_stderr = config.scan_stderr && !console;
        let piped_output = |scan: bool, link: &Option<Arc<PipeLink>>| {
            if scan || link.is_some() {
                OutputMode::Piped
            } else {
                OutputMode::Inherit
            }
        };
        let plan = SpawnPlan {
            stdin: if self.upstream.is_some() || self.stdin_source.is_some() {
                InputMode::Piped
            } else {
                InputMode::Inherit
            },
            stdout: piped_output(scan_stdout, &self.stdout_link),
            stderr: piped_output(scan_stderr, &self.stderr_link),
            detach_new_console: config.detach_new_console,
            hide_window: config.hide_window,
        };

        let mut child = match spawn::spawn(&self.spec, &plan) {
            Ok(child) => child,
            Err(err) => {
                self.fail_start(&err);
                return Err(err);
            }
        };
        let started_at = Instant::now();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let missing = [
            (StreamKind::Stdout, plan.stdout, stdout.is_none()),
            (StreamKind::Stderr, plan.stderr, stderr.is_none()),
        ]
        .into_iter()
        .find(|(_, mode, absent)| *mode == OutputMode::Piped && *absent);
        if let Some((stream, _, _)) = missing {
            if let Err(err) = child.start_kill() {
                warn!(program = %self.spec.program, error = %err, "failed to kill child");
            }
            let err = ExecError::PipeCreation {
                program: self.spec.program.clone(),
                stream,
            };
            self.fail_start(&err);
            return Err(err);
        }

        let canceller = Canceller::new()
            .with_token(config.cancel_token.clone())
            .with_timeout(self.spec.deadline())
            .listen_for_signals(config.cancel_on_signal);
        let handle = ProcessHandle::new(
            self.spec.program.clone(),
            child.id(),
            canceller.kill_token(),
            self.phase.subscribe(),
        );
        self.phase.send_replace(ProcessPhase::Running);
        self.state = CommandState::Started;
        self.process = Some(handle.clone());

        let observer = config.build_observer();
        if let Some(observer) = &observer {
            observer.on_start(&handle);
        }
        let capture = config.capture.then(Capture::default);
        let scanner = |stream: StreamKind| {
            StreamScanner::new(stream, handle.clone())
                .encoding(config.encoding)
                .print(config.print)
                .capture(capture.clone())
                .observer(observer.clone())
        };

        let mut tasks = OutputTasks::default();
        if let Some(reader) = stdout {
            tasks.wire(
                reader,
                StreamKind::Stdout,
                self.stdout_link.as_ref(),
                scan_stdout.then(|| scanner(StreamKind::Stdout)),
                &handle,
            );
        }
        if let Some(reader) = stderr {
            tasks.wire(
                reader,
                StreamKind::Stderr,
                self.stderr_link.as_ref(),
                scan_stderr.then(|| scanner(StreamKind::Stderr)),
                &handle,
            );
        }
        // The tees now hold the only write ends.
        self.close_outgoing();

        let feeder = self.wire_stdin(&mut child);

        tokio::spawn(supervise(Supervisor {
            child,
            program: self.spec.program.clone(),
            own_group: plan.own_process_group(),
            started_at,
            canceller,
            phase: Arc::clone(&self.phase),
            feeder,
            tasks,
            capture,
            observer,
            handle,
        }));

        if config.wait {
            self.wait().await
        } else {
            Ok(ExecResult::started())
        }
    }

    /// Wait for the process to terminate and every scanner to drain, then
    /// return the aggregated result. With an upstream, waits for the upstream
    /// first. Calling it again returns the same result.
    pub async fn wait(&mut self) -> Result<ExecResult> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }
        match self.state {
            CommandState::Configured => {
                return Err(ExecError::NotStarted {
                    program: self.spec.program.clone(),
                });
            }
            CommandState::Failed => return Ok(ExecResult::default()),
            _ => {}
        }

        self.wait_upstream().await?;
        self.state = CommandState::Waiting;

        let mut phase = self.phase.subscribe();
        let terminal = match phase.wait_for(ProcessPhase::is_final).await {
            Ok(phase) => phase.clone(),
            Err(_) => {
                return Err(ExecError::Wait {
                    program: self.spec.program.clone(),
                    source: io::Error::other("process supervisor is gone"),
                });
            }
        };

        self.state = CommandState::Terminated;
        self.process = None;
        let ProcessPhase::Terminated(terminal) = terminal else {
            return Ok(ExecResult::default());
        };
        let result = match &terminal.exit {
            Ok(exit) => aggregate(true, Some(exit), terminal.output.clone()),
            Err(err) => return Err(err.to_exec_error()),
        };
        self.result = Some(result.clone());
        Ok(result)
    }

    async fn wait_upstream(&self) -> Result<()> {
        let Some(upstream) = &self.upstream else {
            return Ok(());
        };
        let mut phase = upstream.phase.clone();
        let never_started = matches!(*phase.borrow(), ProcessPhase::Pending);
        if never_started {
            debug!(upstream = %upstream.program, "upstream never started");
            return Ok(());
        }

        let outcome = phase.wait_for(ProcessPhase::is_final).await.map(|p| p.clone());
        match outcome {
            Ok(ProcessPhase::Terminated(terminal)) => match &terminal.exit {
                Ok(_) => Ok(()),
                Err(err) => Err(ExecError::UpstreamWait {
                    upstream: upstream.program.clone(),
                    source: Box::new(err.to_exec_error()),
                }),
            },
            Ok(ProcessPhase::Failed(failure)) => {
                // The spawn error already went to whoever started it.
                debug!(
                    upstream = %upstream.program,
                    error = %failure.message,
                    "upstream never ran"
                );
                Ok(())
            }
            // Dropped before it started.
            Ok(_) | Err(_) => Ok(()),
        }
    }

    fn wire_stdin(&mut self, child: &mut Child) -> Option<JoinHandle<u64>> {
        let stdin = child.stdin.take()?;
        let program = self.spec.program.clone();
        if let Some(upstream) = &self.upstream {
            let reader = upstream.link.reader()?;
            return Some(tokio::spawn(feed_stdin(program, reader, stdin)));
        }
        let source = self.stdin_source.take()?;
        Some(tokio::spawn(feed_stdin(program, source, stdin)))
    }

    fn close_outgoing(&self) {
        for link in [&self.stdout_link, &self.stderr_link].into_iter().flatten() {
            link.close_write();
        }
    }

    fn fail_start(&mut self, err: &ExecError) {
        let kind = match err {
            ExecError::Spawn { source, .. } => source.kind(),
            _ => io::ErrorKind::Other,
        };
        self.close_outgoing();
        self.stdin_source = None;
        self.state = CommandState::Failed;
        self.phase
            .send_replace(ProcessPhase::Failed(SharedWaitError {
                program: self.spec.program.clone(),
                kind,
                message: err.to_string(),
            }));
        debug!(program = %self.spec.program, error = %err, "start failed");
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if self.state != CommandState::Configured {
            return;
        }
        // Never started: downstream readers get end-of-stream and an
        // upstream stops forwarding to us.
        self.close_outgoing();
        if let Some(upstream) = &self.upstream {
            drop(upstream.link.reader());
        }
    }
}

#[derive(Default)]
struct OutputTasks {
    tees: Vec<JoinHandle<TeeSummary>>,
    scanners: Vec<JoinHandle<ScanSummary>>,
}

impl OutputTasks {
    fn wire<R>(
        &mut self,
        reader: R,
        stream: StreamKind,
        link: Option<&Arc<PipeLink>>,
        scanner: Option<StreamScanner>,
        handle: &ProcessHandle,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let program = handle.program();
        let sink = link.and_then(|link| link.writer());
        match (sink, scanner) {
            (None, Some(scanner)) => {
                self.scanners.push(tokio::spawn(scanner.scan(reader)));
            }
            (Some(sink), Some(scanner)) => {
                let local = PipeLink::new(program, format!("{program} {stream} scanner"));
                let mut tee = Tee::new(program, stream).sink(sink);
                if let Some(local_sink) = local.writer() {
                    tee = tee.sink(local_sink);
                }
                local.close_write();
                if let Some(local_reader) = local.reader() {
                    self.scanners.push(tokio::spawn(scanner.scan(local_reader)));
                }
                self.tees.push(tokio::spawn(tee.run(reader, exited(handle))));
            }
            (sink, None) => {
                // Without sinks the tee still drains the pipe so the child
                // never blocks on it.
                let tee = sink
                    .into_iter()
                    .fold(Tee::new(program, stream), Tee::sink);
                self.tees.push(tokio::spawn(tee.run(reader, exited(handle))));
            }
        }
    }

    /// Join every tee, then every scanner. With a `grace` period, tasks still
    /// running once it elapses are aborted; whatever they captured so far is
    /// kept and their sinks close.
    async fn join(self, program: &str, grace: Option<Duration>) {
        let aborts: Vec<AbortHandle> = self
            .tees
            .iter()
            .map(JoinHandle::abort_handle)
            .chain(self.scanners.iter().map(JoinHandle::abort_handle))
            .collect();
        let joined = self.join_all(program);
        let Some(grace) = grace else {
            joined.await;
            return;
        };
        if tokio::time::timeout(grace, joined).await.is_err() {
            debug!(
                program = %program,
                grace = ?grace,
                "output still open after kill, abandoning readers"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }

    async fn join_all(self, program: &str) {
        for tee in self.tees {
            if let Err(err) = tee.await {
                warn!(program = %program, error = %err, "tee task failed");
            }
        }
        for scanner in self.scanners {
            match scanner.await {
                Ok(summary) => debug!(
                    program = %program,
                    bytes = summary.bytes,
                    lines = summary.lines,
                    "scanner drained"
                ),
                Err(err) => warn!(program = %program, error = %err, "scanner task failed"),
            }
        }
    }
}

fn exited(handle: &ProcessHandle) -> impl Future<Output = ()> + Send + 'static {
    let handle = handle.clone();
    async move { handle.exited().await }
}

struct Supervisor {
    child: Child,
    program: String,
    own_group: bool,
    started_at: Instant,
    canceller: Canceller,
    phase: Arc<watch::Sender<ProcessPhase>>,
    feeder: Option<JoinHandle<u64>>,
    tasks: OutputTasks,
    capture: Option<Capture>,
    observer: Option<Arc<dyn StreamObserver>>,
    handle: ProcessHandle,
}

enum Outcome {
    Exited(io::Result<std::process::ExitStatus>),
    Cancelled(CancelReason),
}

/// Owns the child until it is reaped, then drains its streams and publishes
/// the terminal phase.
async fn supervise(supervisor: Supervisor) {
    let Supervisor {
        mut child,
        program,
        own_group,
        started_at,
        canceller,
        phase,
        feeder,
        tasks,
        capture,
        observer,
        handle,
    } = supervisor;

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        reason = canceller.cancelled() => Outcome::Cancelled(reason),
    };
    let (status, reason) = match outcome {
        Outcome::Exited(status) => (status, None),
        Outcome::Cancelled(reason) => {
            terminate(&mut child, &program, own_group, reason);
            (child.wait().await, Some(reason))
        }
    };

    let exit = match status {
        Ok(status) => {
            let exit = ExitInfo::from_status(status, reason, started_at.elapsed());
            debug!(
                program = %program,
                pid = handle.pid(),
                exit_code = exit.exit_code(),
                signal = exit.signal,
                "process exited"
            );
            Ok(exit)
        }
        Err(err) => {
            warn!(program = %program, error = %err, "failed to wait for process");
            Err(SharedWaitError::from_io(&program, &err))
        }
    };
    phase.send_replace(ProcessPhase::Exited(exit.clone()));

    if let Some(feeder) = feeder {
        feeder.abort();
    }
    // A killed child may leave grandchildren holding its pipes open.
    let grace = reason.map(|_| KILLED_OUTPUT_GRACE);
    tasks.join(&program, grace).await;

    let output = capture.map(|capture| capture.take()).unwrap_or_default();
    if let (Some(observer), Ok(exit)) = (&observer, &exit) {
        observer.on_exit(exit, &handle);
    }
    phase.send_replace(ProcessPhase::Terminated(Arc::new(Terminal { exit, output })));
}

fn terminate(child: &mut Child, program: &str, own_group: bool, reason: CancelReason) {
    debug!(program = %program, pid = child.id(), reason = ?reason, "killing process");

    #[cfg(unix)]
    if own_group {
        if let Some(pid) = child.id() {
            if let Err(err) = crate::process_group::kill_process_group(pid) {
                warn!(program = %program, error = %err, "failed to kill process group");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = own_group;

    if let Err(err) = child.start_kill() {
        warn!(program = %program, error = %err, "failed to kill process");
    }
}
