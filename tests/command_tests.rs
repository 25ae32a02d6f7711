#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use pipexec::{
    Command, CommandSpec, CommandState, ExecError, ExecEvent, StartConfig,
    UNKNOWN_EXIT_CODE, event_channel,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn sh(script: &str) -> Command {
    Command::new(CommandSpec::new("sh").args(["-c", script]))
}

/// Wait, capture and scan both streams, without touching process-wide signal
/// handlers.
fn collect() -> StartConfig {
    StartConfig::collect().cancel_on_signal(false)
}

#[tokio::test]
async fn echo_hello_is_captured() -> Result<()> {
    let mut echo = Command::new(CommandSpec::new("echo").arg("hello"));
    let result = echo
        .start(
            StartConfig::new()
                .capture(true)
                .wait(true)
                .scan_stdout(true)
                .cancel_on_signal(false),
        )
        .await?;

    assert!(result.start_ok);
    assert!(result.done_ok);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.output, "hello\n");
    assert_eq!(echo.state(), CommandState::Terminated);
    assert!(echo.process().is_none());
    Ok(())
}

#[tokio::test]
async fn nonzero_exit_is_a_result_not_an_error() -> Result<()> {
    let mut failing = Command::new(CommandSpec::new("false"));
    let result = failing
        .start(StartConfig::new().wait(true).cancel_on_signal(false))
        .await?;

    assert!(result.start_ok);
    assert!(!result.done_ok);
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.output, "");

    let mut seven = sh("exit 7");
    assert_eq!(seven.start(collect()).await?.exit_code, 7);
    Ok(())
}

#[tokio::test]
async fn timeout_kills_a_long_running_process() -> Result<()> {
    let mut sleeper =
        Command::new(CommandSpec::new("sleep").arg("10").timeout(Duration::from_secs(1)));
    let began = Instant::now();
    let result = sleeper.start(collect()).await?;

    assert!(began.elapsed() < Duration::from_secs(5));
    assert!(result.start_ok);
    assert!(!result.done_ok);
    assert!(result.timed_out);
    assert!(!result.cancelled);
    assert_eq!(result.exit_code, UNKNOWN_EXIT_CODE);
    assert_eq!(result.signal, Some(9));
    Ok(())
}

#[tokio::test]
async fn timeout_returns_while_a_grandchild_holds_the_pipe() -> Result<()> {
    // Stdin is inherited, so only `sh` is killed; its `sleep` keeps stdout open.
    let mut shell = Command::new(
        CommandSpec::new("sh")
            .args(["-c", "sleep 6; echo done"])
            .timeout(Duration::from_millis(500)),
    );
    let began = Instant::now();
    let result = shell.start(collect()).await?;

    assert!(began.elapsed() < Duration::from_secs(3));
    assert!(result.timed_out);
    assert!(!result.done_ok);
    assert_eq!(result.output, "");
    Ok(())
}

#[tokio::test]
async fn second_start_is_rejected() -> Result<()> {
    let mut once = Command::new(CommandSpec::new("true"));
    once.start(collect()).await?;

    let err = once.start(collect()).await.expect_err("second start");
    assert!(matches!(err, ExecError::AlreadyStarted { ref program } if program == "true"));
    Ok(())
}

#[tokio::test]
async fn characters_concatenate_to_output() -> Result<()> {
    let chars = Arc::new(Mutex::new(String::new()));
    let lines = Arc::new(Mutex::new(Vec::new()));

    let mut printer = sh(r"printf 'a\nb\r\nc\rd'");
    let result = printer
        .start(
            collect()
                .on_char({
                    let chars = Arc::clone(&chars);
                    move |ch, _process| chars.lock().push_str(ch)
                })
                .on_line({
                    let lines = Arc::clone(&lines);
                    move |line, _process| lines.lock().push(line.to_string())
                }),
        )
        .await?;

    assert_eq!(result.output, "a\nb\r\nc\rd");
    assert_eq!(*chars.lock(), result.output);
    // Three terminators; the trailing "d" is never a line.
    assert_eq!(*lines.lock(), vec!["a", "b", "c"]);
    Ok(())
}

#[tokio::test]
async fn callbacks_receive_the_process_handle() -> Result<()> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut echo = Command::new(CommandSpec::new("echo").arg("handle"));
    echo.start(collect().on_line({
        let seen = Arc::clone(&seen);
        move |_line, process| seen.lock().push((process.program().to_string(), process.pid()))
    }))
    .await?;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "echo");
    assert!(seen[0].1.is_some());
    Ok(())
}

#[tokio::test]
async fn stdout_and_stderr_merge_into_one_capture() -> Result<()> {
    let mut both = sh("echo out; echo err >&2");
    let result = both.start(collect()).await?;

    let mut lines: Vec<&str> = result.output.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["err", "out"]);
    Ok(())
}

#[tokio::test]
async fn unscanned_streams_are_not_captured() -> Result<()> {
    let mut both = sh("echo out; echo err >&2");
    let result = both
        .start(
            StartConfig::new()
                .wait(true)
                .capture(true)
                .scan_stderr(true)
                .cancel_on_signal(false),
        )
        .await?;
    assert_eq!(result.output, "err\n");
    Ok(())
}

#[tokio::test]
async fn custom_stdin_is_fed_and_closed() -> Result<()> {
    let mut cat = Command::new(CommandSpec::new("cat"));
    cat.set_stdin(&b"fed through stdin\n"[..])?;
    let result = cat.start(collect()).await?;

    assert!(result.done_ok);
    assert_eq!(result.output, "fed through stdin\n");
    Ok(())
}

#[tokio::test]
async fn working_directory_and_environment_apply() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let expected = std::fs::canonicalize(dir.path())?
        .to_string_lossy()
        .into_owned();

    let mut pwd = Command::new(
        CommandSpec::new("sh")
            .args(["-c", r#"pwd -P; printf '%s\n' "$PIPEXEC_GREETING""#])
            .cwd(dir.path())
            .env("PIPEXEC_GREETING", "hi there"),
    );
    let result = pwd.start(collect()).await?;

    let mut lines = result.output.lines();
    assert_eq!(lines.next(), Some(expected.as_str()));
    assert_eq!(lines.next(), Some("hi there"));
    Ok(())
}

#[tokio::test]
async fn start_without_wait_then_wait() -> Result<()> {
    let mut later = sh("sleep 0.2; echo later");
    let started = later
        .start(
            StartConfig::new()
                .capture(true)
                .scan_stdout(true)
                .cancel_on_signal(false),
        )
        .await?;

    assert!(started.start_ok);
    assert!(!started.done_ok);
    assert_eq!(started.exit_code, UNKNOWN_EXIT_CODE);
    assert_eq!(later.state(), CommandState::Started);
    let process = later.process().cloned().expect("running process");
    assert!(process.pid().is_some());

    let done = later.wait().await?;
    assert!(done.done_ok);
    assert_eq!(done.output, "later\n");
    assert!(process.has_exited());
    assert_eq!(process.exit_code(), Some(0));

    // The result is fixed once terminated.
    assert_eq!(later.wait().await?, done);
    Ok(())
}

#[tokio::test]
async fn handle_kill_terminates_the_process() -> Result<()> {
    let mut sleeper = Command::new(CommandSpec::new("sleep").arg("10"));
    sleeper.start(StartConfig::new().cancel_on_signal(false)).await?;

    let began = Instant::now();
    sleeper.process().expect("running").kill();
    let result = sleeper.wait().await?;

    assert!(began.elapsed() < Duration::from_secs(5));
    assert!(result.cancelled);
    assert!(!result.timed_out);
    assert!(!result.done_ok);
    Ok(())
}

#[tokio::test]
async fn cancellation_token_kills_the_process_group() -> Result<()> {
    let token = CancellationToken::new();
    // The background `sleep` holds stdout open; only a group kill ends the
    // scan. A piped stdin puts the shell in its own group.
    let mut shell = sh("sleep 10 & sleep 10; wait");
    shell.set_stdin(tokio::io::empty())?;
    tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        }
    });

    let began = Instant::now();
    let result = shell.start(collect().cancel_token(token)).await?;

    assert!(began.elapsed() < Duration::from_secs(5));
    assert!(result.cancelled);
    assert!(!result.done_ok);
    Ok(())
}

#[tokio::test]
async fn missing_program_fails_to_start() {
    let mut missing = Command::new(CommandSpec::new("pipexec-test-missing-binary"));
    let err = missing.start(collect()).await.expect_err("spawn failure");

    assert!(err.is_spawn_failure());
    assert_eq!(missing.state(), CommandState::Failed);
    assert!(missing.process().is_none());
}

#[tokio::test]
async fn configured_encoding_decodes_output() -> Result<()> {
    // "При" in code page 866.
    let mut legacy = sh(r"printf '\217\340\250\n'");
    let result = legacy.start(collect().encoding_label("cp866")?).await?;
    assert_eq!(result.output, "При\n");
    Ok(())
}

#[tokio::test]
async fn event_channel_reports_lifecycle() -> Result<()> {
    let (observer, mut events) = event_channel();
    let mut echo = Command::new(CommandSpec::new("echo").arg("hi"));
    echo.start(collect().observer(observer)).await?;

    let mut kinds = Vec::new();
    let mut exit = None;
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
        if let ExecEvent::Exited(exited) = event {
            exit = Some(exited);
        }
    }
    assert_eq!(
        kinds,
        vec![
            "process.started",
            "stream.char",
            "stream.char",
            "stream.char",
            "stream.line",
            "process.exited",
        ]
    );
    let exit = exit.expect("exit event");
    assert_eq!(exit.exit_code, 0);
    assert!(exit.success);
    Ok(())
}

#[tokio::test]
async fn deadline_is_reported_separately_from_kill() -> Result<()> {
    let mut sleeper =
        Command::new(CommandSpec::new("sleep").arg("5").timeout(Duration::from_millis(200)));
    sleeper.start(StartConfig::new().cancel_on_signal(false)).await?;
    let process = sleeper.process().cloned().expect("running");

    process.exited().await;
    assert!(!process.kill_requested());
    assert_eq!(process.exit_code(), None);

    let result = sleeper.wait().await?;
    assert!(result.timed_out);
    assert!(!result.cancelled);
    Ok(())
}
