#![cfg(unix)]

use std::time::{Duration, Instant};

use anyhow::{Result, ensure};
use pipexec::{Command, CommandSpec, StartConfig};
use serial_test::serial;
use tokio::signal::unix::{SignalKind, signal};

#[tokio::test]
#[serial]
async fn sigterm_to_the_parent_kills_the_child() -> Result<()> {
    // Keep a handler of our own registered so SIGTERM never takes the default
    // action on the test process.
    let mut own = signal(SignalKind::terminate())?;

    let mut sleeper = Command::new(CommandSpec::new("sleep").arg("10"));
    sleeper.start(StartConfig::new()).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let began = Instant::now();
    let status = std::process::Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()?;
    ensure!(status.success(), "kill exited with {status}");

    let result = sleeper.wait().await?;
    own.recv().await;

    assert!(began.elapsed() < Duration::from_secs(5));
    assert!(result.cancelled);
    assert!(!result.done_ok);
    Ok(())
}

#[tokio::test]
#[serial]
async fn signal_listening_can_be_disabled() -> Result<()> {
    let mut own = signal(SignalKind::terminate())?;

    let mut sleeper = Command::new(
        CommandSpec::new("sleep")
            .arg("10")
            .timeout(Duration::from_millis(800)),
    );
    sleeper
        .start(StartConfig::new().cancel_on_signal(false))
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::process::Command::new("kill")
        .args(["-TERM", &std::process::id().to_string()])
        .status()?;
    own.recv().await;

    let result = sleeper.wait().await?;
    assert!(result.timed_out);
    assert!(!result.cancelled);
    Ok(())
}
