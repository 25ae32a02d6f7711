//! Host process creation.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{ExecError, Result};
use crate::spec::CommandSpec;

#[cfg(unix)]
use crate::process_group;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputMode {
    /// Read the parent's stdin.
    Inherit,
    Piped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputMode {
    /// Write straight to the parent's stream.
    Inherit,
    Piped,
}

impl OutputMode {
    fn stdio(self) -> Stdio {
        match self {
            OutputMode::Inherit => Stdio::inherit(),
            OutputMode::Piped => Stdio::piped(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SpawnPlan {
    pub(crate) stdin: InputMode,
    pub(crate) stdout: OutputMode,
    pub(crate) stderr: OutputMode,
    pub(crate) detach_new_console: bool,
    pub(crate) hide_window: bool,
}

impl SpawnPlan {
    /// Whether the child leads its own process group and is killed as one.
    ///
    /// A child that reads the terminal must stay in the foreground group or
    /// the kernel stops it on its first read.
    pub(crate) fn own_process_group(&self) -> bool {
        cfg!(unix) && (self.detach_new_console || self.stdin != InputMode::Inherit)
    }
}

pub(crate) fn spawn(spec: &CommandSpec, plan: &SpawnPlan) -> Result<Child> {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(dir) = spec.working_dir() {
        command.current_dir(dir);
    }
    if spec.env_clear {
        command.env_clear();
    }
    command.envs(&spec.env);

    command.stdin(match plan.stdin {
        InputMode::Inherit => Stdio::inherit(),
        InputMode::Piped => Stdio::piped(),
    });
    command.stdout(plan.stdout.stdio());
    command.stderr(plan.stderr.stdio());
    command.kill_on_drop(true);

    configure_platform(&mut command, plan);

    let child = command.spawn().map_err(|source| ExecError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    debug!(
        program = %spec.program,
        pid = child.id(),
        command = %spec.display(),
        console = plan.detach_new_console || plan.hide_window,
        "spawned process"
    );
    Ok(child)
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn configure_platform(command: &mut Command, plan: &SpawnPlan) {
    let detach = plan.detach_new_console;
    let own_group = plan.own_process_group();
    if !detach && !own_group {
        return;
    }

    #[cfg(target_os = "linux")]
    let parent_pid = unsafe { libc::getpid() };

    unsafe {
        command.pre_exec(move || {
            if detach {
                process_group::detach_from_tty()?;
            } else {
                process_group::set_process_group()?;
                #[cfg(target_os = "linux")]
                process_group::set_parent_death_signal(parent_pid)?;
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn configure_platform(command: &mut Command, plan: &SpawnPlan) {
    use winapi::um::winbase::{CREATE_NEW_CONSOLE, CREATE_NO_WINDOW};

    let mut flags = 0;
    if plan.detach_new_console {
        flags |= CREATE_NEW_CONSOLE;
    } else if plan.hide_window {
        flags |= CREATE_NO_WINDOW;
    }
    if flags != 0 {
        command.creation_flags(flags);
    }
}

#[cfg(not(any(unix, windows)))]
fn configure_platform(_command: &mut Command, _plan: &SpawnPlan) {}
