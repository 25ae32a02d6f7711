//! OS helpers that make a spawned command killable as a unit.
//!
//! - `set_process_group` runs in `pre_exec` so the child leads its own group
//!   and a kill reaches its children too.
//! - `detach_from_tty` starts a new session for commands spawned detached.
//! - `set_parent_death_signal` (Linux only) delivers `SIGTERM` to the child
//!   when the parent dies, re-checking the parent PID to avoid a race during
//!   fork/exec.
//! - `kill_process_group` sends `SIGKILL` to a whole group and treats
//!   "already gone" as success.
//!
//! On non-Unix platforms these helpers are no-ops.

use std::io;

/// Ensure the child receives SIGTERM when the original parent dies.
///
/// # Safety
/// Only call from a `pre_exec` hook; `parent_pid` must be captured before
/// spawning.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn set_parent_death_signal(parent_pid: libc::pid_t) -> io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }

    // The parent may have exited between fork and prctl.
    if unsafe { libc::getppid() } != parent_pid {
        unsafe {
            libc::raise(libc::SIGTERM);
        }
    }

    Ok(())
}

/// Start a new session so the child has no controlling TTY.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn detach_from_tty() -> io::Result<()> {
    if unsafe { libc::setsid() } == -1 {
        let err = io::Error::last_os_error();
        // EPERM: already a session leader, a new group is the best we can do.
        if err.raw_os_error() == Some(libc::EPERM) {
            return set_process_group();
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn detach_from_tty() -> io::Result<()> {
    Ok(())
}

/// Put the calling process into its own process group.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn set_process_group() -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
pub fn set_process_group() -> io::Result<()> {
    Ok(())
}

/// Send `SIGKILL` to every process in group `process_group_id`.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn kill_process_group(process_group_id: u32) -> io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(process_group_id) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("process group id {process_group_id} out of range"),
        ));
    };
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn kill_process_group(_process_group_id: u32) -> io::Result<()> {
    Ok(())
}
