use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::Result;

/// Whether `pid` names a live (or zombie) process.
///
/// Only `ESRCH` means absent; a process we may not signal (`EPERM`) exists.
pub fn pid_exists(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Whether `pid` has exited but not been reaped by its parent. A process
/// whose status cannot be read is not a zombie.
#[cfg(target_os = "linux")]
pub fn pid_is_zombie(pid: Pid) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/status"))
        .is_ok_and(|status| state_is_zombie(&status))
}

#[cfg(target_os = "linux")]
fn state_is_zombie(status: &str) -> bool {
    status
        .lines()
        .find_map(|line| line.strip_prefix("State:"))
        .is_some_and(|state| state.trim_start().starts_with('Z'))
}

/// When `pid` started, taken from the mtime of `/proc/<pid>`.
///
/// `None` if the process does not exist, or is a zombie and `allow_zombie`
/// is false.
#[cfg(target_os = "linux")]
pub fn start_time_for_pid(pid: Pid, allow_zombie: bool) -> Result<Option<DateTime<Utc>>> {
    use std::io::ErrorKind;

    let modified = match std::fs::metadata(format!("/proc/{pid}")).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !allow_zombie && pid_is_zombie(pid) {
        tracing::debug!(%pid, "ignoring start time of zombie");
        return Ok(None);
    }
    Ok(Some(DateTime::<Utc>::from(modified)))
}

#[cfg(not(target_os = "linux"))]
pub fn start_time_for_pid(_pid: Pid, _allow_zombie: bool) -> Result<Option<DateTime<Utc>>> {
    Err(crate::error::InventoryError::Unsupported(
        "process start time requires /proc",
    ))
}
