//! Cached identity of the calling process.
//!
//! Both values are cleared in the child after `fork`, so a forked process
//! recomputes its own pid and start time instead of reporting its parent's.

use std::sync::Once;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use tracing::warn;

use crate::error::Result;
use crate::liveness::start_time_for_pid;

static ATFORK: Once = Once::new();
/// 0 when not cached.
static CACHED_PID: AtomicI32 = AtomicI32::new(0);
/// Nanoseconds since the epoch; 0 when not cached.
static CACHED_START_NANOS: AtomicI64 = AtomicI64::new(0);

/// Runs in the child right after `fork`; atomic stores only.
unsafe extern "C" fn clear_cache() {
    CACHED_PID.store(0, Ordering::Relaxed);
    CACHED_START_NANOS.store(0, Ordering::Relaxed);
}

fn register_atfork_handler() {
    ATFORK.call_once(|| {
        // SAFETY: `clear_cache` is async-signal-safe and takes no arguments.
        // Registered handlers are inherited by children, so once is enough.
        let ret = unsafe { libc::pthread_atfork(None, None, Some(clear_cache)) };
        if ret != 0 {
            warn!(errno = ret, "pthread_atfork failed, identity cache survives fork");
        }
    });
}

/// Pid of the calling process.
pub fn current_pid() -> Pid {
    let cached = CACHED_PID.load(Ordering::Relaxed);
    if cached != 0 {
        return Pid::from_raw(cached);
    }
    register_atfork_handler();
    let pid = nix::unistd::getpid();
    CACHED_PID.store(pid.as_raw(), Ordering::Relaxed);
    pid
}

/// Start time of the calling process, cached after the first lookup.
pub fn this_process_start_time() -> Result<Option<DateTime<Utc>>> {
    let cached = CACHED_START_NANOS.load(Ordering::Relaxed);
    if cached != 0 {
        return Ok(Some(DateTime::<Utc>::from_timestamp_nanos(cached)));
    }
    let started = start_time_for_pid(current_pid(), true)?;
    if let Some(nanos) = started.and_then(|t| t.timestamp_nanos_opt()) {
        CACHED_START_NANOS.store(nanos, Ordering::Relaxed);
    }
    Ok(started)
}

#[cfg(test)]
mod tests {
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork, getpid};

    use super::*;

    #[test]
    fn current_pid_matches_getpid() {
        assert_eq!(current_pid(), getpid());
        assert_eq!(CACHED_PID.load(Ordering::Relaxed), getpid().as_raw());
        assert_eq!(current_pid(), getpid());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn start_time_is_cached() {
        let first = this_process_start_time().unwrap().unwrap();
        assert_ne!(CACHED_START_NANOS.load(Ordering::Relaxed), 0);
        let second = this_process_start_time().unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn forked_child_does_not_inherit_cache() {
        let parent = current_pid();
        // SAFETY: the child only loads/stores atomics and calls getpid and
        // _exit, all async-signal-safe.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let cleared = CACHED_PID.load(Ordering::Relaxed) == 0;
                let fresh = current_pid() == getpid() && current_pid() != parent;
                let code = if cleared && fresh { 0 } else { 1 };
                // SAFETY: terminates the forked test process without running
                // the parent's atexit handlers or unwinding.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
    }
}
