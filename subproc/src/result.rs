use std::borrow::Cow;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

/// Outcome of one [`run_process`](crate::run_process) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// Raw wait status of the child; `status.into_raw()` recovers the value
    /// `waitpid` reported.
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Wall-clock time of the whole call, spawn to final drain.
    pub elapsed: Duration,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, mapping death-by-signal to `128 + signal` like a shell.
    pub fn exit_code(&self) -> i32 {
        exit_code(self.status)
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Exit code of `status`, or `128 + signal` for a child killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map(|sig| 128 + sig).unwrap_or(1))
}
