//! Ownership of one forked child and the pipe ends the parent keeps for it.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Pid};
use tracing::{debug, trace, warn};

use crate::command::{Command, Redirect, Stream};
use crate::error::{Result, SubprocError};

/// Exit code of a child that could not execute its program (shell convention).
const EXEC_FAILED_EXIT_CODE: libc::c_int = 127;

/// Everything the child needs after `fork`, built up front so the child only
/// performs async-signal-safe calls before `exec`.
struct ExecPlan {
    program: CString,
    // Owns the strings `argv_ptrs` points into.
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Option<Vec<*const libc::c_char>>,
    cwd: Option<CString>,
    empty_mask: libc::sigset_t,
}

fn c_string(command: &Command, bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        SubprocError::InvalidCommand(format!("{}: contains a NUL byte", command.display()))
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

impl ExecPlan {
    fn new(command: &Command) -> Result<Self> {
        let Some(program) = command.program() else {
            return Err(SubprocError::InvalidCommand("empty argument list".into()));
        };
        let program = c_string(command, program.as_bytes())?;
        let argv = command
            .argv()
            .iter()
            .map(|a| c_string(command, a.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let argv_ptrs = null_terminated(&argv);

        let (envp, envp_ptrs) = match command.env() {
            Some(env) => {
                let mut envp = Vec::with_capacity(env.len());
                for (key, value) in env {
                    if key.is_empty() || key.contains('=') {
                        return Err(SubprocError::InvalidCommand(format!(
                            "invalid environment variable name: {key:?}"
                        )));
                    }
                    envp.push(c_string(command, format!("{key}={value}").as_bytes())?);
                }
                let ptrs = null_terminated(&envp);
                (envp, Some(ptrs))
            }
            None => (Vec::new(), None),
        };

        let cwd = command
            .cwd()
            .map(|dir| c_string(command, dir.as_os_str().as_bytes()))
            .transpose()?;

        // SAFETY: sigset_t is plain data; sigemptyset initializes it fully.
        let empty_mask = unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            set
        };

        Ok(Self {
            program,
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            cwd,
            empty_mask,
        })
    }
}

/// How one standard stream is wired up for a spawn in progress.
struct StreamSetup {
    /// Descriptor to install in the child.
    child_fd: RawFd,
    /// Child-side pipe end, closed in the parent once the child is forked.
    child_end: Option<OwnedFd>,
    /// Parent-side pipe end, kept by the handle.
    parent_end: Option<OwnedFd>,
}

impl StreamSetup {
    fn new(command: &Command, stream: Stream) -> Result<Self> {
        match command.redirect(stream) {
            Redirect::Fd(fd) => Ok(Self {
                child_fd: fd,
                child_end: None,
                parent_end: None,
            }),
            Redirect::Pipe => {
                let (read, write) =
                    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|source| {
                        SubprocError::SpawnFailed {
                            command: command.display(),
                            source,
                        }
                    })?;
                let (child_end, parent_end) = match stream {
                    Stream::Stdin => (read, write),
                    Stream::Stdout | Stream::Stderr => (write, read),
                };
                Ok(Self {
                    child_fd: child_end.as_raw_fd(),
                    child_end: Some(child_end),
                    parent_end: Some(parent_end),
                })
            }
        }
    }
}

/// Runs in the forked child. Never returns.
///
/// Only async-signal-safe libc calls are made here: the parent may have had
/// other threads, whose locks are in an unknown state in this process.
fn exec_child(plan: &ExecPlan, fds: [RawFd; 3]) -> ! {
    const STREAMS: [Stream; 3] = [Stream::Stdin, Stream::Stdout, Stream::Stderr];
    let mut sources = fds;

    // SAFETY: every call below is async-signal-safe and operates on data that
    // was fully prepared before fork; on any failure we `_exit` immediately.
    unsafe {
        // A source in 0..=2 would be overwritten by an earlier `dup2` before
        // it is installed in its own slot; move such sources above stderr.
        for (stream, fd) in STREAMS.iter().zip(sources.iter_mut()) {
            if *fd <= libc::STDERR_FILENO && *fd != stream.child_fd() {
                let moved = libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, libc::STDERR_FILENO + 1);
                if moved == -1 {
                    libc::_exit(EXEC_FAILED_EXIT_CODE);
                }
                *fd = moved;
            }
        }
        for (stream, fd) in STREAMS.into_iter().zip(sources) {
            let target = stream.child_fd();
            let ok = if fd == target {
                // Pipe ends are O_CLOEXEC; keep this one across exec.
                libc::fcntl(fd, libc::F_SETFD, 0) != -1
            } else {
                libc::dup2(fd, target) != -1
            };
            if !ok {
                libc::_exit(EXEC_FAILED_EXIT_CODE);
            }
        }
        // Caller-supplied descriptors are not ours to leak into the program.
        for fd in fds.into_iter().chain(sources) {
            if fd > libc::STDERR_FILENO {
                libc::close(fd);
            }
        }

        // Undo the parent's signal state: Rust ignores SIGPIPE by default.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        libc::sigprocmask(libc::SIG_SETMASK, &plan.empty_mask, std::ptr::null_mut());

        if let Some(cwd) = &plan.cwd
            && libc::chdir(cwd.as_ptr()) != 0
        {
            libc::_exit(EXEC_FAILED_EXIT_CODE);
        }

        match &plan.envp_ptrs {
            Some(envp) => {
                libc::execve(plan.program.as_ptr(), plan.argv_ptrs.as_ptr(), envp.as_ptr());
            }
            None => {
                libc::execvp(plan.program.as_ptr(), plan.argv_ptrs.as_ptr());
            }
        }
        libc::_exit(EXEC_FAILED_EXIT_CODE)
    }
}

/// A running (or finished but not yet dropped) child process.
///
/// The handle is the only owner of the child's pid and of the pipe ends
/// created for it. Dropping it reaps the child: if it is still running it is
/// sent SIGKILL and waited for, so no zombie outlives the handle.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
    exit_status: Option<ExitStatus>,
    signalled: bool,
}

impl ChildProcess {
    /// Fork and execute `command`.
    ///
    /// Failing to create pipes or the process is an error here. Failing to
    /// change directory or execute the program happens in the child and shows
    /// up as exit code 127 from [`wait`](Self::wait).
    pub fn spawn(command: &Command) -> Result<Self> {
        let plan = ExecPlan::new(command)?;
        let mut stdin = StreamSetup::new(command, Stream::Stdin)?;
        let mut stdout = StreamSetup::new(command, Stream::Stdout)?;
        let mut stderr = StreamSetup::new(command, Stream::Stderr)?;
        let fds = [stdin.child_fd, stdout.child_fd, stderr.child_fd];

        // SAFETY: the child branch calls only `exec_child`, which restricts
        // itself to async-signal-safe operations before exec or _exit.
        let fork_result = unsafe { nix::unistd::fork() };
        match fork_result {
            Ok(ForkResult::Child) => exec_child(&plan, fds),
            Ok(ForkResult::Parent { child }) => {
                // Close the child's ends in the parent so EOF propagates.
                drop(stdin.child_end.take());
                drop(stdout.child_end.take());
                drop(stderr.child_end.take());
                debug!(pid = %child, command = %command.display(), "spawned child");
                Ok(Self {
                    pid: child,
                    stdin: stdin.parent_end,
                    stdout: stdout.parent_end,
                    stderr: stderr.parent_end,
                    exit_status: None,
                    signalled: false,
                })
            }
            Err(source) => Err(SubprocError::SpawnFailed {
                command: command.display(),
                source,
            }),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Write end of the child's stdin, if the parent holds it.
    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Read end of the child's stdout, if the parent holds it.
    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Read end of the child's stderr, if the parent holds it.
    pub fn stderr_fd(&self) -> Option<RawFd> {
        self.stderr.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Transfer ownership of the stdin write end to the caller.
    pub fn take_stdin(&mut self) -> Option<OwnedFd> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<OwnedFd> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<OwnedFd> {
        self.stderr.take()
    }

    /// Exit status, if the child has already been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Whether this handle has delivered a signal to the child.
    pub fn was_signalled(&self) -> bool {
        self.signalled
    }

    /// Check for exit without blocking. `Ok(None)` means still running.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.wait_with_flags(libc::WNOHANG)
    }

    /// Block until the child exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        loop {
            if let Some(status) = self.wait_with_flags(0)? {
                return Ok(status);
            }
        }
    }

    /// Poll (`poll == true`) or block for the exit status. Mirrors
    /// [`try_wait`](Self::try_wait) and [`wait`](Self::wait).
    pub fn wait_for(&mut self, poll: bool) -> Result<Option<ExitStatus>> {
        if poll {
            self.try_wait()
        } else {
            self.wait().map(Some)
        }
    }

    fn wait_with_flags(&mut self, flags: libc::c_int) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        let mut raw: libc::c_int = 0;
        loop {
            // SAFETY: `raw` is a valid out-pointer and `pid` is our own child,
            // not yet reaped (otherwise `exit_status` would be set).
            let ret = unsafe { libc::waitpid(self.pid.as_raw(), &mut raw, flags) };
            if ret == 0 {
                return Ok(None);
            }
            if ret > 0 {
                let status = ExitStatus::from_raw(raw);
                trace!(pid = %self.pid, %status, "child reaped");
                self.exit_status = Some(status);
                return Ok(Some(status));
            }
            match Errno::last() {
                Errno::EINTR => continue,
                source => {
                    return Err(SubprocError::WaitFailed {
                        pid: self.pid,
                        source,
                    });
                }
            }
        }
    }

    /// Send `signal` to the child.
    ///
    /// Once the child has been reaped its pid may belong to another process,
    /// so this becomes a no-op. A child that exited but was not yet reaped
    /// (`ESRCH`) is not an error either.
    pub fn kill(&mut self, signal: Signal) -> Result<()> {
        if self.exit_status.is_some() {
            trace!(pid = %self.pid, %signal, "child already reaped, not signalling");
            return Ok(());
        }
        match nix::sys::signal::kill(self.pid, signal) {
            Ok(()) => {
                debug!(pid = %self.pid, %signal, "signalled child");
                self.signalled = true;
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(SubprocError::SignalFailed {
                pid: self.pid,
                signal,
                source,
            }),
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        match self.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(pid = %self.pid, error = %e, "cannot reap child on drop");
                return;
            }
        }
        if let Err(e) = self.kill(Signal::SIGKILL) {
            warn!(pid = %self.pid, error = %e, "failed to kill child on drop");
        }
        if let Err(e) = self.wait() {
            warn!(pid = %self.pid, error = %e, "failed to wait for killed child");
        }
    }
}
