use std::os::fd::RawFd;
use std::process::ExitStatus;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::command::Stream;

#[derive(Debug, thiserror::Error)]
pub enum SubprocError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("spawn failed: {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: Errno,
    },

    #[error("waitpid {pid} failed: {source}")]
    WaitFailed {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("kill {pid} with {signal} failed: {source}")]
    SignalFailed {
        pid: Pid,
        signal: Signal,
        #[source]
        source: Errno,
    },

    #[error("{stream} {op} failed: {source}")]
    IoFailed {
        stream: Stream,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("poll failed: {0}")]
    PollFailed(#[source] Errno),

    #[error(
        "command returned {status}\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(.stdout),
        String::from_utf8_lossy(.stderr)
    )]
    CommandFailed {
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    #[error("{stream} exceeded the output limit of {limit} bytes")]
    OutputLimitExceeded { stream: Stream, limit: usize },

    #[error("invalid descriptor registration: fd {0}")]
    InvalidDescriptor(RawFd),

    #[error("fd {0} is not registered")]
    NotRegistered(RawFd),
}

pub type Result<T> = std::result::Result<T, SubprocError>;
