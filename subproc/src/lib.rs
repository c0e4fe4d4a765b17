//! Child process management for a single subprocess at a time.
//!
//! - [`ChildProcess`]: fork/exec with per-stream redirection, non-blocking or
//!   blocking reaping, signalling, and kill-and-reap on drop.
//! - [`run_process`]: feed stdin, capture stdout/stderr and enforce a timeout
//!   with SIGTERM/SIGKILL escalation, all without blocking on any one pipe.
//! - [`Poller`]: the `poll(2)` readiness set the pump is built on.
//!
//! Everything here is synchronous; no threads are started.

mod buffer;
mod child;
mod command;
mod error;
mod escalation;
mod options;
mod poller;
mod pump;
mod result;

pub use child::ChildProcess;
pub use command::{Command, Redirect, Stream};
pub use error::{Result, SubprocError};
pub use nix::poll::PollFlags;
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
pub use options::{
    DEFAULT_GRACE_PERIOD, DEFAULT_POLL_INTERVAL, DEFAULT_READ_BLOCK_SIZE, RunOptions,
};
pub use poller::{Poller, Readiness};
pub use pump::run_process;
pub use result::{RunResult, exit_code};
