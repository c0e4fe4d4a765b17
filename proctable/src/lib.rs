//! Best-effort queries against the host process table.
//!
//! Nothing is cached except the calling process's own identity; every other
//! call asks the OS again. Listing goes through `ps`, so it sees what `ps`
//! sees; liveness and start time use `kill(pid, 0)` and `/proc`.

mod error;
mod identity;
mod list;
mod liveness;

pub use error::{InventoryError, Result};
pub use identity::{current_pid, this_process_start_time};
pub use list::{find_by_name_fragment, list_processes, name_for_pid};
#[cfg(target_os = "linux")]
pub use liveness::pid_is_zombie;
pub use liveness::{pid_exists, start_time_for_pid};
pub use nix::unistd::Pid;
