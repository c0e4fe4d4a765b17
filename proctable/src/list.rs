//! Process enumeration through `ps(1)`.

use std::collections::HashMap;

use nix::unistd::Pid;
use subproc::{Command, RunOptions, run_process};
use tracing::debug;

use crate::error::{InventoryError, Result};
use crate::identity::current_pid;

const PS: &str = "ps";

/// Run `ps` with `args` and return its stdout, or `None` when it exits
/// unsuccessfully and `check` is off.
fn ps(args: &[&str], check: bool) -> Result<Option<Vec<u8>>> {
    let path = which::which(PS).map_err(|_| InventoryError::ToolMissing(PS))?;
    let mut command = Command::new(path.to_string_lossy().into_owned());
    command.args(args.iter().copied());

    let result = run_process(&command, None, &RunOptions::default().with_check(check))?;
    Ok(result.success().then_some(result.stdout))
}

/// Keep printable ASCII only.
fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| (0x20..0x7f).contains(*b))
        .map(|&b| char::from(b))
        .collect()
}

/// `<spaces><pid><spaces><name>`. Lines without a pid or name are skipped.
fn parse_line(line: &[u8]) -> Option<(Pid, String)> {
    let line = line.trim_ascii_start();
    let digits = line.iter().take_while(|b| b.is_ascii_digit()).count();
    let (pid, rest) = line.split_at_checked(digits)?;
    let pid: i32 = std::str::from_utf8(pid).ok()?.parse().ok()?;
    if !rest.first().is_some_and(u8::is_ascii_whitespace) {
        return None;
    }
    let name = printable(rest.trim_ascii());
    let name = name.trim();
    (!name.is_empty()).then(|| (Pid::from_raw(pid), name.to_owned()))
}

fn parse_listing(output: &[u8]) -> HashMap<Pid, String> {
    output.split(|&b| b == b'\n').filter_map(parse_line).collect()
}

/// Every process visible to `ps`, keyed by pid.
///
/// The value is the short executable name, or the full command line when
/// `with_commands` is set.
pub fn list_processes(with_commands: bool) -> Result<HashMap<Pid, String>> {
    let column = if with_commands { "args=" } else { "comm=" };
    let output = ps(&["-ax", "-o", "pid=", "-o", column], true)?.unwrap_or_default();
    let processes = parse_listing(&output);
    debug!(count = processes.len(), with_commands, "listed processes");
    Ok(processes)
}

/// Short name of `pid`, or `None` if no such process is visible.
pub fn name_for_pid(pid: Pid) -> Result<Option<String>> {
    let pid_arg = pid.to_string();
    let Some(output) = ps(&["-o", "comm=", "-p", &pid_arg], false)? else {
        return Ok(None);
    };
    let name = output
        .split(|&b| b == b'\n')
        .map(|line| printable(line).trim().to_owned())
        .find(|name| !name.is_empty());
    Ok(name)
}

/// The single process whose name contains `fragment`, compared
/// case-insensitively.
///
/// With `search_commands`, full command lines are searched instead of short
/// names. With `exclude_self`, the calling process never matches.
pub fn find_by_name_fragment(
    fragment: &str,
    search_commands: bool,
    exclude_self: bool,
) -> Result<Pid> {
    let processes = list_processes(search_commands)?;
    select_match(fragment, processes, exclude_self.then(current_pid))
}

fn select_match(
    fragment: &str,
    processes: impl IntoIterator<Item = (Pid, String)>,
    exclude: Option<Pid>,
) -> Result<Pid> {
    let needle = fragment.to_lowercase();
    let mut pids: Vec<Pid> = processes
        .into_iter()
        .filter(|(pid, name)| Some(*pid) != exclude && name.to_lowercase().contains(&needle))
        .map(|(pid, _)| pid)
        .collect();

    if pids.len() > 1 {
        pids.sort_unstable();
        return Err(InventoryError::Ambiguous {
            fragment: fragment.to_owned(),
            pids,
        });
    }
    pids.pop()
        .ok_or_else(|| InventoryError::NoMatch(fragment.to_owned()))
}
