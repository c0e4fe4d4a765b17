//! Run a command through `run_process`, forwarding this program's stdin.
//!
//! ```text
//! SUBPROC_OPTIONS='{"timeout_ms": 2000, "check": true}' \
//!     cargo run -p subproc --example run -- sh -c 'cat; sleep 10'
//! ```

use std::fmt;
use std::io::{self, IsTerminal, Read, Write};
use std::process::ExitCode;
use std::time::Instant;

use subproc::{Command, RunOptions, SubprocError, run_process};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        write!(w, "[{:02}.{:03}]", d.as_secs(), d.subsec_millis())
    }
}

fn options() -> Result<RunOptions, String> {
    match std::env::var("SUBPROC_OPTIONS") {
        Ok(json) => serde_json::from_str(&json).map_err(|e| format!("SUBPROC_OPTIONS: {e}")),
        Err(_) => Ok(RunOptions::default()),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(io::stderr)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    if argv.is_empty() {
        eprintln!("usage: run <program> [args...]");
        return ExitCode::FAILURE;
    }
    let options = match options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut input = Vec::new();
    let stdin = io::stdin();
    if !stdin.is_terminal()
        && let Err(e) = stdin.lock().read_to_end(&mut input)
    {
        eprintln!("error: reading stdin: {e}");
        return ExitCode::FAILURE;
    }

    match run_process(&Command::from_argv(argv), Some(input.as_slice()), &options) {
        Ok(result) => {
            let mut out = io::stdout().lock();
            let _ = out.write_all(&result.stdout);
            let _ = io::stderr().write_all(&result.stderr);
            ExitCode::from(u8::try_from(result.exit_code()).unwrap_or(u8::MAX))
        }
        Err(SubprocError::CommandFailed { status, .. }) => {
            eprintln!("error: command returned {status}");
            ExitCode::from(u8::try_from(subproc::exit_code(status)).unwrap_or(u8::MAX))
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
