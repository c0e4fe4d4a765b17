use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

/// One of the three standard streams of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    /// Descriptor number the stream occupies inside the child.
    pub const fn child_fd(self) -> RawFd {
        match self {
            Self::Stdin => libc::STDIN_FILENO,
            Self::Stdout => libc::STDOUT_FILENO,
            Self::Stderr => libc::STDERR_FILENO,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("stdin"),
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Where a child's standard stream is connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Redirect {
    /// Create a pipe pair; the parent keeps the other end.
    #[default]
    Pipe,
    /// Install this descriptor in the child. The parent keeps ownership of it
    /// and the child handle never closes it.
    Fd(RawFd),
}

/// Description of a program to launch.
///
/// `argv[0]` is both the program to execute and the name the child sees.
/// Without a replacement environment the program is looked up on `PATH`;
/// with one it must be a path, since the lookup would otherwise use a `PATH`
/// the child does not have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    stdin: Redirect,
    stdout: Redirect,
    stderr: Redirect,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self::from_argv([program.into()])
    }

    /// Build a command from a complete argument vector. An empty vector is
    /// accepted here and rejected at spawn time.
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            env: None,
            stdin: Redirect::Pipe,
            stdout: Redirect::Pipe,
            stderr: Redirect::Pipe,
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Directory the child changes into before executing the program.
    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Replace the child's environment with exactly these variables.
    pub fn environment<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn stdin(&mut self, redirect: Redirect) -> &mut Self {
        self.stdin = redirect;
        self
    }

    pub fn stdout(&mut self, redirect: Redirect) -> &mut Self {
        self.stdout = redirect;
        self
    }

    pub fn stderr(&mut self, redirect: Redirect) -> &mut Self {
        self.stderr = redirect;
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env(&self) -> Option<&BTreeMap<String, String>> {
        self.env.as_ref()
    }

    pub fn redirect(&self, stream: Stream) -> Redirect {
        match stream {
            Stream::Stdin => self.stdin,
            Stream::Stdout => self.stdout,
            Stream::Stderr => self.stderr,
        }
    }

    /// Human-readable rendering for logs and error messages.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}
