//! The blocking stdio pump behind [`run_process`].
//!
//! Each of the child's pipes is a small state machine (watching, then
//! drained/done) driven by readiness events. The pump is generic over the
//! readiness source and the pipe I/O types so it can be exercised without a
//! real child.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use nix::poll::PollFlags;
use tracing::{debug, trace, warn};

use crate::buffer::{OutputBuffer, PendingInput};
use crate::child::ChildProcess;
use crate::command::{Command, Redirect, Stream};
use crate::error::{Result, SubprocError};
use crate::escalation::Escalation;
use crate::options::RunOptions;
use crate::poller::{Poller, Readiness};
use crate::result::RunResult;

/// Readiness wait once nothing is left to watch and the pump is only waiting
/// for the child to exit.
const IDLE_INTERVAL: Duration = Duration::from_millis(10);

fn readable(flags: PollFlags) -> bool {
    flags.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
}

fn writable(flags: PollFlags) -> bool {
    flags.intersects(PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
}

enum ReadState<R> {
    Watching { fd: RawFd, source: R },
    /// End of stream seen; the source has been dropped.
    Drained,
}

/// Read side of one output pipe.
struct Collector<R> {
    stream: Stream,
    state: ReadState<R>,
    output: OutputBuffer,
}

impl<R: Read> Collector<R> {
    fn new(stream: Stream, limit: Option<usize>) -> Self {
        Self {
            stream,
            state: ReadState::Drained,
            output: OutputBuffer::new(limit),
        }
    }

    fn fd(&self) -> Option<RawFd> {
        match &self.state {
            ReadState::Watching { fd, .. } => Some(*fd),
            ReadState::Drained => None,
        }
    }

    /// Perform one read. Returns `true` if another read could make progress
    /// right away.
    fn read_once(&mut self, poller: &mut impl Readiness, scratch: &mut [u8]) -> Result<bool> {
        let ReadState::Watching { fd, source } = &mut self.state else {
            return Ok(false);
        };
        let fd = *fd;
        match source.read(scratch) {
            Ok(0) => {
                poller.remove(fd, true)?;
                trace!(stream = %self.stream, fd, total = self.output.len(), "end of stream");
                self.state = ReadState::Drained;
                Ok(false)
            }
            Ok(n) => {
                trace!(stream = %self.stream, fd, bytes = n, "read");
                self.output
                    .append(self.stream, scratch.get(..n).unwrap_or_default())?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(true),
            Err(source) => Err(SubprocError::IoFailed {
                stream: self.stream,
                op: "read",
                source,
            }),
        }
    }
}

enum WriteState<'a, W> {
    Watching {
        fd: RawFd,
        sink: W,
        pending: PendingInput<'a>,
    },
    /// All input written, or the child stopped reading. The sink is dropped,
    /// which closes the child's stdin.
    Done,
}

impl<W: Write> WriteState<'_, W> {
    fn fd(&self) -> Option<RawFd> {
        match self {
            Self::Watching { fd, .. } => Some(*fd),
            Self::Done => None,
        }
    }

    fn write_ready(&mut self, poller: &mut impl Readiness) -> Result<()> {
        let Self::Watching { fd, sink, pending } = self else {
            return Ok(());
        };
        let fd = *fd;
        match sink.write(pending.remaining()) {
            Ok(n) => {
                pending.advance(n);
                trace!(fd, bytes = n, "wrote stdin");
                if n == 0 || pending.is_complete() {
                    poller.remove(fd, true)?;
                    *self = Self::Done;
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                warn!(
                    fd,
                    discarded = pending.remaining().len(),
                    "child closed stdin before consuming all input"
                );
                poller.remove(fd, true)?;
                *self = Self::Done;
                Ok(())
            }
            Err(source) => Err(SubprocError::IoFailed {
                stream: Stream::Stdin,
                op: "write",
                source,
            }),
        }
    }
}

/// Moves bytes between caller buffers and the child's pipes.
struct Pump<'a, P, R, W> {
    poller: P,
    stdin: WriteState<'a, W>,
    stdout: Collector<R>,
    stderr: Collector<R>,
    scratch: Vec<u8>,
}

impl<'a, P: Readiness, R: Read, W: Write> Pump<'a, P, R, W> {
    fn new(poller: P, options: &RunOptions) -> Self {
        Self {
            poller,
            stdin: WriteState::Done,
            stdout: Collector::new(Stream::Stdout, options.max_output_bytes),
            stderr: Collector::new(Stream::Stderr, options.max_output_bytes),
            scratch: vec![0; options.read_block_size.max(1)],
        }
    }

    fn feed(&mut self, fd: RawFd, sink: W, input: &'a [u8]) -> Result<()> {
        self.poller.add(fd, PollFlags::POLLOUT)?;
        self.stdin = WriteState::Watching {
            fd,
            sink,
            pending: PendingInput::new(input),
        };
        Ok(())
    }

    fn collect(&mut self, stream: Stream, fd: RawFd, source: R) -> Result<()> {
        let collector = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
            Stream::Stdin => return Err(SubprocError::InvalidDescriptor(fd)),
        };
        self.poller.add(fd, PollFlags::POLLIN)?;
        collector.state = ReadState::Watching { fd, source };
        Ok(())
    }

    /// Nothing is registered: no input left to write, both outputs at EOF.
    fn is_idle(&self) -> bool {
        self.poller.is_empty()
    }

    /// Wait up to `timeout` for readiness and service every ready pipe once.
    fn turn(&mut self, timeout: Duration) -> Result<()> {
        for (fd, flags) in self.poller.poll(timeout)? {
            if self.stdin.fd() == Some(fd) && writable(flags) {
                self.stdin.write_ready(&mut self.poller)?;
            } else if self.stdout.fd() == Some(fd) && readable(flags) {
                self.stdout.read_once(&mut self.poller, &mut self.scratch)?;
            } else if self.stderr.fd() == Some(fd) && readable(flags) {
                self.stderr.read_once(&mut self.poller, &mut self.scratch)?;
            }
        }
        Ok(())
    }

    /// Read whatever is still buffered in open pipes, without blocking.
    fn drain(&mut self) -> Result<()> {
        for collector in [&mut self.stdout, &mut self.stderr] {
            while collector.read_once(&mut self.poller, &mut self.scratch)? {}
        }
        Ok(())
    }

    fn into_output(self) -> (Vec<u8>, Vec<u8>) {
        if let WriteState::Watching { pending, .. } = &self.stdin {
            debug!(
                discarded = pending.remaining().len(),
                "child exited before consuming all input"
            );
        }
        (self.stdout.output.into_bytes(), self.stderr.output.into_bytes())
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` stays open for the duration of both calls since `fd`
    // is borrowed; F_GETFL/F_SETFL take no pointer arguments.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn nonblocking_file(stream: Stream, fd: OwnedFd) -> Result<File> {
    set_nonblocking(&fd).map_err(|source| SubprocError::IoFailed {
        stream,
        op: "fcntl",
        source,
    })?;
    Ok(File::from(fd))
}

/// Run `command` to completion and capture its output.
///
/// `input`, if given and non-empty, is written to the child's stdin, which is
/// then closed; otherwise stdin is closed right away. All three streams are
/// piped regardless of the redirects set on `command`. Reads and writes never
/// block, so a child that fills one pipe while waiting on another cannot
/// deadlock the call.
///
/// With `options.timeout`, a child still running after the timeout receives
/// SIGTERM, and SIGKILL once `options.grace_period` has passed on top of that.
/// Either way the call returns only after the child has exited and been
/// reaped.
///
/// Any I/O failure aborts the call; the child is then killed and reaped
/// before the error is returned.
pub fn run_process(
    command: &Command,
    input: Option<&[u8]>,
    options: &RunOptions,
) -> Result<RunResult> {
    let start = Instant::now();
    let mut command = command.clone();
    command
        .stdin(Redirect::Pipe)
        .stdout(Redirect::Pipe)
        .stderr(Redirect::Pipe);

    let mut child = ChildProcess::spawn(&command)?;
    let pid = child.pid();
    let mut pump: Pump<'_, Poller, File, File> = Pump::new(Poller::new(), options);

    // Dropping the write end unused closes the child's stdin.
    if let Some(fd) = child.take_stdin()
        && let Some(data) = input.filter(|data| !data.is_empty())
    {
        let sink = nonblocking_file(Stream::Stdin, fd)?;
        pump.feed(sink.as_raw_fd(), sink, data)?;
    }
    for (stream, fd) in [
        (Stream::Stdout, child.take_stdout()),
        (Stream::Stderr, child.take_stderr()),
    ] {
        if let Some(fd) = fd {
            let source = nonblocking_file(stream, fd)?;
            pump.collect(stream, source.as_raw_fd(), source)?;
        }
    }

    let mut escalation = Escalation::new(options.timeout, options.grace_period, start);
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        let wait = if pump.is_idle() {
            IDLE_INTERVAL.min(options.poll_interval)
        } else {
            options.poll_interval
        };
        pump.turn(wait)?;
        if let Some(signal) = escalation.step(Instant::now()) {
            debug!(%pid, %signal, elapsed_ms = start.elapsed().as_millis(), "timeout exceeded");
            child.kill(signal)?;
        }
    };

    pump.drain()?;
    let (stdout, stderr) = pump.into_output();
    let elapsed = start.elapsed();
    debug!(
        %pid,
        %status,
        elapsed_ms = elapsed.as_millis(),
        stdout_len = stdout.len(),
        stderr_len = stderr.len(),
        timed_out = escalation.is_escalating(),
        "process finished"
    );

    if options.check && !status.success() {
        return Err(SubprocError::CommandFailed {
            status,
            stdout,
            stderr,
        });
    }

    Ok(RunResult {
        status,
        stdout,
        stderr,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::io;

    use super::*;

    /// Readiness source that replays a fixed sequence of poll results.
    #[derive(Default)]
    struct ScriptedPoller {
        registered: BTreeMap<RawFd, PollFlags>,
        script: VecDeque<Vec<(RawFd, PollFlags)>>,
    }

    impl ScriptedPoller {
        fn then(mut self, events: &[(RawFd, PollFlags)]) -> Self {
            self.script.push_back(events.to_vec());
            self
        }
    }

    impl Readiness for ScriptedPoller {
        fn add(&mut self, fd: RawFd, interest: PollFlags) -> Result<()> {
            *self.registered.entry(fd).or_insert(PollFlags::empty()) |= interest;
            Ok(())
        }

        fn remove(&mut self, fd: RawFd, must_exist: bool) -> Result<()> {
            if self.registered.remove(&fd).is_none() && must_exist {
                return Err(SubprocError::NotRegistered(fd));
            }
            Ok(())
        }

        fn poll(&mut self, _timeout: Duration) -> Result<HashMap<RawFd, PollFlags>> {
            let events = self.script.pop_front().unwrap_or_default();
            Ok(events
                .into_iter()
                .filter(|(fd, _)| self.registered.contains_key(fd))
                .collect())
        }

        fn is_empty(&self) -> bool {
            self.registered.is_empty()
        }
    }

    /// Reader that returns scripted chunks and errors, then would-block.
    struct ScriptedReader {
        chunks: VecDeque<io::Result<Vec<u8>>>,
        largest_request: usize,
    }

    impl ScriptedReader {
        fn new(chunks: Vec<io::Result<&str>>) -> Self {
            Self {
                chunks: chunks
                    .into_iter()
                    .map(|c| c.map(|s| s.as_bytes().to_vec()))
                    .collect(),
                largest_request: 0,
            }
        }
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.largest_request = self.largest_request.max(buf.len());
            match self.chunks.pop_front() {
                Some(Ok(chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(ErrorKind::WouldBlock.into()),
            }
        }
    }

    /// Writer that accepts at most the scripted amount per call.
    #[derive(Default)]
    struct ScriptedSink {
        accepted: Vec<u8>,
        script: VecDeque<io::Result<usize>>,
    }

    impl Write for ScriptedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.script.pop_front() {
                Some(Ok(limit)) => limit.min(buf.len()),
                Some(Err(e)) => return Err(e),
                None => buf.len(),
            };
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    type TestPump<'a> = Pump<'a, ScriptedPoller, ScriptedReader, ScriptedSink>;

    const IN: RawFd = 20;
    const OUT: RawFd = 21;
    const ERR: RawFd = 22;
    const TICK: Duration = Duration::from_millis(1);

    fn pump<'a>(poller: ScriptedPoller, options: &RunOptions) -> TestPump<'a> {
        Pump::new(poller, options)
    }

    fn readable_event(fd: RawFd) -> (RawFd, PollFlags) {
        (fd, PollFlags::POLLIN)
    }

    fn writable_event(fd: RawFd) -> (RawFd, PollFlags) {
        (fd, PollFlags::POLLOUT)
    }

    #[test]
    fn reads_append_until_end_of_stream() {
        let poller = ScriptedPoller::default()
            .then(&[readable_event(OUT)])
            .then(&[readable_event(OUT)])
            .then(&[readable_event(OUT)]);
        let mut p = pump(poller, &RunOptions::default());
        let reader = ScriptedReader::new(vec![Ok("hel"), Ok("lo"), Ok("")]);
        p.collect(Stream::Stdout, OUT, reader).unwrap();

        for _ in 0..3 {
            p.turn(TICK).unwrap();
        }
        assert!(matches!(p.stdout.state, ReadState::Drained));
        assert!(p.is_idle());
        assert_eq!(p.into_output().0, b"hello");
    }

    #[test]
    fn hangup_without_data_reads_end_of_stream() {
        let poller = ScriptedPoller::default().then(&[(ERR, PollFlags::POLLHUP)]);
        let mut p = pump(poller, &RunOptions::default());
        p.collect(Stream::Stderr, ERR, ScriptedReader::new(vec![Ok("")]))
            .unwrap();
        p.turn(TICK).unwrap();
        assert!(matches!(p.stderr.state, ReadState::Drained));
    }

    #[test]
    fn would_block_and_interrupt_are_retried_later() {
        let poller = ScriptedPoller::default()
            .then(&[readable_event(OUT)])
            .then(&[readable_event(OUT)])
            .then(&[readable_event(OUT)]);
        let mut p = pump(poller, &RunOptions::default());
        let reader = ScriptedReader::new(vec![
            Err(ErrorKind::WouldBlock.into()),
            Err(ErrorKind::Interrupted.into()),
            Ok("x"),
        ]);
        p.collect(Stream::Stdout, OUT, reader).unwrap();
        for _ in 0..3 {
            p.turn(TICK).unwrap();
        }
        assert_eq!(p.stdout.fd(), Some(OUT));
        assert_eq!(p.into_output().0, b"x");
    }

    #[test]
    fn read_failure_is_fatal() {
        let poller = ScriptedPoller::default().then(&[readable_event(OUT)]);
        let mut p = pump(poller, &RunOptions::default());
        let reader = ScriptedReader::new(vec![Err(io::Error::other("boom"))]);
        p.collect(Stream::Stdout, OUT, reader).unwrap();
        let err = p.turn(TICK).unwrap_err();
        assert!(matches!(
            err,
            SubprocError::IoFailed {
                stream: Stream::Stdout,
                op: "read",
                ..
            }
        ));
    }

    #[test]
    fn reads_are_bounded_by_block_size() {
        let poller = ScriptedPoller::default().then(&[readable_event(OUT)]);
        let mut p = pump(poller, &RunOptions::default().with_read_block_size(4));
        let reader = ScriptedReader::new(vec![Ok("abcdefgh")]);
        p.collect(Stream::Stdout, OUT, reader).unwrap();
        p.turn(TICK).unwrap();

        let ReadState::Watching { source, .. } = &p.stdout.state else {
            panic!("stdout should still be open");
        };
        assert_eq!(source.largest_request, 4);
        assert_eq!(p.into_output().0, b"abcd");
    }

    #[test]
    fn partial_writes_resume_and_close_when_done() {
        let poller = ScriptedPoller::default()
            .then(&[writable_event(IN)])
            .then(&[writable_event(IN)])
            .then(&[writable_event(IN)]);
        let mut p = pump(poller, &RunOptions::default());
        let sink = ScriptedSink {
            script: VecDeque::from([Ok(3), Err(ErrorKind::WouldBlock.into()), Ok(100)]),
            ..Default::default()
        };
        p.feed(IN, sink, b"hello world").unwrap();

        p.turn(TICK).unwrap();
        let WriteState::Watching { sink, pending, .. } = &p.stdin else {
            panic!("stdin should still be open");
        };
        assert_eq!(sink.accepted, b"hel");
        assert_eq!(pending.remaining(), b"lo world");

        p.turn(TICK).unwrap();
        p.turn(TICK).unwrap();
        assert!(matches!(p.stdin, WriteState::Done));
        assert!(p.is_idle());
    }

    #[test]
    fn broken_pipe_discards_remaining_input() {
        let poller = ScriptedPoller::default().then(&[writable_event(IN)]);
        let mut p = pump(poller, &RunOptions::default());
        let sink = ScriptedSink {
            script: VecDeque::from([Err(ErrorKind::BrokenPipe.into())]),
            ..Default::default()
        };
        p.feed(IN, sink, b"ignored").unwrap();
        p.turn(TICK).unwrap();
        assert!(matches!(p.stdin, WriteState::Done));
        assert!(p.is_idle());
    }

    #[test]
    fn write_failure_is_fatal() {
        let poller = ScriptedPoller::default().then(&[writable_event(IN)]);
        let mut p = pump(poller, &RunOptions::default());
        let sink = ScriptedSink {
            script: VecDeque::from([Err(ErrorKind::PermissionDenied.into())]),
            ..Default::default()
        };
        p.feed(IN, sink, b"data").unwrap();
        let err = p.turn(TICK).unwrap_err();
        assert!(matches!(
            err,
            SubprocError::IoFailed {
                stream: Stream::Stdin,
                op: "write",
                ..
            }
        ));
    }

    #[test]
    fn all_ready_pipes_are_serviced_in_one_turn() {
        let poller = ScriptedPoller::default().then(&[
            readable_event(ERR),
            writable_event(IN),
            readable_event(OUT),
        ]);
        let mut p = pump(poller, &RunOptions::default());
        p.feed(IN, ScriptedSink::default(), b"in").unwrap();
        p.collect(Stream::Stdout, OUT, ScriptedReader::new(vec![Ok("out")]))
            .unwrap();
        p.collect(Stream::Stderr, ERR, ScriptedReader::new(vec![Ok("err")]))
            .unwrap();

        p.turn(TICK).unwrap();
        assert!(matches!(p.stdin, WriteState::Done));
        let (out, err) = p.into_output();
        assert_eq!(out, b"out");
        assert_eq!(err, b"err");
    }

    #[test]
    fn drain_reads_until_would_block() {
        let mut p = pump(ScriptedPoller::default(), &RunOptions::default());
        let reader = ScriptedReader::new(vec![
            Ok("a"),
            Ok("b"),
            Err(ErrorKind::WouldBlock.into()),
            Ok("c"),
        ]);
        p.collect(Stream::Stdout, OUT, reader).unwrap();
        p.collect(Stream::Stderr, ERR, ScriptedReader::new(vec![Ok("e"), Ok("")]))
            .unwrap();

        p.drain().unwrap();
        assert_eq!(p.stdout.fd(), Some(OUT));
        assert!(matches!(p.stderr.state, ReadState::Drained));
        let (out, err) = p.into_output();
        assert_eq!(out, b"ab");
        assert_eq!(err, b"e");
    }

    #[test]
    fn output_limit_aborts() {
        let poller = ScriptedPoller::default()
            .then(&[readable_event(OUT)])
            .then(&[readable_event(OUT)]);
        let mut p = pump(poller, &RunOptions::default().with_max_output_bytes(4));
        let reader = ScriptedReader::new(vec![Ok("abc"), Ok("de")]);
        p.collect(Stream::Stdout, OUT, reader).unwrap();
        p.turn(TICK).unwrap();
        let err = p.turn(TICK).unwrap_err();
        assert!(matches!(
            err,
            SubprocError::OutputLimitExceeded {
                stream: Stream::Stdout,
                limit: 4
            }
        ));
    }

    #[test]
    fn collecting_stdin_is_rejected() {
        let mut p = pump(ScriptedPoller::default(), &RunOptions::default());
        let err = p
            .collect(Stream::Stdin, IN, ScriptedReader::new(vec![]))
            .unwrap_err();
        assert!(matches!(err, SubprocError::InvalidDescriptor(IN)));
        assert!(p.is_idle());
    }

    #[test]
    fn idle_with_nothing_registered() {
        let p = pump(ScriptedPoller::default(), &RunOptions::default());
        assert!(p.is_idle());
    }
}
