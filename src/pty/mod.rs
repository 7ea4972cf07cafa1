//! Pseudo-terminal driver for interactive programs.
//!
//! Spawns a child with stdin/stdout/stderr on the slave side of a PTY and
//! exposes the master side as a line iterator plus a FIFO input queue. One
//! zero-timeout `poll()` per step multiplexes reading, writing and error
//! detection, so nothing blocks except the poll itself.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Grace period for late output once the child has been reaped.
const DRAIN_GRACE: Duration = Duration::from_millis(50);
/// How long `writeline` delivery retries a full terminal buffer.
const WRITE_RETRY_LIMIT: u32 = 5000;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("no command given")]
    EmptyCommand,
    #[error("openpty failed: {0}")]
    Open(#[source] Errno),
    #[error("failed to configure pty: {0}")]
    Configure(#[source] Errno),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Tuning for a [`PtySession`].
#[derive(Debug, Clone)]
pub struct PtyConfig {
    /// Timeout of each readiness poll. Zero busy-polls.
    pub poll_timeout: Duration,
    /// Maximum bytes taken from the terminal per read.
    pub read_chunk: usize,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::ZERO,
            read_chunk: 64 * 1024,
        }
    }
}

/// Why a [`PtySession`] stopped producing lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The child exited and its output was drained.
    ChildExited,
    /// The terminal reported an error; output may be incomplete.
    TerminalError,
}

enum ReadOutcome {
    Data,
    WouldBlock,
    Closed,
}

/// A child process attached to a pseudo-terminal.
///
/// Iterating yields the child's output line by line, in emission order, with
/// trailing carriage returns stripped. Input queued with
/// [`writeline`](Self::writeline) is delivered in FIFO order whenever the
/// terminal is writable.
pub struct PtySession {
    master: OwnedFd,
    child: Child,
    program: String,
    config: PtyConfig,
    pending_input: VecDeque<String>,
    ready_lines: VecDeque<String>,
    partial: Vec<u8>,
    end: Option<StreamEnd>,
}

impl PtySession {
    /// Spawn `argv` on a fresh PTY.
    ///
    /// The child runs in its own session with the slave as controlling
    /// terminal, and with `NO_COLOR=1` and `TERM=dumb` so its output carries
    /// no color escapes.
    pub fn spawn(argv: &[String], config: PtyConfig) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or(PtyError::EmptyCommand)?;

        let pty = openpty(None, None).map_err(PtyError::Open)?;
        set_cloexec(&pty.master)?;
        set_cloexec(&pty.slave)?;

        let stdin = pty.slave.try_clone()?;
        let stdout = pty.slave.try_clone()?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env("NO_COLOR", "1")
            .env("TERM", "dumb")
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(pty.slave));

        // Safety: only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(|| {
                unistd::setsid()?;
                // Best effort: the child still works without a controlling tty.
                libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0);
                Ok(())
            });
        }

        let child = command.spawn().map_err(|source| PtyError::Spawn {
            program: program.clone(),
            source,
        })?;
        // Dropping the command closes our copies of the slave, so the master
        // sees a hangup once the child side is gone.
        drop(command);

        let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL).map_err(PtyError::Configure)?;
        let flags = OFlag::from_bits_truncate(flags);
        fcntl(
            pty.master.as_raw_fd(),
            FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
        )
        .map_err(PtyError::Configure)?;

        debug!(program = %program, pid = child.id(), "spawned on pty");

        Ok(Self {
            master: pty.master,
            child,
            program: program.clone(),
            config,
            pending_input: VecDeque::new(),
            ready_lines: VecDeque::new(),
            partial: Vec::new(),
            end: None,
        })
    }

    /// Queue `text` (plus a newline) for delivery to the child's input.
    pub fn writeline(&mut self, text: &str) {
        self.pending_input.push_back(text.to_string());
    }

    /// Why the stream ended, once it has.
    pub fn end_reason(&self) -> Option<StreamEnd> {
        self.end
    }

    /// The child's process ID.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the child to exit and return its status.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait()?)
    }

    /// Stop the child: SIGTERM, a short grace period, then SIGKILL. Reaps it.
    pub fn terminate(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        if let Ok(raw) = i32::try_from(self.child.id()) {
            let _ = signal::kill(Pid::from_raw(raw), Signal::SIGTERM);
        }
        std::thread::sleep(Duration::from_millis(100));
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        self.child.kill()?;
        Ok(self.child.wait()?)
    }

    /// One poll step: read, flush, write, and detect the end of the stream.
    fn pump(&mut self) {
        let revents = match self.poll_master(self.config.poll_timeout) {
            Ok(revents) => revents,
            Err(e) => {
                warn!(program = %self.program, "pty poll failed: {e}");
                self.end_with_error();
                return;
            }
        };

        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            warn!(program = %self.program, "terminal reported an error condition");
            self.end_with_error();
            return;
        }

        let mut saw_data = false;
        let mut closed = false;
        if revents.contains(PollFlags::POLLIN) {
            match self.read_chunk() {
                Ok(ReadOutcome::Data) => saw_data = true,
                Ok(ReadOutcome::WouldBlock) => {}
                Ok(ReadOutcome::Closed) => closed = true,
                Err(e) => {
                    warn!(program = %self.program, "pty read failed: {e}");
                    self.end_with_error();
                    return;
                }
            }
        }

        // A prompt has no trailing newline and the child is now waiting on
        // us, so an idle terminal completes the pending partial line.
        if !saw_data {
            self.flush_partial();
        }

        if revents.contains(PollFlags::POLLOUT)
            && let Some(line) = self.pending_input.pop_front()
        {
            trace!(program = %self.program, input = %line, "writing to pty");
            if let Err(e) = self.write_line(&line) {
                warn!(program = %self.program, "pty write failed: {e}");
                self.end_with_error();
                return;
            }
        }

        if saw_data {
            return;
        }
        if closed || (revents.contains(PollFlags::POLLHUP) && !revents.contains(PollFlags::POLLIN)) {
            self.end = Some(StreamEnd::ChildExited);
            return;
        }
        if self.child_has_exited() && !self.readable_within(DRAIN_GRACE) {
            self.flush_partial();
            self.end = Some(StreamEnd::ChildExited);
        }
    }

    fn poll_master(&self, timeout: Duration) -> nix::Result<PollFlags> {
        let mut events = PollFlags::POLLIN;
        if !self.pending_input.is_empty() {
            events |= PollFlags::POLLOUT;
        }
        let mut fds = [PollFd::new(self.master.as_fd(), events)];
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        loop {
            match nix::poll::poll(&mut fds, timeout) {
                Ok(0) => return Ok(PollFlags::empty()),
                Ok(_) => return Ok(fds[0].revents().unwrap_or(PollFlags::empty())),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn readable_within(&self, timeout: Duration) -> bool {
        self.poll_master(timeout)
            .map(|revents| revents.contains(PollFlags::POLLIN))
            .unwrap_or(false)
    }

    fn child_has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn read_chunk(&mut self) -> nix::Result<ReadOutcome> {
        let mut buf = vec![0u8; self.config.read_chunk.max(1)];
        match unistd::read(self.master.as_raw_fd(), &mut buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => {
                self.partial.extend_from_slice(&buf[..n]);
                self.split_lines();
                Ok(ReadOutcome::Data)
            }
            Err(Errno::EAGAIN) => Ok(ReadOutcome::WouldBlock),
            // EIO on the master means every slave descriptor is closed.
            Err(Errno::EIO) => Ok(ReadOutcome::Closed),
            Err(e) => Err(e),
        }
    }

    fn split_lines(&mut self) {
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            self.ready_lines.push_back(decode_line(&raw[..pos]));
        }
    }

    fn flush_partial(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let raw = std::mem::take(&mut self.partial);
        self.ready_lines.push_back(decode_line(&raw));
    }

    fn write_line(&self, line: &str) -> nix::Result<()> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        let mut written = 0;
        let mut retries = 0u32;
        while written < data.len() {
            match unistd::write(&self.master, &data[written..]) {
                Ok(n) => {
                    written += n;
                    retries = 0;
                }
                Err(Errno::EAGAIN) if retries < WRITE_RETRY_LIMIT => {
                    retries += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn end_with_error(&mut self) {
        self.ready_lines.clear();
        self.partial.clear();
        self.end = Some(StreamEnd::TerminalError);
    }
}

impl Iterator for PtySession {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.ready_lines.pop_front() {
                return Some(line);
            }
            if self.end.is_some() {
                return None;
            }
            self.pump();
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        // The master fd is closed by OwnedFd; make sure the child is reaped.
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.terminate();
        }
    }
}

fn set_cloexec(fd: &OwnedFd) -> Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(PtyError::Configure)?;
    Ok(())
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end_matches('\r').to_string()
}
