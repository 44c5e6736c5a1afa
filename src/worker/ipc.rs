//! Buffered IPC primitives for worker communication.
//!
//! Line-based I/O over pipes with EINTR handling, plus typed one-directional
//! channel endpoints carrying JSON messages.

use crate::error::Result;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Run a syscall wrapper until it is not interrupted by a signal.
fn retry_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other.map_err(io::Error::from),
        }
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        retry_eintr(|| nix::unistd::read(&self.fd, buf))
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        retry_eintr(|| nix::unistd::write(&self.fd, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered line reader for IPC.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line_buffer: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, fd),
            line_buffer: String::with_capacity(4096),
        }
    }

    /// Read a line, returning a reference to the internal buffer.
    /// Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        match self.reader.read_line(&mut self.line_buffer)? {
            0 => Ok(None),
            _ => {
                if self.line_buffer.ends_with('\n') {
                    self.line_buffer.pop();
                }
                if self.line_buffer.ends_with('\r') {
                    self.line_buffer.pop();
                }
                Ok(Some(&self.line_buffer))
            }
        }
    }

    /// Wait up to `timeout` for input without consuming it.
    ///
    /// Returns true when a line (or EOF) can be read without blocking on an
    /// empty pipe. A closed write end counts as readable.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<bool> {
        if !self.reader.buffer().is_empty() {
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
            let mut fds = [PollFd::new(self.reader.get_ref().as_fd(), PollFlags::POLLIN)];

            let ready = retry_eintr(|| poll(&mut fds, PollTimeout::from(millis)))?;
            if ready > 0 {
                return Ok(true);
            }
            // Timeouts above u16::MAX ms wake up early; keep waiting.
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }
}

/// Buffered line writer for IPC.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    /// Write raw bytes and flush.
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }
}

/// Sending end of a one-directional message channel.
pub struct Sender<T> {
    writer: LineWriter,
    _message: PhantomData<fn(T)>,
}

impl<T: Serialize> Sender<T> {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: LineWriter::new(fd),
            _message: PhantomData,
        }
    }

    /// Send one message. Blocks only while the pipe buffer is full.
    pub fn send(&mut self, message: &T) -> Result<()> {
        let line = serde_json::to_string(message)?;
        self.writer.write_line(&line)?;
        Ok(())
    }
}

/// Receiving end of a one-directional message channel.
pub struct Receiver<T> {
    reader: LineReader,
    _message: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Receiver<T> {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: LineReader::new(fd),
            _message: PhantomData,
        }
    }

    /// Report whether a message (or EOF) is available within `timeout`.
    pub fn poll(&mut self, timeout: Duration) -> Result<bool> {
        Ok(self.reader.poll(timeout)?)
    }

    /// Block until a message arrives. Returns `None` on EOF.
    pub fn recv(&mut self) -> Result<Option<T>> {
        match self.reader.read_line()? {
            Some(line) => Ok(Some(serde_json::from_str(line)?)),
            None => Ok(None),
        }
    }
}

/// Create a channel backed by a fresh pipe.
///
/// Both descriptors are close-on-exec, so programs a filter launches never
/// hold either end open.
pub fn channel<T>() -> io::Result<(Sender<T>, Receiver<T>)>
where
    T: Serialize + DeserializeOwned,
{
    let (read_end, write_end) = io::pipe()?;
    Ok((
        Sender::new(PipeFd::new(OwnedFd::from(write_end))),
        Receiver::new(PipeFd::new(OwnedFd::from(read_end))),
    ))
}
