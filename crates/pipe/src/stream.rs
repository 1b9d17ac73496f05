//! Byte-stream side channel
//!
//! An OS pipe used as an alternative to the message queue for raw packets.
//! Both ends are non-blocking: the writer sits on the transfer completion path
//! and must never stall, and the reader multiplexes its waits through `poll`.
//!
//! Reads accumulate across several underlying `read` calls until the requested
//! length is reached. If the wait times out first, the bytes drained so far are
//! kept and handed out first by the next read, so a timeout never tears the
//! stream.

use crate::error::{PipeError, Result};
use crate::timeout::Timeout;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Unidirectional byte channel backed by an OS pipe
#[derive(Debug)]
pub struct ByteStream {
    reader: File,
    writer: File,
    /// Bytes drained by a read that timed out before completing
    carry: Mutex<Vec<u8>>,
    /// Length of `carry`, readable while a reader holds the lock
    pending: AtomicUsize,
}

fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

impl ByteStream {
    /// Open the OS pipe
    ///
    /// # Errors
    ///
    /// `Resource` if the pipe cannot be created or configured.
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = nix::unistd::pipe().map_err(|e| {
            error!("Unable to open byte stream (errno={})", e);
            PipeError::Resource(format!("pipe: {}", e))
        })?;
        for fd in [&read_fd, &write_fd] {
            set_nonblocking(fd).map_err(|e| {
                error!("Unable to configure byte stream (errno={})", e);
                PipeError::Resource(format!("fcntl: {}", e))
            })?;
        }

        debug!(
            "Byte stream opened (read fd {}, write fd {})",
            read_fd.as_raw_fd(),
            write_fd.as_raw_fd()
        );

        Ok(Self {
            reader: File::from(read_fd),
            writer: File::from(write_fd),
            carry: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
        })
    }

    /// Write a packet with a single write attempt
    ///
    /// # Errors
    ///
    /// `Full` if the pipe accepted fewer bytes than requested (or none at
    /// all); the remainder is not retried. `Fatal` on any other I/O failure.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        loop {
            match (&self.writer).write(data) {
                Ok(n) if n == data.len() => {
                    trace!("Byte stream write of {} bytes", n);
                    return Ok(());
                }
                Ok(n) => {
                    warn!("Short write on byte stream ({} of {} bytes)", n, data.len());
                    return Err(PipeError::Full);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    trace!("Byte stream full, {} bytes dropped", data.len());
                    return Err(PipeError::Full);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Unable to write byte stream: {}", e);
                    return Err(PipeError::Fatal(e.to_string()));
                }
            }
        }
    }

    /// Read exactly `buf.len()` bytes, waiting according to `timeout`
    ///
    /// # Errors
    ///
    /// `Empty` if the wait expired before `buf` was filled (the partial data
    /// is retained for the next read), `Fatal` on an I/O failure or if the
    /// write end has gone away.
    pub fn read(&self, buf: &mut [u8], timeout: Timeout) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut carry = self.carry.lock().unwrap_or_else(PoisonError::into_inner);

        let mut filled = carry.len().min(buf.len());
        buf[..filled].copy_from_slice(&carry[..filled]);
        carry.drain(..filled);
        self.pending.store(carry.len(), Ordering::Release);
        if filled == buf.len() {
            return Ok(());
        }

        let deadline = timeout.deadline();
        loop {
            match (&self.reader).read(&mut buf[filled..]) {
                Ok(0) => {
                    self.stash(&mut carry, &buf[..filled]);
                    error!("Byte stream closed by the writer");
                    return Err(PipeError::Fatal("byte stream closed".to_string()));
                }
                Ok(n) => {
                    trace!("Byte stream read of {} bytes", n);
                    filled += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stash(&mut carry, &buf[..filled]);
                    error!("Unable to read byte stream: {}", e);
                    return Err(PipeError::Fatal(e.to_string()));
                }
            }

            if filled == buf.len() {
                return Ok(());
            }

            let ready = match (timeout, deadline) {
                (Timeout::Infinite, _) | (Timeout::After(_), None) => {
                    self.wait_readable(PollTimeout::NONE)?;
                    true
                }
                (Timeout::After(_), Some(deadline)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        false
                    } else {
                        // Round up so a sub-millisecond remainder still waits
                        let ms = remaining.as_micros().div_ceil(1000).min(u16::MAX as u128);
                        self.wait_readable(PollTimeout::from(ms as u16))?
                            || Instant::now() < deadline
                    }
                }
                _ => self.wait_readable(PollTimeout::ZERO)?,
            };

            if !ready {
                self.stash(&mut carry, &buf[..filled]);
                return Err(PipeError::Empty);
            }
        }
    }

    fn stash(&self, carry: &mut Vec<u8>, data: &[u8]) {
        carry.extend_from_slice(data);
        self.pending.store(carry.len(), Ordering::Release);
    }

    /// Wait until the read end is readable; false on timeout or interruption
    fn wait_readable(&self, timeout: PollTimeout) -> Result<bool> {
        let mut fds = [PollFd::new(self.reader.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => {
                error!("Unable to wait on byte stream (errno={})", e);
                Err(PipeError::Fatal(format!("poll: {}", e)))
            }
        }
    }

    /// Bytes retained from reads that timed out
    ///
    /// Does not wait for a read in progress.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_write_then_read() {
        let stream = ByteStream::new().unwrap();
        stream.write(&[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        stream.read(&mut buf, Timeout::Immediate).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_read_accumulates_short_deliveries() {
        let stream = Arc::new(ByteStream::new().unwrap());
        let producer = {
            let stream = stream.clone();
            thread::spawn(move || {
                stream.write(&[1, 2, 3]).unwrap();
                thread::sleep(Duration::from_millis(20));
                stream.write(&[4, 5, 6, 7, 8]).unwrap();
            })
        };

        let mut buf = [0u8; 8];
        stream.read(&mut buf, Timeout::Infinite).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
        producer.join().unwrap();
    }

    #[test]
    fn test_immediate_read_on_empty_stream() {
        let stream = ByteStream::new().unwrap();
        let mut buf = [0u8; 2];
        assert!(matches!(
            stream.read(&mut buf, Timeout::Immediate),
            Err(PipeError::Empty)
        ));
    }

    #[test]
    fn test_timed_out_read_keeps_partial_data() {
        let stream = ByteStream::new().unwrap();
        stream.write(&[9, 8, 7]).unwrap();

        let mut buf = [0u8; 6];
        assert!(matches!(
            stream.read(&mut buf, Timeout::millis(20)),
            Err(PipeError::Empty)
        ));
        assert_eq!(stream.pending(), 3);

        stream.write(&[6, 5, 4]).unwrap();
        stream.read(&mut buf, Timeout::millis(20)).unwrap();
        assert_eq!(buf, [9, 8, 7, 6, 5, 4]);
        assert_eq!(stream.pending(), 0);
    }

    #[test]
    fn test_unbounded_wait_reads_available_data() {
        let stream = ByteStream::new().unwrap();
        stream.write(&[1, 2]).unwrap();

        let mut buf = [0u8; 2];
        stream
            .read(&mut buf, Timeout::After(Duration::MAX))
            .unwrap();
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn test_unbounded_wait_blocks_until_data() {
        let stream = Arc::new(ByteStream::new().unwrap());
        let reader = {
            let stream = stream.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 3];
                stream.read(&mut buf, Timeout::from(Duration::MAX)).map(|()| buf)
            })
        };

        thread::sleep(Duration::from_millis(20));
        stream.write(&[4, 5, 6]).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), [4, 5, 6]);
    }

    #[test]
    fn test_pending_does_not_wait_for_reader() {
        let stream = Arc::new(ByteStream::new().unwrap());
        stream.write(&[9, 8]).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            stream.read(&mut buf, Timeout::Immediate),
            Err(PipeError::Empty)
        ));
        assert_eq!(stream.pending(), 2);

        let reader = {
            let stream = stream.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 4];
                stream.read(&mut buf, Timeout::Infinite).map(|()| buf)
            })
        };

        // The reader has taken the carried bytes and is parked in its wait
        let start = std::time::Instant::now();
        while stream.pending() != 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(stream.pending(), 0);

        stream.write(&[7, 6]).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), [9, 8, 7, 6]);
    }

    #[test]
    fn test_short_write_reports_full() {
        let stream = ByteStream::new().unwrap();
        // Larger than any default OS pipe capacity
        let big = vec![0xa5u8; 4 * 1024 * 1024];
        assert!(matches!(stream.write(&big), Err(PipeError::Full)));
        // Pipe is now saturated, the next write does not block either
        assert!(matches!(stream.write(&[1]), Err(PipeError::Full)));
    }

    #[test]
    fn test_smaller_reads_leave_remainder_in_pipe() {
        let stream = ByteStream::new().unwrap();
        stream.write(&[1, 2, 3, 4, 5]).unwrap();

        let mut first = [0u8; 2];
        stream.read(&mut first, Timeout::Immediate).unwrap();
        assert_eq!(first, [1, 2]);

        let mut rest = [0u8; 3];
        stream.read(&mut rest, Timeout::Immediate).unwrap();
        assert_eq!(rest, [3, 4, 5]);
    }
}
