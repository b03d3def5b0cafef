//! Pipe transport between the overseer and executor processes.
//!
//! Endpoints are owned, single-direction wrappers over pipe fds. Reads
//! and writes retry transparently on EINTR; every other failure is
//! handled by the caller, which for this protocol means aborting the
//! process after a diagnostic.

use anyhow::{Context, Result};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// Read half of a channel. Valid in the overseer for result traffic
/// and in the executor for acknowledgements.
#[derive(Debug)]
pub struct ReadEnd {
    fd: OwnedFd,
}

/// Write half of a channel. The mirror of [`ReadEnd`].
#[derive(Debug)]
pub struct WriteEnd {
    fd: OwnedFd,
}

/// Creates a unidirectional byte pipe.
pub fn channel() -> Result<(ReadEnd, WriteEnd)> {
    let (read_fd, write_fd) = nix::unistd::pipe().context("pipe creation failed")?;
    Ok((ReadEnd { fd: read_fd }, WriteEnd { fd: write_fd }))
}

impl ReadEnd {
    /// Wraps an inherited descriptor, e.g. after a re-exec handoff.
    ///
    /// # Safety
    /// `fd` must be an open pipe read end owned by nothing else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl Read for ReadEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl WriteEnd {
    /// Wraps an inherited descriptor, e.g. after a re-exec handoff.
    ///
    /// # Safety
    /// `fd` must be an open pipe write end owned by nothing else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    /// Writes the whole buffer, retrying on EINTR and short writes.
    pub fn write_all_retry(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                buf = &buf[n as usize..];
                continue;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Write for WriteEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all_retry(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pipe_roundtrip() {
        let (mut read_end, write_end) = channel().unwrap();
        write_end.write_all_retry(b"vigil").unwrap();
        drop(write_end);

        let mut buf = Vec::new();
        read_end.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"vigil");
    }

    #[test]
    fn test_eof_after_writer_drop() {
        let (mut read_end, write_end) = channel().unwrap();
        drop(write_end);
        let mut buf = [0u8; 1];
        assert_eq!(read_end.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_large_write_across_pipe_buffer() {
        // Bigger than the default pipe buffer, so the writer has to
        // loop while the reader drains.
        let payload = vec![0xabu8; 256 * 1024];
        let (mut read_end, write_end) = channel().unwrap();

        let expected = payload.clone();
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            read_end.read_to_end(&mut buf).unwrap();
            buf
        });

        write_end.write_all_retry(&payload).unwrap();
        drop(write_end);
        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn test_raw_fd_handoff_roundtrip() {
        let (read_end, write_end) = channel().unwrap();
        let raw_r = read_end.into_raw_fd();
        let raw_w = write_end.into_raw_fd();

        let mut read_end = unsafe { ReadEnd::from_raw_fd(raw_r) };
        let write_end = unsafe { WriteEnd::from_raw_fd(raw_w) };
        write_end.write_all_retry(&[7]).unwrap();
        drop(write_end);

        let mut buf = [0u8; 1];
        read_end.read(&mut buf).unwrap();
        assert_eq!(buf[0], 7);
    }
}
