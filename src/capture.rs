//! Stderr capture around an isolated test.
//!
//! The overseer redirects fd 2 into an anonymous memory file before
//! spawning, so everything the child writes to stderr lands in the
//! capture instead of being lost with the crashed process. After the
//! child is reaped the overseer restores fd 2 and reads the capture
//! back.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// In-flight stderr redirection. `finish` restores fd 2 and returns
/// the captured text; dropping without `finish` leaves the
/// redirection in place, which is what a forked child wants.
pub struct StderrCapture {
    saved_stderr: OwnedFd,
    backing: OwnedFd,
}

impl StderrCapture {
    /// Redirects fd 2 into a fresh capture file. Must run before the
    /// child is spawned so the child inherits the redirection.
    pub fn begin() -> Result<Self> {
        let _ = io::stderr().flush();

        let backing_fd = create_backing_fd().context("creating stderr capture file")?;
        let backing = unsafe { OwnedFd::from_raw_fd(backing_fd) };

        let saved = unsafe { libc::dup(libc::STDERR_FILENO) };
        if saved < 0 {
            return Err(io::Error::last_os_error()).context("dup of stderr failed");
        }
        let saved_stderr = unsafe { OwnedFd::from_raw_fd(saved) };

        if unsafe { libc::dup2(backing.as_raw_fd(), libc::STDERR_FILENO) } < 0 {
            return Err(io::Error::last_os_error()).context("dup2 onto stderr failed");
        }

        Ok(Self {
            saved_stderr,
            backing,
        })
    }

    /// Restores fd 2 and returns everything written while the capture
    /// was active, parent and child output combined.
    pub fn finish(self) -> Result<String> {
        let _ = io::stderr().flush();

        if unsafe { libc::dup2(self.saved_stderr.as_raw_fd(), libc::STDERR_FILENO) } < 0 {
            return Err(io::Error::last_os_error()).context("restoring stderr failed");
        }

        // The backing fd shares one file description with the writes
        // done through fd 2, so rewind before reading.
        unsafe {
            libc::lseek(self.backing.as_raw_fd(), 0, libc::SEEK_SET);
        }
        let mut file = unsafe { File::from_raw_fd(self.backing.into_raw_fd()) };
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("reading captured stderr")?;
        Ok(contents)
    }
}

/// Anonymous memory file on Linux, unlinked temp file elsewhere.
/// No close-on-exec flag: the fd must survive into spawned children.
#[cfg(target_os = "linux")]
fn create_backing_fd() -> Result<RawFd> {
    let name = b"vigil_stderr\0";
    let fd =
        unsafe { libc::syscall(libc::SYS_memfd_create, name.as_ptr(), 0) as RawFd };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("memfd_create failed");
    }
    Ok(fd)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn create_backing_fd() -> Result<RawFd> {
    let template = std::env::temp_dir().join("vigil_stderr_XXXXXX");
    let mut raw = std::ffi::CString::new(template.into_os_string().into_encoded_bytes())
        .context("capture path contains NUL")?
        .into_bytes_with_nul();
    let fd = unsafe { libc::mkstemp(raw.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("mkstemp failed");
    }
    // Unlink right away; the open fd keeps the file alive.
    unsafe {
        libc::unlink(raw.as_ptr() as *const libc::c_char);
    }
    Ok(fd)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // fd 2 is process-global; capture tests must not overlap.
    static STDERR_LOCK: Mutex<()> = Mutex::new(());

    fn write_to_real_stderr(message: &[u8]) {
        // The test harness intercepts eprint! on test threads, so go
        // straight to the descriptor the capture redirected.
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                message.as_ptr() as *const libc::c_void,
                message.len(),
            );
        }
    }

    #[test]
    fn test_capture_roundtrip() {
        let _guard = STDERR_LOCK.lock().unwrap();
        let capture = StderrCapture::begin().unwrap();
        write_to_real_stderr(b"captured-marker-1759");
        let text = capture.finish().unwrap();
        assert!(text.contains("captured-marker-1759"));
    }

    #[test]
    fn test_finish_without_writes_is_empty() {
        let _guard = STDERR_LOCK.lock().unwrap();
        let capture = StderrCapture::begin().unwrap();
        let text = capture.finish().unwrap();
        assert_eq!(text, "");
    }
}
