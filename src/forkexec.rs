//! Fork-and-re-exec worker creation.
//!
//! Duplicates the process and immediately replaces the child's image
//! with a fresh exec of the same binary, handing over the channel
//! descriptors and the single test to run through an internal flag.
//! A multi-threaded parent never leaks its thread state into the
//! child this way.
//!
//! Between duplication and `execv` the child is running on the copied
//! image of a possibly multi-threaded process: another thread may
//! have held the allocator or any other lock at the instant of the
//! copy. Everything the child touches in that window is pre-allocated
//! here, and [`exec_then_die`] issues direct syscalls only.

use crate::channel::{channel, ReadEnd, WriteEnd};
use crate::collector::TestIdentity;
use crate::runner::runner_abort;
use crate::{runner_check, runner_check_syscall};
use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::os::fd::RawFd;
use std::ptr;

/// Internal argv flag carrying the executor handoff.
pub const HANDOFF_FLAG_PREFIX: &str = "--isolated-run=";

/// Channel descriptors and test identity inherited by a re-exec'd
/// executor process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorHandoff {
    pub results_fd: RawFd,
    pub acks_fd: RawFd,
    pub case: String,
    pub name: String,
}

impl ExecutorHandoff {
    /// Flag form: `--isolated-run=<results_fd>|<acks_fd>|<case>|<name>`.
    /// The case must not contain `|`; the name is the unparsed rest.
    pub fn to_flag(&self) -> String {
        format!(
            "{}{}|{}|{}|{}",
            HANDOFF_FLAG_PREFIX, self.results_fd, self.acks_fd, self.case, self.name
        )
    }

    fn parse(value: &str) -> Result<Self> {
        let mut fields = value.splitn(4, '|');
        let results_fd = fields
            .next()
            .context("handoff flag is empty")?
            .parse::<RawFd>()
            .context("bad results descriptor in handoff flag")?;
        let acks_fd = fields
            .next()
            .context("handoff flag is missing the ack descriptor")?
            .parse::<RawFd>()
            .context("bad ack descriptor in handoff flag")?;
        let case = fields
            .next()
            .context("handoff flag is missing the test case")?
            .to_string();
        let name = fields
            .next()
            .context("handoff flag is missing the test name")?
            .to_string();
        if results_fd < 0 || acks_fd < 0 {
            bail!("handoff descriptors must be non-negative");
        }
        Ok(Self {
            results_fd,
            acks_fd,
            case,
            name,
        })
    }

    /// Scans process arguments for the handoff flag. `None` when this
    /// process was not spawned as a re-exec'd executor.
    pub fn from_args<I>(args: I) -> Option<Result<Self>>
    where
        I: IntoIterator<Item = String>,
    {
        args.into_iter()
            .find_map(|arg| arg.strip_prefix(HANDOFF_FLAG_PREFIX).map(Self::parse))
    }

    pub fn identity(&self) -> TestIdentity {
        TestIdentity::new(self.case.clone(), self.name.clone())
    }
}

/// Child-side inputs, fully allocated before the process duplicates.
/// The pointer table stays valid because the backing `CString`s never
/// move after construction.
struct PreparedExec {
    #[allow(dead_code)]
    argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    close_fds: [RawFd; 2],
}

fn prepare_exec(handoff: &ExecutorHandoff, close_fds: [RawFd; 2]) -> Result<PreparedExec> {
    let exe = std::env::current_exe().context("resolving the current executable")?;
    let mut argv = Vec::new();
    argv.push(
        CString::new(exe.into_os_string().into_encoded_bytes())
            .context("executable path contains NUL")?,
    );
    // Keep the original arguments so harness-level flags survive the
    // re-exec, but drop any stale handoff.
    for arg in std::env::args().skip(1) {
        if arg.starts_with(HANDOFF_FLAG_PREFIX) {
            continue;
        }
        argv.push(CString::new(arg).context("argument contains NUL")?);
    }
    argv.push(CString::new(handoff.to_flag()).context("handoff flag contains NUL")?);

    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    Ok(PreparedExec {
        argv,
        argv_ptrs,
        close_fds,
    })
}

/// The duplication-to-exec window. Direct syscalls only: closes the
/// parent-side descriptors, replaces the image, and if even that
/// fails reports with a static buffer and dies.
fn exec_then_die(prepared: &PreparedExec) -> ! {
    unsafe {
        for &fd in &prepared.close_fds {
            libc::close(fd);
        }
        libc::execv(prepared.argv_ptrs[0], prepared.argv_ptrs.as_ptr());
        const MSG: &[u8] = b"[vigil] exec of the isolated child binary failed\n";
        libc::write(
            libc::STDERR_FILENO,
            MSG.as_ptr() as *const libc::c_void,
            MSG.len(),
        );
        libc::_exit(126);
    }
}

/// Duplicates via `clone` with a caller-supplied stack. The child
/// runs [`exec_then_die`] and nothing else on that stack.
#[cfg(target_os = "linux")]
fn spawn_with_clone(prepared: &PreparedExec) -> libc::pid_t {
    extern "C" fn clone_main(arg: *mut libc::c_void) -> libc::c_int {
        let prepared = unsafe { &*(arg as *const PreparedExec) };
        exec_then_die(prepared)
    }

    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    runner_check!(page > 0);
    let stack_size = page as usize * 16;
    let stack = unsafe {
        libc::mmap(
            ptr::null_mut(),
            stack_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK,
            -1,
            0,
        )
    };
    runner_check!(stack != libc::MAP_FAILED);
    // The stack grows down on every target this compiles for.
    let stack_top = unsafe { (stack as *mut u8).add(stack_size) } as *mut libc::c_void;

    let pid = unsafe {
        libc::clone(
            clone_main,
            stack_top,
            libc::SIGCHLD,
            prepared as *const PreparedExec as *mut libc::c_void,
        )
    };
    runner_check!(pid != -1);
    // No CLONE_VM: the child owns a copy of this mapping, so the
    // parent's can go.
    runner_check_syscall!(unsafe { libc::munmap(stack, stack_size) });
    pid
}

#[cfg(target_os = "linux")]
fn duplication_primitive_available() -> bool {
    true
}

#[cfg(not(target_os = "linux"))]
fn duplication_primitive_available() -> bool {
    false
}

#[cfg(not(target_os = "linux"))]
fn spawn_with_clone(_prepared: &PreparedExec) -> libc::pid_t {
    unreachable!("clone spawn is only selected where it is available")
}

fn spawn_with_fork(prepared: &PreparedExec) -> libc::pid_t {
    match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Child) => exec_then_die(prepared),
        Ok(nix::unistd::ForkResult::Parent { child }) => child.as_raw(),
        Err(err) => runner_abort(format_args!("fork before exec failed: {err}")),
    }
}

/// Creates the channels, re-execs the current binary as the executor
/// for `identity`, and returns the overseer-side endpoints. Creation
/// failures abort the run.
pub(crate) fn spawn_executor_process(
    identity: &TestIdentity,
    prefer_fork: bool,
) -> (libc::pid_t, ReadEnd, WriteEnd) {
    let (results_read, results_write) = match channel() {
        Ok(pair) => pair,
        Err(err) => runner_abort(format_args!("result channel creation failed: {err:#}")),
    };
    let (acks_read, acks_write) = match channel() {
        Ok(pair) => pair,
        Err(err) => runner_abort(format_args!("ack channel creation failed: {err:#}")),
    };

    let handoff = ExecutorHandoff {
        results_fd: results_write.as_raw_fd(),
        acks_fd: acks_read.as_raw_fd(),
        case: identity.case.clone(),
        name: identity.name.clone(),
    };
    let prepared = match prepare_exec(
        &handoff,
        [results_read.as_raw_fd(), acks_write.as_raw_fd()],
    ) {
        Ok(prepared) => prepared,
        Err(err) => runner_abort(format_args!("preparing executor argv failed: {err:#}")),
    };

    crate::runner::flush_stdio();

    let child = if prefer_fork || !duplication_primitive_available() {
        spawn_with_fork(&prepared)
    } else {
        spawn_with_clone(&prepared)
    };

    // The executor inherited these; the overseer keeps only its own
    // direction per endpoint.
    drop(results_write);
    drop(acks_read);
    (child, results_read, acks_write)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_flag_roundtrip() {
        let handoff = ExecutorHandoff {
            results_fd: 7,
            acks_fd: 9,
            case: "CrashScenarios".to_string(),
            name: "records".to_string(),
        };
        let flag = handoff.to_flag();
        let parsed = ExecutorHandoff::from_args([flag].into_iter())
            .expect("flag not recognized")
            .expect("flag did not parse");
        assert_eq!(parsed, handoff);
    }

    #[test]
    fn test_from_args_ignores_unrelated_arguments() {
        let args = vec![
            "vigil-core".to_string(),
            "--isolation=fork-and-run".to_string(),
            "records".to_string(),
        ];
        assert!(ExecutorHandoff::from_args(args).is_none());
    }

    #[test]
    fn test_bad_descriptor_is_an_error() {
        let parsed =
            ExecutorHandoff::from_args(["--isolated-run=x|9|case|name".to_string()].into_iter())
                .expect("flag not recognized");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_truncated_flag_is_an_error() {
        let parsed = ExecutorHandoff::from_args(["--isolated-run=3|4".to_string()].into_iter())
            .expect("flag not recognized");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_name_keeps_later_separators() {
        let parsed =
            ExecutorHandoff::from_args(["--isolated-run=3|4|case|a|b".to_string()].into_iter())
                .unwrap()
                .unwrap();
        assert_eq!(parsed.case, "case");
        assert_eq!(parsed.name, "a|b");
    }
}
