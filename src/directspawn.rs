//! Isolation where fork is unavailable or unreliable.
//!
//! QNX forks poorly from threaded processes, so the executor is
//! created with `posix_spawn` directly. The parent's open handle on
//! its working directory must not leak into the child: it is marked
//! close-on-exec for the spawn and the directory is restored through
//! it afterwards.

#![cfg(target_os = "nto")]

use crate::capture::StderrCapture;
use crate::channel::channel;
use crate::collector::{SuiteHooks, TestIdentity};
use crate::forkexec::ExecutorHandoff;
use crate::runner::{flush_stdio, runner_abort, Role, RunnerState};
use crate::{runner_check, runner_check_syscall};
use anyhow::{Context, Result};
use std::ffi::CString;
use std::os::fd::RawFd;
use std::ptr;

extern "C" {
    static mut environ: *mut *mut libc::c_char;
}

/// Runner variant backed by `posix_spawn`. Shares the executor
/// handoff format with the re-exec strategy; the spawned child is the
/// same binary with the same flag.
pub struct SpawnRunner {
    pub(crate) state: RunnerState,
    identity: TestIdentity,
    handoff: Option<ExecutorHandoff>,
}

impl SpawnRunner {
    pub(crate) fn new(identity: TestIdentity, handoff: Option<ExecutorHandoff>) -> Self {
        Self {
            state: RunnerState::new(),
            identity,
            handoff,
        }
    }

    pub(crate) fn assume_role(&mut self, hooks: &mut dyn SuiteHooks) -> Role {
        if let Some(handoff) = self.handoff.take() {
            let results = unsafe { crate::channel::WriteEnd::from_raw_fd(handoff.results_fd) };
            let acks = unsafe { crate::channel::ReadEnd::from_raw_fd(handoff.acks_fd) };
            self.state.adopt_executor(results, acks);
            hooks.suppress_event_forwarding();
            return Role::Execute;
        }

        let capture = match StderrCapture::begin() {
            Ok(capture) => capture,
            Err(err) => runner_abort(format_args!("stderr capture failed: {err:#}")),
        };

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
            case: self.identity.case.clone(),
            name: self.identity.name.clone(),
        };

        let child = match spawn_self(&handoff) {
            Ok(child) => child,
            Err(err) => runner_abort(format_args!("posix_spawn failed: {err:#}")),
        };

        drop(results_write);
        drop(acks_read);
        self.state
            .adopt_overseer(child, results_read, acks_write, capture);
        Role::Oversee
    }
}

/// Spawns the current binary with the handoff flag appended, keeping
/// the working-directory descriptor out of the child.
fn spawn_self(handoff: &ExecutorHandoff) -> Result<libc::pid_t> {
    let exe = std::env::current_exe().context("resolving the current executable")?;
    let exe_c = CString::new(exe.into_os_string().into_encoded_bytes())
        .context("executable path contains NUL")?;

    let mut argv = vec![exe_c.clone()];
    for arg in std::env::args().skip(1) {
        if arg.starts_with(crate::forkexec::HANDOFF_FLAG_PREFIX) {
            continue;
        }
        argv.push(CString::new(arg).context("argument contains NUL")?);
    }
    argv.push(CString::new(handoff.to_flag()).context("handoff flag contains NUL")?);

    let mut argv_ptrs: Vec<*mut libc::c_char> =
        argv.iter().map(|s| s.as_ptr() as *mut libc::c_char).collect();
    argv_ptrs.push(ptr::null_mut());

    // Hold the working directory open but out of the child's fd
    // table, then restore through it once the spawn is done.
    let cwd_fd: RawFd = runner_check_syscall!(unsafe {
        libc::open(b".\0".as_ptr() as *const libc::c_char, libc::O_RDONLY)
    });
    let flags = runner_check_syscall!(unsafe { libc::fcntl(cwd_fd, libc::F_GETFD) });
    runner_check_syscall!(unsafe {
        libc::fcntl(cwd_fd, libc::F_SETFD, flags | libc::FD_CLOEXEC)
    });

    flush_stdio();

    let mut child: libc::pid_t = 0;
    let rc = unsafe {
        libc::posix_spawn(
            &mut child,
            exe_c.as_ptr(),
            ptr::null(),
            ptr::null(),
            argv_ptrs.as_ptr(),
            environ,
        )
    };
    runner_check!(rc == 0);

    runner_check_syscall!(unsafe { libc::fchdir(cwd_fd) });
    runner_check_syscall!(unsafe { libc::close(cwd_fd) });
    Ok(child)
}
