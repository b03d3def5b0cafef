//! Fork-and-run worker creation.
//!
//! Duplicates the process image and lets the child keep executing the
//! test body in place. Fastest strategy; pre-fork state is shared,
//! which is fine because isolation targets crash containment, not a
//! clean environment.

use crate::channel::{channel, ReadEnd, WriteEnd};
use crate::runner::{flush_stdio, runner_abort};
use nix::unistd::{fork, ForkResult};

/// Result of a spawn, seen from whichever process this is now. The
/// unused endpoints of each side are already closed when this value
/// is returned.
pub enum Spawned {
    /// The parent. Reads results, writes acknowledgements, reaps the
    /// child.
    Overseer {
        child: libc::pid_t,
        results: ReadEnd,
        acks: WriteEnd,
    },
    /// The child. Writes results, reads acknowledgements, never
    /// returns from its teardown.
    Executor { results: WriteEnd, acks: ReadEnd },
}

/// Forks with a result pipe (child to parent) and an acknowledgement
/// pipe (parent to child). Pipe or fork failure is unrecoverable and
/// aborts the run.
pub fn fork_and_run() -> Spawned {
    let (results_read, results_write) = match channel() {
        Ok(pair) => pair,
        Err(err) => runner_abort(format_args!("result channel creation failed: {err:#}")),
    };
    let (acks_read, acks_write) = match channel() {
        Ok(pair) => pair,
        Err(err) => runner_abort(format_args!("ack channel creation failed: {err:#}")),
    };

    flush_stdio();

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(results_read);
            drop(acks_write);
            Spawned::Executor {
                results: results_write,
                acks: acks_read,
            }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(results_write);
            drop(acks_read);
            Spawned::Overseer {
                child: child.as_raw(),
                results: results_read,
                acks: acks_write,
            }
        }
        Err(err) => runner_abort(format_args!("fork failed: {err}")),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_fork_and_run_branches_once_per_process() {
        match fork_and_run() {
            Spawned::Executor { results, acks } => {
                drop(acks);
                let _ = results.write_all_retry(b"ok");
                // The child must never fall back into the test
                // harness.
                unsafe { libc::_exit(0) };
            }
            Spawned::Overseer {
                child,
                mut results,
                acks,
            } => {
                drop(acks);
                let mut buf = Vec::new();
                results.read_to_end(&mut buf).unwrap();
                assert_eq!(buf, b"ok");

                let mut status = 0;
                let reaped = unsafe { libc::waitpid(child, &mut status, 0) };
                assert_eq!(reaped, child);
            }
        }
    }
}
