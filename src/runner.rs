//! Per-test role state machine.
//!
//! Each isolated test gets one `TestRunner`. `assume_role` spawns the
//! worker and tells the calling process which side of the channel it
//! now is: the overseer collects results and reaps the child, the
//! executor runs the test body and mirrors everything it observes
//! across the channel.
//!
//! The runner is a closed set of strategy variants picked once at
//! construction. Every variant satisfies the same surface, so there
//! is exactly one call site per operation regardless of platform or
//! spawn style.
//!
//! The protocol is synchronous throughout: each result, property and
//! clear message blocks the executor until the overseer's one-byte
//! acknowledgement, so results land in the collector in emission
//! order and the child can never run ahead of an unapplied message.

use crate::codec::{self, ChannelMessage, TestPartResult, TestProperty};
use crate::collector::SuiteHooks;
use std::fmt;
use std::io::{self, Write};

#[cfg(unix)]
use crate::capture::StderrCapture;
#[cfg(unix)]
use crate::channel::{ReadEnd, WriteEnd};
#[cfg(unix)]
use crate::collector::TestIdentity;
#[cfg(unix)]
use crate::forkexec::ExecutorHandoff;
#[cfg(unix)]
use crate::spawn::{self, Spawned};

/// Which side of an isolated test this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Oversee,
    Execute,
}

/// How the isolated test concluded, as observed on the channel.
/// Premature EOF means the child died; the explicit exit marker means
/// the body ran to completion. The exit code is deliberately not used
/// here, so an `exit(0)` inside a test body does not pass as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    InProgress,
    Died,
    ExitedNormally,
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TestOutcome::InProgress => "in-progress",
            TestOutcome::Died => "died",
            TestOutcome::ExitedNormally => "exited-normally",
        };
        f.write_str(text)
    }
}

/// Flushes stdio so buffered output cannot be duplicated into a child
/// or reordered against channel messages.
pub(crate) fn flush_stdio() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Prints a diagnostic and aborts the current process. Used for
/// protocol violations and unrecoverable transport state, from either
/// side of the channel.
pub fn runner_abort(message: fmt::Arguments<'_>) -> ! {
    eprintln!("[vigil] {}", message);
    let _ = io::stderr().flush();
    std::process::abort()
}

/// Aborts with a file/line diagnostic when a condition does not hold.
#[macro_export]
macro_rules! runner_check {
    ($cond:expr) => {
        if !$cond {
            $crate::runner::runner_abort(format_args!(
                "check failed at {}:{}: {}",
                file!(),
                line!(),
                stringify!($cond)
            ));
        }
    };
}

/// Evaluates a libc call that reports failure as -1, retrying on EINTR
/// and aborting with a file/line diagnostic on any other failure.
#[macro_export]
macro_rules! runner_check_syscall {
    ($call:expr) => {{
        let mut ret;
        loop {
            ret = $call;
            let interrupted = ret == -1
                && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR);
            if !interrupted {
                break;
            }
        }
        if ret == -1 {
            $crate::runner::runner_abort(format_args!(
                "syscall failed at {}:{}: {}: {}",
                file!(),
                line!(),
                stringify!($call),
                std::io::Error::last_os_error()
            ));
        }
        ret
    }};
}

// =============================================================================
// Channel loops shared by every isolated strategy
// =============================================================================

fn write_ack(acks: &mut impl io::Write) {
    if let Err(err) = acks.write_all(&[codec::ACK]) {
        runner_abort(format_args!("acknowledgement write failed: {err}"));
    }
}

/// Overseer loop: decodes messages and applies them to the suite
/// hooks until the child exits or dies. EOF and read errors on a
/// message boundary resolve the outcome; anything corrupt inside a
/// message aborts, because the stream cannot be trusted after it.
pub(crate) fn drain_messages(
    results: &mut impl io::Read,
    acks: &mut impl io::Write,
    hooks: &mut dyn SuiteHooks,
) -> TestOutcome {
    loop {
        let tag = match codec::read_tag(results) {
            Ok(Some(tag)) => tag,
            Ok(None) => return TestOutcome::Died,
            Err(err) => {
                eprintln!("[vigil] read from isolated child failed: {err}");
                return TestOutcome::Died;
            }
        };
        let message = match codec::decode_payload(tag, results) {
            Ok(message) => message,
            Err(err) => runner_abort(format_args!(
                "corrupt message from isolated child at {}:{}: {err:#}",
                file!(),
                line!()
            )),
        };
        match message {
            ChannelMessage::PartResult(result) => {
                hooks.report_part_result(&result);
                write_ack(acks);
            }
            ChannelMessage::Property(property) => {
                hooks.record_property(property);
                write_ack(acks);
            }
            ChannelMessage::ClearResults => {
                hooks.clear_part_results();
                write_ack(acks);
            }
            ChannelMessage::Exited => return TestOutcome::ExitedNormally,
            ChannelMessage::InternalError(message) => {
                // The child aborts right after relaying this; the EOF
                // that follows resolves the outcome.
                hooks.report_part_result(&TestPartResult::fatal_at_unknown_location(format!(
                    "internal error in isolated child: {message}"
                )));
            }
        }
    }
}

fn relay_internal_error(results: &mut impl io::Write, message: &str) {
    let bytes = codec::encode_message(&ChannelMessage::InternalError(message.to_string()));
    let _ = results.write_all(&bytes);
}

/// Executor send: one message, then block until the overseer's
/// acknowledgement. A transport failure is relayed as an internal
/// error first so the overseer can attribute it, then this process
/// aborts.
pub(crate) fn send_and_await_ack(
    results: &mut impl io::Write,
    acks: &mut impl io::Read,
    message: &ChannelMessage,
) {
    flush_stdio();
    let bytes = codec::encode_message(message);
    if let Err(err) = results.write_all(&bytes) {
        relay_internal_error(results, &format!("channel write failed: {err}"));
        runner_abort(format_args!("result channel write failed: {err}"));
    }
    let mut ack = [0u8; 1];
    match acks.read_exact(&mut ack) {
        Ok(()) => {
            if ack[0] != codec::ACK {
                relay_internal_error(
                    results,
                    &format!("unexpected acknowledgement byte ({})", ack[0]),
                );
                runner_abort(format_args!(
                    "unexpected acknowledgement byte ({})",
                    ack[0]
                ));
            }
        }
        Err(err) => {
            relay_internal_error(results, &format!("acknowledgement read failed: {err}"));
            runner_abort(format_args!("acknowledgement read failed: {err}"));
        }
    }
}

// =============================================================================
// Shared state of the isolated strategies
// =============================================================================

/// Channel endpoints, spawn bookkeeping and the outcome. The read end
/// is only populated while overseeing, the write end only while
/// executing, except for the instant around spawn where both exist
/// and the unused one is dropped.
#[cfg(unix)]
pub(crate) struct RunnerState {
    spawned: bool,
    outcome: TestOutcome,
    read_end: Option<ReadEnd>,
    write_end: Option<WriteEnd>,
    child: Option<libc::pid_t>,
    capture: Option<StderrCapture>,
}

#[cfg(unix)]
impl RunnerState {
    pub(crate) fn new() -> Self {
        Self {
            spawned: false,
            outcome: TestOutcome::InProgress,
            read_end: None,
            write_end: None,
            child: None,
            capture: None,
        }
    }

    pub(crate) fn adopt_overseer(
        &mut self,
        child: libc::pid_t,
        results: ReadEnd,
        acks: WriteEnd,
        capture: StderrCapture,
    ) {
        self.read_end = Some(results);
        self.write_end = Some(acks);
        self.child = Some(child);
        self.capture = Some(capture);
        self.spawned = true;
    }

    pub(crate) fn adopt_executor(&mut self, results: WriteEnd, acks: ReadEnd) {
        self.write_end = Some(results);
        self.read_end = Some(acks);
    }

    fn outcome(&self) -> TestOutcome {
        self.outcome
    }

    fn executor_endpoints(&mut self) -> (&mut WriteEnd, &mut ReadEnd) {
        let results = match self.write_end.as_mut() {
            Some(end) => end,
            None => runner_abort(format_args!("result endpoint is not open in this role")),
        };
        let acks = match self.read_end.as_mut() {
            Some(end) => end,
            None => runner_abort(format_args!("ack endpoint is not open in this role")),
        };
        (results, acks)
    }

    fn report_part_result(&mut self, result: &TestPartResult) {
        let (results, acks) = self.executor_endpoints();
        send_and_await_ack(results, acks, &ChannelMessage::PartResult(result.clone()));
    }

    fn record_property(&mut self, property: &TestProperty) {
        let (results, acks) = self.executor_endpoints();
        send_and_await_ack(results, acks, &ChannelMessage::Property(property.clone()));
    }

    fn clear_current_part_results(&mut self) {
        let (results, acks) = self.executor_endpoints();
        send_and_await_ack(results, acks, &ChannelMessage::ClearResults);
    }

    /// Exit-marker-then-exit. No acknowledgement, no unwind: cleanup
    /// hooks of the surrounding harness must not run a second time in
    /// the child.
    fn tear_down_and_exit(&mut self) -> ! {
        flush_stdio();
        let results = match self.write_end.as_mut() {
            Some(end) => end,
            None => runner_abort(format_args!("result endpoint is not open in this role")),
        };
        if let Err(err) = results.write_all(&codec::encode_message(&ChannelMessage::Exited)) {
            runner_abort(format_args!("exit marker write failed: {err}"));
        }
        std::process::exit(0)
    }

    fn wait(&mut self, hooks: &mut dyn SuiteHooks) -> i32 {
        if !self.spawned {
            return 0;
        }
        let mut results = match self.read_end.take() {
            Some(end) => end,
            None => runner_abort(format_args!("wait without an open read endpoint")),
        };
        let mut acks = match self.write_end.take() {
            Some(end) => end,
            None => runner_abort(format_args!("wait without an open ack endpoint")),
        };
        self.outcome = drain_messages(&mut results, &mut acks, hooks);
        // Both endpoints close here so a lingering child sees EOF.
        drop(results);
        drop(acks);

        let child = match self.child {
            Some(child) => child,
            None => runner_abort(format_args!("wait without a spawned child")),
        };
        let mut status: libc::c_int = 0;
        runner_check_syscall!(unsafe { libc::waitpid(child, &mut status, 0) });
        status
    }

    fn process_outcome(&mut self, hooks: &mut dyn SuiteHooks) -> bool {
        if !self.spawned {
            return false;
        }
        if let Some(capture) = self.capture.take() {
            match capture.finish() {
                Ok(text) => eprint!("{text}"),
                Err(err) => eprintln!("[vigil] captured stderr was lost: {err:#}"),
            }
        }
        match self.outcome {
            TestOutcome::ExitedNormally => {}
            TestOutcome::Died => {
                let identity = hooks.current_test();
                hooks.report_part_result(&TestPartResult::fatal_at_unknown_location(format!(
                    "Test process died while executing {identity}"
                )));
            }
            TestOutcome::InProgress => {
                runner_abort(format_args!("isolated test outcome was never resolved"))
            }
        }
        true
    }
}

#[cfg(unix)]
impl Drop for RunnerState {
    fn drop(&mut self) {
        // The overseer has to drain and release its read end before
        // the runner goes away; anything else leaks a descriptor.
        debug_assert!(
            !self.spawned || self.read_end.is_none(),
            "overseer dropped with a live read endpoint"
        );
    }
}

// =============================================================================
// Strategies
// =============================================================================

/// Non-isolated execution: the current process runs the test body in
/// place. There is no channel and nothing to oversee.
pub struct DirectRunner;

/// Fork-and-run isolation.
#[cfg(unix)]
pub struct ForkRunner {
    state: RunnerState,
}

#[cfg(unix)]
impl ForkRunner {
    pub(crate) fn new() -> Self {
        Self {
            state: RunnerState::new(),
        }
    }

    fn assume_role(&mut self, hooks: &mut dyn SuiteHooks) -> Role {
        let capture = match StderrCapture::begin() {
            Ok(capture) => capture,
            Err(err) => runner_abort(format_args!("stderr capture failed: {err:#}")),
        };
        match spawn::fork_and_run() {
            Spawned::Executor { results, acks } => {
                // The child keeps writing into the inherited capture;
                // its copy of the handle is simply dropped.
                drop(capture);
                self.state.adopt_executor(results, acks);
                hooks.suppress_event_forwarding();
                Role::Execute
            }
            Spawned::Overseer {
                child,
                results,
                acks,
            } => {
                self.state.adopt_overseer(child, results, acks, capture);
                Role::Oversee
            }
        }
    }
}

/// Fork-and-re-exec isolation. On the overseer side this spawns a
/// fresh image of the current binary; on the executor side (detected
/// through the inherited handoff) it wires up the inherited
/// descriptors and runs in place.
#[cfg(unix)]
pub struct ExecRunner {
    state: RunnerState,
    identity: TestIdentity,
    prefer_fork: bool,
    handoff: Option<ExecutorHandoff>,
}

#[cfg(unix)]
impl ExecRunner {
    pub(crate) fn new(
        identity: TestIdentity,
        prefer_fork: bool,
        handoff: Option<ExecutorHandoff>,
    ) -> Self {
        Self {
            state: RunnerState::new(),
            identity,
            prefer_fork,
            handoff,
        }
    }

    fn assume_role(&mut self, hooks: &mut dyn SuiteHooks) -> Role {
        if let Some(handoff) = self.handoff.take() {
            let results = unsafe { WriteEnd::from_raw_fd(handoff.results_fd) };
            let acks = unsafe { ReadEnd::from_raw_fd(handoff.acks_fd) };
            self.state.adopt_executor(results, acks);
            hooks.suppress_event_forwarding();
            return Role::Execute;
        }
        let capture = match StderrCapture::begin() {
            Ok(capture) => capture,
            Err(err) => runner_abort(format_args!("stderr capture failed: {err:#}")),
        };
        let (child, results, acks) =
            crate::forkexec::spawn_executor_process(&self.identity, self.prefer_fork);
        self.state.adopt_overseer(child, results, acks, capture);
        Role::Oversee
    }
}

// =============================================================================
// The polymorphic surface
// =============================================================================

/// One runner per isolated test, variant fixed at construction.
pub enum TestRunner {
    Direct(DirectRunner),
    #[cfg(unix)]
    Fork(ForkRunner),
    #[cfg(unix)]
    ForkExec(ExecRunner),
    #[cfg(windows)]
    Windows(crate::spawn_windows::WindowsRunner),
    #[cfg(target_os = "nto")]
    DirectSpawn(crate::directspawn::SpawnRunner),
}

impl TestRunner {
    /// Spawns if the strategy calls for it and returns the role this
    /// process plays from here on.
    pub fn assume_role(&mut self, hooks: &mut dyn SuiteHooks) -> Role {
        match self {
            TestRunner::Direct(_) => Role::Execute,
            #[cfg(unix)]
            TestRunner::Fork(runner) => runner.assume_role(hooks),
            #[cfg(unix)]
            TestRunner::ForkExec(runner) => runner.assume_role(hooks),
            #[cfg(windows)]
            TestRunner::Windows(runner) => runner.assume_role(hooks),
            #[cfg(target_os = "nto")]
            TestRunner::DirectSpawn(runner) => runner.assume_role(hooks),
        }
    }

    /// Executor-side bracket before the test body.
    pub fn set_up(&mut self) {}

    /// Executor-side bracket after the test body. Isolated variants
    /// write the exit marker and terminate the process; the direct
    /// variant returns.
    pub fn tear_down(&mut self) {
        match self {
            TestRunner::Direct(_) => {}
            #[cfg(unix)]
            TestRunner::Fork(runner) => runner.state.tear_down_and_exit(),
            #[cfg(unix)]
            TestRunner::ForkExec(runner) => runner.state.tear_down_and_exit(),
            #[cfg(windows)]
            TestRunner::Windows(runner) => runner.tear_down_and_exit(),
            #[cfg(target_os = "nto")]
            TestRunner::DirectSpawn(runner) => runner.state.tear_down_and_exit(),
        }
    }

    /// Executor-side: sends one observed result and blocks until it
    /// is applied. No-op without a parent process.
    pub fn report_part_result(&mut self, result: &TestPartResult) {
        match self {
            TestRunner::Direct(_) => {}
            #[cfg(unix)]
            TestRunner::Fork(runner) => runner.state.report_part_result(result),
            #[cfg(unix)]
            TestRunner::ForkExec(runner) => runner.state.report_part_result(result),
            #[cfg(windows)]
            TestRunner::Windows(runner) => runner.report_part_result(result),
            #[cfg(target_os = "nto")]
            TestRunner::DirectSpawn(runner) => runner.state.report_part_result(result),
        }
    }

    /// Executor-side: same transport as results.
    pub fn record_property(&mut self, property: &TestProperty) {
        match self {
            TestRunner::Direct(_) => {}
            #[cfg(unix)]
            TestRunner::Fork(runner) => runner.state.record_property(property),
            #[cfg(unix)]
            TestRunner::ForkExec(runner) => runner.state.record_property(property),
            #[cfg(windows)]
            TestRunner::Windows(runner) => runner.record_property(property),
            #[cfg(target_os = "nto")]
            TestRunner::DirectSpawn(runner) => runner.state.record_property(property),
        }
    }

    /// Executor-side: asks the overseer to drop buffered results for
    /// the current test and waits until it has.
    pub fn clear_current_part_results(&mut self) {
        match self {
            TestRunner::Direct(_) => {}
            #[cfg(unix)]
            TestRunner::Fork(runner) => runner.state.clear_current_part_results(),
            #[cfg(unix)]
            TestRunner::ForkExec(runner) => runner.state.clear_current_part_results(),
            #[cfg(windows)]
            TestRunner::Windows(runner) => runner.clear_current_part_results(),
            #[cfg(target_os = "nto")]
            TestRunner::DirectSpawn(runner) => runner.state.clear_current_part_results(),
        }
    }

    /// Overseer-side: drains the channel into the hooks, then reaps
    /// the child and returns its raw exit status.
    pub fn wait(&mut self, hooks: &mut dyn SuiteHooks) -> i32 {
        match self {
            TestRunner::Direct(_) => {
                runner_abort(format_args!("wait called on a non-isolated runner"))
            }
            #[cfg(unix)]
            TestRunner::Fork(runner) => runner.state.wait(hooks),
            #[cfg(unix)]
            TestRunner::ForkExec(runner) => runner.state.wait(hooks),
            #[cfg(windows)]
            TestRunner::Windows(runner) => runner.wait(hooks),
            #[cfg(target_os = "nto")]
            TestRunner::DirectSpawn(runner) => runner.state.wait(hooks),
        }
    }

    /// Overseer-side: flushes captured diagnostics and translates the
    /// outcome into collector terms. Returns false when nothing was
    /// spawned.
    pub fn process_outcome(&mut self, hooks: &mut dyn SuiteHooks) -> bool {
        match self {
            TestRunner::Direct(_) => false,
            #[cfg(unix)]
            TestRunner::Fork(runner) => runner.state.process_outcome(hooks),
            #[cfg(unix)]
            TestRunner::ForkExec(runner) => runner.state.process_outcome(hooks),
            #[cfg(windows)]
            TestRunner::Windows(runner) => runner.process_outcome(hooks),
            #[cfg(target_os = "nto")]
            TestRunner::DirectSpawn(runner) => runner.state.process_outcome(hooks),
        }
    }

    pub fn outcome(&self) -> TestOutcome {
        match self {
            TestRunner::Direct(_) => TestOutcome::InProgress,
            #[cfg(unix)]
            TestRunner::Fork(runner) => runner.state.outcome(),
            #[cfg(unix)]
            TestRunner::ForkExec(runner) => runner.state.outcome(),
            #[cfg(windows)]
            TestRunner::Windows(runner) => runner.outcome(),
            #[cfg(target_os = "nto")]
            TestRunner::DirectSpawn(runner) => runner.state.outcome(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PartResultKind, TestProperty};
    use crate::collector::{CollectedEvent, SuiteCollector, TestIdentity};
    use std::io::Cursor;

    fn collector() -> SuiteCollector {
        SuiteCollector::new(TestIdentity::new("case", "name"))
    }

    fn encode_all(messages: &[ChannelMessage]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for message in messages {
            bytes.extend_from_slice(&codec::encode_message(message));
        }
        bytes
    }

    #[test]
    fn test_drain_applies_messages_in_order_and_acks_each() {
        let result = TestPartResult::new(
            PartResultKind::NonFatalFailure,
            Some("a.rs".to_string()),
            1,
            Some("first".to_string()),
        );
        let property = TestProperty {
            key: "k".to_string(),
            value: "v".to_string(),
        };
        let bytes = encode_all(&[
            ChannelMessage::Property(property.clone()),
            ChannelMessage::PartResult(result.clone()),
            ChannelMessage::Exited,
        ]);

        let mut hooks = collector();
        let mut acks = Vec::new();
        let outcome = drain_messages(&mut Cursor::new(bytes), &mut acks, &mut hooks);

        assert_eq!(outcome, TestOutcome::ExitedNormally);
        assert_eq!(acks, vec![codec::ACK, codec::ACK]);
        assert_eq!(hooks.events.len(), 2);
        assert_eq!(hooks.events[0], CollectedEvent::Property(property));
        assert_eq!(hooks.events[1], CollectedEvent::Part(result));
    }

    #[test]
    fn test_drain_eof_is_died() {
        let mut hooks = collector();
        let mut acks = Vec::new();
        let outcome = drain_messages(&mut Cursor::new(Vec::<u8>::new()), &mut acks, &mut hooks);
        assert_eq!(outcome, TestOutcome::Died);
        assert!(acks.is_empty());
    }

    #[test]
    fn test_drain_clear_reaches_the_collector() {
        let bytes = encode_all(&[
            ChannelMessage::PartResult(TestPartResult::fatal_at_unknown_location(
                "retry 1".to_string(),
            )),
            ChannelMessage::ClearResults,
            ChannelMessage::Exited,
        ]);
        let mut hooks = collector();
        let mut acks = Vec::new();
        let outcome = drain_messages(&mut Cursor::new(bytes), &mut acks, &mut hooks);

        assert_eq!(outcome, TestOutcome::ExitedNormally);
        assert!(hooks.part_results.is_empty());
        assert_eq!(acks.len(), 2);
    }

    #[test]
    fn test_drain_internal_error_is_attributed() {
        let bytes = encode_all(&[ChannelMessage::InternalError("pipe closed".to_string())]);
        let mut hooks = collector();
        let mut acks = Vec::new();
        let outcome = drain_messages(&mut Cursor::new(bytes), &mut acks, &mut hooks);

        // EOF follows the relayed error.
        assert_eq!(outcome, TestOutcome::Died);
        assert_eq!(hooks.fatal_failures(), 1);
        assert!(hooks.part_results[0]
            .message
            .as_deref()
            .unwrap()
            .contains("pipe closed"));
        // Internal errors are not acknowledged; the child is gone.
        assert!(acks.is_empty());
    }

    #[test]
    fn test_send_and_await_ack_writes_one_message() {
        let mut results = Vec::new();
        let mut acks = Cursor::new(vec![codec::ACK]);
        let message = ChannelMessage::Property(TestProperty {
            key: "k".to_string(),
            value: "v".to_string(),
        });
        send_and_await_ack(&mut results, &mut acks, &message);
        assert_eq!(results, codec::encode_message(&message));
    }

    #[test]
    fn test_direct_runner_surface() {
        let mut hooks = collector();
        let mut runner = TestRunner::Direct(DirectRunner);
        assert_eq!(runner.assume_role(&mut hooks), Role::Execute);
        // No channel, so these are inert.
        runner.report_part_result(&TestPartResult::fatal_at_unknown_location("x".to_string()));
        runner.record_property(&TestProperty {
            key: "k".to_string(),
            value: "v".to_string(),
        });
        runner.clear_current_part_results();
        runner.set_up();
        runner.tear_down();
        assert!(!runner.process_outcome(&mut hooks));
        assert!(hooks.part_results.is_empty());
        assert!(!hooks.forwarding_suppressed);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(TestOutcome::Died.to_string(), "died");
        assert_eq!(TestOutcome::ExitedNormally.to_string(), "exited-normally");
    }
}
