//! Process isolation on Windows.
//!
//! There is no fork, so the executor is always a fresh image of the
//! current binary. The channel is a pair of anonymous pipes whose
//! child-side handles are inherited; a named event tells the overseer
//! the child actually picked them up, so a child that dies during
//! startup cannot leave the overseer blocked on a pipe whose write
//! end still exists in this process.

#![cfg(windows)]

use crate::codec::{ChannelMessage, TestPartResult, TestProperty};
use crate::collector::{SuiteHooks, TestIdentity};
use crate::runner::{
    drain_messages, flush_stdio, runner_abort, send_and_await_ack, Role, TestOutcome,
};
use anyhow::{bail, Context, Result};
use std::ffi::{c_void, OsStr};
use std::fs::File;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::FromRawHandle;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use windows_sys::Win32::Foundation::{
    CloseHandle, SetHandleInformation, GENERIC_WRITE, HANDLE, HANDLE_FLAG_INHERIT,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, CREATE_ALWAYS, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ,
};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::Threading::{
    CreateEventW, CreateProcessW, GetExitCodeProcess, OpenEventW, SetEvent,
    WaitForMultipleObjects, WaitForSingleObject, EVENT_MODIFY_STATE, INFINITE,
    PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOW,
};

/// Internal argv flag carrying the executor handoff.
pub const HANDOFF_FLAG_PREFIX: &str = "--isolated-run=";

static SPAWN_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Inherited handle values, the readiness event name and the test
/// identity, as passed to the re-exec'd executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorHandoff {
    pub results_handle: isize,
    pub acks_handle: isize,
    pub event_name: String,
    pub case: String,
    pub name: String,
}

impl ExecutorHandoff {
    pub fn to_flag(&self) -> String {
        format!(
            "{}{}|{}|{}|{}|{}",
            HANDOFF_FLAG_PREFIX,
            self.results_handle,
            self.acks_handle,
            self.event_name,
            self.case,
            self.name
        )
    }

    fn parse(value: &str) -> Result<Self> {
        let mut fields = value.splitn(5, '|');
        let results_handle = fields
            .next()
            .context("handoff flag is empty")?
            .parse::<isize>()
            .context("bad results handle in handoff flag")?;
        let acks_handle = fields
            .next()
            .context("handoff flag is missing the ack handle")?
            .parse::<isize>()
            .context("bad ack handle in handoff flag")?;
        let event_name = fields
            .next()
            .context("handoff flag is missing the event name")?
            .to_string();
        let case = fields
            .next()
            .context("handoff flag is missing the test case")?
            .to_string();
        let name = fields
            .next()
            .context("handoff flag is missing the test name")?
            .to_string();
        if event_name.is_empty() {
            bail!("handoff event name is empty");
        }
        Ok(Self {
            results_handle,
            acks_handle,
            event_name,
            case,
            name,
        })
    }

    /// Scans process arguments for the handoff flag.
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

fn wide(text: &OsStr) -> Vec<u16> {
    text.encode_wide().chain(std::iter::once(0)).collect()
}

fn inheritable() -> SECURITY_ATTRIBUTES {
    SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: 1,
    }
}

/// Runner variant for Windows; services both isolated modes.
pub struct WindowsRunner {
    identity: TestIdentity,
    handoff: Option<ExecutorHandoff>,
    spawned: bool,
    outcome: TestOutcome,
    results_read: Option<File>,
    acks_write: Option<File>,
    results_write: Option<File>,
    acks_read: Option<File>,
    process: HANDLE,
    capture_path: Option<PathBuf>,
}

impl WindowsRunner {
    pub(crate) fn new(identity: TestIdentity, handoff: Option<ExecutorHandoff>) -> Self {
        Self {
            identity,
            handoff,
            spawned: false,
            outcome: TestOutcome::InProgress,
            results_read: None,
            acks_write: None,
            results_write: None,
            acks_read: None,
            process: 0,
            capture_path: None,
        }
    }

    pub(crate) fn assume_role(&mut self, hooks: &mut dyn SuiteHooks) -> Role {
        if let Some(handoff) = self.handoff.take() {
            self.adopt_inherited_handles(&handoff);
            hooks.suppress_event_forwarding();
            return Role::Execute;
        }
        match self.spawn_executor() {
            Ok(()) => Role::Oversee,
            Err(err) => runner_abort(format_args!("spawning isolated child failed: {err:#}")),
        }
    }

    fn adopt_inherited_handles(&mut self, handoff: &ExecutorHandoff) {
        self.results_write =
            Some(unsafe { File::from_raw_handle(handoff.results_handle as *mut c_void) });
        self.acks_read =
            Some(unsafe { File::from_raw_handle(handoff.acks_handle as *mut c_void) });

        // Signal readiness so the overseer can release its copies of
        // the inherited handles.
        let name = wide(OsStr::new(&handoff.event_name));
        unsafe {
            let event = OpenEventW(EVENT_MODIFY_STATE, 0, name.as_ptr());
            if event == 0 {
                runner_abort(format_args!(
                    "readiness event {:?} could not be opened",
                    handoff.event_name
                ));
            }
            SetEvent(event);
            CloseHandle(event);
        }
    }

    fn spawn_executor(&mut self) -> Result<()> {
        let sequence = SPAWN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();

        // Channel pipes. Only the child-side end of each stays
        // inheritable.
        let mut results_read: HANDLE = INVALID_HANDLE_VALUE;
        let mut results_write: HANDLE = INVALID_HANDLE_VALUE;
        let mut acks_read: HANDLE = INVALID_HANDLE_VALUE;
        let mut acks_write: HANDLE = INVALID_HANDLE_VALUE;
        let sa = inheritable();
        unsafe {
            if CreatePipe(&mut results_read, &mut results_write, &sa, 0) == 0 {
                bail!("result pipe creation failed: {}", last_error());
            }
            if CreatePipe(&mut acks_read, &mut acks_write, &sa, 0) == 0 {
                bail!("ack pipe creation failed: {}", last_error());
            }
            SetHandleInformation(results_read, HANDLE_FLAG_INHERIT, 0);
            SetHandleInformation(acks_write, HANDLE_FLAG_INHERIT, 0);
        }

        // Readiness event, opened by name in the child.
        let event_name = format!("vigil-ready-{}-{}", pid, sequence);
        let event_name_w = wide(OsStr::new(&event_name));
        let event = unsafe { CreateEventW(ptr::null(), 1, 0, event_name_w.as_ptr()) };
        if event == 0 {
            bail!("readiness event creation failed: {}", last_error());
        }

        // Child stderr goes straight into the capture file.
        let capture_path =
            std::env::temp_dir().join(format!("vigil_stderr_{}_{}.log", pid, sequence));
        let capture_path_w = wide(capture_path.as_os_str());
        let capture_handle = unsafe {
            CreateFileW(
                capture_path_w.as_ptr(),
                GENERIC_WRITE,
                FILE_SHARE_READ,
                &sa,
                CREATE_ALWAYS,
                FILE_ATTRIBUTE_NORMAL,
                0,
            )
        };
        if capture_handle == INVALID_HANDLE_VALUE {
            bail!("capture file creation failed: {}", last_error());
        }

        let handoff = ExecutorHandoff {
            results_handle: results_write as isize,
            acks_handle: acks_read as isize,
            event_name,
            case: self.identity.case.clone(),
            name: self.identity.name.clone(),
        };
        let mut command_line = build_command_line(&handoff)?;

        let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
        startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
        startup.dwFlags = STARTF_USESTDHANDLES;
        startup.hStdError = capture_handle;
        let mut process_info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        flush_stdio();
        let created = unsafe {
            CreateProcessW(
                ptr::null(),
                command_line.as_mut_ptr(),
                ptr::null(),
                ptr::null(),
                1,
                0,
                ptr::null(),
                ptr::null(),
                &startup,
                &mut process_info,
            )
        };
        if created == 0 {
            bail!("isolated child creation failed: {}", last_error());
        }

        unsafe {
            CloseHandle(process_info.hThread);
            CloseHandle(capture_handle);

            // Child exit or readiness, whichever first. Either way the
            // inherited-side handles must go so channel reads see EOF
            // when the child terminates.
            let waitables = [process_info.hProcess, event];
            WaitForMultipleObjects(2, waitables.as_ptr(), 0, INFINITE);
            CloseHandle(results_write);
            CloseHandle(acks_read);
            CloseHandle(event);
        }

        self.results_read = Some(unsafe { File::from_raw_handle(results_read as *mut c_void) });
        self.acks_write = Some(unsafe { File::from_raw_handle(acks_write as *mut c_void) });
        self.process = process_info.hProcess;
        self.capture_path = Some(capture_path);
        self.spawned = true;
        Ok(())
    }

    fn executor_endpoints(&mut self) -> (&mut File, &mut File) {
        let results = match self.results_write.as_mut() {
            Some(file) => file,
            None => runner_abort(format_args!("result endpoint is not open in this role")),
        };
        let acks = match self.acks_read.as_mut() {
            Some(file) => file,
            None => runner_abort(format_args!("ack endpoint is not open in this role")),
        };
        (results, acks)
    }

    pub(crate) fn report_part_result(&mut self, result: &TestPartResult) {
        let (results, acks) = self.executor_endpoints();
        send_and_await_ack(results, acks, &ChannelMessage::PartResult(result.clone()));
    }

    pub(crate) fn record_property(&mut self, property: &TestProperty) {
        let (results, acks) = self.executor_endpoints();
        send_and_await_ack(results, acks, &ChannelMessage::Property(property.clone()));
    }

    pub(crate) fn clear_current_part_results(&mut self) {
        let (results, acks) = self.executor_endpoints();
        send_and_await_ack(results, acks, &ChannelMessage::ClearResults);
    }

    pub(crate) fn tear_down_and_exit(&mut self) -> ! {
        flush_stdio();
        use std::io::Write;
        let results = match self.results_write.as_mut() {
            Some(file) => file,
            None => runner_abort(format_args!("result endpoint is not open in this role")),
        };
        if let Err(err) =
            results.write_all(&crate::codec::encode_message(&ChannelMessage::Exited))
        {
            runner_abort(format_args!("exit marker write failed: {err}"));
        }
        std::process::exit(0)
    }

    pub(crate) fn wait(&mut self, hooks: &mut dyn SuiteHooks) -> i32 {
        if !self.spawned {
            return 0;
        }
        let mut results = match self.results_read.take() {
            Some(file) => file,
            None => runner_abort(format_args!("wait without an open read endpoint")),
        };
        let mut acks = match self.acks_write.take() {
            Some(file) => file,
            None => runner_abort(format_args!("wait without an open ack endpoint")),
        };
        self.outcome = drain_messages(&mut results, &mut acks, hooks);
        drop(results);
        drop(acks);

        let mut code: u32 = 0;
        unsafe {
            let waited = WaitForSingleObject(self.process, INFINITE);
            if waited != WAIT_OBJECT_0 {
                runner_abort(format_args!("waiting for isolated child failed"));
            }
            GetExitCodeProcess(self.process, &mut code);
            CloseHandle(self.process);
        }
        self.process = 0;
        code as i32
    }

    pub(crate) fn process_outcome(&mut self, hooks: &mut dyn SuiteHooks) -> bool {
        if !self.spawned {
            return false;
        }
        if let Some(path) = self.capture_path.take() {
            if let Ok(text) = std::fs::read_to_string(&path) {
                eprint!("{text}");
            }
            let _ = std::fs::remove_file(&path);
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

    pub(crate) fn outcome(&self) -> TestOutcome {
        self.outcome
    }
}

fn last_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

/// Current binary plus surviving arguments plus the handoff flag, as
/// one quoted mutable UTF-16 command line.
fn build_command_line(handoff: &ExecutorHandoff) -> Result<Vec<u16>> {
    let exe = std::env::current_exe().context("resolving the current executable")?;
    let mut pieces = vec![exe.to_string_lossy().into_owned()];
    for arg in std::env::args().skip(1) {
        if arg.starts_with(HANDOFF_FLAG_PREFIX) {
            continue;
        }
        pieces.push(arg);
    }
    pieces.push(handoff.to_flag());

    let mut line = String::new();
    for (index, piece) in pieces.iter().enumerate() {
        if index > 0 {
            line.push(' ');
        }
        if piece.contains(' ') {
            line.push('"');
            line.push_str(piece);
            line.push('"');
        } else {
            line.push_str(piece);
        }
    }
    Ok(wide(OsStr::new(&line)))
}
