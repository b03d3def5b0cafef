//! Drives the acceptance harness binary through every isolation mode
//! and checks the per-scenario summary lines.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

struct HarnessRun {
    stdout: String,
    stderr: String,
    code: Option<i32>,
}

/// A hung overseer would hang the whole suite, so the harness gets a
/// hard deadline.
fn run_harness(args: &[&str]) -> HarnessRun {
    let mut child = Command::new(env!("CARGO_BIN_EXE_vigil-core"))
        .args(args)
        .env_remove("VIGIL_ISOLATION")
        .env_remove("VIGIL_PREFER_FORK")
        .current_dir(env!("CARGO_MANIFEST_DIR"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("harness did not start");

    let status = match child
        .wait_timeout(Duration::from_secs(60))
        .expect("waiting for the harness failed")
    {
        Some(status) => status,
        None => {
            let _ = child.kill();
            panic!("harness hung");
        }
    };

    let mut stdout = String::new();
    child
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut stdout)
        .unwrap();
    let mut stderr = String::new();
    child
        .stderr
        .take()
        .unwrap()
        .read_to_string(&mut stderr)
        .unwrap();

    HarnessRun {
        stdout,
        stderr,
        code: status.code(),
    }
}

#[test]
fn test_record_property_and_nonfatal_failure_under_fork() {
    let run = run_harness(&["--isolation=fork-and-run", "records"]);
    assert_eq!(run.code, Some(0), "stderr: {}", run.stderr);
    assert!(
        run.stdout.contains(
            "scenario records: outcome=exited-normally fatal=0 nonfatal=1 properties=1 \
             events=property:k=v,part:nonfatal"
        ),
        "stdout: {}",
        run.stdout
    );
}

#[test]
fn test_segfault_is_contained_and_the_suite_continues() {
    let run = run_harness(&["--isolation=fork-and-run", "segfaults", "completes"]);
    assert_eq!(run.code, Some(0), "stderr: {}", run.stderr);
    assert!(
        run.stdout
            .contains("scenario segfaults: outcome=died fatal=1"),
        "stdout: {}",
        run.stdout
    );
    // The death is attributed to the test that died.
    assert!(
        run.stdout
            .contains("Test process died while executing CrashScenarios.segfaults"),
        "stdout: {}",
        run.stdout
    );
    // And the next scenario still ran.
    let crash_at = run.stdout.find("scenario segfaults").unwrap();
    let next_at = run
        .stdout
        .find("scenario completes: outcome=exited-normally")
        .expect("later scenario missing");
    assert!(crash_at < next_at);
}

#[cfg(unix)]
#[test]
fn test_hard_exit_is_a_death_not_a_pass() {
    let run = run_harness(&["--isolation=fork-and-run", "exits-hard"]);
    assert!(
        run.stdout
            .contains("scenario exits-hard: outcome=died fatal=1"),
        "stdout: {}",
        run.stdout
    );
}

#[test]
fn test_abort_is_contained() {
    let run = run_harness(&["--isolation=fork-and-run", "aborts"]);
    assert!(
        run.stdout.contains("scenario aborts: outcome=died fatal=1"),
        "stdout: {}",
        run.stdout
    );
}

#[test]
fn test_clear_supports_a_retry() {
    let run = run_harness(&["--isolation=fork-and-run", "clears"]);
    assert!(
        run.stdout.contains(
            "scenario clears: outcome=exited-normally fatal=0 nonfatal=1 properties=0 \
             events=part:nonfatal,cleared,part:nonfatal"
        ),
        "stdout: {}",
        run.stdout
    );
}

#[test]
fn test_child_stderr_is_captured_and_surfaced() {
    let run = run_harness(&["--isolation=fork-and-run", "complains"]);
    assert!(
        run.stdout
            .contains("scenario complains: outcome=died fatal=1"),
        "stdout: {}",
        run.stdout
    );
    assert!(
        run.stderr.contains("stderr from the isolated body"),
        "stderr: {}",
        run.stderr
    );
}

#[cfg(unix)]
#[test]
fn test_death_in_a_changed_directory_is_still_contained() {
    let run = run_harness(&["--isolation=fork-and-run", "dies-after-chdir"]);
    assert!(
        run.stdout
            .contains("scenario dies-after-chdir: outcome=died fatal=1"),
        "stdout: {}",
        run.stdout
    );
}

#[test]
fn test_whole_default_run_survives_every_crash_scenario() {
    let run = run_harness(&[]);
    assert_eq!(run.code, Some(0), "stderr: {}", run.stderr);
    let mut expected = vec![
        "completes",
        "records",
        "fails-fatally",
        "clears",
        "segfaults",
        "aborts",
        "complains",
    ];
    if cfg!(unix) {
        expected.extend(["exits-hard", "dies-after-chdir"]);
    }
    for scenario in expected {
        assert!(
            run.stdout.contains(&format!("scenario {scenario}: outcome=")),
            "scenario {scenario} missing from: {}",
            run.stdout
        );
    }
}

#[test]
fn test_re_exec_mode_reports_like_fork_mode() {
    let run = run_harness(&["--isolation=fork-and-re-exec", "records"]);
    assert_eq!(run.code, Some(0), "stderr: {}", run.stderr);
    assert!(
        run.stdout.contains(
            "scenario records: outcome=exited-normally fatal=0 nonfatal=1 properties=1 \
             events=property:k=v,part:nonfatal"
        ),
        "stdout: {}",
        run.stdout
    );
}

#[test]
fn test_re_exec_mode_contains_a_segfault() {
    let run = run_harness(&["--isolation=fork-and-re-exec", "segfaults"]);
    assert!(
        run.stdout
            .contains("scenario segfaults: outcome=died fatal=1"),
        "stdout: {}",
        run.stdout
    );
}

#[test]
fn test_re_exec_mode_with_classic_fork() {
    let run = run_harness(&["--isolation=fork-and-re-exec", "--prefer-fork", "records"]);
    assert!(
        run.stdout
            .contains("scenario records: outcome=exited-normally"),
        "stdout: {}",
        run.stdout
    );
}

#[test]
fn test_isolation_off_runs_in_process() {
    let run = run_harness(&["--isolation=off", "records"]);
    assert_eq!(run.code, Some(0), "stderr: {}", run.stderr);
    assert!(
        run.stdout.contains(
            "scenario records: outcome=in-process fatal=0 nonfatal=1 properties=1"
        ),
        "stdout: {}",
        run.stdout
    );
}

#[test]
fn test_unrecognized_isolation_mode_fails_before_any_test() {
    let run = run_harness(&["--isolation=bogus", "completes"]);
    assert_ne!(run.code, Some(0));
    assert!(
        run.stderr.contains("unrecognized isolation mode"),
        "stderr: {}",
        run.stderr
    );
    assert!(
        !run.stdout.contains("scenario completes"),
        "a scenario ran anyway: {}",
        run.stdout
    );
}
