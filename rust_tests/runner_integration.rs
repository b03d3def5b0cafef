//! End-to-end tests for the fork-and-run strategy, overseer and
//! executor in one test process and its forked child.

#![cfg(unix)]

use std::sync::Mutex;
use vigil_core::codec::{PartResultKind, TestPartResult, TestProperty};
use vigil_core::collector::{CollectedEvent, SuiteCollector, TestIdentity};
use vigil_core::config::RunConfig;
use vigil_core::factory::RunnerFactory;
use vigil_core::runner::{Role, TestOutcome, TestRunner};

// Every test here redirects the process-wide stderr while its
// overseer runs, so they must not overlap.
static ISOLATION_LOCK: Mutex<()> = Mutex::new(());

fn part(kind: PartResultKind, message: &str) -> TestPartResult {
    TestPartResult::new(
        kind,
        Some("scenario.rs".to_string()),
        12,
        Some(message.to_string()),
    )
}

/// Runs `body` in a forked executor and returns the overseer's view.
/// The executor side never comes back: it leaves through tear_down or
/// dies inside the body.
fn oversee<F>(name: &str, body: F) -> (SuiteCollector, TestOutcome)
where
    F: FnOnce(&mut SuiteCollector, &mut TestRunner),
{
    let identity = TestIdentity::new("RunnerIntegration", name);
    let mut collector = SuiteCollector::new(identity.clone());
    let factory = RunnerFactory::new(RunConfig::default());
    let mut runner = factory.create(&identity).unwrap();

    match runner.assume_role(&mut collector) {
        Role::Execute => {
            runner.set_up();
            body(&mut collector, &mut runner);
            runner.tear_down();
            unreachable!("executor teardown returned");
        }
        Role::Oversee => {
            runner.wait(&mut collector);
            assert!(runner.process_outcome(&mut collector));
            let outcome = runner.outcome();
            (collector, outcome)
        }
    }
}

#[test]
fn test_completed_body_reports_property_then_failure_in_order() {
    let _guard = ISOLATION_LOCK.lock().unwrap();
    let (collector, outcome) = oversee("records", |_, runner| {
        runner.record_property(&TestProperty {
            key: "k".to_string(),
            value: "v".to_string(),
        });
        runner.report_part_result(&part(PartResultKind::NonFatalFailure, "expected 2, got 3"));
    });

    assert_eq!(outcome, TestOutcome::ExitedNormally);
    assert_eq!(collector.properties.len(), 1);
    assert_eq!(collector.properties[0].key, "k");
    assert_eq!(collector.properties[0].value, "v");
    assert_eq!(collector.non_fatal_failures(), 1);
    assert_eq!(collector.fatal_failures(), 0);
    assert!(matches!(collector.events[0], CollectedEvent::Property(_)));
    assert!(matches!(collector.events[1], CollectedEvent::Part(_)));
}

#[test]
fn test_null_write_yields_died_and_one_attributed_fatal() {
    let _guard = ISOLATION_LOCK.lock().unwrap();
    let (collector, outcome) = oversee("segfaults", |_, _| {
        unsafe { std::ptr::write_volatile(std::ptr::null_mut::<u8>(), 1) };
    });

    assert_eq!(outcome, TestOutcome::Died);
    assert_eq!(collector.fatal_failures(), 1);
    let message = collector.part_results[0].message.as_deref().unwrap();
    assert!(message.contains("RunnerIntegration.segfaults"), "{message}");

    // The crash is contained: the next isolated test is unaffected.
    let (collector, outcome) = oversee("after-crash", |_, runner| {
        runner.report_part_result(&part(PartResultKind::Success, "still alive"));
    });
    assert_eq!(outcome, TestOutcome::ExitedNormally);
    assert_eq!(collector.fatal_failures(), 0);
}

#[test]
fn test_abort_yields_died() {
    let _guard = ISOLATION_LOCK.lock().unwrap();
    let (collector, outcome) = oversee("aborts", |_, _| {
        std::process::abort();
    });
    assert_eq!(outcome, TestOutcome::Died);
    assert_eq!(collector.fatal_failures(), 1);
}

#[test]
fn test_exit_zero_without_marker_is_a_death_not_a_pass() {
    let _guard = ISOLATION_LOCK.lock().unwrap();
    let (collector, outcome) = oversee("exits-zero", |_, _| {
        std::process::exit(0);
    });
    assert_eq!(outcome, TestOutcome::Died);
    assert_eq!(collector.fatal_failures(), 1);
}

#[test]
fn test_results_arrive_in_emission_order() {
    let _guard = ISOLATION_LOCK.lock().unwrap();
    let (collector, outcome) = oversee("ordered", |_, runner| {
        for i in 0..25 {
            runner.report_part_result(&part(
                PartResultKind::NonFatalFailure,
                &format!("result {i}"),
            ));
        }
    });

    assert_eq!(outcome, TestOutcome::ExitedNormally);
    assert_eq!(collector.part_results.len(), 25);
    for (i, result) in collector.part_results.iter().enumerate() {
        assert_eq!(
            result.message.as_deref().unwrap(),
            format!("result {i}"),
            "result {i} out of order"
        );
    }
}

#[test]
fn test_clear_discards_buffered_results_for_a_retry() {
    let _guard = ISOLATION_LOCK.lock().unwrap();
    let (collector, outcome) = oversee("clears", |_, runner| {
        runner.report_part_result(&part(PartResultKind::NonFatalFailure, "first attempt"));
        runner.clear_current_part_results();
        runner.report_part_result(&part(PartResultKind::NonFatalFailure, "second attempt"));
    });

    assert_eq!(outcome, TestOutcome::ExitedNormally);
    assert_eq!(collector.part_results.len(), 1);
    assert_eq!(
        collector.part_results[0].message.as_deref(),
        Some("second attempt")
    );
    assert!(collector.events.contains(&CollectedEvent::Cleared));
}

#[test]
fn test_executor_suppresses_event_forwarding() {
    let _guard = ISOLATION_LOCK.lock().unwrap();
    // The child reports back whether its own hooks were muted; the
    // overseer's must not be.
    let (collector, outcome) = oversee("forwarding", |local, runner| {
        if local.forwarding_suppressed {
            runner.report_part_result(&part(PartResultKind::Success, "forwarding suppressed"));
        }
    });

    assert_eq!(outcome, TestOutcome::ExitedNormally);
    assert_eq!(collector.part_results.len(), 1);
    assert!(!collector.forwarding_suppressed);
}

#[test]
fn test_teardown_sends_exactly_one_exit_marker() {
    let _guard = ISOLATION_LOCK.lock().unwrap();
    // A second exit marker after the first would decode as another
    // message; the overseer would still be draining instead of
    // reporting a resolved outcome. Exited with an empty event log is
    // the whole assertion.
    let (collector, outcome) = oversee("quiet", |_, _| {});
    assert_eq!(outcome, TestOutcome::ExitedNormally);
    assert!(collector.events.is_empty());
    assert_eq!(collector.fatal_failures(), 0);
}
