//! Suite-side hooks the runner reports into.
//!
//! The runner never owns suite state. The harness hands it a
//! [`SuiteHooks`] value carrying the global result collector, the
//! identity of the test being run and the listener kill switch, and
//! the runner threads that context through every call instead of
//! consulting process-wide state.

use crate::codec::{PartResultKind, TestPartResult, TestProperty};
use std::fmt;

/// Identity used to attribute results, in particular a death that
/// produced no result of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestIdentity {
    pub case: String,
    pub name: String,
}

impl TestIdentity {
    pub fn new(case: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            case: case.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.case, self.name)
    }
}

/// What the overseer needs from the surrounding harness: the global
/// collector, the current-test accessor and event-forwarding control.
pub trait SuiteHooks {
    /// Delivers a decoded part result to the global collector.
    fn report_part_result(&mut self, result: &TestPartResult);

    /// Records a property on the current test.
    fn record_property(&mut self, property: TestProperty);

    /// Discards results buffered so far for the current test.
    fn clear_part_results(&mut self);

    /// Identity of the test currently being run.
    fn current_test(&self) -> TestIdentity;

    /// Stops suite-level lifecycle events from being emitted by this
    /// process. Called in the executor so only the primary process
    /// reports run-level events.
    fn suppress_event_forwarding(&mut self);
}

/// Collector events in the exact order they were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectedEvent {
    Part(TestPartResult),
    Property(TestProperty),
    Cleared,
}

/// In-memory [`SuiteHooks`] implementation used by the harness binary
/// and the tests. Keeps an ordered event log next to the per-test
/// views so delivery order stays observable.
#[derive(Debug)]
pub struct SuiteCollector {
    identity: TestIdentity,
    pub events: Vec<CollectedEvent>,
    pub part_results: Vec<TestPartResult>,
    pub properties: Vec<TestProperty>,
    pub forwarding_suppressed: bool,
}

impl SuiteCollector {
    pub fn new(identity: TestIdentity) -> Self {
        Self {
            identity,
            events: Vec::new(),
            part_results: Vec::new(),
            properties: Vec::new(),
            forwarding_suppressed: false,
        }
    }

    pub fn failure_count(&self, kind: PartResultKind) -> usize {
        self.part_results.iter().filter(|r| r.kind == kind).count()
    }

    pub fn fatal_failures(&self) -> usize {
        self.failure_count(PartResultKind::FatalFailure)
    }

    pub fn non_fatal_failures(&self) -> usize {
        self.failure_count(PartResultKind::NonFatalFailure)
    }
}

impl SuiteHooks for SuiteCollector {
    fn report_part_result(&mut self, result: &TestPartResult) {
        self.events.push(CollectedEvent::Part(result.clone()));
        self.part_results.push(result.clone());
    }

    fn record_property(&mut self, property: TestProperty) {
        self.events.push(CollectedEvent::Property(property.clone()));
        self.properties.push(property);
    }

    fn clear_part_results(&mut self) {
        self.events.push(CollectedEvent::Cleared);
        self.part_results.clear();
    }

    fn current_test(&self) -> TestIdentity {
        self.identity.clone()
    }

    fn suppress_event_forwarding(&mut self) {
        self.forwarding_suppressed = true;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(message: &str) -> TestPartResult {
        TestPartResult::new(
            PartResultKind::NonFatalFailure,
            None,
            -1,
            Some(message.to_string()),
        )
    }

    #[test]
    fn test_event_log_preserves_order() {
        let mut collector = SuiteCollector::new(TestIdentity::new("case", "name"));
        collector.record_property(TestProperty {
            key: "k".to_string(),
            value: "v".to_string(),
        });
        collector.report_part_result(&failure("one"));

        assert_eq!(collector.events.len(), 2);
        assert!(matches!(collector.events[0], CollectedEvent::Property(_)));
        assert!(matches!(collector.events[1], CollectedEvent::Part(_)));
    }

    #[test]
    fn test_clear_drops_results_but_logs_the_clear() {
        let mut collector = SuiteCollector::new(TestIdentity::new("case", "name"));
        collector.report_part_result(&failure("dropped"));
        collector.clear_part_results();
        collector.report_part_result(&failure("kept"));

        assert_eq!(collector.part_results.len(), 1);
        assert_eq!(
            collector.part_results[0].message.as_deref(),
            Some("kept")
        );
        assert!(collector.events.contains(&CollectedEvent::Cleared));
    }

    #[test]
    fn test_identity_display() {
        let identity = TestIdentity::new("WidgetTest", "handles_overflow");
        assert_eq!(identity.to_string(), "WidgetTest.handles_overflow");
    }
}
