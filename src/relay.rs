//! Mirrors locally observed part results to the overseer.

use crate::codec::TestPartResult;
use crate::collector::{SuiteCollector, SuiteHooks};
use crate::runner::TestRunner;

/// The in-process reporting pipeline being wrapped.
pub trait PartResultReporter {
    fn report_part_result(&mut self, result: &TestPartResult);
}

impl PartResultReporter for SuiteCollector {
    fn report_part_result(&mut self, result: &TestPartResult) {
        SuiteHooks::report_part_result(self, result);
    }
}

/// Wraps the executor's own reporter so every result is applied
/// locally first and then sent across the channel. Local delivery
/// comes first: the executor's pass/fail view must stay correct even
/// if the remote send dies with the process.
pub struct RelayReporter<'a> {
    original: &'a mut dyn PartResultReporter,
    runner: &'a mut TestRunner,
}

impl<'a> RelayReporter<'a> {
    pub fn new(original: &'a mut dyn PartResultReporter, runner: &'a mut TestRunner) -> Self {
        Self { original, runner }
    }
}

impl PartResultReporter for RelayReporter<'_> {
    fn report_part_result(&mut self, result: &TestPartResult) {
        self.original.report_part_result(result);
        self.runner.report_part_result(result);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PartResultKind;
    use crate::runner::{DirectRunner, TestRunner};

    struct RecordingReporter {
        seen: Vec<TestPartResult>,
    }

    impl PartResultReporter for RecordingReporter {
        fn report_part_result(&mut self, result: &TestPartResult) {
            self.seen.push(result.clone());
        }
    }

    #[test]
    fn test_local_delivery_happens() {
        let mut local = RecordingReporter { seen: Vec::new() };
        // A non-isolated runner drops the remote half, which is
        // exactly what makes it usable here.
        let mut runner = TestRunner::Direct(DirectRunner);

        let result = TestPartResult::new(
            PartResultKind::FatalFailure,
            Some("lib.rs".to_string()),
            3,
            Some("boom".to_string()),
        );
        RelayReporter::new(&mut local, &mut runner).report_part_result(&result);

        assert_eq!(local.seen.len(), 1);
        assert_eq!(local.seen[0], result);
    }
}
