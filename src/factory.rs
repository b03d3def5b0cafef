//! Builds the right runner variant for a test.

use anyhow::{bail, Result};
use crate::collector::TestIdentity;
use crate::config::{IsolationMode, RunConfig};
use crate::runner::{DirectRunner, TestRunner};

/// Turns run configuration into concrete runners, one per isolated
/// test. Configuration problems surface here, before anything is
/// spawned.
pub struct RunnerFactory {
    config: RunConfig,
}

impl RunnerFactory {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Creates the runner for `identity`. When an executor handoff is
    /// present this process already is the isolated child, and the
    /// returned runner assumes the execute role without spawning.
    pub fn create(&self, identity: &TestIdentity) -> Result<TestRunner> {
        #[cfg(any(unix, windows))]
        if self.config.handoff.is_some() && self.config.isolation != IsolationMode::ForkAndReExec {
            bail!(
                "executor handoff present but isolation mode is {}",
                self.config.isolation
            );
        }

        match self.config.isolation {
            IsolationMode::Off => Ok(TestRunner::Direct(DirectRunner)),
            #[cfg(all(unix, not(target_os = "nto")))]
            IsolationMode::ForkAndRun => Ok(TestRunner::Fork(crate::runner::ForkRunner::new())),
            #[cfg(all(unix, not(target_os = "nto")))]
            IsolationMode::ForkAndReExec => Ok(TestRunner::ForkExec(
                crate::runner::ExecRunner::new(
                    identity.clone(),
                    self.config.prefer_fork,
                    self.config.handoff.clone(),
                ),
            )),
            #[cfg(target_os = "nto")]
            IsolationMode::ForkAndRun | IsolationMode::ForkAndReExec => {
                // fork does not mix with this platform's threading;
                // both isolated modes go through the spawn primitive.
                Ok(TestRunner::DirectSpawn(crate::directspawn::SpawnRunner::new(
                    identity.clone(),
                    self.config.handoff.clone(),
                )))
            }
            #[cfg(windows)]
            IsolationMode::ForkAndRun | IsolationMode::ForkAndReExec => {
                Ok(TestRunner::Windows(
                    crate::spawn_windows::WindowsRunner::new(
                        identity.clone(),
                        self.config.handoff.clone(),
                    ),
                ))
            }
            #[cfg(not(any(unix, windows)))]
            _ => bail!("isolated test execution is not supported on this platform"),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> TestIdentity {
        TestIdentity::new("case", "name")
    }

    #[test]
    fn test_off_builds_a_direct_runner() {
        let factory = RunnerFactory::new(RunConfig {
            isolation: IsolationMode::Off,
            ..RunConfig::default()
        });
        let runner = factory.create(&identity()).unwrap();
        assert!(matches!(runner, TestRunner::Direct(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_fork_and_run_builds_a_fork_runner() {
        let factory = RunnerFactory::new(RunConfig::default());
        let runner = factory.create(&identity()).unwrap();
        assert!(matches!(runner, TestRunner::Fork(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_fork_and_re_exec_builds_an_exec_runner() {
        let factory = RunnerFactory::new(RunConfig {
            isolation: IsolationMode::ForkAndReExec,
            ..RunConfig::default()
        });
        let runner = factory.create(&identity()).unwrap();
        assert!(matches!(runner, TestRunner::ForkExec(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_handoff_with_wrong_mode_is_rejected() {
        let factory = RunnerFactory::new(RunConfig {
            isolation: IsolationMode::ForkAndRun,
            handoff: Some(crate::forkexec::ExecutorHandoff {
                results_fd: 3,
                acks_fd: 4,
                case: "case".to_string(),
                name: "name".to_string(),
            }),
            ..RunConfig::default()
        });
        assert!(factory.create(&identity()).is_err());
    }
}
