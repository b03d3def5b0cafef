//! Acceptance harness for the isolation runner.
//!
//! Runs a set of built-in crash scenarios through the factory and
//! runner pipeline and prints one machine-checkable summary line per
//! scenario. Also serves as its own executor image: when spawned with
//! the internal handoff flag it runs exactly one scenario body and
//! exits through the runner's teardown.
//!
//! Usage: vigil-core [--isolation=MODE] [--prefer-fork] [scenario...]

use anyhow::{bail, Result};
use std::path::Path;
use vigil_core::codec::{PartResultKind, TestPartResult, TestProperty};
use vigil_core::collector::{CollectedEvent, SuiteCollector, SuiteHooks, TestIdentity};
use vigil_core::config::{IsolationMode, RunConfig};
use vigil_core::factory::RunnerFactory;
use vigil_core::relay::{PartResultReporter, RelayReporter};
use vigil_core::runner::{Role, TestRunner};

#[cfg(unix)]
use vigil_core::forkexec::{ExecutorHandoff, HANDOFF_FLAG_PREFIX};
#[cfg(windows)]
use vigil_core::spawn_windows::{ExecutorHandoff, HANDOFF_FLAG_PREFIX};

const SCENARIO_CASE: &str = "CrashScenarios";

/// What a scenario body gets to work with: the local collector view
/// and the runner mirroring everything to the overseer.
struct ScenarioCx<'a> {
    local: &'a mut SuiteCollector,
    runner: &'a mut TestRunner,
}

impl ScenarioCx<'_> {
    fn report(&mut self, kind: PartResultKind, message: &str) {
        let result = TestPartResult::new(
            kind,
            Some(file!().to_string()),
            line!() as i32,
            Some(message.to_string()),
        );
        RelayReporter::new(self.local, self.runner).report_part_result(&result);
    }

    fn record_property(&mut self, key: &str, value: &str) {
        let property = TestProperty {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.local.record_property(property.clone());
        self.runner.record_property(&property);
    }

    fn clear(&mut self) {
        self.local.clear_part_results();
        self.runner.clear_current_part_results();
    }
}

// =============================================================================
// Scenario bodies
// =============================================================================

fn scenario_completes(cx: &mut ScenarioCx) {
    cx.report(PartResultKind::Success, "body ran to completion");
}

fn scenario_records(cx: &mut ScenarioCx) {
    cx.record_property("k", "v");
    cx.report(PartResultKind::NonFatalFailure, "expected 2, got 3");
}

fn scenario_fails_fatally(cx: &mut ScenarioCx) {
    cx.report(PartResultKind::FatalFailure, "required invariant violated");
}

fn scenario_clears(cx: &mut ScenarioCx) {
    cx.report(PartResultKind::NonFatalFailure, "first attempt failed");
    cx.clear();
    cx.report(PartResultKind::NonFatalFailure, "second attempt failed");
}

fn scenario_segfaults(_cx: &mut ScenarioCx) {
    unsafe { std::ptr::write_volatile(std::ptr::null_mut::<u8>(), 1) };
}

fn scenario_aborts(_cx: &mut ScenarioCx) {
    std::process::abort();
}

fn scenario_complains(_cx: &mut ScenarioCx) {
    eprintln!("stderr from the isolated body");
    std::process::abort();
}

#[cfg(unix)]
fn scenario_exits_hard(_cx: &mut ScenarioCx) {
    // Straight out, skipping the exit marker. Must count as a death,
    // not as a pass with code 0.
    unsafe { libc::_exit(0) }
}

#[cfg(unix)]
fn scenario_dies_after_chdir(_cx: &mut ScenarioCx) {
    let _ = std::env::set_current_dir("/");
    unsafe { libc::_exit(1) }
}

type ScenarioFn = fn(&mut ScenarioCx);

fn scenarios() -> Vec<(&'static str, ScenarioFn)> {
    let mut list: Vec<(&'static str, ScenarioFn)> = vec![
        ("completes", scenario_completes as ScenarioFn),
        ("records", scenario_records),
        ("fails-fatally", scenario_fails_fatally),
        ("clears", scenario_clears),
        ("segfaults", scenario_segfaults),
        ("aborts", scenario_aborts),
        ("complains", scenario_complains),
    ];
    #[cfg(unix)]
    {
        list.push(("exits-hard", scenario_exits_hard));
        list.push(("dies-after-chdir", scenario_dies_after_chdir));
    }
    list
}

fn find_scenario(name: &str) -> Result<ScenarioFn> {
    scenarios()
        .into_iter()
        .find(|(known, _)| *known == name)
        .map(|(_, body)| body)
        .ok_or_else(|| anyhow::anyhow!("unknown scenario {:?}", name))
}

// =============================================================================
// Driver
// =============================================================================

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let handoff = match ExecutorHandoff::from_args(args.iter().cloned()) {
        Some(parsed) => Some(parsed?),
        None => None,
    };

    let mut config = RunConfig::load(Path::new("."))?;
    let mut selected: Vec<String> = Vec::new();
    for arg in &args {
        if let Some(mode) = arg.strip_prefix("--isolation=") {
            config.isolation = mode.parse()?;
        } else if arg == "--prefer-fork" {
            config.prefer_fork = true;
        } else if arg.starts_with(HANDOFF_FLAG_PREFIX) {
            // Consumed above.
        } else if arg.starts_with("--") {
            bail!("unrecognized flag {:?}", arg);
        } else {
            selected.push(arg.clone());
        }
    }

    if let Some(handoff) = handoff {
        return run_as_executor(handoff, config);
    }

    let factory = RunnerFactory::new(config);
    let all = scenarios();
    let names: Vec<String> = if selected.is_empty() {
        all.iter().map(|(name, _)| name.to_string()).collect()
    } else {
        selected
    };

    for name in &names {
        let body = find_scenario(name)?;
        run_scenario(&factory, name, body)?;
    }
    Ok(())
}

/// This process was spawned as the executor for one scenario. Runs
/// the body and leaves through the runner's teardown; control only
/// comes back here if the runner was somehow not an executor.
fn run_as_executor(handoff: ExecutorHandoff, mut config: RunConfig) -> Result<()> {
    config.isolation = IsolationMode::ForkAndReExec;
    let identity = handoff.identity();
    let body = find_scenario(&identity.name)?;
    config.handoff = Some(handoff);

    let factory = RunnerFactory::new(config);
    let mut collector = SuiteCollector::new(identity.clone());
    let mut runner = factory.create(&identity)?;

    match runner.assume_role(&mut collector) {
        Role::Execute => {
            runner.set_up();
            {
                let mut cx = ScenarioCx {
                    local: &mut collector,
                    runner: &mut runner,
                };
                body(&mut cx);
            }
            runner.tear_down();
            bail!("executor teardown returned");
        }
        Role::Oversee => bail!("re-exec'd executor assumed the oversee role"),
    }
}

fn run_scenario(factory: &RunnerFactory, name: &str, body: ScenarioFn) -> Result<()> {
    let identity = TestIdentity::new(SCENARIO_CASE, name);
    let mut collector = SuiteCollector::new(identity.clone());
    let mut runner = factory.create(&identity)?;

    match runner.assume_role(&mut collector) {
        Role::Execute => {
            runner.set_up();
            {
                let mut cx = ScenarioCx {
                    local: &mut collector,
                    runner: &mut runner,
                };
                body(&mut cx);
            }
            // Isolated executors exit inside tear_down; only the
            // non-isolated runner comes back.
            runner.tear_down();
            print_summary(name, "in-process", &collector);
        }
        Role::Oversee => {
            let _status = runner.wait(&mut collector);
            runner.process_outcome(&mut collector);
            print_summary(name, &runner.outcome().to_string(), &collector);
        }
    }
    Ok(())
}

fn print_summary(name: &str, outcome: &str, collector: &SuiteCollector) {
    let events: Vec<String> = collector
        .events
        .iter()
        .map(|event| match event {
            CollectedEvent::Part(result) => match result.kind {
                PartResultKind::Success => "part:success".to_string(),
                PartResultKind::NonFatalFailure => "part:nonfatal".to_string(),
                PartResultKind::FatalFailure => "part:fatal".to_string(),
            },
            CollectedEvent::Property(property) => {
                format!("property:{}={}", property.key, property.value)
            }
            CollectedEvent::Cleared => "cleared".to_string(),
        })
        .collect();
    println!(
        "[vigil] scenario {}: outcome={} fatal={} nonfatal={} properties={} events={}",
        name,
        outcome,
        collector.fatal_failures(),
        collector.non_fatal_failures(),
        collector.properties.len(),
        if events.is_empty() {
            "-".to_string()
        } else {
            events.join(",")
        }
    );
    for result in &collector.part_results {
        if result.kind == PartResultKind::FatalFailure {
            println!(
                "[vigil]   fatal: {}",
                result.message.as_deref().unwrap_or("")
            );
        }
    }
}
