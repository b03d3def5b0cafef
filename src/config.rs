//! Run configuration for isolation.
//!
//! Sources, lowest priority first: built-in platform default, a
//! `[isolation]` table in `vigil.toml` next to the project, then the
//! `VIGIL_ISOLATION` / `VIGIL_PREFER_FORK` environment variables.
//! Unrecognized values are hard errors at load time; a typo must not
//! quietly run the suite without isolation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// How tests are isolated from the harness process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationMode {
    /// Run test bodies in the harness process. A crash takes the
    /// whole run down.
    Off,
    /// Duplicate the process and run the body in the child.
    #[default]
    ForkAndRun,
    /// Duplicate, then re-exec the binary so no thread state leaks
    /// into the child.
    ForkAndReExec,
}

impl FromStr for IsolationMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "off" => Ok(IsolationMode::Off),
            "fork-and-run" => Ok(IsolationMode::ForkAndRun),
            "fork-and-re-exec" => Ok(IsolationMode::ForkAndReExec),
            other => bail!(
                "unrecognized isolation mode {:?} (expected off, fork-and-run or fork-and-re-exec)",
                other
            ),
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IsolationMode::Off => "off",
            IsolationMode::ForkAndRun => "fork-and-run",
            IsolationMode::ForkAndReExec => "fork-and-re-exec",
        };
        f.write_str(text)
    }
}

/// Settings the factory selects a strategy from.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub isolation: IsolationMode,
    /// Prefer classic `fork` over the lighter duplication primitive
    /// for the re-exec strategy.
    pub prefer_fork: bool,
    /// Present when this process was re-exec'd as an executor.
    #[cfg(unix)]
    pub handoff: Option<crate::forkexec::ExecutorHandoff>,
    #[cfg(windows)]
    pub handoff: Option<crate::spawn_windows::ExecutorHandoff>,
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    isolation: Option<IsolationTable>,
}

#[derive(Deserialize, Default)]
struct IsolationTable {
    mode: Option<String>,
    prefer_fork: Option<bool>,
}

impl RunConfig {
    /// Loads `vigil.toml` from `root` if present, then applies
    /// environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let mut config = RunConfig::default();

        let path = root.join("vigil.toml");
        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let file: ConfigFile = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            if let Some(isolation) = file.isolation {
                if let Some(mode) = isolation.mode {
                    config.isolation = mode
                        .parse()
                        .with_context(|| format!("in {}", path.display()))?;
                }
                if let Some(prefer_fork) = isolation.prefer_fork {
                    config.prefer_fork = prefer_fork;
                }
            }
        }

        if let Ok(mode) = std::env::var("VIGIL_ISOLATION") {
            config.isolation = mode.parse().context("in VIGIL_ISOLATION")?;
        }
        if let Ok(value) = std::env::var("VIGIL_PREFER_FORK") {
            config.prefer_fork = match value.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                other => bail!("unrecognized VIGIL_PREFER_FORK value {:?}", other),
            };
        }

        Ok(config)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mode_parse_known_values() {
        assert_eq!("off".parse::<IsolationMode>().unwrap(), IsolationMode::Off);
        assert_eq!(
            "fork-and-run".parse::<IsolationMode>().unwrap(),
            IsolationMode::ForkAndRun
        );
        assert_eq!(
            "fork-and-re-exec".parse::<IsolationMode>().unwrap(),
            IsolationMode::ForkAndReExec
        );
    }

    #[test]
    fn test_mode_parse_rejects_unknown_value() {
        let err = "forkish".parse::<IsolationMode>().unwrap_err();
        assert!(err.to_string().contains("unrecognized isolation mode"));
    }

    #[test]
    fn test_mode_display_roundtrip() {
        for mode in [
            IsolationMode::Off,
            IsolationMode::ForkAndRun,
            IsolationMode::ForkAndReExec,
        ] {
            assert_eq!(mode.to_string().parse::<IsolationMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::load(dir.path()).unwrap();
        assert_eq!(config.isolation, IsolationMode::ForkAndRun);
        assert!(!config.prefer_fork);
    }

    #[test]
    fn test_load_reads_isolation_table() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("vigil.toml"),
            "[isolation]\nmode = \"fork-and-re-exec\"\nprefer_fork = true\n",
        )
        .unwrap();
        let config = RunConfig::load(dir.path()).unwrap();
        assert_eq!(config.isolation, IsolationMode::ForkAndReExec);
        assert!(config.prefer_fork);
    }

    #[test]
    fn test_load_rejects_bad_mode_in_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("vigil.toml"),
            "[isolation]\nmode = \"bogus\"\n",
        )
        .unwrap();
        assert!(RunConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_load_tolerates_unrelated_tables() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("vigil.toml"), "[other]\nkey = \"value\"\n").unwrap();
        let config = RunConfig::load(dir.path()).unwrap();
        assert_eq!(config.isolation, IsolationMode::ForkAndRun);
    }
}
