//! Declarative program definitions shared by the supervisor and its control plane
//!
//! A [`ProgramSpec`] describes one supervised OS process. Specs are immutable:
//! changing a program means building a new spec under the same name, and the
//! control plane detects the difference by comparing specs with [`ProgramDiff`].

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Seconds a program must stay up before it counts as started
const DEFAULT_START_SECS: u64 = 1;

/// Seconds between SIGTERM and SIGKILL when stopping a program
const DEFAULT_STOP_WAIT_SECS: u64 = 10;

/// What to do when a running program exits on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoRestart {
    /// Always start it again
    True,
    /// Leave it stopped
    False,
    /// Start it again only if it exited with a non-zero status
    #[default]
    Unexpected,
}

impl AutoRestart {
    /// Whether an exit with the given code should trigger a restart
    pub fn should_restart(&self, exit_code: Option<i32>) -> bool {
        match self {
            AutoRestart::True => true,
            AutoRestart::False => false,
            AutoRestart::Unexpected => exit_code != Some(0),
        }
    }
}

/// Definition of a single supervised program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    /// Executable followed by its arguments
    pub exec: Vec<String>,

    /// Working directory (inherits the control plane's when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Restart policy
    #[serde(default)]
    pub autorestart: AutoRestart,

    /// Seconds the process must stay up to count as started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_secs: Option<u64>,

    /// Seconds to wait after SIGTERM before sending SIGKILL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_wait_secs: Option<u64>,

    /// Extra environment on top of the inherited one
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ProgramSpec {
    pub fn new<I, S>(exec: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exec: exec.into_iter().map(Into::into).collect(),
            cwd: None,
            autorestart: AutoRestart::default(),
            start_secs: None,
            stop_wait_secs: None,
            env: BTreeMap::new(),
        }
    }

    /// Set working directory (builder pattern)
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable (builder pattern)
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set restart policy (builder pattern)
    pub fn with_autorestart(mut self, policy: AutoRestart) -> Self {
        self.autorestart = policy;
        self
    }

    /// Set the start window in seconds (builder pattern)
    pub fn with_start_secs(mut self, secs: u64) -> Self {
        self.start_secs = Some(secs);
        self
    }

    /// Set the stop grace period in seconds (builder pattern)
    pub fn with_stop_wait_secs(mut self, secs: u64) -> Self {
        self.stop_wait_secs = Some(secs);
        self
    }

    pub fn start_window(&self) -> Duration {
        Duration::from_secs(self.start_secs.unwrap_or(DEFAULT_START_SECS))
    }

    pub fn stop_wait(&self) -> Duration {
        Duration::from_secs(self.stop_wait_secs.unwrap_or(DEFAULT_STOP_WAIT_SECS))
    }
}

/// Program names end up in RPC paths and log fields
pub fn is_valid_program_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// The control plane's on-disk declarative configuration
///
/// The supervisor rewrites this file before every mutating RPC so that a
/// restarted control plane comes back with the same program set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Unix socket the RPC server listens on
    pub socket: PathBuf,

    /// Programs keyed by name
    #[serde(default)]
    pub programs: BTreeMap<String, ProgramSpec>,
}

impl ControlConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: ControlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, spec) in &self.programs {
            if !is_valid_program_name(name) {
                errors.push(format!("Program '{}': invalid name", name));
            }
            if spec.exec.is_empty() {
                errors.push(format!("Program '{}': 'exec' must not be empty", name));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Control configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Write the file atomically (temp file in the same directory, then rename)
    pub fn write<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = toml::to_string(self).context("Failed to serialize control configuration")?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Result of comparing registered programs against a new configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramDiff {
    /// In the configuration but not registered
    pub added: BTreeSet<String>,
    /// Registered with a spec different from the configuration
    pub changed: BTreeSet<String>,
    /// Registered but gone from the configuration
    pub removed: BTreeSet<String>,
}

impl ProgramDiff {
    pub fn compute(
        active: &BTreeMap<String, ProgramSpec>,
        configured: &BTreeMap<String, ProgramSpec>,
    ) -> Self {
        let mut diff = ProgramDiff::default();

        for (name, spec) in configured {
            match active.get(name) {
                None => {
                    diff.added.insert(name.clone());
                }
                Some(current) if current != spec => {
                    diff.changed.insert(name.clone());
                }
                Some(_) => {}
            }
        }

        diff.removed = active
            .keys()
            .filter(|name| !configured.contains_key(*name))
            .cloned()
            .collect();

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Whether the name appears in any of the three sets
    pub fn contains(&self, name: &str) -> bool {
        self.added.contains(name) || self.changed.contains(name) || self.removed.contains(name)
    }
}
