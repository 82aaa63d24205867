use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::segment::{compile_marker, DEFAULT_MARKER};

pub const DEFAULT_MODE: &str = "test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub tick: Duration,
    pub warmup: Duration,
    pub drain: Duration,
    /// How long the child may take to exit once its stdin is closed.
    pub shutdown_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            warmup: Duration::from_secs(1),
            drain: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl Timing {
    pub fn from_millis(tick: u64, warmup: u64, drain: u64, shutdown_grace: u64) -> Self {
        Self {
            tick: Duration::from_millis(tick),
            warmup: Duration::from_millis(warmup),
            drain: Duration::from_millis(drain),
            shutdown_grace: Duration::from_millis(shutdown_grace),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.is_zero() {
            return Err(ConfigError::Timing("tick must be greater than zero".to_string()));
        }
        if self.drain < self.tick {
            return Err(ConfigError::Timing(format!(
                "drain ({} ms) must be at least one tick ({} ms)",
                self.drain.as_millis(),
                self.tick.as_millis()
            )));
        }
        Ok(())
    }
}

/// Optional settings layered over the defaults, first from a YAML file and
/// then from command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub tick_ms: Option<u64>,
    pub warmup_ms: Option<u64>,
    pub drain_ms: Option<u64>,
    pub grace_ms: Option<u64>,
    pub mode: Option<String>,
    pub marker: Option<String>,
}

impl ConfigOverrides {
    pub fn from_yaml_str(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: origin.clone(),
            source,
        })?;
        Self::from_yaml_str(&raw, &origin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub working_dir: PathBuf,
    pub executable: PathBuf,
    pub schema_path: PathBuf,
    pub test_path: PathBuf,
    pub result_log: PathBuf,
    pub timing: Timing,
    pub mode: String,
    pub marker: String,
}

impl HarnessConfig {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        executable: impl Into<PathBuf>,
        schema_path: impl Into<PathBuf>,
        test_path: impl Into<PathBuf>,
        result_log: impl Into<PathBuf>,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            executable: executable.into(),
            schema_path: schema_path.into(),
            test_path: test_path.into(),
            result_log: result_log.into(),
            timing: Timing::default(),
            mode: DEFAULT_MODE.to_string(),
            marker: DEFAULT_MARKER.to_string(),
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(ms) = overrides.tick_ms {
            self.timing.tick = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.warmup_ms {
            self.timing.warmup = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.drain_ms {
            self.timing.drain = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.grace_ms {
            self.timing.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(mode) = &overrides.mode {
            self.mode = mode.clone();
        }
        if let Some(marker) = &overrides.marker {
            self.marker = marker.clone();
        }
    }

    /// Checks timing and mode and returns the compiled unit marker.
    pub fn validate(&self) -> Result<Regex, ConfigError> {
        self.timing.validate()?;
        if self.mode.trim().is_empty() {
            return Err(ConfigError::Mode("mode keyword cannot be empty".to_string()));
        }
        compile_marker(&self.marker)
    }
}
