use crate::controller::SpawnRequest;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration loaded from a run file.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct RunConfig {
    pub command: CommandConfig,
    pub timeouts: TimeoutConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Replaces the inherited environment when present.
    pub env: Option<BTreeMap<String, String>>,
    pub track_tree: bool,
}

/// All values in seconds; fractions allowed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub overall_secs: Option<f64>,
    pub output_idle_secs: Option<f64>,
    pub reap_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub store: bool,
    pub log_file: Option<PathBuf>,
    pub report_file: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            cwd: None,
            env: None,
            track_tree: true,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            overall_secs: None,
            output_idle_secs: None,
            reap_secs: crate::controller::DEFAULT_REAP_TIMEOUT.as_secs_f64(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl RunConfig {
    /// Read and parse a TOML run file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RunConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value that parsing alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.overall()?;
        self.timeouts.output_idle()?;
        self.timeouts.reap()?;
        if let Some(ref program) = self.command.program {
            if program.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("command.program is empty".to_string()));
            }
        }
        Ok(())
    }

    /// The spawn request this configuration describes.
    pub fn spawn_request(&self) -> Result<SpawnRequest, ConfigError> {
        let program = self
            .command
            .program
            .clone()
            .ok_or_else(|| ConfigError::Invalid("no program to run".to_string()))?;
        Ok(SpawnRequest {
            program,
            args: self.command.args.clone(),
            cwd: self.command.cwd.clone(),
            env: self.command.env.clone(),
            track_tree: self.command.track_tree,
        })
    }
}

impl TimeoutConfig {
    pub fn overall(&self) -> Result<Option<Duration>, ConfigError> {
        self.overall_secs
            .map(|secs| seconds("timeouts.overall_secs", secs))
            .transpose()
    }

    pub fn output_idle(&self) -> Result<Option<Duration>, ConfigError> {
        self.output_idle_secs
            .map(|secs| seconds("timeouts.output_idle_secs", secs))
            .transpose()
    }

    pub fn reap(&self) -> Result<Duration, ConfigError> {
        seconds("timeouts.reap_secs", self.reap_secs)
    }
}

fn seconds(field: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigError::Invalid(format!("{field} must be a non-negative number, got {secs}")))
}
