//! Configuration loading traits and types.
//!
//! Every dsm binary reads one TOML file with a `[shared]` section and an
//! optional `[coordinator]` section. Missing sections fall back to defaults.
//!
//! # Usage
//!
//! ```rust,no_run
//! use dsm_common::config::{ConfigLoader, ConfigError, DsmConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = DsmConfig::load(Path::new("dsm.toml"))?;
//!     config.validate()?;
//!     println!("workers: {}", config.coordinator.max_worker_processes);
//!     Ok(())
//! }
//! ```

use crate::consts::{DEFAULT_MAX_WORKER_PROCESSES, SHM_MAX_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared across all dsm binaries.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "dsm-coordinator-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            service_name: "dsm".to_string(),
        }
    }
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Limits and timings of the coordinator and its process supervisor.
///
/// # TOML Example
///
/// ```toml
/// [coordinator]
/// max_worker_processes = 16
/// startup_timeout_ms = 5000
/// worker_program = "/usr/local/bin/dsm"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Number of worker slots the supervisor hands out.
    pub max_worker_processes: usize,
    /// Largest region the coordinator may create, in bytes.
    pub max_region_size: usize,
    /// How long `WaitStarted` waits for the startup token.
    pub startup_timeout_ms: u64,
    /// Poll period of the supervisor while waiting on a worker.
    pub poll_interval_us: u64,
    /// Treat the parent process as the overseeing supervisor.
    pub watch_parent: bool,
    /// Program run for every worker. The running executable when unset.
    pub worker_program: Option<PathBuf>,
    /// Arguments placed before the `worker` subcommand.
    pub worker_args: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_worker_processes: DEFAULT_MAX_WORKER_PROCESSES,
            max_region_size: SHM_MAX_SIZE,
            startup_timeout_ms: 10_000,
            poll_interval_us: 1_000,
            watch_parent: true,
            worker_program: None,
            worker_args: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero slot count, a region
    /// limit above [`SHM_MAX_SIZE`], or a zero timeout/poll interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_worker_processes == 0 {
            return Err(ConfigError::ValidationError(
                "max_worker_processes must be at least 1".to_string(),
            ));
        }
        if self.max_region_size == 0 || self.max_region_size > SHM_MAX_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "max_region_size must be in 1..={SHM_MAX_SIZE}"
            )));
        }
        if self.startup_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "startup_timeout_ms cannot be zero".to_string(),
            ));
        }
        if self.poll_interval_us == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_us cannot be zero".to_string(),
            ));
        }
        if self
            .worker_program
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err(ConfigError::ValidationError(
                "worker_program cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Startup timeout as a `Duration`.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

/// Root of the dsm configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DsmConfig {
    /// `[shared]` section.
    pub shared: SharedConfig,
    /// `[coordinator]` section.
    pub coordinator: CoordinatorConfig,
}

impl DsmConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.coordinator.validate()
    }

    /// Load `path` if given, defaults otherwise, then validate.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let config = Self::load(path)?;
                tracing::debug!(path = %path.display(), "configuration loaded");
                config
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
