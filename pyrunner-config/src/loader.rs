//! Configuration loading and environment variable handling

use crate::domains::execution::ExecutionConfig;
use crate::domains::interpreter::{InterpreterConfig, PackageRequirement};
use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::utils::parse_seconds;
use crate::domains::PyrunnerConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "PYRUNNER".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<PyrunnerConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: PyrunnerConfig = if content.trim().is_empty() {
            PyrunnerConfig::default()
        } else {
            serde_yaml::from_str(&content)?
        };

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<PyrunnerConfig> {
        let mut config = PyrunnerConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<PyrunnerConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut PyrunnerConfig) -> ConfigResult<()> {
        self.apply_interpreter_overrides(&mut config.interpreter)?;
        self.apply_execution_overrides(&mut config.execution)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    fn apply_interpreter_overrides(&self, config: &mut InterpreterConfig) -> ConfigResult<()> {
        if let Ok(python) = self.get_env_var("PYTHON") {
            config.python_executable = python;
        }

        if let Ok(packages) = self.get_env_var("PACKAGES") {
            config.packages = packages
                .split(',')
                .filter(|entry| !entry.trim().is_empty())
                .map(PackageRequirement::from_str)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::EnvError(format!("Invalid PACKAGES: {}", e)))?;
        }

        if let Ok(install) = self.get_env_var("INSTALL_MISSING") {
            config.install_missing = install
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid INSTALL_MISSING: {}", e)))?;
        }

        if let Ok(timeout) = self.get_env_var("INIT_TIMEOUT_SECONDS") {
            let seconds = parse_seconds(&timeout)
                .map_err(|e| ConfigError::EnvError(format!("Invalid INIT_TIMEOUT_SECONDS: {}", e)))?;
            config.init_timeout = seconds;
        }

        Ok(())
    }

    fn apply_execution_overrides(&self, config: &mut ExecutionConfig) -> ConfigResult<()> {
        if let Ok(root) = self.get_env_var("WORKDIR_ROOT") {
            config.workdir_root = Some(PathBuf::from(root));
        }

        if let Ok(capture) = self.get_env_var("CAPTURE_DOWNLOADS") {
            config.capture_downloads = capture.parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid CAPTURE_DOWNLOADS: {}", e))
            })?;
        }

        if let Ok(max_bytes) = self.get_env_var("MAX_DOWNLOAD_BYTES") {
            config.max_download_bytes = max_bytes.parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid MAX_DOWNLOAD_BYTES: {}", e))
            })?;
        }

        if let Ok(timeout) = self.get_env_var("EXECUTION_TIMEOUT_SECONDS") {
            let seconds = parse_seconds(&timeout)
                .map_err(|e| ConfigError::EnvError(format!("Invalid EXECUTION_TIMEOUT_SECONDS: {}", e)))?;
            config.timeout = Some(seconds);
        }

        Ok(())
    }

    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
