//! Per-execution configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Parent directory for per-execution working directories.
    /// The system temporary directory is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir_root: Option<PathBuf>,

    /// Emit files written into the working directory as downloads
    #[serde(default = "crate::domains::utils::default_enabled")]
    pub capture_downloads: bool,

    /// Files larger than this are reported instead of transferred
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,

    /// Wall-clock limit after which front ends stop the execution
    #[serde(
        with = "crate::domains::utils::optional_duration_secs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workdir_root: None,
            capture_downloads: true,
            max_download_bytes: default_max_download_bytes(),
            timeout: None,
        }
    }
}

impl Validatable for ExecutionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(
            self.max_download_bytes,
            "max_download_bytes",
            self.domain_name(),
        )?;

        if let Some(timeout) = self.timeout {
            validate_positive(timeout.as_secs_f64(), "timeout", self.domain_name())?;
        }

        if let Some(root) = &self.workdir_root {
            if root.as_os_str().is_empty() {
                return Err(self.validation_error("workdir_root cannot be empty"));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "execution"
    }
}

fn default_max_download_bytes() -> u64 {
    25 * 1024 * 1024 // 25MB
}
