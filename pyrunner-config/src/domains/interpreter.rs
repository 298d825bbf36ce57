//! Python interpreter configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Interpreter host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Python executable used to start the interpreter host
    #[serde(default = "default_python_executable")]
    pub python_executable: String,

    /// Packages that must import before the interpreter reports ready
    #[serde(default = "default_packages")]
    pub packages: Vec<PackageRequirement>,

    /// Install missing packages with pip during initialization
    #[serde(default = "crate::domains::utils::default_enabled")]
    pub install_missing: bool,

    /// Upper bound on interpreter startup, package installation included
    #[serde(
        with = "crate::domains::utils::duration_secs",
        default = "default_init_timeout"
    )]
    pub init_timeout: Duration,
}

/// A package in the interpreter's fixed package set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequirement {
    /// Module name passed to `import`
    pub import_name: String,

    /// Distribution name for pip, when it differs from the module name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_name: Option<String>,
}

impl PackageRequirement {
    pub fn new(import_name: impl Into<String>) -> Self {
        Self {
            import_name: import_name.into(),
            install_name: None,
        }
    }

    pub fn with_install_name(mut self, install_name: impl Into<String>) -> Self {
        self.install_name = Some(install_name.into());
        self
    }
}

/// Parses `module` or `module=distribution`
impl FromStr for PackageRequirement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (import_name, install_name) = match s.split_once('=') {
            Some((module, dist)) => (module.trim(), Some(dist.trim())),
            None => (s.trim(), None),
        };

        if import_name.is_empty() {
            return Err(format!("Invalid package requirement: '{}'", s));
        }

        let requirement = PackageRequirement::new(import_name);
        Ok(match install_name {
            Some(dist) if !dist.is_empty() => requirement.with_install_name(dist),
            Some(_) => return Err(format!("Invalid package requirement: '{}'", s)),
            None => requirement,
        })
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            python_executable: default_python_executable(),
            packages: default_packages(),
            install_missing: true,
            init_timeout: default_init_timeout(),
        }
    }
}

impl Validatable for InterpreterConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(
            &self.python_executable,
            "python_executable",
            self.domain_name(),
        )?;

        validate_positive(
            self.init_timeout.as_secs_f64(),
            "init_timeout",
            self.domain_name(),
        )?;

        for package in &self.packages {
            validate_required_string(&package.import_name, "packages.import_name", self.domain_name())?;
            if package.import_name.contains(char::is_whitespace) {
                return Err(self.validation_error(format!(
                    "package import name '{}' must not contain whitespace",
                    package.import_name
                )));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "interpreter"
    }
}

fn default_python_executable() -> String {
    "python3".to_string()
}

fn default_packages() -> Vec<PackageRequirement> {
    vec![
        PackageRequirement::new("numpy"),
        PackageRequirement::new("pandas"),
        PackageRequirement::new("matplotlib"),
        PackageRequirement::new("PIL").with_install_name("pillow"),
        PackageRequirement::new("plotly"),
    ]
}

fn default_init_timeout() -> Duration {
    Duration::from_secs(300) // pip installs can be slow
}
