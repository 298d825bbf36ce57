//! Domain-driven configuration management for pyrunner
//!
//! Configuration is split by functional domain (interpreter, execution,
//! logging), loaded from YAML with `PYRUNNER_*` environment overrides and
//! validated per domain.

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

// Re-export domain configurations
pub use domains::{
    execution::ExecutionConfig,
    interpreter::{InterpreterConfig, PackageRequirement},
    logging::{LogFormat, LogLevel, LoggingConfig},
    PyrunnerConfig,
};

// Re-export utilities
pub use domains::utils::{duration_secs, optional_duration_secs, parse_seconds};
