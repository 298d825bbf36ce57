//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// A single request to execute Python source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

/// Kind of visual artifact carried by a `plot` update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotType {
    Matplotlib,
    Pil,
    Plotly,
}

impl PlotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlotType::Matplotlib => "matplotlib",
            PlotType::Pil => "pil",
            PlotType::Plotly => "plotly",
        }
    }

    /// Raster plots carry base64 PNG bytes, plotly carries a JSON figure.
    pub fn is_raster(&self) -> bool {
        !matches!(self, PlotType::Plotly)
    }
}

impl fmt::Display for PlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlotType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "matplotlib" => Ok(PlotType::Matplotlib),
            "pil" => Ok(PlotType::Pil),
            "plotly" => Ok(PlotType::Plotly),
            other => Err(format!("Unknown plot type: {}", other)),
        }
    }
}

/// Progress events delivered for one execution.
///
/// An execution produces any number of `Stdout`, `Stderr`, `Plot` and
/// `Download` updates followed by exactly one terminal update (`Success` or
/// `Error`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionUpdate {
    /// One line of captured standard output
    Stdout { data: String },

    /// One line of captured standard error
    Stderr { error: String },

    /// A rendered figure or image
    Plot {
        #[serde(rename = "plotType")]
        plot_type: PlotType,
        data: String,
    },

    /// A file produced by the executed code, base64 encoded
    Download {
        filename: String,
        mimetype: String,
        data: String,
    },

    /// Execution completed without an uncaught fault
    Success,

    /// Execution failed, was rejected or was stopped
    Error { error: String },
}

impl ExecutionUpdate {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout { data: data.into() }
    }

    pub fn stderr(error: impl Into<String>) -> Self {
        Self::Stderr {
            error: error.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Whether this update ends the stream of its execution
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionUpdate::Success | ExecutionUpdate::Error { .. })
    }

    /// Wire name of the variant, as found in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionUpdate::Stdout { .. } => "stdout",
            ExecutionUpdate::Stderr { .. } => "stderr",
            ExecutionUpdate::Plot { .. } => "plot",
            ExecutionUpdate::Download { .. } => "download",
            ExecutionUpdate::Success => "success",
            ExecutionUpdate::Error { .. } => "error",
        }
    }
}

/// Output stream a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A package the interpreter host must provide before reporting ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Module name passed to `import`
    pub import_name: String,
    /// Distribution name passed to `pip install` when it differs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_name: Option<String>,
}

/// Messages sent from the executor to the Python interpreter host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCommand {
    /// Load the package set; answered by `Ready` or `InitializationFailed`
    Initialize {
        packages: Vec<PackageSpec>,
        install_missing: bool,
    },

    /// Run a preamble followed by user code in a fresh namespace
    Execute {
        execution_id: Uuid,
        preamble: String,
        code: String,
    },

    /// Shutdown signal
    Shutdown,
}

/// Messages sent from the Python interpreter host to the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    /// Interpreter and packages are loaded
    Ready {
        python_version: String,
        packages: Vec<String>,
    },

    /// Interpreter could not load its package set
    InitializationFailed { error: String },

    /// One line written by the executing code
    Output {
        execution_id: Uuid,
        stream: StreamKind,
        line: String,
    },

    /// Execution ended; `error` is set when the code raised
    Finished {
        execution_id: Uuid,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Requests accepted by the `serve` front end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Execute code; updates are tagged with `run_id`
    Run { run_id: Uuid, code: String },

    /// Stop whatever is running and respawn the interpreter
    Stop,

    /// Wait for the interpreter to become ready
    Ready,
}

/// Responses emitted by the `serve` front end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An update belonging to run `run_id`
    Update {
        run_id: Uuid,
        update: ExecutionUpdate,
    },

    /// The interpreter is ready
    Ready {
        python_version: String,
        packages: Vec<String>,
    },

    /// The interpreter failed to initialize
    NotReady { error: String },
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
