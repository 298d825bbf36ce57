//! Error types for code execution

use std::time::Duration;
use thiserror::Error;

/// Execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start Python interpreter '{executable}': {reason}")]
    InterpreterSpawn { executable: String, reason: String },

    #[error("Python environment failed to load: {0}")]
    InitializationFailed(String),

    #[error("Python environment did not become ready within {0:?}")]
    InitializationTimeout(Duration),

    #[error("Python interpreter exited unexpectedly")]
    InterpreterExited,

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Workspace error: {0}")]
    WorkspaceError(String),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

impl ExecutionError {
    /// Whether the interpreter behind the failing worker is unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutionError::InterpreterExited
                | ExecutionError::IpcError(_)
                | ExecutionError::InterpreterSpawn { .. }
        )
    }
}

// Convert from IPC errors
impl From<pyrunner_ipc::IpcError> for ExecutionError {
    fn from(err: pyrunner_ipc::IpcError) -> Self {
        if err.is_disconnect() {
            Self::InterpreterExited
        } else {
            Self::IpcError(err.to_string())
        }
    }
}
