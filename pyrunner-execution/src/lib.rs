//! pyrunner execution engine
//!
//! Runs Python source in an isolated interpreter process and streams typed
//! [`ExecutionUpdate`]s back to the caller. [`ExecutorService`] is the entry
//! point: it owns a single worker, admits one execution at a time and can stop
//! a running execution by killing and respawning the interpreter.

pub mod capture;
pub mod error;
pub mod executor;
pub mod host;
pub mod interceptor;
pub mod service;
pub mod worker;

// Re-export main types
pub use capture::{guess_mimetype, ExecutionWorkspace};
pub use error::ExecutionError;
pub use executor::{CodeExecutor, UpdateCallback};
pub use host::{HostInfo, InterpreterHost};
pub use interceptor::{classify_stdout_line, compose_preamble, ARTIFACT_SENTINEL};
pub use service::{ExecutorService, Readiness};
pub use worker::{WorkerEvent, WorkerHandle, WorkerState};

// Re-export IPC types callers need to consume updates
pub use pyrunner_ipc::{ExecutionRequest, ExecutionUpdate, PlotType};
