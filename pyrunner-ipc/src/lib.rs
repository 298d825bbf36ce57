//! Inter-process communication for pyrunner
//!
//! This crate defines the update stream handed to callers of the executor,
//! the line-delimited JSON protocol spoken with the Python interpreter host,
//! and the client protocol used by the `serve` front end.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    ClientMessage, ExecutionRequest, ExecutionUpdate, HostCommand, HostEvent, MessageEnvelope,
    PackageSpec, PlotType, ServerMessage, StreamKind, IPC_PROTOCOL_VERSION,
};
pub use transport::{ChildProcessTransport, IpcTransport, StdioTransport};
