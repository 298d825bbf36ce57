//! IPC transport implementations
//!
//! Every transport frames one JSON-encoded [`MessageEnvelope`] per line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// IPC transport trait for different communication mechanisms
#[async_trait]
pub trait IpcTransport: Send + Sync {
    /// Send a message to the other end
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError>;

    /// Receive a message from the other end
    async fn receive<T: for<'de> Deserialize<'de> + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

async fn write_envelope<W, T>(writer: &mut W, message: &MessageEnvelope<T>) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Send + Sync,
{
    let json = serde_json::to_string(message)
        .map_err(|e| IpcError::SerializationError(e.to_string()))?;

    // Send with newline delimiter
    let message_with_newline = format!("{}\n", json);
    writer.write_all(message_with_newline.as_bytes()).await?;
    writer.flush().await?;

    Ok(())
}

async fn read_envelope<R, T>(reader: &mut R) -> Result<MessageEnvelope<T>, IpcError>
where
    R: AsyncBufRead + Unpin + Send,
    T: for<'de> Deserialize<'de> + Send,
{
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(IpcError::ConnectionClosed);
        }
        if !line.trim().is_empty() {
            break;
        }
    }

    // Remove newline
    line.truncate(line.trim_end().len());

    let envelope: MessageEnvelope<T> = serde_json::from_str(&line)
        .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

    // Check protocol version compatibility
    if !envelope.is_compatible() {
        return Err(IpcError::ProtocolVersionMismatch {
            expected: IPC_PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }

    Ok(envelope)
}

/// Stdin/Stdout IPC transport, used when pyrunner itself is driven by a client
pub struct StdioTransport {
    stdin: BufReader<tokio::io::Stdin>,
    stdout: tokio::io::Stdout,
}

impl StdioTransport {
    /// Create a new stdio transport
    pub fn new() -> Self {
        Self {
            stdin: BufReader::new(tokio::io::stdin()),
            stdout: tokio::io::stdout(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IpcTransport for StdioTransport {
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        write_envelope(&mut self.stdout, message).await
    }

    async fn receive<T: for<'de> Deserialize<'de> + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError> {
        read_envelope(&mut self.stdin).await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        // Stdin/stdout don't need explicit closing
        Ok(())
    }
}

/// Child process transport for parent-child communication
pub struct ChildProcessTransport {
    stdin: Option<tokio::process::ChildStdin>,
    stdout: Option<BufReader<tokio::process::ChildStdout>>,
}

impl ChildProcessTransport {
    /// Create a new child process transport
    pub fn new(stdin: tokio::process::ChildStdin, stdout: tokio::process::ChildStdout) -> Self {
        Self {
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
        }
    }
}

#[async_trait]
impl IpcTransport for ChildProcessTransport {
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        let stdin = self.stdin.as_mut().ok_or(IpcError::NotConnected)?;
        write_envelope(stdin, message).await
    }

    async fn receive<T: for<'de> Deserialize<'de> + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError> {
        let stdout = self.stdout.as_mut().ok_or(IpcError::NotConnected)?;
        read_envelope(stdout).await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        // Take ownership and drop to close
        let _ = self.stdin.take();
        let _ = self.stdout.take();
        Ok(())
    }
}
