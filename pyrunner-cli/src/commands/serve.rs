//! `pyrunner serve`: drive the executor over stdin/stdout
//!
//! Every line on stdin is a [`ClientMessage`] envelope and every line on
//! stdout a [`ServerMessage`] envelope. Logs go to stderr.

use anyhow::{Context, Result};
use pyrunner_execution::{CodeExecutor, ExecutorService};
use pyrunner_ipc::{ClientMessage, IpcError, IpcTransport, MessageEnvelope, ServerMessage, StdioTransport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub async fn serve(executor: ExecutorService) -> Result<()> {
    let executor: Arc<dyn CodeExecutor> = Arc::new(executor);
    info!("Serving executions on stdio");

    let (incoming_tx, mut incoming) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_requests(incoming_tx));

    let (outgoing_tx, mut outgoing) = mpsc::unbounded_channel::<ServerMessage>();
    let mut writer = StdioTransport::new();
    let mut tasks = JoinSet::new();
    let mut input_closed = false;

    loop {
        if input_closed && tasks.is_empty() && !executor.is_executing() {
            // Flush what is left, then stop
            while let Ok(message) = outgoing.try_recv() {
                send(&mut writer, message).await?;
            }
            break;
        }

        tokio::select! {
            request = incoming.recv(), if !input_closed => match request {
                Some(request) => handle_request(request, &executor, &outgoing_tx, &mut tasks),
                None => {
                    debug!("Client closed stdin");
                    input_closed = true;
                }
            },
            Some(message) = outgoing.recv() => send(&mut writer, message).await?,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("Request task failed: {}", e);
                }
            }
        }
    }

    reader.abort();
    info!("Serve loop finished");
    Ok(())
}

fn handle_request(
    request: ClientMessage,
    executor: &Arc<dyn CodeExecutor>,
    outgoing: &mpsc::UnboundedSender<ServerMessage>,
    tasks: &mut JoinSet<()>,
) {
    match request {
        ClientMessage::Run { run_id, code } => {
            debug!("Run request {}", run_id);
            let executor = executor.clone();
            let outgoing = outgoing.clone();
            tasks.spawn(async move {
                executor
                    .run(
                        code,
                        Box::new(move |update| {
                            let _ = outgoing.send(ServerMessage::Update { run_id, update });
                        }),
                    )
                    .await;
            });
        }
        ClientMessage::Stop => {
            debug!("Stop request");
            executor.stop();
        }
        ClientMessage::Ready => {
            let executor = executor.clone();
            let outgoing = outgoing.clone();
            tasks.spawn(async move {
                let response = match executor.ready().await {
                    Ok(info) => ServerMessage::Ready {
                        python_version: info.python_version,
                        packages: info.packages,
                    },
                    Err(e) => ServerMessage::NotReady {
                        error: e.to_string(),
                    },
                };
                let _ = outgoing.send(response);
            });
        }
    }
}

async fn read_requests(requests: mpsc::UnboundedSender<ClientMessage>) {
    let mut transport = StdioTransport::new();
    loop {
        match transport.receive::<ClientMessage>().await {
            Ok(envelope) => {
                if requests.send(envelope.message).is_err() {
                    return;
                }
            }
            Err(IpcError::ConnectionClosed) => return,
            Err(e @ (IpcError::DeserializationError(_) | IpcError::ProtocolVersionMismatch { .. })) => {
                warn!("Ignoring invalid request: {}", e);
            }
            Err(e) => {
                error!("Failed to read request: {}", e);
                return;
            }
        }
    }
}

async fn send(writer: &mut StdioTransport, message: ServerMessage) -> Result<()> {
    writer
        .send(&MessageEnvelope::new(message))
        .await
        .context("Failed to write response")
}
