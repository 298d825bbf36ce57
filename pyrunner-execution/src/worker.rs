//! Execution worker
//!
//! A worker is a tokio task that owns one [`InterpreterHost`]. It takes one
//! command at a time from an mpsc channel and reports progress as
//! [`WorkerEvent`]s. Terminating the worker aborts the task, which drops the
//! host and kills the interpreter process.

use parking_lot::RwLock;
use pyrunner_config::{ExecutionConfig, PyrunnerConfig};
use pyrunner_ipc::{ExecutionRequest, ExecutionUpdate, StreamKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::ExecutionWorkspace;
use crate::error::ExecutionError;
use crate::host::{HostInfo, InterpreterHost};
use crate::interceptor::{classify_stdout_line, compose_preamble};

const EXIT_STATUS_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Ready,
    Executing,
    Terminated,
}

/// Events emitted by a worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The interpreter loaded its package set
    Ready(HostInfo),

    /// The interpreter could not be started or could not load its packages
    InitializationFailed(String),

    /// Progress for one execution
    Update {
        execution_id: Uuid,
        update: ExecutionUpdate,
    },

    /// The interpreter went away; the worker has stopped
    Exited,
}

enum WorkerCommand {
    Execute {
        execution_id: Uuid,
        request: ExecutionRequest,
    },
    Shutdown,
}

/// Handle to a running worker. Dropping it terminates the worker.
pub struct WorkerHandle {
    id: Uuid,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    state: Arc<RwLock<WorkerState>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker on `runtime`; its events arrive on the returned receiver
    pub fn spawn(
        config: Arc<PyrunnerConfig>,
        runtime: &Handle,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(WorkerState::Initializing));

        let task = runtime.spawn(run_worker(
            id,
            config,
            command_rx,
            event_tx,
            state.clone(),
        ));

        debug!("Spawned worker {}", id);

        (
            Self {
                id,
                commands: command_tx,
                state,
                task,
            },
            event_rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Queue an execution; it starts once the interpreter is ready
    pub fn execute(
        &self,
        execution_id: Uuid,
        request: ExecutionRequest,
    ) -> Result<(), ExecutionError> {
        self.commands
            .send(WorkerCommand::Execute {
                execution_id,
                request,
            })
            .map_err(|_| ExecutionError::WorkerError("worker is no longer running".to_string()))
    }

    /// Kill the worker immediately, even mid-execution
    pub fn terminate(&self) {
        if !self.task.is_finished() {
            info!("Terminating worker {}", self.id);
        }
        self.task.abort();
        *self.state.write() = WorkerState::Terminated;
    }

    /// Let the interpreter exit cleanly, then wait for the worker task
    pub async fn shutdown(&mut self, timeout: Duration) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
            warn!("Worker {} did not shut down in time", self.id);
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn run_worker(
    id: Uuid,
    config: Arc<PyrunnerConfig>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    state: Arc<RwLock<WorkerState>>,
) {
    let mut host = match InterpreterHost::start(&config.interpreter).await {
        Ok(host) => host,
        Err(e) => {
            error!("Worker {} failed to initialize: {}", id, e);
            *state.write() = WorkerState::Terminated;
            let reason = match e {
                ExecutionError::InitializationFailed(reason) => reason,
                other => other.to_string(),
            };
            let _ = events.send(WorkerEvent::InitializationFailed(reason));
            return;
        }
    };

    *state.write() = WorkerState::Ready;
    let _ = events.send(WorkerEvent::Ready(host.info().clone()));

    while let Some(command) = commands.recv().await {
        let (execution_id, request) = match command {
            WorkerCommand::Execute {
                execution_id,
                request,
            } => (execution_id, request),
            WorkerCommand::Shutdown => {
                host.shutdown().await;
                *state.write() = WorkerState::Terminated;
                return;
            }
        };

        *state.write() = WorkerState::Executing;
        debug!("Worker {} executing {}", id, execution_id);

        match execute_request(&mut host, &config.execution, execution_id, request, &events).await
        {
            Ok(()) => *state.write() = WorkerState::Ready,
            Err(e) if e.is_fatal() => {
                let message = match host.wait_exit(EXIT_STATUS_GRACE).await {
                    Some(status) => format!("{} ({})", e, status),
                    None => e.to_string(),
                };
                error!("Worker {} lost its interpreter: {}", id, message);
                *state.write() = WorkerState::Terminated;
                emit(&events, execution_id, ExecutionUpdate::error(message));
                break;
            }
            Err(e) => {
                warn!("Execution {} failed: {}", execution_id, e);
                emit(&events, execution_id, ExecutionUpdate::error(e.to_string()));
                *state.write() = WorkerState::Ready;
            }
        }
    }

    *state.write() = WorkerState::Terminated;
    let _ = events.send(WorkerEvent::Exited);
}

/// Run one request end to end. Emits the terminal update unless the
/// interpreter itself failed, in which case the error is returned.
async fn execute_request(
    host: &mut InterpreterHost,
    config: &ExecutionConfig,
    execution_id: Uuid,
    request: ExecutionRequest,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) -> Result<(), ExecutionError> {
    let workspace = ExecutionWorkspace::create(config)?;
    let preamble = compose_preamble(workspace.path());

    let outcome = host
        .execute(execution_id, preamble, request.code, |stream, line| match stream {
            StreamKind::Stdout => {
                for update in classify_stdout_line(line) {
                    emit(events, execution_id, update);
                }
            }
            StreamKind::Stderr => emit(events, execution_id, ExecutionUpdate::stderr(line)),
        })
        .await;

    let fault = match outcome {
        Ok(fault) => fault,
        Err(e) => {
            workspace.close();
            return Err(e);
        }
    };

    match workspace.collect_downloads().await {
        Ok(downloads) => {
            for download in downloads {
                emit(events, execution_id, download);
            }
        }
        Err(e) => {
            warn!("Failed to collect files for {}: {}", execution_id, e);
            emit(
                events,
                execution_id,
                ExecutionUpdate::stderr(format!("Failed to collect output files: {}", e)),
            );
        }
    }
    workspace.close();

    let terminal = match fault {
        Some(error) => ExecutionUpdate::error(error),
        None => ExecutionUpdate::Success,
    };
    emit(events, execution_id, terminal);
    Ok(())
}

fn emit(events: &mpsc::UnboundedSender<WorkerEvent>, execution_id: Uuid, update: ExecutionUpdate) {
    let _ = events.send(WorkerEvent::Update {
        execution_id,
        update,
    });
}
