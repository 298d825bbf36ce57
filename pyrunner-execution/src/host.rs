//! Python interpreter host process

use pyrunner_config::InterpreterConfig;
use pyrunner_ipc::{
    ChildProcessTransport, HostCommand, HostEvent, IpcTransport, MessageEnvelope, PackageSpec,
    StreamKind,
};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ExecutionError;

/// Driver program run with `python -c`
const HOST_DRIVER: &str = include_str!("python/host_driver.py");

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// What the interpreter reported once its package set loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub python_version: String,
    pub packages: Vec<String>,
}

/// A running Python interpreter speaking the host protocol.
///
/// The child process is killed when the host is dropped.
pub struct InterpreterHost {
    child: Child,
    transport: ChildProcessTransport,
    info: HostInfo,
    stderr_task: JoinHandle<()>,
}

impl InterpreterHost {
    /// Spawn the interpreter and wait until its package set is loaded
    pub async fn start(config: &InterpreterConfig) -> Result<Self, ExecutionError> {
        info!(
            "Starting Python interpreter '{}' with {} packages",
            config.python_executable,
            config.packages.len()
        );

        let mut child = Command::new(&config.python_executable)
            .arg("-u")
            .arg("-c")
            .arg(HOST_DRIVER)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::InterpreterSpawn {
                executable: config.python_executable.clone(),
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let stderr_task = tokio::spawn(forward_stderr(stderr));
        let mut transport = ChildProcessTransport::new(stdin, stdout);

        let packages = config
            .packages
            .iter()
            .map(|package| PackageSpec {
                import_name: package.import_name.clone(),
                install_name: package.install_name.clone(),
            })
            .collect();

        let handshake = async {
            transport
                .send(&MessageEnvelope::new(HostCommand::Initialize {
                    packages,
                    install_missing: config.install_missing,
                }))
                .await?;
            transport.receive::<HostEvent>().await
        };

        let envelope = match tokio::time::timeout(config.init_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                stderr_task.abort();
                return Err(ExecutionError::InitializationTimeout(config.init_timeout));
            }
        };

        let info = match envelope.message {
            HostEvent::Ready {
                python_version,
                packages,
            } => HostInfo {
                python_version,
                packages,
            },
            HostEvent::InitializationFailed { error } => {
                stderr_task.abort();
                return Err(ExecutionError::InitializationFailed(error));
            }
            other => {
                stderr_task.abort();
                return Err(ExecutionError::IpcError(format!(
                    "Unexpected message during initialization: {:?}",
                    other
                )));
            }
        };

        info!(
            "Python {} ready (pid {:?}, packages: {})",
            info.python_version,
            child.id(),
            info.packages.join(", ")
        );

        Ok(Self {
            child,
            transport,
            info,
            stderr_task,
        })
    }

    pub fn info(&self) -> &HostInfo {
        &self.info
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Run `preamble` then `code` in a fresh namespace.
    ///
    /// Every captured output line is handed to `on_output` as it arrives.
    /// Returns the formatted fault when the code raised, `None` otherwise.
    pub async fn execute<F>(
        &mut self,
        execution_id: Uuid,
        preamble: String,
        code: String,
        mut on_output: F,
    ) -> Result<Option<String>, ExecutionError>
    where
        F: FnMut(StreamKind, String),
    {
        self.transport
            .send(&MessageEnvelope::new(HostCommand::Execute {
                execution_id,
                preamble,
                code,
            }))
            .await?;

        loop {
            let envelope = self.transport.receive::<HostEvent>().await?;
            match envelope.message {
                HostEvent::Output {
                    execution_id: id,
                    stream,
                    line,
                } if id == execution_id => on_output(stream, line),
                HostEvent::Finished {
                    execution_id: id,
                    error,
                } if id == execution_id => return Ok(error),
                other => warn!("Ignoring unexpected interpreter message: {:?}", other),
            }
        }
    }

    /// Exit status of the child once it has terminated, waiting at most `grace`
    pub async fn wait_exit(&mut self, grace: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        }
    }

    /// Ask the interpreter to exit, killing it if it does not comply
    pub async fn shutdown(&mut self) {
        debug!("Shutting down Python interpreter (pid {:?})", self.child.id());

        if let Err(e) = self
            .transport
            .send(&MessageEnvelope::new(HostCommand::Shutdown))
            .await
        {
            debug!("Interpreter did not accept shutdown: {}", e);
        }
        let _ = self.transport.close().await;

        if self.wait_exit(SHUTDOWN_GRACE).await.is_none() {
            warn!("Python interpreter did not exit in time, killing it");
            if let Err(e) = self.child.kill().await {
                warn!("Failed to kill Python interpreter: {}", e);
            }
        }
    }
}

impl Drop for InterpreterHost {
    fn drop(&mut self) {
        self.stderr_task.abort();
    }
}

fn missing_pipe(name: &str) -> ExecutionError {
    ExecutionError::IpcError(format!("Interpreter {} pipe was not captured", name))
}

/// Interpreter stderr carries pip output and stray fd-level writes
async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "pyrunner::interpreter", "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "pyrunner::interpreter", "stderr closed: {}", e);
                break;
            }
        }
    }
}
