//! Executor service
//!
//! [`ExecutorService`] owns exactly one worker at a time, admits one execution
//! at a time and routes worker events to the callback of the active run.
//! Each worker lives in a slot together with its readiness signal and the
//! dispatcher task draining its events; a new slot (generation) is created
//! after `stop()`, after the interpreter exits, or lazily on first use.

use parking_lot::{Mutex, ReentrantMutex};
use pyrunner_config::PyrunnerConfig;
use pyrunner_ipc::{ExecutionRequest, ExecutionUpdate};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::executor::UpdateCallback;
use crate::host::HostInfo;
use crate::worker::{WorkerEvent, WorkerHandle, WorkerState};

const BUSY_MESSAGE: &str = "another execution is already in progress";
const STOPPED_MESSAGE: &str = "Execution stopped by user";
const EMPTY_CODE_MESSAGE: &str = "No code to execute";

/// Initialization status of the current worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Initializing,
    Ready(HostInfo),
    Failed(String),
}

/// The caller currently receiving updates.
///
/// Deliveries are serialized by a reentrant lock, so updates arrive in order
/// and at most one terminal update is ever delivered. The callback itself
/// runs outside any borrow: an update produced while it runs on the same
/// thread (a callback calling `stop()`) is queued and delivered right after
/// it returns.
struct ActiveRun {
    generation: u64,
    execution_id: Uuid,
    delivery: ReentrantMutex<RefCell<Delivery>>,
}

struct Delivery {
    callback: Option<UpdateCallback>,
    queue: VecDeque<ExecutionUpdate>,
    delivering: bool,
}

impl ActiveRun {
    fn new(generation: u64, execution_id: Uuid, callback: UpdateCallback) -> Self {
        Self {
            generation,
            execution_id,
            delivery: ReentrantMutex::new(RefCell::new(Delivery {
                callback: Some(callback),
                queue: VecDeque::new(),
                delivering: false,
            })),
        }
    }

    fn deliver(&self, update: ExecutionUpdate) {
        let delivery = self.delivery.lock();
        {
            let mut state = delivery.borrow_mut();
            if state.callback.is_none() && !state.delivering {
                return;
            }
            state.queue.push_back(update);
            if state.delivering {
                return;
            }
            state.delivering = true;
        }

        loop {
            let (mut on_update, update) = {
                let mut state = delivery.borrow_mut();
                let next = state.queue.pop_front();
                match (next, state.callback.take()) {
                    (Some(update), Some(on_update)) => (on_update, update),
                    _ => {
                        state.queue.clear();
                        state.delivering = false;
                        return;
                    }
                }
            };

            let terminal = update.is_terminal();
            on_update(update);

            let mut state = delivery.borrow_mut();
            if terminal {
                state.queue.clear();
                state.delivering = false;
                return;
            }
            state.callback = Some(on_update);
        }
    }
}

struct WorkerSlot {
    generation: u64,
    handle: WorkerHandle,
    readiness: watch::Receiver<Readiness>,
    dispatcher: JoinHandle<()>,
}

impl WorkerSlot {
    /// The worker was ready once and has since ended
    fn has_exited(&self) -> bool {
        self.handle.state() == WorkerState::Terminated
            && matches!(*self.readiness.borrow(), Readiness::Ready(_))
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[derive(Default)]
struct ExecutorState {
    worker: Option<WorkerSlot>,
    active: Option<Arc<ActiveRun>>,
    is_executing: bool,
}

struct ServiceInner {
    config: Arc<PyrunnerConfig>,
    runtime: Handle,
    state: Mutex<ExecutorState>,
    next_generation: AtomicU64,
}

/// Runs Python code one execution at a time.
///
/// Cloning is cheap and every clone drives the same worker. The worker and its
/// interpreter are torn down when the last clone is dropped.
///
/// Update callbacks run on the service's dispatcher. They may call
/// [`stop`](Self::stop); the resulting terminal update is delivered once the
/// callback returns.
#[derive(Clone)]
pub struct ExecutorService {
    inner: Arc<ServiceInner>,
}

impl ExecutorService {
    /// Create a service bound to the current tokio runtime.
    ///
    /// No interpreter is started until the first `ready()` or `run()`.
    pub fn new(config: PyrunnerConfig) -> Result<Self, ExecutionError> {
        let runtime =
            Handle::try_current().map_err(|e| ExecutionError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a service that spawns its tasks on `runtime`
    pub fn with_runtime(config: PyrunnerConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config: Arc::new(config),
                runtime,
                state: Mutex::new(ExecutorState::default()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PyrunnerConfig {
        &self.inner.config
    }

    /// Wait until the interpreter has loaded its package set.
    ///
    /// Starts a worker if none exists. Concurrent callers wait on the same
    /// worker. A failed initialization keeps failing until [`stop`](Self::stop).
    pub async fn ready(&self) -> Result<HostInfo, ExecutionError> {
        loop {
            let (generation, mut readiness) = self.inner.subscribe();
            let outcome = readiness
                .wait_for(|state| !matches!(state, Readiness::Initializing))
                .await
                .map(|state| (*state).clone());

            match outcome {
                Ok(Readiness::Ready(info)) => return Ok(info),
                Ok(Readiness::Failed(reason)) => {
                    return Err(ExecutionError::InitializationFailed(reason))
                }
                Ok(Readiness::Initializing) => continue,
                Err(_) => {
                    // The slot went away while initializing; follow its replacement
                    debug!("Worker generation {} closed before ready", generation);
                    self.inner.discard_slot(generation);
                }
            }
        }
    }

    /// Execute `code`, delivering every update to `on_update`.
    ///
    /// Returns once the request is dispatched. Failures (initialization,
    /// a concurrent execution, empty code) arrive as a single `error` update.
    pub async fn run<F>(&self, code: impl Into<String>, on_update: F)
    where
        F: FnMut(ExecutionUpdate) + Send + 'static,
    {
        let code = code.into();
        let mut on_update: UpdateCallback = Box::new(on_update);

        if code.trim().is_empty() {
            on_update(ExecutionUpdate::error(EMPTY_CODE_MESSAGE));
            return;
        }

        if let Err(e) = self.ready().await {
            on_update(ExecutionUpdate::error(e.to_string()));
            return;
        }

        let execution_id = Uuid::new_v4();
        let (run, dispatched) = {
            let mut guard = self.inner.state.lock();
            if guard.is_executing {
                drop(guard);
                debug!("Rejecting execution {}: service busy", execution_id);
                on_update(ExecutionUpdate::error(BUSY_MESSAGE));
                return;
            }

            // Nothing is executing, so replacing an exited slot orphans no run
            let (slot, _) = self.inner.live_slot(&mut guard);
            let run = Arc::new(ActiveRun::new(slot.generation, execution_id, on_update));
            let dispatched = slot
                .handle
                .execute(execution_id, ExecutionRequest::new(code));

            if dispatched.is_ok() {
                guard.is_executing = true;
                guard.active = Some(run.clone());
            }
            (run, dispatched)
        };

        match dispatched {
            Ok(()) => debug!("Dispatched execution {}", execution_id),
            Err(e) => {
                warn!("Failed to dispatch execution {}: {}", execution_id, e);
                run.deliver(ExecutionUpdate::error(e.to_string()));
            }
        }
    }

    /// Kill the current interpreter, even mid-execution.
    ///
    /// The active run receives "Execution stopped by user" and a fresh worker
    /// starts initializing immediately.
    pub fn stop(&self) {
        let (previous, active) = {
            let mut state = self.inner.state.lock();
            let previous = state.worker.take();
            let active = state.active.take();
            state.is_executing = false;
            state.worker = Some(self.inner.spawn_slot());
            (previous, active)
        };

        if let Some(slot) = previous {
            info!("Stopping worker generation {}", slot.generation);
            slot.handle.terminate();
        }

        if let Some(run) = active {
            run.deliver(ExecutionUpdate::error(STOPPED_MESSAGE));
        }
    }

    /// Let the interpreter exit cleanly. The next call starts a new one.
    pub async fn shutdown(&self, timeout: Duration) {
        let (slot, active) = {
            let mut state = self.inner.state.lock();
            state.is_executing = false;
            (state.worker.take(), state.active.take())
        };

        if let Some(run) = active {
            run.deliver(ExecutionUpdate::error(STOPPED_MESSAGE));
        }

        if let Some(mut slot) = slot {
            info!("Shutting down worker generation {}", slot.generation);
            slot.handle.shutdown(timeout).await;
        }
    }

    /// Whether an execution is in flight
    pub fn is_executing(&self) -> bool {
        self.inner.state.lock().is_executing
    }

    /// Initialization status of the current worker, if one exists
    pub fn readiness(&self) -> Option<Readiness> {
        let state = self.inner.state.lock();
        state.worker.as_ref().map(|slot| slot.readiness.borrow().clone())
    }

    /// Identifier of the current worker, if one exists
    pub fn worker_id(&self) -> Option<Uuid> {
        let state = self.inner.state.lock();
        state.worker.as_ref().map(|slot| slot.handle.id())
    }

    /// Interpreter version and loaded packages, once ready
    pub fn environment(&self) -> Option<HostInfo> {
        match self.readiness() {
            Some(Readiness::Ready(info)) => Some(info),
            _ => None,
        }
    }
}

impl ServiceInner {
    /// Readiness of the current slot, creating one if needed
    fn subscribe(self: &Arc<Self>) -> (u64, watch::Receiver<Readiness>) {
        let (generation, readiness, orphan) = {
            let mut state = self.state.lock();
            let (slot, orphan) = self.live_slot(&mut state);
            (slot.generation, slot.readiness.clone(), orphan)
        };

        if let Some(run) = orphan {
            run.deliver(ExecutionUpdate::error(
                ExecutionError::InterpreterExited.to_string(),
            ));
        }
        (generation, readiness)
    }

    /// The current slot, replacing one whose worker has already ended.
    ///
    /// Also returns the run orphaned by the replacement, if any.
    fn live_slot<'a>(
        self: &Arc<Self>,
        state: &'a mut ExecutorState,
    ) -> (&'a WorkerSlot, Option<Arc<ActiveRun>>) {
        let mut orphan = None;
        let exited = state
            .worker
            .as_ref()
            .filter(|slot| slot.has_exited())
            .map(|slot| slot.generation);
        if let Some(generation) = exited {
            debug!("Replacing exited worker generation {}", generation);
            state.worker = None;
            orphan = self.take_active(state, generation);
        }

        let slot = state.worker.get_or_insert_with(|| self.spawn_slot());
        (slot, orphan)
    }

    fn spawn_slot(self: &Arc<Self>) -> WorkerSlot {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (handle, events) = WorkerHandle::spawn(self.config.clone(), &self.runtime);
        let (readiness_tx, readiness) = watch::channel(Readiness::Initializing);
        let dispatcher = self.runtime.spawn(dispatch_events(
            Arc::downgrade(self),
            generation,
            events,
            readiness_tx,
        ));

        info!(
            "Started worker {} (generation {})",
            handle.id(),
            generation
        );

        WorkerSlot {
            generation,
            handle,
            readiness,
            dispatcher,
        }
    }

    /// Drop the slot of `generation` if it is still current
    fn discard_slot(&self, generation: u64) {
        let (slot, orphan) = {
            let mut state = self.state.lock();
            if state.worker.as_ref().map(|slot| slot.generation) != Some(generation) {
                return;
            }
            (state.worker.take(), self.take_active(&mut state, generation))
        };

        if let Some(run) = orphan {
            run.deliver(ExecutionUpdate::error(
                ExecutionError::InterpreterExited.to_string(),
            ));
        }
        drop(slot);
    }

    /// Clear the active run if it belongs to `generation`
    fn take_active(&self, state: &mut ExecutorState, generation: u64) -> Option<Arc<ActiveRun>> {
        let owned = state
            .active
            .as_ref()
            .is_some_and(|run| run.generation == generation);
        if !owned {
            return None;
        }
        state.is_executing = false;
        state.active.take()
    }

    fn route(&self, generation: u64, execution_id: Uuid, update: ExecutionUpdate) {
        let run = {
            let mut state = self.state.lock();
            let run = match &state.active {
                Some(run) if run.generation == generation && run.execution_id == execution_id => {
                    run.clone()
                }
                _ => {
                    debug!("Dropping {} update for inactive execution {}", update.kind(), execution_id);
                    return;
                }
            };
            if update.is_terminal() {
                state.active = None;
                state.is_executing = false;
            }
            run
        };

        run.deliver(update);
    }
}

async fn dispatch_events(
    inner: Weak<ServiceInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    readiness: watch::Sender<Readiness>,
) {
    while let Some(event) = events.recv().await {
        let Some(service) = inner.upgrade() else {
            return;
        };

        match event {
            WorkerEvent::Ready(info) => {
                info!(
                    "Worker generation {} ready with Python {}",
                    generation, info.python_version
                );
                readiness.send_replace(Readiness::Ready(info));
            }
            WorkerEvent::InitializationFailed(reason) => {
                warn!(
                    "Worker generation {} failed to initialize: {}",
                    generation, reason
                );
                readiness.send_replace(Readiness::Failed(reason.clone()));

                let orphan = {
                    let mut state = service.state.lock();
                    service.take_active(&mut state, generation)
                };
                if let Some(run) = orphan {
                    run.deliver(ExecutionUpdate::error(
                        ExecutionError::InitializationFailed(reason).to_string(),
                    ));
                }
            }
            WorkerEvent::Update {
                execution_id,
                update,
            } => service.route(generation, execution_id, update),
            WorkerEvent::Exited => break,
        }
    }

    let failed = matches!(*readiness.borrow(), Readiness::Failed(_));
    if failed {
        // Keep the failed slot so callers see the failure until stop()
        return;
    }

    if let Some(service) = inner.upgrade() {
        info!("Worker generation {} exited", generation);
        service.discard_slot(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrunner_config::InterpreterConfig;

    fn unavailable_interpreter() -> PyrunnerConfig {
        PyrunnerConfig {
            interpreter: InterpreterConfig {
                python_executable: "/nonexistent/bin/python3".to_string(),
                packages: Vec::new(),
                ..InterpreterConfig::default()
            },
            ..PyrunnerConfig::default()
        }
    }

    fn collector() -> (
        Arc<Mutex<Vec<ExecutionUpdate>>>,
        impl FnMut(ExecutionUpdate) + Send + 'static,
    ) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        (updates, move |update| sink.lock().push(update))
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = ExecutorService::new(PyrunnerConfig::default());
        assert!(matches!(result, Err(ExecutionError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_no_worker_until_first_use() {
        let service = ExecutorService::new(unavailable_interpreter()).unwrap();
        assert!(service.readiness().is_none());
        assert!(service.environment().is_none());
        assert!(!service.is_executing());
    }

    #[tokio::test]
    async fn test_ready_reports_initialization_failure() {
        let service = ExecutorService::new(unavailable_interpreter()).unwrap();

        let err = service.ready().await.unwrap_err();
        assert!(matches!(err, ExecutionError::InitializationFailed(_)));
        assert!(err
            .to_string()
            .starts_with("Python environment failed to load:"));

        // The failure sticks to the slot instead of respawning on every call
        assert!(matches!(service.readiness(), Some(Readiness::Failed(_))));
        assert!(service.ready().await.is_err());
    }

    #[tokio::test]
    async fn test_run_delivers_initialization_failure() {
        let service = ExecutorService::new(unavailable_interpreter()).unwrap();
        let (updates, on_update) = collector();

        service.run("print(1)", on_update).await;

        let updates = updates.lock();
        assert_eq!(updates.len(), 1);
        match &updates[0] {
            ExecutionUpdate::Error { error } => {
                assert!(error.starts_with("Python environment failed to load:"))
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert!(!service.is_executing());
    }

    #[tokio::test]
    async fn test_empty_code_is_rejected_without_worker() {
        let service = ExecutorService::new(unavailable_interpreter()).unwrap();
        let (updates, on_update) = collector();

        service.run("   \n\t", on_update).await;

        assert_eq!(*updates.lock(), vec![ExecutionUpdate::error(EMPTY_CODE_MESSAGE)]);
        assert!(service.readiness().is_none());
    }

    #[tokio::test]
    async fn test_stop_when_idle_respawns_worker() {
        let service = ExecutorService::new(unavailable_interpreter()).unwrap();
        assert!(service.ready().await.is_err());

        service.stop();
        assert!(!service.is_executing());
        assert!(service.readiness().is_some());

        // The fresh worker retries initialization
        assert!(service.ready().await.is_err());
    }

    #[test]
    fn test_active_run_delivers_one_terminal() {
        let (updates, on_update) = collector();
        let run = ActiveRun::new(1, Uuid::new_v4(), Box::new(on_update));

        run.deliver(ExecutionUpdate::stdout("partial"));
        run.deliver(ExecutionUpdate::error(STOPPED_MESSAGE));
        run.deliver(ExecutionUpdate::Success);
        run.deliver(ExecutionUpdate::stdout("late"));

        assert_eq!(
            *updates.lock(),
            vec![
                ExecutionUpdate::stdout("partial"),
                ExecutionUpdate::error(STOPPED_MESSAGE),
            ]
        );
    }

    #[test]
    fn test_callback_may_deliver_reentrantly() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let own_run: Arc<Mutex<Option<Arc<ActiveRun>>>> = Arc::new(Mutex::new(None));

        let sink = updates.clone();
        let handle = own_run.clone();
        let on_update = move |update: ExecutionUpdate| {
            let stop_now = update == ExecutionUpdate::stdout("stop");
            sink.lock().push(update);
            if stop_now {
                let run = handle.lock().clone();
                if let Some(run) = run {
                    run.deliver(ExecutionUpdate::error(STOPPED_MESSAGE));
                }
            }
        };

        let run = Arc::new(ActiveRun::new(1, Uuid::new_v4(), Box::new(on_update)));
        *own_run.lock() = Some(run.clone());

        run.deliver(ExecutionUpdate::stdout("before"));
        run.deliver(ExecutionUpdate::stdout("stop"));
        run.deliver(ExecutionUpdate::stdout("after"));
        run.deliver(ExecutionUpdate::Success);

        assert_eq!(
            *updates.lock(),
            vec![
                ExecutionUpdate::stdout("before"),
                ExecutionUpdate::stdout("stop"),
                ExecutionUpdate::error(STOPPED_MESSAGE),
            ]
        );
        own_run.lock().take();
    }
}
