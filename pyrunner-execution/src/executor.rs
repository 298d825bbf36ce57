//! Code executor trait

use async_trait::async_trait;
use pyrunner_ipc::ExecutionUpdate;

use crate::error::ExecutionError;
use crate::host::HostInfo;
use crate::service::ExecutorService;

/// Receives the updates of one execution, in order
pub type UpdateCallback = Box<dyn FnMut(ExecutionUpdate) + Send>;

/// Something that can run Python code and be interrupted.
///
/// Front ends depend on this trait rather than on [`ExecutorService`].
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Wait until code can be executed
    async fn ready(&self) -> Result<HostInfo, ExecutionError>;

    /// Start executing `code`; every outcome arrives through `on_update`
    async fn run(&self, code: String, on_update: UpdateCallback);

    /// Interrupt the current execution, if any
    fn stop(&self);

    fn is_executing(&self) -> bool;
}

#[async_trait]
impl CodeExecutor for ExecutorService {
    async fn ready(&self) -> Result<HostInfo, ExecutionError> {
        ExecutorService::ready(self).await
    }

    async fn run(&self, code: String, on_update: UpdateCallback) {
        ExecutorService::run(self, code, on_update).await
    }

    fn stop(&self) {
        ExecutorService::stop(self)
    }

    fn is_executing(&self) -> bool {
        ExecutorService::is_executing(self)
    }
}
