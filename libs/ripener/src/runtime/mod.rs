mod host_runtime;
mod runner;
mod shutdown;

use thiserror::Error;

use crate::registry::LifecycleError;
use crate::services::ServiceError;
use crate::wiring::WiringError;

pub use host_runtime::{RunOptions, Runtime, RuntimeConfig};
pub use runner::{run, ShutdownOptions};
pub use shutdown::wait_for_shutdown;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system module failed to start")]
    SystemModule(#[source] LifecycleError),
    #[error("module discovery failed")]
    Discovery(#[source] anyhow::Error),
    #[error("runtime is stopped")]
    NotRunning,
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Wiring(#[from] WiringError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[cfg(test)]
mod tests;
