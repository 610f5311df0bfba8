//! Service registry: registrations, lookups, scoped instances, listener
//! dispatch and hook interception.
//!
//! Two lock domains exist. The service table (registrations, the interface
//! index and the hook indexes) is one; the listener table is the other.
//! Neither lock is held while user code (listeners, hooks, factories,
//! managed-config callbacks) runs.

mod dispatch;
mod hooks;
mod registration;
mod registry;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::filter::FilterError;
use crate::module::ModuleState;

pub use dispatch::{ListenerId, ModuleListener, ServiceListener};
pub(crate) use hooks::panic_message;
pub use hooks::{ListenerInfo, ShrinkableListeners, EVENT_LISTENER_HOOK, FIND_HOOK};
pub use registration::{ServiceObject, ServiceReference, ServiceRegistration};
pub use registry::ServiceRegistry;

/// A live service object as handed to consumers.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Singleton,
    Module,
    Prototype,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Singleton => "singleton",
            Scope::Module => "module",
            Scope::Prototype => "prototype",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceEventKind {
    Registered,
    Modified,
    /// The new properties no longer match a listener that matched the old ones.
    ModifiedEndMatch,
    Unregistering,
}

#[derive(Clone, Debug)]
pub struct ServiceEvent {
    pub kind: ServiceEventKind,
    pub reference: ServiceReference,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("a service must be registered under at least one interface")]
    NoInterfaces,
    #[error("blank interface name")]
    BlankInterface,
    #[error(transparent)]
    InvalidFilter(#[from] FilterError),
    #[error("service {0} is already unregistered")]
    Unregistered(u64),
    #[error("service {service} was registered as '{interface}' but is not one")]
    InvalidHook { service: u64, interface: String },
    #[error("service factory for {service} failed")]
    Factory {
        service: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("context of module {module} is not usable in state {state}")]
    InvalidContext { module: u64, state: ModuleState },
    #[error("runtime registry is gone")]
    RegistryClosed,
}
