use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::contracts::{ManagedService, ServiceFactory};
use crate::module::Module;
use crate::properties::{Properties, PropertyValue};

use super::{registry::ServiceRegistry, Scope, ServiceError, ServiceInstance};

/// What a registration hands out.
#[derive(Clone)]
pub enum ServiceObject {
    /// One shared instance for every consumer.
    Singleton(ServiceInstance),
    /// One instance per consumer module, produced lazily.
    Module(Arc<dyn ServiceFactory>),
    /// A fresh instance for every `get_service` call.
    Prototype(Arc<dyn ServiceFactory>),
}

impl ServiceObject {
    pub fn singleton<T: Any + Send + Sync>(value: T) -> Self {
        ServiceObject::Singleton(Arc::new(value))
    }

    pub fn module_scoped(factory: impl ServiceFactory) -> Self {
        ServiceObject::Module(Arc::new(factory))
    }

    pub fn prototype(factory: impl ServiceFactory) -> Self {
        ServiceObject::Prototype(Arc::new(factory))
    }

    pub fn scope(&self) -> Scope {
        match self {
            ServiceObject::Singleton(_) => Scope::Singleton,
            ServiceObject::Module(_) => Scope::Module,
            ServiceObject::Prototype(_) => Scope::Prototype,
        }
    }

    pub(crate) fn factory(&self) -> Option<&Arc<dyn ServiceFactory>> {
        match self {
            ServiceObject::Singleton(_) => None,
            ServiceObject::Module(f) | ServiceObject::Prototype(f) => Some(f),
        }
    }
}

impl fmt::Debug for ServiceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceObject({})", self.scope())
    }
}

pub(crate) const STATE_REGISTERED: u8 = 0;
pub(crate) const STATE_UNREGISTERING: u8 = 1;
pub(crate) const STATE_UNREGISTERED: u8 = 2;

/// Per-consumer bookkeeping of obtained instances.
pub(crate) struct Usage {
    pub(crate) consumer: Arc<Module>,
    pub(crate) count: usize,
    /// Memoized module-scoped instance.
    pub(crate) memo: Option<ServiceInstance>,
    /// Outstanding prototype instances, oldest first.
    pub(crate) prototypes: Vec<ServiceInstance>,
}

pub(crate) struct RegistrationInner {
    pub(crate) id: u64,
    pub(crate) interfaces: Vec<String>,
    pub(crate) owner: Arc<Module>,
    pub(crate) object: ServiceObject,
    /// Caller properties with reserved keys applied, before configuration.
    pub(crate) base: ArcSwap<Properties>,
    /// Current generation as seen by matching and consumers.
    pub(crate) props: ArcSwap<Properties>,
    pub(crate) state: AtomicU8,
    pub(crate) usages: Mutex<HashMap<u64, Usage>>,
    pub(crate) managed: Option<Arc<dyn ManagedService>>,
}

impl RegistrationInner {
    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

/// Stable handle to a registration.
///
/// The handle stays readable after the service is unregistered; the last
/// property generation remains available.
#[derive(Clone)]
pub struct ServiceReference(pub(crate) Arc<RegistrationInner>);

impl ServiceReference {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn interfaces(&self) -> &[String] {
        &self.0.interfaces
    }

    pub fn owner(&self) -> &Arc<Module> {
        &self.0.owner
    }

    pub fn scope(&self) -> Scope {
        self.0.object.scope()
    }

    /// Snapshot of the current property generation.
    pub fn properties(&self) -> Arc<Properties> {
        self.0.props.load_full()
    }

    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        self.0.props.load().get(key).cloned()
    }

    pub fn ranking(&self) -> i64 {
        self.0.props.load().ranking()
    }

    pub fn is_registered(&self) -> bool {
        self.0.state() != STATE_UNREGISTERED
    }

    /// Ids of modules currently holding an instance.
    pub fn using_modules(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .0
            .usages
            .lock()
            .iter()
            .filter(|(_, u)| u.count > 0)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Ranking descending, then id ascending.
    pub fn cmp_priority(&self, other: &Self) -> std::cmp::Ordering {
        other
            .ranking()
            .cmp(&self.ranking())
            .then_with(|| self.id().cmp(&other.id()))
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ServiceReference {}

impl Hash for ServiceReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl PartialOrd for ServiceReference {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceReference {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.0.id)
            .field("interfaces", &self.0.interfaces)
            .field("owner", &self.0.owner.id())
            .field("scope", &self.scope())
            .finish()
    }
}

/// Owner-side handle returned by registration.
#[derive(Clone)]
pub struct ServiceRegistration {
    pub(crate) reference: ServiceReference,
    pub(crate) registry: Weak<ServiceRegistry>,
}

impl ServiceRegistration {
    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    pub fn id(&self) -> u64 {
        self.reference.id()
    }

    /// Publish a new property generation and fire `Modified`.
    pub fn set_properties(&self, properties: Properties) -> Result<(), ServiceError> {
        let registry = self.registry.upgrade().ok_or(ServiceError::RegistryClosed)?;
        registry.set_properties(&self.reference, properties)
    }

    pub fn unregister(&self) -> Result<(), ServiceError> {
        let registry = self.registry.upgrade().ok_or(ServiceError::RegistryClosed)?;
        registry.unregister(&self.reference)
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceRegistration")
            .field(&self.reference)
            .finish()
    }
}
