//! Per-module view of the runtime, handed to activators.

use std::any::Any;
use std::sync::Arc;

use crate::contracts::{EventHandler, EventListenerHook, FindHook, ManagedService};
use crate::events::{EVENT_FILTER, EVENT_HANDLER, EVENT_TOPICS};
use crate::filter::{Filter, FilterError};
use crate::module::{Module, ModuleEvent};
use crate::properties::{Properties, PropertyValue};
use crate::registry::ModuleTable;
use crate::services::{
    ListenerId, ServiceError, ServiceEvent, ServiceInstance, ServiceObject, ServiceReference,
    ServiceRegistration, ServiceRegistry, EVENT_LISTENER_HOOK, FIND_HOOK,
};
use crate::wiring::{Requirement, Wire, Wiring, WiringError};

/// Capability surface bound to one module.
///
/// Every call fails with [`ServiceError::InvalidContext`] unless the module
/// is `Starting`, `Active` or `Stopping`.
#[derive(Clone)]
pub struct ModuleContext {
    module: Arc<Module>,
    services: Arc<ServiceRegistry>,
    modules: Arc<ModuleTable>,
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module", &self.module.id())
            .field("state", &self.module.state())
            .finish()
    }
}

impl ModuleContext {
    pub(crate) fn new(
        module: Arc<Module>,
        services: Arc<ServiceRegistry>,
        modules: Arc<ModuleTable>,
    ) -> Self {
        Self {
            module,
            services,
            modules,
        }
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    fn check(&self) -> Result<(), ServiceError> {
        let state = self.module.state();
        if state.is_valid_context() {
            Ok(())
        } else {
            Err(ServiceError::InvalidContext {
                module: self.module.id(),
                state,
            })
        }
    }

    pub fn register_service(
        &self,
        interfaces: &[&str],
        object: ServiceObject,
        properties: Properties,
    ) -> Result<ServiceRegistration, ServiceError> {
        self.check()?;
        self.services
            .register(&self.module, interfaces, object, properties)
    }

    /// Register a plain value as a singleton service.
    pub fn register_value<T: Any + Send + Sync>(
        &self,
        interfaces: &[&str],
        value: T,
        properties: Properties,
    ) -> Result<ServiceRegistration, ServiceError> {
        self.register_service(interfaces, ServiceObject::singleton(value), properties)
    }

    pub fn register_managed_service(
        &self,
        interfaces: &[&str],
        object: ServiceObject,
        properties: Properties,
        managed: Arc<dyn ManagedService>,
    ) -> Result<ServiceRegistration, ServiceError> {
        self.check()?;
        self.services
            .register_managed(&self.module, interfaces, object, properties, managed)
    }

    pub fn register_find_hook(
        &self,
        hook: Arc<dyn FindHook>,
        properties: Properties,
    ) -> Result<ServiceRegistration, ServiceError> {
        self.register_service(
            &[FIND_HOOK],
            ServiceObject::Singleton(Arc::new(hook)),
            properties,
        )
    }

    pub fn register_event_hook(
        &self,
        hook: Arc<dyn EventListenerHook>,
        properties: Properties,
    ) -> Result<ServiceRegistration, ServiceError> {
        self.register_service(
            &[EVENT_LISTENER_HOOK],
            ServiceObject::Singleton(Arc::new(hook)),
            properties,
        )
    }

    /// Subscribe `handler` to event admin topics (`a/b` or `a/*`).
    pub fn register_event_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        topics: &[&str],
        filter: Option<&str>,
    ) -> Result<ServiceRegistration, ServiceError> {
        if let Some(f) = filter {
            Filter::parse(f)?;
        }
        let mut props = Properties::new().with(
            EVENT_TOPICS,
            PropertyValue::List(topics.iter().map(|t| PropertyValue::from(*t)).collect()),
        );
        if let Some(f) = filter {
            props.insert(EVENT_FILTER, f);
        }
        self.register_service(
            &[EVENT_HANDLER],
            ServiceObject::Singleton(Arc::new(handler)),
            props,
        )
    }

    /// References this module can use, best first.
    pub fn get_service_references(
        &self,
        interface: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>, ServiceError> {
        self.check()?;
        self.services
            .get_service_references(&self.module, interface, filter, true)
    }

    /// Like [`get_service_references`](Self::get_service_references) without
    /// the visibility check.
    pub fn get_all_service_references(
        &self,
        interface: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>, ServiceError> {
        self.check()?;
        self.services
            .get_service_references(&self.module, interface, filter, false)
    }

    pub fn get_service_reference(
        &self,
        interface: &str,
        filter: Option<&str>,
    ) -> Result<Option<ServiceReference>, ServiceError> {
        self.check()?;
        self.services
            .get_service_reference(&self.module, interface, filter)
    }

    pub fn get_service(
        &self,
        reference: &ServiceReference,
    ) -> Result<Option<ServiceInstance>, ServiceError> {
        self.check()?;
        self.services.get_service(reference, &self.module)
    }

    /// Obtain and downcast. `Ok(None)` if the service is gone or is not a `T`;
    /// a use is only recorded when the downcast succeeds.
    pub fn get_service_as<T: Any + Send + Sync>(
        &self,
        reference: &ServiceReference,
    ) -> Result<Option<Arc<T>>, ServiceError> {
        let Some(instance) = self.get_service(reference)? else {
            return Ok(None);
        };
        match instance.downcast::<T>() {
            Ok(typed) => Ok(Some(typed)),
            Err(_) => {
                self.services.unget_service(reference, &self.module);
                Ok(None)
            }
        }
    }

    pub fn unget_service(&self, reference: &ServiceReference) -> bool {
        self.services.unget_service(reference, &self.module)
    }

    pub fn unget_service_object(
        &self,
        reference: &ServiceReference,
        instance: &ServiceInstance,
    ) -> bool {
        self.services
            .unget_service_object(reference, &self.module, instance)
    }

    pub fn add_service_listener<F>(
        &self,
        filter: Option<&str>,
        listener: F,
    ) -> Result<ListenerId, ServiceError>
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.check()?;
        self.services
            .add_service_listener(&self.module, filter, Arc::new(listener))
    }

    pub fn remove_service_listener(&self, id: ListenerId) -> bool {
        self.services.remove_listener(self.module.id(), id)
    }

    pub fn add_module_listener<F>(&self, listener: F) -> Result<ListenerId, ServiceError>
    where
        F: Fn(&ModuleEvent) + Send + Sync + 'static,
    {
        self.check()?;
        Ok(self
            .services
            .add_module_listener(&self.module, Arc::new(listener)))
    }

    pub fn remove_module_listener(&self, id: ListenerId) -> bool {
        self.services.remove_listener(self.module.id(), id)
    }

    pub fn get_module(&self, id: u64) -> Result<Option<Arc<Module>>, ServiceError> {
        self.check()?;
        let Some(found) = self.modules.get(id) else {
            return Ok(None);
        };
        let mut visible = vec![found];
        self.services.filter_modules(&self.module, &mut visible);
        Ok(visible.pop())
    }

    pub fn get_modules(&self) -> Result<Vec<Arc<Module>>, ServiceError> {
        self.check()?;
        let mut modules = self.modules.all();
        self.services.filter_modules(&self.module, &mut modules);
        Ok(modules)
    }

    pub fn create_filter(&self, src: &str) -> Result<Filter, FilterError> {
        Filter::parse(src)
    }

    /// Wires for all requirements of this module.
    pub fn wiring(&self) -> Result<Wiring, WiringError> {
        self.modules.wiring(&self.module)
    }

    pub fn resolve_wire(&self, requirement: &Requirement) -> Result<Wire, WiringError> {
        self.modules.resolve_wire(&self.module, requirement)
    }
}
