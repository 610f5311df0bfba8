use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};

use crate::contracts::{
    ConfigurationSource, EventListenerHook, FindContext, FindHook, HeaderTypeSpace,
    ManagedService, StaticConfiguration, TypeSpace,
};
use crate::filter::Filter;
use crate::module::{Module, ModuleEvent};
use crate::properties::{
    Properties, PropertyValue, OBJECT_CLASS, SERVICE_ID, SERVICE_MODULE_ID, SERVICE_RANKING,
    SERVICE_SCOPE,
};

use super::dispatch::{self, ListenerTable, ModuleListener, ServiceListener};
use super::hooks::{self, ShrinkableListeners, EVENT_LISTENER_HOOK, FIND_HOOK};
use super::registration::{
    RegistrationInner, ServiceObject, ServiceReference, ServiceRegistration, Usage,
    STATE_REGISTERED, STATE_UNREGISTERED, STATE_UNREGISTERING,
};
use super::{ListenerId, ServiceError, ServiceEvent, ServiceEventKind, ServiceInstance};

/// Keys the registry owns; caller and configuration values are overwritten.
const SYNTHESIZED: [&str; 4] = [OBJECT_CLASS, SERVICE_ID, SERVICE_SCOPE, SERVICE_MODULE_ID];

type FindHooks = Vec<(ServiceReference, Arc<dyn FindHook>)>;
type EventHooks = Vec<(ServiceReference, Arc<dyn EventListenerHook>)>;

#[derive(Default)]
struct ServiceTable {
    by_id: BTreeMap<u64, ServiceReference>,
    by_interface: HashMap<String, BTreeSet<u64>>,
    find_hooks: BTreeMap<u64, (ServiceReference, Arc<dyn FindHook>)>,
    event_hooks: BTreeMap<u64, (ServiceReference, Arc<dyn EventListenerHook>)>,
}

impl ServiceTable {
    fn insert(&mut self, reference: ServiceReference, hook: Option<Hook>) {
        let id = reference.id();
        for iface in reference.interfaces() {
            self.by_interface.entry(iface.clone()).or_default().insert(id);
        }
        match hook {
            Some(Hook::Find(h)) => {
                self.find_hooks.insert(id, (reference.clone(), h));
            }
            Some(Hook::Event(h)) => {
                self.event_hooks.insert(id, (reference.clone(), h));
            }
            None => {}
        }
        self.by_id.insert(id, reference);
    }

    fn remove(&mut self, reference: &ServiceReference) -> bool {
        let id = reference.id();
        for iface in reference.interfaces() {
            if let Some(ids) = self.by_interface.get_mut(iface) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_interface.remove(iface);
                }
            }
        }
        self.find_hooks.remove(&id);
        self.event_hooks.remove(&id);
        self.by_id.remove(&id).is_some()
    }

    fn find_hooks(&self) -> FindHooks {
        let mut hooks: FindHooks = self.find_hooks.values().cloned().collect();
        hooks.sort_by(|a, b| a.0.cmp_priority(&b.0));
        hooks
    }

    fn event_hooks(&self) -> EventHooks {
        let mut hooks: EventHooks = self.event_hooks.values().cloned().collect();
        hooks.sort_by(|a, b| a.0.cmp_priority(&b.0));
        hooks
    }
}

enum Hook {
    Find(Arc<dyn FindHook>),
    Event(Arc<dyn EventListenerHook>),
}

/// Shared table of live registrations.
pub struct ServiceRegistry {
    this: Weak<ServiceRegistry>,
    next_id: AtomicU64,
    table: RwLock<ServiceTable>,
    listeners: RwLock<ListenerTable>,
    config: Arc<dyn ConfigurationSource>,
    types: Arc<dyn TypeSpace>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.table.read().by_id.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new(config: Arc<dyn ConfigurationSource>, types: Arc<dyn TypeSpace>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            next_id: AtomicU64::new(1),
            table: RwLock::new(ServiceTable::default()),
            listeners: RwLock::new(ListenerTable::default()),
            config,
            types,
        })
    }

    /// Registry without configuration and with the header-based type space.
    pub fn standalone() -> Arc<Self> {
        Self::new(
            Arc::new(StaticConfiguration::default()),
            Arc::new(HeaderTypeSpace),
        )
    }

    pub fn len(&self) -> usize {
        self.table.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- registration ---------------------------------------------------

    pub fn register(
        &self,
        owner: &Arc<Module>,
        interfaces: &[&str],
        object: ServiceObject,
        properties: Properties,
    ) -> Result<ServiceRegistration, ServiceError> {
        self.register_with(owner, interfaces, object, properties, None)
    }

    /// Register and call `managed` with the merged properties before
    /// `Registered` is delivered.
    pub fn register_managed(
        &self,
        owner: &Arc<Module>,
        interfaces: &[&str],
        object: ServiceObject,
        properties: Properties,
        managed: Arc<dyn ManagedService>,
    ) -> Result<ServiceRegistration, ServiceError> {
        self.register_with(owner, interfaces, object, properties, Some(managed))
    }

    fn register_with(
        &self,
        owner: &Arc<Module>,
        interfaces: &[&str],
        object: ServiceObject,
        properties: Properties,
        managed: Option<Arc<dyn ManagedService>>,
    ) -> Result<ServiceRegistration, ServiceError> {
        if interfaces.is_empty() {
            return Err(ServiceError::NoInterfaces);
        }
        if interfaces.iter().any(|i| i.trim().is_empty()) {
            return Err(ServiceError::BlankInterface);
        }
        let mut names: Vec<String> = Vec::with_capacity(interfaces.len());
        for iface in interfaces {
            if !names.iter().any(|n| n == iface) {
                names.push((*iface).to_string());
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let hook = Self::extract_hook(id, &names, &object)?;
        let base = synthesize(properties, id, &names, owner.id(), &object);
        let merged = self.merge_configuration(id, &base);

        let reference = ServiceReference(Arc::new(RegistrationInner {
            id,
            interfaces: names,
            owner: Arc::clone(owner),
            object,
            base: ArcSwap::from_pointee(base),
            props: ArcSwap::from_pointee(merged),
            state: STATE_REGISTERED.into(),
            usages: Mutex::new(HashMap::new()),
            managed,
        }));

        self.table.write().insert(reference.clone(), hook);
        tracing::debug!(
            service.id = id,
            module = owner.id(),
            interfaces = ?reference.interfaces(),
            scope = %reference.scope(),
            "Service registered"
        );

        self.notify_managed(&reference);
        self.fire(ServiceEventKind::Registered, &reference, None);

        Ok(ServiceRegistration {
            reference,
            registry: self.this.clone(),
        })
    }

    fn extract_hook(
        id: u64,
        interfaces: &[String],
        object: &ServiceObject,
    ) -> Result<Option<Hook>, ServiceError> {
        let wants_find = interfaces.iter().any(|i| i == FIND_HOOK);
        let wants_event = interfaces.iter().any(|i| i == EVENT_LISTENER_HOOK);
        if !wants_find && !wants_event {
            return Ok(None);
        }
        let ServiceObject::Singleton(instance) = object else {
            return Err(ServiceError::InvalidHook {
                service: id,
                interface: if wants_find { FIND_HOOK } else { EVENT_LISTENER_HOOK }.to_string(),
            });
        };
        if wants_find {
            return instance
                .downcast_ref::<Arc<dyn FindHook>>()
                .map(|h| Some(Hook::Find(Arc::clone(h))))
                .ok_or(ServiceError::InvalidHook {
                    service: id,
                    interface: FIND_HOOK.to_string(),
                });
        }
        instance
            .downcast_ref::<Arc<dyn EventListenerHook>>()
            .map(|h| Some(Hook::Event(Arc::clone(h))))
            .ok_or(ServiceError::InvalidHook {
                service: id,
                interface: EVENT_LISTENER_HOOK.to_string(),
            })
    }

    /// Overlay configuration for every pid the properties name.
    fn merge_configuration(&self, id: u64, base: &Properties) -> Properties {
        let mut merged = base.clone();
        for pid in base.config_pids() {
            match self.config.get_config(&pid) {
                Ok(Some(values)) => {
                    for (key, value) in values {
                        if SYNTHESIZED.contains(&key.as_str()) {
                            continue;
                        }
                        merged.insert(key, configured_value(&value));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(service.id = id, pid = %pid, error = %e, "Configuration lookup failed");
                }
            }
        }
        merged
    }

    fn notify_managed(&self, reference: &ServiceReference) {
        let Some(managed) = &reference.0.managed else {
            return;
        };
        let props = reference.properties();
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| managed.updated(&props)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(service.id = reference.id(), error = %e, "Managed service update failed");
            }
            Err(panic) => {
                tracing::error!(
                    service.id = reference.id(),
                    panic = %hooks::panic_message(panic.as_ref()),
                    "Managed service update panicked"
                );
            }
        }
    }

    /// Replace the caller-controlled properties of a live registration.
    pub fn set_properties(
        &self,
        reference: &ServiceReference,
        properties: Properties,
    ) -> Result<(), ServiceError> {
        let inner = &reference.0;
        if inner.state() != STATE_REGISTERED {
            return Err(ServiceError::Unregistered(inner.id));
        }
        let base = synthesize(
            properties,
            inner.id,
            &inner.interfaces,
            inner.owner.id(),
            &inner.object,
        );
        let merged = self.merge_configuration(inner.id, &base);
        inner.base.store(Arc::new(base));
        let previous = inner.props.swap(Arc::new(merged));
        tracing::debug!(service.id = inner.id, "Service properties modified");
        self.fire(ServiceEventKind::Modified, reference, Some(&previous));
        Ok(())
    }

    /// Re-read configuration for every registration naming `pid`.
    ///
    /// Returns how many registrations were refreshed.
    pub fn refresh_configuration(&self, pid: &str) -> usize {
        let targets: Vec<ServiceReference> = self
            .table
            .read()
            .by_id
            .values()
            .filter(|r| r.0.base.load().config_pids().iter().any(|p| p == pid))
            .cloned()
            .collect();

        for reference in &targets {
            let inner = &reference.0;
            if inner.state() != STATE_REGISTERED {
                continue;
            }
            let merged = self.merge_configuration(inner.id, &inner.base.load());
            let previous = inner.props.swap(Arc::new(merged));
            self.notify_managed(reference);
            self.fire(ServiceEventKind::Modified, reference, Some(&previous));
        }
        if !targets.is_empty() {
            tracing::info!(pid, services = targets.len(), "Configuration refreshed");
        }
        targets.len()
    }

    /// Unregister a service: `Unregistering` is delivered while the entry is
    /// still present, then the entry is removed and outstanding instances are
    /// released.
    pub fn unregister(&self, reference: &ServiceReference) -> Result<(), ServiceError> {
        let inner = &reference.0;
        inner
            .state
            .compare_exchange(
                STATE_REGISTERED,
                STATE_UNREGISTERING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| ServiceError::Unregistered(inner.id))?;

        self.fire(ServiceEventKind::Unregistering, reference, None);
        self.table.write().remove(reference);

        let released: Vec<Usage> = {
            let mut usages = inner.usages.lock();
            inner.state.store(STATE_UNREGISTERED, Ordering::Release);
            usages.drain().map(|(_, u)| u).collect()
        };
        for usage in released {
            release_usage(reference, usage);
        }
        tracing::debug!(service.id = inner.id, module = inner.owner.id(), "Service unregistered");
        Ok(())
    }

    /// Unregister everything `owner` registered, newest first.
    pub fn unregister_all(&self, owner: u64) -> usize {
        let mut owned: Vec<ServiceReference> = self
            .table
            .read()
            .by_id
            .values()
            .filter(|r| r.owner().id() == owner)
            .cloned()
            .collect();
        owned.reverse();
        owned
            .iter()
            .filter(|r| self.unregister(r).is_ok())
            .count()
    }

    // ---- instances ------------------------------------------------------

    /// Obtain the service object for `consumer`.
    ///
    /// `Ok(None)` when the service is no longer registered.
    pub fn get_service(
        &self,
        reference: &ServiceReference,
        consumer: &Arc<Module>,
    ) -> Result<Option<ServiceInstance>, ServiceError> {
        let inner = &reference.0;
        match &inner.object {
            ServiceObject::Singleton(instance) => {
                let mut usages = inner.usages.lock();
                if inner.state() == STATE_UNREGISTERED {
                    return Ok(None);
                }
                usage_entry(&mut usages, consumer).count += 1;
                Ok(Some(Arc::clone(instance)))
            }
            ServiceObject::Module(factory) => {
                {
                    let mut usages = inner.usages.lock();
                    if inner.state() == STATE_UNREGISTERED {
                        return Ok(None);
                    }
                    if let Some(usage) = usages.get_mut(&consumer.id()) {
                        if let Some(memo) = &usage.memo {
                            usage.count += 1;
                            return Ok(Some(Arc::clone(memo)));
                        }
                    }
                }
                // The factory runs unlocked so it may call back into the registry.
                let produced = factory
                    .get_service(consumer, reference)
                    .map_err(|source| ServiceError::Factory {
                        service: inner.id,
                        source,
                    })?;
                let mut usages = inner.usages.lock();
                if inner.state() == STATE_UNREGISTERED {
                    drop(usages);
                    factory.unget_service(consumer, reference, &produced);
                    return Ok(None);
                }
                let usage = usage_entry(&mut usages, consumer);
                usage.count += 1;
                if let Some(existing) = &usage.memo {
                    let existing = Arc::clone(existing);
                    drop(usages);
                    factory.unget_service(consumer, reference, &produced);
                    return Ok(Some(existing));
                }
                usage.memo = Some(Arc::clone(&produced));
                Ok(Some(produced))
            }
            ServiceObject::Prototype(factory) => {
                if inner.state() == STATE_UNREGISTERED {
                    return Ok(None);
                }
                let produced = factory
                    .get_service(consumer, reference)
                    .map_err(|source| ServiceError::Factory {
                        service: inner.id,
                        source,
                    })?;
                let mut usages = inner.usages.lock();
                if inner.state() == STATE_UNREGISTERED {
                    drop(usages);
                    factory.unget_service(consumer, reference, &produced);
                    return Ok(None);
                }
                let usage = usage_entry(&mut usages, consumer);
                usage.count += 1;
                usage.prototypes.push(Arc::clone(&produced));
                Ok(Some(produced))
            }
        }
    }

    /// Release one use of `reference` by `consumer`.
    ///
    /// Returns `false` when the consumer holds nothing. A module-scoped
    /// instance goes back to its factory once the use count drops to zero; for
    /// prototypes the most recently obtained instance is released.
    pub fn unget_service(&self, reference: &ServiceReference, consumer: &Module) -> bool {
        let inner = &reference.0;
        let mut usages = inner.usages.lock();
        let Some(usage) = usages.get_mut(&consumer.id()) else {
            return false;
        };
        if usage.count == 0 {
            return false;
        }
        usage.count -= 1;
        let released = match &inner.object {
            ServiceObject::Singleton(_) => None,
            ServiceObject::Module(_) if usage.count == 0 => usage.memo.take(),
            ServiceObject::Module(_) => None,
            ServiceObject::Prototype(_) => usage.prototypes.pop(),
        };
        if usage.count == 0 {
            usages.remove(&consumer.id());
        }
        drop(usages);
        if let (Some(instance), Some(factory)) = (released, inner.object.factory()) {
            factory.unget_service(consumer, reference, &instance);
        }
        true
    }

    /// Release one specific prototype instance.
    pub fn unget_service_object(
        &self,
        reference: &ServiceReference,
        consumer: &Module,
        instance: &ServiceInstance,
    ) -> bool {
        let inner = &reference.0;
        let ServiceObject::Prototype(factory) = &inner.object else {
            return self.unget_service(reference, consumer);
        };
        let mut usages = inner.usages.lock();
        let Some(usage) = usages.get_mut(&consumer.id()) else {
            return false;
        };
        let Some(pos) = usage
            .prototypes
            .iter()
            .position(|p| Arc::ptr_eq(p, instance))
        else {
            return false;
        };
        let released = usage.prototypes.remove(pos);
        usage.count = usage.count.saturating_sub(1);
        if usage.count == 0 {
            usages.remove(&consumer.id());
        }
        drop(usages);
        factory.unget_service(consumer, reference, &released);
        true
    }

    /// Drop everything `consumer` still holds, calling factory unget hooks.
    pub fn release_all(&self, consumer: u64) -> usize {
        let references: Vec<ServiceReference> =
            self.table.read().by_id.values().cloned().collect();
        let mut released = 0;
        for reference in references {
            let usage = reference.0.usages.lock().remove(&consumer);
            if let Some(usage) = usage {
                released += 1;
                release_usage(&reference, usage);
            }
        }
        released
    }

    // ---- lookup ---------------------------------------------------------

    /// Candidate references for `interface` (all services when `None`),
    /// filtered, sorted best first and passed through find hooks.
    pub fn get_service_references(
        &self,
        consumer: &Arc<Module>,
        interface: Option<&str>,
        filter: Option<&str>,
        only_assignable: bool,
    ) -> Result<Vec<ServiceReference>, ServiceError> {
        let filter = filter.map(Filter::parse).transpose()?;
        let (mut references, find_hooks) = {
            let table = self.table.read();
            let direct: Vec<ServiceReference> = match interface {
                None => table.by_id.values().cloned().collect(),
                Some(iface) => table
                    .by_interface
                    .get(iface)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| table.by_id.get(id).cloned())
                    .collect(),
            };
            let applicable = match interface {
                Some(i) if hooks::is_hook_interface(i) => Vec::new(),
                _ if consumer.is_system() => Vec::new(),
                _ => table.find_hooks(),
            };
            if direct.is_empty() && interface.is_some() {
                (table.by_id.values().cloned().collect::<Vec<_>>(), applicable)
            } else {
                (direct, applicable)
            }
        };

        if let Some(requested) = interface {
            // Entries not indexed under `requested` only qualify through the type space.
            references.retain(|r| {
                r.interfaces().iter().any(|i| i == requested)
                    || r.interfaces()
                        .iter()
                        .any(|declared| self.types.is_assignable(r.owner(), declared, requested))
            });
            if only_assignable {
                references.retain(|r| self.types.is_visible(consumer, r.owner(), requested));
            }
        }
        if let Some(f) = &filter {
            references.retain(|r| f.matches(&r.properties()));
        }
        references.sort_by(ServiceReference::cmp_priority);

        if !find_hooks.is_empty() && !references.is_empty() {
            let filter_src = filter.as_ref().map(ToString::to_string);
            let ctx = FindContext {
                consumer,
                interface,
                filter: filter_src.as_deref(),
                all_services: !only_assignable,
            };
            // Hook registrations stay visible whatever the hooks decide.
            let (hook_refs, mut hookable): (Vec<_>, Vec<_>) =
                references.into_iter().partition(hooks::is_hook_service);
            if !hookable.is_empty() {
                hooks::run_find_hooks(&find_hooks, &ctx, &mut hookable);
            }
            hookable.extend(hook_refs);
            hookable.sort_by(ServiceReference::cmp_priority);
            references = hookable;
        }
        Ok(references)
    }

    /// The best reference for `interface`, after hooks.
    pub fn get_service_reference(
        &self,
        consumer: &Arc<Module>,
        interface: &str,
        filter: Option<&str>,
    ) -> Result<Option<ServiceReference>, ServiceError> {
        Ok(self
            .get_service_references(consumer, Some(interface), filter, true)?
            .into_iter()
            .next())
    }

    /// Apply find hooks to a module enumeration.
    pub(crate) fn filter_modules(&self, consumer: &Module, modules: &mut Vec<Arc<Module>>) {
        if consumer.is_system() || modules.is_empty() {
            return;
        }
        let hooks = self.table.read().find_hooks();
        if !hooks.is_empty() {
            hooks::run_find_module_hooks(&hooks, consumer, modules);
        }
    }

    // ---- listeners ------------------------------------------------------

    pub fn add_service_listener(
        &self,
        module: &Arc<Module>,
        filter: Option<&str>,
        callback: ServiceListener,
    ) -> Result<ListenerId, ServiceError> {
        let filter = filter.map(Filter::parse).transpose()?;
        let id = self
            .listeners
            .write()
            .add_service(Arc::clone(module), filter, callback);
        tracing::trace!(module = module.id(), listener = %id, "Service listener added");
        Ok(id)
    }

    pub fn add_module_listener(&self, module: &Arc<Module>, callback: ModuleListener) -> ListenerId {
        self.listeners
            .write()
            .add_module(Arc::clone(module), callback)
    }

    pub fn remove_listener(&self, module: u64, id: ListenerId) -> bool {
        self.listeners.write().remove(module, id)
    }

    pub fn remove_all_listeners(&self, module: u64) -> usize {
        self.listeners.write().remove_all(module)
    }

    fn fire(&self, kind: ServiceEventKind, reference: &ServiceReference, previous: Option<&Properties>) {
        let current = reference.properties();
        let mut groups = self
            .listeners
            .read()
            .snapshot_service(kind, &current, previous);
        if groups.is_empty() {
            return;
        }
        let event = ServiceEvent {
            kind,
            reference: reference.clone(),
        };

        if !hooks::is_hook_service(reference) {
            let event_hooks = self.table.read().event_hooks();
            if !event_hooks.is_empty() {
                let infos: BTreeMap<u64, Vec<_>> = groups
                    .iter()
                    .map(|(module, pending)| (*module, pending.iter().map(|p| p.info.clone()).collect()))
                    .collect();
                let mut shrinkable = ShrinkableListeners::new(infos);
                hooks::run_event_hooks(&event_hooks, &event, &mut shrinkable);
                groups.retain(|module, _| shrinkable.contains(*module));
            }
        }

        let mut pending: Vec<_> = groups.into_values().flatten().collect();
        pending.sort_by_key(|p| p.info.id);
        for p in &pending {
            if !self.listeners.read().contains(p.info.id) {
                continue;
            }
            dispatch::deliver_service(p, &event);
        }
    }

    pub(crate) fn fire_module_event(&self, event: &ModuleEvent) {
        let listeners = self.listeners.read().snapshot_module();
        for (id, owner, callback) in &listeners {
            if !self.listeners.read().contains(*id) {
                continue;
            }
            dispatch::deliver_module(*id, *owner, callback, event);
        }
    }
}

fn usage_entry<'a>(usages: &'a mut HashMap<u64, Usage>, consumer: &Arc<Module>) -> &'a mut Usage {
    usages.entry(consumer.id()).or_insert_with(|| Usage {
        consumer: Arc::clone(consumer),
        count: 0,
        memo: None,
        prototypes: Vec::new(),
    })
}

fn release_usage(reference: &ServiceReference, usage: Usage) {
    let Some(factory) = reference.0.object.factory() else {
        return;
    };
    let Usage {
        consumer,
        memo,
        prototypes,
        ..
    } = usage;
    for instance in memo.into_iter().chain(prototypes) {
        factory.unget_service(&consumer, reference, &instance);
    }
}

/// Apply the reserved keys to caller properties.
fn synthesize(
    mut props: Properties,
    id: u64,
    interfaces: &[String],
    owner: u64,
    object: &ServiceObject,
) -> Properties {
    props.insert(
        OBJECT_CLASS,
        PropertyValue::List(interfaces.iter().map(|i| PropertyValue::from(i.as_str())).collect()),
    );
    props.insert(SERVICE_ID, id);
    props.insert(SERVICE_SCOPE, object.scope().as_str());
    props.insert(SERVICE_MODULE_ID, owner);
    let ranking = props.ranking();
    props.insert(SERVICE_RANKING, ranking);
    props
}

/// Configuration values arrive as strings; keep numbers and booleans typed.
fn configured_value(raw: &str) -> PropertyValue {
    if let Ok(v) = raw.parse::<i64>() {
        return PropertyValue::Long(v);
    }
    match raw {
        "true" => PropertyValue::Boolean(true),
        "false" => PropertyValue::Boolean(false),
        _ => PropertyValue::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ServiceFactory;
    use crate::module::ModuleDefinition;
    use std::sync::atomic::AtomicUsize;

    fn module(id: u64) -> Arc<Module> {
        let m = Module::from_definition(id, ModuleDefinition::new(format!("m{id}"))).unwrap();
        Arc::new(m)
    }

    struct Counter {
        made: AtomicUsize,
        returned: AtomicUsize,
    }

    impl ServiceFactory for Arc<Counter> {
        fn get_service(
            &self,
            _consumer: &Module,
            _reference: &ServiceReference,
        ) -> anyhow::Result<ServiceInstance> {
            let n = self.made.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(n))
        }

        fn unget_service(&self, _c: &Module, _r: &ServiceReference, _i: &ServiceInstance) {
            self.returned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter() -> Arc<Counter> {
        Arc::new(Counter {
            made: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
        })
    }

    #[test]
    fn reserved_keys_are_synthesized() {
        let reg = ServiceRegistry::standalone();
        let owner = module(3);
        let r = reg
            .register(
                &owner,
                &["a.B", "a.C", "a.B"],
                ServiceObject::singleton(1u8),
                Properties::new()
                    .with(SERVICE_ID, 999i64)
                    .with(SERVICE_RANKING, "5")
                    .with("x", "y"),
            )
            .unwrap();
        let props = r.reference().properties();
        assert_eq!(props.object_class(), vec!["a.B".to_string(), "a.C".to_string()]);
        assert_eq!(props.service_id(), Some(r.id()));
        assert_eq!(props.get(SERVICE_MODULE_ID), Some(&PropertyValue::Long(3)));
        assert_eq!(props.get_str(SERVICE_SCOPE), Some("singleton"));
        assert_eq!(props.get(SERVICE_RANKING), Some(&PropertyValue::Long(5)));
        assert_eq!(props.get_str("x"), Some("y"));
    }

    #[test]
    fn empty_interfaces_are_rejected() {
        let reg = ServiceRegistry::standalone();
        let err = reg
            .register(&module(1), &[], ServiceObject::singleton(()), Properties::new())
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoInterfaces));
        assert!(reg.is_empty());
    }

    #[test]
    fn ids_increase_and_ordering_is_by_ranking() {
        let reg = ServiceRegistry::standalone();
        let owner = module(1);
        let low = reg
            .register(&owner, &["s"], ServiceObject::singleton(()), Properties::new())
            .unwrap();
        let high = reg
            .register(
                &owner,
                &["s"],
                ServiceObject::singleton(()),
                Properties::new().with(SERVICE_RANKING, 10i64),
            )
            .unwrap();
        let tie = reg
            .register(&owner, &["s"], ServiceObject::singleton(()), Properties::new())
            .unwrap();
        assert!(low.id() < high.id() && high.id() < tie.id());

        let refs = reg.get_service_references(&owner, Some("s"), None, true).unwrap();
        let ids: Vec<u64> = refs.iter().map(ServiceReference::id).collect();
        assert_eq!(ids, vec![high.id(), low.id(), tie.id()]);
        assert_eq!(
            reg.get_service_reference(&owner, "s", None).unwrap(),
            Some(high.reference().clone())
        );
    }

    #[test]
    fn module_scope_memoizes_per_consumer() {
        let reg = ServiceRegistry::standalone();
        let factory = counter();
        let r = reg
            .register(
                &module(1),
                &["s"],
                ServiceObject::module_scoped(Arc::clone(&factory)),
                Properties::new(),
            )
            .unwrap();
        let (c1, c2) = (module(2), module(3));
        let a = reg.get_service(r.reference(), &c1).unwrap().unwrap();
        let b = reg.get_service(r.reference(), &c1).unwrap().unwrap();
        let c = reg.get_service(r.reference(), &c2).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(r.reference().using_modules(), vec![2, 3]);

        assert!(reg.unget_service(r.reference(), &c1));
        assert_eq!(factory.returned.load(Ordering::SeqCst), 0);
        assert!(reg.unget_service(r.reference(), &c1));
        assert_eq!(factory.returned.load(Ordering::SeqCst), 1);
        assert!(!reg.unget_service(r.reference(), &c1));

        r.unregister().unwrap();
        assert_eq!(factory.returned.load(Ordering::SeqCst), 2);
        assert!(reg.get_service(r.reference(), &c1).unwrap().is_none());
    }

    #[test]
    fn prototype_scope_is_fresh_every_call() {
        let reg = ServiceRegistry::standalone();
        let factory = counter();
        let r = reg
            .register(
                &module(1),
                &["s"],
                ServiceObject::prototype(Arc::clone(&factory)),
                Properties::new(),
            )
            .unwrap();
        let c = module(2);
        let a = reg.get_service(r.reference(), &c).unwrap().unwrap();
        let b = reg.get_service(r.reference(), &c).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(reg.unget_service_object(r.reference(), &c, &a));
        assert!(!reg.unget_service_object(r.reference(), &c, &a));
        assert_eq!(reg.release_all(2), 1);
        assert_eq!(factory.returned.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn double_unregister_is_reported() {
        let reg = ServiceRegistry::standalone();
        let r = reg
            .register(&module(1), &["s"], ServiceObject::singleton(()), Properties::new())
            .unwrap();
        r.unregister().unwrap();
        assert!(matches!(r.unregister(), Err(ServiceError::Unregistered(_))));
        assert!(!r.reference().is_registered());
    }

    #[test]
    fn deep_lookup_uses_type_hierarchy() {
        let reg = ServiceRegistry::standalone();
        let owner = Arc::new(
            Module::from_definition(
                1,
                ModuleDefinition::new("m1")
                    .header(crate::module::TYPE_HIERARCHY, "demo.Fancy=demo.Greeter"),
            )
            .unwrap(),
        );
        reg.register(&owner, &["demo.Fancy"], ServiceObject::singleton(()), Properties::new())
            .unwrap();
        let refs = reg
            .get_service_references(&module(2), Some("demo.Greeter"), None, true)
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert!(reg
            .get_service_references(&module(2), Some("demo.Other"), None, true)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn configuration_is_merged_and_refreshed() {
        let config = Arc::new(StaticConfiguration::default());
        config.set(
            "demo.pid",
            BTreeMap::from([
                ("lang".to_string(), "en".to_string()),
                ("port".to_string(), "80".to_string()),
                (SERVICE_ID.to_string(), "1234".to_string()),
            ]),
        );
        let reg = ServiceRegistry::new(config.clone(), Arc::new(HeaderTypeSpace));
        let owner = module(1);
        let r = reg
            .register(
                &owner,
                &["s"],
                ServiceObject::singleton(()),
                Properties::new().with(crate::properties::SERVICE_PID, "demo.pid"),
            )
            .unwrap();
        let first = r.reference().properties();
        assert_eq!(first.get_str("lang"), Some("en"));
        assert_eq!(first.get("port"), Some(&PropertyValue::Long(80)));
        assert_eq!(first.service_id(), Some(r.id()));

        config.set("demo.pid", BTreeMap::from([("lang".to_string(), "fr".to_string())]));
        assert_eq!(reg.refresh_configuration("demo.pid"), 1);
        assert_eq!(r.reference().properties().get_str("lang"), Some("fr"));
        // Earlier snapshots are untouched.
        assert_eq!(first.get_str("lang"), Some("en"));
    }
}
