use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::context::ModuleContext;
use crate::events::Event;
use crate::module::{Module, ModuleDefinition, TYPE_HIERARCHY};
use crate::properties::Properties;
use crate::services::{ServiceEvent, ServiceInstance, ServiceReference, ShrinkableListeners};

/// Module code entry point.
///
/// `start` runs while the module is `Starting`; an error leaves the module
/// failed. `stop` runs while `Stopping`; teardown happens whatever it returns.
pub trait Activator: Send + Sync + 'static {
    fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()>;

    fn stop(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Turns the opaque `Module-Activator` header value into an activator.
pub trait ActivatorFactory: Send + Sync {
    fn create(&self, reference: &str) -> anyhow::Result<Box<dyn Activator>>;
}

/// Link-time activator registration, picked up by [`InventoryActivatorFactory`].
///
/// ```ignore
/// inventory::submit! {
///     ripener::ActivatorRegistration::new("demo.greeter", || Box::new(Greeter))
/// }
/// ```
pub struct ActivatorRegistration {
    pub reference: &'static str,
    pub create: fn() -> Box<dyn Activator>,
}

impl ActivatorRegistration {
    pub const fn new(reference: &'static str, create: fn() -> Box<dyn Activator>) -> Self {
        Self { reference, create }
    }
}

inventory::collect!(ActivatorRegistration);

#[derive(Debug, Default, Clone, Copy)]
pub struct InventoryActivatorFactory;

impl ActivatorFactory for InventoryActivatorFactory {
    fn create(&self, reference: &str) -> anyhow::Result<Box<dyn Activator>> {
        inventory::iter::<ActivatorRegistration>
            .into_iter()
            .find(|r| r.reference == reference)
            .map(|r| (r.create)())
            .ok_or_else(|| anyhow::anyhow!("no activator registered for '{reference}'"))
    }
}

type ActivatorCtor = Box<dyn Fn() -> anyhow::Result<Box<dyn Activator>> + Send + Sync>;

/// Named constructors supplied at runtime, mostly by embedders and tests.
#[derive(Default)]
pub struct MapActivatorFactory {
    ctors: HashMap<String, ActivatorCtor>,
}

impl MapActivatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, reference: impl Into<String>, ctor: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Activator>> + Send + Sync + 'static,
    {
        self.ctors.insert(reference.into(), Box::new(ctor));
        self
    }

    /// Fall back to the inventory when a name is not in the map.
    pub fn or_inventory(self) -> ChainedActivatorFactory {
        ChainedActivatorFactory {
            first: Box::new(self),
            second: Box::new(InventoryActivatorFactory),
        }
    }
}

impl ActivatorFactory for MapActivatorFactory {
    fn create(&self, reference: &str) -> anyhow::Result<Box<dyn Activator>> {
        let ctor = self
            .ctors
            .get(reference)
            .ok_or_else(|| anyhow::anyhow!("no activator named '{reference}'"))?;
        ctor()
    }
}

pub struct ChainedActivatorFactory {
    first: Box<dyn ActivatorFactory>,
    second: Box<dyn ActivatorFactory>,
}

impl ActivatorFactory for ChainedActivatorFactory {
    fn create(&self, reference: &str) -> anyhow::Result<Box<dyn Activator>> {
        self.first
            .create(reference)
            .or_else(|_| self.second.create(reference))
    }
}

/// Produces instances for module- and prototype-scoped registrations.
pub trait ServiceFactory: Send + Sync + 'static {
    fn get_service(
        &self,
        consumer: &Module,
        reference: &ServiceReference,
    ) -> anyhow::Result<ServiceInstance>;

    fn unget_service(
        &self,
        _consumer: &Module,
        _reference: &ServiceReference,
        _instance: &ServiceInstance,
    ) {
    }
}

/// Receives the merged configuration of a registration carrying a pid.
pub trait ManagedService: Send + Sync + 'static {
    fn updated(&self, properties: &Properties) -> anyhow::Result<()>;
}

/// Lookup parameters handed to a find hook.
#[derive(Debug, Clone, Copy)]
pub struct FindContext<'a> {
    pub consumer: &'a Module,
    pub interface: Option<&'a str>,
    pub filter: Option<&'a str>,
    pub all_services: bool,
}

/// Prunes lookup results before they reach a consumer.
pub trait FindHook: Send + Sync + 'static {
    fn find(
        &self,
        ctx: &FindContext<'_>,
        references: &mut Vec<ServiceReference>,
    ) -> anyhow::Result<()>;

    fn find_modules(
        &self,
        _consumer: &Module,
        _modules: &mut Vec<Arc<Module>>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Prunes the consumer modules an event will be delivered to.
pub trait EventListenerHook: Send + Sync + 'static {
    fn event(
        &self,
        event: &ServiceEvent,
        listeners: &mut ShrinkableListeners,
    ) -> anyhow::Result<()>;
}

/// Service side of the event admin.
pub trait EventHandler: Send + Sync + 'static {
    fn handle_event(&self, event: &Event);
}

/// Backing store for pid configuration.
pub trait ConfigurationSource: Send + Sync {
    /// `Ok(None)` when nothing is configured for `pid`.
    fn get_config(&self, pid: &str) -> anyhow::Result<Option<BTreeMap<String, String>>>;
}

/// In-memory configuration, also used by the server for the YAML section.
#[derive(Debug, Default)]
pub struct StaticConfiguration {
    entries: parking_lot::RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl StaticConfiguration {
    pub fn new(entries: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self {
            entries: parking_lot::RwLock::new(entries),
        }
    }

    /// Replace the entry for `pid`. Callers follow up with
    /// `Runtime::update_configuration` to push it to live registrations.
    pub fn set(&self, pid: impl Into<String>, values: BTreeMap<String, String>) {
        self.entries.write().insert(pid.into(), values);
    }

    pub fn remove(&self, pid: &str) -> Option<BTreeMap<String, String>> {
        self.entries.write().remove(pid)
    }
}

impl ConfigurationSource for StaticConfiguration {
    fn get_config(&self, pid: &str) -> anyhow::Result<Option<BTreeMap<String, String>>> {
        Ok(self.entries.read().get(pid).cloned())
    }
}

/// Decides whether a service registered under `declared` can serve a lookup
/// for `requested` when the names differ.
pub trait TypeSpace: Send + Sync {
    fn is_assignable(&self, owner: &Module, declared: &str, requested: &str) -> bool;

    fn is_visible(&self, _consumer: &Module, _owner: &Module, _interface: &str) -> bool {
        true
    }
}

/// Reads supertypes from the owner's `Type-Hierarchy` header:
/// `Type=Super1|Super2, Other=Base`. Lookups follow the chain transitively.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderTypeSpace;

impl HeaderTypeSpace {
    fn supertypes(owner: &Module) -> BTreeMap<&str, Vec<&str>> {
        let mut map: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let Some(raw) = owner.header(TYPE_HIERARCHY) else {
            return map;
        };
        for entry in raw.split(',') {
            let Some((ty, supers)) = entry.split_once('=') else {
                continue;
            };
            map.entry(ty.trim()).or_default().extend(
                supers
                    .split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty()),
            );
        }
        map
    }
}

impl TypeSpace for HeaderTypeSpace {
    fn is_assignable(&self, owner: &Module, declared: &str, requested: &str) -> bool {
        if declared == requested {
            return true;
        }
        let graph = Self::supertypes(owner);
        let mut stack = vec![declared];
        let mut seen = std::collections::BTreeSet::new();
        while let Some(ty) = stack.pop() {
            if !seen.insert(ty) {
                continue;
            }
            for sup in graph.get(ty).into_iter().flatten() {
                if *sup == requested {
                    return true;
                }
                stack.push(*sup);
            }
        }
        false
    }
}

/// Source of module definitions for a runtime boot.
pub trait Discovery: Send + Sync {
    fn discover(&self) -> anyhow::Result<Vec<ModuleDefinition>>;
}

/// Fixed list of definitions.
#[derive(Debug, Default, Clone)]
pub struct StaticDiscovery(pub Vec<ModuleDefinition>);

impl Discovery for StaticDiscovery {
    fn discover(&self) -> anyhow::Result<Vec<ModuleDefinition>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Activator for Noop {
        fn start(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    inventory::submit! {
        ActivatorRegistration::new("tests.noop", || Box::new(Noop))
    }

    #[test]
    fn inventory_and_map_factories() {
        assert!(InventoryActivatorFactory.create("tests.noop").is_ok());
        assert!(InventoryActivatorFactory.create("tests.missing").is_err());

        let map = MapActivatorFactory::new().with("a", || Ok(Box::new(Noop) as Box<dyn Activator>));
        assert!(map.create("a").is_ok());
        assert!(map.create("tests.noop").is_err());

        let chained = MapActivatorFactory::new().or_inventory();
        assert!(chained.create("tests.noop").is_ok());
    }

    #[test]
    fn header_type_space_is_transitive() {
        let def = ModuleDefinition::new("m").header(
            TYPE_HIERARCHY,
            "demo.FancyGreeter=demo.Greeter|demo.Named, demo.Greeter=demo.Base",
        );
        let owner = Module::from_definition(1, def).unwrap();
        let ts = HeaderTypeSpace;
        assert!(ts.is_assignable(&owner, "demo.FancyGreeter", "demo.Greeter"));
        assert!(ts.is_assignable(&owner, "demo.FancyGreeter", "demo.Base"));
        assert!(ts.is_assignable(&owner, "demo.Greeter", "demo.Greeter"));
        assert!(!ts.is_assignable(&owner, "demo.Greeter", "demo.Named"));
    }

    #[test]
    fn static_configuration_lookup() {
        let cfg = StaticConfiguration::default();
        assert!(cfg.get_config("p").unwrap().is_none());
        cfg.set("p", BTreeMap::from([("k".to_string(), "v".to_string())]));
        assert_eq!(cfg.get_config("p").unwrap().unwrap()["k"], "v");
    }
}
