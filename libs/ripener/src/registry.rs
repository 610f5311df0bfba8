use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::context::ModuleContext;
use crate::contracts::{Activator, ActivatorFactory};
use crate::module::{
    Module, ModuleDefinition, ModuleEvent, ModuleEventKind, ModuleState, SYSTEM_MODULE_ID,
};
use crate::services::ServiceRegistry;
use crate::wiring::{self, Requirement, Revision, Wire, Wiring, WiringError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("module {module} is {state}, cannot move to {target}")]
    InvalidState {
        module: u64,
        state: ModuleState,
        target: ModuleState,
    },
    #[error("module {0} not found")]
    UnknownModule(u64),
    #[error("invalid definition for module '{resource}'")]
    Definition {
        resource: String,
        #[source]
        source: WiringError,
    },
    #[error("activator '{reference}' of module {module} could not be created")]
    Activator {
        module: u64,
        reference: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("start failed for module {module} ('{name}')")]
    Start {
        module: u64,
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("stop failed for module {module} ('{name}')")]
    Stop {
        module: u64,
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Loaded modules keyed by id.
#[derive(Debug, Default)]
pub(crate) struct ModuleTable {
    modules: RwLock<BTreeMap<u64, Arc<Module>>>,
}

impl ModuleTable {
    pub(crate) fn get(&self, id: u64) -> Option<Arc<Module>> {
        self.modules.read().get(&id).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Module>> {
        self.modules.read().values().cloned().collect()
    }

    fn insert(&self, module: Arc<Module>) {
        self.modules.write().insert(module.id(), module);
    }

    fn remove(&self, id: u64) -> Option<Arc<Module>> {
        self.modules.write().remove(&id)
    }

    fn clear(&self) {
        self.modules.write().clear();
    }

    /// Revisions a requirer may wire to: live modules other than itself.
    fn candidates(&self, requirer: u64) -> Vec<Arc<Revision>> {
        self.modules
            .read()
            .values()
            .filter(|m| m.id() != requirer)
            .filter(|m| matches!(m.state(), ModuleState::Starting | ModuleState::Active))
            .map(|m| m.revision())
            .collect()
    }

    pub(crate) fn resolve_wire(
        &self,
        requirer: &Module,
        requirement: &Requirement,
    ) -> Result<Wire, WiringError> {
        let candidates = self.candidates(requirer.id());
        wiring::resolve_wire(&requirer.revision(), requirement, candidates.iter())
    }

    pub(crate) fn wiring(&self, module: &Module) -> Result<Wiring, WiringError> {
        let candidates = self.candidates(module.id());
        wiring::resolve_wiring(&module.revision(), candidates.iter())
    }
}

/// Owns the module table and drives lifecycle transitions.
pub struct ModuleRegistry {
    table: Arc<ModuleTable>,
    services: Arc<ServiceRegistry>,
    activators: Arc<dyn ActivatorFactory>,
    next_id: AtomicU64,
    system: Arc<Module>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<u64> = self.table.modules.read().keys().copied().collect();
        f.debug_struct("ModuleRegistry")
            .field("modules", &ids)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl ModuleRegistry {
    /// Create the registry and bring the system module to `Active`.
    ///
    /// `system_activator` runs as module 0; its failure is fatal.
    pub fn new(
        services: Arc<ServiceRegistry>,
        activators: Arc<dyn ActivatorFactory>,
        system_activator: Option<Arc<dyn Activator>>,
    ) -> Result<Self, LifecycleError> {
        let system = Arc::new(Module::system());
        let table = Arc::new(ModuleTable::default());
        table.insert(Arc::clone(&system));

        let registry = Self {
            table,
            services,
            activators,
            next_id: AtomicU64::new(SYSTEM_MODULE_ID + 1),
            system,
        };
        registry.start_with(&registry.system, system_activator)?;
        tracing::debug!(module = SYSTEM_MODULE_ID, "System module active");
        Ok(registry)
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn system_module(&self) -> &Arc<Module> {
        &self.system
    }

    pub fn get(&self, id: u64) -> Option<Arc<Module>> {
        self.table.get(id)
    }

    /// All modules in ascending id order.
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.table.all()
    }

    pub fn context(&self, module: &Arc<Module>) -> ModuleContext {
        ModuleContext::new(
            Arc::clone(module),
            Arc::clone(&self.services),
            Arc::clone(&self.table),
        )
    }

    pub fn resolve_wire(
        &self,
        requirer: &Module,
        requirement: &Requirement,
    ) -> Result<Wire, WiringError> {
        self.table.resolve_wire(requirer, requirement)
    }

    pub fn wiring(&self, module: &Module) -> Result<Wiring, WiringError> {
        self.table.wiring(module)
    }

    fn fire(&self, kind: ModuleEventKind, module: &Arc<Module>) {
        self.services.fire_module_event(&ModuleEvent {
            kind,
            module: Arc::clone(module),
        });
    }

    /// Order definitions for installation.
    ///
    /// A definition whose priority name starts with an entry of `priority`
    /// takes that entry's rank (first match wins); equal ranks keep discovery
    /// order. Everything unmatched follows, sorted by resource name.
    pub fn sort_definitions(
        mut definitions: Vec<ModuleDefinition>,
        priority: &[String],
    ) -> Vec<ModuleDefinition> {
        definitions.sort_by_cached_key(|d| {
            let name = d.priority_name();
            match priority.iter().position(|p| name.starts_with(p.as_str())) {
                Some(rank) => (rank, String::new()),
                None => (priority.len(), d.resource_name()),
            }
        });
        definitions
    }

    /// Pairs of priority entries where one is a prefix of the other.
    pub fn overlapping_prefixes(priority: &[String]) -> Vec<(String, String)> {
        let mut overlaps = Vec::new();
        for (i, a) in priority.iter().enumerate() {
            for b in &priority[i + 1..] {
                if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                    overlaps.push((a.clone(), b.clone()));
                }
            }
        }
        overlaps
    }

    pub fn install(&self, definition: ModuleDefinition) -> Result<Arc<Module>, LifecycleError> {
        let resource = definition.resource_name();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let module = Module::from_definition(id, definition)
            .map_err(|source| LifecycleError::Definition { resource, source })?;
        let module = Arc::new(module);
        self.table.insert(Arc::clone(&module));
        tracing::info!(
            module = id,
            name = module.symbolic_name(),
            version = %module.version(),
            "Module installed"
        );
        self.fire(ModuleEventKind::Installed, &module);
        Ok(module)
    }

    /// Run the module's activator. On failure the module ends `Uninstalled`
    /// with its failure recorded; it stays in the table.
    pub fn start(&self, module: &Arc<Module>) -> Result<(), LifecycleError> {
        let activator = match module.activator_ref() {
            None => None,
            Some(reference) => {
                // Validate the transition before instantiating anything.
                let state = module.state();
                if !matches!(state, ModuleState::Created | ModuleState::Stopped) {
                    return Err(LifecycleError::InvalidState {
                        module: module.id(),
                        state,
                        target: ModuleState::Starting,
                    });
                }
                match self.activators.create(reference) {
                    Ok(a) => Some(Arc::from(a)),
                    Err(source) => {
                        let err = LifecycleError::Activator {
                            module: module.id(),
                            reference: reference.to_string(),
                            source,
                        };
                        self.fail(module, &err);
                        return Err(err);
                    }
                }
            }
        };
        self.start_with(module, activator)
    }

    fn start_with(
        &self,
        module: &Arc<Module>,
        activator: Option<Arc<dyn Activator>>,
    ) -> Result<(), LifecycleError> {
        module.transition(
            &[ModuleState::Created, ModuleState::Stopped],
            ModuleState::Starting,
        )?;
        module.record_failure(None);
        tracing::debug!(module = module.id(), name = module.symbolic_name(), "Module starting");
        self.fire(ModuleEventKind::Starting, module);

        if let Some(activator) = activator {
            module.set_activator(Some(Arc::clone(&activator)));
            let ctx = self.context(module);
            if let Err(source) = invoke(|| activator.start(&ctx)) {
                let err = LifecycleError::Start {
                    module: module.id(),
                    name: module.symbolic_name().to_string(),
                    source,
                };
                self.teardown(module);
                module.set_activator(None);
                self.fail(module, &err);
                return Err(err);
            }
        }

        module.transition(&[ModuleState::Starting], ModuleState::Active)?;
        tracing::info!(module = module.id(), name = module.symbolic_name(), "Module started");
        self.fire(ModuleEventKind::Started, module);
        Ok(())
    }

    fn fail(&self, module: &Arc<Module>, err: &LifecycleError) {
        let causes = chain(err);
        let message = if causes.is_empty() {
            err.to_string()
        } else {
            format!("{err}: {causes}")
        };
        tracing::error!(module = module.id(), name = module.symbolic_name(), error = %message, "Module failed");
        module.record_failure(Some(message));
        module.force_state(ModuleState::Uninstalled);
        self.fire(ModuleEventKind::Failed, module);
    }

    /// Stop an active module. Teardown runs whatever the activator returns.
    pub fn stop(&self, module: &Arc<Module>) -> Result<(), LifecycleError> {
        module.transition(&[ModuleState::Active], ModuleState::Stopping)?;
        tracing::debug!(module = module.id(), name = module.symbolic_name(), "Module stopping");
        self.fire(ModuleEventKind::Stopping, module);

        let outcome = match module.activator() {
            Some(activator) => {
                let ctx = self.context(module);
                invoke(|| activator.stop(&ctx))
            }
            None => Ok(()),
        };

        self.teardown(module);
        module.set_activator(None);

        match outcome {
            Ok(()) => {
                module.transition(&[ModuleState::Stopping], ModuleState::Stopped)?;
                tracing::info!(module = module.id(), name = module.symbolic_name(), "Module stopped");
                self.fire(ModuleEventKind::Stopped, module);
                Ok(())
            }
            Err(source) => {
                let err = LifecycleError::Stop {
                    module: module.id(),
                    name: module.symbolic_name().to_string(),
                    source,
                };
                self.fail(module, &err);
                Err(err)
            }
        }
    }

    /// Unregister owned services, then drop listeners, then release
    /// everything the module still holds.
    fn teardown(&self, module: &Module) {
        let id = module.id();
        let services = self.services.unregister_all(id);
        let listeners = self.services.remove_all_listeners(id);
        let released = self.services.release_all(id);
        tracing::debug!(module = id, services, listeners, released, "Module resources released");
    }

    /// Stop if needed, fire `Uninstalled` and forget the module.
    pub fn uninstall(&self, module: &Arc<Module>) -> Result<(), LifecycleError> {
        if module.is_system() {
            return Err(LifecycleError::InvalidState {
                module: module.id(),
                state: module.state(),
                target: ModuleState::Uninstalled,
            });
        }
        if module.state() == ModuleState::Active {
            if let Err(e) = self.stop(module) {
                tracing::warn!(module = module.id(), error = %e, "Stop during uninstall failed");
            }
        }
        module.force_state(ModuleState::Uninstalled);
        self.fire(ModuleEventKind::Uninstalled, module);
        self.table.remove(module.id());
        tracing::info!(module = module.id(), "Module uninstalled");
        Ok(())
    }

    /// Stop every module in descending id order, module 0 last, then clear
    /// the table.
    pub fn shutdown(&self) {
        let mut modules = self.table.all();
        modules.sort_by_key(|m| std::cmp::Reverse(m.id()));
        for module in &modules {
            if module.state() == ModuleState::Active {
                if let Err(e) = self.stop(module) {
                    tracing::warn!(module = module.id(), error = %e, "Stop during shutdown failed");
                }
            }
            if module.state() != ModuleState::Uninstalled {
                module.force_state(ModuleState::Uninstalled);
                self.fire(ModuleEventKind::Uninstalled, module);
            }
        }
        self.table.clear();
        tracing::info!(modules = modules.len(), "All modules stopped");
    }
}

/// Call activator code, turning panics into errors.
fn invoke(f: impl FnOnce() -> anyhow::Result<()>) -> anyhow::Result<()> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "activator panicked: {}",
            crate::services::panic_message(panic.as_ref())
        )),
    }
}

fn chain(err: &LifecycleError) -> String {
    let mut parts = Vec::new();
    let mut source = std::error::Error::source(err);
    while let Some(s) = source {
        parts.push(s.to_string());
        source = s.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::MapActivatorFactory;
    use crate::module::MODULE_PRIORITY;

    fn defs(names: &[&str]) -> Vec<ModuleDefinition> {
        names.iter().map(|n| ModuleDefinition::new(format!("/mods/{n}"))).collect()
    }

    fn names(defs: &[ModuleDefinition]) -> Vec<String> {
        defs.iter().map(ModuleDefinition::resource_name).collect()
    }

    #[test]
    fn priority_prefixes_sort_first_in_list_order() {
        let priority = vec!["core-".to_string(), "log".to_string()];
        let sorted = ModuleRegistry::sort_definitions(
            defs(&["zeta", "logging", "core-b", "alpha", "core-a"]),
            &priority,
        );
        assert_eq!(names(&sorted), vec!["core-b", "core-a", "logging", "alpha", "zeta"]);
    }

    #[test]
    fn priority_header_overrides_resource_name() {
        let mut input = defs(&["alpha", "beta"]);
        input[1] = input[1].clone().header(MODULE_PRIORITY, "boot-beta");
        let sorted = ModuleRegistry::sort_definitions(input, &["boot".to_string()]);
        assert_eq!(names(&sorted), vec!["beta", "alpha"]);
    }

    #[test]
    fn overlapping_prefixes_are_reported() {
        let priority = vec!["core".to_string(), "db".to_string(), "core-net".to_string()];
        assert_eq!(
            ModuleRegistry::overlapping_prefixes(&priority),
            vec![("core".to_string(), "core-net".to_string())]
        );
        assert!(ModuleRegistry::overlapping_prefixes(&["a".into(), "b".into()]).is_empty());
    }

    #[test]
    fn failing_system_activator_is_fatal() {
        struct Broken;
        impl Activator for Broken {
            fn start(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
                anyhow::bail!("no")
            }
        }
        let err = ModuleRegistry::new(
            ServiceRegistry::standalone(),
            Arc::new(MapActivatorFactory::new()),
            Some(Arc::new(Broken)),
        )
        .unwrap_err();
        assert!(matches!(err, LifecycleError::Start { module: 0, .. }));
    }

    #[test]
    fn unknown_activator_marks_module_failed() {
        let reg = ModuleRegistry::new(
            ServiceRegistry::standalone(),
            Arc::new(MapActivatorFactory::new()),
            None,
        )
        .unwrap();
        let m = reg
            .install(ModuleDefinition::new("x").header(crate::module::MODULE_ACTIVATOR, "nope"))
            .unwrap();
        assert!(matches!(reg.start(&m), Err(LifecycleError::Activator { .. })));
        assert_eq!(m.state(), ModuleState::Uninstalled);
        assert!(m.failure().is_some_and(|f| f.contains("nope")));
        assert!(reg.get(m.id()).is_some());
    }

    #[test]
    fn restart_after_stop() {
        let reg = ModuleRegistry::new(
            ServiceRegistry::standalone(),
            Arc::new(MapActivatorFactory::new()),
            None,
        )
        .unwrap();
        let m = reg.install(ModuleDefinition::new("plain")).unwrap();
        assert_eq!(m.id(), 1);
        reg.start(&m).unwrap();
        assert!(reg.start(&m).is_err());
        reg.stop(&m).unwrap();
        assert_eq!(m.state(), ModuleState::Stopped);
        reg.start(&m).unwrap();
        assert_eq!(m.state(), ModuleState::Active);
        reg.shutdown();
        assert_eq!(m.state(), ModuleState::Uninstalled);
        assert!(reg.modules().is_empty());
    }
}
