//! Runtime facade: boot, management operations and shutdown.
//!
//! Boot order: system module → event admin → discovery → priority sort →
//! install all → start all. Shutdown stops modules in descending id order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::context::ModuleContext;
use crate::contracts::{
    Activator, ActivatorFactory, ConfigurationSource, Discovery, HeaderTypeSpace,
    InventoryActivatorFactory, StaticConfiguration, StaticDiscovery, TypeSpace,
};
use crate::events::{EventAdmin, EventDispatch, EVENT_ADMIN};
use crate::module::{Module, ModuleDefinition, ModuleState};
use crate::properties::Properties;
use crate::registry::{LifecycleError, ModuleRegistry};
use crate::services::{ServiceObject, ServiceRegistry};
use crate::wiring::{Requirement, Wire, Wiring, WiringError};

use super::RuntimeError;

/// Runtime policy knobs, usually read from the `runtime` config section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name prefixes started first, in list order.
    pub priority: Vec<String>,
    /// Register the event admin under module 0.
    pub event_admin: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            priority: Vec::new(),
            event_admin: true,
        }
    }
}

/// Collaborators and policy for one runtime instance.
pub struct RunOptions {
    pub config: RuntimeConfig,
    pub discovery: Arc<dyn Discovery>,
    pub activators: Arc<dyn ActivatorFactory>,
    pub configuration: Arc<dyn ConfigurationSource>,
    pub types: Arc<dyn TypeSpace>,
    /// Runs as module 0's activator; a failure aborts the boot.
    pub system_activator: Option<Arc<dyn Activator>>,
    /// Replaces the registry-backed event dispatch.
    pub event_sink: Option<EventDispatch>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            discovery: Arc::new(StaticDiscovery::default()),
            activators: Arc::new(InventoryActivatorFactory),
            configuration: Arc::new(StaticConfiguration::default()),
            types: Arc::new(HeaderTypeSpace),
            system_activator: None,
            event_sink: None,
        }
    }
}

impl RunOptions {
    pub fn with_definitions(mut self, definitions: Vec<ModuleDefinition>) -> Self {
        self.discovery = Arc::new(StaticDiscovery(definitions));
        self
    }

    pub fn with_activators(mut self, activators: impl ActivatorFactory + 'static) -> Self {
        self.activators = Arc::new(activators);
        self
    }
}

/// A running module host. Dropping it stops everything.
pub struct Runtime {
    modules: ModuleRegistry,
    event_admin: Mutex<Option<Arc<EventAdmin>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("modules", &self.modules)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Runtime {
    /// Boot the runtime. Only a failure of module 0 or of discovery is fatal;
    /// other modules that fail to install or start are logged and skipped.
    pub fn start(opts: RunOptions) -> Result<Self, RuntimeError> {
        let RunOptions {
            config,
            discovery,
            activators,
            configuration,
            types,
            system_activator,
            event_sink,
        } = opts;

        tracing::info!("Phase: system");
        let services = ServiceRegistry::new(configuration, types);
        let modules = ModuleRegistry::new(Arc::clone(&services), activators, system_activator)
            .map_err(RuntimeError::SystemModule)?;

        let event_admin = if config.event_admin {
            let admin = match event_sink {
                Some(sink) => EventAdmin::spawn(sink),
                None => EventAdmin::for_registry(&services, modules.system_module()),
            };
            services.register(
                modules.system_module(),
                &[EVENT_ADMIN],
                ServiceObject::Singleton(Arc::clone(&admin) as _),
                Properties::new(),
            )?;
            Some(admin)
        } else {
            None
        };

        let runtime = Self {
            modules,
            event_admin: Mutex::new(event_admin),
            stopped: AtomicBool::new(false),
        };

        tracing::info!("Phase: discovery");
        for (a, b) in ModuleRegistry::overlapping_prefixes(&config.priority) {
            tracing::warn!(first = %a, second = %b, "Overlapping priority prefixes; first match wins");
        }
        let definitions = discovery.discover().map_err(RuntimeError::Discovery)?;
        let definitions = ModuleRegistry::sort_definitions(definitions, &config.priority);

        tracing::info!(modules = definitions.len(), "Phase: install");
        let mut installed = Vec::with_capacity(definitions.len());
        for definition in definitions {
            match runtime.modules.install(definition) {
                Ok(m) => installed.push(m),
                Err(e) => tracing::error!(error = %e, "Module install failed; skipping"),
            }
        }

        tracing::info!("Phase: start");
        let mut failed = 0usize;
        for module in &installed {
            if let Err(e) = runtime.modules.start(module) {
                failed += 1;
                tracing::error!(module = module.id(), error = %e, "Module start failed; continuing");
            }
        }
        tracing::info!(
            started = installed.len() - failed,
            failed,
            "Runtime started"
        );
        Ok(runtime)
    }

    /// Stop all modules and clear the registry. Later calls are no-ops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Phase: stop");
        self.modules.shutdown();
        self.event_admin.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), RuntimeError> {
        if self.is_stopped() {
            Err(RuntimeError::NotRunning)
        } else {
            Ok(())
        }
    }

    fn require(&self, id: u64) -> Result<Arc<Module>, RuntimeError> {
        self.modules
            .get(id)
            .ok_or(RuntimeError::Lifecycle(LifecycleError::UnknownModule(id)))
    }

    /// Context of module 0, for framework-owned services and lookups that
    /// bypass hooks.
    pub fn system_context(&self) -> ModuleContext {
        self.modules.context(self.modules.system_module())
    }

    /// Context of any module, valid while it is starting, active or stopping.
    pub fn context(&self, id: u64) -> Result<ModuleContext, RuntimeError> {
        Ok(self.modules.context(&self.require(id)?))
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        self.modules.services()
    }

    pub fn event_admin(&self) -> Option<Arc<EventAdmin>> {
        self.event_admin.lock().clone()
    }

    pub fn module(&self, id: u64) -> Option<Arc<Module>> {
        self.modules.get(id)
    }

    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules.modules()
    }

    pub fn module_by_name(&self, symbolic_name: &str) -> Option<Arc<Module>> {
        self.modules
            .modules()
            .into_iter()
            .find(|m| m.symbolic_name() == symbolic_name)
    }

    pub fn install(&self, definition: ModuleDefinition) -> Result<Arc<Module>, RuntimeError> {
        self.ensure_running()?;
        Ok(self.modules.install(definition)?)
    }

    pub fn start_module(&self, id: u64) -> Result<(), RuntimeError> {
        self.ensure_running()?;
        let module = self.require(id)?;
        Ok(self.modules.start(&module)?)
    }

    pub fn stop_module(&self, id: u64) -> Result<(), RuntimeError> {
        self.ensure_running()?;
        let module = self.require(id)?;
        if module.is_system() {
            return Err(RuntimeError::Lifecycle(LifecycleError::InvalidState {
                module: id,
                state: module.state(),
                target: ModuleState::Stopped,
            }));
        }
        Ok(self.modules.stop(&module)?)
    }

    pub fn uninstall_module(&self, id: u64) -> Result<(), RuntimeError> {
        self.ensure_running()?;
        let module = self.require(id)?;
        Ok(self.modules.uninstall(&module)?)
    }

    pub fn module_wiring(&self, id: u64) -> Result<Wiring, RuntimeError> {
        let module = self.require(id)?;
        Ok(self.modules.wiring(&module)?)
    }

    pub fn resolve_wire(&self, requirer: u64, requirement: &Requirement) -> Result<Wire, RuntimeError> {
        let module = self
            .modules
            .get(requirer)
            .ok_or(WiringError::UnknownModule(requirer))?;
        Ok(self.modules.resolve_wire(&module, requirement)?)
    }

    /// Push changed configuration for `pid` to live registrations.
    pub fn update_configuration(&self, pid: &str) -> Result<usize, RuntimeError> {
        self.ensure_running()?;
        Ok(self.services().refresh_configuration(pid))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
