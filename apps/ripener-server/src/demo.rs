//! Built-in demo activators, registered through the inventory.

use std::sync::Arc;

use parking_lot::RwLock;
use ripener::properties::SERVICE_PID;
use ripener::{
    Activator, ActivatorRegistration, ManagedService, ModuleContext, ModuleEvent, Properties,
    ServiceEvent, ServiceEventKind, ServiceObject, ServiceReference,
};

pub const GREETER_ACTIVATOR: &str = "ripener.demo.greeter";
pub const AUDIT_ACTIVATOR: &str = "ripener.demo.audit";
pub const GREETER_SERVICE: &str = "demo.Greeter";
pub const GREETER_PID: &str = "demo.greeter";

/// Greets in the language from its `demo.greeter` configuration.
pub struct Greeter {
    lang: RwLock<String>,
}

impl Greeter {
    pub fn new(lang: impl Into<String>) -> Self {
        Self {
            lang: RwLock::new(lang.into()),
        }
    }

    pub fn lang(&self) -> String {
        self.lang.read().clone()
    }

    pub fn greet(&self, name: &str) -> String {
        let hello = match self.lang.read().as_str() {
            "fr" => "Bonjour",
            "de" => "Hallo",
            _ => "Hello",
        };
        format!("{hello}, {name}!")
    }
}

impl ManagedService for Greeter {
    fn updated(&self, properties: &Properties) -> anyhow::Result<()> {
        if let Some(lang) = properties.get_str("lang") {
            *self.lang.write() = lang.to_string();
            tracing::info!(lang, "Greeter language set");
        }
        Ok(())
    }
}

struct GreeterActivator;

impl Activator for GreeterActivator {
    fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        let greeter = Arc::new(Greeter::new("en"));
        ctx.register_managed_service(
            &[GREETER_SERVICE],
            ServiceObject::Singleton(Arc::clone(&greeter) as _),
            Properties::new()
                .with(SERVICE_PID, GREETER_PID)
                .with("lang", "en"),
            greeter,
        )?;
        Ok(())
    }
}

/// Logs every service and module event, and greets each greeter it sees.
struct AuditActivator;

impl Activator for AuditActivator {
    fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        ctx.add_service_listener(None, |ev: &ServiceEvent| {
            tracing::info!(
                kind = ?ev.kind,
                service.id = ev.reference.id(),
                interfaces = ?ev.reference.interfaces(),
                owner = ev.reference.owner().id(),
                "Service event"
            );
        })?;
        ctx.add_module_listener(|ev: &ModuleEvent| {
            tracing::info!(
                kind = ?ev.kind,
                module = ev.module.id(),
                name = ev.module.symbolic_name(),
                "Module event"
            );
        })?;

        let lookup = ctx.clone();
        let filter = format!("(objectClass={GREETER_SERVICE})");
        ctx.add_service_listener(Some(&filter), move |ev: &ServiceEvent| {
            if ev.kind == ServiceEventKind::Registered {
                greet(&lookup, &ev.reference);
            }
        })?;
        for reference in ctx.get_service_references(Some(GREETER_SERVICE), None)? {
            greet(ctx, &reference);
        }
        Ok(())
    }
}

fn greet(ctx: &ModuleContext, reference: &ServiceReference) {
    match ctx.get_service_as::<Greeter>(reference) {
        Ok(Some(greeter)) => {
            tracing::info!(greeting = %greeter.greet("audit"), "Greeter available");
            ctx.unget_service(reference);
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "Greeter lookup failed"),
    }
}

ripener::inventory::submit! {
    ActivatorRegistration::new(GREETER_ACTIVATOR, || Box::new(GreeterActivator))
}

ripener::inventory::submit! {
    ActivatorRegistration::new(AUDIT_ACTIVATOR, || Box::new(AuditActivator))
}
