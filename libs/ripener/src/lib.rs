//! # ripener - dynamic module runtime
//!
//! Hosts independently started and stopped modules that publish and consume
//! services through a shared registry, with dependency wires computed from
//! declared capabilities and requirements.
//!
//! ## Pieces
//!
//! - [`Filter`]: LDAP-style queries over [`Properties`]
//! - [`Module`] and [`ModuleContext`]: the lifecycle unit and its view of the runtime
//! - [`ServiceRegistry`]: registrations, scoped instances, listeners, hooks
//! - [`wiring`]: best-effort capability resolution, lowest module id wins
//! - [`Runtime`]: boot, management and shutdown; [`run`] for async hosts
//!
//! ## Example
//!
//! ```rust,ignore
//! use ripener::{Activator, ModuleContext, Properties};
//!
//! struct Greeter;
//!
//! impl Activator for Greeter {
//!     fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
//!         ctx.register_value(&["demo.Greeter"], "hello", Properties::new().with("lang", "en"))?;
//!         Ok(())
//!     }
//! }
//!
//! inventory::submit! {
//!     ripener::ActivatorRegistration::new("demo.greeter", || Box::new(Greeter))
//! }
//! ```

pub mod context;
pub mod contracts;
pub mod events;
pub mod filter;
pub mod module;
pub mod properties;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod version;
pub mod wiring;

pub use context::ModuleContext;
pub use contracts::{
    Activator, ActivatorFactory, ActivatorRegistration, ConfigurationSource, Discovery,
    EventHandler, EventListenerHook, FindContext, FindHook, HeaderTypeSpace,
    InventoryActivatorFactory, ManagedService, MapActivatorFactory, ServiceFactory,
    StaticConfiguration, StaticDiscovery, TypeSpace,
};
pub use events::{Event, EventAdmin};
pub use filter::{Filter, FilterError, FilterErrorKind};
pub use module::{Module, ModuleDefinition, ModuleEvent, ModuleEventKind, ModuleState};
pub use properties::{Properties, PropertyValue};
pub use registry::{LifecycleError, ModuleRegistry};
pub use runtime::{run, RunOptions, Runtime, RuntimeConfig, RuntimeError, ShutdownOptions};
pub use services::{
    ListenerId, Scope, ServiceError, ServiceEvent, ServiceEventKind, ServiceInstance,
    ServiceObject, ServiceReference, ServiceRegistration, ServiceRegistry,
};
pub use version::Version;
pub use wiring::{Capability, Requirement, Wire, Wiring, WiringError};

// Re-export inventory so activator crates can submit registrations.
pub use inventory;
