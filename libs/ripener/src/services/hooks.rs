use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::contracts::{EventListenerHook, FindContext, FindHook};
use crate::module::{Module, SYSTEM_MODULE_ID};

use super::{ListenerId, ServiceEvent, ServiceReference};

pub const FIND_HOOK: &str = "ripener.hooks.FindHook";
pub const EVENT_LISTENER_HOOK: &str = "ripener.hooks.EventListenerHook";

pub(crate) fn is_hook_interface(name: &str) -> bool {
    name == FIND_HOOK || name == EVENT_LISTENER_HOOK
}

pub(crate) fn is_hook_service(reference: &ServiceReference) -> bool {
    reference.interfaces().iter().any(|i| is_hook_interface(i))
}

/// One candidate listener as exposed to event listener hooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerInfo {
    pub id: ListenerId,
    pub module: u64,
    pub filter: Option<String>,
}

/// Candidate recipients of one service event, grouped by consumer module.
///
/// Hooks can only drop whole modules. The system module cannot be dropped.
#[derive(Clone, Debug, Default)]
pub struct ShrinkableListeners {
    groups: BTreeMap<u64, Vec<ListenerInfo>>,
}

impl ShrinkableListeners {
    pub(crate) fn new(groups: BTreeMap<u64, Vec<ListenerInfo>>) -> Self {
        Self { groups }
    }

    pub fn modules(&self) -> impl Iterator<Item = u64> + '_ {
        self.groups.keys().copied()
    }

    pub fn listeners(&self, module: u64) -> &[ListenerInfo] {
        self.groups.get(&module).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Suppress delivery to every listener of `module` for this event.
    pub fn remove(&mut self, module: u64) -> bool {
        if module == SYSTEM_MODULE_ID {
            return false;
        }
        self.groups.remove(&module).is_some()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(u64, &[ListenerInfo]) -> bool) {
        self.groups
            .retain(|module, infos| *module == SYSTEM_MODULE_ID || keep(*module, infos));
    }

    pub(crate) fn contains(&self, module: u64) -> bool {
        self.groups.contains_key(&module)
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run find hooks over `references`, letting each one only remove entries.
pub(crate) fn run_find_hooks(
    hooks: &[(ServiceReference, Arc<dyn FindHook>)],
    ctx: &FindContext<'_>,
    references: &mut Vec<ServiceReference>,
) {
    for (hook_ref, hook) in hooks {
        if references.is_empty() {
            return;
        }
        let mut edited = references.clone();
        match catch_unwind(AssertUnwindSafe(|| hook.find(ctx, &mut edited))) {
            Ok(Ok(())) => {
                let kept: HashSet<u64> = edited.iter().map(ServiceReference::id).collect();
                references.retain(|r| kept.contains(&r.id()));
            }
            Ok(Err(e)) => {
                tracing::warn!(hook = hook_ref.id(), error = %e, "Find hook failed");
            }
            Err(panic) => {
                tracing::error!(
                    hook = hook_ref.id(),
                    panic = %panic_message(panic.as_ref()),
                    "Find hook panicked"
                );
            }
        }
    }
}

pub(crate) fn run_find_module_hooks(
    hooks: &[(ServiceReference, Arc<dyn FindHook>)],
    consumer: &Module,
    modules: &mut Vec<Arc<Module>>,
) {
    for (hook_ref, hook) in hooks {
        if modules.is_empty() {
            return;
        }
        let mut edited = modules.clone();
        match catch_unwind(AssertUnwindSafe(|| hook.find_modules(consumer, &mut edited))) {
            Ok(Ok(())) => {
                let kept: HashSet<u64> = edited.iter().map(|m| m.id()).collect();
                modules.retain(|m| kept.contains(&m.id()));
            }
            Ok(Err(e)) => {
                tracing::warn!(hook = hook_ref.id(), error = %e, "Module find hook failed");
            }
            Err(panic) => {
                tracing::error!(
                    hook = hook_ref.id(),
                    panic = %panic_message(panic.as_ref()),
                    "Module find hook panicked"
                );
            }
        }
    }
}

pub(crate) fn run_event_hooks(
    hooks: &[(ServiceReference, Arc<dyn EventListenerHook>)],
    event: &ServiceEvent,
    listeners: &mut ShrinkableListeners,
) {
    for (hook_ref, hook) in hooks {
        let mut edited = listeners.clone();
        match catch_unwind(AssertUnwindSafe(|| hook.event(event, &mut edited))) {
            Ok(Ok(())) => {
                listeners.groups.retain(|module, _| edited.contains(*module));
            }
            Ok(Err(e)) => {
                tracing::warn!(hook = hook_ref.id(), error = %e, "Event listener hook failed");
            }
            Err(panic) => {
                tracing::error!(
                    hook = hook_ref.id(),
                    panic = %panic_message(panic.as_ref()),
                    "Event listener hook panicked"
                );
            }
        }
    }
}
