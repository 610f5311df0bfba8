//! Listener table and synchronous event delivery.
//!
//! Delivery always works on a snapshot: matching listeners are collected
//! under the listener lock, the lock is released, event hooks prune the
//! snapshot, and the callbacks run in registration order. A listener removed
//! after the snapshot was taken is skipped.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::filter::Filter;
use crate::module::{Module, ModuleEvent};
use crate::properties::Properties;

use super::hooks::{panic_message, ListenerInfo};
use super::{ServiceEvent, ServiceEventKind};

pub type ServiceListener = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;
pub type ModuleListener = Arc<dyn Fn(&ModuleEvent) + Send + Sync>;

/// Handle for removing a listener. Ids double as the delivery order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

struct ServiceListenerEntry {
    module: Arc<Module>,
    filter: Option<Filter>,
    callback: ServiceListener,
}

struct ModuleListenerEntry {
    module: Arc<Module>,
    callback: ModuleListener,
}

#[derive(Default)]
pub(crate) struct ListenerTable {
    next_seq: u64,
    service: BTreeMap<u64, ServiceListenerEntry>,
    module: BTreeMap<u64, ModuleListenerEntry>,
}

/// A snapshotted service listener and the event kind it will receive.
pub(crate) struct Pending {
    pub(crate) info: ListenerInfo,
    pub(crate) kind: ServiceEventKind,
    callback: ServiceListener,
}

impl ListenerTable {
    fn next(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(crate) fn add_service(
        &mut self,
        module: Arc<Module>,
        filter: Option<Filter>,
        callback: ServiceListener,
    ) -> ListenerId {
        let seq = self.next();
        self.service.insert(
            seq,
            ServiceListenerEntry {
                module,
                filter,
                callback,
            },
        );
        ListenerId(seq)
    }

    pub(crate) fn add_module(&mut self, module: Arc<Module>, callback: ModuleListener) -> ListenerId {
        let seq = self.next();
        self.module
            .insert(seq, ModuleListenerEntry { module, callback });
        ListenerId(seq)
    }

    /// Remove a listener owned by `module`.
    pub(crate) fn remove(&mut self, module: u64, id: ListenerId) -> bool {
        let owned_service = self
            .service
            .get(&id.0)
            .is_some_and(|e| e.module.id() == module);
        if owned_service {
            return self.service.remove(&id.0).is_some();
        }
        let owned_module = self
            .module
            .get(&id.0)
            .is_some_and(|e| e.module.id() == module);
        owned_module && self.module.remove(&id.0).is_some()
    }

    pub(crate) fn remove_all(&mut self, module: u64) -> usize {
        let before = self.service.len() + self.module.len();
        self.service.retain(|_, e| e.module.id() != module);
        self.module.retain(|_, e| e.module.id() != module);
        before - (self.service.len() + self.module.len())
    }

    pub(crate) fn contains(&self, id: ListenerId) -> bool {
        self.service.contains_key(&id.0) || self.module.contains_key(&id.0)
    }

    /// Collect the listeners an event should reach, grouped by module.
    ///
    /// For `Modified`, a listener that no longer matches but matched the
    /// previous generation gets `ModifiedEndMatch` instead.
    pub(crate) fn snapshot_service(
        &self,
        kind: ServiceEventKind,
        current: &Properties,
        previous: Option<&Properties>,
    ) -> BTreeMap<u64, Vec<Pending>> {
        let mut groups: BTreeMap<u64, Vec<Pending>> = BTreeMap::new();
        for (seq, entry) in &self.service {
            let delivered = match &entry.filter {
                None => Some(kind),
                Some(f) if f.matches(current) => Some(kind),
                Some(f)
                    if kind == ServiceEventKind::Modified
                        && previous.is_some_and(|p| f.matches(p)) =>
                {
                    Some(ServiceEventKind::ModifiedEndMatch)
                }
                Some(_) => None,
            };
            let Some(kind) = delivered else {
                continue;
            };
            let module = entry.module.id();
            groups.entry(module).or_default().push(Pending {
                info: ListenerInfo {
                    id: ListenerId(*seq),
                    module,
                    filter: entry.filter.as_ref().map(ToString::to_string),
                },
                kind,
                callback: Arc::clone(&entry.callback),
            });
        }
        groups
    }

    pub(crate) fn snapshot_module(&self) -> Vec<(ListenerId, u64, ModuleListener)> {
        self.module
            .iter()
            .map(|(seq, e)| (ListenerId(*seq), e.module.id(), Arc::clone(&e.callback)))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.service.len() + self.module.len()
    }
}

/// Invoke one service listener, containing any panic.
pub(crate) fn deliver_service(pending: &Pending, event: &ServiceEvent) {
    let outcome = if pending.kind == event.kind {
        catch_unwind(AssertUnwindSafe(|| (pending.callback)(event)))
    } else {
        let adjusted = ServiceEvent {
            kind: pending.kind,
            reference: event.reference.clone(),
        };
        catch_unwind(AssertUnwindSafe(|| (pending.callback)(&adjusted)))
    };
    if let Err(panic) = outcome {
        tracing::error!(
            listener = %pending.info.id,
            module = pending.info.module,
            service.id = event.reference.id(),
            panic = %panic_message(panic.as_ref()),
            "Service listener panicked"
        );
    }
}

pub(crate) fn deliver_module(id: ListenerId, owner: u64, callback: &ModuleListener, event: &ModuleEvent) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
        tracing::error!(
            listener = %id,
            module = owner,
            subject = event.module.id(),
            panic = %panic_message(panic.as_ref()),
            "Module listener panicked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleDefinition;

    fn module(id: u64) -> Arc<Module> {
        Arc::new(Module::from_definition(id, ModuleDefinition::new(format!("m{id}"))).unwrap())
    }

    fn noop() -> ServiceListener {
        Arc::new(|_| {})
    }

    #[test]
    fn snapshot_groups_by_module_and_tracks_end_match() {
        let mut t = ListenerTable::default();
        let m1 = module(1);
        let m2 = module(2);
        t.add_service(m1.clone(), Some(Filter::parse("(lang=en)").unwrap()), noop());
        t.add_service(m2.clone(), None, noop());
        t.add_service(m1.clone(), Some(Filter::parse("(lang=fr)").unwrap()), noop());

        let old = Properties::new().with("lang", "en");
        let new = Properties::new().with("lang", "de");
        let groups = t.snapshot_service(ServiceEventKind::Modified, &new, Some(&old));

        let m1_kinds: Vec<_> = groups[&1].iter().map(|p| p.kind).collect();
        assert_eq!(m1_kinds, vec![ServiceEventKind::ModifiedEndMatch]);
        assert_eq!(groups[&2][0].kind, ServiceEventKind::Modified);
    }

    #[test]
    fn removal_is_owner_checked() {
        let mut t = ListenerTable::default();
        let m1 = module(1);
        let id = t.add_service(m1.clone(), None, noop());
        t.add_module(m1, Arc::new(|_| {}));
        assert!(!t.remove(2, id));
        assert!(t.remove(1, id));
        assert!(!t.contains(id));
        assert_eq!(t.remove_all(1), 1);
        assert_eq!(t.len(), 0);
    }
}
