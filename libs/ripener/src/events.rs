//! Topic events forwarded to handler services.
//!
//! `post_event` enqueues onto a single unbounded channel drained by one
//! worker, so events from the same publisher arrive in posting order.
//! `send_event` dispatches on the caller's thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use crate::contracts::EventHandler;
use crate::filter::Filter;
use crate::module::Module;
use crate::properties::Properties;
use crate::services::{panic_message, ServiceRegistry};

/// Interface under which the event admin itself is registered.
pub const EVENT_ADMIN: &str = "ripener.event.EventAdmin";
/// Marker interface for handler services.
pub const EVENT_HANDLER: &str = "ripener.event.EventHandler";
pub const EVENT_TOPICS: &str = "event.topics";
pub const EVENT_FILTER: &str = "event.filter";

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub topic: String,
    pub properties: Properties,
}

impl Event {
    pub fn new(topic: impl Into<String>, properties: Properties) -> Self {
        Self {
            topic: topic.into(),
            properties,
        }
    }
}

/// `a/b` matches only itself; `a/*` matches anything below `a/`; `*` matches all.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix("/*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/')),
        None => pattern == topic,
    }
}

pub type EventDispatch = Arc<dyn Fn(&Event) + Send + Sync>;

pub struct EventAdmin {
    tx: mpsc::UnboundedSender<Event>,
    dispatch: EventDispatch,
}

impl std::fmt::Debug for EventAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventAdmin")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl EventAdmin {
    /// Start the forwarding worker around `dispatch`.
    ///
    /// The worker is a tokio task when called inside a runtime, otherwise a
    /// dedicated thread. It exits once the admin is dropped.
    pub fn spawn(dispatch: EventDispatch) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let worker = Arc::clone(&dispatch);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    while let Some(event) = rx.recv().await {
                        worker(&event);
                    }
                    tracing::debug!("Event forwarder stopped");
                });
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("ripener-events".into())
                    .spawn(move || {
                        while let Some(event) = rx.blocking_recv() {
                            worker(&event);
                        }
                        tracing::debug!("Event forwarder thread stopped");
                    });
                if let Err(e) = spawned {
                    tracing::error!(error = %e, "Failed to spawn event forwarder thread");
                }
            }
        }
        Arc::new(Self { tx, dispatch })
    }

    /// Admin dispatching to handler services registered in `services`.
    pub fn for_registry(services: &Arc<ServiceRegistry>, system: &Arc<Module>) -> Arc<Self> {
        Self::spawn(registry_dispatch(Arc::downgrade(services), Arc::clone(system)))
    }

    /// Queue an event for asynchronous delivery.
    pub fn post_event(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Event forwarder is gone; event dropped");
        }
    }

    /// Deliver an event before returning.
    pub fn send_event(&self, event: &Event) {
        (self.dispatch)(event);
    }
}

/// Dispatch that looks up matching handlers as the system module.
pub fn registry_dispatch(services: Weak<ServiceRegistry>, system: Arc<Module>) -> EventDispatch {
    Arc::new(move |event: &Event| {
        let Some(services) = services.upgrade() else {
            return;
        };
        let lookup = services.get_service_references(&system, Some(EVENT_HANDLER), None, false);
        let references = match lookup {
            Ok(refs) => refs,
            Err(e) => {
                tracing::warn!(error = %e, "Event handler lookup failed");
                return;
            }
        };
        for reference in references {
            let props = reference.properties();
            let subscribed = props.get(EVENT_TOPICS).is_some_and(|topics| {
                topics
                    .values()
                    .iter()
                    .filter_map(|t| t.as_str())
                    .any(|pattern| topic_matches(pattern, &event.topic))
            });
            if !subscribed {
                continue;
            }
            if let Some(src) = props.get_str(EVENT_FILTER) {
                match Filter::parse(src) {
                    Ok(f) if f.matches(&event.properties) => {}
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(service.id = reference.id(), error = %e, "Bad handler filter");
                        continue;
                    }
                }
            }
            let instance = match services.get_service(&reference, &system) {
                Ok(Some(instance)) => instance,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(service.id = reference.id(), error = %e, "Event handler unavailable");
                    continue;
                }
            };
            if let Some(handler) = instance.downcast_ref::<Arc<dyn EventHandler>>() {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))) {
                    tracing::error!(
                        service.id = reference.id(),
                        topic = %event.topic,
                        panic = %panic_message(panic.as_ref()),
                        "Event handler panicked"
                    );
                }
            } else {
                tracing::warn!(service.id = reference.id(), "Service is not an event handler");
            }
            services.unget_service(&reference, &system);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(topic_matches("a/*", "a/b/c"));
        assert!(!topic_matches("a/*", "a"));
        assert!(!topic_matches("a/*", "ab/c"));
        assert!(topic_matches("*", "anything"));
    }

    #[test]
    fn posted_events_keep_order_without_runtime() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let sink = Arc::clone(&seen);
        let admin = EventAdmin::spawn(Arc::new(move |e: &Event| {
            sink.lock().push(e.topic.clone());
            if e.topic == "t/9" {
                let _ = done_tx.send(());
            }
        }));
        for i in 0..10 {
            admin.post_event(Event::new(format!("t/{i}"), Properties::new()));
        }
        done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        let expected: Vec<String> = (0..10).map(|i| format!("t/{i}")).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[tokio::test]
    async fn posted_events_use_tokio_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let admin = EventAdmin::spawn(Arc::new(move |e: &Event| {
            let _ = tx.send(e.topic.clone());
        }));
        admin.post_event(Event::new("x/ping", Properties::new()));
        admin.send_event(&Event::new("x/sync", Properties::new()));
        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec!["x/ping".to_string(), "x/sync".to_string()]);
    }
}
