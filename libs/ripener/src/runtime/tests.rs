use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::context::ModuleContext;
use crate::contracts::{Activator, Discovery, MapActivatorFactory};
use crate::events::{Event, EventAdmin, EVENT_ADMIN};
use crate::module::{ModuleDefinition, ModuleState, MODULE_ACTIVATOR};
use crate::properties::Properties;

struct Counting(Arc<AtomicUsize>, Arc<AtomicUsize>);

impl Activator for Counting {
    fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        ctx.register_value(&["test.Counted"], (), Properties::new())?;
        Ok(())
    }

    fn stop(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        self.1.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn counting_options(started: &Arc<AtomicUsize>, stopped: &Arc<AtomicUsize>) -> RunOptions {
    let (s, t) = (Arc::clone(started), Arc::clone(stopped));
    RunOptions::default()
        .with_definitions(vec![
            ModuleDefinition::new("counted").header(MODULE_ACTIVATOR, "counting")
        ])
        .with_activators(MapActivatorFactory::new().with("counting", move || {
            Ok(Box::new(Counting(Arc::clone(&s), Arc::clone(&t))) as Box<dyn Activator>)
        }))
}

#[test]
fn start_and_stop_are_symmetric() {
    let (started, stopped) = (Arc::default(), Arc::default());
    let runtime = Runtime::start(counting_options(&started, &stopped)).unwrap();
    let module = runtime.module_by_name("counted").unwrap();
    assert_eq!(module.id(), 1);
    assert_eq!(module.state(), ModuleState::Active);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.services().len(), 2, "event admin plus the module's service");

    runtime.stop();
    runtime.stop();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert!(runtime.services().is_empty());
    assert!(runtime.modules().is_empty());
    assert!(matches!(
        runtime.install(ModuleDefinition::new("late")),
        Err(RuntimeError::NotRunning)
    ));
}

#[test]
fn discovery_failure_is_fatal() {
    struct Broken;
    impl Discovery for Broken {
        fn discover(&self) -> anyhow::Result<Vec<ModuleDefinition>> {
            anyhow::bail!("disk on fire")
        }
    }
    let opts = RunOptions {
        discovery: Arc::new(Broken),
        ..RunOptions::default()
    };
    assert!(matches!(Runtime::start(opts), Err(RuntimeError::Discovery(_))));
}

#[test]
fn management_operations() {
    let runtime = Runtime::start(RunOptions::default()).unwrap();
    let m = runtime.install(ModuleDefinition::new("/x/late")).unwrap();
    assert_eq!(m.state(), ModuleState::Created);
    runtime.start_module(m.id()).unwrap();
    runtime.stop_module(m.id()).unwrap();
    runtime.start_module(m.id()).unwrap();
    runtime.uninstall_module(m.id()).unwrap();
    assert!(runtime.module(m.id()).is_none());
    assert_eq!(m.state(), ModuleState::Uninstalled);
    assert!(runtime.stop_module(0).is_err());
    assert!(matches!(
        runtime.start_module(42),
        Err(RuntimeError::Lifecycle(crate::registry::LifecycleError::UnknownModule(42)))
    ));
}

#[test]
fn event_admin_is_a_system_service() {
    let seen = Arc::new(AtomicUsize::new(0));
    let sink_seen = Arc::clone(&seen);
    let opts = RunOptions {
        event_sink: Some(Arc::new(move |_e: &Event| {
            sink_seen.fetch_add(1, Ordering::SeqCst);
        })),
        ..RunOptions::default()
    };
    let runtime = Runtime::start(opts).unwrap();
    let ctx = runtime.system_context();
    let reference = ctx.get_service_reference(EVENT_ADMIN, None).unwrap().unwrap();
    assert_eq!(reference.owner().id(), 0);
    let admin = ctx.get_service_as::<EventAdmin>(&reference).unwrap().unwrap();
    admin.send_event(&Event::new("t/x", Properties::new()));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn event_admin_can_be_disabled() {
    let opts = RunOptions {
        config: RuntimeConfig {
            event_admin: false,
            ..RuntimeConfig::default()
        },
        ..RunOptions::default()
    };
    let runtime = Runtime::start(opts).unwrap();
    assert!(runtime.event_admin().is_none());
    assert!(runtime.services().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn runner_stops_on_token() {
    let (started, stopped) = (Arc::default(), Arc::default());
    let token = CancellationToken::new();
    let handle = tokio::spawn(run(
        counting_options(&started, &stopped),
        ShutdownOptions::Token(token.clone()),
    ));

    for _ in 0..100 {
        if started.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(started.load(Ordering::SeqCst), 1);
    token.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn runner_stops_when_future_completes() {
    let (started, stopped) = (Arc::default(), Arc::default());
    run(
        counting_options(&started, &stopped),
        ShutdownOptions::Future(Box::pin(tokio::time::sleep(Duration::from_millis(50)))),
    )
    .await
    .unwrap();
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
}
