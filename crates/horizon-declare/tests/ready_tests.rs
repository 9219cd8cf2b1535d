//! Tests for deferred `ready` callbacks and instance teardown.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Write as _};
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};

use horizon_declare::{ClassBuilder, MainContext, PropertyOptions, ReadyError, TypeRegistry, Value};

/// Collects the fields of every `error` event.
#[derive(Clone, Default)]
struct ErrorLog(Arc<Mutex<Vec<String>>>);

struct FieldWriter(String);

impl Visit for FieldWriter {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let _ = write!(self.0, "{}={:?} ", field.name(), value);
    }
}

impl<S: Subscriber> Layer<S> for ErrorLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            let mut writer = FieldWriter(String::new());
            event.record(&mut writer);
            self.0.lock().push(writer.0);
        }
    }
}

#[test]
fn test_ready_runs_on_next_iteration() {
    let types = TypeRegistry::new();
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let class = ClassBuilder::new(&types, "Editor")
        .ready(move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .finalize()
        .unwrap();
    let context = MainContext::manual();
    let instance = class.new_instance(&context).unwrap();

    assert_eq!(calls.get(), 0);
    assert_eq!(instance.pending_ready_count(), 1);

    context.run_until_idle();
    assert_eq!(calls.get(), 1);
    assert_eq!(instance.pending_ready_count(), 0);

    context.run_until_idle();
    assert_eq!(calls.get(), 1);
}

#[test]
fn test_ready_sees_constructed_state() {
    let types = TypeRegistry::new();
    let seen = Rc::new(RefCell::new(None));
    let slot = seen.clone();
    let class = ClassBuilder::new(&types, "Editor")
        .property("path", "string", PropertyOptions::new())
        .unwrap()
        .ready(move |instance| {
            *slot.borrow_mut() = Some(instance.property("path")?);
            Ok(())
        })
        .finalize()
        .unwrap();
    let context = MainContext::manual();
    let _instance = class
        .construct(&context)
        .property("path", "/tmp/notes.txt")
        .build()
        .unwrap();

    context.run_until_idle();
    assert_eq!(seen.borrow().clone(), Some(Value::from("/tmp/notes.txt")));
}

#[test]
fn test_ready_chain_runs_root_first() {
    let types = TypeRegistry::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    let base_log = order.clone();
    let base = ClassBuilder::new(&types, "Base")
        .ready(move |_| {
            base_log.borrow_mut().push("base");
            Ok(())
        })
        .finalize()
        .unwrap();
    let derived_log = order.clone();
    let derived = ClassBuilder::new(&types, "Derived")
        .subclass_of(&base)
        .ready(move |_| {
            derived_log.borrow_mut().push("derived");
            Ok(())
        })
        .finalize()
        .unwrap();

    let context = MainContext::manual();
    let _instance = derived.new_instance(&context).unwrap();
    context.run_until_idle();
    assert_eq!(*order.borrow(), vec!["base", "derived"]);
}

#[test]
fn test_ready_failure_is_logged_not_propagated() {
    let log = ErrorLog::default();
    let subscriber = tracing_subscriber::registry().with(log.clone());

    tracing::subscriber::with_default(subscriber, || {
        let types = TypeRegistry::new();
        let failing = ClassBuilder::new(&types, "Failing")
            .ready(|_| Err(ReadyError::from("boom")))
            .finalize()
            .unwrap();
        let panicking = ClassBuilder::new(&types, "Panicking")
            .ready(|_| panic!("kaboom"))
            .finalize()
            .unwrap();

        let context = MainContext::manual();
        let first = failing.new_instance(&context).unwrap();
        let second = panicking.new_instance(&context).unwrap();
        context.run_until_idle();

        assert!(!first.is_disposed());
        assert!(!second.is_disposed());
    });

    let entries = log.0.lock();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|entry| entry.contains("Failing") && entry.contains("boom")));
    assert!(entries.iter().any(|entry| entry.contains("Panicking") && entry.contains("kaboom")));
    assert!(entries.iter().all(|entry| entry.contains("Error in ready function")));
}

#[test]
fn test_async_ready() {
    let types = TypeRegistry::new();
    let done = Rc::new(Cell::new(false));
    let flag = done.clone();
    let class = ClassBuilder::new(&types, "Loader")
        .ready_async(move |instance| {
            let flag = flag.clone();
            async move {
                assert_eq!(instance.type_name(), "Loader");
                flag.set(true);
                Ok::<(), ReadyError>(())
            }
        })
        .finalize()
        .unwrap();
    let context = MainContext::manual();
    let _instance = class.new_instance(&context).unwrap();

    assert!(!done.get());
    context.run_until_idle();
    assert!(done.get());
    assert_eq!(context.task_count(), 0);
}

#[test]
fn test_async_ready_panic_before_future_is_logged() {
    let log = ErrorLog::default();
    let subscriber = tracing_subscriber::registry().with(log.clone());

    tracing::subscriber::with_default(subscriber, || {
        let types = TypeRegistry::new();
        let fail = true;
        let class = ClassBuilder::new(&types, "Fetcher")
            .ready_async(move |_| {
                if fail {
                    panic!("no connection");
                }
                async move { Ok::<(), ReadyError>(()) }
            })
            .finalize()
            .unwrap();
        let context = MainContext::manual();
        let instance = class.new_instance(&context).unwrap();

        context.run_until_idle();
        assert!(!instance.is_disposed());
        assert_eq!(context.source_count(), 0);
        assert_eq!(context.task_count(), 0);
    });

    let entries = log.0.lock();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].contains("Fetcher") && entries[0].contains("no connection"));
}

#[test]
fn test_dispose_cancels_ready() {
    let types = TypeRegistry::new();
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let class = ClassBuilder::new(&types, "Editor")
        .ready(move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .finalize()
        .unwrap();
    let context = MainContext::manual();
    let instance = class.new_instance(&context).unwrap();

    instance.dispose();
    assert_eq!(instance.pending_ready_count(), 0);
    context.run_until_idle();
    assert_eq!(calls.get(), 0);
    assert_eq!(context.source_count(), 0);
}

#[test]
fn test_dropped_instance_skips_ready() {
    let types = TypeRegistry::new();
    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let class = ClassBuilder::new(&types, "Editor")
        .ready(move |_| {
            counter.set(counter.get() + 1);
            Ok(())
        })
        .finalize()
        .unwrap();
    let context = MainContext::manual();
    let instance = class.new_instance(&context).unwrap();
    let weak = instance.downgrade();
    drop(instance);

    assert!(weak.upgrade().is_none());
    context.run_until_idle();
    assert_eq!(calls.get(), 0);
}
