//! Tests for debounced methods on a manual clock.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use horizon_declare::{Class, ClassBuilder, Debounce, Instance, MainContext, Trigger, TypeRegistry, Value};

type CallLog = Rc<RefCell<Vec<Vec<Value>>>>;

fn search_class(types: &TypeRegistry, trigger: Trigger) -> (Class, CallLog) {
    let calls: CallLog = Rc::default();
    let log = calls.clone();
    let class = ClassBuilder::new(types, "SearchBox")
        .debounce("search", Debounce::millis(100).trigger(trigger), move |_, args| {
            log.borrow_mut().push(args.to_vec());
        })
        .finalize()
        .unwrap();
    (class, calls)
}

fn search(instance: &Instance, n: i32) {
    assert_eq!(instance.call("search", &[Value::Int(n)]).unwrap(), None);
}

#[test]
fn test_trailing_collapses_burst() {
    let types = TypeRegistry::new();
    let (class, calls) = search_class(&types, Trigger::Trailing);
    let context = MainContext::manual();
    let instance = class.new_instance(&context).unwrap();

    for n in 1..=5 {
        search(&instance, n);
        context.advance(Duration::from_millis(10));
    }
    assert!(calls.borrow().is_empty());

    context.advance(Duration::from_millis(100));
    assert_eq!(*calls.borrow(), vec![vec![Value::Int(5)]]);
}

#[test]
fn test_leading_runs_first_call_only() {
    let types = TypeRegistry::new();
    let (class, calls) = search_class(&types, Trigger::Leading);
    let context = MainContext::manual();
    let instance = class.new_instance(&context).unwrap();

    search(&instance, 1);
    assert_eq!(*calls.borrow(), vec![vec![Value::Int(1)]]);
    context.advance(Duration::from_millis(10));
    search(&instance, 2);

    context.advance(Duration::from_millis(200));
    assert_eq!(*calls.borrow(), vec![vec![Value::Int(1)]]);

    // A new burst starts once the timer has fired.
    search(&instance, 3);
    assert_eq!(calls.borrow().len(), 2);
}

#[test]
fn test_leading_trailing_runs_twice() {
    let types = TypeRegistry::new();
    let (class, calls) = search_class(&types, Trigger::LeadingTrailing);
    let context = MainContext::manual();
    let instance = class.new_instance(&context).unwrap();

    search(&instance, 1);
    context.advance(Duration::from_millis(10));
    search(&instance, 2);
    assert_eq!(*calls.borrow(), vec![vec![Value::Int(1)]]);

    context.advance(Duration::from_millis(100));
    assert_eq!(
        *calls.borrow(),
        vec![vec![Value::Int(1)], vec![Value::Int(2)]]
    );
}

#[test]
fn test_leading_trailing_single_call_runs_once() {
    let types = TypeRegistry::new();
    let (class, calls) = search_class(&types, Trigger::LeadingTrailing);
    let context = MainContext::manual();
    let instance = class.new_instance(&context).unwrap();

    search(&instance, 1);
    context.advance(Duration::from_millis(200));
    assert_eq!(*calls.borrow(), vec![vec![Value::Int(1)]]);
}

#[test]
fn test_every_call_reschedules_timer() {
    let types = TypeRegistry::new();
    let (class, calls) = search_class(&types, Trigger::Trailing);
    let context = MainContext::manual();
    let instance = class.new_instance(&context).unwrap();

    search(&instance, 1);
    context.advance(Duration::from_millis(90));
    search(&instance, 2);
    context.advance(Duration::from_millis(90));
    assert!(calls.borrow().is_empty());
    assert_eq!(context.source_count(), 1);

    context.advance(Duration::from_millis(10));
    assert_eq!(*calls.borrow(), vec![vec![Value::Int(2)]]);
    assert_eq!(context.source_count(), 0);
}

#[test]
fn test_state_is_per_instance_and_per_method() {
    let types = TypeRegistry::new();
    let calls: CallLog = Rc::default();
    let search_log = calls.clone();
    let save_log = calls.clone();
    let class = ClassBuilder::new(&types, "Form")
        .debounce("search", Debounce::millis(100), move |_, args| {
            search_log.borrow_mut().push(args.to_vec());
        })
        .debounce("save", Debounce::millis(100), move |instance, _| {
            save_log.borrow_mut().push(vec![Value::from(instance.to_string())]);
        })
        .finalize()
        .unwrap();
    let context = MainContext::manual();
    let first = class.new_instance(&context).unwrap();
    let second = class.new_instance(&context).unwrap();

    search(&first, 1);
    search(&second, 2);
    first.call("save", &[]).unwrap();
    context.advance(Duration::from_millis(100));

    let calls = calls.borrow();
    assert_eq!(calls.len(), 3);
    assert!(calls.contains(&vec![Value::Int(1)]));
    assert!(calls.contains(&vec![Value::Int(2)]));
    assert!(calls.contains(&vec![Value::from(first.to_string())]));
}

#[test]
fn test_dispose_cancels_pending_call() {
    let types = TypeRegistry::new();
    let (class, calls) = search_class(&types, Trigger::Trailing);
    let context = MainContext::manual();
    let instance = class.new_instance(&context).unwrap();

    search(&instance, 1);
    instance.dispose();
    context.advance(Duration::from_millis(200));
    assert!(calls.borrow().is_empty());
    assert_eq!(context.source_count(), 0);
}

#[test]
fn test_finished_burst_releases_arguments() {
    for trigger in [Trigger::Leading, Trigger::Trailing, Trigger::LeadingTrailing] {
        let types = TypeRegistry::new();
        let class = ClassBuilder::new(&types, "Poker")
            .debounce("poke", Debounce::millis(100).trigger(trigger), |_, _| {})
            .finalize()
            .unwrap();
        let context = MainContext::manual();
        let instance = class.new_instance(&context).unwrap();

        for _ in 0..2 {
            instance.call("poke", &[Value::from(instance.clone())]).unwrap();
        }
        context.advance(Duration::from_millis(200));

        let weak = instance.downgrade();
        drop(instance);
        assert!(weak.upgrade().is_none(), "{trigger} kept the instance alive");
    }
}
