//! Tests for awaiting signals as futures.

use std::cell::RefCell;
use std::rc::Rc;

use futures_util::FutureExt;

use horizon_declare::{
    BridgeError, Class, ClassBuilder, MainContext, PropertyOptions, SignalError, SignalSpec, TypeRegistry, Value,
    ValueType, await_event,
};

fn job_class(types: &TypeRegistry) -> Class {
    ClassBuilder::new(types, "Job")
        .signal("done", SignalSpec::new().params([ValueType::Int, ValueType::Int]))
        .signal("failed", SignalSpec::new().param(ValueType::String))
        .finalize()
        .unwrap()
}

#[test]
fn test_resolves_with_arguments() {
    let types = TypeRegistry::new();
    let context = MainContext::manual();
    let job = job_class(&types).new_instance(&context).unwrap();

    let future = await_event(&job, "done", Some("failed")).unwrap();
    let result = Rc::new(RefCell::new(None));
    let slot = result.clone();
    context.spawn_local(async move {
        *slot.borrow_mut() = Some(future.await);
    });

    context.run_until_idle();
    assert!(result.borrow().is_none());

    job.emit("done", &[Value::Int(1), Value::Int(2)]).unwrap();
    context.run_until_idle();
    assert_eq!(
        result.borrow().clone(),
        Some(Ok(vec![Value::Int(1), Value::Int(2)]))
    );
}

#[test]
fn test_rejects_with_message() {
    let types = TypeRegistry::new();
    let context = MainContext::manual();
    let job = job_class(&types).new_instance(&context).unwrap();

    let future = await_event(&job, "done", Some("failed")).unwrap();
    job.emit("failed", &[Value::from("boom")]).unwrap();

    let err = future.now_or_never().unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::Rejected { ref signal, .. } if signal == "failed"));
    assert!(err.to_string().contains("boom"));
    assert_eq!(
        err.to_string(),
        "Rejection signal: 'failed' triggered with args: [boom]"
    );
}

#[test]
fn test_settles_once_and_disconnects() {
    let types = TypeRegistry::new();
    let context = MainContext::manual();
    let job = job_class(&types).new_instance(&context).unwrap();
    assert_eq!(job.handler_count(), 0);

    let future = await_event(&job, "done", Some("failed")).unwrap();
    assert_eq!(job.handler_count(), 2);

    job.emit("done", &[Value::Int(3), Value::Int(4)]).unwrap();
    assert_eq!(job.handler_count(), 0);
    job.emit("failed", &[Value::from("late")]).unwrap();

    assert_eq!(
        future.now_or_never(),
        Some(Ok(vec![Value::Int(3), Value::Int(4)]))
    );
}

#[test]
fn test_pending_without_emission() {
    let types = TypeRegistry::new();
    let context = MainContext::manual();
    let job = job_class(&types).new_instance(&context).unwrap();

    let mut future = await_event(&job, "done", None).unwrap();
    assert!((&mut future).now_or_never().is_none());
    assert_eq!(job.handler_count(), 1);
}

#[test]
fn test_unknown_signal_fails_immediately() {
    let types = TypeRegistry::new();
    let context = MainContext::manual();
    let job = job_class(&types).new_instance(&context).unwrap();

    assert!(matches!(
        await_event(&job, "finished", None),
        Err(SignalError::UnknownSignal { .. })
    ));
    assert!(matches!(
        await_event(&job, "done", Some("crashed")),
        Err(SignalError::UnknownSignal { .. })
    ));
    assert_eq!(job.handler_count(), 0);
}

#[test]
fn test_abandoned_on_dispose() {
    let types = TypeRegistry::new();
    let context = MainContext::manual();
    let job = job_class(&types).new_instance(&context).unwrap();

    let future = await_event(&job, "done", Some("failed")).unwrap();
    job.dispose();
    assert_eq!(future.now_or_never(), Some(Err(BridgeError::Abandoned)));
}

#[test]
fn test_abandoned_on_drop() {
    let types = TypeRegistry::new();
    let context = MainContext::manual();
    let job = job_class(&types).new_instance(&context).unwrap();

    let future = await_event(&job, "done", None).unwrap();
    drop(job);
    assert_eq!(future.now_or_never(), Some(Err(BridgeError::Abandoned)));
}

#[test]
fn test_notify_can_be_awaited() {
    let types = TypeRegistry::new();
    let context = MainContext::manual();
    let class = ClassBuilder::new(&types, "Download")
        .property("progress_value", "double", PropertyOptions::new().max(1.0))
        .unwrap()
        .finalize()
        .unwrap();
    let download = class.new_instance(&context).unwrap();

    let future = await_event(&download, "notify::progress_value", None).unwrap();
    download.set_property("progress_value", 0.5).unwrap();
    assert_eq!(
        future.now_or_never(),
        Some(Ok(vec![Value::from("progress-value")]))
    );
}
