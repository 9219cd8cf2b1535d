//! Instances of registered classes.
//!
//! An [`Instance`] is a reference-counted handle. Each instance owns its
//! per-instance state: the property shadow store, raw fields (template
//! children, backing fields), connected signal handlers, debounce timers and
//! actions. Nothing is shared between instances of the same class except the
//! [`Class`] metadata itself.
//!
//! Callbacks that outlive a call (timers, deferred `ready`, action handlers)
//! hold a [`WeakInstance`] so an instance is freed once the last strong
//! handle goes away.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::action::{Action, ActionError, ActionGroup};
use crate::class::{Class, PropertyImpl};
use crate::config::{NotifyPolicy, ObjectEquality};
use crate::debounce::{self, DebounceState};
use crate::logging::targets;
use crate::main_loop::{MainContext, SourceId};
use crate::signal::{
    HandlerFn, HandlerId, HandlerTable, NOTIFY_SIGNAL, SignalError, SignalFlags, SignalSpec, accumulate,
    check_args, parse_detailed,
};
use crate::spec::{SpecError, canonical_name};
use crate::types::TypeHandle;
use crate::value::Value;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Capability of an instance, derived from its class ancestry.
///
/// Decides where declared actions are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    /// Plain object: actions are only reachable through `expose_as`.
    Object,
    /// Widget: actions go into a per-instance group named after the class.
    Widget,
    /// Window: actions are added directly (`win.<name>`).
    Window,
    /// Application: actions are added directly (`app.<name>`), accelerators bound.
    Application,
}

impl InstanceKind {
    /// Prefix of directly attached actions, if the kind has one.
    pub fn action_prefix(self) -> Option<&'static str> {
        match self {
            Self::Window => Some("win"),
            Self::Application => Some("app"),
            Self::Object | Self::Widget => None,
        }
    }
}

/// Errors from property, field and child access.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PropertyError {
    /// No property of that name on the class chain.
    #[error("Property '{property}' is not defined for type '{type_name}'")]
    UnknownProperty {
        /// Type of the instance.
        type_name: String,
        /// Requested property.
        property: String,
    },
    /// The property is read-only.
    #[error("Cannot write to CONSTANT property '{property}' of '{type_name}'")]
    NotWritable {
        /// Type of the instance.
        type_name: String,
        /// The property.
        property: String,
    },
    /// The property can only be set while the instance is being constructed.
    #[error("Property '{property}' of '{type_name}' can only be set at construction")]
    ConstructOnly {
        /// Type of the instance.
        type_name: String,
        /// The property.
        property: String,
    },
    /// The value does not fit the property.
    #[error(transparent)]
    InvalidValue(#[from] SpecError),
    /// No child of that name on the class chain.
    #[error("Child '{child}' is not declared for type '{type_name}'")]
    UnknownChild {
        /// Type of the instance.
        type_name: String,
        /// Requested child.
        child: String,
    },
    /// Template children cannot be replaced.
    #[error("Cannot write to internal child '{0}'")]
    ChildReadOnly(String),
}

/// Errors from calling a declared method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MethodError {
    /// No method of that name on the class chain.
    #[error("Method '{method}' is not defined for type '{type_name}'")]
    UnknownMethod {
        /// Type of the instance.
        type_name: String,
        /// Requested method.
        method: String,
    },
    /// The instance was disposed.
    #[error("Cannot call '{method}' on disposed instance {instance}")]
    Disposed {
        /// Display name of the instance.
        instance: String,
        /// Requested method.
        method: String,
    },
}

pub(crate) struct InstanceInner {
    id: u64,
    class: Class,
    context: MainContext,
    constructing: Cell<bool>,
    disposed: Cell<bool>,
    /// Stored property values, keyed by declared name.
    shadow: RefCell<HashMap<String, Value>>,
    fields: RefCell<HashMap<String, Value>>,
    handlers: RefCell<HandlerTable>,
    debounce: RefCell<HashMap<String, DebounceState>>,
    /// Group holding a widget's declared actions, created on first use.
    own_group: RefCell<Option<ActionGroup>>,
    groups: RefCell<BTreeMap<String, ActionGroup>>,
    actions: RefCell<BTreeMap<String, Action>>,
    accels: RefCell<BTreeMap<String, Vec<String>>>,
    exposed: RefCell<BTreeMap<String, Action>>,
    ready_sources: RefCell<Vec<SourceId>>,
}

/// Handle to an instance of a registered class.
///
/// Cloning is cheap and yields another handle to the same instance.
#[derive(Clone)]
pub struct Instance {
    inner: Rc<InstanceInner>,
}

/// Non-owning handle to an [`Instance`].
#[derive(Clone, Default)]
pub struct WeakInstance {
    inner: Weak<InstanceInner>,
}

impl WeakInstance {
    /// The instance, if it is still alive.
    pub fn upgrade(&self) -> Option<Instance> {
        self.inner.upgrade().map(|inner| Instance { inner })
    }
}

impl fmt::Debug for WeakInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(instance) => write!(f, "WeakInstance({instance})"),
            None => f.write_str("WeakInstance(<dropped>)"),
        }
    }
}

impl Instance {
    pub(crate) fn new(class: Class, context: &MainContext) -> Self {
        Self {
            inner: Rc::new(InstanceInner {
                id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
                class,
                context: context.clone(),
                constructing: Cell::new(true),
                disposed: Cell::new(false),
                shadow: RefCell::new(HashMap::new()),
                fields: RefCell::new(HashMap::new()),
                handlers: RefCell::new(HandlerTable::default()),
                debounce: RefCell::new(HashMap::new()),
                own_group: RefCell::new(None),
                groups: RefCell::new(BTreeMap::new()),
                actions: RefCell::new(BTreeMap::new()),
                accels: RefCell::new(BTreeMap::new()),
                exposed: RefCell::new(BTreeMap::new()),
                ready_sources: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Process-unique instance number.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The instance's class.
    pub fn class(&self) -> &Class {
        &self.inner.class
    }

    /// Registered type name of the instance's class.
    pub fn type_name(&self) -> &str {
        self.inner.class.type_name()
    }

    /// Capability of the instance.
    pub fn kind(&self) -> InstanceKind {
        self.inner.class.kind()
    }

    /// The main context the instance schedules its deferred work on.
    pub fn context(&self) -> &MainContext {
        &self.inner.context
    }

    /// Whether the instance's class is, derives from, or implements `ty`.
    pub fn is_a(&self, ty: TypeHandle) -> bool {
        self.inner.class.is_a(ty)
    }

    /// Whether two handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// A non-owning handle.
    pub fn downgrade(&self) -> WeakInstance {
        WeakInstance {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    pub(crate) fn set_constructing(&self, constructing: bool) {
        self.inner.constructing.set(constructing);
    }

    // Properties

    fn unknown_property(&self, name: &str) -> PropertyError {
        PropertyError::UnknownProperty {
            type_name: self.type_name().to_owned(),
            property: name.to_owned(),
        }
    }

    /// Read a property.
    ///
    /// A stored property that was never written reads as its declared default.
    /// Computed properties delegate to their getter and fall back to the
    /// default when it yields nothing. Hyphenated names are accepted.
    pub fn property(&self, name: &str) -> Result<Value, PropertyError> {
        let entry = self
            .inner
            .class
            .find_property(name)
            .ok_or_else(|| self.unknown_property(name))?;
        let spec = &entry.spec;
        let value = match &entry.imp {
            PropertyImpl::Stored { .. } => self.inner.shadow.borrow().get(spec.name()).cloned(),
            PropertyImpl::Computed { getter, .. } => getter(self),
        };
        Ok(value.unwrap_or_else(|| spec.default_value()))
    }

    /// Write a property.
    ///
    /// Stored properties update the shadow store, emit `notify::<name>` when
    /// the value changed (or on every write, if so configured) and then run
    /// their effect callback. Computed properties and plain notifying setters
    /// delegate to the declared setter and always notify.
    pub fn set_property(&self, name: &str, value: impl Into<Value>) -> Result<(), PropertyError> {
        let value = value.into();
        let class = self.inner.class.clone();

        let Some(entry) = class.find_property(name) else {
            let setter = class
                .find_setter(name)
                .ok_or_else(|| self.unknown_property(name))?;
            setter(self, value);
            self.emit_notify(&canonical_name(name));
            return Ok(());
        };
        let spec = &entry.spec;

        match &entry.imp {
            PropertyImpl::Computed { .. } => {
                let setter = class.find_setter(spec.name()).ok_or_else(|| PropertyError::NotWritable {
                    type_name: self.type_name().to_owned(),
                    property: spec.name().to_owned(),
                })?;
                spec.check_value(&value)?;
                setter(self, value);
                self.emit_notify(&spec.canonical_name());
                Ok(())
            }
            PropertyImpl::Stored {
                notify,
                equality,
                effect,
            } => {
                if !spec.is_writable() {
                    return Err(PropertyError::NotWritable {
                        type_name: self.type_name().to_owned(),
                        property: spec.name().to_owned(),
                    });
                }
                if spec.is_construct_only() && !self.inner.constructing.get() {
                    return Err(PropertyError::ConstructOnly {
                        type_name: self.type_name().to_owned(),
                        property: spec.name().to_owned(),
                    });
                }
                spec.check_value(&value)?;

                let config = self.inner.context.config();
                let policy = notify.unwrap_or(config.notify_policy);
                let equality = equality.unwrap_or(config.object_equality);

                let old = self
                    .inner
                    .shadow
                    .borrow_mut()
                    .insert(spec.name().to_owned(), value.clone());
                let changed = match &old {
                    None => true,
                    Some(old) => !values_equal(old, &value, equality),
                };
                // Old object values may hold the last reference to an instance.
                drop(old);

                if changed || policy == NotifyPolicy::Always {
                    self.emit_notify(&spec.canonical_name());
                }
                if let Some(effect) = effect {
                    effect(self, &value);
                }
                Ok(())
            }
        }
    }

    /// Emit `notify::<name>` for a declared property or notifying setter.
    pub fn notify(&self, name: &str) -> Result<(), PropertyError> {
        let class = &self.inner.class;
        if class.find_property(name).is_none() && class.find_setter(name).is_none() {
            return Err(self.unknown_property(name));
        }
        self.emit_notify(&canonical_name(name));
        Ok(())
    }

    pub(crate) fn emit_notify(&self, canonical: &str) {
        tracing::trace!(target: targets::PROPERTY, instance = %self, property = canonical, "notify");
        let spec = SignalSpec::notify();
        self.dispatch(NOTIFY_SIGNAL, Some(canonical), &[Value::from(canonical)], &spec);
    }

    /// Stored property values, sorted by name. Unset properties are omitted.
    pub fn stored_values(&self) -> Vec<(String, Value)> {
        let mut values: Vec<(String, Value)> = self
            .inner
            .shadow
            .borrow()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        values.sort_by(|(a, _), (b, _)| a.cmp(b));
        values
    }

    // Fields and children

    /// Read a raw field.
    pub fn field(&self, name: &str) -> Option<Value> {
        self.inner.fields.borrow().get(name).cloned()
    }

    /// Write a raw field, returning the previous value.
    pub fn set_field(&self, name: &str, value: impl Into<Value>) -> Option<Value> {
        self.inner
            .fields
            .borrow_mut()
            .insert(name.to_owned(), value.into())
    }

    /// Whether a raw field holds a value.
    pub fn has_field(&self, name: &str) -> bool {
        self.inner.fields.borrow().contains_key(name)
    }

    /// The template-bound child `name`, stored in the field `_<name>`.
    pub fn child(&self, name: &str) -> Result<Option<Instance>, PropertyError> {
        if !self.inner.class.declares_child(name) {
            return Err(PropertyError::UnknownChild {
                type_name: self.type_name().to_owned(),
                child: name.to_owned(),
            });
        }
        Ok(self
            .field(&child_field(name))
            .and_then(|value| value.as_object().cloned()))
    }

    /// Always fails: template children are read-only.
    pub fn set_child(&self, name: &str, _child: Option<Instance>) -> Result<(), PropertyError> {
        Err(PropertyError::ChildReadOnly(name.to_owned()))
    }

    // Signals

    fn resolve_signal(&self, signal: &str, detail: Option<&str>) -> Result<SignalSpec, SignalError> {
        let spec = if signal == NOTIFY_SIGNAL {
            SignalSpec::notify()
        } else {
            self.inner
                .class
                .find_signal(signal)
                .cloned()
                .ok_or_else(|| SignalError::UnknownSignal {
                    type_name: self.type_name().to_owned(),
                    signal: signal.to_owned(),
                })?
        };
        if detail.is_some() && !spec.flags.contains(SignalFlags::DETAILED) {
            return Err(SignalError::NotDetailed(signal.to_owned()));
        }
        Ok(spec)
    }

    /// Connect a handler to a (possibly detailed) signal.
    ///
    /// The handler's return value feeds the signal's accumulator.
    pub fn connect<F>(&self, detailed_signal: &str, handler: F) -> Result<HandlerId, SignalError>
    where
        F: Fn(&Instance, &[Value]) -> Option<Value> + 'static,
    {
        let (signal, detail) = parse_detailed(detailed_signal);
        self.resolve_signal(signal, detail)?;
        let detail = if signal == NOTIFY_SIGNAL {
            detail.map(canonical_name)
        } else {
            detail.map(str::to_owned)
        };
        let callback: HandlerFn = Rc::new(handler);
        let id = self
            .inner
            .handlers
            .borrow_mut()
            .insert(signal, detail.as_deref(), callback);
        tracing::trace!(target: targets::SIGNAL, instance = %self, signal = detailed_signal, ?id, "connected");
        Ok(id)
    }

    /// Connect to change notifications of one property, or of all when `property` is `None`.
    pub fn connect_notify<F>(&self, property: Option<&str>, handler: F) -> Result<HandlerId, SignalError>
    where
        F: Fn(&Instance, &str) + 'static,
    {
        let signal = match property {
            Some(property) => format!("{NOTIFY_SIGNAL}::{property}"),
            None => NOTIFY_SIGNAL.to_owned(),
        };
        self.connect(&signal, move |instance, args| {
            let name = args.first().and_then(Value::as_str).unwrap_or_default();
            handler(instance, name);
            None
        })
    }

    /// Disconnect a handler.
    pub fn disconnect(&self, id: HandlerId) -> Result<(), SignalError> {
        let removed = self.inner.handlers.borrow_mut().remove(id);
        match removed {
            Some(handler) => {
                tracing::trace!(target: targets::SIGNAL, instance = %self, ?id, "disconnected");
                drop(handler);
                Ok(())
            }
            None => Err(SignalError::InvalidHandler(id)),
        }
    }

    /// Whether a handler is still connected.
    pub fn is_connected(&self, id: HandlerId) -> bool {
        self.inner.handlers.borrow().contains(id)
    }

    /// Number of connected handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.borrow().len()
    }

    /// Emit a (possibly detailed) signal.
    ///
    /// Arguments are checked against the declared parameter types. Handlers
    /// run in connection order; a handler disconnected by an earlier one in
    /// the same emission is skipped.
    pub fn emit(&self, detailed_signal: &str, args: &[Value]) -> Result<Option<Value>, SignalError> {
        let (signal, detail) = parse_detailed(detailed_signal);
        let spec = self.resolve_signal(signal, detail)?;
        check_args(signal, &spec, args)?;
        let detail = if signal == NOTIFY_SIGNAL {
            detail.map(canonical_name)
        } else {
            detail.map(str::to_owned)
        };
        Ok(self.dispatch(signal, detail.as_deref(), args, &spec))
    }

    fn dispatch(&self, signal: &str, detail: Option<&str>, args: &[Value], spec: &SignalSpec) -> Option<Value> {
        let handlers = self.inner.handlers.borrow().matching(signal, detail);
        tracing::trace!(target: targets::SIGNAL, instance = %self, signal, ?detail, handlers = handlers.len(), "emitting");

        let mut acc = None;
        for (id, handler) in handlers {
            if !self.is_connected(id) {
                continue;
            }
            let result = handler(self, args);
            if accumulate(spec.accumulator, &mut acc, result) {
                break;
            }
        }
        acc
    }

    // Methods

    /// Call a declared method. Debounced methods return `Ok(None)`.
    pub fn call(&self, method: &str, args: &[Value]) -> Result<Option<Value>, MethodError> {
        if self.is_disposed() {
            return Err(MethodError::Disposed {
                instance: self.to_string(),
                method: method.to_owned(),
            });
        }
        let class = self.inner.class.clone();
        let entry = class
            .find_method(method)
            .ok_or_else(|| MethodError::UnknownMethod {
                type_name: self.type_name().to_owned(),
                method: method.to_owned(),
            })?;
        match entry.debounce {
            Some(config) => {
                debounce::call(self, method, config, entry.func.clone(), args.to_vec());
                Ok(None)
            }
            None => Ok((entry.func)(self, args)),
        }
    }

    pub(crate) fn debounce_states(&self) -> &RefCell<HashMap<String, DebounceState>> {
        &self.inner.debounce
    }

    // Actions

    /// Attach an action the way the instance's capability dictates.
    ///
    /// Plain objects do not attach actions; the action is still returned by
    /// [`exposed_action`](Self::exposed_action) if it was exposed.
    pub fn add_action(&self, action: Action) {
        match self.kind() {
            InstanceKind::Widget => {
                let group = self.own_action_group();
                group.add_action(action);
            }
            InstanceKind::Window | InstanceKind::Application => {
                self.inner
                    .actions
                    .borrow_mut()
                    .insert(action.name().to_owned(), action);
            }
            InstanceKind::Object => {
                tracing::debug!(
                    target: targets::ACTION,
                    instance = %self,
                    action = action.name(),
                    "plain objects have no action container"
                );
            }
        }
    }

    /// The widget action group, created and inserted under the class name on first use.
    pub fn own_action_group(&self) -> ActionGroup {
        if let Some(group) = self.inner.own_group.borrow().as_ref() {
            return group.clone();
        }
        let group = ActionGroup::new();
        *self.inner.own_group.borrow_mut() = Some(group.clone());
        self.insert_action_group(self.type_name(), group.clone());
        group
    }

    /// Make `group` reachable as `<prefix>.<action>`.
    pub fn insert_action_group(&self, prefix: &str, group: ActionGroup) {
        self.inner
            .groups
            .borrow_mut()
            .insert(prefix.to_owned(), group);
    }

    /// The group inserted under `prefix`.
    pub fn action_group(&self, prefix: &str) -> Option<ActionGroup> {
        self.inner.groups.borrow().get(prefix).cloned()
    }

    /// Find an action by plain or qualified name.
    pub fn lookup_action(&self, name: &str) -> Option<Action> {
        match name.split_once('.') {
            Some((prefix, action)) => {
                if self.kind().action_prefix() == Some(prefix) {
                    return self.inner.actions.borrow().get(action).cloned();
                }
                self.action_group(prefix)?.lookup(action)
            }
            None => {
                let direct = self.inner.actions.borrow().get(name).cloned();
                direct.or_else(|| {
                    let group = self.inner.own_group.borrow().clone();
                    group?.lookup(name)
                })
            }
        }
    }

    /// Qualified names of every reachable action, sorted.
    pub fn list_actions(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(prefix) = self.kind().action_prefix() {
            names.extend(
                self.inner
                    .actions
                    .borrow()
                    .keys()
                    .map(|name| format!("{prefix}.{name}")),
            );
        }
        for (prefix, group) in self.inner.groups.borrow().iter() {
            names.extend(group.list_actions().into_iter().map(|name| format!("{prefix}.{name}")));
        }
        names.sort();
        names
    }

    /// Activate an action by plain or qualified name.
    pub fn activate_action(&self, name: &str, parameter: Option<&Value>) -> Result<bool, ActionError> {
        let action = self
            .lookup_action(name)
            .ok_or_else(|| ActionError::UnknownAction(name.to_owned()))?;
        action.activate(parameter)
    }

    /// Bind accelerators to a qualified action name.
    pub fn set_accels_for_action(&self, detailed: &str, accels: Vec<String>) {
        tracing::debug!(target: targets::ACTION, instance = %self, action = detailed, ?accels, "binding accelerators");
        self.inner
            .accels
            .borrow_mut()
            .insert(detailed.to_owned(), accels);
    }

    /// Accelerators bound to a qualified action name.
    pub fn accels_for_action(&self, detailed: &str) -> Vec<String> {
        self.inner
            .accels
            .borrow()
            .get(detailed)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn expose_action(&self, field: &str, action: Action) {
        self.inner
            .exposed
            .borrow_mut()
            .insert(field.to_owned(), action);
    }

    /// The action exposed under `field` by a declaration's `expose_as`.
    pub fn exposed_action(&self, field: &str) -> Option<Action> {
        self.inner.exposed.borrow().get(field).cloned()
    }

    // Lifecycle

    pub(crate) fn track_ready_source(&self, id: SourceId) {
        self.inner.ready_sources.borrow_mut().push(id);
    }

    pub(crate) fn untrack_ready_source(&self, id: SourceId) {
        self.inner.ready_sources.borrow_mut().retain(|&tracked| tracked != id);
    }

    /// Number of deferred `ready` callbacks that have not run yet.
    pub fn pending_ready_count(&self) -> usize {
        self.inner.ready_sources.borrow().len()
    }

    /// Tear the instance down.
    ///
    /// Cancels pending `ready` callbacks and debounce timers and disconnects
    /// every handler. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        tracing::debug!(target: targets::CORE, instance = %self, "disposing");

        let ready: Vec<SourceId> = std::mem::take(&mut *self.inner.ready_sources.borrow_mut());
        let timers: Vec<SourceId> = self
            .inner
            .debounce
            .borrow_mut()
            .values_mut()
            .filter_map(|state| state.pending.take())
            .collect();
        for id in ready.into_iter().chain(timers) {
            // Sources that already fired are gone; nothing to cancel.
            let _ = self.inner.context.source_remove(id);
        }

        let handlers = self.inner.handlers.borrow_mut().drain();
        drop(handlers);
    }
}

/// Field under which a template child is stored.
pub(crate) fn child_field(name: &str) -> String {
    format!("_{name}")
}

fn values_equal(old: &Value, new: &Value, equality: ObjectEquality) -> bool {
    match equality {
        ObjectEquality::Identity => old.identical(new),
        ObjectEquality::Structural => old.structurally_equal(new),
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name(), self.inner.id)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("type", &self.type_name())
            .field("id", &self.inner.id)
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}
