//! Class declaration, registration and construction.
//!
//! A class is declared with a [`ClassBuilder`]: each builder call records one
//! piece of metadata (a property, a child, a signal, an action, ...), and
//! [`ClassBuilder::finalize`] assembles everything into a
//! [`ClassRegistration`], hands it to the [`TypeSystem`] exactly once and
//! returns the registered [`Class`]. The builder is consumed, so nothing
//! declared for one class can leak into another.
//!
//! # Example
//!
//! ```
//! use horizon_declare::{ClassBuilder, MainContext, PropertyOptions, TypeRegistry, Value};
//!
//! let types = TypeRegistry::new();
//! let counter = ClassBuilder::new(&types, "Counter")
//!     .property("count", "uint32", PropertyOptions::new().max(10.0))?
//!     .finalize()?;
//!
//! let context = MainContext::manual();
//! let instance = counter.new_instance(&context)?;
//! assert_eq!(instance.property("count")?, Value::UInt(0));
//!
//! instance.set_property("count", 3u32)?;
//! assert_eq!(instance.property("count")?, Value::UInt(3));
//! # Ok::<(), horizon_declare::DeclareError>(())
//! ```
//!
//! # Construction order
//!
//! [`InstanceBuilder::build`] runs, in order:
//!
//! 1. preset raw fields
//! 2. template children
//! 3. per-class initializers, root class first: backing-field seeding, then
//!    action creation
//! 4. construct properties (construct-only properties are writable here)
//! 5. `init` hooks, root class first
//! 6. scheduling of `ready` callbacks on the next idle iteration
//!
//! A failing or panicking `ready` callback is logged and discarded; it never
//! affects construction.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;

use crate::action::{Action, ActionOptions};
use crate::config::{NotifyPolicy, ObjectEquality};
use crate::debounce::Debounce;
use crate::instance::{Instance, InstanceKind, PropertyError, child_field};
use crate::logging::{span_names, targets};
use crate::main_loop::{ControlFlow, MainContext, Priority, SourceId};
use crate::resolve::{PropertyOptions, ResolveError, TypeTag, resolve};
use crate::signal::SignalSpec;
use crate::spec::{FlagPreset, PropertySpec};
use crate::types::{ClassRegistration, RegistrationError, TypeFlags, TypeHandle, TypeSystem};
use crate::value::Value;

/// Error type returned by `ready` callbacks.
pub type ReadyError = Box<dyn std::error::Error>;

pub(crate) type MethodFn = Rc<dyn Fn(&Instance, &[Value]) -> Option<Value>>;
type GetterFn = Rc<dyn Fn(&Instance) -> Option<Value>>;
type SetterFn = Rc<dyn Fn(&Instance, Value)>;
type EffectFn = Rc<dyn Fn(&Instance, &Value)>;
type ActionFn = Rc<dyn Fn(&Instance, &Action, Option<&Value>)>;
type InitFn = Rc<dyn Fn(&Instance)>;
type ReadySyncFn = Rc<dyn Fn(&Instance) -> Result<(), ReadyError>>;
type ReadyAsyncFn = Rc<dyn Fn(Instance) -> LocalBoxFuture<'static, Result<(), ReadyError>>>;

/// Errors from declaring or registering a class.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassError {
    /// A property descriptor could not be resolved.
    #[error("Cannot resolve property '{property}' of '{class}': {source}")]
    Resolve {
        /// Class being declared.
        class: String,
        /// Property being declared.
        property: String,
        /// Underlying failure.
        #[source]
        source: ResolveError,
    },
    /// Computed properties cannot use the `CONSTANT` preset.
    #[error("Computed property '{property}' of '{class}' cannot be CONSTANT")]
    ConstantComputed {
        /// Class being declared.
        class: String,
        /// Property being declared.
        property: String,
    },
    /// The type system rejected the registration.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Errors from constructing an instance.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConstructError {
    /// The class is abstract.
    #[error("Cannot instantiate abstract type '{0}'")]
    Abstract(String),
    /// A template child was supplied that the class does not declare.
    #[error("Type '{type_name}' declares no child '{child}'")]
    UnknownChild {
        /// Class being constructed.
        type_name: String,
        /// The child.
        child: String,
    },
    /// A construct property could not be set.
    #[error(transparent)]
    Property(#[from] PropertyError),
}

/// Settings of a stored property: descriptor options plus change behaviour.
#[derive(Clone, Default)]
pub struct PropertyConfig {
    options: PropertyOptions,
    notify: Option<NotifyPolicy>,
    equality: Option<ObjectEquality>,
    effect: Option<EffectFn>,
}

impl PropertyConfig {
    /// Defaults for everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor options.
    pub fn options(mut self, options: PropertyOptions) -> Self {
        self.options = options;
        self
    }

    /// Emit `notify` on every write, not only on change.
    pub fn every_set_notifies(mut self) -> Self {
        self.notify = Some(NotifyPolicy::Always);
        self
    }

    /// Override the context's notification policy.
    pub fn notify_policy(mut self, policy: NotifyPolicy) -> Self {
        self.notify = Some(policy);
        self
    }

    /// Override the context's object comparison for change detection.
    pub fn equality(mut self, equality: ObjectEquality) -> Self {
        self.equality = Some(equality);
        self
    }

    /// Run `effect` with the new value after every successful write.
    pub fn effect<F>(mut self, effect: F) -> Self
    where
        F: Fn(&Instance, &Value) + 'static,
    {
        self.effect = Some(Rc::new(effect));
        self
    }
}

impl From<PropertyOptions> for PropertyConfig {
    fn from(options: PropertyOptions) -> Self {
        Self::new().options(options)
    }
}

impl fmt::Debug for PropertyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyConfig")
            .field("options", &self.options)
            .field("notify", &self.notify)
            .field("equality", &self.equality)
            .field("effect", &self.effect.is_some())
            .finish()
    }
}

/// Settings of a computed property.
#[derive(Debug, Clone, Default)]
pub struct ComputedConfig {
    options: PropertyOptions,
    backing_field: Option<String>,
}

impl ComputedConfig {
    /// Defaults for everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor options.
    pub fn options(mut self, options: PropertyOptions) -> Self {
        self.options = options;
        self
    }

    /// Seed the raw field `field` with the property default at initialization,
    /// unless something already set it.
    pub fn backing_field(mut self, field: impl Into<String>) -> Self {
        self.backing_field = Some(field.into());
        self
    }
}

impl From<PropertyOptions> for ComputedConfig {
    fn from(options: PropertyOptions) -> Self {
        Self::new().options(options)
    }
}

#[derive(Clone)]
pub(crate) enum PropertyImpl {
    Stored {
        notify: Option<NotifyPolicy>,
        equality: Option<ObjectEquality>,
        effect: Option<EffectFn>,
    },
    Computed {
        getter: GetterFn,
        backing_field: Option<String>,
    },
}

#[derive(Clone)]
pub(crate) struct PropertyEntry {
    pub(crate) spec: PropertySpec,
    pub(crate) imp: PropertyImpl,
}

#[derive(Clone)]
pub(crate) struct MethodEntry {
    pub(crate) func: MethodFn,
    pub(crate) debounce: Option<Debounce>,
}

#[derive(Clone)]
struct ActionDecl {
    name: String,
    options: ActionOptions,
    handler: ActionFn,
}

#[derive(Clone)]
enum ReadyFn {
    Sync(ReadySyncFn),
    Async(ReadyAsyncFn),
}

enum Parent {
    Builtin(TypeHandle),
    Class(Class),
}

/// Accumulates the declaration of one class.
pub struct ClassBuilder<'a> {
    types: &'a dyn TypeSystem,
    class_name: String,
    type_name: Option<String>,
    parent: Option<Parent>,
    template: Option<String>,
    css_name: Option<String>,
    implements: Vec<TypeHandle>,
    type_flags: TypeFlags,
    properties: Vec<PropertyEntry>,
    manual_properties: Vec<PropertySpec>,
    children: Vec<String>,
    manual_children: Vec<String>,
    signals: BTreeMap<String, SignalSpec>,
    setters: BTreeMap<String, SetterFn>,
    methods: BTreeMap<String, MethodEntry>,
    actions: Vec<ActionDecl>,
    init_hooks: Vec<InitFn>,
    ready: Option<ReadyFn>,
}

impl<'a> ClassBuilder<'a> {
    /// Start declaring `class_name`, an `Object` subclass unless told otherwise.
    pub fn new(types: &'a dyn TypeSystem, class_name: impl Into<String>) -> Self {
        Self {
            types,
            class_name: class_name.into(),
            type_name: None,
            parent: None,
            template: None,
            css_name: None,
            implements: Vec::new(),
            type_flags: TypeFlags::empty(),
            properties: Vec::new(),
            manual_properties: Vec::new(),
            children: Vec::new(),
            manual_children: Vec::new(),
            signals: BTreeMap::new(),
            setters: BTreeMap::new(),
            methods: BTreeMap::new(),
            actions: Vec::new(),
            init_hooks: Vec::new(),
            ready: None,
        }
    }

    /// Derive from a type with no declared class, such as a built-in.
    pub fn parent_type(mut self, parent: TypeHandle) -> Self {
        self.parent = Some(Parent::Builtin(parent));
        self
    }

    /// Derive from a declared class, inheriting its members.
    pub fn subclass_of(mut self, parent: &Class) -> Self {
        self.parent = Some(Parent::Class(parent.clone()));
        self
    }

    fn resolve(&self, name: &str, tag: TypeTag, options: &PropertyOptions) -> Result<PropertySpec, ClassError> {
        resolve(self.types, name, tag, options).map_err(|source| ClassError::Resolve {
            class: self.class_name.clone(),
            property: name.to_owned(),
            source,
        })
    }

    /// Declare a stored property backed by the instance's shadow store.
    pub fn property(
        mut self,
        name: &str,
        tag: impl Into<TypeTag>,
        config: impl Into<PropertyConfig>,
    ) -> Result<Self, ClassError> {
        let config = config.into();
        let spec = self.resolve(name, tag.into(), &config.options)?;
        self.properties.push(PropertyEntry {
            spec,
            imp: PropertyImpl::Stored {
                notify: config.notify,
                equality: config.equality,
                effect: config.effect,
            },
        });
        Ok(self)
    }

    /// Declare a read-only property whose value comes from `getter`.
    ///
    /// A getter returning `None` reads as the property default.
    pub fn computed<F>(
        mut self,
        name: &str,
        tag: impl Into<TypeTag>,
        config: impl Into<ComputedConfig>,
        getter: F,
    ) -> Result<Self, ClassError>
    where
        F: Fn(&Instance) -> Option<Value> + 'static,
    {
        let config = config.into();
        if config.options.flag_preset() == FlagPreset::Constant {
            return Err(ClassError::ConstantComputed {
                class: self.class_name.clone(),
                property: name.to_owned(),
            });
        }
        let spec = self.resolve(name, tag.into(), &config.options)?;
        self.properties.push(PropertyEntry {
            spec,
            imp: PropertyImpl::Computed {
                getter: Rc::new(getter),
                backing_field: config.backing_field,
            },
        });
        Ok(self)
    }

    /// Register an already resolved descriptor; it behaves like a stored property.
    pub fn manual_property(mut self, spec: PropertySpec) -> Self {
        self.manual_properties.push(spec);
        self
    }

    /// Declare a template-bound child, read through [`Instance::child`].
    pub fn child(mut self, name: impl Into<String>) -> Self {
        self.children.push(name.into());
        self
    }

    /// Declare template-bound children without accessors.
    pub fn internal_children<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manual_children.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declare a signal. Re-declaring a name replaces the earlier descriptor.
    pub fn signal(mut self, name: impl Into<String>, spec: SignalSpec) -> Self {
        self.signals.insert(name.into(), spec);
        self
    }

    /// Declare a setter that emits `notify::<name>` after it ran, on every write.
    ///
    /// Pairs with a computed property of the same name to make it writable.
    pub fn setter_notify<F>(mut self, name: impl Into<String>, setter: F) -> Self
    where
        F: Fn(&Instance, Value) + 'static,
    {
        self.setters.insert(name.into(), Rc::new(setter));
        self
    }

    /// Declare a method callable through [`Instance::call`].
    pub fn method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&Instance, &[Value]) -> Option<Value> + 'static,
    {
        self.methods.insert(
            name.into(),
            MethodEntry {
                func: Rc::new(method),
                debounce: None,
            },
        );
        self
    }

    /// Declare a debounced method.
    pub fn debounce<F>(mut self, name: impl Into<String>, debounce: Debounce, method: F) -> Self
    where
        F: Fn(&Instance, &[Value]) + 'static,
    {
        let func: MethodFn = Rc::new(move |instance: &Instance, args: &[Value]| {
            method(instance, args);
            None
        });
        self.methods.insert(
            name.into(),
            MethodEntry {
                func,
                debounce: Some(debounce),
            },
        );
        self
    }

    /// Declare an action created for every instance and bound to `handler`.
    pub fn action<F>(mut self, name: impl Into<String>, options: ActionOptions, handler: F) -> Self
    where
        F: Fn(&Instance, &Action, Option<&Value>) + 'static,
    {
        self.actions.push(ActionDecl {
            name: name.into(),
            options,
            handler: Rc::new(handler),
        });
        self
    }

    /// Template resource, registered as `resource://<path>.ui`.
    pub fn template(mut self, path: impl Into<String>) -> Self {
        self.template = Some(path.into());
        self
    }

    /// CSS element name.
    pub fn css_name(mut self, name: impl Into<String>) -> Self {
        self.css_name = Some(name.into());
        self
    }

    /// Register under `name` instead of the class name.
    pub fn type_name(mut self, name: impl Into<String>) -> Self {
        self.type_name = Some(name.into());
        self
    }

    /// Implement an interface.
    pub fn implements(mut self, interface: TypeHandle) -> Self {
        self.implements.push(interface);
        self
    }

    /// Class flags.
    pub fn type_flags(mut self, flags: TypeFlags) -> Self {
        self.type_flags = flags;
        self
    }

    /// Run `hook` at the end of construction.
    pub fn init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Instance) + 'static,
    {
        self.init_hooks.push(Rc::new(hook));
        self
    }

    /// Run `ready` on the first idle iteration after construction.
    pub fn ready<F>(mut self, ready: F) -> Self
    where
        F: Fn(&Instance) -> Result<(), ReadyError> + 'static,
    {
        self.ready = Some(ReadyFn::Sync(Rc::new(ready)));
        self
    }

    /// Like [`ready`](Self::ready), with an asynchronous callback driven by the main context.
    pub fn ready_async<F, Fut>(mut self, ready: F) -> Self
    where
        F: Fn(Instance) -> Fut + 'static,
        Fut: Future<Output = Result<(), ReadyError>> + 'static,
    {
        self.ready = Some(ReadyFn::Async(Rc::new(move |instance: Instance| {
            ready(instance).boxed_local()
        })));
        self
    }

    /// Assemble the registration bundle, register the class and return it.
    pub fn finalize(self) -> Result<Class, ClassError> {
        let _span = tracing::debug_span!(
            target: targets::CLASS,
            span_names::FINALIZE,
            class = %self.class_name
        )
        .entered();

        let type_name = self
            .type_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.class_name.clone());

        let mut properties: BTreeMap<String, PropertyEntry> = BTreeMap::new();
        for entry in self.properties {
            properties.insert(entry.spec.name().to_owned(), entry);
        }
        for spec in self.manual_properties {
            let entry = PropertyEntry {
                spec,
                imp: PropertyImpl::Stored {
                    notify: None,
                    equality: None,
                    effect: None,
                },
            };
            properties.insert(entry.spec.name().to_owned(), entry);
        }

        let mut children: Vec<String> = Vec::new();
        for child in self.children.into_iter().chain(self.manual_children) {
            if !children.contains(&child) {
                children.push(child);
            }
        }

        let (parent_handle, parent_class) = match self.parent {
            Some(Parent::Class(class)) => (class.handle(), Some(class)),
            Some(Parent::Builtin(handle)) => (handle, None),
            None => match self.types.lookup("Object") {
                Some(handle) => (handle, None),
                None => {
                    return Err(RegistrationError::InvalidParent { type_name }.into());
                }
            },
        };

        let registration = ClassRegistration {
            type_name: type_name.clone(),
            parent: parent_handle,
            template: self.template.as_ref().map(|path| format!("resource://{path}.ui")),
            internal_children: children.clone(),
            signals: self.signals.clone(),
            css_name: self.css_name.clone(),
            properties: properties.values().map(|entry| entry.spec.clone()).collect(),
            implements: self.implements.clone(),
            type_flags: self.type_flags,
        };
        let template = registration.template.clone();
        let handle = self.types.register_class(registration)?;

        let ancestry = self.types.ancestry(handle);
        let derives_from = |base: &str| {
            self.types
                .lookup(base)
                .is_some_and(|base| ancestry.contains(&base))
        };
        let kind = if derives_from("Application") {
            InstanceKind::Application
        } else if derives_from("Window") {
            InstanceKind::Window
        } else if derives_from("Widget") {
            InstanceKind::Widget
        } else {
            InstanceKind::Object
        };

        tracing::debug!(
            target: targets::CLASS,
            type_name = %type_name,
            ?kind,
            properties = properties.len(),
            children = children.len(),
            "finalized class"
        );

        Ok(Class {
            inner: Rc::new(ClassInner {
                type_name,
                handle,
                parent: parent_class,
                ancestry,
                kind,
                type_flags: self.type_flags,
                template,
                css_name: self.css_name,
                properties,
                children,
                signals: self.signals,
                setters: self.setters,
                methods: self.methods,
                actions: self.actions,
                init_hooks: self.init_hooks,
                ready: self.ready,
            }),
        })
    }
}

impl fmt::Debug for ClassBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassBuilder")
            .field("class_name", &self.class_name)
            .field("properties", &self.properties.len())
            .field("children", &self.children)
            .field("signals", &self.signals.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct ClassInner {
    type_name: String,
    handle: TypeHandle,
    parent: Option<Class>,
    ancestry: Vec<TypeHandle>,
    kind: InstanceKind,
    type_flags: TypeFlags,
    template: Option<String>,
    css_name: Option<String>,
    properties: BTreeMap<String, PropertyEntry>,
    children: Vec<String>,
    signals: BTreeMap<String, SignalSpec>,
    setters: BTreeMap<String, SetterFn>,
    methods: BTreeMap<String, MethodEntry>,
    actions: Vec<ActionDecl>,
    init_hooks: Vec<InitFn>,
    ready: Option<ReadyFn>,
}

/// A registered class.
#[derive(Clone)]
pub struct Class {
    inner: Rc<ClassInner>,
}

impl Class {
    /// Registered type name.
    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    /// Handle in the type system.
    pub fn handle(&self) -> TypeHandle {
        self.inner.handle
    }

    /// The declared parent class, if the parent is not a built-in.
    pub fn parent(&self) -> Option<&Class> {
        self.inner.parent.as_ref()
    }

    /// Capability of instances.
    pub fn kind(&self) -> InstanceKind {
        self.inner.kind
    }

    /// Class flags.
    pub fn type_flags(&self) -> TypeFlags {
        self.inner.type_flags
    }

    /// Registered template resource path.
    pub fn template(&self) -> Option<&str> {
        self.inner.template.as_deref()
    }

    /// CSS element name.
    pub fn css_name(&self) -> Option<&str> {
        self.inner.css_name.as_deref()
    }

    /// The type, its ancestors and implemented interfaces.
    pub fn ancestry(&self) -> &[TypeHandle] {
        &self.inner.ancestry
    }

    /// Whether the class is, derives from or implements `ty`.
    pub fn is_a(&self, ty: TypeHandle) -> bool {
        self.inner.ancestry.contains(&ty)
    }

    /// Whether two handles refer to the same class.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// This class and its declared ancestors, leaf first.
    fn chain(&self) -> impl Iterator<Item = &Class> {
        std::iter::successors(Some(self), |class| class.parent())
    }

    pub(crate) fn find_property(&self, name: &str) -> Option<&PropertyEntry> {
        let underscored = name.replace('-', "_");
        self.chain().find_map(|class| {
            let properties = &class.inner.properties;
            properties.get(name).or_else(|| properties.get(&underscored))
        })
    }

    pub(crate) fn find_setter(&self, name: &str) -> Option<SetterFn> {
        let underscored = name.replace('-', "_");
        self.chain().find_map(|class| {
            let setters = &class.inner.setters;
            setters.get(name).or_else(|| setters.get(&underscored)).cloned()
        })
    }

    pub(crate) fn find_signal(&self, name: &str) -> Option<&SignalSpec> {
        self.chain().find_map(|class| class.inner.signals.get(name))
    }

    pub(crate) fn find_method(&self, name: &str) -> Option<&MethodEntry> {
        self.chain().find_map(|class| class.inner.methods.get(name))
    }

    pub(crate) fn declares_child(&self, name: &str) -> bool {
        self.chain().any(|class| class.inner.children.iter().any(|child| child == name))
    }

    /// Descriptor of a property, own or inherited.
    pub fn property_spec(&self, name: &str) -> Option<&PropertySpec> {
        self.find_property(name).map(|entry| &entry.spec)
    }

    /// Every property descriptor, inherited ones included, one per name
    /// (the most derived declaration wins), sorted by name.
    pub fn properties(&self) -> Vec<&PropertySpec> {
        let mut seen: BTreeMap<&str, &PropertySpec> = BTreeMap::new();
        for class in self.chain() {
            for (name, entry) in &class.inner.properties {
                seen.entry(name.as_str()).or_insert(&entry.spec);
            }
        }
        seen.into_values().collect()
    }

    /// Descriptors declared by this class itself.
    pub fn own_properties(&self) -> Vec<&PropertySpec> {
        self.inner.properties.values().map(|entry| &entry.spec).collect()
    }

    /// Every template child name, ancestors' first, each once.
    pub fn internal_children(&self) -> Vec<&str> {
        let classes: Vec<&Class> = self.chain().collect();
        let mut names: Vec<&str> = Vec::new();
        for class in classes.into_iter().rev() {
            for child in &class.inner.children {
                if !names.contains(&child.as_str()) {
                    names.push(child);
                }
            }
        }
        names
    }

    /// Descriptor of a declared signal, own or inherited.
    pub fn signal(&self, name: &str) -> Option<&SignalSpec> {
        self.find_signal(name)
    }

    /// Whether a method is declared, own or inherited.
    pub fn has_method(&self, name: &str) -> bool {
        self.find_method(name).is_some()
    }

    /// Construct an instance with no construct-time settings.
    pub fn new_instance(&self, context: &MainContext) -> Result<Instance, ConstructError> {
        self.construct(context).build()
    }

    /// Start constructing an instance.
    pub fn construct(&self, context: &MainContext) -> InstanceBuilder {
        InstanceBuilder {
            class: self.clone(),
            context: context.clone(),
            properties: Vec::new(),
            fields: Vec::new(),
            children: Vec::new(),
        }
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("type_name", &self.inner.type_name)
            .field("kind", &self.inner.kind)
            .field("properties", &self.inner.properties.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Construct-time settings of one instance.
pub struct InstanceBuilder {
    class: Class,
    context: MainContext,
    properties: Vec<(String, Value)>,
    fields: Vec<(String, Value)>,
    children: Vec<(String, Instance)>,
}

impl InstanceBuilder {
    /// Set a property during construction.
    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    /// Preset a raw field before initializers run.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Bind a template child.
    pub fn template_child(mut self, name: impl Into<String>, child: Instance) -> Self {
        self.children.push((name.into(), child));
        self
    }

    /// Run construction. See the module docs for the order of steps.
    pub fn build(self) -> Result<Instance, ConstructError> {
        let class = self.class;
        let _span = tracing::debug_span!(
            target: targets::CLASS,
            span_names::CONSTRUCT,
            class = %class.type_name()
        )
        .entered();

        if class.type_flags().contains(TypeFlags::ABSTRACT) {
            return Err(ConstructError::Abstract(class.type_name().to_owned()));
        }

        let instance = Instance::new(class.clone(), &self.context);

        for (name, value) in self.fields {
            instance.set_field(&name, value);
        }
        for (name, child) in self.children {
            if !class.declares_child(&name) {
                return Err(ConstructError::UnknownChild {
                    type_name: class.type_name().to_owned(),
                    child: name,
                });
            }
            instance.set_field(&child_field(&name), child);
        }

        let mut root_first: Vec<&Class> = class.chain().collect();
        root_first.reverse();

        for level in &root_first {
            run_initializers(level, &instance);
        }

        for (name, value) in self.properties {
            instance.set_property(&name, value)?;
        }
        instance.set_constructing(false);

        for level in &root_first {
            for hook in &level.inner.init_hooks {
                hook(&instance);
            }
        }

        for level in &root_first {
            if let Some(ready) = &level.inner.ready {
                schedule_ready(level.type_name(), ready.clone(), &instance);
            }
        }

        tracing::debug!(target: targets::CLASS, %instance, "constructed");
        Ok(instance)
    }
}

fn run_initializers(class: &Class, instance: &Instance) {
    for entry in class.inner.properties.values() {
        if let PropertyImpl::Computed {
            backing_field: Some(field),
            ..
        } = &entry.imp
        {
            if !instance.has_field(field) {
                instance.set_field(field, entry.spec.default_value());
            }
        }
    }

    for decl in &class.inner.actions {
        let action = Action::new(decl.name.clone(), &decl.options);
        let weak = instance.downgrade();
        let handler = decl.handler.clone();
        action.connect_activate(move |action, parameter| {
            if let Some(instance) = weak.upgrade() {
                handler(&instance, action, parameter);
            }
        });

        instance.add_action(action.clone());
        if instance.kind() == InstanceKind::Application && !decl.options.accels.is_empty() {
            instance.set_accels_for_action(&format!("app.{}", decl.name), decl.options.accels.clone());
        }
        if let Some(field) = &decl.options.expose_as {
            instance.expose_action(field, action);
        }
        tracing::trace!(target: targets::ACTION, %instance, action = %decl.name, "created action");
    }
}

fn schedule_ready(class_name: &str, ready: ReadyFn, instance: &Instance) {
    let weak = instance.downgrade();
    let class_name = class_name.to_owned();
    let own_id: Rc<Cell<Option<SourceId>>> = Rc::default();

    let slot = own_id.clone();
    let id = instance.context().idle_add_full(Priority::Default, move || {
        let Some(instance) = weak.upgrade() else {
            return ControlFlow::Break;
        };
        if let Some(id) = slot.get() {
            instance.untrack_ready_source(id);
        }
        match &ready {
            ReadyFn::Sync(ready) => match catch_unwind(AssertUnwindSafe(|| ready(&instance))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => report_ready_failure(&class_name, &error.to_string()),
                Err(panic) => report_ready_failure(&class_name, &panic_message(panic.as_ref())),
            },
            ReadyFn::Async(ready) => {
                let future = match catch_unwind(AssertUnwindSafe(|| ready(instance.clone()))) {
                    Ok(future) => future,
                    Err(panic) => {
                        report_ready_failure(&class_name, &panic_message(panic.as_ref()));
                        return ControlFlow::Break;
                    }
                };
                let class_name = class_name.clone();
                instance.context().spawn_local(async move {
                    match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => report_ready_failure(&class_name, &error.to_string()),
                        Err(panic) => report_ready_failure(&class_name, &panic_message(panic.as_ref())),
                    }
                });
            }
        }
        ControlFlow::Break
    });
    own_id.set(Some(id));
    instance.track_ready_source(id);
}

fn report_ready_failure(class_name: &str, error: &str) {
    tracing::error!(target: targets::READY, class = class_name, error, "Error in ready function");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeRegistry;

    #[test]
    fn test_template_path() {
        let types = TypeRegistry::new();
        let class = ClassBuilder::new(&types, "Panel")
            .parent_type(types.widget_type())
            .template("ui/panel")
            .finalize()
            .unwrap();
        assert_eq!(class.template(), Some("resource://ui/panel.ui"));
        assert_eq!(class.kind(), InstanceKind::Widget);
        let registration = types.registration(class.handle()).unwrap();
        assert_eq!(registration.template.as_deref(), Some("resource://ui/panel.ui"));
    }

    #[test]
    fn test_kind_follows_ancestry() {
        let types = TypeRegistry::new();
        let window = ClassBuilder::new(&types, "MainWindow")
            .parent_type(types.window_type())
            .finalize()
            .unwrap();
        let dialog = ClassBuilder::new(&types, "Dialog")
            .subclass_of(&window)
            .finalize()
            .unwrap();
        let model = ClassBuilder::new(&types, "Model").finalize().unwrap();

        assert_eq!(window.kind(), InstanceKind::Window);
        assert_eq!(dialog.kind(), InstanceKind::Window);
        assert_eq!(model.kind(), InstanceKind::Object);
    }

    #[test]
    fn test_manual_type_name() {
        let types = TypeRegistry::new();
        let class = ClassBuilder::new(&types, "Panel")
            .type_name("AppPanel")
            .finalize()
            .unwrap();
        assert_eq!(class.type_name(), "AppPanel");
        assert!(types.lookup("Panel").is_none());
    }

    #[test]
    fn test_constant_computed_rejected() {
        let types = TypeRegistry::new();
        let err = ClassBuilder::new(&types, "Probe")
            .computed(
                "size",
                "uint32",
                PropertyOptions::new().flags(FlagPreset::Constant),
                |_| None,
            )
            .unwrap_err();
        assert!(matches!(err, ClassError::ConstantComputed { .. }));
    }

    #[test]
    fn test_unsupported_property_type() {
        let types = TypeRegistry::new();
        let err = ClassBuilder::new(&types, "Probe")
            .property("size", "u64", PropertyOptions::new())
            .unwrap_err();
        assert!(matches!(
            err,
            ClassError::Resolve { source: ResolveError::UnsupportedType(_), .. }
        ));
    }

    #[test]
    fn test_later_declaration_wins() {
        let types = TypeRegistry::new();
        let class = ClassBuilder::new(&types, "Probe")
            .property("size", "uint32", PropertyOptions::new())
            .unwrap()
            .property("size", "string", PropertyOptions::new())
            .unwrap()
            .finalize()
            .unwrap();
        assert_eq!(class.own_properties().len(), 1);
        assert_eq!(class.property_spec("size").unwrap().default_value(), Value::from(""));
    }

    #[test]
    fn test_abstract_class_cannot_be_built() {
        let types = TypeRegistry::new();
        let class = ClassBuilder::new(&types, "Shape")
            .type_flags(TypeFlags::ABSTRACT)
            .finalize()
            .unwrap();
        let context = MainContext::manual();
        assert_eq!(
            class.new_instance(&context).unwrap_err(),
            ConstructError::Abstract("Shape".to_owned())
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
