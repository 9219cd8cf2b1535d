//! Declarative class metadata for Horizon Declare.
//!
//! This crate turns short declarations into registered classes of a
//! GObject-style type system:
//!
//! - **Descriptor resolution**: abstract property types plus options become
//!   fully specified [`PropertySpec`]s ([`resolve()`])
//! - **Class building**: [`ClassBuilder`] collects properties, computed
//!   properties, template children, signals, notifying setters, methods,
//!   debounced methods and actions, and registers them in one step
//! - **Instances**: per-instance shadow stores with change notification,
//!   signal handlers and action containers ([`Instance`])
//! - **Main loop**: idle and timeout sources plus local tasks on a
//!   single-threaded [`MainContext`], with a manual clock for tests
//! - **Event bridge**: [`await_event`] turns the first of two signals into a
//!   future
//!
//! # Example
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use horizon_declare::{ClassBuilder, MainContext, PropertyOptions, TypeRegistry, Value};
//!
//! let types = TypeRegistry::new();
//! let label = ClassBuilder::new(&types, "Label")
//!     .parent_type(types.widget_type())
//!     .property("text", "string", PropertyOptions::new().default_value("hello"))?
//!     .child("icon")
//!     .finalize()?;
//!
//! let context = MainContext::manual();
//! let instance = label.new_instance(&context)?;
//!
//! let changes = Rc::new(Cell::new(0));
//! let counter = changes.clone();
//! instance.connect_notify(Some("text"), move |_, _| counter.set(counter.get() + 1))?;
//!
//! instance.set_property("text", "world")?;
//! instance.set_property("text", "world")?;
//! assert_eq!(changes.get(), 1);
//! assert_eq!(instance.property("text")?, Value::from("world"));
//! # Ok::<(), horizon_declare::DeclareError>(())
//! ```

pub mod action;
pub mod bridge;
pub mod class;
pub mod config;
mod debounce;
mod error;
pub mod instance;
pub mod logging;
pub mod main_loop;
pub mod resolve;
pub mod signal;
pub mod spec;
pub mod types;
pub mod value;

pub use action::{Action, ActionError, ActionGroup, ActionOptions};
pub use bridge::{BridgeError, EventFuture, await_event};
pub use class::{
    Class, ClassBuilder, ClassError, ComputedConfig, ConstructError, InstanceBuilder, PropertyConfig, ReadyError,
};
pub use config::{ClockMode, ConfigError, DeclareConfig, NotifyPolicy, ObjectEquality};
pub use debounce::{Debounce, Trigger, UnknownTrigger};
pub use error::{DeclareError, Result};
pub use instance::{Instance, InstanceKind, MethodError, PropertyError, WeakInstance};
pub use main_loop::{ControlFlow, MainContext, MainLoop, Priority, SourceError, SourceId};
pub use resolve::{PropertyOptions, ResolveError, TypeTag, props_table, resolve, title_case};
pub use signal::{Accumulator, HandlerId, SignalError, SignalFlags, SignalSpec};
pub use spec::{FlagPreset, ParamFlags, PropertySpec, SpecError, SpecKind, canonical_name};
pub use types::{
    ClassRegistration, EnumMember, RegistrationError, TypeFlags, TypeHandle, TypeKind, TypeRegistry, TypeSystem,
};
pub use value::{Value, ValueType};
