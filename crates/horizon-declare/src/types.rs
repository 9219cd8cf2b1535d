//! The type system classes are registered into.
//!
//! [`TypeSystem`] is the seam between class declarations and the object
//! system that owns type identity: it accepts one [`ClassRegistration`] per
//! class and answers the capability queries the resolver needs (is this name
//! a class, an interface, an enum, and what are its members).
//!
//! [`TypeRegistry`] is the in-process implementation. It starts with four
//! built-in object types:
//!
//! - `Object`: the root of every class hierarchy
//! - `Widget`: an `Object`, owns a per-instance action group
//! - `Window`: a `Widget`, registers actions directly
//! - `Application`: an `Object`, registers actions directly and binds accelerators
//!
//! The registry is cheap to clone and can be shared between threads.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;
use slotmap::{SlotMap, new_key_type};

use crate::logging::targets;
use crate::signal::SignalSpec;
use crate::spec::PropertySpec;

new_key_type! {
    /// Handle to a type registered in a [`TypeSystem`].
    pub struct TypeHandle;
}

/// What a registered type is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// An instantiable (or abstract) object class.
    Object,
    /// A capability type listed in a class's `implements`.
    Interface,
    /// An enumerated type.
    Enum,
}

/// One member of a registered enum type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumMember {
    /// Numeric value.
    pub value: i32,
    /// Member name.
    pub name: String,
}

bitflags! {
    /// Flags of a registered class.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u32 {
        /// The class cannot be instantiated.
        const ABSTRACT = 1;
        /// The class cannot be subclassed.
        const FINAL = 1 << 1;
    }
}

/// Everything the type system needs to register one class.
///
/// Produced by [`ClassBuilder::finalize`](crate::ClassBuilder::finalize) and
/// passed to [`TypeSystem::register_class`] exactly once.
#[derive(Debug, Clone)]
pub struct ClassRegistration {
    /// Type name, unique within the type system.
    pub type_name: String,
    /// Parent object type.
    pub parent: TypeHandle,
    /// Template resource path (`resource://<path>.ui`).
    pub template: Option<String>,
    /// Names of template-bound children.
    pub internal_children: Vec<String>,
    /// Signal table, keyed by signal name.
    pub signals: BTreeMap<String, SignalSpec>,
    /// CSS element name.
    pub css_name: Option<String>,
    /// Property descriptors, unique by name.
    pub properties: Vec<PropertySpec>,
    /// Implemented interfaces.
    pub implements: Vec<TypeHandle>,
    /// Class flags.
    pub type_flags: TypeFlags,
}

/// Errors from registering a type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// Type names must not be empty.
    #[error("Type name must not be empty")]
    EmptyTypeName,
    /// The name is already taken by another type.
    #[error("Type '{0}' is already registered")]
    DuplicateTypeName(String),
    /// The parent handle does not name an object type.
    #[error("Parent of '{type_name}' is not a registered object type")]
    InvalidParent {
        /// Type being registered.
        type_name: String,
    },
    /// The parent is marked final.
    #[error("Cannot derive '{type_name}' from final type '{parent}'")]
    FinalParent {
        /// Type being registered.
        type_name: String,
        /// The final parent.
        parent: String,
    },
    /// An `implements` entry is not an interface.
    #[error("'{type_name}' cannot implement a type that is not an interface")]
    NotAnInterface {
        /// Type being registered.
        type_name: String,
    },
    /// An enum was registered without members.
    #[error("Enum '{0}' has no members")]
    EmptyEnum(String),
    /// Two members of an enum share a value or a name.
    #[error("Enum '{type_name}' declares member '{member}' twice")]
    DuplicateEnumMember {
        /// Enum being registered.
        type_name: String,
        /// The repeated member.
        member: String,
    },
}

/// The registration entry point and capability queries of an object system.
pub trait TypeSystem {
    /// Register a class. Called once per class, before any instance exists.
    fn register_class(&self, registration: ClassRegistration) -> Result<TypeHandle, RegistrationError>;

    /// Find a type by name.
    fn lookup(&self, name: &str) -> Option<TypeHandle>;

    /// Name of a registered type.
    fn type_name(&self, handle: TypeHandle) -> Option<String>;

    /// Kind of a registered type.
    fn kind(&self, handle: TypeHandle) -> Option<TypeKind>;

    /// Flags of a registered type; empty for unknown handles.
    fn flags(&self, handle: TypeHandle) -> TypeFlags;

    /// Parent of an object type.
    fn parent(&self, handle: TypeHandle) -> Option<TypeHandle>;

    /// Interfaces declared directly by an object type.
    fn interfaces(&self, handle: TypeHandle) -> Vec<TypeHandle>;

    /// Members of an enum type, in registration order.
    fn enum_members(&self, handle: TypeHandle) -> Option<Vec<EnumMember>>;

    /// The type itself, its ancestors, and every interface any of them implements.
    fn ancestry(&self, handle: TypeHandle) -> Vec<TypeHandle> {
        let mut chain = Vec::new();
        let mut current = Some(handle);
        while let Some(ty) = current {
            chain.push(ty);
            current = self.parent(ty);
        }
        let interfaces: Vec<TypeHandle> = chain.iter().flat_map(|&ty| self.interfaces(ty)).collect();
        for iface in interfaces {
            if !chain.contains(&iface) {
                chain.push(iface);
            }
        }
        chain
    }

    /// Whether `handle` is `ancestor`, derives from it, or implements it.
    fn is_a(&self, handle: TypeHandle, ancestor: TypeHandle) -> bool {
        self.ancestry(handle).contains(&ancestor)
    }
}

#[derive(Debug, Clone)]
struct TypeInfo {
    name: String,
    kind: TypeKind,
    parent: Option<TypeHandle>,
    flags: TypeFlags,
    interfaces: Vec<TypeHandle>,
    members: Vec<EnumMember>,
    registration: Option<ClassRegistration>,
}

impl TypeInfo {
    fn new(name: &str, kind: TypeKind, parent: Option<TypeHandle>) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            parent,
            flags: TypeFlags::empty(),
            interfaces: Vec::new(),
            members: Vec::new(),
            registration: None,
        }
    }
}

struct RegistryState {
    types: SlotMap<TypeHandle, TypeInfo>,
    by_name: HashMap<String, TypeHandle>,
    object: TypeHandle,
    widget: TypeHandle,
    window: TypeHandle,
    application: TypeHandle,
}

impl RegistryState {
    fn new() -> Self {
        let mut types = SlotMap::with_key();
        let object = types.insert(TypeInfo::new("Object", TypeKind::Object, None));
        let widget = types.insert(TypeInfo::new("Widget", TypeKind::Object, Some(object)));
        let window = types.insert(TypeInfo::new("Window", TypeKind::Object, Some(widget)));
        let application = types.insert(TypeInfo::new("Application", TypeKind::Object, Some(object)));

        let by_name = types.iter().map(|(handle, info)| (info.name.clone(), handle)).collect();
        Self {
            types,
            by_name,
            object,
            widget,
            window,
            application,
        }
    }

    fn check_name(&self, name: &str) -> Result<(), RegistrationError> {
        if name.is_empty() {
            return Err(RegistrationError::EmptyTypeName);
        }
        if self.by_name.contains_key(name) {
            return Err(RegistrationError::DuplicateTypeName(name.to_owned()));
        }
        Ok(())
    }

    fn insert(&mut self, info: TypeInfo) -> TypeHandle {
        let name = info.name.clone();
        let handle = self.types.insert(info);
        self.by_name.insert(name, handle);
        handle
    }
}

/// Thread-safe, in-process [`TypeSystem`].
#[derive(Clone)]
pub struct TypeRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl TypeRegistry {
    /// Create a registry holding only the built-in types.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::new())),
        }
    }

    /// The root `Object` type.
    pub fn object_type(&self) -> TypeHandle {
        self.state.read().object
    }

    /// The built-in `Widget` type.
    pub fn widget_type(&self) -> TypeHandle {
        self.state.read().widget
    }

    /// The built-in `Window` type.
    pub fn window_type(&self) -> TypeHandle {
        self.state.read().window
    }

    /// The built-in `Application` type.
    pub fn application_type(&self) -> TypeHandle {
        self.state.read().application
    }

    /// Register an enum type from `(value, name)` pairs.
    pub fn register_enum<'a, I>(&self, name: &str, members: I) -> Result<TypeHandle, RegistrationError>
    where
        I: IntoIterator<Item = (i32, &'a str)>,
    {
        let mut state = self.state.write();
        state.check_name(name)?;

        let mut info = TypeInfo::new(name, TypeKind::Enum, None);
        for (value, member) in members {
            if info.members.iter().any(|m| m.value == value || m.name == member) {
                return Err(RegistrationError::DuplicateEnumMember {
                    type_name: name.to_owned(),
                    member: member.to_owned(),
                });
            }
            info.members.push(EnumMember {
                value,
                name: member.to_owned(),
            });
        }
        if info.members.is_empty() {
            return Err(RegistrationError::EmptyEnum(name.to_owned()));
        }

        let handle = state.insert(info);
        tracing::debug!(target: targets::CLASS, type_name = name, "registered enum");
        Ok(handle)
    }

    /// Register an interface type.
    pub fn register_interface(&self, name: &str) -> Result<TypeHandle, RegistrationError> {
        let mut state = self.state.write();
        state.check_name(name)?;
        let handle = state.insert(TypeInfo::new(name, TypeKind::Interface, None));
        tracing::debug!(target: targets::CLASS, type_name = name, "registered interface");
        Ok(handle)
    }

    /// The bundle a class was registered with.
    pub fn registration(&self, handle: TypeHandle) -> Option<ClassRegistration> {
        self.state.read().types.get(handle)?.registration.clone()
    }

    /// Number of registered types, built-ins included.
    pub fn len(&self) -> usize {
        self.state.read().types.len()
    }

    /// Always `false`: the built-ins are registered on creation.
    pub fn is_empty(&self) -> bool {
        self.state.read().types.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        let mut names: Vec<&str> = state.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TypeRegistry").field("types", &names).finish()
    }
}

impl TypeSystem for TypeRegistry {
    fn register_class(&self, registration: ClassRegistration) -> Result<TypeHandle, RegistrationError> {
        let mut state = self.state.write();
        let type_name = registration.type_name.clone();
        state.check_name(&type_name)?;

        let parent = state
            .types
            .get(registration.parent)
            .filter(|info| info.kind == TypeKind::Object)
            .ok_or_else(|| RegistrationError::InvalidParent {
                type_name: type_name.clone(),
            })?;
        if parent.flags.contains(TypeFlags::FINAL) {
            return Err(RegistrationError::FinalParent {
                type_name,
                parent: parent.name.clone(),
            });
        }

        let all_interfaces = registration.implements.iter().all(|&iface| {
            state
                .types
                .get(iface)
                .is_some_and(|info| info.kind == TypeKind::Interface)
        });
        if !all_interfaces {
            return Err(RegistrationError::NotAnInterface { type_name });
        }

        let mut info = TypeInfo::new(&type_name, TypeKind::Object, Some(registration.parent));
        info.flags = registration.type_flags;
        info.interfaces = registration.implements.clone();
        tracing::debug!(
            target: targets::CLASS,
            type_name = %type_name,
            properties = registration.properties.len(),
            signals = registration.signals.len(),
            children = registration.internal_children.len(),
            "registered class"
        );
        info.registration = Some(registration);
        Ok(state.insert(info))
    }

    fn lookup(&self, name: &str) -> Option<TypeHandle> {
        self.state.read().by_name.get(name).copied()
    }

    fn type_name(&self, handle: TypeHandle) -> Option<String> {
        self.state.read().types.get(handle).map(|info| info.name.clone())
    }

    fn kind(&self, handle: TypeHandle) -> Option<TypeKind> {
        self.state.read().types.get(handle).map(|info| info.kind)
    }

    fn flags(&self, handle: TypeHandle) -> TypeFlags {
        self.state
            .read()
            .types
            .get(handle)
            .map(|info| info.flags)
            .unwrap_or_default()
    }

    fn parent(&self, handle: TypeHandle) -> Option<TypeHandle> {
        self.state.read().types.get(handle)?.parent
    }

    fn interfaces(&self, handle: TypeHandle) -> Vec<TypeHandle> {
        self.state
            .read()
            .types
            .get(handle)
            .map(|info| info.interfaces.clone())
            .unwrap_or_default()
    }

    fn enum_members(&self, handle: TypeHandle) -> Option<Vec<EnumMember>> {
        let state = self.state.read();
        let info = state.types.get(handle)?;
        (info.kind == TypeKind::Enum).then(|| info.members.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(name: &str, parent: TypeHandle) -> ClassRegistration {
        ClassRegistration {
            type_name: name.to_owned(),
            parent,
            template: None,
            internal_children: Vec::new(),
            signals: BTreeMap::new(),
            css_name: None,
            properties: Vec::new(),
            implements: Vec::new(),
            type_flags: TypeFlags::empty(),
        }
    }

    #[test]
    fn test_builtin_hierarchy() {
        let types = TypeRegistry::new();
        assert_eq!(types.len(), 4);
        assert!(types.is_a(types.window_type(), types.widget_type()));
        assert!(types.is_a(types.window_type(), types.object_type()));
        assert!(!types.is_a(types.application_type(), types.widget_type()));
        assert_eq!(types.lookup("Window"), Some(types.window_type()));
    }

    #[test]
    fn test_register_class() {
        let types = TypeRegistry::new();
        let iface = types.register_interface("Scrollable").unwrap();
        let mut reg = registration("Panel", types.widget_type());
        reg.implements.push(iface);

        let panel = types.register_class(reg).unwrap();
        assert_eq!(types.kind(panel), Some(TypeKind::Object));
        assert!(types.is_a(panel, iface));
        assert!(types.is_a(panel, types.object_type()));
        assert!(types.registration(panel).is_some());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let types = TypeRegistry::new();
        let reg = registration("Widget", types.object_type());
        assert_eq!(
            types.register_class(reg),
            Err(RegistrationError::DuplicateTypeName("Widget".to_owned()))
        );
    }

    #[test]
    fn test_final_parent_rejected() {
        let types = TypeRegistry::new();
        let mut sealed = registration("Sealed", types.object_type());
        sealed.type_flags = TypeFlags::FINAL;
        let sealed = types.register_class(sealed).unwrap();

        let child = registration("Child", sealed);
        assert!(matches!(
            types.register_class(child),
            Err(RegistrationError::FinalParent { .. })
        ));
    }

    #[test]
    fn test_implements_must_be_interface() {
        let types = TypeRegistry::new();
        let mut reg = registration("Odd", types.object_type());
        reg.implements.push(types.widget_type());
        assert!(matches!(
            types.register_class(reg),
            Err(RegistrationError::NotAnInterface { .. })
        ));
    }

    #[test]
    fn test_register_enum() {
        let types = TypeRegistry::new();
        let mode = types
            .register_enum("Mode", [(0, "idle"), (1, "busy")])
            .unwrap();
        let members = types.enum_members(mode).unwrap();
        assert_eq!(members[1].name, "busy");
        assert_eq!(types.enum_members(types.object_type()), None);

        assert_eq!(
            types.register_enum("Empty", Vec::<(i32, &str)>::new()),
            Err(RegistrationError::EmptyEnum("Empty".to_owned()))
        );
        assert!(matches!(
            types.register_enum("Twice", [(0, "a"), (0, "b")]),
            Err(RegistrationError::DuplicateEnumMember { .. })
        ));
    }
}
