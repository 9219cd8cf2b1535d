//! Dynamically typed property, signal and action values.

use std::fmt;

use crate::instance::Instance;
use crate::types::TypeHandle;

/// A value stored in a property, passed to a signal or carried by an action.
#[derive(Clone)]
pub enum Value {
    /// UTF-8 string.
    String(String),
    /// Boolean.
    Bool(bool),
    /// Unsigned 32-bit integer.
    UInt(u32),
    /// Signed 32-bit integer.
    Int(i32),
    /// Double-precision float.
    Double(f64),
    /// Member value of a registered enum type.
    Enum(i32),
    /// Reference to an instance, or null.
    Object(Option<Instance>),
}

/// The type of a [`Value`] as declared in a property, signal or action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// [`Value::String`].
    String,
    /// [`Value::Bool`].
    Bool,
    /// [`Value::UInt`].
    UInt,
    /// [`Value::Int`].
    Int,
    /// [`Value::Double`].
    Double,
    /// [`Value::Enum`] of the given enum type.
    Enum(TypeHandle),
    /// [`Value::Object`] holding an instance of the given type (or null).
    Object(TypeHandle),
}

impl ValueType {
    /// Short name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::UInt => "uint32",
            Self::Int => "int32",
            Self::Double => "double",
            Self::Enum(_) => "enum",
            Self::Object(_) => "object",
        }
    }
}

impl Value {
    /// Short name of this value's variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Bool(_) => "bool",
            Self::UInt(_) => "uint32",
            Self::Int(_) => "int32",
            Self::Double(_) => "double",
            Self::Enum(_) => "enum",
            Self::Object(_) => "object",
        }
    }

    /// The string, if this is a [`Value::String`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The boolean, if this is a [`Value::Bool`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer, if this is a [`Value::UInt`].
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            Self::UInt(n) => Some(*n),
            _ => None,
        }
    }

    /// The integer, if this is a [`Value::Int`].
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// The float, if this is a [`Value::Double`].
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(n) => Some(*n),
            _ => None,
        }
    }

    /// The member value, if this is a [`Value::Enum`].
    pub fn as_enum(&self) -> Option<i32> {
        match self {
            Self::Enum(n) => Some(*n),
            _ => None,
        }
    }

    /// The referenced instance, if this is a non-null [`Value::Object`].
    pub fn as_object(&self) -> Option<&Instance> {
        match self {
            Self::Object(Some(instance)) => Some(instance),
            _ => None,
        }
    }

    /// Numeric view of integer and float values.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Self::UInt(n) => Some(f64::from(*n)),
            Self::Int(n) => Some(f64::from(*n)),
            Self::Double(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether this value can be stored in a slot of type `ty`.
    ///
    /// Null objects fit any object type; non-null objects must be instances
    /// of the type or implement it.
    pub fn conforms_to(&self, ty: ValueType) -> bool {
        match (self, ty) {
            (Self::String(_), ValueType::String)
            | (Self::Bool(_), ValueType::Bool)
            | (Self::UInt(_), ValueType::UInt)
            | (Self::Int(_), ValueType::Int)
            | (Self::Double(_), ValueType::Double)
            | (Self::Enum(_), ValueType::Enum(_))
            | (Self::Object(None), ValueType::Object(_)) => true,
            (Self::Object(Some(instance)), ValueType::Object(handle)) => instance.is_a(handle),
            _ => false,
        }
    }

    /// Primitive equality, instance identity for objects.
    ///
    /// Floats compare with `==`, so `NaN` is never identical to itself.
    pub fn identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::Enum(a), Self::Enum(b)) => a == b,
            (Self::Object(None), Self::Object(None)) => true,
            (Self::Object(Some(a)), Self::Object(Some(b))) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Like [`identical`](Self::identical), except two distinct instances are
    /// equal when they share a class and their stored property values are
    /// pairwise identical.
    pub fn structurally_equal(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Object(Some(a)), Self::Object(Some(b))) => {
                if a.ptr_eq(b) {
                    return true;
                }
                if !a.class().ptr_eq(b.class()) {
                    return false;
                }
                let left = a.stored_values();
                let right = b.stored_values();
                left.len() == right.len()
                    && left
                        .iter()
                        .zip(&right)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.identical(vb))
            }
            _ => self.identical(other),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.identical(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::UInt(n) => f.debug_tuple("UInt").field(n).finish(),
            Self::Int(n) => f.debug_tuple("Int").field(n).finish(),
            Self::Double(n) => f.debug_tuple("Double").field(n).finish(),
            Self::Enum(n) => f.debug_tuple("Enum").field(n).finish(),
            Self::Object(None) => f.write_str("Object(null)"),
            Self::Object(Some(instance)) => write!(f, "Object({instance})"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::UInt(n) => write!(f, "{n}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Double(n) => write!(f, "{n}"),
            Self::Enum(n) => write!(f, "{n}"),
            Self::Object(None) => f.write_str("null"),
            Self::Object(Some(instance)) => write!(f, "{instance}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::UInt(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<Instance> for Value {
    fn from(value: Instance) -> Self {
        Self::Object(Some(value))
    }
}

impl From<Option<Instance>> for Value {
    fn from(value: Option<Instance>) -> Self {
        Self::Object(value)
    }
}
