//! Property descriptors.
//!
//! A [`PropertySpec`] is the immutable, fully resolved description of one
//! property: its name, human-readable nick and blurb, access flags, and the
//! type-specific bounds and default. Specs are normally produced by the
//! [`resolve`](crate::resolve) module; the typed constructors here are the
//! primitives it is built on and can be used directly for hand-written specs.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::types::TypeHandle;
use crate::value::{Value, ValueType};

bitflags! {
    /// Access flags of a property.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ParamFlags: u32 {
        /// The property can be read.
        const READABLE = 1;
        /// The property can be written.
        const WRITABLE = 1 << 1;
        /// Readable and writable.
        const READWRITE = Self::READABLE.bits() | Self::WRITABLE.bits();
        /// The property is set during construction.
        const CONSTRUCT = 1 << 2;
        /// The property can only be set during construction.
        const CONSTRUCT_ONLY = 1 << 3;
    }
}

/// Named access-flag combinations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FlagPreset {
    /// Read-only.
    Constant,
    /// Readable and writable at any time.
    #[default]
    ReadWrite,
    /// Settable at construction, freely settable afterwards.
    Construct,
    /// Settable only at construction.
    ConstructOnly,
}

impl FlagPreset {
    /// The concrete flag bits for this preset.
    pub const fn flags(self) -> ParamFlags {
        match self {
            Self::Constant => ParamFlags::READABLE,
            Self::ReadWrite => ParamFlags::READWRITE,
            Self::Construct => ParamFlags::READWRITE.union(ParamFlags::CONSTRUCT),
            Self::ConstructOnly => ParamFlags::READWRITE.union(ParamFlags::CONSTRUCT_ONLY),
        }
    }

    /// The preset's canonical upper-case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Constant => "CONSTANT",
            Self::ReadWrite => "READWRITE",
            Self::Construct => "CONSTRUCT",
            Self::ConstructOnly => "CONSTRUCT_ONLY",
        }
    }
}

impl fmt::Display for FlagPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown flag preset name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown flag preset '{0}'")]
pub struct UnknownFlagPreset(pub String);

impl FromStr for FlagPreset {
    type Err = UnknownFlagPreset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONSTANT" => Ok(Self::Constant),
            "READWRITE" => Ok(Self::ReadWrite),
            "CONSTRUCT" => Ok(Self::Construct),
            "CONSTRUCT_ONLY" => Ok(Self::ConstructOnly),
            other => Err(UnknownFlagPreset(other.to_owned())),
        }
    }
}

/// Errors from building a spec or checking a value against it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpecError {
    /// `min <= default <= max` does not hold.
    #[error("Invalid bounds for property '{name}': min {min}, max {max}, default {default}")]
    InvalidBounds {
        /// Property name.
        name: String,
        /// Lower bound.
        min: String,
        /// Upper bound.
        max: String,
        /// Default value.
        default: String,
    },
    /// A value of the wrong type was supplied.
    #[error("Property '{name}' expects {expected}, got {got}")]
    TypeMismatch {
        /// Property name.
        name: String,
        /// Expected type name.
        expected: &'static str,
        /// Supplied type name.
        got: &'static str,
    },
    /// A numeric value lies outside the property's bounds.
    #[error("Value {value} is out of range for property '{name}'")]
    OutOfRange {
        /// Property name.
        name: String,
        /// Rendered value.
        value: String,
    },
}

/// Type-specific part of a [`PropertySpec`].
#[derive(Debug, Clone, PartialEq)]
pub enum SpecKind {
    /// String property.
    String {
        /// Default value.
        default: String,
    },
    /// Boolean property.
    Bool {
        /// Default value.
        default: bool,
    },
    /// Unsigned 32-bit property.
    UInt {
        /// Lower bound.
        min: u32,
        /// Upper bound.
        max: u32,
        /// Default value.
        default: u32,
    },
    /// Signed 32-bit property.
    Int {
        /// Lower bound.
        min: i32,
        /// Upper bound.
        max: i32,
        /// Default value.
        default: i32,
    },
    /// Double property.
    Double {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
        /// Default value.
        default: f64,
    },
    /// Reference to an instance of `object_type`; defaults to null.
    Object {
        /// Required type of referenced instances.
        object_type: TypeHandle,
    },
    /// Member of a registered enum type.
    Enum {
        /// The enum type.
        enum_type: TypeHandle,
        /// Default member value.
        default: i32,
    },
}

/// A fully resolved property descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySpec {
    name: String,
    nick: String,
    blurb: String,
    flags: ParamFlags,
    kind: SpecKind,
}

/// Canonical (hyphenated) form of a property or field name.
pub fn canonical_name(name: &str) -> String {
    name.replace('_', "-")
}

fn check_bounds<T: PartialOrd + fmt::Display>(
    name: &str,
    min: T,
    max: T,
    default: T,
) -> Result<(), SpecError> {
    if min <= default && default <= max {
        Ok(())
    } else {
        Err(SpecError::InvalidBounds {
            name: name.to_owned(),
            min: min.to_string(),
            max: max.to_string(),
            default: default.to_string(),
        })
    }
}

impl PropertySpec {
    fn new(
        name: impl Into<String>,
        nick: impl Into<String>,
        blurb: impl Into<String>,
        flags: ParamFlags,
        kind: SpecKind,
    ) -> Self {
        Self {
            name: name.into(),
            nick: nick.into(),
            blurb: blurb.into(),
            flags,
            kind,
        }
    }

    /// A string property.
    pub fn string(
        name: impl Into<String>,
        nick: impl Into<String>,
        blurb: impl Into<String>,
        flags: ParamFlags,
        default: impl Into<String>,
    ) -> Self {
        Self::new(name, nick, blurb, flags, SpecKind::String { default: default.into() })
    }

    /// A boolean property.
    pub fn boolean(
        name: impl Into<String>,
        nick: impl Into<String>,
        blurb: impl Into<String>,
        flags: ParamFlags,
        default: bool,
    ) -> Self {
        Self::new(name, nick, blurb, flags, SpecKind::Bool { default })
    }

    /// An unsigned 32-bit property.
    pub fn uint(
        name: impl Into<String>,
        nick: impl Into<String>,
        blurb: impl Into<String>,
        flags: ParamFlags,
        min: u32,
        max: u32,
        default: u32,
    ) -> Result<Self, SpecError> {
        let name = name.into();
        check_bounds(&name, min, max, default)?;
        Ok(Self::new(name, nick, blurb, flags, SpecKind::UInt { min, max, default }))
    }

    /// A signed 32-bit property.
    pub fn int(
        name: impl Into<String>,
        nick: impl Into<String>,
        blurb: impl Into<String>,
        flags: ParamFlags,
        min: i32,
        max: i32,
        default: i32,
    ) -> Result<Self, SpecError> {
        let name = name.into();
        check_bounds(&name, min, max, default)?;
        Ok(Self::new(name, nick, blurb, flags, SpecKind::Int { min, max, default }))
    }

    /// A double property.
    pub fn double(
        name: impl Into<String>,
        nick: impl Into<String>,
        blurb: impl Into<String>,
        flags: ParamFlags,
        min: f64,
        max: f64,
        default: f64,
    ) -> Result<Self, SpecError> {
        let name = name.into();
        check_bounds(&name, min, max, default)?;
        Ok(Self::new(name, nick, blurb, flags, SpecKind::Double { min, max, default }))
    }

    /// An object-reference property.
    pub fn object(
        name: impl Into<String>,
        nick: impl Into<String>,
        blurb: impl Into<String>,
        flags: ParamFlags,
        object_type: TypeHandle,
    ) -> Self {
        Self::new(name, nick, blurb, flags, SpecKind::Object { object_type })
    }

    /// An enum property. Membership of `default` is the caller's concern.
    pub fn enumeration(
        name: impl Into<String>,
        nick: impl Into<String>,
        blurb: impl Into<String>,
        flags: ParamFlags,
        enum_type: TypeHandle,
        default: i32,
    ) -> Self {
        Self::new(name, nick, blurb, flags, SpecKind::Enum { enum_type, default })
    }

    /// The property name as declared.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The hyphenated name used in `notify::<name>` events.
    pub fn canonical_name(&self) -> String {
        canonical_name(&self.name)
    }

    /// Human-readable short name.
    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Human-readable description.
    pub fn blurb(&self) -> &str {
        &self.blurb
    }

    /// Access flags.
    pub fn flags(&self) -> ParamFlags {
        self.flags
    }

    /// Type-specific bounds and default.
    pub fn kind(&self) -> &SpecKind {
        &self.kind
    }

    /// Whether the property can be read.
    pub fn is_readable(&self) -> bool {
        self.flags.contains(ParamFlags::READABLE)
    }

    /// Whether the property can be written at all.
    pub fn is_writable(&self) -> bool {
        self.flags.contains(ParamFlags::WRITABLE)
    }

    /// Whether the property can only be written during construction.
    pub fn is_construct_only(&self) -> bool {
        self.flags.contains(ParamFlags::CONSTRUCT_ONLY)
    }

    /// The declared default as a [`Value`].
    pub fn default_value(&self) -> Value {
        match &self.kind {
            SpecKind::String { default } => Value::String(default.clone()),
            SpecKind::Bool { default } => Value::Bool(*default),
            SpecKind::UInt { default, .. } => Value::UInt(*default),
            SpecKind::Int { default, .. } => Value::Int(*default),
            SpecKind::Double { default, .. } => Value::Double(*default),
            SpecKind::Object { .. } => Value::Object(None),
            SpecKind::Enum { default, .. } => Value::Enum(*default),
        }
    }

    /// The value type stored by this property.
    pub fn value_type(&self) -> ValueType {
        match &self.kind {
            SpecKind::String { .. } => ValueType::String,
            SpecKind::Bool { .. } => ValueType::Bool,
            SpecKind::UInt { .. } => ValueType::UInt,
            SpecKind::Int { .. } => ValueType::Int,
            SpecKind::Double { .. } => ValueType::Double,
            SpecKind::Object { object_type } => ValueType::Object(*object_type),
            SpecKind::Enum { enum_type, .. } => ValueType::Enum(*enum_type),
        }
    }

    /// Check that `value` has this property's type and lies within its bounds.
    pub fn check_value(&self, value: &Value) -> Result<(), SpecError> {
        let expected = self.value_type();
        if !value.conforms_to(expected) {
            return Err(SpecError::TypeMismatch {
                name: self.name.clone(),
                expected: expected.name(),
                got: value.type_name(),
            });
        }
        let in_range = match (&self.kind, value) {
            (SpecKind::UInt { min, max, .. }, Value::UInt(n)) => (min..=max).contains(&n),
            (SpecKind::Int { min, max, .. }, Value::Int(n)) => (min..=max).contains(&n),
            (SpecKind::Double { min, max, .. }, Value::Double(n)) => *min <= *n && *n <= *max,
            _ => true,
        };
        if in_range {
            Ok(())
        } else {
            Err(SpecError::OutOfRange {
                name: self.name.clone(),
                value: value.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_presets() {
        assert_eq!(FlagPreset::Constant.flags(), ParamFlags::READABLE);
        assert_eq!(FlagPreset::default(), FlagPreset::ReadWrite);
        assert!(FlagPreset::Construct.flags().contains(ParamFlags::CONSTRUCT | ParamFlags::WRITABLE));
        assert!(FlagPreset::ConstructOnly.flags().contains(ParamFlags::CONSTRUCT_ONLY));
    }

    #[test]
    fn test_flag_preset_parse() {
        assert_eq!("CONSTRUCT_ONLY".parse::<FlagPreset>(), Ok(FlagPreset::ConstructOnly));
        assert_eq!(
            "readwrite".parse::<FlagPreset>(),
            Err(UnknownFlagPreset("readwrite".to_owned()))
        );
    }

    #[test]
    fn test_numeric_bounds_checked() {
        let err = PropertySpec::uint("count", "Count", "Count property", ParamFlags::READWRITE, 5, 10, 2)
            .unwrap_err();
        assert!(matches!(err, SpecError::InvalidBounds { .. }));

        let spec =
            PropertySpec::int("delta", "Delta", "Delta property", ParamFlags::READWRITE, -5, 5, 0).unwrap();
        assert_eq!(spec.default_value(), Value::Int(0));
    }

    #[test]
    fn test_check_value() {
        let spec =
            PropertySpec::double("ratio", "Ratio", "Ratio property", ParamFlags::READWRITE, 0.0, 1.0, 0.5)
                .unwrap();
        assert!(spec.check_value(&Value::Double(0.25)).is_ok());
        assert!(matches!(
            spec.check_value(&Value::Double(1.5)),
            Err(SpecError::OutOfRange { .. })
        ));
        assert!(matches!(
            spec.check_value(&Value::Int(1)),
            Err(SpecError::TypeMismatch { expected: "double", got: "int32", .. })
        ));
    }

    #[test]
    fn test_canonical_name() {
        let spec = PropertySpec::boolean("is_busy", "Is Busy", "Is Busy property", ParamFlags::READWRITE, false);
        assert_eq!(spec.canonical_name(), "is-busy");
        assert!(spec.is_writable());
        assert!(!spec.is_construct_only());
    }
}
