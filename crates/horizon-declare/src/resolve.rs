//! Resolution of property type tags into descriptors.
//!
//! [`resolve`] turns a `(name, type tag, options)` triple into a complete
//! [`PropertySpec`]. Unset options are filled in:
//!
//! | option  | default                                                   |
//! |---------|-----------------------------------------------------------|
//! | `nick`  | the name, title-cased (`is_busy` becomes `Is Busy`)        |
//! | `blurb` | `"{nick} property"`                                       |
//! | `flags` | [`FlagPreset::ReadWrite`]                                 |
//! | `min`   | `0` for numeric tags                                      |
//! | `max`   | the natural maximum of the numeric type                   |
//! | `default` | `min` for numeric tags, `""`, `false`, first enum member |
//!
//! A supplied nick is title-cased as well.
//!
//! # Example
//!
//! ```
//! use horizon_declare::{resolve, PropertyOptions, TypeRegistry, Value};
//!
//! let types = TypeRegistry::new();
//! let spec = resolve(&types, "retry_count", "uint32", &PropertyOptions::new().min(1.0)).unwrap();
//!
//! assert_eq!(spec.nick(), "Retry Count");
//! assert_eq!(spec.blurb(), "Retry Count property");
//! assert_eq!(spec.default_value(), Value::UInt(1));
//! ```

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::spec::{FlagPreset, PropertySpec, SpecError};
use crate::types::{TypeHandle, TypeKind, TypeSystem};
use crate::value::Value;

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w\S*").expect("word pattern is a valid regex"));

/// An abstract property type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// `"string"`
    String,
    /// `"bool"`
    Bool,
    /// `"uint32"`
    UInt32,
    /// `"int32"`
    Int32,
    /// `"double"`
    Double,
    /// A registered class, interface or enum.
    Type(TypeHandle),
    /// A type referenced by its registered name.
    Named(String),
}

impl From<&str> for TypeTag {
    fn from(tag: &str) -> Self {
        match tag {
            "string" => Self::String,
            "bool" => Self::Bool,
            "uint32" => Self::UInt32,
            "int32" => Self::Int32,
            "double" => Self::Double,
            other => Self::Named(other.to_owned()),
        }
    }
}

impl From<TypeHandle> for TypeTag {
    fn from(handle: TypeHandle) -> Self {
        Self::Type(handle)
    }
}

/// Optional descriptor settings; anything left unset is defaulted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyOptions {
    nick: Option<String>,
    blurb: Option<String>,
    flags: FlagPreset,
    default: Option<Value>,
    min: Option<f64>,
    max: Option<f64>,
}

impl PropertyOptions {
    /// Options with every field unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Human-readable short name. Title-cased on resolution.
    pub fn nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = Some(nick.into());
        self
    }

    /// Human-readable description.
    pub fn blurb(mut self, blurb: impl Into<String>) -> Self {
        self.blurb = Some(blurb.into());
        self
    }

    /// Access-flag preset.
    pub fn flags(mut self, flags: FlagPreset) -> Self {
        self.flags = flags;
        self
    }

    /// Default value.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Lower bound of a numeric property.
    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Upper bound of a numeric property.
    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// The configured flag preset.
    pub fn flag_preset(&self) -> FlagPreset {
        self.flags
    }
}

/// Errors from resolving a descriptor. All of them are declaration mistakes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    /// The type tag is not a primitive and not a registered class, interface or enum.
    #[error("Unsupported property type '{0}'")]
    UnsupportedType(String),
    /// An option was given that the type does not take.
    #[error("Option '{option}' does not apply to property '{name}'")]
    InvalidOption {
        /// Property name.
        name: String,
        /// The option.
        option: &'static str,
    },
    /// A numeric option cannot be represented by the property's type.
    #[error("Option '{option}' of property '{name}' cannot hold {value}")]
    InvalidNumber {
        /// Property name.
        name: String,
        /// The option.
        option: &'static str,
        /// Supplied value.
        value: f64,
    },
    /// The default value has the wrong type.
    #[error("Default of property '{name}' must be {expected}, got {got}")]
    DefaultTypeMismatch {
        /// Property name.
        name: String,
        /// Expected type name.
        expected: &'static str,
        /// Supplied type name.
        got: &'static str,
    },
    /// The default value is not a member of the enum.
    #[error("Default {value} of property '{name}' is not a member of its enum")]
    InvalidEnumDefault {
        /// Property name.
        name: String,
        /// Supplied value.
        value: i32,
    },
    /// The assembled descriptor is inconsistent.
    #[error(transparent)]
    Spec(#[from] SpecError),
}

/// Render a name as space-separated capitalized words.
pub fn title_case(name: &str) -> String {
    let spaced = name.replace(['_', '-'], " ");
    WORD.replace_all(&spaced, |caps: &regex::Captures<'_>| {
        let mut chars = caps[0].chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect::<String>(),
            None => String::new(),
        }
    })
    .into_owned()
}

/// Build a name-keyed table from descriptors; later entries win.
pub fn props_table(specs: impl IntoIterator<Item = PropertySpec>) -> BTreeMap<String, PropertySpec> {
    specs
        .into_iter()
        .map(|spec| (spec.name().to_owned(), spec))
        .collect()
}

/// Resolve a property descriptor.
///
/// Named tags and handles are looked up in `types`; anything that is not a
/// primitive, a class, an interface or an enum is rejected.
pub fn resolve(
    types: &dyn TypeSystem,
    name: &str,
    tag: impl Into<TypeTag>,
    options: &PropertyOptions,
) -> Result<PropertySpec, ResolveError> {
    let tag = tag.into();
    let nick = title_case(options.nick.as_deref().unwrap_or(name));
    let blurb = options
        .blurb
        .clone()
        .unwrap_or_else(|| format!("{nick} property"));
    let flags = options.flags.flags();
    let r = Resolution { name, options };

    match tag {
        TypeTag::String => {
            r.reject_bounds()?;
            let default = match &options.default {
                None => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => return Err(r.mismatch("string", other)),
            };
            Ok(PropertySpec::string(name, nick, blurb, flags, default))
        }
        TypeTag::Bool => {
            r.reject_bounds()?;
            let default = match &options.default {
                None => false,
                Some(Value::Bool(b)) => *b,
                Some(other) => return Err(r.mismatch("bool", other)),
            };
            Ok(PropertySpec::boolean(name, nick, blurb, flags, default))
        }
        TypeTag::UInt32 => {
            let (min, max, default) = r.numeric(u32::MAX.into(), |n| {
                (n.fract() == 0.0 && n >= 0.0 && n <= f64::from(u32::MAX)).then_some(n as u32)
            })?;
            Ok(PropertySpec::uint(name, nick, blurb, flags, min, max, default)?)
        }
        TypeTag::Int32 => {
            let (min, max, default) = r.numeric(i32::MAX.into(), |n| {
                (n.fract() == 0.0 && n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX))
                    .then_some(n as i32)
            })?;
            Ok(PropertySpec::int(name, nick, blurb, flags, min, max, default)?)
        }
        TypeTag::Double => {
            let (min, max, default) = r.numeric(f64::MAX, |n| (!n.is_nan()).then_some(n))?;
            Ok(PropertySpec::double(name, nick, blurb, flags, min, max, default)?)
        }
        TypeTag::Named(type_name) => {
            let handle = types
                .lookup(&type_name)
                .ok_or(ResolveError::UnsupportedType(type_name))?;
            r.structural(types, handle, nick, blurb, flags)
        }
        TypeTag::Type(handle) => r.structural(types, handle, nick, blurb, flags),
    }
}

struct Resolution<'a> {
    name: &'a str,
    options: &'a PropertyOptions,
}

impl Resolution<'_> {
    fn reject_bounds(&self) -> Result<(), ResolveError> {
        let option = if self.options.min.is_some() {
            "min"
        } else if self.options.max.is_some() {
            "max"
        } else {
            return Ok(());
        };
        Err(ResolveError::InvalidOption {
            name: self.name.to_owned(),
            option,
        })
    }

    fn mismatch(&self, expected: &'static str, got: &Value) -> ResolveError {
        ResolveError::DefaultTypeMismatch {
            name: self.name.to_owned(),
            expected,
            got: got.type_name(),
        }
    }

    fn convert<T>(
        &self,
        option: &'static str,
        value: f64,
        convert: &impl Fn(f64) -> Option<T>,
    ) -> Result<T, ResolveError> {
        convert(value).ok_or_else(|| ResolveError::InvalidNumber {
            name: self.name.to_owned(),
            option,
            value,
        })
    }

    /// `(min, max, default)` with `min = 0`, `max = natural_max`, `default = min`.
    fn numeric<T: Copy>(
        &self,
        natural_max: f64,
        convert: impl Fn(f64) -> Option<T>,
    ) -> Result<(T, T, T), ResolveError> {
        let min = self.convert("min", self.options.min.unwrap_or(0.0), &convert)?;
        let max = self.convert("max", self.options.max.unwrap_or(natural_max), &convert)?;
        let default = match &self.options.default {
            None => min,
            Some(value) => {
                let n = value.to_f64().ok_or_else(|| self.mismatch("number", value))?;
                self.convert("default", n, &convert)?
            }
        };
        Ok((min, max, default))
    }

    fn structural(
        &self,
        types: &dyn TypeSystem,
        handle: TypeHandle,
        nick: String,
        blurb: String,
        flags: crate::spec::ParamFlags,
    ) -> Result<PropertySpec, ResolveError> {
        let unsupported = || {
            ResolveError::UnsupportedType(
                types
                    .type_name(handle)
                    .unwrap_or_else(|| format!("{handle:?}")),
            )
        };
        match types.kind(handle).ok_or_else(unsupported)? {
            TypeKind::Object | TypeKind::Interface => {
                self.reject_bounds()?;
                if self.options.default.is_some() {
                    return Err(ResolveError::InvalidOption {
                        name: self.name.to_owned(),
                        option: "default",
                    });
                }
                Ok(PropertySpec::object(self.name, nick, blurb, flags, handle))
            }
            TypeKind::Enum => {
                self.reject_bounds()?;
                let members = types.enum_members(handle).ok_or_else(unsupported)?;
                let default = match &self.options.default {
                    Some(Value::Enum(n) | Value::Int(n)) => *n,
                    Some(other) => return Err(self.mismatch("enum", other)),
                    None => members.first().map(|m| m.value).ok_or_else(unsupported)?,
                };
                if !members.iter().any(|m| m.value == default) {
                    return Err(ResolveError::InvalidEnumDefault {
                        name: self.name.to_owned(),
                        value: default,
                    });
                }
                Ok(PropertySpec::enumeration(self.name, nick, blurb, flags, handle, default))
            }
        }
    }
}
