//! Runtime configuration.
//!
//! A [`DeclareConfig`] is handed to [`MainContext::with_config`](crate::MainContext::with_config)
//! and read by every instance created on that context. All keys are optional
//! when loading from TOML:
//!
//! ```
//! use horizon_declare::config::{ClockMode, DeclareConfig, ObjectEquality};
//!
//! let config = DeclareConfig::from_toml_str(r#"
//!     clock = "manual"
//!     object-equality = "structural"
//! "#).unwrap();
//!
//! assert_eq!(config.clock, ClockMode::Manual);
//! assert_eq!(config.object_equality, ObjectEquality::Structural);
//! ```

use serde::Deserialize;

/// Where a [`MainContext`](crate::MainContext) takes its time from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClockMode {
    /// `std::time::Instant::now()`.
    #[default]
    System,
    /// A clock that only moves through `MainContext::advance`.
    Manual,
}

/// How two object-valued property values are compared when deciding whether
/// a write changed the property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectEquality {
    /// Same instance.
    #[default]
    Identity,
    /// Same class and identical stored property values.
    Structural,
}

/// When a stored property emits its change notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyPolicy {
    /// Only when the written value differs from the stored one.
    #[default]
    OnChange,
    /// On every write.
    Always,
}

/// Errors from loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed or had unknown values.
    #[error("Invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Configuration shared by a main context and the instances created on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeclareConfig {
    /// Time source for timeouts.
    pub clock: ClockMode,
    /// Default comparison for object-valued properties.
    pub object_equality: ObjectEquality,
    /// Default notification policy for stored properties.
    pub notify_policy: NotifyPolicy,
}

impl DeclareConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Set the clock mode.
    pub fn with_clock(mut self, clock: ClockMode) -> Self {
        self.clock = clock;
        self
    }

    /// Set the default object comparison.
    pub fn with_object_equality(mut self, equality: ObjectEquality) -> Self {
        self.object_equality = equality;
        self
    }

    /// Set the default notification policy.
    pub fn with_notify_policy(mut self, policy: NotifyPolicy) -> Self {
        self.notify_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeclareConfig::default();
        assert_eq!(config.clock, ClockMode::System);
        assert_eq!(config.object_equality, ObjectEquality::Identity);
        assert_eq!(config.notify_policy, NotifyPolicy::OnChange);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = DeclareConfig::from_toml_str("").unwrap();
        assert_eq!(config, DeclareConfig::default());
    }

    #[test]
    fn test_parse_all_keys() {
        let config = DeclareConfig::from_toml_str(
            "clock = \"manual\"\nobject-equality = \"identity\"\nnotify-policy = \"always\"\n",
        )
        .unwrap();
        assert_eq!(config.clock, ClockMode::Manual);
        assert_eq!(config.notify_policy, NotifyPolicy::Always);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = DeclareConfig::from_toml_str("tick-rate = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_builder_setters() {
        let config = DeclareConfig::default()
            .with_clock(ClockMode::Manual)
            .with_object_equality(ObjectEquality::Structural)
            .with_notify_policy(NotifyPolicy::Always);
        assert_eq!(config.clock, ClockMode::Manual);
        assert_eq!(config.object_equality, ObjectEquality::Structural);
        assert_eq!(config.notify_policy, NotifyPolicy::Always);
    }
}
