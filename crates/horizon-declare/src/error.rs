//! Error types for Horizon Declare.
//!
//! Every module reports its own error type. [`DeclareError`] wraps all of
//! them so applications can use `?` across module boundaries.

use crate::action::ActionError;
use crate::bridge::BridgeError;
use crate::class::{ClassError, ConstructError};
use crate::config::ConfigError;
use crate::instance::{MethodError, PropertyError};
use crate::main_loop::SourceError;
use crate::resolve::ResolveError;
use crate::signal::SignalError;
use crate::spec::SpecError;
use crate::types::RegistrationError;

/// The main error type for Horizon Declare operations.
#[derive(Debug, thiserror::Error)]
pub enum DeclareError {
    /// Descriptor resolution failed.
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),
    /// Descriptor construction or value validation failed.
    #[error("Spec error: {0}")]
    Spec(#[from] SpecError),
    /// The type system rejected a registration.
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),
    /// A class declaration was invalid.
    #[error("Class error: {0}")]
    Class(#[from] ClassError),
    /// An instance could not be constructed.
    #[error("Construct error: {0}")]
    Construct(#[from] ConstructError),
    /// Property, field or child access failed.
    #[error("Property error: {0}")]
    Property(#[from] PropertyError),
    /// A method call failed.
    #[error("Method error: {0}")]
    Method(#[from] MethodError),
    /// Signal connection or emission failed.
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),
    /// A main loop source could not be removed.
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    /// Action activation or update failed.
    #[error("Action error: {0}")]
    Action(#[from] ActionError),
    /// An awaited event was rejected or abandoned.
    #[error("Event error: {0}")]
    Bridge(#[from] BridgeError),
    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// A specialized Result type for Horizon Declare operations.
pub type Result<T> = std::result::Result<T, DeclareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_message() {
        let err: DeclareError = ActionError::UnknownAction("quit".to_owned()).into();
        assert_eq!(err.to_string(), "Action error: No action named 'quit'");
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error;
        let err: DeclareError = BridgeError::Abandoned.into();
        assert!(err.source().is_some());
    }
}
