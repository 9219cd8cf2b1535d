//! Logging facilities for Horizon Declare.
//!
//! The crate is instrumented with `tracing` and never installs a subscriber
//! itself. To see its output, install one in the application:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("horizon_declare=debug")
//!     .init();
//! ```
//!
//! Failures of deferred `ready` callbacks are reported at `error` level on
//! [`targets::READY`]; they are never propagated into construction.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Crate-wide target.
    pub const CORE: &str = "horizon_declare";
    /// Class building and registration.
    pub const CLASS: &str = "horizon_declare::class";
    /// Stored and computed property access.
    pub const PROPERTY: &str = "horizon_declare::property";
    /// Signal connection and emission.
    pub const SIGNAL: &str = "horizon_declare::signal";
    /// Main loop dispatch.
    pub const MAIN_LOOP: &str = "horizon_declare::main_loop";
    /// Debounced method scheduling.
    pub const DEBOUNCE: &str = "horizon_declare::debounce";
    /// Action creation and activation.
    pub const ACTION: &str = "horizon_declare::action";
    /// Single-shot event futures.
    pub const BRIDGE: &str = "horizon_declare::bridge";
    /// Deferred post-construction callbacks.
    pub const READY: &str = "horizon_declare::ready";
}

/// Span names used for `tracing::instrument`.
pub mod span_names {
    /// Class finalization span.
    pub const FINALIZE: &str = "horizon_declare::finalize";
    /// Instance construction span.
    pub const CONSTRUCT: &str = "horizon_declare::construct";
}
