//! Debounced methods.
//!
//! A debounced method collapses a burst of calls into at most two real
//! invocations. Every call cancels the method's pending timer and schedules a
//! new one `interval` from now, so a burst ends once the method has been left
//! alone for a full interval.
//!
//! | trigger            | first call of a burst | when the timer fires          |
//! |--------------------|-----------------------|-------------------------------|
//! | `Leading`          | invoked immediately   | nothing                       |
//! | `Trailing`         | recorded              | invoked with the latest args  |
//! | `LeadingTrailing`  | invoked immediately   | invoked with the latest args, if any later call was recorded |
//!
//! State is kept per instance and per method name, so two debounced methods
//! on one instance never share a timer.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::class::MethodFn;
use crate::instance::Instance;
use crate::logging::targets;
use crate::main_loop::SourceId;
use crate::value::Value;

/// When a debounced method actually runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// On the first call of a burst.
    Leading,
    /// When the burst ends, with the last call's arguments.
    #[default]
    Trailing,
    /// Both.
    LeadingTrailing,
}

impl Trigger {
    /// Whether the first call of a burst runs immediately.
    pub fn is_leading(self) -> bool {
        matches!(self, Self::Leading | Self::LeadingTrailing)
    }

    /// Whether the end of a burst runs the last recorded call.
    pub fn is_trailing(self) -> bool {
        matches!(self, Self::Trailing | Self::LeadingTrailing)
    }

    /// The trigger's textual form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Leading => "leading",
            Self::Trailing => "trailing",
            Self::LeadingTrailing => "leading+trailing",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown trigger name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown debounce trigger '{0}'")]
pub struct UnknownTrigger(pub String);

impl FromStr for Trigger {
    type Err = UnknownTrigger;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leading" => Ok(Self::Leading),
            "trailing" => Ok(Self::Trailing),
            "leading+trailing" => Ok(Self::LeadingTrailing),
            other => Err(UnknownTrigger(other.to_owned())),
        }
    }
}

/// Debounce settings of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Debounce {
    /// Quiet period that ends a burst.
    pub interval: Duration,
    /// When the method runs.
    pub trigger: Trigger,
}

impl Debounce {
    /// Trailing debounce with the given interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            trigger: Trigger::default(),
        }
    }

    /// Trailing debounce with an interval in milliseconds.
    pub fn millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Set the trigger.
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }
}

/// Per-instance, per-method debounce bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct DebounceState {
    pub(crate) pending: Option<SourceId>,
    last_args: Option<Vec<Value>>,
    trailing_pending: bool,
}

/// Run one call of a debounced method.
pub(crate) fn call(instance: &Instance, method: &str, config: Debounce, func: MethodFn, args: Vec<Value>) {
    let leading_now = {
        let mut states = instance.debounce_states().borrow_mut();
        let state = states.entry(method.to_owned()).or_default();
        let leading_now = config.trigger.is_leading() && state.pending.is_none();
        if !leading_now && config.trigger.is_trailing() {
            state.last_args = Some(args.clone());
            state.trailing_pending = true;
        }
        leading_now
    };

    if leading_now {
        tracing::trace!(target: targets::DEBOUNCE, %instance, method, "leading call");
        func(instance, &args);
    }

    let previous = instance
        .debounce_states()
        .borrow_mut()
        .get_mut(method)
        .and_then(|state| state.pending.take());
    let context = instance.context();
    if let Some(previous) = previous {
        let _ = context.source_remove(previous);
    }

    let weak = instance.downgrade();
    let name = method.to_owned();
    let id = context.timeout_add_once(config.interval, move || {
        if let Some(instance) = weak.upgrade() {
            fire(&instance, &name, config.trigger, &func);
        }
    });
    if let Some(state) = instance.debounce_states().borrow_mut().get_mut(method) {
        state.pending = Some(id);
    }
}

fn fire(instance: &Instance, method: &str, trigger: Trigger, func: &MethodFn) {
    let trailing_args = {
        let mut states = instance.debounce_states().borrow_mut();
        let Some(state) = states.get_mut(method) else {
            return;
        };
        state.pending = None;
        let args = state.last_args.take();
        let run = trigger.is_trailing() && std::mem::take(&mut state.trailing_pending);
        run.then(|| args.unwrap_or_default())
    };

    if let Some(args) = trailing_args {
        tracing::trace!(target: targets::DEBOUNCE, %instance, method, "trailing call");
        func(instance, &args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_parse() {
        assert_eq!("leading+trailing".parse::<Trigger>(), Ok(Trigger::LeadingTrailing));
        assert_eq!("trailing".parse::<Trigger>(), Ok(Trigger::Trailing));
        assert!("both".parse::<Trigger>().is_err());
    }

    #[test]
    fn test_trigger_modes() {
        assert!(Trigger::Leading.is_leading());
        assert!(!Trigger::Leading.is_trailing());
        assert!(Trigger::LeadingTrailing.is_leading() && Trigger::LeadingTrailing.is_trailing());
        assert_eq!(Trigger::default(), Trigger::Trailing);
    }

    #[test]
    fn test_debounce_builder() {
        let debounce = Debounce::millis(250).trigger(Trigger::Leading);
        assert_eq!(debounce.interval, Duration::from_millis(250));
        assert_eq!(debounce.trigger, Trigger::Leading);
    }
}
