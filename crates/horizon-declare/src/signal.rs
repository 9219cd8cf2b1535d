//! Signal descriptors and per-instance handler tables.
//!
//! Signals are declared per class with a [`SignalSpec`] and connected per
//! instance through [`Instance::connect`](crate::Instance::connect). Signal
//! names may carry a detail (`notify::title`): a handler connected with a
//! detail only sees emissions with that detail, a handler connected without
//! one sees every emission of the signal.
//!
//! Every class inherits the detailed `notify` signal, which carries the
//! canonical name of the changed property as its single argument.
//!
//! # Example
//!
//! ```
//! use horizon_declare::{Accumulator, SignalSpec, ValueType};
//!
//! let spec = SignalSpec::new()
//!     .param(ValueType::Int)
//!     .param(ValueType::Int)
//!     .returns(ValueType::Bool)
//!     .accumulator(Accumulator::TrueHandled);
//!
//! assert_eq!(spec.param_types.len(), 2);
//! ```

use std::rc::Rc;

use bitflags::bitflags;
use slotmap::{SlotMap, new_key_type};

use crate::instance::Instance;
use crate::value::{Value, ValueType};

/// Name of the built-in property change signal.
pub const NOTIFY_SIGNAL: &str = "notify";

new_key_type! {
    /// Identifier of a handler connected to an instance signal.
    ///
    /// Returned by [`Instance::connect`](crate::Instance::connect) and accepted by
    /// [`Instance::disconnect`](crate::Instance::disconnect).
    pub struct HandlerId;
}

bitflags! {
    /// Emission flags of a signal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SignalFlags: u32 {
        /// Class handler runs before user handlers.
        const RUN_FIRST = 1;
        /// Class handler runs after user handlers.
        const RUN_LAST = 1 << 1;
        /// The signal accepts a `::detail` suffix.
        const DETAILED = 1 << 2;
        /// Recursive emission restarts instead of nesting.
        const NO_RECURSE = 1 << 3;
        /// The signal may be emitted by external code.
        const ACTION = 1 << 4;
    }
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self::RUN_LAST
    }
}

/// How handler return values are combined into the emission result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Accumulator {
    /// The last handler's return value wins.
    #[default]
    Last,
    /// The first handler that returns a value stops the emission.
    FirstWins,
    /// A handler returning `true` stops the emission.
    TrueHandled,
}

/// Descriptor of one signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalSpec {
    /// Emission flags.
    pub flags: SignalFlags,
    /// Argument types, in order.
    pub param_types: Vec<ValueType>,
    /// Type of the handlers' return value, if any.
    pub return_type: Option<ValueType>,
    /// Combination of handler return values.
    pub accumulator: Accumulator,
}

impl SignalSpec {
    /// A signal with no arguments and no return value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an argument type.
    pub fn param(mut self, ty: ValueType) -> Self {
        self.param_types.push(ty);
        self
    }

    /// Replace the argument types.
    pub fn params(mut self, types: impl IntoIterator<Item = ValueType>) -> Self {
        self.param_types = types.into_iter().collect();
        self
    }

    /// Set the return type.
    pub fn returns(mut self, ty: ValueType) -> Self {
        self.return_type = Some(ty);
        self
    }

    /// Set the emission flags.
    pub fn flags(mut self, flags: SignalFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the accumulator.
    pub fn accumulator(mut self, accumulator: Accumulator) -> Self {
        self.accumulator = accumulator;
        self
    }

    /// The built-in `notify` signal.
    pub(crate) fn notify() -> Self {
        Self::new()
            .flags(SignalFlags::RUN_FIRST | SignalFlags::DETAILED | SignalFlags::NO_RECURSE)
            .param(ValueType::String)
    }
}

/// Errors from connecting to or emitting a signal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// No signal of that name exists on the instance's class chain.
    #[error("Signal '{signal}' is not defined for type '{type_name}'")]
    UnknownSignal {
        /// Type of the instance.
        type_name: String,
        /// The requested signal.
        signal: String,
    },
    /// A detail was given for a signal that does not accept one.
    #[error("Signal '{0}' does not accept a detail")]
    NotDetailed(String),
    /// Wrong number of emission arguments.
    #[error("Signal '{signal}' takes {expected} argument(s), got {got}")]
    ArgumentCount {
        /// Signal name.
        signal: String,
        /// Declared count.
        expected: usize,
        /// Supplied count.
        got: usize,
    },
    /// An emission argument has the wrong type.
    #[error("Argument {index} of signal '{signal}' expects {expected}, got {got}")]
    ArgumentType {
        /// Signal name.
        signal: String,
        /// Zero-based argument position.
        index: usize,
        /// Declared type name.
        expected: &'static str,
        /// Supplied type name.
        got: &'static str,
    },
    /// The handler is not (or no longer) connected.
    #[error("Handler {0:?} is not connected")]
    InvalidHandler(HandlerId),
}

/// Split `name::detail` into its parts.
pub fn parse_detailed(detailed: &str) -> (&str, Option<&str>) {
    match detailed.split_once("::") {
        Some((name, detail)) => (name, Some(detail)),
        None => (detailed, None),
    }
}

pub(crate) type HandlerFn = Rc<dyn Fn(&Instance, &[Value]) -> Option<Value>>;

struct Handler {
    signal: String,
    detail: Option<String>,
    seq: u64,
    callback: HandlerFn,
}

/// Handlers connected to one instance.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: SlotMap<HandlerId, Handler>,
    next_seq: u64,
}

impl HandlerTable {
    pub(crate) fn insert(&mut self, signal: &str, detail: Option<&str>, callback: HandlerFn) -> HandlerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.handlers.insert(Handler {
            signal: signal.to_owned(),
            detail: detail.map(str::to_owned),
            seq,
            callback,
        })
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> Option<HandlerFn> {
        self.handlers.remove(id).map(|handler| handler.callback)
    }

    pub(crate) fn contains(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Handlers for an emission, in connection order.
    pub(crate) fn matching(&self, signal: &str, detail: Option<&str>) -> Vec<(HandlerId, HandlerFn)> {
        let mut matched: Vec<(u64, HandlerId, HandlerFn)> = self
            .handlers
            .iter()
            .filter(|(_, handler)| {
                handler.signal == signal
                    && handler
                        .detail
                        .as_deref()
                        .is_none_or(|wanted| Some(wanted) == detail)
            })
            .map(|(id, handler)| (handler.seq, id, handler.callback.clone()))
            .collect();
        matched.sort_by_key(|(seq, _, _)| *seq);
        matched.into_iter().map(|(_, id, callback)| (id, callback)).collect()
    }

    /// Remove every handler, returning them so they drop outside any borrow.
    pub(crate) fn drain(&mut self) -> Vec<HandlerFn> {
        self.handlers.drain().map(|(_, handler)| handler.callback).collect()
    }
}

/// Check emission arguments against a signal's declared parameter types.
pub(crate) fn check_args(signal: &str, spec: &SignalSpec, args: &[Value]) -> Result<(), SignalError> {
    if args.len() != spec.param_types.len() {
        return Err(SignalError::ArgumentCount {
            signal: signal.to_owned(),
            expected: spec.param_types.len(),
            got: args.len(),
        });
    }
    for (index, (arg, &ty)) in args.iter().zip(&spec.param_types).enumerate() {
        if !arg.conforms_to(ty) {
            return Err(SignalError::ArgumentType {
                signal: signal.to_owned(),
                index,
                expected: ty.name(),
                got: arg.type_name(),
            });
        }
    }
    Ok(())
}

/// Fold one handler result into the running emission result.
///
/// Returns `true` when the emission should stop.
pub(crate) fn accumulate(accumulator: Accumulator, acc: &mut Option<Value>, result: Option<Value>) -> bool {
    match accumulator {
        Accumulator::Last => {
            if result.is_some() {
                *acc = result;
            }
            false
        }
        Accumulator::FirstWins => {
            if result.is_some() {
                *acc = result;
                true
            } else {
                false
            }
        }
        Accumulator::TrueHandled => {
            let handled = matches!(result, Some(Value::Bool(true)));
            if result.is_some() {
                *acc = result;
            }
            handled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> HandlerFn {
        Rc::new(|_: &Instance, _: &[Value]| None)
    }

    #[test]
    fn test_parse_detailed() {
        assert_eq!(parse_detailed("notify::is-busy"), ("notify", Some("is-busy")));
        assert_eq!(parse_detailed("clicked"), ("clicked", None));
    }

    #[test]
    fn test_matching_respects_detail_and_order() {
        let mut table = HandlerTable::default();
        let any = table.insert("notify", None, noop());
        let title = table.insert("notify", Some("title"), noop());
        let _other = table.insert("clicked", None, noop());

        let ids: Vec<HandlerId> = table
            .matching("notify", Some("title"))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![any, title]);

        let ids: Vec<HandlerId> = table
            .matching("notify", Some("count"))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![any]);
    }

    #[test]
    fn test_order_survives_slot_reuse() {
        let mut table = HandlerTable::default();
        let first = table.insert("a", None, noop());
        let second = table.insert("a", None, noop());
        table.remove(first);
        let third = table.insert("a", None, noop());

        let ids: Vec<HandlerId> = table.matching("a", None).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![second, third]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_check_args() {
        let spec = SignalSpec::new().param(ValueType::Int).param(ValueType::String);
        assert!(check_args("s", &spec, &[Value::Int(1), Value::from("x")]).is_ok());
        assert!(matches!(
            check_args("s", &spec, &[Value::Int(1)]),
            Err(SignalError::ArgumentCount { expected: 2, got: 1, .. })
        ));
        assert!(matches!(
            check_args("s", &spec, &[Value::Int(1), Value::Int(2)]),
            Err(SignalError::ArgumentType { index: 1, .. })
        ));
    }

    #[test]
    fn test_accumulators() {
        let mut acc = None;
        assert!(!accumulate(Accumulator::Last, &mut acc, Some(Value::Int(1))));
        assert!(!accumulate(Accumulator::Last, &mut acc, None));
        assert_eq!(acc, Some(Value::Int(1)));

        let mut acc = None;
        assert!(!accumulate(Accumulator::TrueHandled, &mut acc, Some(Value::Bool(false))));
        assert!(accumulate(Accumulator::TrueHandled, &mut acc, Some(Value::Bool(true))));

        let mut acc = None;
        assert!(accumulate(Accumulator::FirstWins, &mut acc, Some(Value::from("x"))));
        assert_eq!(acc, Some(Value::from("x")));
    }
}
