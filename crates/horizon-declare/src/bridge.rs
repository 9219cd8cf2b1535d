//! Awaiting a single signal emission.
//!
//! [`await_event`] turns "whichever of these two signals fires first" into a
//! future. Both handlers are disconnected as soon as one of them fires, so
//! the future settles exactly once and leaves nothing connected behind.
//!
//! There is no timeout. A future whose signals never fire stays pending for
//! as long as the instance lives; if the instance is disposed or dropped
//! first, it resolves to [`BridgeError::Abandoned`].
//!
//! # Example
//!
//! ```
//! use futures_util::FutureExt;
//! use horizon_declare::{await_event, ClassBuilder, MainContext, SignalSpec, TypeRegistry, Value, ValueType};
//!
//! let types = TypeRegistry::new();
//! let job = ClassBuilder::new(&types, "Job")
//!     .signal("done", SignalSpec::new().param(ValueType::Int))
//!     .finalize()
//!     .unwrap();
//! let instance = job.new_instance(&MainContext::manual()).unwrap();
//!
//! let mut done = await_event(&instance, "done", None).unwrap();
//! assert!((&mut done).now_or_never().is_none());
//!
//! instance.emit("done", &[Value::Int(7)]).unwrap();
//! assert_eq!(done.now_or_never(), Some(Ok(vec![Value::Int(7)])));
//! ```

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::instance::Instance;
use crate::logging::targets;
use crate::signal::{HandlerId, SignalError};
use crate::value::Value;

/// Ways an [`EventFuture`] can fail.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// The rejecting signal fired first.
    #[error("Rejection signal: '{signal}' triggered with args: {}", render_args(.args))]
    Rejected {
        /// Name of the rejecting signal.
        signal: String,
        /// Its emission arguments.
        args: Vec<Value>,
    },
    /// The instance went away before either signal fired.
    #[error("Instance was disposed before the awaited signal fired")]
    Abandoned,
}

fn render_args(args: &[Value]) -> String {
    let rendered: Vec<String> = args.iter().map(ToString::to_string).collect();
    format!("[{}]", rendered.join(", "))
}

type Outcome = Result<Vec<Value>, BridgeError>;

struct Pending {
    sender: Option<oneshot::Sender<Outcome>>,
    handlers: Vec<HandlerId>,
}

impl Pending {
    /// Disconnect every handler and send `outcome`. No-op after the first call.
    fn settle(&mut self, instance: &Instance, outcome: Outcome) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        for id in self.handlers.drain(..) {
            let _ = instance.disconnect(id);
        }
        // The receiver may already be gone; nobody is waiting then.
        let _ = sender.send(outcome);
    }
}

/// Future returned by [`await_event`].
#[must_use = "futures do nothing unless polled"]
pub struct EventFuture {
    receiver: oneshot::Receiver<Outcome>,
}

impl Future for EventFuture {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for EventFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFuture").finish_non_exhaustive()
    }
}

/// Wait for the first emission of `resolve` or `reject` on `instance`.
///
/// Resolves with the arguments of `resolve`, or fails with
/// [`BridgeError::Rejected`] carrying the arguments of `reject`. Unknown
/// signal names fail immediately and leave nothing connected.
pub fn await_event(instance: &Instance, resolve: &str, reject: Option<&str>) -> Result<EventFuture, SignalError> {
    let (sender, receiver) = oneshot::channel();
    let pending = Rc::new(RefCell::new(Pending {
        sender: Some(sender),
        handlers: Vec::new(),
    }));

    let state = Rc::clone(&pending);
    let signal = resolve.to_owned();
    let resolve_id = instance.connect(resolve, move |instance, args| {
        tracing::trace!(target: targets::BRIDGE, %instance, signal = %signal, "resolved");
        state.borrow_mut().settle(instance, Ok(args.to_vec()));
        None
    })?;
    pending.borrow_mut().handlers.push(resolve_id);

    if let Some(reject) = reject {
        let state = Rc::clone(&pending);
        let signal = reject.to_owned();
        let connected = instance.connect(reject, move |instance, args| {
            tracing::trace!(target: targets::BRIDGE, %instance, signal = %signal, "rejected");
            let error = BridgeError::Rejected {
                signal: signal.clone(),
                args: args.to_vec(),
            };
            state.borrow_mut().settle(instance, Err(error));
            None
        });
        match connected {
            Ok(id) => pending.borrow_mut().handlers.push(id),
            Err(err) => {
                let _ = instance.disconnect(resolve_id);
                return Err(err);
            }
        }
    }

    Ok(EventFuture { receiver })
}
