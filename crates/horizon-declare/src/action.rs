//! Named, activatable actions.
//!
//! An [`Action`] belongs to exactly one instance. Declared actions are created
//! when an instance is initialized and attached according to the instance's
//! capability: widgets collect them in an [`ActionGroup`] named after their
//! class, windows and applications hold them directly. Applications may also
//! bind accelerators to the qualified `app.<name>`.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::logging::targets;
use crate::value::{Value, ValueType};

/// Errors from activating or updating an action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// No action of that name is reachable.
    #[error("No action named '{0}'")]
    UnknownAction(String),
    /// The action takes a parameter and none was given.
    #[error("Action '{0}' requires a parameter")]
    MissingParameter(String),
    /// The action takes no parameter and one was given.
    #[error("Action '{0}' takes no parameter")]
    UnexpectedParameter(String),
    /// The parameter has the wrong type.
    #[error("Action '{action}' expects a {expected} parameter, got {got}")]
    ParameterType {
        /// Action name.
        action: String,
        /// Declared parameter type.
        expected: &'static str,
        /// Supplied type.
        got: &'static str,
    },
    /// A new state does not match the type of the initial state.
    #[error("State of action '{action}' must be {expected}, got {got}")]
    StateType {
        /// Action name.
        action: String,
        /// Type of the initial state.
        expected: &'static str,
        /// Supplied type.
        got: &'static str,
    },
    /// The action was declared without state.
    #[error("Action '{0}' is stateless")]
    Stateless(String),
}

/// Declaration-time settings of an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOptions {
    /// Initial state; stateless when `None`.
    pub state: Option<Value>,
    /// Type of the activation parameter; parameterless when `None`.
    pub parameter_type: Option<ValueType>,
    /// Whether the action starts enabled.
    pub enabled: bool,
    /// Accelerators, bound only on applications.
    pub accels: Vec<String>,
    /// Field under which the created action is exposed on the instance.
    pub expose_as: Option<String>,
}

impl Default for ActionOptions {
    fn default() -> Self {
        Self {
            state: None,
            parameter_type: None,
            enabled: true,
            accels: Vec::new(),
            expose_as: None,
        }
    }
}

impl ActionOptions {
    /// Enabled, stateless, parameterless.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial state.
    pub fn state(mut self, state: impl Into<Value>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Set the parameter type.
    pub fn parameter_type(mut self, ty: ValueType) -> Self {
        self.parameter_type = Some(ty);
        self
    }

    /// Set whether the action starts enabled.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Add accelerators such as `"<Control>q"`.
    pub fn accels<I, S>(mut self, accels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accels.extend(accels.into_iter().map(Into::into));
        self
    }

    /// Expose the created action on the named instance field.
    pub fn expose_as(mut self, field: impl Into<String>) -> Self {
        self.expose_as = Some(field.into());
        self
    }
}

type ActivateFn = Rc<dyn Fn(&Action, Option<&Value>)>;

struct ActionInner {
    name: String,
    parameter_type: Option<ValueType>,
    enabled: Cell<bool>,
    state: RefCell<Option<Value>>,
    handlers: RefCell<Vec<ActivateFn>>,
}

/// A named action with an activation handler list.
#[derive(Clone)]
pub struct Action {
    inner: Rc<ActionInner>,
}

impl Action {
    /// Create an action from its options.
    pub fn new(name: impl Into<String>, options: &ActionOptions) -> Self {
        Self {
            inner: Rc::new(ActionInner {
                name: name.into(),
                parameter_type: options.parameter_type,
                enabled: Cell::new(options.enabled),
                state: RefCell::new(options.state.clone()),
                handlers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The action name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The declared parameter type.
    pub fn parameter_type(&self) -> Option<ValueType> {
        self.inner.parameter_type
    }

    /// Whether activation currently has any effect.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }

    /// Enable or disable the action.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.set(enabled);
    }

    /// Current state.
    pub fn state(&self) -> Option<Value> {
        self.inner.state.borrow().clone()
    }

    /// Replace the state. The new state must have the type of the old one.
    pub fn set_state(&self, state: Value) -> Result<(), ActionError> {
        let mut current = self.inner.state.borrow_mut();
        let Some(old) = current.as_ref() else {
            return Err(ActionError::Stateless(self.inner.name.clone()));
        };
        if old.type_name() != state.type_name() {
            return Err(ActionError::StateType {
                action: self.inner.name.clone(),
                expected: old.type_name(),
                got: state.type_name(),
            });
        }
        *current = Some(state);
        Ok(())
    }

    /// Add an activation handler.
    pub fn connect_activate<F>(&self, handler: F)
    where
        F: Fn(&Action, Option<&Value>) + 'static,
    {
        self.inner.handlers.borrow_mut().push(Rc::new(handler));
    }

    /// Activate the action.
    ///
    /// Returns `Ok(false)` without calling handlers if the action is disabled.
    pub fn activate(&self, parameter: Option<&Value>) -> Result<bool, ActionError> {
        let name = &self.inner.name;
        match (self.inner.parameter_type, parameter) {
            (None, None) => {}
            (Some(_), None) => return Err(ActionError::MissingParameter(name.clone())),
            (None, Some(_)) => return Err(ActionError::UnexpectedParameter(name.clone())),
            (Some(ty), Some(value)) if !value.conforms_to(ty) => {
                return Err(ActionError::ParameterType {
                    action: name.clone(),
                    expected: ty.name(),
                    got: value.type_name(),
                });
            }
            (Some(_), Some(_)) => {}
        }
        if !self.is_enabled() {
            tracing::debug!(target: targets::ACTION, action = %name, "ignoring activation of disabled action");
            return Ok(false);
        }

        tracing::trace!(target: targets::ACTION, action = %name, "activating action");
        let handlers: Vec<ActivateFn> = self.inner.handlers.borrow().clone();
        for handler in handlers {
            handler(self, parameter);
        }
        Ok(true)
    }

    /// Whether two handles refer to the same action.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.inner.name)
            .field("enabled", &self.inner.enabled.get())
            .field("state", &self.inner.state.borrow())
            .finish()
    }
}

/// A named collection of actions.
#[derive(Clone, Default)]
pub struct ActionGroup {
    actions: Rc<RefCell<BTreeMap<String, Action>>>,
}

impl ActionGroup {
    /// An empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action, replacing one with the same name.
    pub fn add_action(&self, action: Action) -> Option<Action> {
        self.actions
            .borrow_mut()
            .insert(action.name().to_owned(), action)
    }

    /// Remove an action by name.
    pub fn remove_action(&self, name: &str) -> Option<Action> {
        self.actions.borrow_mut().remove(name)
    }

    /// Find an action by name.
    pub fn lookup(&self, name: &str) -> Option<Action> {
        self.actions.borrow().get(name).cloned()
    }

    /// Names of all actions, sorted.
    pub fn list_actions(&self) -> Vec<String> {
        self.actions.borrow().keys().cloned().collect()
    }

    /// Activate an action by name.
    pub fn activate(&self, name: &str, parameter: Option<&Value>) -> Result<bool, ActionError> {
        let action = self
            .lookup(name)
            .ok_or_else(|| ActionError::UnknownAction(name.to_owned()))?;
        action.activate(parameter)
    }
}

impl fmt::Debug for ActionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionGroup")
            .field("actions", &self.list_actions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_calls_handlers() {
        let action = Action::new("refresh", &ActionOptions::new());
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        action.connect_activate(move |_, _| counter.set(counter.get() + 1));

        assert_eq!(action.activate(None), Ok(true));
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_disabled_action_is_inert() {
        let action = Action::new("refresh", &ActionOptions::new().enabled(false));
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        action.connect_activate(move |_, _| counter.set(counter.get() + 1));

        assert_eq!(action.activate(None), Ok(false));
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_parameter_checks() {
        let action = Action::new("zoom", &ActionOptions::new().parameter_type(ValueType::Double));
        assert_eq!(
            action.activate(None),
            Err(ActionError::MissingParameter("zoom".to_owned()))
        );
        assert!(matches!(
            action.activate(Some(&Value::from("x"))),
            Err(ActionError::ParameterType { expected: "double", .. })
        ));
        assert_eq!(action.activate(Some(&Value::Double(1.5))), Ok(true));

        let plain = Action::new("quit", &ActionOptions::new());
        assert_eq!(
            plain.activate(Some(&Value::Bool(true))),
            Err(ActionError::UnexpectedParameter("quit".to_owned()))
        );
    }

    #[test]
    fn test_state_type_is_fixed() {
        let action = Action::new("dark", &ActionOptions::new().state(false));
        action.set_state(Value::Bool(true)).unwrap();
        assert_eq!(action.state(), Some(Value::Bool(true)));
        assert!(matches!(
            action.set_state(Value::Int(1)),
            Err(ActionError::StateType { .. })
        ));

        let stateless = Action::new("quit", &ActionOptions::new());
        assert_eq!(
            stateless.set_state(Value::Bool(true)),
            Err(ActionError::Stateless("quit".to_owned()))
        );
    }

    #[test]
    fn test_group_lookup_and_activate() {
        let group = ActionGroup::new();
        group.add_action(Action::new("b", &ActionOptions::new()));
        group.add_action(Action::new("a", &ActionOptions::new()));
        assert_eq!(group.list_actions(), vec!["a", "b"]);
        assert_eq!(group.activate("a", None), Ok(true));
        assert_eq!(
            group.activate("missing", None),
            Err(ActionError::UnknownAction("missing".to_owned()))
        );
    }
}
