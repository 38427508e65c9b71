//! Actions.
//!
//! Actions are declared in a description using a `type` tag:
//!
//! ```json
//! {"type": "assign", "variable": {"name": "v", "value": "v + 1"}}
//! {"type": "create", "variable": {"name": "n", "value": 0}, "persistent": true}
//! {"type": "invoke", "service_type": "increment", "input": [{"name": "v", "value": "v"}],
//!  "output": ["v"], "done": [{"name": "incremented"}]}
//! {"type": "match", "value": "v", "cases": [{"case": 1, "action": {...}}]}
//! {"type": "raise", "event": {"name": "go", "channel": "external"}}
//! {"type": "timeout", "name": "tick", "delay": 1000, "action": {"type": "raise", ...}}
//! {"type": "timeout_reset", "action": "tick"}
//! ```
//!
//! String values are expressions; any other JSON value is a literal.

use crate::context::VariableDef;
use crate::error::CoreError;
use crate::event::{EventChannel, EventDef};
use crate::expression::Expression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Raw variable declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableRaw {
    pub name: String,
    pub value: Value,
}

/// Raw event declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRaw {
    pub name: String,
    #[serde(default)]
    pub channel: EventChannel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<VariableRaw>,
}

/// Raw match case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCaseRaw {
    pub case: Value,
    pub action: ActionRaw,
}

/// Raw action as written in a description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionRaw {
    Assign {
        variable: VariableRaw,
    },
    Create {
        variable: VariableRaw,
        #[serde(default)]
        persistent: bool,
    },
    Invoke {
        service_type: String,
        #[serde(default)]
        is_local: bool,
        #[serde(default)]
        input: Vec<VariableRaw>,
        #[serde(default)]
        output: Vec<String>,
        #[serde(default)]
        done: Vec<EventRaw>,
    },
    Match {
        value: Value,
        cases: Vec<MatchCaseRaw>,
    },
    Raise {
        event: EventRaw,
    },
    Timeout {
        name: String,
        delay: Value,
        action: Box<ActionRaw>,
    },
    TimeoutReset {
        action: String,
    },
}

/// Assigns an existing variable.
#[derive(Debug, Clone)]
pub struct AssignAction {
    pub variable: VariableDef,
}

/// Creates a variable, in the persistent layer when `persistent` is set.
#[derive(Debug, Clone)]
pub struct CreateAction {
    pub variable: VariableDef,
    pub persistent: bool,
}

/// Invokes an external service asynchronously.
#[derive(Debug, Clone)]
pub struct InvokeAction {
    pub service_type: String,
    /// Only consider implementations running in-process.
    pub is_local: bool,
    pub input: Vec<VariableDef>,
    /// Output variables assigned back into the caller's extent.
    pub output: Vec<String>,
    /// Events raised on completion, carrying the output as data.
    pub done: Vec<EventDef>,
}

/// Runs the actions of every case equal to the scrutinee.
#[derive(Debug, Clone)]
pub struct MatchAction {
    pub value: Expression,
    pub cases: Vec<MatchCase>,
}

#[derive(Debug, Clone)]
pub struct MatchCase {
    pub case: Expression,
    pub action: Arc<Action>,
}

/// Raises an event.
#[derive(Debug, Clone)]
pub struct RaiseAction {
    pub event: EventDef,
}

/// A named, repeating timer. The wrapped action is always a raise.
#[derive(Debug, Clone)]
pub struct TimeoutAction {
    pub name: String,
    /// Delay in milliseconds.
    pub delay: Expression,
    pub action: Arc<Action>,
}

/// Cancels a running timer by name.
#[derive(Debug, Clone)]
pub struct TimeoutResetAction {
    pub action: String,
}

/// A built action.
#[derive(Debug, Clone)]
pub enum Action {
    Assign(AssignAction),
    Create(CreateAction),
    Invoke(InvokeAction),
    Match(MatchAction),
    Raise(RaiseAction),
    Timeout(TimeoutAction),
    TimeoutReset(TimeoutResetAction),
}

impl Action {
    /// Builds an action from its raw form, parsing every expression.
    pub fn from_raw(raw: &ActionRaw) -> Result<Self, CoreError> {
        let action = match raw {
            ActionRaw::Assign { variable } => Action::Assign(AssignAction {
                variable: build_variable(variable)?,
            }),
            ActionRaw::Create {
                variable,
                persistent,
            } => Action::Create(CreateAction {
                variable: build_variable(variable)?,
                persistent: *persistent,
            }),
            ActionRaw::Invoke {
                service_type,
                is_local,
                input,
                output,
                done,
            } => Action::Invoke(InvokeAction {
                service_type: service_type.clone(),
                is_local: *is_local,
                input: input.iter().map(build_variable).collect::<Result<_, _>>()?,
                output: output.clone(),
                done: done.iter().map(build_event).collect::<Result<_, _>>()?,
            }),
            ActionRaw::Match { value, cases } => Action::Match(MatchAction {
                value: Expression::from_value(value)?,
                cases: cases
                    .iter()
                    .map(|c| {
                        Ok(MatchCase {
                            case: Expression::from_value(&c.case)?,
                            action: Arc::new(Action::from_raw(&c.action)?),
                        })
                    })
                    .collect::<Result<_, CoreError>>()?,
            }),
            ActionRaw::Raise { event } => Action::Raise(RaiseAction {
                event: build_event(event)?,
            }),
            ActionRaw::Timeout {
                name,
                delay,
                action,
            } => {
                if name.is_empty() {
                    return Err(CoreError::InvalidDefinition {
                        reason: "timeout action requires a name".to_string(),
                    });
                }
                let inner = Action::from_raw(action)?;
                if !matches!(inner, Action::Raise(_)) {
                    return Err(CoreError::InvalidDefinition {
                        reason: format!(
                            "timeout '{}' must wrap a raise action, got '{}'",
                            name,
                            inner.kind()
                        ),
                    });
                }
                Action::Timeout(TimeoutAction {
                    name: name.clone(),
                    delay: Expression::from_value(delay)?,
                    action: Arc::new(inner),
                })
            }
            ActionRaw::TimeoutReset { action } => Action::TimeoutReset(TimeoutResetAction {
                action: action.clone(),
            }),
        };
        Ok(action)
    }

    /// Returns the action's type tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Assign(_) => "assign",
            Action::Create(_) => "create",
            Action::Invoke(_) => "invoke",
            Action::Match(_) => "match",
            Action::Raise(_) => "raise",
            Action::Timeout(_) => "timeout",
            Action::TimeoutReset(_) => "timeout_reset",
        }
    }

    pub fn as_timeout(&self) -> Option<&TimeoutAction> {
        match self {
            Action::Timeout(timeout) => Some(timeout),
            _ => None,
        }
    }
}

pub(crate) fn build_variable(raw: &VariableRaw) -> Result<VariableDef, CoreError> {
    if raw.name.is_empty() {
        return Err(CoreError::InvalidDefinition {
            reason: "variable name must not be empty".to_string(),
        });
    }
    Ok(VariableDef::new(
        raw.name.clone(),
        Expression::from_value(&raw.value)?,
    ))
}

pub(crate) fn build_event(raw: &EventRaw) -> Result<EventDef, CoreError> {
    if raw.name.is_empty() {
        return Err(CoreError::InvalidDefinition {
            reason: "event name must not be empty".to_string(),
        });
    }
    Ok(EventDef {
        name: raw.name.clone(),
        channel: raw.channel,
        data: raw.data.iter().map(build_variable).collect::<Result<_, _>>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(value: Value) -> Result<Action, CoreError> {
        let raw: ActionRaw = serde_json::from_value(value)?;
        Action::from_raw(&raw)
    }

    #[test]
    fn test_parse_every_kind() {
        let cases = [
            (json!({"type": "assign", "variable": {"name": "v", "value": "v + 1"}}), "assign"),
            (json!({"type": "create", "variable": {"name": "v", "value": 0}, "persistent": true}), "create"),
            (json!({"type": "invoke", "service_type": "svc"}), "invoke"),
            (json!({"type": "match", "value": "v", "cases": []}), "match"),
            (json!({"type": "raise", "event": {"name": "e"}}), "raise"),
            (
                json!({"type": "timeout", "name": "t", "delay": 100,
                       "action": {"type": "raise", "event": {"name": "e"}}}),
                "timeout",
            ),
            (json!({"type": "timeout_reset", "action": "t"}), "timeout_reset"),
        ];

        for (value, kind) in cases {
            assert_eq!(build(value).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_create_defaults_to_local() {
        let action = build(json!({"type": "create", "variable": {"name": "v", "value": 1}})).unwrap();
        match action {
            Action::Create(create) => assert!(!create.persistent),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_invoke_fields() {
        let action = build(json!({
            "type": "invoke",
            "service_type": "increment",
            "is_local": true,
            "input": [{"name": "v", "value": "v"}],
            "output": ["v"],
            "done": [{"name": "tob", "channel": "internal"}]
        }))
        .unwrap();

        match action {
            Action::Invoke(invoke) => {
                assert_eq!(invoke.service_type, "increment");
                assert!(invoke.is_local);
                assert_eq!(invoke.input.len(), 1);
                assert_eq!(invoke.output, vec!["v".to_string()]);
                assert_eq!(invoke.done[0].name, "tob");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_timeout_must_wrap_raise() {
        let err = build(json!({
            "type": "timeout", "name": "t", "delay": 10,
            "action": {"type": "assign", "variable": {"name": "v", "value": 1}}
        }))
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_timeout_requires_name() {
        let err = build(json!({
            "type": "timeout", "name": "", "delay": 10,
            "action": {"type": "raise", "event": {"name": "e"}}
        }))
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_invalid_expression_rejected() {
        let err = build(json!({"type": "assign", "variable": {"name": "v", "value": "v +"}}))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidExpression { .. }));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(matches!(
            build(json!({"type": "teleport"})),
            Err(CoreError::Json(_))
        ));
    }
}
