//! Variable contexts.
//!
//! A [`Context`] is a named variable store. The in-memory implementation
//! backs instance and state locals; the storage crate provides a durable one
//! for persistent variables. Implementations must be safe to call from any
//! thread: timers and service completions touch contexts off the instance
//! worker.

use crate::error::CoreError;
use crate::expression::{Expression, VariableLookup};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A named value, as stored in a context or carried by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextVariable {
    pub name: String,
    pub value: Value,
}

impl ContextVariable {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A variable declaration whose value is computed when it is needed.
#[derive(Debug, Clone)]
pub struct VariableDef {
    pub name: String,
    pub value: Expression,
}

impl VariableDef {
    pub fn new(name: impl Into<String>, value: Expression) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Evaluates the declaration into a concrete variable.
    pub fn evaluate<L: VariableLookup + ?Sized>(
        &self,
        vars: &L,
    ) -> Result<ContextVariable, CoreError> {
        Ok(ContextVariable {
            name: self.name.clone(),
            value: self.value.evaluate(vars)?,
        })
    }
}

/// A variable store.
///
/// Mutating operations return the number of bytes written, which backends
/// report for diagnostics only.
pub trait Context: Send + Sync + fmt::Debug {
    /// Returns the value of a variable.
    fn get(&self, name: &str) -> Result<Value, CoreError>;

    /// Creates a variable. Fails if the name already exists.
    fn create(&self, name: &str, value: Value) -> Result<usize, CoreError>;

    /// Assigns an existing variable. Fails if the name does not exist.
    fn assign(&self, name: &str, value: Value) -> Result<usize, CoreError>;

    /// Deletes an existing variable.
    fn delete(&self, name: &str) -> Result<(), CoreError>;

    /// Returns every variable in the context.
    fn get_all(&self) -> Result<Vec<ContextVariable>, CoreError>;

    /// Returns true if the variable exists.
    fn contains(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }
}

/// Returns the encoded size of a value, used as the "bytes written" figure.
pub fn encoded_len(value: &Value) -> usize {
    value.to_string().len()
}

/// Thread-safe in-memory context.
#[derive(Debug, Default)]
pub struct InMemoryContext {
    values: DashMap<String, Value>,
}

impl InMemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context holding the given variables.
    pub fn with_variables(
        variables: impl IntoIterator<Item = ContextVariable>,
    ) -> Result<Self, CoreError> {
        let context = Self::new();
        for variable in variables {
            context.create(&variable.name, variable.value)?;
        }
        Ok(context)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Context for InMemoryContext {
    fn get(&self, name: &str) -> Result<Value, CoreError> {
        self.values
            .get(name)
            .map(|v| v.value().clone())
            .ok_or_else(|| CoreError::VariableNotFound {
                name: name.to_string(),
            })
    }

    fn create(&self, name: &str, value: Value) -> Result<usize, CoreError> {
        match self.values.entry(name.to_string()) {
            Entry::Occupied(_) => Err(CoreError::VariableExists {
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                let written = encoded_len(&value);
                slot.insert(value);
                Ok(written)
            }
        }
    }

    fn assign(&self, name: &str, value: Value) -> Result<usize, CoreError> {
        match self.values.get_mut(name) {
            Some(mut slot) => {
                let written = encoded_len(&value);
                *slot = value;
                Ok(written)
            }
            None => Err(CoreError::VariableNotFound {
                name: name.to_string(),
            }),
        }
    }

    fn delete(&self, name: &str) -> Result<(), CoreError> {
        self.values
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CoreError::VariableNotFound {
                name: name.to_string(),
            })
    }

    fn get_all(&self) -> Result<Vec<ContextVariable>, CoreError> {
        Ok(self
            .values
            .iter()
            .map(|entry| ContextVariable::new(entry.key().clone(), entry.value().clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_create_get_assign_delete() {
        let ctx = InMemoryContext::new();
        assert!(ctx.create("v", json!(1)).unwrap() > 0);
        assert_eq!(ctx.get("v").unwrap(), json!(1));

        ctx.assign("v", json!("two")).unwrap();
        assert_eq!(ctx.get("v").unwrap(), json!("two"));

        ctx.delete("v").unwrap();
        assert!(!ctx.contains("v"));
    }

    #[test]
    fn test_create_existing_fails() {
        let ctx = InMemoryContext::new();
        ctx.create("v", json!(1)).unwrap();
        assert!(matches!(
            ctx.create("v", json!(2)),
            Err(CoreError::VariableExists { .. })
        ));
        assert_eq!(ctx.get("v").unwrap(), json!(1));
    }

    #[test]
    fn test_missing_variable_errors() {
        let ctx = InMemoryContext::new();
        assert!(matches!(
            ctx.get("v"),
            Err(CoreError::VariableNotFound { .. })
        ));
        assert!(matches!(
            ctx.assign("v", json!(1)),
            Err(CoreError::VariableNotFound { .. })
        ));
        assert!(matches!(
            ctx.delete("v"),
            Err(CoreError::VariableNotFound { .. })
        ));
    }

    #[test]
    fn test_get_all() {
        let ctx = InMemoryContext::with_variables(vec![
            ContextVariable::new("a", json!(1)),
            ContextVariable::new("b", json!(2)),
        ])
        .unwrap();

        let mut all = ctx.get_all().unwrap();
        all.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(
            all,
            vec![
                ContextVariable::new("a", json!(1)),
                ContextVariable::new("b", json!(2)),
            ]
        );
    }

    #[test]
    fn test_concurrent_create_single_winner() {
        let ctx = Arc::new(InMemoryContext::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = ctx.clone();
                std::thread::spawn(move || ctx.create("shared", json!(i)).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
