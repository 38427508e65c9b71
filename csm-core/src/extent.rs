//! Layered variable scopes.
//!
//! An [`Extent`] is an ordered stack of contexts. The lowest layer is the
//! persistent context shared by every instance of a collaborative machine;
//! each nested scope (instance, nested instance, state) pushes one more
//! layer. Lookups go from the highest layer down, so inner scopes shadow
//! outer ones.

use crate::context::{Context, ContextVariable};
use crate::error::CoreError;
use crate::expression::VariableLookup;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// An ordered stack of contexts, lowest first.
#[derive(Clone, Default)]
pub struct Extent {
    contexts: Vec<Arc<dyn Context>>,
}

impl Extent {
    /// Creates an extent with a single (lowest) layer.
    pub fn new(low: Arc<dyn Context>) -> Self {
        Self {
            contexts: vec![low],
        }
    }

    /// Returns a new extent with `high` pushed on top. `self` is unchanged.
    pub fn extend(&self, high: Arc<dyn Context>) -> Self {
        let mut contexts = self.contexts.clone();
        contexts.push(high);
        Self { contexts }
    }

    /// Returns the lowest layer.
    pub fn low(&self) -> Option<&Arc<dyn Context>> {
        self.contexts.first()
    }

    /// Returns the highest layer.
    pub fn high(&self) -> Option<&Arc<dyn Context>> {
        self.contexts.last()
    }

    /// Returns the number of layers.
    pub fn depth(&self) -> usize {
        self.contexts.len()
    }

    /// Resolves a variable, searching from the highest layer down.
    ///
    /// Only a layer reporting `VariableNotFound` is skipped; any other layer
    /// error is returned.
    pub fn resolve(&self, name: &str) -> Result<Option<Value>, CoreError> {
        for context in self.contexts.iter().rev() {
            match context.get(name) {
                Ok(value) => return Ok(Some(value)),
                Err(CoreError::VariableNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Like [`resolve`](Self::resolve), but fails when the variable is not found.
    pub fn get(&self, name: &str) -> Result<Value, CoreError> {
        self.resolve(name)?
            .ok_or_else(|| CoreError::VariableNotFound {
                name: name.to_string(),
            })
    }

    /// Assigns an existing variable in the highest layer that declares it.
    ///
    /// Fails only if no layer declares the name.
    pub fn try_set(&self, name: &str, value: Value) -> Result<usize, CoreError> {
        let mut last_error = None;

        for context in self.contexts.iter().rev() {
            match context.assign(name, value.clone()) {
                Ok(written) => return Ok(written),
                Err(e @ CoreError::VariableNotFound { .. }) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| CoreError::VariableNotFound {
            name: name.to_string(),
        }))
    }

    /// Assigns the variable in the highest layer, creating it there if absent.
    pub fn set_or_create(&self, name: &str, value: Value) -> Result<usize, CoreError> {
        let high = self.require_high()?;
        match high.assign(name, value.clone()) {
            Err(CoreError::VariableNotFound { .. }) => high.create(name, value),
            other => other,
        }
    }

    /// Creates a variable in the lowest layer when `persistent`, otherwise in
    /// the highest.
    pub fn create(&self, name: &str, value: Value, persistent: bool) -> Result<usize, CoreError> {
        let target = if persistent {
            self.contexts.first()
        } else {
            self.contexts.last()
        };

        target
            .ok_or_else(|| CoreError::ContextBackend {
                reason: "extent has no contexts".to_string(),
            })?
            .create(name, value)
    }

    /// Returns every visible variable, inner scopes shadowing outer ones.
    pub fn visible(&self) -> Result<Vec<ContextVariable>, CoreError> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for context in self.contexts.iter().rev() {
            for variable in context.get_all()? {
                if seen.insert(variable.name.clone()) {
                    out.push(variable);
                }
            }
        }
        Ok(out)
    }

    fn require_high(&self) -> Result<&Arc<dyn Context>, CoreError> {
        self.high().ok_or_else(|| CoreError::ContextBackend {
            reason: "extent has no contexts".to_string(),
        })
    }
}

impl VariableLookup for Extent {
    fn lookup(&self, name: &str) -> Result<Option<Value>, CoreError> {
        self.resolve(name)
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extent")
            .field("depth", &self.contexts.len())
            .finish()
    }
}
