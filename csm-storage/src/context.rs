//! Durable context backed by a [`VariableStore`].

use crate::error::StorageError;
use crate::store::VariableStore;
use csm_core::context::{Context, ContextVariable};
use csm_core::CoreError;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A context whose variables survive process restarts.
///
/// Several collaborative machines can share one store; each context only
/// sees the keys of its own namespace.
#[derive(Clone)]
pub struct DurableContext {
    store: Arc<VariableStore>,
    namespace: String,
}

impl DurableContext {
    pub fn new(store: Arc<VariableStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, name: &str) -> String {
        format!("{}/{}", self.namespace, name)
    }
}

fn to_core_error(err: StorageError, name: &str) -> CoreError {
    match err {
        StorageError::KeyExists(_) => CoreError::VariableExists {
            name: name.to_string(),
        },
        StorageError::KeyNotFound(_) => CoreError::VariableNotFound {
            name: name.to_string(),
        },
        other => CoreError::ContextBackend {
            reason: other.to_string(),
        },
    }
}

impl Context for DurableContext {
    fn get(&self, name: &str) -> Result<Value, CoreError> {
        self.store
            .get(&self.key(name))
            .ok_or_else(|| CoreError::VariableNotFound {
                name: name.to_string(),
            })
    }

    fn create(&self, name: &str, value: Value) -> Result<usize, CoreError> {
        self.store
            .create(&self.key(name), value)
            .map_err(|e| to_core_error(e, name))
    }

    fn assign(&self, name: &str, value: Value) -> Result<usize, CoreError> {
        self.store
            .put(&self.key(name), value)
            .map_err(|e| to_core_error(e, name))
    }

    fn delete(&self, name: &str) -> Result<(), CoreError> {
        self.store
            .delete(&self.key(name))
            .map_err(|e| to_core_error(e, name))
    }

    fn get_all(&self) -> Result<Vec<ContextVariable>, CoreError> {
        let prefix = format!("{}/", self.namespace);
        Ok(self
            .store
            .scan_prefix(&prefix)
            .into_iter()
            .map(|(key, value)| ContextVariable::new(&key[prefix.len()..], value))
            .collect())
    }

    fn contains(&self, name: &str) -> bool {
        self.store.contains(&self.key(name))
    }
}

impl fmt::Debug for DurableContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableContext")
            .field("namespace", &self.namespace)
            .field("file", &self.store.file_path())
            .finish()
    }
}
