//! Service implementations and selection.
//!
//! An invoke action names a service *type*; the selector picks one of the
//! registered implementations of that type at invocation time.

use crate::error::RuntimeError;
use async_trait::async_trait;
use csm_core::ContextVariable;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A callable service.
#[async_trait]
pub trait ServiceImplementation: Send + Sync {
    /// Service type this implementation provides.
    fn name(&self) -> &str;

    /// Relative cost of an invocation (lower is better).
    fn cost(&self) -> f64;

    /// Relative performance of an invocation (higher is better).
    fn performance(&self) -> f64;

    /// Whether the implementation runs in-process.
    fn is_local(&self) -> bool;

    /// Invokes the service.
    async fn invoke(
        &self,
        input: Vec<ContextVariable>,
        caller_id: &str,
    ) -> Result<Vec<ContextVariable>, RuntimeError>;
}

type ServiceFn =
    dyn Fn(Vec<ContextVariable>) -> Result<Vec<ContextVariable>, String> + Send + Sync;

/// A local service backed by a closure.
#[derive(Clone)]
pub struct FnService {
    name: String,
    cost: f64,
    performance: f64,
    local: bool,
    func: Arc<ServiceFn>,
}

impl FnService {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<ContextVariable>) -> Result<Vec<ContextVariable>, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            cost: 1.0,
            performance: 1.0,
            local: true,
            func: Arc::new(func),
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_performance(mut self, performance: f64) -> Self {
        self.performance = performance;
        self
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Returns its input unchanged.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::new(name, Ok)
    }

    /// Adds one to every integer input.
    pub fn increment(name: impl Into<String>) -> Self {
        Self::new(name, |input| {
            input
                .into_iter()
                .map(|var| match var.value.as_i64() {
                    Some(n) => match n.checked_add(1) {
                        Some(next) => Ok(ContextVariable::new(var.name, serde_json::json!(next))),
                        None => Err(format!("input '{}' overflows", var.name)),
                    },
                    None => Err(format!("input '{}' is not an integer", var.name)),
                })
                .collect()
        })
    }
}

#[async_trait]
impl ServiceImplementation for FnService {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> f64 {
        self.cost
    }

    fn performance(&self) -> f64 {
        self.performance
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn invoke(
        &self,
        input: Vec<ContextVariable>,
        caller_id: &str,
    ) -> Result<Vec<ContextVariable>, RuntimeError> {
        tracing::debug!("{} invoked by {}", self.name, caller_id);
        (self.func)(input).map_err(|reason| RuntimeError::ServiceFailed {
            service: self.name.clone(),
            reason,
        })
    }
}

impl fmt::Debug for FnService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnService")
            .field("name", &self.name)
            .field("cost", &self.cost)
            .field("performance", &self.performance)
            .field("local", &self.local)
            .finish()
    }
}

/// Registered implementations by service type.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Vec<Arc<dyn ServiceImplementation>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an implementation under its service type.
    pub fn register(&self, service: Arc<dyn ServiceImplementation>) {
        tracing::debug!(
            "Registered service {} (cost {}, performance {}, local {})",
            service.name(),
            service.cost(),
            service.performance(),
            service.is_local()
        );
        self.services
            .entry(service.name().to_string())
            .or_default()
            .push(service);
    }

    /// Returns the implementations of a service type, optionally only local ones.
    pub fn implementations(
        &self,
        service_type: &str,
        local_only: bool,
    ) -> Vec<Arc<dyn ServiceImplementation>> {
        self.services
            .get(service_type)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|s| !local_only || s.is_local())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the registered service types.
    pub fn service_types(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }
}

/// Chooses an implementation for an invocation.
pub trait ServiceSelector: Send + Sync {
    fn select(
        &self,
        service_type: &str,
        require_local: bool,
    ) -> Option<Arc<dyn ServiceImplementation>>;
}

/// Selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    #[default]
    Optimal,
    Random,
}

impl SelectionPolicy {
    /// Builds a selector implementing this policy.
    pub fn selector(self, registry: Arc<ServiceRegistry>) -> Arc<dyn ServiceSelector> {
        match self {
            SelectionPolicy::Optimal => Arc::new(OptimalSelector::new(registry)),
            SelectionPolicy::Random => Arc::new(RandomSelector::new(registry)),
        }
    }
}

/// Picks the implementation with the best normalized cost/performance ratio.
pub struct OptimalSelector {
    registry: Arc<ServiceRegistry>,
}

impl OptimalSelector {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

impl ServiceSelector for OptimalSelector {
    fn select(
        &self,
        service_type: &str,
        require_local: bool,
    ) -> Option<Arc<dyn ServiceImplementation>> {
        let candidates = self.registry.implementations(service_type, require_local);

        let max_cost = candidates.iter().map(|s| s.cost()).fold(0.0, f64::max);
        let max_performance = candidates.iter().map(|s| s.performance()).fold(0.0, f64::max);

        let score = |s: &Arc<dyn ServiceImplementation>| {
            let cost = if max_cost > 0.0 { s.cost() / max_cost } else { 0.0 };
            let performance = if max_performance > 0.0 {
                s.performance() / max_performance
            } else {
                0.0
            };
            if performance > 0.0 {
                cost / performance
            } else {
                f64::INFINITY
            }
        };

        candidates
            .into_iter()
            .min_by(|a, b| score(a).total_cmp(&score(b)))
    }
}

/// Picks uniformly at random.
pub struct RandomSelector {
    registry: Arc<ServiceRegistry>,
}

impl RandomSelector {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

impl ServiceSelector for RandomSelector {
    fn select(
        &self,
        service_type: &str,
        require_local: bool,
    ) -> Option<Arc<dyn ServiceImplementation>> {
        let mut candidates = self.registry.implementations(service_type, require_local);
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates.swap_remove(index))
    }
}
