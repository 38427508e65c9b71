//! Runtime owning the instances of collaborative state machines.

use crate::config::Config;
use crate::error::RuntimeError;
use crate::event_handler::{EventHandler, GLOBAL_SOURCE, PERIPHERAL_SOURCE, WILDCARD};
use crate::instance::{InstanceEnv, InstanceHandle, InstanceId, InstanceRegistry, StateMachineInstance};
use crate::service::ServiceSelector;
use crate::timeout::TimerPool;
use csm_core::{CollaborativeStateMachine, Context, CoreError, Extent, StateGraph};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Creates, tracks and stops state machine instances.
pub struct Runtime {
    config: Config,
    event_handler: Arc<dyn EventHandler>,
    persistent_context: Arc<dyn Context>,
    registry: Arc<InstanceRegistry>,
    timers: TimerPool,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Creates a runtime. Must be called within a tokio runtime when the
    /// configured timer pool size is zero.
    pub fn new(
        config: &Config,
        event_handler: Arc<dyn EventHandler>,
        persistent_context: Arc<dyn Context>,
    ) -> Result<Self, RuntimeError> {
        let timers = TimerPool::new(config.timers.worker_threads)?;

        // Global and peripheral events reach every instance of the runtime
        event_handler.subscribe_from(GLOBAL_SOURCE, WILDCARD);
        event_handler.subscribe_from(PERIPHERAL_SOURCE, WILDCARD);

        Ok(Self {
            config: config.clone(),
            event_handler,
            persistent_context,
            registry: Arc::new(InstanceRegistry::new()),
            timers,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Root extent holding the persistent context.
    pub fn extent(&self) -> Extent {
        Extent::new(self.persistent_context.clone())
    }

    pub fn event_handler(&self) -> &Arc<dyn EventHandler> {
        &self.event_handler
    }

    /// Instantiates every non-abstract graph of `csm`, including nested
    /// graphs, and starts them.
    ///
    /// Persistent variables are created first; variables that already exist
    /// in the persistent context (from an earlier run) keep their values.
    pub fn new_instances(
        &self,
        csm: &CollaborativeStateMachine,
        selector: Arc<dyn ServiceSelector>,
    ) -> Result<Vec<InstanceHandle>, RuntimeError> {
        self.ensure_running()?;

        let root = self.extent();
        for def in &csm.persistent {
            let variable = def.evaluate(&root)?;
            match self.persistent_context.create(&variable.name, variable.value) {
                Ok(_) => {}
                Err(CoreError::VariableExists { .. }) => {
                    tracing::debug!("Persistent variable {} already exists", variable.name);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let env = self.env(selector);
        let mut created = Vec::new();
        for graph in csm.machines.iter().filter(|g| !g.is_abstract) {
            self.instantiate(graph, root.clone(), None, &env, &mut created)?;
        }

        tracing::info!(
            "Created {} instances of {} (checksum {})",
            created.len(),
            csm.name,
            csm.checksum
        );

        Ok(self.start(created))
    }

    /// Instantiates and starts one graph (and its nested graphs). Nested
    /// under `parent` when given.
    pub fn new_instance(
        &self,
        graph: &Arc<StateGraph>,
        selector: Arc<dyn ServiceSelector>,
        parent: Option<&InstanceHandle>,
    ) -> Result<InstanceHandle, RuntimeError> {
        self.ensure_running()?;

        let enclosing = match parent {
            Some(parent) => parent.extent().clone(),
            None => self.extent(),
        };

        let env = self.env(selector);
        let mut created = Vec::new();
        let handle = self.instantiate(graph, enclosing, parent, &env, &mut created)?;
        if let Some(parent) = parent {
            parent.push_nested(handle.id().clone());
        }
        self.start(created);
        Ok(handle)
    }

    pub fn find_instance(&self, id: &InstanceId) -> Option<InstanceHandle> {
        self.registry.get(id)
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.registry.ids()
    }

    pub fn instance_count(&self) -> usize {
        self.registry.len()
    }

    /// Stops accepting new instances and cancels the running ones.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles = self.registry.handles();
        tracing::info!("Shutting down runtime, cancelling {} instances", handles.len());
        for handle in handles {
            handle.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Waits until every instance has terminated. Returns false on timeout.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.registry.wait_until_empty())
            .await
            .is_ok()
    }

    fn ensure_running(&self) -> Result<(), RuntimeError> {
        if self.is_shut_down() {
            return Err(RuntimeError::ShutDown);
        }
        Ok(())
    }

    fn env(&self, selector: Arc<dyn ServiceSelector>) -> InstanceEnv {
        InstanceEnv {
            services: selector,
            event_handler: self.event_handler.clone(),
            registry: self.registry.clone(),
            timers: self.timers.handle(),
            deadline: self.config.runtime.deadline(),
        }
    }

    /// Builds an instance and, depth first, its nested instances. Nothing is
    /// registered or started here.
    fn instantiate(
        &self,
        graph: &Arc<StateGraph>,
        enclosing: Extent,
        parent: Option<&InstanceHandle>,
        env: &InstanceEnv,
        created: &mut Vec<StateMachineInstance>,
    ) -> Result<InstanceHandle, RuntimeError> {
        let (instance, handle) = StateMachineInstance::new(graph.clone(), enclosing, parent, env)?;
        created.push(instance);

        let mut nested = Vec::new();
        for child in graph.nested.iter().filter(|g| !g.is_abstract) {
            let child_handle =
                self.instantiate(child, handle.extent().clone(), Some(&handle), env, created)?;
            nested.push(child_handle.id().clone());
        }
        handle.set_nested(nested);

        Ok(handle)
    }

    /// Registers and spawns built instances.
    fn start(&self, instances: Vec<StateMachineInstance>) -> Vec<InstanceHandle> {
        let mut handles = Vec::with_capacity(instances.len());

        for instance in &instances {
            let handle = instance.handle().clone();
            self.registry.insert(handle.clone());
            self.event_handler
                .add_listener(handle.id(), Arc::new(handle.clone()));
            instance.subscribe_events();
            handles.push(handle);
        }

        for instance in instances {
            tokio::spawn(async move {
                // Outcome and errors are logged by the instance
                let _ = instance.run().await;
            });
        }

        handles
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for handle in self.registry.handles() {
            handle.cancel();
        }
    }
}
