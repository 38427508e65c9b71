//! State machine instances.
//!
//! A [`StateMachineInstance`] is driven by exactly one task running
//! [`StateMachineInstance::run`]. Everything else (other instances, timers,
//! service completions) talks to it through its [`InstanceHandle`], which
//! enqueues events on the instance's unbounded channel.

use crate::command::{
    ActionCommand, Command, CommandQueue, ControlCommand, ControlTarget, ExecutionContext, Scope,
    SelectedTransition, TaskSet,
};
use crate::error::RuntimeError;
use crate::event_handler::{EventHandler, EventListener};
use crate::service::ServiceSelector;
use crate::timeout::TimeoutManager;
use csm_core::{
    Context, Event, EventChannel, Extent, InMemoryContext, StateDef, StateGraph, TimeoutAction,
    TransitionDef, EVENT_DATA_VARIABLE_PREFIX,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

/// Unique instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generates a fresh identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Live instances by id.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<InstanceId, InstanceHandle>,
    changed: Notify,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: InstanceHandle) {
        self.instances.insert(handle.id().clone(), handle);
    }

    /// Removes an instance and wakes anyone waiting on registry changes.
    pub fn remove(&self, id: &InstanceId) -> Option<InstanceHandle> {
        let removed = self.instances.remove(id).map(|(_, handle)| handle);
        self.changed.notify_waiters();
        removed
    }

    pub fn get(&self, id: &InstanceId) -> Option<InstanceHandle> {
        self.instances.get(id).map(|entry| entry.value().clone())
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn handles(&self) -> Vec<InstanceHandle> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Resolves when the registry changes next.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    /// Waits until every instance has been removed.
    pub async fn wait_until_empty(&self) {
        loop {
            let changed = self.changed.notified();
            if self.is_empty() {
                return;
            }
            changed.await;
        }
    }
}

struct HandleInner {
    id: InstanceId,
    graph_name: String,
    parent: Option<InstanceId>,
    extent: Extent,
    sender: mpsc::UnboundedSender<Event>,
    terminated: watch::Sender<bool>,
    cancelled: watch::Sender<bool>,
    active_state: RwLock<Option<String>>,
    nested: RwLock<Vec<InstanceId>>,
    registry: Weak<InstanceRegistry>,
}

/// Shared, cloneable reference to a running instance.
#[derive(Clone)]
pub struct InstanceHandle {
    inner: Arc<HandleInner>,
}

impl InstanceHandle {
    pub fn id(&self) -> &InstanceId {
        &self.inner.id
    }

    /// Name of the state graph the instance executes.
    pub fn graph_name(&self) -> &str {
        &self.inner.graph_name
    }

    pub fn parent(&self) -> Option<&InstanceId> {
        self.inner.parent.as_ref()
    }

    /// The instance-level extent (enclosing extent plus the instance's locals).
    pub fn extent(&self) -> &Extent {
        &self.inner.extent
    }

    pub fn active_state(&self) -> Option<String> {
        self.inner.active_state.read().clone()
    }

    /// Ids of the nested instances.
    pub fn nested(&self) -> Vec<InstanceId> {
        self.inner.nested.read().clone()
    }

    pub(crate) fn set_nested(&self, nested: Vec<InstanceId>) {
        *self.inner.nested.write() = nested;
    }

    /// Adds an instance attached after this one was built.
    pub(crate) fn push_nested(&self, id: InstanceId) {
        let mut nested = self.inner.nested.write();
        if !nested.contains(&id) {
            nested.push(id);
        }
    }

    pub fn is_terminated(&self) -> bool {
        *self.inner.terminated.borrow()
    }

    /// Asks the instance to stop. The loop exits at its next wait.
    pub fn cancel(&self) {
        self.inner.cancelled.send_replace(true);
    }

    /// Resolves once the instance loop has exited.
    pub async fn terminated(&self) {
        let mut rx = self.inner.terminated.subscribe();
        let _ = rx.wait_for(|terminated| *terminated).await;
    }

    fn watch_terminated(&self) -> watch::Receiver<bool> {
        self.inner.terminated.subscribe()
    }
}

impl EventListener for InstanceHandle {
    fn on_receive_event(&self, event: Event) -> bool {
        if self.is_terminated() {
            return false;
        }

        if event.channel == EventChannel::Internal {
            if let Some(registry) = self.inner.registry.upgrade() {
                for id in self.nested() {
                    if let Some(child) = registry.get(&id) {
                        child.on_receive_event(event.clone());
                    }
                }
            }
        }

        self.inner.sender.send(event).is_ok()
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("id", &self.inner.id)
            .field("graph", &self.inner.graph_name)
            .field("active_state", &self.active_state())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Collaborators shared by the instances of one runtime.
#[derive(Clone)]
pub struct InstanceEnv {
    pub services: Arc<dyn ServiceSelector>,
    pub event_handler: Arc<dyn EventHandler>,
    pub registry: Arc<InstanceRegistry>,
    /// Runtime the instance's timers run on.
    pub timers: tokio::runtime::Handle,
    /// Maximum running time of an instance.
    pub deadline: Option<Duration>,
}

/// Why an instance loop exited normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Reached a terminal state.
    Done,
    /// Cancelled from outside.
    Interrupted,
    DeadlineElapsed,
    ParentTerminated,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Done => f.write_str("done"),
            Outcome::Interrupted => f.write_str("interrupted"),
            Outcome::DeadlineElapsed => f.write_str("deadline elapsed"),
            Outcome::ParentTerminated => f.write_str("parent terminated"),
        }
    }
}

/// A running state machine.
pub struct StateMachineInstance {
    id: InstanceId,
    graph: Arc<StateGraph>,
    handle: InstanceHandle,
    parent: Option<InstanceHandle>,

    /// Instance-level extent.
    extent: Extent,
    /// Local context of each state, by state name.
    state_locals: HashMap<String, Arc<dyn Context>>,
    active: Option<Arc<StateDef>>,

    listener: Arc<dyn EventListener>,
    event_handler: Arc<dyn EventHandler>,
    services: Arc<dyn ServiceSelector>,
    registry: Arc<InstanceRegistry>,
    timeouts: Arc<TimeoutManager>,
    /// Asynchronous work started by while actions of the active state.
    state_tasks: Arc<TaskSet>,

    events: mpsc::UnboundedReceiver<Event>,
    cancelled: watch::Receiver<bool>,
    deadline: Option<Duration>,
}

impl StateMachineInstance {
    /// Creates an instance of `graph` whose variables chain up to
    /// `enclosing`. Nested instances pass their parent's handle.
    ///
    /// Local variables of the graph and of each state are evaluated and
    /// created here; a failure aborts construction.
    pub fn new(
        graph: Arc<StateGraph>,
        enclosing: Extent,
        parent: Option<&InstanceHandle>,
        env: &InstanceEnv,
    ) -> Result<(Self, InstanceHandle), RuntimeError> {
        let id = InstanceId::new();

        let locals: Arc<dyn Context> = Arc::new(InMemoryContext::new());
        let extent = enclosing.extend(locals.clone());
        for def in &graph.local {
            let variable = def.evaluate(&extent)?;
            locals.create(&variable.name, variable.value)?;
        }

        let mut state_locals: HashMap<String, Arc<dyn Context>> = HashMap::new();
        for state in graph.states() {
            let context: Arc<dyn Context> = Arc::new(InMemoryContext::new());
            let state_extent = extent.extend(context.clone());
            for def in &state.local {
                let variable = def.evaluate(&state_extent)?;
                context.create(&variable.name, variable.value)?;
            }
            state_locals.insert(state.name.clone(), context);
        }

        let (sender, events) = mpsc::unbounded_channel();
        let (terminated, _) = watch::channel(false);
        let (cancelled_tx, cancelled) = watch::channel(false);

        let handle = InstanceHandle {
            inner: Arc::new(HandleInner {
                id: id.clone(),
                graph_name: graph.name.clone(),
                parent: parent.map(|p| p.id().clone()),
                extent: extent.clone(),
                sender,
                terminated,
                cancelled: cancelled_tx,
                active_state: RwLock::new(None),
                nested: RwLock::new(Vec::new()),
                registry: Arc::downgrade(&env.registry),
            }),
        };

        tracing::debug!(
            "Created instance {} of {} (checksum {}, parent {:?})",
            id,
            graph.name,
            graph.checksum,
            handle.parent()
        );

        let instance = Self {
            id,
            graph,
            handle: handle.clone(),
            parent: parent.cloned(),
            extent,
            state_locals,
            active: None,
            listener: Arc::new(handle.clone()),
            event_handler: env.event_handler.clone(),
            services: env.services.clone(),
            registry: env.registry.clone(),
            timeouts: Arc::new(TimeoutManager::new(env.timers.clone())),
            state_tasks: Arc::new(TaskSet::new()),
            events,
            cancelled,
            deadline: env.deadline,
        };

        Ok((instance, handle))
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    /// Runs the instance until it terminates, then deregisters it.
    pub async fn run(mut self) -> Result<Outcome, RuntimeError> {
        tracing::info!("{} started ({})", self.id, self.graph.name);

        let result = self.run_loop().await;
        match &result {
            Ok(Outcome::Done) => tracing::info!("{} is done", self.id),
            Ok(Outcome::Interrupted) => tracing::info!("{} is interrupted", self.id),
            Ok(outcome) => tracing::info!("{} is interrupted: {}", self.id, outcome),
            Err(e) => tracing::error!(
                "{} received a fatal error: {} ({})",
                self.id,
                e,
                e.error_code()
            ),
        }

        self.finish();
        result
    }

    async fn run_loop(&mut self) -> Result<Outcome, RuntimeError> {
        let deadline = self.deadline.map(|d| Instant::now() + d);
        let mut parent_terminated = self.parent.as_ref().map(|p| p.watch_terminated());

        let initial = self.graph.initial_state().clone();
        self.execute(vec![Command::Control(ControlCommand::TransitionInitial(
            initial,
        ))])?;

        loop {
            if self.active.as_ref().is_some_and(|s| s.is_terminal) {
                return Ok(Outcome::Done);
            }
            if *self.cancelled.borrow() {
                return Ok(Outcome::Interrupted);
            }
            if self.parent.as_ref().is_some_and(|p| p.is_terminated()) {
                return Ok(Outcome::ParentTerminated);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(Outcome::DeadlineElapsed);
            }

            let event = tokio::select! {
                _ = wait_set(&mut self.cancelled) => return Ok(Outcome::Interrupted),
                _ = wait_parent(&mut parent_terminated) => return Ok(Outcome::ParentTerminated),
                _ = wait_deadline(deadline) => return Ok(Outcome::DeadlineElapsed),
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => return Ok(Outcome::Interrupted),
                },
            };

            if let Err(e) = self.handle_event(event) {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!("{} failed to handle event: {}", self.id, e);
            }
        }
    }

    /// Selects and handles the transition triggered by `event`.
    fn handle_event(&mut self, event: Event) -> Result<(), RuntimeError> {
        let active = self.active.clone().ok_or(RuntimeError::NoActiveState)?;
        tracing::debug!(
            "{} received {} event {} in state {}",
            self.id,
            event.channel.as_str(),
            event.name,
            active.name
        );

        // Guards see the event data without it leaking into the instance yet
        let event_data = InMemoryContext::new();
        for variable in &event.data {
            let name = format!("{}{}", EVENT_DATA_VARIABLE_PREFIX, variable.name);
            if let Err(e) = event_data.create(&name, variable.value.clone()) {
                tracing::warn!("{} ignoring event data {}: {}", self.id, name, e);
            }
        }
        let extent = self.state_extent(&active).extend(Arc::new(event_data));

        let selected = select_transition(
            active.on_transitions(&event.name),
            &extent,
            &self.id,
            &active.name,
            &event.name,
        )?;
        let Some(selected) = selected else {
            tracing::debug!(
                "{} has no transition for {} in state {}",
                self.id,
                event.name,
                active.name
            );
            return Ok(());
        };

        for variable in &event.data {
            let name = format!("{}{}", EVENT_DATA_VARIABLE_PREFIX, variable.name);
            if let Err(e) = self.extent.set_or_create(&name, variable.value.clone()) {
                tracing::warn!("{} failed to set event data {}: {}", self.id, name, e);
            }
        }

        tracing::debug!(
            "{} selected transition {} -> {} on {}{}",
            self.id,
            active.name,
            selected.target().unwrap_or(&active.name),
            event.name,
            if selected.is_else { " (else)" } else { "" }
        );

        self.execute(vec![Command::Control(ControlCommand::Transition(selected))])
    }

    fn execute(&mut self, commands: Vec<Command>) -> Result<(), RuntimeError> {
        let mut queue = CommandQueue::new();
        queue.push_front_all(commands);
        queue.run(self)
    }

    fn state_extent(&self, state: &StateDef) -> Extent {
        match self.state_locals.get(&state.name) {
            Some(locals) => self.extent.extend(locals.clone()),
            None => self.extent.clone(),
        }
    }

    fn context(&self, scope: Scope, extent: Extent) -> ExecutionContext {
        ExecutionContext {
            instance_id: self.id.clone(),
            scope,
            extent,
            listener: self.listener.clone(),
            event_handler: self.event_handler.clone(),
            services: self.services.clone(),
            timeouts: self.timeouts.clone(),
            tasks: None,
        }
    }

    /// Subscribes to the events the graph reacts to. Undone when the loop
    /// exits.
    pub(crate) fn subscribe_events(&self) {
        for event in self.graph.events() {
            self.event_handler.subscribe(event);
        }
    }

    fn finish(&mut self) {
        self.timeouts.stop_all();
        self.state_tasks.abort_all();
        self.events.close();

        self.handle.inner.terminated.send_replace(true);
        for event in self.graph.events() {
            self.event_handler.unsubscribe(event);
        }
        self.event_handler.remove_listener(&self.id);
        // Last, so waiters on an empty registry see a fully detached instance
        self.registry.remove(&self.id);
    }
}

impl ControlTarget for StateMachineInstance {
    fn active_state(&self) -> Option<Arc<StateDef>> {
        self.active.clone()
    }

    fn state(&self, name: &str) -> Option<Arc<StateDef>> {
        self.graph.state(name).cloned()
    }

    fn instance_context(&self) -> ExecutionContext {
        self.context(Scope::Instance, self.extent.clone())
    }

    fn state_context(&self, state: &StateDef) -> ExecutionContext {
        self.context(Scope::State(state.name.clone()), self.state_extent(state))
    }

    fn while_context(&self, state: &StateDef) -> ExecutionContext {
        self.state_context(state).with_tasks(self.state_tasks.clone())
    }

    fn start_timeouts(&mut self, state: &StateDef) -> Result<(), RuntimeError> {
        for timeout in &state.after {
            let context = self.state_context(state);
            let delay = timeout_delay(timeout, &context.extent)?;
            self.timeouts.start(
                &timeout.name,
                delay,
                ActionCommand::new(context, timeout.action.clone()),
            )?;
        }
        Ok(())
    }

    fn stop_timeouts(&mut self) {
        self.timeouts.stop_all();
    }

    fn cancel_state_tasks(&mut self) {
        self.state_tasks.abort_all();
    }

    fn set_active_state(&mut self, state: Arc<StateDef>) {
        tracing::debug!("{} entered state {}", self.id, state.name);
        *self.handle.inner.active_state.write() = Some(state.name.clone());
        self.active = Some(state);
    }

    fn select_always(&self, state: &StateDef) -> Result<Option<SelectedTransition>, RuntimeError> {
        select_transition(
            state.always_transitions(),
            &self.state_extent(state),
            &self.id,
            &state.name,
            "always",
        )
    }
}

/// Selects at most one transition among `candidates`.
///
/// A candidate is selected when all its guards hold, or in else mode when
/// they do not but it declares an else target. A guard that fails to
/// evaluate counts as not holding.
pub(crate) fn select_transition(
    candidates: &[Arc<TransitionDef>],
    extent: &Extent,
    id: &InstanceId,
    state: &str,
    trigger: &str,
) -> Result<Option<SelectedTransition>, RuntimeError> {
    let mut selected = Vec::new();

    for transition in candidates {
        let passed = match transition.evaluate_guards(extent) {
            Ok(passed) => passed,
            Err(e) => {
                tracing::error!(
                    "{} failed to evaluate guards in state {} for {}: {}",
                    id,
                    state,
                    trigger,
                    e
                );
                false
            }
        };

        if passed || transition.has_else() {
            selected.push(SelectedTransition {
                transition: transition.clone(),
                is_else: !passed,
            });
        }
    }

    if selected.len() > 1 {
        return Err(RuntimeError::NonDeterminism {
            state: state.to_string(),
            trigger: trigger.to_string(),
            count: selected.len(),
        });
    }

    Ok(selected.pop())
}

/// Evaluates a timeout delay in milliseconds.
fn timeout_delay(timeout: &TimeoutAction, extent: &Extent) -> Result<Duration, RuntimeError> {
    let value = timeout.delay.evaluate(extent)?;
    let invalid = |reason: String| RuntimeError::InvalidTimer {
        name: timeout.name.clone(),
        reason,
    };

    let millis = value
        .as_f64()
        .ok_or_else(|| invalid(format!("delay {} is not a number", value)))?;
    if !millis.is_finite() || millis < 0.0 {
        return Err(invalid(format!("delay {} is out of range", millis)));
    }

    Ok(Duration::from_secs_f64(millis / 1000.0))
}

async fn wait_set(rx: &mut watch::Receiver<bool>) {
    // A dropped sender counts as set
    let _ = rx.wait_for(|set| *set).await;
}

async fn wait_parent(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => wait_set(rx).await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_handler::LocalEventHandler;
    use crate::service::{FnService, OptimalSelector, ServiceRegistry};
    use csm_core::ContextVariable;
    use serde_json::json;

    fn env(registry: Arc<InstanceRegistry>) -> InstanceEnv {
        let services = Arc::new(ServiceRegistry::new());
        services.register(Arc::new(FnService::increment("increment")));
        InstanceEnv {
            services: Arc::new(OptimalSelector::new(services)),
            event_handler: Arc::new(LocalEventHandler::new(16)),
            registry,
            timers: tokio::runtime::Handle::current(),
            deadline: None,
        }
    }

    fn graph(value: serde_json::Value) -> Arc<StateGraph> {
        Arc::new(StateGraph::from_json(&value).unwrap())
    }

    fn spawn(
        graph: Arc<StateGraph>,
        root: Extent,
        env: &InstanceEnv,
    ) -> (InstanceHandle, tokio::task::JoinHandle<Result<Outcome, RuntimeError>>) {
        let (instance, handle) = StateMachineInstance::new(graph, root, None, env).unwrap();
        env.registry.insert(handle.clone());
        (handle, tokio::spawn(instance.run()))
    }

    fn root() -> Extent {
        Extent::new(Arc::new(InMemoryContext::new()))
    }

    async fn join(
        task: tokio::task::JoinHandle<Result<Outcome, RuntimeError>>,
    ) -> Result<Outcome, RuntimeError> {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_runs_to_terminal_state() {
        let env = env(Arc::new(InstanceRegistry::new()));
        let g = graph(json!({
            "name": "m",
            "local": [{"name": "v", "value": 0}],
            "states": [
                {"name": "a", "initial": true, "on": [{"event": "go", "target": "b"}]},
                {"name": "b", "terminal": true,
                 "entry": [{"type": "assign", "variable": {"name": "v", "value": "$n"}}]}
            ]
        }));

        let (handle, task) = spawn(g, root(), &env);
        assert!(handle.on_receive_event(Event::new(
            "go",
            EventChannel::Internal,
            vec![ContextVariable::new("n", json!(3))],
        )));

        assert_eq!(join(task).await.unwrap(), Outcome::Done);
        assert!(handle.is_terminated());
        assert_eq!(handle.active_state().as_deref(), Some("b"));
        assert_eq!(handle.extent().get("v").unwrap(), json!(3));
        assert!(env.registry.is_empty());

        // Terminated instances refuse events
        assert!(!handle.on_receive_event(Event::new("go", EventChannel::Internal, vec![])));
    }

    #[tokio::test]
    async fn test_guards_see_event_data() {
        let env = env(Arc::new(InstanceRegistry::new()));
        let g = graph(json!({
            "name": "m",
            "states": [
                {"name": "a", "initial": true,
                 "on": [{"event": "go", "target": "b", "guards": ["$ok"]}]},
                {"name": "b", "terminal": true}
            ]
        }));

        let (handle, task) = spawn(g, root(), &env);
        handle.on_receive_event(Event::new(
            "go",
            EventChannel::Internal,
            vec![ContextVariable::new("ok", json!(false))],
        ));
        handle.on_receive_event(Event::new(
            "go",
            EventChannel::Internal,
            vec![ContextVariable::new("ok", json!(true))],
        ));

        assert_eq!(join(task).await.unwrap(), Outcome::Done);
    }

    #[tokio::test]
    async fn test_non_determinism_is_fatal() {
        let env = env(Arc::new(InstanceRegistry::new()));
        let g = graph(json!({
            "name": "m",
            "states": [
                {"name": "a", "initial": true, "on": [
                    {"event": "go", "target": "b", "guards": ["true"]},
                    {"event": "go", "target": "c", "guards": ["1 < 2"]}
                ]},
                {"name": "b", "terminal": true},
                {"name": "c", "terminal": true}
            ]
        }));

        let (handle, task) = spawn(g, root(), &env);
        handle.on_receive_event(Event::new("go", EventChannel::Internal, vec![]));

        assert!(matches!(
            join(task).await,
            Err(RuntimeError::NonDeterminism { count: 2, .. })
        ));
        assert!(handle.is_terminated());
        assert_eq!(handle.active_state().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts() {
        let env = env(Arc::new(InstanceRegistry::new()));
        let g = graph(json!({
            "name": "m",
            "states": [{"name": "a", "initial": true}]
        }));

        let (handle, task) = spawn(g, root(), &env);
        handle.cancel();

        assert_eq!(join(task).await.unwrap(), Outcome::Interrupted);
        handle.terminated().await;
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let mut env = env(Arc::new(InstanceRegistry::new()));
        env.deadline = Some(Duration::from_millis(50));
        let g = graph(json!({
            "name": "m",
            "states": [{"name": "a", "initial": true}]
        }));

        let (_handle, task) = spawn(g, root(), &env);
        assert_eq!(join(task).await.unwrap(), Outcome::DeadlineElapsed);
    }

    #[tokio::test]
    async fn test_nested_stops_with_parent() {
        let env = env(Arc::new(InstanceRegistry::new()));
        let parent_graph = graph(json!({
            "name": "parent",
            "states": [{"name": "a", "initial": true}]
        }));
        let child_graph = graph(json!({
            "name": "child",
            "states": [{"name": "a", "initial": true}]
        }));

        let (parent, parent_handle) =
            StateMachineInstance::new(parent_graph, root(), None, &env).unwrap();
        let (child, child_handle) = StateMachineInstance::new(
            child_graph,
            parent_handle.extent().clone(),
            Some(&parent_handle),
            &env,
        )
        .unwrap();
        parent_handle.set_nested(vec![child_handle.id().clone()]);
        assert_eq!(child_handle.parent(), Some(parent_handle.id()));

        let parent_task = tokio::spawn(parent.run());
        let child_task = tokio::spawn(child.run());

        parent_handle.cancel();
        assert_eq!(join(parent_task).await.unwrap(), Outcome::Interrupted);
        assert_eq!(join(child_task).await.unwrap(), Outcome::ParentTerminated);
    }

    #[tokio::test]
    async fn test_invalid_local_fails_construction() {
        let env = env(Arc::new(InstanceRegistry::new()));
        let g = graph(json!({
            "name": "m",
            "local": [{"name": "v", "value": "missing + 1"}],
            "states": [{"name": "a", "initial": true}]
        }));

        assert!(StateMachineInstance::new(g, root(), None, &env).is_err());
    }

    #[tokio::test]
    async fn test_always_transition_else_mode() {
        let env = env(Arc::new(InstanceRegistry::new()));
        let g = graph(json!({
            "name": "m",
            "local": [{"name": "log", "value": "''"}],
            "states": [
                {"name": "a", "initial": true, "always": [{
                    "target": "b", "guards": ["false"], "else": "c",
                    "actions": [{"type": "assign", "variable": {"name": "log", "value": "log + 't'"}}]
                }]},
                {"name": "b", "terminal": true},
                {"name": "c", "terminal": true,
                 "entry": [{"type": "assign", "variable": {"name": "log", "value": "log + 'c'"}}]}
            ]
        }));

        let (handle, task) = spawn(g, root(), &env);
        assert_eq!(join(task).await.unwrap(), Outcome::Done);
        assert_eq!(handle.active_state().as_deref(), Some("c"));
        assert_eq!(handle.extent().get("log").unwrap(), json!("c"));
    }

    #[test]
    fn test_timeout_delay_validation() {
        let extent = root();
        let timeout = |delay: serde_json::Value| {
            let raw = serde_json::from_value(json!({"type": "timeout", "name": "t", "delay": delay,
                "action": {"type": "raise", "event": {"name": "e"}}}))
            .unwrap();
            match csm_core::Action::from_raw(&raw).unwrap() {
                csm_core::Action::Timeout(t) => t,
                _ => unreachable!(),
            }
        };

        assert_eq!(
            timeout_delay(&timeout(json!(250)), &extent).unwrap(),
            Duration::from_millis(250)
        );
        assert!(matches!(
            timeout_delay(&timeout(json!(-1)), &extent),
            Err(RuntimeError::InvalidTimer { .. })
        ));
        assert!(matches!(
            timeout_delay(&timeout(json!("'soon'")), &extent),
            Err(RuntimeError::InvalidTimer { .. })
        ));
    }

    /// Holds every invocation until released.
    struct GatedService {
        started: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl crate::service::ServiceImplementation for GatedService {
        fn name(&self) -> &str {
            "gated"
        }

        fn cost(&self) -> f64 {
            1.0
        }

        fn performance(&self) -> f64 {
            1.0
        }

        fn is_local(&self) -> bool {
            true
        }

        async fn invoke(
            &self,
            input: Vec<ContextVariable>,
            _caller_id: &str,
        ) -> Result<Vec<ContextVariable>, RuntimeError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(input)
        }
    }

    #[tokio::test]
    async fn test_exit_aborts_while_invocations() {
        let gated = Arc::new(GatedService {
            started: Notify::new(),
            release: Notify::new(),
        });
        let services = Arc::new(ServiceRegistry::new());
        services.register(gated.clone());
        let env = InstanceEnv {
            services: Arc::new(OptimalSelector::new(services)),
            ..env(Arc::new(InstanceRegistry::new()))
        };

        let g = graph(json!({
            "name": "m",
            "local": [{"name": "v", "value": 0}],
            "states": [
                {"name": "a", "initial": true,
                 "while": [{"type": "invoke", "service_type": "gated",
                            "input": [{"name": "v", "value": "v + 1"}],
                            "output": ["v"],
                            "done": [{"name": "finished"}]}],
                 "on": [{"event": "leave", "target": "b"}]},
                {"name": "b", "on": [{"event": "finished", "target": "c"}]},
                {"name": "c", "terminal": true}
            ]
        }));

        let (handle, task) = spawn(g, root(), &env);
        tokio::time::timeout(Duration::from_secs(5), gated.started.notified())
            .await
            .unwrap();

        handle.on_receive_event(Event::new("leave", EventChannel::Internal, vec![]));
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.active_state().as_deref() != Some("b") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The invocation was aborted on exit, so releasing it has no effect
        gated.release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.extent().get("v").unwrap(), json!(0));
        assert_eq!(handle.active_state().as_deref(), Some("b"));

        handle.cancel();
        assert_eq!(join(task).await.unwrap(), Outcome::Interrupted);
    }
}
