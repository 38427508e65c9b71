//! Commands and the continuation worklist.
//!
//! Every unit of work an instance performs is a [`Command`]. Executing a
//! command produces follow-up commands, which are pushed to the *front* of
//! the worklist so that execution is depth-first: a command's follow-ups run
//! before any command queued after it.
//!
//! Action commands (assign, raise, invoke, ...) only need an
//! [`ExecutionContext`]. Control commands (state enter/exit/change,
//! transitions) drive the enter/exit/transition protocol and need mutable
//! access to the machine through [`ControlTarget`].

use crate::error::RuntimeError;
use crate::event_handler::{EventHandler, EventListener};
use crate::instance::InstanceId;
use crate::service::ServiceSelector;
use crate::timeout::TimeoutManager;
use csm_core::action::{Action, InvokeAction};
use csm_core::{values_equal, ContextVariable, Event, EventChannel, Extent, StateDef, TransitionDef};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::task::AbortHandle;

/// Scope an action command executes in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Instance-level: transition actions.
    Instance,
    /// State-level: entry, exit, while and after actions.
    State(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Instance => f.write_str("instance"),
            Scope::State(name) => write!(f, "state {}", name),
        }
    }
}

/// Background tasks started from a state, aborted when the state is exited.
#[derive(Default)]
pub struct TaskSet {
    tasks: Mutex<Vec<AbortHandle>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, handle: AbortHandle) {
        self.tasks.lock().push(handle);
    }

    /// Aborts every tracked task.
    pub fn abort_all(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

/// Collaborators and scope an action command runs against.
#[derive(Clone)]
pub struct ExecutionContext {
    pub instance_id: InstanceId,
    pub scope: Scope,
    pub extent: Extent,
    /// Receives internal events and service completion events.
    pub listener: Arc<dyn EventListener>,
    /// Delivers non-internal events.
    pub event_handler: Arc<dyn EventHandler>,
    pub services: Arc<dyn ServiceSelector>,
    pub timeouts: Arc<TimeoutManager>,
    /// When set, asynchronous work started by the command is tracked here.
    pub tasks: Option<Arc<TaskSet>>,
}

impl ExecutionContext {
    /// Returns a copy whose asynchronous work is tracked by `tasks`.
    pub fn with_tasks(mut self, tasks: Arc<TaskSet>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Routes an event: internal events go to the owning instance, all
    /// others through the event handler.
    pub fn deliver(&self, event: Event) -> Result<(), RuntimeError> {
        match event.channel {
            EventChannel::Internal => {
                let name = event.name.clone();
                if !self.listener.on_receive_event(event) {
                    tracing::debug!(
                        "{} dropped internal event {}: instance terminated",
                        self.instance_id,
                        name
                    );
                }
                Ok(())
            }
            _ => self.event_handler.send(&event, self.instance_id.as_str()),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("instance_id", &self.instance_id)
            .field("scope", &self.scope)
            .field("extent", &self.extent)
            .finish()
    }
}

/// A transition chosen by the selection rule.
#[derive(Debug, Clone)]
pub struct SelectedTransition {
    pub transition: Arc<TransitionDef>,
    /// Guards failed and the transition was selected for its else target.
    pub is_else: bool,
}

impl SelectedTransition {
    /// Returns the state this transition leads to, if any.
    pub fn target(&self) -> Option<&str> {
        self.transition.target_for(self.is_else)
    }

    /// Internal transitions run their actions without leaving the state.
    pub fn is_internal(&self) -> bool {
        self.target().is_none()
    }
}

/// A unit of work.
#[derive(Debug, Clone)]
pub enum Command {
    Action(ActionCommand),
    Control(ControlCommand),
}

impl Command {
    pub fn action(context: ExecutionContext, action: Arc<Action>) -> Self {
        Command::Action(ActionCommand::new(context, action))
    }
}

/// Executes one action in a context.
#[derive(Debug, Clone)]
pub struct ActionCommand {
    context: ExecutionContext,
    action: Arc<Action>,
}

impl ActionCommand {
    pub fn new(context: ExecutionContext, action: Arc<Action>) -> Self {
        Self { context, action }
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn is_raise(&self) -> bool {
        matches!(*self.action, Action::Raise(_))
    }

    /// Executes the action and returns its follow-up commands.
    pub fn execute(&self) -> Result<Vec<Command>, RuntimeError> {
        let ctx = &self.context;

        match self.action.as_ref() {
            Action::Assign(assign) => {
                let variable = assign.variable.evaluate(&ctx.extent)?;
                let written = ctx.extent.try_set(&variable.name, variable.value)?;
                tracing::debug!(
                    "{} assigned {} ({} bytes)",
                    ctx.instance_id,
                    variable.name,
                    written
                );
                Ok(Vec::new())
            }
            Action::Create(create) => {
                let variable = create.variable.evaluate(&ctx.extent)?;
                let written = ctx
                    .extent
                    .create(&variable.name, variable.value, create.persistent)?;
                tracing::debug!(
                    "{} created {}{} ({} bytes)",
                    ctx.instance_id,
                    if create.persistent { "persistent " } else { "" },
                    variable.name,
                    written
                );
                Ok(Vec::new())
            }
            Action::Invoke(invoke) => {
                self.invoke(invoke)?;
                Ok(Vec::new())
            }
            Action::Match(matcher) => {
                let value = matcher.value.evaluate(&ctx.extent)?;
                let mut commands = Vec::new();
                for case in &matcher.cases {
                    if values_equal(&value, &case.case.evaluate(&ctx.extent)?) {
                        commands.push(Command::action(ctx.clone(), case.action.clone()));
                    }
                }
                Ok(commands)
            }
            Action::Raise(raise) => {
                let event = raise.event.evaluate(&ctx.extent)?;
                tracing::debug!(
                    "{} raised {} event {}",
                    ctx.instance_id,
                    event.channel.as_str(),
                    event.name
                );
                ctx.deliver(event)?;
                Ok(Vec::new())
            }
            Action::Timeout(timeout) => Ok(vec![Command::action(
                ctx.clone(),
                timeout.action.clone(),
            )]),
            Action::TimeoutReset(reset) => {
                ctx.timeouts.stop(&reset.action)?;
                Ok(Vec::new())
            }
        }
    }

    fn invoke(&self, invoke: &InvokeAction) -> Result<(), RuntimeError> {
        let ctx = &self.context;
        let service = ctx
            .services
            .select(&invoke.service_type, invoke.is_local)
            .ok_or_else(|| RuntimeError::ServiceNotFound {
                service_type: invoke.service_type.clone(),
            })?;

        let input = invoke
            .input
            .iter()
            .map(|v| v.evaluate(&ctx.extent))
            .collect::<Result<Vec<_>, _>>()?;

        let context = ctx.clone();
        let action = self.action.clone();
        let handle = tokio::spawn(async move {
            match service.invoke(input, context.instance_id.as_str()).await {
                Ok(output) => {
                    if let Action::Invoke(invoke) = action.as_ref() {
                        complete_invocation(&context, invoke, output);
                    }
                }
                Err(e) => tracing::error!(
                    "{} invocation of {} failed: {}",
                    context.instance_id,
                    service.name(),
                    e
                ),
            }
        });

        if let Some(tasks) = &ctx.tasks {
            tasks.track(handle.abort_handle());
        }
        Ok(())
    }
}

/// Applies a service's output: assigns the declared output variables and
/// raises the done events carrying the whole output.
fn complete_invocation(context: &ExecutionContext, invoke: &InvokeAction, output: Vec<ContextVariable>) {
    for name in &invoke.output {
        match output.iter().find(|v| &v.name == name) {
            Some(variable) => {
                if let Err(e) = context.extent.try_set(name, variable.value.clone()) {
                    tracing::warn!(
                        "{} could not assign output {} of {}: {}",
                        context.instance_id,
                        name,
                        invoke.service_type,
                        e
                    );
                }
            }
            None => tracing::warn!(
                "{} output {} missing from {} response",
                context.instance_id,
                name,
                invoke.service_type
            ),
        }
    }

    for done in &invoke.done {
        let event = done.to_event_with(output.clone());
        if !context.listener.on_receive_event(event) {
            tracing::debug!(
                "{} dropped done event {}: instance terminated",
                context.instance_id,
                done.name
            );
        }
    }
}

/// Machine operations needed by control commands.
pub trait ControlTarget {
    fn active_state(&self) -> Option<Arc<StateDef>>;

    fn state(&self, name: &str) -> Option<Arc<StateDef>>;

    /// Context for transition actions.
    fn instance_context(&self) -> ExecutionContext;

    /// Context for entry, exit and after actions of `state`.
    fn state_context(&self, state: &StateDef) -> ExecutionContext;

    /// Context for while actions of `state`.
    fn while_context(&self, state: &StateDef) -> ExecutionContext;

    fn start_timeouts(&mut self, state: &StateDef) -> Result<(), RuntimeError>;

    fn stop_timeouts(&mut self);

    /// Aborts asynchronous work scoped to the active state.
    fn cancel_state_tasks(&mut self);

    fn set_active_state(&mut self, state: Arc<StateDef>);

    fn select_always(&self, state: &StateDef) -> Result<Option<SelectedTransition>, RuntimeError>;
}

/// A step of the enter/exit/transition protocol.
#[derive(Clone)]
pub enum ControlCommand {
    /// Enters the initial state.
    TransitionInitial(Arc<StateDef>),
    /// Runs entry and while actions, then changes the active state.
    StateEnter(Arc<StateDef>),
    /// Runs exit actions and cancels timers.
    StateExit(Arc<StateDef>),
    /// Starts timers, sets the active state and follows always-transitions.
    StateChange(Arc<StateDef>),
    Transition(SelectedTransition),
}

impl fmt::Debug for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::TransitionInitial(s) => write!(f, "TransitionInitial({})", s.name),
            ControlCommand::StateEnter(s) => write!(f, "StateEnter({})", s.name),
            ControlCommand::StateExit(s) => write!(f, "StateExit({})", s.name),
            ControlCommand::StateChange(s) => write!(f, "StateChange({})", s.name),
            ControlCommand::Transition(t) => write!(
                f,
                "Transition({:?}, else={})",
                t.target(),
                t.is_else
            ),
        }
    }
}

impl ControlCommand {
    /// Executes the step and returns its follow-up commands.
    pub fn execute<T: ControlTarget + ?Sized>(self, target: &mut T) -> Result<Vec<Command>, RuntimeError> {
        match self {
            ControlCommand::TransitionInitial(state) => {
                Ok(vec![Command::Control(ControlCommand::StateEnter(state))])
            }
            ControlCommand::StateEnter(state) => {
                let ctx = target.state_context(&state);
                let while_ctx = target.while_context(&state);

                let mut commands: Vec<Command> = state
                    .entry
                    .iter()
                    .map(|a| Command::action(ctx.clone(), a.clone()))
                    .collect();
                commands.extend(
                    state
                        .while_actions
                        .iter()
                        .map(|a| Command::action(while_ctx.clone(), a.clone())),
                );
                commands.push(Command::Control(ControlCommand::StateChange(state)));
                Ok(commands)
            }
            ControlCommand::StateExit(state) => {
                target.stop_timeouts();
                target.cancel_state_tasks();

                let ctx = target.state_context(&state);
                Ok(state
                    .exit
                    .iter()
                    .map(|a| Command::action(ctx.clone(), a.clone()))
                    .collect())
            }
            ControlCommand::StateChange(state) => {
                target.start_timeouts(&state)?;
                target.set_active_state(state.clone());

                Ok(target
                    .select_always(&state)?
                    .map(|t| vec![Command::Control(ControlCommand::Transition(t))])
                    .unwrap_or_default())
            }
            ControlCommand::Transition(selected) => {
                let actions: Vec<Command> = if selected.is_else {
                    Vec::new()
                } else {
                    let ctx = target.instance_context();
                    selected
                        .transition
                        .actions
                        .iter()
                        .map(|a| Command::action(ctx.clone(), a.clone()))
                        .collect()
                };

                let Some(name) = selected.target() else {
                    return Ok(actions);
                };

                let next = target
                    .state(name)
                    .ok_or_else(|| RuntimeError::StateNotFound {
                        state: name.to_string(),
                    })?;
                let current = target.active_state().ok_or(RuntimeError::NoActiveState)?;

                let mut commands = Vec::with_capacity(actions.len() + 2);
                commands.push(Command::Control(ControlCommand::StateExit(current)));
                commands.extend(actions);
                commands.push(Command::Control(ControlCommand::StateEnter(next)));
                Ok(commands)
            }
        }
    }
}

/// Depth-first worklist of commands.
#[derive(Debug, Default)]
pub struct CommandQueue {
    queue: VecDeque<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes `commands` to the front, preserving their order.
    pub fn push_front_all(&mut self, commands: Vec<Command>) {
        for command in commands.into_iter().rev() {
            self.queue.push_front(command);
        }
    }

    pub fn pop(&mut self) -> Option<Command> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drains the worklist against a machine. Action failures are logged and
    /// skipped; a control failure stops the drain and is returned.
    pub fn run<T: ControlTarget + ?Sized>(&mut self, target: &mut T) -> Result<(), RuntimeError> {
        while let Some(command) = self.pop() {
            let next = match command {
                Command::Action(action) => execute_logged(&action),
                Command::Control(control) => control.execute(target)?,
            };
            self.push_front_all(next);
        }
        Ok(())
    }

    /// Drains a worklist that has no machine to drive, as when a timer
    /// fires. Control commands are dropped with a warning.
    pub fn run_detached(&mut self) {
        while let Some(command) = self.pop() {
            let next = match command {
                Command::Action(action) => execute_logged(&action),
                Command::Control(control) => {
                    tracing::warn!("Dropping {:?} outside of an instance worker", control);
                    Vec::new()
                }
            };
            self.push_front_all(next);
        }
    }
}

fn execute_logged(command: &ActionCommand) -> Vec<Command> {
    match command.execute() {
        Ok(next) => next,
        Err(e) => {
            tracing::error!(
                "{} failed to execute {} action in {}: {}",
                command.context.instance_id,
                command.action.kind(),
                command.context.scope,
                e
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_handler::LocalEventHandler;
    use crate::service::{FnService, OptimalSelector, ServiceRegistry};
    use csm_core::{Context, InMemoryContext, StateGraph};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl EventListener for Recorder {
        fn on_receive_event(&self, event: Event) -> bool {
            self.events.lock().push(event);
            true
        }
    }

    struct Fixture {
        context: ExecutionContext,
        locals: Arc<InMemoryContext>,
        persistent: Arc<InMemoryContext>,
        recorder: Arc<Recorder>,
    }

    fn fixture() -> Fixture {
        let persistent = Arc::new(InMemoryContext::new());
        let locals = Arc::new(InMemoryContext::new());
        let recorder = Arc::new(Recorder::default());
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(Arc::new(FnService::increment("increment")));

        let context = ExecutionContext {
            instance_id: InstanceId::from("test"),
            scope: Scope::Instance,
            extent: Extent::new(persistent.clone()).extend(locals.clone()),
            listener: recorder.clone(),
            event_handler: Arc::new(LocalEventHandler::new(16)),
            services: Arc::new(OptimalSelector::new(registry)),
            timeouts: Arc::new(TimeoutManager::new(tokio::runtime::Handle::current())),
            tasks: None,
        };

        Fixture {
            context,
            locals,
            persistent,
            recorder,
        }
    }

    fn action(value: serde_json::Value) -> Arc<Action> {
        let raw = serde_json::from_value(value).unwrap();
        Arc::new(Action::from_raw(&raw).unwrap())
    }

    fn run(context: &ExecutionContext, actions: Vec<Arc<Action>>) {
        let mut queue = CommandQueue::new();
        queue.push_front_all(
            actions
                .into_iter()
                .map(|a| Command::action(context.clone(), a))
                .collect(),
        );
        queue.run_detached();
    }

    #[tokio::test]
    async fn test_assign_runs_in_order() {
        let f = fixture();
        f.locals.create("v", json!(5)).unwrap();

        run(
            &f.context,
            vec![
                action(json!({"type": "assign", "variable": {"name": "v", "value": "v + 1"}})),
                action(json!({"type": "assign", "variable": {"name": "v", "value": "v + 1"}})),
            ],
        );

        assert_eq!(f.locals.get("v").unwrap(), json!(7));
    }

    #[tokio::test]
    async fn test_failed_action_is_skipped() {
        let f = fixture();
        f.locals.create("v", json!(1)).unwrap();

        run(
            &f.context,
            vec![
                action(json!({"type": "assign", "variable": {"name": "missing", "value": 1}})),
                action(json!({"type": "assign", "variable": {"name": "v", "value": "v * 10"}})),
            ],
        );

        assert_eq!(f.locals.get("v").unwrap(), json!(10));
    }

    #[tokio::test]
    async fn test_create_respects_persistence() {
        let f = fixture();
        run(
            &f.context,
            vec![
                action(json!({"type": "create", "variable": {"name": "p", "value": 1}, "persistent": true})),
                action(json!({"type": "create", "variable": {"name": "l", "value": 2}})),
            ],
        );

        assert!(f.persistent.contains("p"));
        assert!(!f.locals.contains("p"));
        assert!(f.locals.contains("l"));
    }

    #[tokio::test]
    async fn test_match_runs_matching_cases_before_later_actions() {
        let f = fixture();
        f.locals.create("v", json!(1)).unwrap();
        f.locals.create("log", json!("")).unwrap();

        run(
            &f.context,
            vec![
                action(json!({"type": "match", "value": "v", "cases": [
                    {"case": 1, "action": {"type": "assign", "variable": {"name": "log", "value": "log + 'a'"}}},
                    {"case": 2, "action": {"type": "assign", "variable": {"name": "log", "value": "log + 'b'"}}},
                    {"case": 1.0, "action": {"type": "assign", "variable": {"name": "log", "value": "log + 'c'"}}}
                ]})),
                action(json!({"type": "assign", "variable": {"name": "log", "value": "log + 'z'"}})),
            ],
        );

        assert_eq!(f.locals.get("log").unwrap(), json!("acz"));
    }

    #[tokio::test]
    async fn test_raise_internal_goes_to_listener() {
        let f = fixture();
        f.locals.create("v", json!(3)).unwrap();

        run(
            &f.context,
            vec![action(json!({"type": "raise", "event": {
                "name": "go", "data": [{"name": "v", "value": "v * 2"}]}}))],
        );

        let events = f.recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "go");
        assert_eq!(events[0].data_value("v"), Some(&json!(6)));
    }

    #[tokio::test]
    async fn test_raise_external_goes_to_handler() {
        let f = fixture();
        run(
            &f.context,
            vec![action(json!({"type": "raise", "event": {"name": "out", "channel": "external"}}))],
        );
        // Not looped back through the instance listener
        assert!(f.recorder.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_action_expands_to_raise() {
        let f = fixture();
        let timeout = action(json!({"type": "timeout", "name": "t", "delay": 10,
            "action": {"type": "raise", "event": {"name": "tick"}}}));

        let next = ActionCommand::new(f.context.clone(), timeout).execute().unwrap();
        assert_eq!(next.len(), 1);
        match &next[0] {
            Command::Action(command) => assert!(command.is_raise()),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_reset_unknown_timer_fails() {
        let f = fixture();
        let reset = action(json!({"type": "timeout_reset", "action": "nope"}));
        assert!(matches!(
            ActionCommand::new(f.context.clone(), reset).execute(),
            Err(RuntimeError::TimerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invoke_assigns_output_and_raises_done() {
        let f = fixture();
        f.locals.create("v", json!(41)).unwrap();

        run(
            &f.context,
            vec![action(json!({
                "type": "invoke", "service_type": "increment",
                "input": [{"name": "v", "value": "v"}],
                "output": ["v"],
                "done": [{"name": "incremented"}]
            }))],
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.recorder.events.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(f.locals.get("v").unwrap(), json!(42));
        let events = f.recorder.events.lock();
        assert_eq!(events[0].name, "incremented");
        assert_eq!(events[0].data_value("v"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_invoke_unknown_service_fails() {
        let f = fixture();
        let invoke = action(json!({"type": "invoke", "service_type": "nope"}));
        assert!(matches!(
            ActionCommand::new(f.context.clone(), invoke).execute(),
            Err(RuntimeError::ServiceNotFound { .. })
        ));
    }

    /// Records the protocol steps a control command sequence performs.
    struct FakeMachine {
        graph: StateGraph,
        context: ExecutionContext,
        active: Option<Arc<StateDef>>,
        log: Vec<String>,
    }

    impl ControlTarget for FakeMachine {
        fn active_state(&self) -> Option<Arc<StateDef>> {
            self.active.clone()
        }

        fn state(&self, name: &str) -> Option<Arc<StateDef>> {
            self.graph.state(name).cloned()
        }

        fn instance_context(&self) -> ExecutionContext {
            self.context.clone()
        }

        fn state_context(&self, state: &StateDef) -> ExecutionContext {
            let mut ctx = self.context.clone();
            ctx.scope = Scope::State(state.name.clone());
            ctx
        }

        fn while_context(&self, state: &StateDef) -> ExecutionContext {
            self.state_context(state)
        }

        fn start_timeouts(&mut self, state: &StateDef) -> Result<(), RuntimeError> {
            self.log.push(format!("timers:{}", state.name));
            Ok(())
        }

        fn stop_timeouts(&mut self) {
            self.log.push("stop-timers".to_string());
        }

        fn cancel_state_tasks(&mut self) {}

        fn set_active_state(&mut self, state: Arc<StateDef>) {
            self.log.push(format!("active:{}", state.name));
            self.active = Some(state);
        }

        fn select_always(&self, state: &StateDef) -> Result<Option<SelectedTransition>, RuntimeError> {
            Ok(state.always_transitions().first().map(|t| SelectedTransition {
                transition: t.clone(),
                is_else: false,
            }))
        }
    }

    fn fake_machine(f: &Fixture) -> FakeMachine {
        let graph = StateGraph::from_json(&json!({
            "name": "m",
            "states": [
                {"name": "a", "initial": true,
                 "entry": [{"type": "assign", "variable": {"name": "log", "value": "log + 'ea'"}}],
                 "exit": [{"type": "assign", "variable": {"name": "log", "value": "log + 'xa'"}}],
                 "on": [{"event": "go", "target": "b", "actions": [
                     {"type": "assign", "variable": {"name": "log", "value": "log + 't'"}}]},
                        {"event": "stay", "actions": [
                     {"type": "assign", "variable": {"name": "log", "value": "log + 'i'"}}]}]},
                {"name": "b",
                 "entry": [{"type": "assign", "variable": {"name": "log", "value": "log + 'eb'"}}],
                 "while": [{"type": "assign", "variable": {"name": "log", "value": "log + 'wb'"}}],
                 "always": [{"target": "c"}]},
                {"name": "c", "terminal": true}
            ]
        }))
        .unwrap();

        FakeMachine {
            graph,
            context: f.context.clone(),
            active: None,
            log: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_initial_transition_enters_initial_state() {
        let f = fixture();
        f.locals.create("log", json!("")).unwrap();
        let mut machine = fake_machine(&f);

        let initial = machine.graph.initial_state().clone();
        let mut queue = CommandQueue::new();
        queue.push_front_all(vec![Command::Control(ControlCommand::TransitionInitial(initial))]);
        queue.run(&mut machine).unwrap();

        assert_eq!(f.locals.get("log").unwrap(), json!("ea"));
        assert_eq!(machine.log, vec!["timers:a", "active:a"]);
    }

    #[tokio::test]
    async fn test_external_transition_protocol_order() {
        let f = fixture();
        f.locals.create("log", json!("")).unwrap();
        let mut machine = fake_machine(&f);
        machine.active = machine.graph.state("a").cloned();

        let transition = machine.graph.on_transitions("a", "go")[0].clone();
        let mut queue = CommandQueue::new();
        queue.push_front_all(vec![Command::Control(ControlCommand::Transition(
            SelectedTransition {
                transition,
                is_else: false,
            },
        ))]);
        queue.run(&mut machine).unwrap();

        // exit a, transition actions, enter b (entry, while), always to c
        assert_eq!(f.locals.get("log").unwrap(), json!("xatebwb"));
        assert_eq!(
            machine.log,
            vec![
                "stop-timers",
                "timers:b",
                "active:b",
                "stop-timers",
                "timers:c",
                "active:c"
            ]
        );
        assert_eq!(machine.active.as_ref().unwrap().name, "c");
    }

    #[tokio::test]
    async fn test_internal_transition_stays() {
        let f = fixture();
        f.locals.create("log", json!("")).unwrap();
        let mut machine = fake_machine(&f);
        machine.active = machine.graph.state("a").cloned();

        let transition = machine.graph.on_transitions("a", "stay")[0].clone();
        let mut queue = CommandQueue::new();
        queue.push_front_all(vec![Command::Control(ControlCommand::Transition(
            SelectedTransition {
                transition,
                is_else: false,
            },
        ))]);
        queue.run(&mut machine).unwrap();

        assert_eq!(f.locals.get("log").unwrap(), json!("i"));
        assert!(machine.log.is_empty());
        assert_eq!(machine.active.as_ref().unwrap().name, "a");
    }

    #[tokio::test]
    async fn test_else_mode_skips_actions() {
        let f = fixture();
        f.locals.create("log", json!("")).unwrap();
        let mut machine = fake_machine(&f);
        machine.active = machine.graph.state("a").cloned();

        let transition = machine.graph.on_transitions("a", "stay")[0].clone();
        let commands = ControlCommand::Transition(SelectedTransition {
            transition,
            is_else: true,
        })
        .execute(&mut machine)
        .unwrap();
        assert!(commands.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_target_is_fatal() {
        let f = fixture();
        let mut machine = fake_machine(&f);
        machine.active = machine.graph.state("a").cloned();

        let transition = Arc::new(TransitionDef {
            event: None,
            target: Some("nowhere".to_string()),
            else_target: None,
            guards: Vec::new(),
            actions: Vec::new(),
        });
        let result = ControlCommand::Transition(SelectedTransition {
            transition,
            is_else: false,
        })
        .execute(&mut machine);
        assert!(matches!(result, Err(RuntimeError::StateNotFound { .. })));
    }

    #[test]
    fn test_push_front_all_preserves_order() {
        let mut queue = CommandQueue::new();
        let graph = StateGraph::from_json(&json!({
            "name": "m", "states": [{"name": "a", "initial": true}, {"name": "b"}]
        }))
        .unwrap();
        let a = graph.state("a").unwrap().clone();
        let b = graph.state("b").unwrap().clone();

        queue.push_front_all(vec![Command::Control(ControlCommand::StateEnter(b.clone()))]);
        queue.push_front_all(vec![
            Command::Control(ControlCommand::StateExit(a.clone())),
            Command::Control(ControlCommand::StateChange(a)),
        ]);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|c| format!("{:?}", c))
            .collect();
        assert_eq!(
            order,
            vec![
                "Control(StateExit(a))",
                "Control(StateChange(a))",
                "Control(StateEnter(b))"
            ]
        );
    }
}
