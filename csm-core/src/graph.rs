//! State graph and collaborative state machine definitions.
//!
//! Descriptions use a JSON DSL:
//!
//! ```json
//! {
//!   "name": "counter",
//!   "persistent": [{"name": "v", "value": 0}],
//!   "machines": [{
//!     "name": "counter",
//!     "states": [
//!       {"name": "a", "initial": true,
//!        "after": [{"type": "timeout", "name": "tick", "delay": 100,
//!                   "action": {"type": "raise", "event": {"name": "update"}}}],
//!        "on": [{"event": "update", "target": "b"}]},
//!       {"name": "b",
//!        "entry": [{"type": "assign", "variable": {"name": "v", "value": "v + 1"}}],
//!        "always": [{"target": "a", "guards": ["v < 10"], "else": "c"}]},
//!       {"name": "c", "terminal": true}
//!     ]
//!   }]
//! }
//! ```

use crate::action::{build_variable, Action, ActionRaw, TimeoutAction, VariableRaw};
use crate::context::VariableDef;
use crate::error::CoreError;
use crate::expression::{Expression, VariableLookup};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Raw transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionRaw {
    /// Target state; absent for internal transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Guard expressions; all must hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionRaw>,

    /// Target taken (without running actions) when the guards fail.
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_target: Option<String>,
}

/// Raw event-triggered transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnTransitionRaw {
    pub event: String,

    #[serde(flatten)]
    pub transition: TransitionRaw,
}

/// Raw state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRaw {
    pub name: String,

    #[serde(default)]
    pub initial: bool,

    #[serde(default)]
    pub terminal: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<ActionRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exit: Vec<ActionRaw>,

    #[serde(default, rename = "while", skip_serializing_if = "Vec::is_empty")]
    pub while_actions: Vec<ActionRaw>,

    /// Timeout actions started when the state is entered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<ActionRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<OnTransitionRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub always: Vec<TransitionRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local: Vec<VariableRaw>,
}

/// Raw state graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateGraphRaw {
    pub name: String,

    /// Abstract graphs are never instantiated.
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local: Vec<VariableRaw>,

    pub states: Vec<StateRaw>,

    /// Graphs instantiated as children of every instance of this graph.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<StateGraphRaw>,
}

/// Raw collaborative state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborativeStateMachineRaw {
    pub name: String,

    /// Variables created in the persistent context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persistent: Vec<VariableRaw>,

    pub machines: Vec<StateGraphRaw>,
}

/// A built transition.
#[derive(Debug)]
pub struct TransitionDef {
    /// Triggering event; `None` for always-transitions.
    pub event: Option<String>,
    pub target: Option<String>,
    pub else_target: Option<String>,
    pub guards: Vec<Expression>,
    pub actions: Vec<Arc<Action>>,
}

impl TransitionDef {
    /// Evaluates the guards in order, stopping at the first that fails.
    pub fn evaluate_guards<L: VariableLookup + ?Sized>(&self, vars: &L) -> Result<bool, CoreError> {
        for guard in &self.guards {
            if !guard.evaluate_bool(vars)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Returns the target state taken in normal or else mode.
    pub fn target_for(&self, is_else: bool) -> Option<&str> {
        if is_else {
            self.else_target.as_deref()
        } else {
            self.target.as_deref()
        }
    }

    pub fn has_else(&self) -> bool {
        self.else_target.is_some()
    }
}

/// A built state.
#[derive(Debug)]
pub struct StateDef {
    pub name: String,
    pub is_initial: bool,
    pub is_terminal: bool,
    pub entry: Vec<Arc<Action>>,
    pub exit: Vec<Arc<Action>>,
    pub while_actions: Vec<Arc<Action>>,
    pub after: Vec<TimeoutAction>,
    pub local: Vec<VariableDef>,
    /// `on` transitions indexed by event name, in declaration order.
    on: HashMap<String, Vec<Arc<TransitionDef>>>,
    always: Vec<Arc<TransitionDef>>,
}

impl StateDef {
    /// Returns the transitions triggered by `event`.
    pub fn on_transitions(&self, event: &str) -> &[Arc<TransitionDef>] {
        self.on.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn always_transitions(&self) -> &[Arc<TransitionDef>] {
        &self.always
    }

    /// Returns the events this state reacts to.
    pub fn events(&self) -> Vec<&str> {
        self.on.keys().map(String::as_str).collect()
    }
}

/// Validated and indexed state graph.
#[derive(Debug)]
pub struct StateGraph {
    pub name: String,
    pub is_abstract: bool,
    pub local: Vec<VariableDef>,
    pub nested: Vec<Arc<StateGraph>>,

    /// States in declaration order.
    states: Vec<Arc<StateDef>>,
    state_index: HashMap<String, usize>,
    initial: usize,

    /// Original raw description.
    pub raw: StateGraphRaw,

    /// Hash of the description for identification in logs.
    pub checksum: String,
}

impl StateGraph {
    /// Parses and validates a graph from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let raw: StateGraphRaw = serde_json::from_value(json.clone())?;
        GraphBuilder::new().build_graph(raw)
    }

    /// Returns the initial state.
    pub fn initial_state(&self) -> &Arc<StateDef> {
        &self.states[self.initial]
    }

    /// Looks up a state by name.
    pub fn state(&self, name: &str) -> Option<&Arc<StateDef>> {
        self.state_index.get(name).map(|&i| &self.states[i])
    }

    pub fn states(&self) -> &[Arc<StateDef>] {
        &self.states
    }

    /// Returns the transitions of `state` triggered by `event`.
    pub fn on_transitions(&self, state: &str, event: &str) -> &[Arc<TransitionDef>] {
        self.state(state)
            .map(|s| s.on_transitions(event))
            .unwrap_or(&[])
    }

    /// Returns the names of the events any state reacts to, sorted.
    pub fn events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self.states.iter().flat_map(|s| s.events()).collect();
        events.sort_unstable();
        events.dedup();
        events
    }

    /// Returns the always-transitions of `state`.
    pub fn always_transitions(&self, state: &str) -> &[Arc<TransitionDef>] {
        self.state(state)
            .map(|s| s.always_transitions())
            .unwrap_or(&[])
    }

    /// Returns the raw definition as JSON.
    pub fn to_json(&self) -> Result<serde_json::Value, CoreError> {
        Ok(serde_json::to_value(&self.raw)?)
    }
}

/// A set of state graphs sharing a persistent context.
#[derive(Debug)]
pub struct CollaborativeStateMachine {
    pub name: String,
    pub persistent: Vec<VariableDef>,
    pub machines: Vec<Arc<StateGraph>>,
    pub checksum: String,
}

impl CollaborativeStateMachine {
    /// Parses and validates a collaborative machine from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let raw: CollaborativeStateMachineRaw = serde_json::from_value(json.clone())?;
        GraphBuilder::new().build(raw)
    }

    /// Finds a graph by name, searching nested graphs too.
    pub fn find_graph(&self, name: &str) -> Option<&Arc<StateGraph>> {
        fn search<'a>(graphs: &'a [Arc<StateGraph>], name: &str) -> Option<&'a Arc<StateGraph>> {
            graphs
                .iter()
                .find_map(|g| (g.name == name).then_some(g).or_else(|| search(&g.nested, name)))
        }
        search(&self.machines, name)
    }
}

/// Builds graphs from raw descriptions.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphBuilder {
    strict: bool,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// In strict mode a state may not declare two `on` transitions for the
    /// same event.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Builds a collaborative state machine.
    pub fn build(
        &self,
        raw: CollaborativeStateMachineRaw,
    ) -> Result<CollaborativeStateMachine, CoreError> {
        if raw.name.is_empty() {
            return Err(invalid("collaborative state machine name must not be empty"));
        }

        let persistent = raw
            .persistent
            .iter()
            .map(build_variable)
            .collect::<Result<Vec<_>, _>>()?;

        let machines = raw
            .machines
            .iter()
            .map(|g| self.build_graph(g.clone()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        // Graph names identify instances in logs and lookups
        let mut names = HashSet::new();
        let mut stack: Vec<&Arc<StateGraph>> = machines.iter().collect();
        while let Some(graph) = stack.pop() {
            if !names.insert(graph.name.as_str()) {
                return Err(invalid(format!("duplicate state machine name '{}'", graph.name)));
            }
            stack.extend(graph.nested.iter());
        }

        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));
        tracing::debug!(
            "Built {} ({} machines, checksum {})",
            raw.name,
            names.len(),
            checksum
        );

        Ok(CollaborativeStateMachine {
            name: raw.name,
            persistent,
            machines,
            checksum,
        })
    }

    /// Builds a single state graph (and its nested graphs).
    pub fn build_graph(&self, raw: StateGraphRaw) -> Result<StateGraph, CoreError> {
        if raw.name.is_empty() {
            return Err(invalid("state machine name must not be empty"));
        }
        if raw.states.is_empty() {
            return Err(invalid(format!("state machine '{}' has no states", raw.name)));
        }

        // Index state names
        let mut state_index = HashMap::new();
        for (i, state) in raw.states.iter().enumerate() {
            if state_index.insert(state.name.clone(), i).is_some() {
                return Err(invalid(format!(
                    "duplicate state '{}' in state machine '{}'",
                    state.name, raw.name
                )));
            }
        }

        // Exactly one initial state
        let initials: Vec<usize> = raw
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.initial)
            .map(|(i, _)| i)
            .collect();
        let initial = match initials.as_slice() {
            [single] => *single,
            [] => {
                return Err(invalid(format!(
                    "state machine '{}' has no initial state",
                    raw.name
                )))
            }
            _ => {
                return Err(invalid(format!(
                    "state machine '{}' has {} initial states",
                    raw.name,
                    initials.len()
                )))
            }
        };

        let states = raw
            .states
            .iter()
            .map(|s| self.build_state(s, &state_index).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let local = raw
            .local
            .iter()
            .map(build_variable)
            .collect::<Result<Vec<_>, _>>()?;

        let nested = raw
            .nested
            .iter()
            .map(|g| self.build_graph(g.clone()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        Ok(StateGraph {
            name: raw.name.clone(),
            is_abstract: raw.is_abstract,
            local,
            nested,
            states,
            state_index,
            initial,
            raw,
            checksum,
        })
    }

    fn build_state(
        &self,
        raw: &StateRaw,
        state_index: &HashMap<String, usize>,
    ) -> Result<StateDef, CoreError> {
        let build_actions = |actions: &[ActionRaw]| {
            actions
                .iter()
                .map(|a| Action::from_raw(a).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()
        };

        let mut after = Vec::new();
        let mut timeout_names = HashSet::new();
        for raw_action in &raw.after {
            let action = Action::from_raw(raw_action)?;
            let timeout = match action {
                Action::Timeout(timeout) => timeout,
                other => {
                    return Err(invalid(format!(
                        "state '{}' has a '{}' action in 'after'; only timeout actions are allowed",
                        raw.name,
                        other.kind()
                    )))
                }
            };
            if !timeout_names.insert(timeout.name.clone()) {
                return Err(invalid(format!(
                    "duplicate timeout '{}' in state '{}'",
                    timeout.name, raw.name
                )));
            }
            after.push(timeout);
        }

        let mut on: HashMap<String, Vec<Arc<TransitionDef>>> = HashMap::new();
        for t in &raw.on {
            if t.event.is_empty() {
                return Err(invalid(format!(
                    "state '{}' has a transition with an empty event",
                    raw.name
                )));
            }
            let transition = build_transition(Some(&t.event), &t.transition, state_index)?;
            let entry = on.entry(t.event.clone()).or_default();
            if self.strict && !entry.is_empty() {
                return Err(invalid(format!(
                    "duplicate transition from '{}' on event '{}'",
                    raw.name, t.event
                )));
            }
            if !entry.is_empty() {
                tracing::debug!(
                    "State '{}' declares {} transitions on '{}'",
                    raw.name,
                    entry.len() + 1,
                    t.event
                );
            }
            entry.push(Arc::new(transition));
        }

        let always = raw
            .always
            .iter()
            .map(|t| build_transition(None, t, state_index).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StateDef {
            name: raw.name.clone(),
            is_initial: raw.initial,
            is_terminal: raw.terminal,
            entry: build_actions(&raw.entry)?,
            exit: build_actions(&raw.exit)?,
            while_actions: build_actions(&raw.while_actions)?,
            after,
            local: raw
                .local
                .iter()
                .map(build_variable)
                .collect::<Result<Vec<_>, _>>()?,
            on,
            always,
        })
    }
}

fn build_transition(
    event: Option<&str>,
    raw: &TransitionRaw,
    state_index: &HashMap<String, usize>,
) -> Result<TransitionDef, CoreError> {
    for name in raw.target.iter().chain(raw.else_target.iter()) {
        if !state_index.contains_key(name) {
            return Err(invalid(format!(
                "transition target '{}' not in states list",
                name
            )));
        }
    }

    Ok(TransitionDef {
        event: event.map(str::to_string),
        target: raw.target.clone(),
        else_target: raw.else_target.clone(),
        guards: raw
            .guards
            .iter()
            .map(|g| Expression::parse(g))
            .collect::<Result<Vec<_>, _>>()?,
        actions: raw
            .actions
            .iter()
            .map(|a| Action::from_raw(a).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?,
    })
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidDefinition {
        reason: reason.into(),
    }
}
