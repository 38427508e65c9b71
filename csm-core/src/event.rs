//! Events and event declarations.

use crate::context::{ContextVariable, VariableDef};
use crate::error::CoreError;
use crate::expression::VariableLookup;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix under which event data is exposed to the receiving instance.
pub const EVENT_DATA_VARIABLE_PREFIX: &str = "$";

/// Delivery channel of an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventChannel {
    /// Delivered to the raising instance (and its nested instances).
    #[default]
    Internal,
    /// Delivered to other instances of the same collaborative machine.
    External,
    /// Delivered to every collaborative machine.
    Global,
    /// Exchanged with peripheral systems.
    Peripheral,
}

impl EventChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventChannel::Internal => "internal",
            EventChannel::External => "external",
            EventChannel::Global => "global",
            EventChannel::Peripheral => "peripheral",
        }
    }
}

/// A concrete, evaluated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: String,
    /// Event name, matched against `on` transitions.
    pub name: String,
    pub channel: EventChannel,
    /// Payload variables.
    #[serde(default)]
    pub data: Vec<ContextVariable>,
    /// Creation time (Unix epoch milliseconds).
    pub created_at: i64,
}

impl Event {
    pub fn new(name: impl Into<String>, channel: EventChannel, data: Vec<ContextVariable>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            channel,
            data,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Returns a fresh event with the same name and channel but different data.
    pub fn with_data(&self, data: Vec<ContextVariable>) -> Self {
        Self::new(self.name.clone(), self.channel, data)
    }

    /// Returns the value of a payload variable.
    pub fn data_value(&self, name: &str) -> Option<&Value> {
        self.data.iter().find(|v| v.name == name).map(|v| &v.value)
    }
}

/// An event as declared in a description, with unevaluated data.
#[derive(Debug, Clone)]
pub struct EventDef {
    pub name: String,
    pub channel: EventChannel,
    pub data: Vec<VariableDef>,
}

impl EventDef {
    pub fn new(name: impl Into<String>, channel: EventChannel) -> Self {
        Self {
            name: name.into(),
            channel,
            data: Vec::new(),
        }
    }

    /// Evaluates the declared data and produces a concrete event.
    pub fn evaluate<L: VariableLookup + ?Sized>(&self, vars: &L) -> Result<Event, CoreError> {
        let data = self
            .data
            .iter()
            .map(|d| d.evaluate(vars))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Event::new(self.name.clone(), self.channel, data))
    }

    /// Produces a concrete event carrying the given data instead of the
    /// declared one.
    pub fn to_event_with(&self, data: Vec<ContextVariable>) -> Event {
        Event::new(self.name.clone(), self.channel, data)
    }
}
