//! # csm-core
//!
//! Model of collaborative state machines.
//!
//! This crate provides:
//! - Variable contexts and layered extents
//! - The expression language used by guards and actions
//! - Events and action definitions
//! - State graph parsing and validation

pub mod action;
pub mod context;
pub mod error;
pub mod event;
pub mod expression;
pub mod extent;
pub mod graph;

pub use action::{
    Action, ActionRaw, AssignAction, CreateAction, InvokeAction, MatchAction, MatchCase,
    RaiseAction, TimeoutAction, TimeoutResetAction,
};
pub use context::{Context, ContextVariable, InMemoryContext, VariableDef};
pub use error::CoreError;
pub use event::{Event, EventChannel, EventDef, EVENT_DATA_VARIABLE_PREFIX};
pub use expression::{values_equal, Expression, VariableLookup};
pub use extent::Extent;
pub use graph::{
    CollaborativeStateMachine, CollaborativeStateMachineRaw, GraphBuilder, StateDef, StateGraph,
    StateGraphRaw, TransitionDef,
};
