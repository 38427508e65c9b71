//! # csm-runtime
//!
//! Execution engine for collaborative state machines.
//!
//! This crate provides:
//! - The command worklist driving actions and the enter/exit/transition protocol
//! - State machine instances and their event loop
//! - Named recurring timers
//! - Service selection and invocation
//! - In-process event delivery routed by subject subscriptions
//! - The runtime owning every instance, and its configuration

pub mod command;
pub mod config;
pub mod error;
pub mod event_handler;
pub mod instance;
pub mod runtime;
pub mod service;
pub mod timeout;

pub use command::{ActionCommand, Command, CommandQueue, ControlCommand, ExecutionContext, Scope};
pub use config::{Config, ConfigError};
pub use error::RuntimeError;
pub use event_handler::{
    DeliveredEvent, EventHandler, EventListener, LocalEventHandler, GLOBAL_SOURCE,
    PERIPHERAL_SOURCE, WILDCARD,
};
pub use instance::{InstanceHandle, InstanceId, Outcome, StateMachineInstance};
pub use runtime::Runtime;
pub use service::{
    FnService, OptimalSelector, RandomSelector, SelectionPolicy, ServiceImplementation,
    ServiceRegistry, ServiceSelector,
};
pub use timeout::TimeoutManager;
