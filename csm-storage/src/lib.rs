//! # csm-storage
//!
//! Durable storage for persistent state machine variables.
//!
//! This crate provides:
//! - A file-backed, checksummed variable store with atomic writes
//! - A [`Context`](csm_core::Context) implementation over that store

pub mod context;
pub mod error;
pub mod store;

pub use context::DurableContext;
pub use error::StorageError;
pub use store::{StoreConfig, VariableStore};
