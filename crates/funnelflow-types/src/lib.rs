//! Shared domain types for the Funnelflow workflow engine.
//!
//! Workflow definitions, executions, contacts, activity entries, engine
//! configuration and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod contact;
pub mod error;
pub mod workflow;
