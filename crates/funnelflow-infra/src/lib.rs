//! Infrastructure layer for Funnelflow.
//!
//! Implements the repository and collaborator ports defined in
//! `funnelflow-core`: SQLite storage for definitions, executions, contacts,
//! activity and the email outbox; a reqwest webhook client with HMAC
//! signing; and the `config.toml` loader.

pub mod config;
pub mod sqlite;
pub mod workflow;
