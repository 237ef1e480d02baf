//! Workflow engine and repository trait definitions for Funnelflow.
//!
//! This crate defines the "ports" (repository and collaborator traits) that
//! the infrastructure layer implements, plus the engine that drives workflow
//! executions through them. It depends only on `funnelflow-types` -- never on
//! `funnelflow-infra` or any database/IO crate.

pub mod memory;
pub mod repository;
pub mod workflow;
