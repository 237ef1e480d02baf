//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (funnelflow-infra) implements. The core crate never depends on any
//! specific storage technology.
//!
//! `WorkflowRepository` is used generically by the engine and so uses native
//! async fn in traits. The contact store and activity log are shared as
//! `Arc<dyn ..>` collaborators and therefore return boxed futures.

pub mod activity;
pub mod contact;
pub mod workflow;
