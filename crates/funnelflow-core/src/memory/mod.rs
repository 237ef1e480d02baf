//! In-memory implementations of the repository and collaborator ports.
//!
//! Used by the engine's tests and by embedders that do not need durable
//! storage. Each store honors the same atomicity contracts as the SQLite
//! implementations in funnelflow-infra: conditional execution writes and
//! version-checked tag writes are applied under a single map-entry lock.

mod activity;
mod contact;
mod email;
mod workflow;

pub use activity::InMemoryActivityLog;
pub use contact::InMemoryContactStore;
pub use email::RecordingEmailDispatcher;
pub use workflow::InMemoryWorkflowRepository;
