//! Workflow engine: definitions, step dispatch, execution ledger and the
//! background services that resume and spawn executions.

pub mod collaborator;
pub mod condition;
pub mod context;
pub mod definition;
pub mod executor;
pub mod ledger;
pub mod scheduler;
pub mod spawn;
pub mod step_runner;
