//! Workflow collaborators that talk to the outside world.

pub mod webhook_client;
