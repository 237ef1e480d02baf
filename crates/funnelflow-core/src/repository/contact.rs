//! Contact store port.
//!
//! The contact store owns contact records. The engine reads contacts,
//! replaces tag sets under an optimistic version check, and applies
//! allow-listed field updates. Implementations must make `set_tags` a single
//! conditional write so that concurrent tag mutations serialize.

use std::future::Future;
use std::pin::Pin;

use funnelflow_types::contact::{Contact, ContactFieldUpdate};
use funnelflow_types::error::RepositoryError;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Object-safe contact store, shared by the dispatcher as `Arc<dyn ContactStore>`.
pub trait ContactStore: Send + Sync {
    /// Fetch a contact by ID. `Ok(None)` if it does not exist.
    fn get_contact<'a>(
        &'a self,
        id: &'a Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Contact>, RepositoryError>> + Send + 'a>>;

    /// Replace the contact's tag set if its stored version still equals
    /// `expected_version`, bumping the version.
    ///
    /// Returns the updated contact, `RepositoryError::Conflict` when the
    /// version moved, or `RepositoryError::NotFound`.
    fn set_tags<'a>(
        &'a self,
        id: &'a Uuid,
        tags: &'a [String],
        expected_version: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Contact, RepositoryError>> + Send + 'a>>;

    /// Overwrite the given top-level fields and merge `custom_fields` into the
    /// existing map, bumping the version. Returns the updated contact.
    fn update_fields<'a>(
        &'a self,
        id: &'a Uuid,
        fields: &'a ContactFieldUpdate,
        custom_fields: Option<&'a Map<String, Value>>,
    ) -> Pin<Box<dyn Future<Output = Result<Contact, RepositoryError>> + Send + 'a>>;
}
