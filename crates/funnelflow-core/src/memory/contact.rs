use std::future::{Future, ready};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use funnelflow_types::contact::{Contact, ContactFieldUpdate};
use funnelflow_types::error::RepositoryError;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::repository::contact::ContactStore;

/// `ContactStore` backed by a `DashMap`.
///
/// `set_tags` checks and bumps the version while holding the entry's shard
/// lock, so two concurrent writers against the same version cannot both win.
#[derive(Debug, Default)]
pub struct InMemoryContactStore {
    contacts: DashMap<Uuid, Contact>,
    tag_writes: AtomicUsize,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a contact and return the stored copy.
    pub fn insert(&self, contact: Contact) -> Contact {
        self.contacts.insert(contact.id, contact.clone());
        contact
    }

    /// Current stored state of a contact.
    pub fn snapshot(&self, id: &Uuid) -> Option<Contact> {
        self.contacts.get(id).map(|c| c.clone())
    }

    /// Number of successful `set_tags` writes so far.
    pub fn tag_writes(&self) -> usize {
        self.tag_writes.load(Ordering::SeqCst)
    }

    fn set_tags_now(
        &self,
        id: &Uuid,
        tags: &[String],
        expected_version: i64,
    ) -> Result<Contact, RepositoryError> {
        let mut entry = self.contacts.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if entry.version != expected_version {
            return Err(RepositoryError::Conflict(format!(
                "contact {id} is at version {}, expected {expected_version}",
                entry.version
            )));
        }
        entry.tags = tags.to_vec();
        entry.version += 1;
        entry.updated_at = Utc::now();
        self.tag_writes.fetch_add(1, Ordering::SeqCst);
        Ok(entry.clone())
    }

    fn update_fields_now(
        &self,
        id: &Uuid,
        fields: &ContactFieldUpdate,
        custom_fields: Option<&Map<String, Value>>,
    ) -> Result<Contact, RepositoryError> {
        let mut entry = self.contacts.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if entry.apply_update(fields, custom_fields) {
            entry.version += 1;
            entry.updated_at = Utc::now();
        }
        Ok(entry.clone())
    }
}

impl ContactStore for InMemoryContactStore {
    fn get_contact<'a>(
        &'a self,
        id: &'a Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Contact>, RepositoryError>> + Send + 'a>> {
        Box::pin(ready(Ok(self.snapshot(id))))
    }

    fn set_tags<'a>(
        &'a self,
        id: &'a Uuid,
        tags: &'a [String],
        expected_version: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Contact, RepositoryError>> + Send + 'a>> {
        Box::pin(ready(self.set_tags_now(id, tags, expected_version)))
    }

    fn update_fields<'a>(
        &'a self,
        id: &'a Uuid,
        fields: &'a ContactFieldUpdate,
        custom_fields: Option<&'a Map<String, Value>>,
    ) -> Pin<Box<dyn Future<Output = Result<Contact, RepositoryError>> + Send + 'a>> {
        Box::pin(ready(self.update_fields_now(id, fields, custom_fields)))
    }
}
