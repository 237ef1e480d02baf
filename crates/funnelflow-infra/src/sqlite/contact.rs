//! SQLite contact store.
//!
//! Tags and custom fields are JSON columns. Every write bumps `version`;
//! `set_tags` is a single `UPDATE .. WHERE version = ?` so concurrent tag
//! mutations from different executions serialize.

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use funnelflow_core::repository::contact::ContactStore;
use funnelflow_types::contact::{Contact, ContactFieldUpdate};
use funnelflow_types::error::RepositoryError;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, query_error, to_json};

pub struct SqliteContactStore {
    pool: DatabasePool,
}

struct ContactRow {
    id: String,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    phone: Option<String>,
    company: Option<String>,
    job_title: Option<String>,
    source: Option<String>,
    tags: String,
    custom_fields: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl ContactRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            phone: row.try_get("phone")?,
            company: row.try_get("company")?,
            job_title: row.try_get("job_title")?,
            source: row.try_get("source")?,
            tags: row.try_get("tags")?,
            custom_fields: row.try_get("custom_fields")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_contact(self) -> Result<Contact, RepositoryError> {
        Ok(Contact {
            id: parse_uuid(&self.id)?,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            phone: self.phone,
            company: self.company,
            job_title: self.job_title,
            source: self.source,
            tags: parse_json(&self.tags, "contact tags")?,
            custom_fields: parse_json(&self.custom_fields, "contact custom fields")?,
            version: self.version,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

async fn fetch_contact(
    conn: &mut SqliteConnection,
    id: &Uuid,
) -> Result<Option<Contact>, RepositoryError> {
    let row = sqlx::query("SELECT * FROM contacts WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(conn)
        .await
        .map_err(query_error)?;

    row.map(|row| ContactRow::from_row(&row).map_err(query_error)?.into_contact())
        .transpose()
}

impl SqliteContactStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Insert a new contact. A duplicate email is a `Conflict`.
    pub async fn create_contact(&self, contact: &Contact) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO contacts
               (id, email, first_name, last_name, phone, company, job_title, source,
                tags, custom_fields, version, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(contact.id.to_string())
        .bind(&contact.email)
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.phone)
        .bind(&contact.company)
        .bind(&contact.job_title)
        .bind(&contact.source)
        .bind(to_json(&contact.tags)?)
        .bind(to_json(&contact.custom_fields)?)
        .bind(contact.version)
        .bind(format_datetime(&contact.created_at))
        .bind(format_datetime(&contact.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("contact {} already exists", contact.email))
            }
            other => query_error(other),
        })?;

        tracing::debug!(contact_id = %contact.id, "contact created");
        Ok(())
    }

    pub async fn find(&self, id: &Uuid) -> Result<Option<Contact>, RepositoryError> {
        let mut conn = self.pool.reader.acquire().await.map_err(query_error)?;
        fetch_contact(&mut conn, id).await
    }

    /// Look a contact up by its (unique) email address.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<Contact>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM contacts WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|row| ContactRow::from_row(&row).map_err(query_error)?.into_contact())
            .transpose()
    }

    /// Most recently created contacts first.
    pub async fn list(&self, limit: u32) -> Result<Vec<Contact>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM contacts ORDER BY created_at DESC, id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| ContactRow::from_row(row).map_err(query_error)?.into_contact())
            .collect()
    }

    async fn write_tags(
        &self,
        id: &Uuid,
        tags: &[String],
        expected_version: i64,
    ) -> Result<Contact, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let result = sqlx::query(
            "UPDATE contacts SET tags = ?, version = version + 1, updated_at = ? WHERE id = ? AND version = ?",
        )
        .bind(to_json(&tags)?)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let current = fetch_contact(&mut tx, id).await?;
        let Some(current) = current else {
            return Err(RepositoryError::NotFound);
        };
        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "contact {id} is at version {}, expected {expected_version}",
                current.version
            )));
        }

        tx.commit().await.map_err(query_error)?;
        Ok(current)
    }

    async fn write_fields(
        &self,
        id: &Uuid,
        fields: &ContactFieldUpdate,
        custom_fields: Option<&Map<String, Value>>,
    ) -> Result<Contact, RepositoryError> {
        // The writer pool has a single connection, so this transaction also
        // excludes concurrent tag writes between the read and the update.
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let mut contact = fetch_contact(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if !contact.apply_update(fields, custom_fields) {
            return Ok(contact);
        }
        contact.version += 1;
        contact.updated_at = Utc::now();

        sqlx::query(
            r#"UPDATE contacts SET
                 first_name = ?, last_name = ?, phone = ?, company = ?, job_title = ?,
                 source = ?, custom_fields = ?, version = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.phone)
        .bind(&contact.company)
        .bind(&contact.job_title)
        .bind(&contact.source)
        .bind(to_json(&contact.custom_fields)?)
        .bind(contact.version)
        .bind(format_datetime(&contact.updated_at))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(contact)
    }
}

impl ContactStore for SqliteContactStore {
    fn get_contact<'a>(
        &'a self,
        id: &'a Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Contact>, RepositoryError>> + Send + 'a>> {
        Box::pin(self.find(id))
    }

    fn set_tags<'a>(
        &'a self,
        id: &'a Uuid,
        tags: &'a [String],
        expected_version: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Contact, RepositoryError>> + Send + 'a>> {
        Box::pin(self.write_tags(id, tags, expected_version))
    }

    fn update_fields<'a>(
        &'a self,
        id: &'a Uuid,
        fields: &'a ContactFieldUpdate,
        custom_fields: Option<&'a Map<String, Value>>,
    ) -> Pin<Box<dyn Future<Output = Result<Contact, RepositoryError>> + Send + 'a>> {
        Box::pin(self.write_fields(id, fields, custom_fields))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::sqlite::pool::test_pool;

    async fn store_with_contact() -> (SqliteContactStore, Contact) {
        let store = SqliteContactStore::new(test_pool().await);
        let mut contact = Contact::new("ada@example.com");
        contact.first_name = Some("Ada".to_string());
        contact.tags = vec!["lead".to_string()];
        store.create_contact(&contact).await.unwrap();
        (store, contact)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (store, contact) = store_with_contact().await;
        let loaded = store.get_contact(&contact.id).await.unwrap().unwrap();
        assert_eq!(loaded.email, "ada@example.com");
        assert_eq!(loaded.tags, vec!["lead"]);
        assert_eq!(loaded.version, 0);

        let dup = Contact::new("ada@example.com");
        assert!(store.create_contact(&dup).await.unwrap_err().is_conflict());
        assert!(store.get_contact(&Uuid::now_v7()).await.unwrap().is_none());

        let by_email = store.find_by_email("ada@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, contact.id);
        assert!(store.find_by_email("bob@example.com").await.unwrap().is_none());

        let listed = store.list(10).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_set_tags_is_version_checked() {
        let (store, contact) = store_with_contact().await;
        let tags = vec!["lead".to_string(), "vip".to_string()];

        let updated = store.set_tags(&contact.id, &tags, 0).await.unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.tags, tags);

        let err = store
            .set_tags(&contact.id, &["stale".to_string()], 0)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let stored = store.get_contact(&contact.id).await.unwrap().unwrap();
        assert_eq!(stored.tags, tags);

        let err = store.set_tags(&Uuid::now_v7(), &tags, 0).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_update_fields_merges_custom_fields() {
        let (store, contact) = store_with_contact().await;
        let fields = ContactFieldUpdate {
            company: Some("Analytical Engines".to_string()),
            ..Default::default()
        };
        let mut custom = Map::new();
        custom.insert("plan".to_string(), json!("pro"));

        let updated = store
            .update_fields(&contact.id, &fields, Some(&custom))
            .await
            .unwrap();
        assert_eq!(updated.company.as_deref(), Some("Analytical Engines"));
        assert_eq!(updated.first_name.as_deref(), Some("Ada"));
        assert_eq!(updated.custom_fields["plan"], "pro");
        assert_eq!(updated.version, 1);

        // Same values again: no version bump.
        let again = store
            .update_fields(&contact.id, &fields, Some(&custom))
            .await
            .unwrap();
        assert_eq!(again.version, 1);
    }

    /// Read-modify-write with retry on a stale version. Unchanged tag sets
    /// are not written.
    async fn edit_tags(
        store: &SqliteContactStore,
        id: &Uuid,
        edit: impl Fn(&mut Vec<String>) + Send + Sync,
    ) {
        loop {
            let current = store.find(id).await.unwrap().unwrap();
            let mut tags = current.tags.clone();
            edit(&mut tags);
            if tags == current.tags {
                return;
            }
            match store.set_tags(id, &tags, current.version).await {
                Ok(_) => return,
                Err(e) if e.is_conflict() => tokio::task::yield_now().await,
                Err(e) => panic!("tag write failed: {e}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_and_remove_serialize() {
        let store = Arc::new(SqliteContactStore::new(test_pool().await));

        for i in 0..20 {
            let mut contact = Contact::new(format!("racer{i}@example.com"));
            contact.tags = vec!["x".to_string()];
            store.create_contact(&contact).await.unwrap();
            let id = contact.id;

            let adder = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    edit_tags(&store, &id, |tags| {
                        if !tags.iter().any(|t| t == "a") {
                            tags.push("a".to_string());
                        }
                    })
                    .await
                })
            };
            let remover = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    edit_tags(&store, &id, |tags| tags.retain(|t| t != "a")).await
                })
            };
            adder.await.unwrap();
            remover.await.unwrap();

            let stored = store.find(&id).await.unwrap().unwrap();
            // Add then remove is two writes; remove (a no-op) then add is one.
            match stored.tags.as_slice() {
                [x] if x == "x" => assert_eq!(stored.version, 2),
                [x, a] if x == "x" && a == "a" => assert_eq!(stored.version, 1),
                other => panic!("unexpected tag set {other:?}"),
            }
        }
    }
}
