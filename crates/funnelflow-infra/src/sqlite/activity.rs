//! SQLite activity log: append-only rows in `contact_activities`.

use std::future::Future;
use std::pin::Pin;

use funnelflow_core::repository::activity::ActivityLog;
use funnelflow_types::contact::{ActivityEntry, ActivityType};
use funnelflow_types::error::RepositoryError;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, parse_uuid, query_error, to_json};

pub struct SqliteActivityLog {
    pool: DatabasePool,
}

impl SqliteActivityLog {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn insert(&self, entry: &ActivityEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO contact_activities
               (id, contact_id, activity_type, description, metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.contact_id.to_string())
        .bind(entry.activity_type.as_str())
        .bind(&entry.description)
        .bind(to_json(&entry.metadata)?)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    /// Most recent activity for a contact, newest first.
    pub async fn list_for_contact(
        &self,
        contact_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<ActivityEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM contact_activities WHERE contact_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(contact_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let activity_type: String = row.try_get("activity_type").map_err(query_error)?;
            let metadata: String = row.try_get("metadata").map_err(query_error)?;
            let id: String = row.try_get("id").map_err(query_error)?;
            let contact_id: String = row.try_get("contact_id").map_err(query_error)?;
            let created_at: String = row.try_get("created_at").map_err(query_error)?;

            entries.push(ActivityEntry {
                id: parse_uuid(&id)?,
                contact_id: parse_uuid(&contact_id)?,
                activity_type: activity_type
                    .parse::<ActivityType>()
                    .map_err(RepositoryError::Query)?,
                description: row.try_get("description").map_err(query_error)?,
                metadata: parse_json(&metadata, "activity metadata")?,
                created_at: parse_datetime(&created_at)?,
            });
        }
        Ok(entries)
    }
}

impl ActivityLog for SqliteActivityLog {
    fn append<'a>(
        &'a self,
        entry: &'a ActivityEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        Box::pin(self.insert(entry))
    }
}

#[cfg(test)]
mod tests {
    use funnelflow_types::contact::Contact;
    use serde_json::json;

    use super::*;
    use crate::sqlite::contact::SqliteContactStore;
    use crate::sqlite::pool::test_pool;

    #[tokio::test]
    async fn test_append_and_list() {
        let pool = test_pool().await;
        let contacts = SqliteContactStore::new(pool.clone());
        let contact = Contact::new("ada@example.com");
        contacts.create_contact(&contact).await.unwrap();

        let log = SqliteActivityLog::new(pool);
        let first = ActivityEntry::new(
            contact.id,
            ActivityType::TagAdded,
            "Tag added: lead",
            json!({"tags": ["lead"]}),
        );
        let second = ActivityEntry::new(
            contact.id,
            ActivityType::EmailSent,
            "Email sent: Welcome",
            json!({"subject": "Welcome"}),
        );
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();

        let entries = log.list_for_contact(&contact.id, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].activity_type, ActivityType::EmailSent);
        assert_eq!(entries[1].metadata["tags"][0], "lead");
    }

    #[tokio::test]
    async fn test_append_for_unknown_contact_fails() {
        let log = SqliteActivityLog::new(test_pool().await);
        let entry = ActivityEntry::new(
            Uuid::now_v7(),
            ActivityType::TagRemoved,
            "Tag removed: lead",
            json!({}),
        );
        assert!(log.append(&entry).await.is_err());
    }
}
