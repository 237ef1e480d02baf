//! Email dispatcher that queues rendered messages in the `email_outbox` table.
//!
//! Delivery is out of scope; an external mailer drains rows with
//! `status = 'queued'`.

use std::future::Future;
use std::pin::Pin;

use chrono::Utc;
use funnelflow_core::workflow::collaborator::{EmailDispatcher, EmailError, EmailMessage};
use uuid::Uuid;

use super::format_datetime;
use super::pool::DatabasePool;

pub struct SqliteEmailOutbox {
    pool: DatabasePool,
}

impl SqliteEmailOutbox {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn enqueue(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"INSERT INTO email_outbox (id, contact_id, recipient, subject, content, status, created_at)
               VALUES (?, ?, ?, ?, ?, 'queued', ?)"#,
        )
        .bind(id.to_string())
        .bind(message.contact_id.to_string())
        .bind(&message.to)
        .bind(&message.subject)
        .bind(&message.content)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| EmailError(format!("failed to queue email: {e}")))?;

        tracing::debug!(outbox_id = %id, contact_id = %message.contact_id, "email queued");
        Ok(())
    }
}

impl EmailDispatcher for SqliteEmailOutbox {
    fn send<'a>(
        &'a self,
        message: &'a EmailMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EmailError>> + Send + 'a>> {
        Box::pin(self.enqueue(message))
    }
}
