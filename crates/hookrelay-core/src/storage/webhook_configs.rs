//! Repository for webhook target configuration rows.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{WebhookConfigRecord, WebhookId},
};

/// Repository for webhook configuration rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds the raw configuration row for one webhook.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, id: WebhookId) -> Result<Option<WebhookConfigRecord>> {
        let record = sqlx::query_as::<_, WebhookConfigRecord>(
            r#"
            SELECT id, url, format, headers, timeout_ms, retry_attempts
            FROM webhook_configs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Loads every configuration row.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_all(&self) -> Result<Vec<WebhookConfigRecord>> {
        let records = sqlx::query_as::<_, WebhookConfigRecord>(
            r#"
            SELECT id, url, format, headers, timeout_ms, retry_attempts
            FROM webhook_configs
            ORDER BY id
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Inserts or replaces a configuration row.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(&self, record: &WebhookConfigRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_configs (id, url, format, headers, timeout_ms, retry_attempts)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET url = EXCLUDED.url,
                format = EXCLUDED.format,
                headers = EXCLUDED.headers,
                timeout_ms = EXCLUDED.timeout_ms,
                retry_attempts = EXCLUDED.retry_attempts
            "#,
        )
        .bind(record.id)
        .bind(&record.url)
        .bind(&record.format)
        .bind(&record.headers)
        .bind(record.timeout_ms)
        .bind(record.retry_attempts)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
