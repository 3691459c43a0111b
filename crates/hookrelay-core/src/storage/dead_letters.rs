//! Repository for dead-letter records.
//!
//! Each row keeps a JSONB snapshot of the delivery so it can be replayed
//! after the original row is purged.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};

use crate::{
    error::Result,
    models::{DeadLetterEntry, DeadLetterId, DeadLetterStats},
};

/// Repository for dead-letter rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a dead-letter record.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert(&self, entry: &DeadLetterEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, delivery_id, delivery, reason, last_error, moved_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.delivery_id)
        .bind(Json(&entry.delivery))
        .bind(&entry.reason)
        .bind(&entry.last_error)
        .bind(entry.moved_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a record by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT id, delivery_id, delivery, reason, last_error, moved_at
            FROM dead_letters
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Lists the most recently moved records.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let entries = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT id, delivery_id, delivery, reason, last_error, moved_at
            FROM dead_letters
            ORDER BY moved_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }

    /// Deletes a record, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, id: DeadLetterId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Aggregates counts per reason and the oldest timestamp.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn stats(&self) -> Result<DeadLetterStats> {
        let rows: Vec<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT reason, COUNT(*), MIN(moved_at)
            FROM dead_letters
            GROUP BY reason
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        let mut stats = DeadLetterStats::default();
        for (reason, count, oldest) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            stats.total += count;
            stats.by_reason.insert(reason, count);
            stats.oldest_moved_at = Some(match stats.oldest_moved_at {
                Some(current) if current <= oldest => current,
                _ => oldest,
            });
        }

        Ok(stats)
    }
}
