//! Repository for queued deliveries.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers never pick
//! the same row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Delivery, DeliveryId, DeliveryStatus},
};

const DELIVERY_COLUMNS: &str = "id, subscription_id, webhook_id, event, payload, attempts, \
                                max_attempts, status, next_retry_time, last_error, created_at, \
                                updated_at";

/// Repository for delivery rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or the ID already exists.
    pub async fn insert(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deliveries (
                id, subscription_id, webhook_id, event, payload, attempts, max_attempts,
                status, next_retry_time, last_error, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.subscription_id)
        .bind(delivery.webhook_id)
        .bind(&delivery.event)
        .bind(&delivery.payload)
        .bind(to_i32(delivery.attempts))
        .bind(to_i32(delivery.max_attempts))
        .bind(delivery.status.as_str())
        .bind(delivery.next_retry_time)
        .bind(&delivery.last_error)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Atomically claims the oldest due delivery and marks it `processing`.
    ///
    /// Rows left in `processing` since `lease_expired_before` or earlier are
    /// claimable again, so a worker that died mid-delivery does not strand
    /// its row.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let mut tx = self.pool.begin().await?;

        let id: Option<DeliveryId> = sqlx::query_scalar(
            r#"
            SELECT id FROM deliveries
            WHERE (status = 'pending' AND (next_retry_time IS NULL OR next_retry_time <= $1))
               OR (status = 'processing' AND updated_at <= $2)
            ORDER BY COALESCE(next_retry_time, created_at) ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(lease_expired_before)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            "UPDATE deliveries SET status = 'processing', updated_at = $2 WHERE id = $1 \
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(delivery))
    }

    /// Gives up a claim, returning a `processing` row to `pending` with its
    /// attempts and retry time unchanged.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release(&self, id: DeliveryId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE deliveries SET status = 'pending', updated_at = $2 \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a delivery completed with its final attempt count.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_completed(
        &self,
        id: DeliveryId,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(id, DeliveryStatus::Completed, attempts, None, None, now).await
    }

    /// Returns a delivery to `pending` with a new retry time.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        id: DeliveryId,
        attempts: u32,
        next_retry_time: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(
            id,
            DeliveryStatus::Pending,
            attempts,
            Some(next_retry_time),
            Some(last_error),
            now,
        )
        .await
    }

    /// Returns a delivery to `pending` without touching its attempt count.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn defer(
        &self,
        id: DeliveryId,
        next_retry_time: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'pending', next_retry_time = $2, last_error = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_retry_time)
        .bind(reason)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a delivery terminally failed.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(
        &self,
        id: DeliveryId,
        attempts: u32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(id, DeliveryStatus::Failed, attempts, None, Some(last_error), now).await
    }

    async fn transition(
        &self,
        id: DeliveryId,
        status: DeliveryStatus,
        attempts: u32,
        next_retry_time: Option<DateTime<Utc>>,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = $2,
                attempts = $3,
                next_retry_time = $4,
                last_error = COALESCE($5, last_error),
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(to_i32(attempts))
        .bind(next_retry_time)
        .bind(last_error)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Counts deliveries waiting in `pending`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_pending(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM deliveries WHERE status = 'pending'")
                .fetch_one(&*self.pool)
                .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Finds a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Deletes completed deliveries last updated before `before`.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn purge_completed(&self, before: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM deliveries WHERE status = 'completed' AND updated_at < $1")
                .bind(before)
                .execute(&*self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
