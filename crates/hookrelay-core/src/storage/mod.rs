//! PostgreSQL repositories for deliveries, webhook configurations and
//! dead-letter records.
//!
//! The delivery engine reaches these through its own storage traits; the
//! repositories only translate between domain models and rows.

use std::sync::Arc;

use sqlx::PgPool;

pub mod dead_letters;
pub mod deliveries;
pub mod webhook_configs;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for queued deliveries.
    pub deliveries: Arc<deliveries::Repository>,

    /// Repository for webhook target configuration.
    pub webhook_configs: Arc<webhook_configs::Repository>,

    /// Repository for dead-letter records.
    pub dead_letters: Arc<dead_letters::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            webhook_configs: Arc::new(webhook_configs::Repository::new(pool.clone())),
            dead_letters: Arc::new(dead_letters::Repository::new(pool)),
        }
    }

    /// Executes a trivial query to verify connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.deliveries.pool()).await?;

        Ok(())
    }
}
