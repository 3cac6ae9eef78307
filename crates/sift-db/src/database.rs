use sift_core::StageError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::lock_repository::PgLockStore;
use crate::page_repository::PgPageStore;

/// Central database facade — owns the connection pool, runs migrations,
/// and vends store instances.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| StageError::StoreError(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), StageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StageError::StoreError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get a [`PgPageStore`] backed by this pool.
    pub fn page_store(&self) -> PgPageStore {
        PgPageStore::new(self.pool.clone())
    }

    /// Get a [`PgLockStore`] backed by this pool.
    pub fn lock_store(&self) -> PgLockStore {
        PgLockStore::new(self.pool.clone())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
