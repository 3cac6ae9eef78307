use std::time::Duration;

use sqlx::{PgPool, Pool, Postgres};

use sift_core::error::StageError;
use sift_core::lock::LockStore;

/// PostgreSQL-backed lock store: a `stage_locks` table with per-key expiry.
///
/// Acquisition is a single conditional upsert, so the check-and-set is
/// atomic across workers. An expired row counts as free; a periodic
/// [`sweep_stale`](PgLockStore::sweep_stale) keeps the table small but is
/// not required for correctness.
#[derive(Clone)]
pub struct PgLockStore {
    pool: Pool<Postgres>,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete expired lock rows. Returns the number of rows removed.
    pub async fn sweep_stale(&self) -> Result<u64, StageError> {
        let result = sqlx::query(r#"DELETE FROM stage_locks WHERE expires_at <= NOW()"#)
            .execute(&self.pool)
            .await
            .map_err(|e| StageError::StoreError(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

impl LockStore for PgLockStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, StageError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO stage_locks (key, expires_at)
            VALUES ($1, NOW() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE
            SET expires_at = EXCLUDED.expires_at
            WHERE stage_locks.expires_at <= NOW()
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StageError::StoreError(e.to_string()))?;

        Ok(row.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), StageError> {
        // Idempotent: deleting a missing or expired row is a no-op.
        sqlx::query(r#"DELETE FROM stage_locks WHERE key = $1"#)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StageError::StoreError(e.to_string()))?;

        Ok(())
    }
}
