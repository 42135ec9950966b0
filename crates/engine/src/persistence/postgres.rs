//! PostgreSQL implementation of JobStore
//!
//! Every primitive is exactly one SQL statement. Claim, renew, resolve and
//! reclaim are conditional `UPDATE`s whose `WHERE` clause re-checks the
//! ownership predicate, so the row itself is the compare-and-swap cell.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::job::{DispatchJob, JobResolution, JobStatus, NewDispatch};

const JOB_COLUMNS: &str = "id, recipient_email, document_name, status, retry_count, \
     lock_owner, locked_until, created_at, updated_at, last_error";

/// PostgreSQL implementation of JobStore
///
/// Uses a connection pool; each call checks out its own connection for a
/// single statement, so no transaction ever spans a work slice.
///
/// # Example
///
/// ```ignore
/// use docdispatch_engine::PostgresJobStore;
///
/// let store = PostgresJobStore::connect("postgres://localhost/dispatch", 10).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool to `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn update_returning(
        &self,
        sql: &str,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        let row = sqlx::query(sql)
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!(%id, "Failed to update job: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(job_from_row).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self))]
    async fn scan_claimable(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM dispatch_requests
            WHERE status = 'pending'
              AND (locked_until IS NULL OR locked_until < $1)
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to scan claimable jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn try_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_requests
            SET status = 'processing',
                lock_owner = $2,
                locked_until = $3,
                updated_at = $4
            WHERE id = $1
              AND status = 'pending'
              AND (locked_until IS NULL OR locked_until < $4)
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(lease_until(now, lease))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(%id, "Failed to claim job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn try_renew(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_requests
            SET locked_until = $3,
                updated_at = $4
            WHERE id = $1
              AND status = 'processing'
              AND lock_owner = $2
              AND locked_until IS NOT NULL
              AND locked_until >= $4
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(lease_until(now, lease))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(%id, "Failed to renew lease: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn read_owned(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM dispatch_requests
            WHERE id = $1
              AND status = 'processing'
              AND lock_owner = $2
              AND locked_until IS NOT NULL
              AND locked_until >= $3
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(worker_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!(%id, "Failed to read owned job: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, resolution), fields(status = %resolution.status))]
    async fn resolve(
        &self,
        id: Uuid,
        worker_id: &str,
        resolution: &JobResolution,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_requests
            SET status = $3,
                retry_count = $4,
                last_error = $5,
                lock_owner = NULL,
                locked_until = NULL,
                updated_at = $6
            WHERE id = $1
              AND status = 'processing'
              AND lock_owner = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(resolution.status.as_str())
        .bind(i32::try_from(resolution.retry_count).unwrap_or(i32::MAX))
        .bind(&resolution.last_error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(%id, "Failed to resolve job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(%id, rows = result.rows_affected(), "resolved job");
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE dispatch_requests
            SET status = 'pending',
                lock_owner = NULL,
                locked_until = NULL,
                updated_at = $1
            WHERE status = 'processing'
              AND (locked_until IS NULL OR locked_until < $1)
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reclaim expired leases: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let reclaimed: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();

        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed expired leases");
        }

        Ok(reclaimed)
    }

    #[instrument(skip(self, new))]
    async fn create(
        &self,
        new: NewDispatch,
        now: DateTime<Utc>,
    ) -> Result<DispatchJob, StoreError> {
        let job = DispatchJob::new(new, now);

        sqlx::query(
            r#"
            INSERT INTO dispatch_requests
                (id, recipient_email, document_name, status, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $4)
            "#,
        )
        .bind(job.id)
        .bind(&job.recipient_email)
        .bind(&job.document_name)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(id = %job.id, "created job");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<DispatchJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM dispatch_requests WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!(%id, "Failed to get job: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, page: Pagination) -> Result<Vec<DispatchJob>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM dispatch_requests
            ORDER BY created_at DESC, id DESC
            OFFSET $1
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(page.skip))
            .bind(i64::from(page.take))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list jobs: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn force_requeue(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        let sql = format!(
            r#"
            UPDATE dispatch_requests
            SET status = 'pending', lock_owner = NULL, locked_until = NULL, updated_at = $2
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.update_returning(&sql, id, now).await
    }

    #[instrument(skip(self))]
    async fn release_lock(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        let sql = format!(
            r#"
            UPDATE dispatch_requests
            SET lock_owner = NULL, locked_until = NULL, updated_at = $2
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.update_returning(&sql, id, now).await
    }

    #[instrument(skip(self))]
    async fn clear_error(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        let sql = format!(
            r#"
            UPDATE dispatch_requests
            SET last_error = NULL, updated_at = $2
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.update_returning(&sql, id, now).await
    }

    #[instrument(skip(self))]
    async fn reset_retries(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        let sql = format!(
            r#"
            UPDATE dispatch_requests
            SET retry_count = 0, updated_at = $2
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.update_returning(&sql, id, now).await
    }

    #[instrument(skip(self))]
    async fn snapshot(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<StatusSnapshot, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE locked_until > $1) AS locked,
                COUNT(*) FILTER (WHERE status = 'processing' AND updated_at < $2)
                    AS stale_processing
            FROM dispatch_requests
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to snapshot jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let count = |name: &str| -> u64 { row.get::<i64, _>(name).max(0) as u64 };

        Ok(StatusSnapshot {
            total: count("total"),
            pending: count("pending"),
            processing: count("processing"),
            completed: count("completed"),
            failed: count("failed"),
            locked: count("locked"),
            stale_processing: count("stale_processing"),
        })
    }

    #[instrument(skip(self))]
    async fn recent(
        &self,
        take: u32,
        include_completed: bool,
    ) -> Result<Vec<DispatchJob>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM dispatch_requests
            WHERE $1 OR status <> 'completed'
            ORDER BY updated_at DESC, created_at DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(include_completed)
            .bind(i64::from(take))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list recent jobs: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(job_from_row).collect()
    }
}

// Helper functions

fn job_from_row(row: &PgRow) -> Result<DispatchJob, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Decode(e.to_string());

    let status: String = row.try_get("status").map_err(decode)?;
    let status: JobStatus = status.parse().map_err(StoreError::Decode)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(decode)?;

    Ok(DispatchJob {
        id: row.try_get("id").map_err(decode)?,
        recipient_email: row.try_get("recipient_email").map_err(decode)?,
        document_name: row.try_get("document_name").map_err(decode)?,
        status,
        retry_count: retry_count.max(0) as u32,
        lock_owner: row.try_get("lock_owner").map_err(decode)?,
        lease_expiry: row.try_get("locked_until").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        last_error: row.try_get("last_error").map_err(decode)?,
    })
}
