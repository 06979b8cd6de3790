//! PostgreSQL request store

use super::store::{reference_in_use, RequestStats, RequestStore};
use crate::config::DatabaseConfig;
use crate::coordination::{EscrowEntry, RequestId, RequestStatus};
use crate::error::{EscrowError, EscrowResult};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

/// Request store backed by PostgreSQL
pub struct PgRequestStore {
    pool: PgPool,
}

impl PgRequestStore {
    /// Create a new store and connect its pool
    pub async fn new(config: &DatabaseConfig) -> EscrowResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> EscrowResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS loan_requests (
                request_id TEXT PRIMARY KEY,
                status VARCHAR(20) NOT NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_loan_requests_status
            ON loan_requests (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Canonical foreign tx of a live claim; NULL once the claim fails
        sqlx::query("ALTER TABLE loan_requests ADD COLUMN IF NOT EXISTS claim_reference TEXT")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_loan_requests_claim_reference
            ON loan_requests (claim_reference)
            WHERE claim_reference IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_loan_requests_pending_release
            ON loan_requests (created_at)
            WHERE status = 'COMPLETED' AND jsonb_typeof(record->'escrow') = 'object'
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    fn decode(row: sqlx::postgres::PgRow) -> EscrowResult<EscrowEntry> {
        let record: serde_json::Value = row.try_get("record")?;
        let entry: EscrowEntry = serde_json::from_value(record)?;
        let status: String = row.try_get("status")?;

        // The status column drives CAS; the JSON copy must agree with it
        if status.parse::<RequestStatus>()? != entry.status() {
            return Err(EscrowError::Storage(format!(
                "request {} has status column {} but record says {}",
                entry.request_id(),
                status,
                entry.status()
            )));
        }
        Ok(entry)
    }

    /// A unique violation on write can only come from the claim reference index
    fn write_error(entry: &EscrowEntry, e: sqlx::Error) -> EscrowError {
        let unique_violation =
            matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
        match entry.reserved_reference() {
            Some(reference) if unique_violation => reference_in_use(&reference),
            _ => e.into(),
        }
    }
}

#[async_trait]
impl RequestStore for PgRequestStore {
    async fn put(&self, entry: &EscrowEntry) -> EscrowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO loan_requests (request_id, status, record, created_at, claim_reference)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (request_id)
            DO UPDATE SET status = $2, record = $3, claim_reference = $5, updated_at = NOW()
            "#,
        )
        .bind(entry.request_id().to_string())
        .bind(entry.status().as_str())
        .bind(Json(entry))
        .bind(entry.request.created_at())
        .bind(entry.reserved_reference())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::write_error(entry, e))?;

        debug!("Stored request {} as {}", entry.request_id(), entry.status());
        Ok(())
    }

    async fn compare_and_put(
        &self,
        entry: &EscrowEntry,
        expected: RequestStatus,
    ) -> EscrowResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE loan_requests
            SET status = $2, record = $3, claim_reference = $5, updated_at = NOW()
            WHERE request_id = $1 AND status = $4
            "#,
        )
        .bind(entry.request_id().to_string())
        .bind(entry.status().as_str())
        .bind(Json(entry))
        .bind(expected.as_str())
        .bind(entry.reserved_reference())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::write_error(entry, e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, request_id: &RequestId) -> EscrowResult<Option<EscrowEntry>> {
        let row = sqlx::query("SELECT status, record FROM loan_requests WHERE request_id = $1")
            .bind(request_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::decode).transpose()
    }

    async fn scan_by_status(&self, status: RequestStatus) -> EscrowResult<Vec<EscrowEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT status, record FROM loan_requests
            WHERE status = $1
            ORDER BY created_at
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::decode).collect()
    }

    async fn find_by_reference(&self, reference: &str) -> EscrowResult<Option<RequestId>> {
        let row = sqlx::query("SELECT request_id FROM loan_requests WHERE claim_reference = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("request_id")?.parse()?)),
            None => Ok(None),
        }
    }

    async fn scan_pending_releases(&self) -> EscrowResult<Vec<EscrowEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT status, record FROM loan_requests
            WHERE status = 'COMPLETED' AND jsonb_typeof(record->'escrow') = 'object'
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::decode).collect()
    }

    async fn stats(&self) -> EscrowResult<RequestStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING') as pending,
                COUNT(*) FILTER (WHERE status = 'CLAIMED') as claimed,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') as completed,
                COUNT(*) FILTER (WHERE status = 'FAILED') as failed
            FROM loan_requests
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(RequestStats {
            pending: row.get::<i64, _>("pending") as u64,
            claimed: row.get::<i64, _>("claimed") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }

    async fn health_check(&self) -> EscrowResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
