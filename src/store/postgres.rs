//! Postgres-backed job store.
//!
//! Job documents live in a single table as JSONB with a revision counter.
//! `update` is compare-and-swap on the revision: the mutation is re-applied
//! on conflict, so concurrent writers of sibling analyzer records serialize
//! cleanly. TTL is a sliding `expires_at` refreshed on every touch.

use std::time::Duration;

use anyhow::Error as AnyError;
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::models::Job;

use super::{JobStore, StoreError, job_key};

pub struct PgJobStore {
    pool: PgPool,
    ttl_secs: f64,
}

impl PgJobStore {
    #[must_use]
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl_secs: ttl.as_secs_f64(),
        }
    }

    /// Create the backing table when it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS minutes_jobs (
                key TEXT PRIMARY KEY,
                payload JSONB NOT NULL,
                revision BIGINT NOT NULL DEFAULT 0,
                expires_at TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(AnyError::new(e)))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let payload = serde_json::to_value(job)?;
        sqlx::query(
            r"
            INSERT INTO minutes_jobs (key, payload, revision, expires_at)
            VALUES ($1, $2, 0, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET payload = EXCLUDED.payload,
                revision = 0,
                expires_at = EXCLUDED.expires_at
            ",
        )
        .bind(job_key(&job.job_id))
        .bind(payload)
        .bind(self.ttl_secs)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(AnyError::new(e)))?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        // Touching the row extends the sliding TTL.
        let row = sqlx::query(
            r"
            UPDATE minutes_jobs
            SET expires_at = NOW() + make_interval(secs => $2)
            WHERE key = $1 AND expires_at > NOW()
            RETURNING payload
            ",
        )
        .bind(job_key(job_id))
        .bind(self.ttl_secs)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(AnyError::new(e)))?;

        match row {
            Some(row) => {
                let payload: serde_json::Value = row
                    .try_get("payload")
                    .map_err(|e| StoreError::Backend(AnyError::new(e)))?;
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        job_id: &str,
        mutate: &(dyn for<'a> Fn(&'a mut Job) + Send + Sync),
    ) -> Result<Job, StoreError> {
        let key = job_key(job_id);
        loop {
            let row = sqlx::query(
                r"
                SELECT payload, revision
                FROM minutes_jobs
                WHERE key = $1 AND expires_at > NOW()
                ",
            )
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(AnyError::new(e)))?;

            let Some(row) = row else {
                return Err(StoreError::NotFound(job_id.to_string()));
            };
            let payload: serde_json::Value = row
                .try_get("payload")
                .map_err(|e| StoreError::Backend(AnyError::new(e)))?;
            let revision: i64 = row
                .try_get("revision")
                .map_err(|e| StoreError::Backend(AnyError::new(e)))?;

            let mut job: Job = serde_json::from_value(payload)?;
            mutate(&mut job);
            let updated = serde_json::to_value(&job)?;

            let result = sqlx::query(
                r"
                UPDATE minutes_jobs
                SET payload = $2,
                    revision = revision + 1,
                    expires_at = NOW() + make_interval(secs => $4)
                WHERE key = $1 AND revision = $3
                ",
            )
            .bind(&key)
            .bind(updated)
            .bind(revision)
            .bind(self.ttl_secs)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(AnyError::new(e)))?;

            if result.rows_affected() == 1 {
                return Ok(job);
            }
            // Revision moved under us; re-read and re-apply.
        }
    }
}
