//! Durable job store: `Job` documents keyed by job id with atomic
//! read-modify-write and a 24h sliding TTL.
//!
//! Two implementations share one trait: Postgres (JSONB payload with revision
//! CAS) for deployments, and an in-memory table for standalone runs and tests.

pub(crate) mod memory;
pub(crate) mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Job;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job payload serialization failed")]
    Serialization(#[from] serde_json::Error),
    #[error("store backend error")]
    Backend(#[source] anyhow::Error),
}

/// Key/value store of job documents.
///
/// `update` applies the mutation atomically with respect to other writers of
/// the same key: concurrent analyzer tasks mutating sibling records must not
/// lose each other's writes, and token totals stay additively consistent
/// because record writes and total updates happen inside one mutation.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job document. Overwrites are not expected; last write
    /// wins on collision.
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    /// Consistent snapshot of a job, or `None` when unknown or expired.
    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Atomic read-modify-write. The mutation may be re-applied on CAS
    /// conflicts, so it must be a pure function of the job document.
    async fn update(
        &self,
        job_id: &str,
        mutate: &(dyn for<'a> Fn(&'a mut Job) + Send + Sync),
    ) -> Result<Job, StoreError>;
}

/// Store key for a job document.
#[must_use]
pub(crate) fn job_key(job_id: &str) -> String {
    format!("job:{job_id}")
}
