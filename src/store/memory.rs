//! In-memory job store.
//!
//! 単一プロセス実行とテスト用のジョブストア実装。
//! Mutexで直列化されるため、`update`はそのままアトミックになる。
//! TTLはアクセス時に延長されるスライディング方式。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::models::Job;

use super::{JobStore, StoreError, job_key};

struct Entry {
    job: Job,
    expires_at: Instant,
}

pub struct MemoryJobStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryJobStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn sweep(entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("memory store lock");
        Self::sweep(&mut entries);
        entries.insert(
            job_key(&job.job_id),
            Entry {
                job: job.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let mut entries = self.entries.lock().expect("memory store lock");
        Self::sweep(&mut entries);
        Ok(entries.get_mut(&job_key(job_id)).map(|entry| {
            // スライディングTTL: 読み取りでも延長する
            entry.expires_at = Instant::now() + self.ttl;
            entry.job.clone()
        }))
    }

    async fn update(
        &self,
        job_id: &str,
        mutate: &(dyn for<'a> Fn(&'a mut Job) + Send + Sync),
    ) -> Result<Job, StoreError> {
        let mut entries = self.entries.lock().expect("memory store lock");
        Self::sweep(&mut entries);
        let entry = entries
            .get_mut(&job_key(job_id))
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        mutate(&mut entry.job);
        entry.expires_at = Instant::now() + self.ttl;
        Ok(entry.job.clone())
    }
}
