//! Durable storage for job records and history, plus the distributed
//! per-image lock used to serialize concurrent builds across replicas.

mod error;
pub mod consul;

pub use error::{Result, StoreError};

use async_trait::async_trait;
use buildpilot_core::{HistoryRecord, JobId, JobRecord};
use chrono::Duration;

/// Abstraction over the KV/locking backend. Only `consul` backs it in
/// production; engine and API tests substitute an in-memory fake.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put_job(&self, record: &JobRecord) -> Result<()>;
    async fn get_job(&self, id: JobId) -> Result<JobRecord>;
    async fn update_job(&self, record: &JobRecord) -> Result<()>;
    async fn delete_job(&self, id: JobId) -> Result<()>;
    async fn list_jobs(&self) -> Result<Vec<JobRecord>>;

    async fn put_history(&self, record: &HistoryRecord) -> Result<()>;
    /// Newest-first by `created_at`, along with the total count.
    async fn list_history(&self, limit: usize, offset: usize) -> Result<(Vec<HistoryRecord>, usize)>;
    /// Removes history entries older than `now - max_age`, returns the count removed.
    async fn cleanup_history(&self, max_age: Duration) -> Result<usize>;

    /// Fails with `Held` if a prior holder exists, `Backend` on transport error.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<String>;
    /// Best-effort KV release followed by unconditional session destruction.
    /// Never returns an error the caller needs to act on.
    async fn release_lock(&self, key: &str, session_id: &str);

    /// Reads a runtime-tunable value from `<prefix>/config/<name>`.
    async fn get_config(&self, name: &str) -> Result<Option<String>>;
    /// Writes a runtime-tunable value to `<prefix>/config/<name>`.
    async fn put_config(&self, name: &str, value: &str) -> Result<()>;
}

/// Stable, lower-cased, path-separator-sanitized fingerprint used as the
/// rendezvous point for cross-replica build serialization.
pub fn image_lock_key(registry_url: &str, image_name: &str, git_ref: &str) -> String {
    let sanitize = |s: &str| s.to_lowercase().replace('/', "-");
    format!(
        "image-{}-{}-{}",
        sanitize(registry_url),
        sanitize(image_name),
        sanitize(git_ref)
    )
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeRecordStore {
        jobs: Mutex<HashMap<JobId, JobRecord>>,
        history: Mutex<Vec<HistoryRecord>>,
        locks: Mutex<HashMap<String, String>>,
        config: Mutex<HashMap<String, String>>,
    }

    impl FakeRecordStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl RecordStore for FakeRecordStore {
        async fn put_job(&self, record: &JobRecord) -> Result<()> {
            self.jobs.lock().unwrap().insert(record.id, record.clone());
            Ok(())
        }

        async fn get_job(&self, id: JobId) -> Result<JobRecord> {
            self.jobs
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        }

        async fn update_job(&self, record: &JobRecord) -> Result<()> {
            self.jobs.lock().unwrap().insert(record.id, record.clone());
            Ok(())
        }

        async fn delete_job(&self, id: JobId) -> Result<()> {
            self.jobs.lock().unwrap().remove(&id);
            Ok(())
        }

        async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
            Ok(self.jobs.lock().unwrap().values().cloned().collect())
        }

        async fn put_history(&self, record: &HistoryRecord) -> Result<()> {
            self.history.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn list_history(&self, limit: usize, offset: usize) -> Result<(Vec<HistoryRecord>, usize)> {
            let mut all = self.history.lock().unwrap().clone();
            all.sort_by_key(|r| std::cmp::Reverse(r.created_at));
            let total = all.len();
            let page = all.into_iter().skip(offset).take(limit).collect();
            Ok((page, total))
        }

        async fn cleanup_history(&self, max_age: Duration) -> Result<usize> {
            let cutoff = Utc::now() - max_age;
            let mut history = self.history.lock().unwrap();
            let before = history.len();
            history.retain(|r| r.finished_at >= cutoff);
            Ok(before - history.len())
        }

        async fn acquire_lock(&self, key: &str, _ttl: Duration) -> Result<String> {
            let mut locks = self.locks.lock().unwrap();
            if locks.contains_key(key) {
                return Err(StoreError::Held);
            }
            let session_id = uuid::Uuid::new_v4().to_string();
            locks.insert(key.to_string(), session_id.clone());
            Ok(session_id)
        }

        async fn release_lock(&self, key: &str, session_id: &str) {
            let mut locks = self.locks.lock().unwrap();
            if locks.get(key).map(String::as_str) == Some(session_id) {
                locks.remove(key);
            }
        }

        async fn get_config(&self, name: &str) -> Result<Option<String>> {
            Ok(self.config.lock().unwrap().get(name).cloned())
        }

        async fn put_config(&self, name: &str, value: &str) -> Result<()> {
            self.config
                .lock()
                .unwrap()
                .insert(name.to_string(), value.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_lock_key_is_stable_and_sanitized() {
        assert_eq!(
            image_lock_key("Registry.Example/Team", "My/Image", "Feature/X"),
            "image-registry.example-team-my-image-feature-x"
        );
    }
}
