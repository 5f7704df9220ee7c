//! Runtime-tunable configuration values layered over the record store.
//!
//! Anything that should change without a process restart lives under
//! `<prefix>/config/<name>` in the same KV the record store already owns,
//! rather than in the immutable [`crate::Config`] read at startup.

use buildpilot_store::{RecordStore, Result};
use std::sync::Arc;

/// Thin accessor over `RecordStore::{get,put}_config`.
pub struct RuntimeConfigStore {
    store: Arc<dyn RecordStore>,
}

impl RuntimeConfigStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, name: &str) -> Result<Option<String>> {
        self.store.get_config(name).await
    }

    pub async fn set(&self, name: &str, value: &str) -> Result<()> {
        self.store.put_config(name, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildpilot_store::fake::FakeRecordStore;

    #[tokio::test]
    async fn round_trips_through_the_record_store() {
        let runtime = RuntimeConfigStore::new(Arc::new(FakeRecordStore::new()));
        assert_eq!(runtime.get("history.max_age").await.unwrap(), None);
        runtime.set("history.max_age", "30").await.unwrap();
        assert_eq!(
            runtime.get("history.max_age").await.unwrap(),
            Some("30".to_string())
        );
    }
}
