//! Application state shared across every RPC handler.

use buildpilot_config::Config;
use buildpilot_engine::Coordinator;
use buildpilot_scheduler::SchedulerAdapter;
use buildpilot_store::RecordStore;
use std::sync::Arc;

/// Shared application state. Cheap to clone: every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub config: Arc<Config>,
    store: Arc<dyn RecordStore>,
    scheduler: Arc<dyn SchedulerAdapter>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<Coordinator>,
        config: Arc<Config>,
        store: Arc<dyn RecordStore>,
        scheduler: Arc<dyn SchedulerAdapter>,
    ) -> Self {
        Self {
            coordinator,
            config,
            store,
            scheduler,
        }
    }

    /// `/healthz`: the record store and the scheduler both answer.
    pub async fn is_healthy(&self) -> bool {
        self.store.list_jobs().await.is_ok() && self.scheduler.health_check().await.is_ok()
    }
}
