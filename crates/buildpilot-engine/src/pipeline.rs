//! The per-job state machine: `PENDING -> BUILDING -> TESTING -> PUBLISHING
//! -> SUCCEEDED/FAILED`. One instance runs per submitted job, as its own
//! tokio task, with strict single-writer ownership of the job's record.

use buildpilot_config::Config;
use buildpilot_core::{HistoryRecord, JobId, JobRecord, JobStatus, Phase};
use buildpilot_scheduler::{self as scheduler, SchedulerAdapter};
use buildpilot_store::{self as store, RecordStore, StoreError};
use buildpilot_webhook::WebhookNotifier;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::phase::{run_phase, PhaseOutcome};

/// Everything a running pipeline needs; shared read-only across every job's
/// task via `Arc`.
pub struct PipelineDeps {
    pub store: Arc<dyn RecordStore>,
    pub scheduler: Arc<dyn SchedulerAdapter>,
    pub webhook: Arc<WebhookNotifier>,
    pub config: Arc<Config>,
}

/// Entry point spawned by the coordinator for one job. Never panics or
/// propagates an error: every failure path ends in a FAILED record.
pub async fn run(deps: Arc<PipelineDeps>, job_id: JobId, mut cancel: watch::Receiver<bool>) {
    let mut record = match deps.store.get_job(job_id).await {
        Ok(record) => record,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "pipeline task could not load its own job record");
            return;
        }
    };

    if *cancel.borrow() {
        fail(&deps, &mut record, "cancelled by user".to_string()).await;
        return;
    }

    if let Err(message) = acquire_lock(&deps, &mut record).await {
        fail(&deps, &mut record, message).await;
        return;
    }

    record.metrics.queue_time = Some(Utc::now() - record.created_at);
    record.metrics.start_time = Some(Utc::now());
    if !advance(&deps, &mut record, JobStatus::Building).await {
        return;
    }

    for phase in [Phase::Build, Phase::Test, Phase::Publish] {
        match run_phase(
            deps.scheduler.as_ref(),
            &deps.config,
            &mut record,
            phase,
            &mut cancel,
        )
        .await
        {
            PhaseOutcome::Failed(message) => {
                fail(&deps, &mut record, message).await;
                return;
            }
            PhaseOutcome::Success | PhaseOutcome::Skipped => {}
        }

        if phase == Phase::Publish {
            succeed(&deps, &mut record).await;
            return;
        }

        let next = match phase {
            Phase::Build => JobStatus::Testing,
            Phase::Test => JobStatus::Publishing,
            Phase::Publish => unreachable!("handled above"),
        };
        if !advance(&deps, &mut record, next).await {
            return;
        }
    }
}

async fn acquire_lock(deps: &PipelineDeps, record: &mut JobRecord) -> Result<(), String> {
    let key = store::image_lock_key(
        &record.config.registry_url,
        &record.config.image_name,
        &record.config.git_ref,
    );
    let ttl = chrono::Duration::seconds(
        (deps.config.build_timeout_secs
            + deps.config.test_timeout_secs
            + deps.config.publish_timeout_secs) as i64
            + 300,
    );
    match deps.store.acquire_lock(&key, ttl).await {
        Ok(session_id) => {
            record.lock_session_id = Some(session_id);
            Ok(())
        }
        Err(StoreError::Held) => {
            Err("another build in progress for this image/branch".to_string())
        }
        Err(e) => Err(format!("lock backend error: {e}")),
    }
}

/// Transition to `next` and persist. On failure (which should only happen
/// from a programmer error), marks the job FAILED and returns `false` so the
/// caller stops driving the pipeline.
async fn advance(deps: &PipelineDeps, record: &mut JobRecord, next: JobStatus) -> bool {
    if let Err(e) = record.transition(next) {
        fail(deps, record, format!("internal error: {e}")).await;
        return false;
    }
    if let Err(e) = deps.store.update_job(record).await {
        warn!(job_id = %record.id, error = %e, "failed to persist state transition");
    }
    true
}

async fn fail(deps: &PipelineDeps, record: &mut JobRecord, message: String) {
    record.error = Some(message);
    if !record.status.is_terminal() {
        let _ = record.transition(JobStatus::Failed);
    }
    record.metrics.end_time = Some(Utc::now());
    finalize(deps, record).await;
}

async fn succeed(deps: &PipelineDeps, record: &mut JobRecord) {
    record.metrics.end_time = Some(Utc::now());
    if let Err(e) = record.transition(JobStatus::Succeeded) {
        record.error = Some(format!("internal error: {e}"));
        let _ = record.transition(JobStatus::Failed);
    }
    finalize(deps, record).await;
}

/// Common terminal-state teardown: release the lock, best-effort delete the
/// intermediate image, persist the record, write history, fire the webhook.
async fn finalize(deps: &PipelineDeps, record: &mut JobRecord) {
    if let Some(session_id) = record.lock_session_id.take() {
        let key = store::image_lock_key(
            &record.config.registry_url,
            &record.config.image_name,
            &record.config.git_ref,
        );
        deps.store.release_lock(&key, &session_id).await;
    }

    if record.scheduler_ids.build.is_some() {
        let image_ref = scheduler::spec::intermediate_image(&record.config, record.id);
        if let Err(e) = deps.scheduler.cleanup_image(&image_ref).await {
            warn!(job_id = %record.id, error = %e, "best-effort intermediate image cleanup failed");
        }
    }

    if let Err(e) = deps.store.update_job(record).await {
        warn!(job_id = %record.id, error = %e, "failed to persist terminal job record");
    }

    let history = HistoryRecord::from(&*record);
    if let Err(e) = deps.store.put_history(&history).await {
        warn!(job_id = %record.id, error = %e, "failed to persist history record");
    }

    deps.webhook.notify(record).await;
    info!(job_id = %record.id, status = ?record.status, "pipeline reached a terminal state");
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildpilot_core::JobId;
    use buildpilot_scheduler::fake::{FakeOutcome, FakeScheduler};
    use buildpilot_scheduler::WaitOutcome;
    use buildpilot_store::fake::FakeRecordStore;
    use clap::Parser;

    fn job_config() -> buildpilot_core::JobConfig {
        buildpilot_core::JobConfig {
            owner: "acme".into(),
            repo_url: "https://git.example/acme/app".into(),
            git_ref: "main".into(),
            git_credentials_ref: "secret/git/default".into(),
            dockerfile_path: "Dockerfile".into(),
            image_name: "app".into(),
            image_tags: vec!["v1".into()],
            registry_url: "registry.example.com".into(),
            registry_credentials_ref: "secret/registry/default".into(),
            test: None,
            resource_limits: None,
            webhook: None,
        }
    }

    fn deps_with(scheduler: FakeScheduler) -> (Arc<PipelineDeps>, Arc<FakeRecordStore>) {
        let store = Arc::new(FakeRecordStore::new());
        let deps = Arc::new(PipelineDeps {
            store: store.clone(),
            scheduler: Arc::new(scheduler),
            webhook: Arc::new(WebhookNotifier::new()),
            config: Arc::new(Config::parse_from(["buildpilot-server"])),
        });
        (deps, store)
    }

    #[tokio::test]
    async fn succeeds_through_all_three_phases() {
        let (deps, store) = deps_with(FakeScheduler::new());
        let record = JobRecord::new(JobId::new(), job_config());
        let id = record.id;
        store.put_job(&record).await.unwrap();
        let (_tx, rx) = watch::channel(false);

        run(deps, id, rx).await;

        let finished = store.get_job(id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Succeeded);
        assert!(finished.lock_session_id.is_none());
        assert!(finished.scheduler_ids.test.is_none(), "no test config means the test phase is skipped");
    }

    #[tokio::test]
    async fn build_failure_stops_the_pipeline_and_releases_the_lock() {
        let scheduler = FakeScheduler::new().with_outcome(
            "build",
            FakeOutcome {
                wait: WaitOutcome::Failed("exit code 1".into()),
                stdout: vec![],
                stderr: vec!["boom".into()],
            },
        );
        let (deps, store) = deps_with(scheduler);
        let record = JobRecord::new(JobId::new(), job_config());
        let id = record.id;
        store.put_job(&record).await.unwrap();
        let (_tx, rx) = watch::channel(false);

        run(deps, id, rx).await;

        let finished = store.get_job(id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert!(finished.error.unwrap().contains("build failed"));
        assert!(finished.lock_session_id.is_none());
    }

    #[tokio::test]
    async fn cancellation_before_start_fails_without_submitting_anything() {
        let (deps, store) = deps_with(FakeScheduler::new());
        let record = JobRecord::new(JobId::new(), job_config());
        let id = record.id;
        store.put_job(&record).await.unwrap();
        let (_tx, rx) = watch::channel(true);

        run(deps, id, rx).await;

        let finished = store.get_job(id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.error.as_deref(), Some("cancelled by user"));
    }

    #[tokio::test]
    async fn second_build_for_the_same_image_is_rejected_while_the_first_holds_the_lock() {
        let (deps, store) = deps_with(FakeScheduler::new());
        let config = job_config();
        let key = store::image_lock_key(&config.registry_url, &config.image_name, &config.git_ref);
        let _session = store.acquire_lock(&key, chrono::Duration::hours(1)).await.unwrap();

        let record = JobRecord::new(JobId::new(), config);
        let id = record.id;
        store.put_job(&record).await.unwrap();
        let (_tx, rx) = watch::channel(false);

        run(deps, id, rx).await;

        let finished = store.get_job(id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert!(finished.error.unwrap().contains("another build in progress"));
    }
}
