//! Process-wide entry point: dispatches jobs, tracks their cancellation
//! handles, and answers every read/control operation the RPC surface and
//! the CLI need.

use buildpilot_config::Config;
use buildpilot_core::{
    Error, HistoryRecord, JobConfig, JobId, JobMetrics, JobRecord, JobStatus, Phase, Result,
    SchedulerIds,
};
use buildpilot_scheduler::SchedulerAdapter;
use buildpilot_store::{RecordStore, StoreError};
use buildpilot_webhook::WebhookNotifier;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::pipeline::{self, PipelineDeps};

/// How often the background sweepers run.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// A terminal job's intermediate image is left alone for this long before
/// the orphan sweeper considers `finalize`'s own cleanup attempt to have
/// had its chance and takes over.
const ORPHAN_IMAGE_GRACE: chrono::Duration = chrono::Duration::minutes(10);

/// Read projection of a [`JobRecord`] safe to hand to RPC callers: no lock
/// session id, no log bodies (those come from `get_logs` instead).
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub error: Option<String>,
    pub metrics: JobMetrics,
    pub scheduler_ids: SchedulerIds,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            status: record.status,
            error: record.error.clone(),
            metrics: record.metrics.clone(),
            scheduler_ids: record.scheduler_ids.clone(),
            commit_sha: record.commit_sha.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

fn store_err_to_core(e: StoreError) -> Error {
    match e {
        StoreError::NotFound(id) => Error::NotFound(id),
        StoreError::Held => Error::Contention("resource held by another holder".into()),
        StoreError::Backend(msg) => Error::Backend(msg),
        StoreError::Serde(msg) => Error::Backend(msg.to_string()),
    }
}

/// Dispatches and tracks every in-flight job. One instance lives for the
/// life of the process; cloned cheaply via `Arc` into the RPC handlers.
pub struct Coordinator {
    deps: Arc<PipelineDeps>,
    /// Cancellation sender for every job still being actively driven.
    /// Removed once the job's pipeline task exits.
    cancels: Arc<Mutex<HashMap<JobId, watch::Sender<bool>>>>,
    /// Set by `shutdown`; `submit_job` rejects new work once this is true.
    draining: std::sync::atomic::AtomicBool,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        scheduler: Arc<dyn SchedulerAdapter>,
        webhook: Arc<WebhookNotifier>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            deps: Arc::new(PipelineDeps {
                store,
                scheduler,
                webhook,
                config,
            }),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            draining: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Validates the request, persists a PENDING record, and spawns the
    /// pipeline task that will drive it to a terminal state.
    pub async fn submit_job(&self, config: JobConfig) -> Result<JobId> {
        if self.draining.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::Internal("service is shutting down".into()));
        }
        config.validate()?;

        let record = JobRecord::new(JobId::new(), config);
        let id = record.id;
        self.deps
            .store
            .put_job(&record)
            .await
            .map_err(store_err_to_core)?;

        let (tx, rx) = watch::channel(false);
        self.cancels.lock().unwrap().insert(id, tx);

        let deps = Arc::clone(&self.deps);
        let cancels_cleanup = Arc::clone(&self.cancels);
        tokio::spawn(async move {
            pipeline::run(deps, id, rx).await;
            cancels_cleanup.lock().unwrap().remove(&id);
        });

        info!(job_id = %id, "job submitted");
        Ok(id)
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobStatusView> {
        let record = self.deps.store.get_job(id).await.map_err(store_err_to_core)?;
        Ok(JobStatusView::from(&record))
    }

    /// Returns the stored log lines for one phase, or every phase when
    /// `phase` is `None`. For whichever phase is still in flight, pulls the
    /// live scheduler log and appends it to what's already stored.
    pub async fn get_logs(&self, id: JobId, phase: Option<Phase>) -> Result<Vec<String>> {
        let record = self.deps.store.get_job(id).await.map_err(store_err_to_core)?;
        let active_phase = match record.status {
            JobStatus::Building => Some(Phase::Build),
            JobStatus::Testing => Some(Phase::Test),
            JobStatus::Publishing => Some(Phase::Publish),
            JobStatus::Pending | JobStatus::Succeeded | JobStatus::Failed => None,
        };
        Ok(match phase {
            Some(phase) => self.phase_logs(&record, phase, active_phase).await,
            None => {
                let mut all = self.phase_logs(&record, Phase::Build, active_phase).await;
                all.extend(self.phase_logs(&record, Phase::Test, active_phase).await);
                all.extend(self.phase_logs(&record, Phase::Publish, active_phase).await);
                all
            }
        })
    }

    /// Stored log lines for `phase`, with the scheduler's live log appended
    /// on top when `phase` is the one currently running. Best-effort: a
    /// scheduler error just falls back to what's already stored.
    async fn phase_logs(
        &self,
        record: &JobRecord,
        phase: Phase,
        active_phase: Option<Phase>,
    ) -> Vec<String> {
        let stored = record.logs.for_phase(phase).clone();
        if Some(phase) != active_phase {
            return stored;
        }
        let Some(scheduler_id) = record.scheduler_ids.for_phase(phase) else {
            return stored;
        };
        match self.deps.scheduler.get_logs(scheduler_id).await {
            Ok((stdout, stderr)) => {
                let mut merged = stored;
                merged.extend(stdout);
                merged.extend(stderr);
                merged
            }
            Err(e) => {
                warn!(job_id = %record.id, error = %e, "could not pull live logs for the running phase");
                stored
            }
        }
    }

    /// Signals cancellation to a live pipeline task. Fails with
    /// `InvalidState` if the job has already reached a terminal status.
    pub async fn kill_job(&self, id: JobId) -> Result<()> {
        let record = self.deps.store.get_job(id).await.map_err(store_err_to_core)?;
        if record.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "job {id} already reached a terminal state"
            )));
        }
        let sender = self
            .cancels
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no active pipeline task for job {id}")))?;
        let _ = sender.send(true);
        Ok(())
    }

    /// Best-effort safety net for a job whose terminal-state teardown did
    /// not fully run (e.g. the process restarted mid-finalize): re-attempts
    /// intermediate image cleanup and lock release. Idempotent.
    pub async fn cleanup(&self, id: JobId) -> Result<()> {
        let mut record = self.deps.store.get_job(id).await.map_err(store_err_to_core)?;
        if !record.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "job {id} has not reached a terminal state"
            )));
        }

        if let Some(session_id) = record.lock_session_id.take() {
            let key = buildpilot_store::image_lock_key(
                &record.config.registry_url,
                &record.config.image_name,
                &record.config.git_ref,
            );
            self.deps.store.release_lock(&key, &session_id).await;
            self.deps
                .store
                .update_job(&record)
                .await
                .map_err(store_err_to_core)?;
        }

        if record.scheduler_ids.build.is_some() {
            let image_ref =
                buildpilot_scheduler::spec::intermediate_image(&record.config, record.id);
            if let Err(e) = self.deps.scheduler.cleanup_image(&image_ref).await {
                warn!(job_id = %id, error = %e, "manual cleanup could not remove intermediate image");
            }
        }
        self.purge_scheduler_jobs(id, &record.scheduler_ids).await;
        Ok(())
    }

    /// Deletes a FAILED job's live record (history already has the
    /// permanent copy), freeing its image lock for a retry submission.
    pub async fn purge_failed_job(&self, id: JobId) -> Result<()> {
        let record = self.deps.store.get_job(id).await.map_err(store_err_to_core)?;
        if record.status != JobStatus::Failed {
            return Err(Error::InvalidState(format!(
                "job {id} is not in a failed state"
            )));
        }
        self.purge_scheduler_jobs(id, &record.scheduler_ids).await;
        self.deps.store.delete_job(id).await.map_err(store_err_to_core)
    }

    /// Best-effort purge of every phase's registered scheduler job
    /// (`build-<id>`, `test-<id>`, `publish-<id>`), whichever were submitted.
    async fn purge_scheduler_jobs(&self, id: JobId, scheduler_ids: &SchedulerIds) {
        for scheduler_id in [&scheduler_ids.build, &scheduler_ids.test, &scheduler_ids.publish]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.deps.scheduler.purge_job(scheduler_id).await {
                warn!(job_id = %id, scheduler_id, error = %e, "could not purge scheduler job");
            }
        }
    }

    pub async fn get_history(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<HistoryRecord>, usize)> {
        self.deps
            .store
            .list_history(limit, offset)
            .await
            .map_err(store_err_to_core)
    }

    /// Stops accepting new submissions, signals every live pipeline task to
    /// wind down, and waits up to `grace` for them to finish tearing down.
    /// Does not abort tasks that overrun the grace period.
    pub async fn shutdown(&self, grace: Duration) {
        self.draining.store(true, std::sync::atomic::Ordering::Release);

        let senders: Vec<_> = self.cancels.lock().unwrap().values().cloned().collect();
        for sender in &senders {
            let _ = sender.send(true);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.cancels.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.cancels.lock().unwrap().len();
        if remaining > 0 {
            warn!(remaining, "shutdown grace period elapsed with pipelines still tearing down");
        }
    }

    /// Spawns the three periodic background sweepers. Safe to call once
    /// per process; each sweeper runs for the lifetime of `self`.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let history = Arc::clone(self);
        tokio::spawn(async move { history.run_history_sweeper().await });

        let locks = Arc::clone(self);
        tokio::spawn(async move { locks.run_stale_lock_sweeper().await });

        let images = Arc::clone(self);
        tokio::spawn(async move { images.run_orphaned_image_sweeper().await });
    }

    /// Removes history entries past the retention window: an operator-set
    /// `history.max_age` runtime override if one is stored, falling back to
    /// the process-wide configured default.
    async fn run_history_sweeper(&self) {
        let runtime_config = buildpilot_config::RuntimeConfigStore::new(self.deps.store.clone());
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let max_age = self.resolve_history_max_age(&runtime_config).await;
            match self.deps.store.cleanup_history(max_age).await {
                Ok(removed) if removed > 0 => {
                    info!(removed, "history sweeper removed expired records");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "history sweeper failed"),
            }
        }
    }

    async fn resolve_history_max_age(
        &self,
        runtime_config: &buildpilot_config::RuntimeConfigStore,
    ) -> chrono::Duration {
        match runtime_config.get("history.max_age").await {
            Ok(Some(days)) => match days.parse::<i64>() {
                Ok(days) => chrono::Duration::days(days),
                Err(_) => {
                    warn!(value = %days, "runtime history.max_age override is not a number, using configured default");
                    self.deps.config.history_max_age()
                }
            },
            Ok(None) => self.deps.config.history_max_age(),
            Err(e) => {
                warn!(error = %e, "could not read runtime history.max_age override, using configured default");
                self.deps.config.history_max_age()
            }
        }
    }

    /// Releases image locks still held by jobs that reached a terminal
    /// state without running their own `finalize` teardown (process crash
    /// mid-pipeline, for example).
    async fn run_stale_lock_sweeper(&self) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let jobs = match self.deps.store.list_jobs().await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(error = %e, "stale lock sweeper could not list jobs");
                    continue;
                }
            };
            for mut record in jobs {
                if !record.status.is_terminal() {
                    continue;
                }
                let Some(session_id) = record.lock_session_id.take() else {
                    continue;
                };
                let key = buildpilot_store::image_lock_key(
                    &record.config.registry_url,
                    &record.config.image_name,
                    &record.config.git_ref,
                );
                self.deps.store.release_lock(&key, &session_id).await;
                if let Err(e) = self.deps.store.update_job(&record).await {
                    warn!(job_id = %record.id, error = %e, "stale lock sweeper could not persist release");
                } else {
                    info!(job_id = %record.id, "stale lock sweeper released an orphaned lock");
                }
            }
        }
    }

    /// Best-effort cleanup of intermediate `bdtemp-` images left behind by
    /// jobs whose own `finalize` teardown never ran or did not complete.
    async fn run_orphaned_image_sweeper(&self) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let jobs = match self.deps.store.list_jobs().await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(error = %e, "orphaned image sweeper could not list jobs");
                    continue;
                }
            };
            for mut record in jobs {
                if !record.status.is_terminal() || record.scheduler_ids.build.is_none() {
                    continue;
                }
                if Utc::now() - record.updated_at < ORPHAN_IMAGE_GRACE {
                    continue;
                }
                let image_ref =
                    buildpilot_scheduler::spec::intermediate_image(&record.config, record.id);
                if let Err(e) = self.deps.scheduler.cleanup_image(&image_ref).await {
                    warn!(job_id = %record.id, error = %e, "orphaned image sweeper could not clean up");
                    continue;
                }
                record.scheduler_ids.build = None;
                if let Err(e) = self.deps.store.update_job(&record).await {
                    warn!(job_id = %record.id, error = %e, "orphaned image sweeper could not persist cleanup marker");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildpilot_scheduler::fake::FakeScheduler;
    use buildpilot_store::fake::FakeRecordStore;
    use clap::Parser;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> Arc<Config> {
        Arc::new(Config::parse_from(["buildpilot-server"]))
    }

    fn job_config() -> JobConfig {
        JobConfig {
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

    fn coordinator() -> Coordinator {
        Coordinator::new(
            Arc::new(FakeRecordStore::new()),
            Arc::new(FakeScheduler::new()),
            Arc::new(WebhookNotifier::new()),
            test_config(),
        )
    }

    async fn wait_terminal(coordinator: &Coordinator, id: JobId) -> JobStatusView {
        timeout(Duration::from_secs(5), async {
            loop {
                let view = coordinator.get_status(id).await.unwrap();
                if view.status.is_terminal() {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach a terminal state in time")
    }

    #[tokio::test]
    async fn submit_job_runs_to_success() {
        let coordinator = coordinator();
        let id = coordinator.submit_job(job_config()).await.unwrap();
        let view = wait_terminal(&coordinator, id).await;
        assert_eq!(view.status, JobStatus::Succeeded);
        assert!(view.scheduler_ids.build.is_some());
        assert!(view.scheduler_ids.publish.is_some());
    }

    #[tokio::test]
    async fn submit_job_rejects_invalid_config() {
        let coordinator = coordinator();
        let mut config = job_config();
        config.image_name.clear();
        let err = coordinator.submit_job(config).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn kill_job_fails_once_terminal() {
        let coordinator = coordinator();
        let id = coordinator.submit_job(job_config()).await.unwrap();
        wait_terminal(&coordinator, id).await;
        let err = coordinator.kill_job(id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn purge_failed_job_requires_failed_status() {
        let coordinator = coordinator();
        let id = coordinator.submit_job(job_config()).await.unwrap();
        wait_terminal(&coordinator, id).await;
        let err = coordinator.purge_failed_job(id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn get_logs_concatenates_all_phases_by_default() {
        let coordinator = coordinator();
        let id = coordinator.submit_job(job_config()).await.unwrap();
        wait_terminal(&coordinator, id).await;
        let logs = coordinator.get_logs(id, None).await.unwrap();
        assert!(!logs.is_empty());
        let build_only = coordinator.get_logs(id, Some(Phase::Build)).await.unwrap();
        assert!(!build_only.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lock_sweeper_releases_locks_left_by_a_crashed_finalize() {
        let store = Arc::new(FakeRecordStore::new());
        let config = job_config();
        let key = buildpilot_store::image_lock_key(
            &config.registry_url,
            &config.image_name,
            &config.git_ref,
        );
        let session_id = store.acquire_lock(&key, chrono::Duration::hours(1)).await.unwrap();

        let mut record = JobRecord::new(JobId::new(), config);
        record.status = JobStatus::Failed;
        record.lock_session_id = Some(session_id.clone());
        store.put_job(&record).await.unwrap();

        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            Arc::new(FakeScheduler::new()),
            Arc::new(WebhookNotifier::new()),
            test_config(),
        ));
        coordinator.spawn_background_tasks();

        tokio::time::advance(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        // A second acquisition for the same key now succeeds because the
        // sweeper released the lock the crashed job's finalize left behind.
        let reacquired = store.acquire_lock(&key, chrono::Duration::hours(1)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn get_history_reports_the_finished_job() {
        let coordinator = coordinator();
        let id = coordinator.submit_job(job_config()).await.unwrap();
        wait_terminal(&coordinator, id).await;
        let (records, total) = coordinator.get_history(10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].id, id);
    }

    #[tokio::test]
    async fn resolve_history_max_age_prefers_the_runtime_override() {
        let coordinator = coordinator();
        let runtime_config =
            buildpilot_config::RuntimeConfigStore::new(coordinator.deps.store.clone());
        assert_eq!(
            coordinator.resolve_history_max_age(&runtime_config).await,
            coordinator.deps.config.history_max_age()
        );

        runtime_config.set("history.max_age", "3").await.unwrap();
        assert_eq!(
            coordinator.resolve_history_max_age(&runtime_config).await,
            chrono::Duration::days(3)
        );
    }

    #[tokio::test]
    async fn cleanup_purges_every_submitted_phase_job() {
        let scheduler = Arc::new(FakeScheduler::new());
        let coordinator = Coordinator::new(
            Arc::new(FakeRecordStore::new()),
            scheduler.clone(),
            Arc::new(WebhookNotifier::new()),
            test_config(),
        );
        let id = coordinator.submit_job(job_config()).await.unwrap();
        wait_terminal(&coordinator, id).await;

        coordinator.cleanup(id).await.unwrap();

        assert_eq!(scheduler.purged().len(), 2, "build and publish jobs were submitted");
    }

    #[tokio::test]
    async fn purge_failed_job_purges_its_scheduler_jobs_too() {
        let scheduler = Arc::new(
            FakeScheduler::new().with_outcome(
                "build",
                buildpilot_scheduler::fake::FakeOutcome {
                    wait: buildpilot_scheduler::WaitOutcome::Failed("boom".into()),
                    stdout: vec![],
                    stderr: vec![],
                },
            ),
        );
        let coordinator = Coordinator::new(
            Arc::new(FakeRecordStore::new()),
            scheduler.clone(),
            Arc::new(WebhookNotifier::new()),
            test_config(),
        );
        let id = coordinator.submit_job(job_config()).await.unwrap();
        wait_terminal(&coordinator, id).await;

        coordinator.purge_failed_job(id).await.unwrap();

        assert!(scheduler.purged().iter().any(|p| p.starts_with("build-")));
    }
}
