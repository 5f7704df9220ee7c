//! Translates a job configuration into Nomad batch-job specifications,
//! submits and tracks them, and harvests their logs.

mod error;
pub mod nomad;
pub mod spec;

pub use error::{Result, SchedulerError};

use async_trait::async_trait;
use buildpilot_core::JobRecord;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of waiting on a phase's scheduler job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    Failed(String),
    Timeout,
    Cancelled,
}

/// Adapter over the workload scheduler. `nomad` is the production
/// implementation; engine tests substitute an in-memory fake.
#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    async fn submit_build(&self, job: &JobRecord) -> Result<String>;
    async fn submit_test(&self, job: &JobRecord) -> Result<Option<String>>;
    async fn submit_publish(&self, job: &JobRecord) -> Result<String>;

    /// Polls cluster status at a bounded interval; returns early if `cancel`
    /// observes a cancellation signal between polls.
    async fn wait_for_completion(
        &self,
        scheduler_id: &str,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<WaitOutcome>;

    /// Best-effort: returns empty sequences rather than an error if the
    /// cluster has already garbage-collected the job's logs.
    async fn get_logs(&self, scheduler_id: &str) -> Result<(Vec<String>, Vec<String>)>;

    async fn stop_job(&self, scheduler_id: &str) -> Result<()>;
    async fn purge_job(&self, scheduler_id: &str) -> Result<()>;

    /// Best-effort removal of the intermediate `bdtemp-` image via a
    /// short-lived cleanup workload. Never load-bearing for pipeline
    /// correctness -- callers ignore errors.
    async fn cleanup_image(&self, image_ref: &str) -> Result<()>;

    /// Liveness probe used by `/healthz`. Cheap; never touches job state.
    async fn health_check(&self) -> Result<()>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct FakeOutcome {
        pub wait: WaitOutcome,
        pub stdout: Vec<String>,
        pub stderr: Vec<String>,
    }

    impl Default for FakeOutcome {
        fn default() -> Self {
            Self {
                wait: WaitOutcome::Completed,
                stdout: vec!["ok".to_string()],
                stderr: vec![],
            }
        }
    }

    /// Scripted scheduler: every submitted job completes with the outcome
    /// registered for its phase name prefix (`build`, `test`, `publish`),
    /// defaulting to success.
    #[derive(Default)]
    pub struct FakeScheduler {
        outcomes: Mutex<HashMap<String, FakeOutcome>>,
        submitted: Mutex<Vec<String>>,
        purged: Mutex<Vec<String>>,
        stopped: Mutex<Vec<String>>,
        cleaned_images: Mutex<Vec<String>>,
    }

    impl FakeScheduler {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_outcome(self, phase: &str, outcome: FakeOutcome) -> Self {
            self.outcomes.lock().unwrap().insert(phase.to_string(), outcome);
            self
        }

        pub fn submitted(&self) -> Vec<String> {
            self.submitted.lock().unwrap().clone()
        }

        pub fn purged(&self) -> Vec<String> {
            self.purged.lock().unwrap().clone()
        }

        pub fn stopped(&self) -> Vec<String> {
            self.stopped.lock().unwrap().clone()
        }

        pub fn cleaned_images(&self) -> Vec<String> {
            self.cleaned_images.lock().unwrap().clone()
        }

        fn outcome_for(&self, phase: &str) -> FakeOutcome {
            self.outcomes
                .lock()
                .unwrap()
                .get(phase)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl SchedulerAdapter for FakeScheduler {
        async fn submit_build(&self, job: &JobRecord) -> Result<String> {
            let id = crate::spec::job_name(buildpilot_core::Phase::Build, job.id);
            self.submitted.lock().unwrap().push(id.clone());
            Ok(id)
        }

        async fn submit_test(&self, job: &JobRecord) -> Result<Option<String>> {
            if job.config.test.as_ref().map(|t| t.is_skipped()).unwrap_or(true) {
                return Ok(None);
            }
            let id = crate::spec::job_name(buildpilot_core::Phase::Test, job.id);
            self.submitted.lock().unwrap().push(id.clone());
            Ok(Some(id))
        }

        async fn submit_publish(&self, job: &JobRecord) -> Result<String> {
            let id = crate::spec::job_name(buildpilot_core::Phase::Publish, job.id);
            self.submitted.lock().unwrap().push(id.clone());
            Ok(id)
        }

        async fn wait_for_completion(
            &self,
            scheduler_id: &str,
            _timeout: Duration,
            cancel: &mut watch::Receiver<bool>,
        ) -> Result<WaitOutcome> {
            if *cancel.borrow() {
                return Ok(WaitOutcome::Cancelled);
            }
            let phase = scheduler_id.split('-').next().unwrap_or(scheduler_id);
            Ok(self.outcome_for(phase).wait)
        }

        async fn get_logs(&self, scheduler_id: &str) -> Result<(Vec<String>, Vec<String>)> {
            let phase = scheduler_id.split('-').next().unwrap_or(scheduler_id);
            let outcome = self.outcome_for(phase);
            Ok((outcome.stdout, outcome.stderr))
        }

        async fn stop_job(&self, scheduler_id: &str) -> Result<()> {
            self.stopped.lock().unwrap().push(scheduler_id.to_string());
            Ok(())
        }

        async fn purge_job(&self, scheduler_id: &str) -> Result<()> {
            self.purged.lock().unwrap().push(scheduler_id.to_string());
            Ok(())
        }

        async fn cleanup_image(&self, image_ref: &str) -> Result<()> {
            self.cleaned_images.lock().unwrap().push(image_ref.to_string());
            Ok(())
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }
}
