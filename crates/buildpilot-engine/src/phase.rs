//! One submit -> wait -> collect-logs -> teardown runner shared by the
//! build, test and publish phases (see DESIGN.md: "polymorphism over
//! phases" rather than three near-duplicate code paths).

use buildpilot_config::Config;
use buildpilot_core::{JobRecord, Phase};
use buildpilot_scheduler::{SchedulerAdapter, WaitOutcome};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;

/// What happened while driving one phase to completion.
pub enum PhaseOutcome {
    /// The phase's scheduler job reached a successful terminal state.
    Success,
    /// The phase was never submitted because it had nothing to do (the
    /// test phase, when no commands and no entry-point probe are configured).
    Skipped,
    /// The phase failed, timed out, or observed cancellation. The record's
    /// `error` should be set to this message and the pipeline must stop.
    Failed(String),
}

/// Pulls the commit SHA the build runner resolved `git_ref` to out of its
/// stdout, looking for a `GIT_COMMIT_SHA=<sha>` line the way the teacher's
/// own runner convention reports resolved git state (`GIT_COMMIT`,
/// `CI_COMMIT_SHA`).
pub fn extract_commit_sha(build_logs: &[String]) -> Option<String> {
    build_logs.iter().rev().find_map(|line| {
        let sha = line.strip_prefix("GIT_COMMIT_SHA=")?.trim();
        (!sha.is_empty()).then(|| sha.to_string())
    })
}

pub fn phase_timeout(config: &Config, phase: Phase) -> Duration {
    match phase {
        Phase::Build => config.build_timeout(),
        Phase::Test => config.test_timeout(),
        Phase::Publish => config.publish_timeout(),
    }
}

fn scheduler_id_mut(record: &mut JobRecord, phase: Phase) -> &mut Option<String> {
    match phase {
        Phase::Build => &mut record.scheduler_ids.build,
        Phase::Test => &mut record.scheduler_ids.test,
        Phase::Publish => &mut record.scheduler_ids.publish,
    }
}

fn duration_mut(record: &mut JobRecord, phase: Phase) -> &mut Option<chrono::Duration> {
    match phase {
        Phase::Build => &mut record.metrics.build_duration,
        Phase::Test => &mut record.metrics.test_duration,
        Phase::Publish => &mut record.metrics.publish_duration,
    }
}

async fn submit(
    scheduler: &dyn SchedulerAdapter,
    phase: Phase,
    record: &JobRecord,
) -> buildpilot_scheduler::Result<Option<String>> {
    match phase {
        Phase::Build => scheduler.submit_build(record).await.map(Some),
        Phase::Test => scheduler.submit_test(record).await,
        Phase::Publish => scheduler.submit_publish(record).await.map(Some),
    }
}

async fn teardown(scheduler: &dyn SchedulerAdapter, scheduler_id: &str) {
    let _ = scheduler.stop_job(scheduler_id).await;
    let _ = scheduler.purge_job(scheduler_id).await;
}

/// Drives one phase for `record` from submission through to a terminal
/// scheduler state, writing the scheduler id, logs and duration directly
/// into the record as it goes.
pub async fn run_phase(
    scheduler: &dyn SchedulerAdapter,
    config: &Config,
    record: &mut JobRecord,
    phase: Phase,
    cancel: &mut watch::Receiver<bool>,
) -> PhaseOutcome {
    if phase == Phase::Test
        && record
            .config
            .test
            .as_ref()
            .map(|t| t.is_skipped())
            .unwrap_or(true)
    {
        return PhaseOutcome::Skipped;
    }

    if *cancel.borrow() {
        return PhaseOutcome::Failed("cancelled by user".to_string());
    }

    let scheduler_id = match submit(scheduler, phase, record).await {
        Ok(Some(id)) => id,
        Ok(None) => return PhaseOutcome::Skipped,
        Err(e) => {
            return PhaseOutcome::Failed(format!(
                "failed to submit {}: {e}",
                phase.as_str()
            ));
        }
    };
    *scheduler_id_mut(record, phase) = Some(scheduler_id.clone());

    let started = Utc::now();
    let outcome = scheduler
        .wait_for_completion(&scheduler_id, phase_timeout(config, phase), cancel)
        .await
        .unwrap_or_else(|e| WaitOutcome::Failed(e.to_string()));
    *duration_mut(record, phase) = Some(Utc::now() - started);

    let (stdout, stderr) = scheduler.get_logs(&scheduler_id).await.unwrap_or_default();
    let mut logs = stdout;
    logs.extend(stderr);
    *record.logs.for_phase_mut(phase) = logs;

    if phase == Phase::Build {
        record.commit_sha = extract_commit_sha(&record.logs.build);
    }

    match outcome {
        WaitOutcome::Completed => PhaseOutcome::Success,
        WaitOutcome::Failed(msg) => {
            teardown(scheduler, &scheduler_id).await;
            PhaseOutcome::Failed(format!("{} failed: {msg}", phase.as_str()))
        }
        WaitOutcome::Timeout => {
            teardown(scheduler, &scheduler_id).await;
            PhaseOutcome::Failed(format!("{} timed out", phase.as_str()))
        }
        WaitOutcome::Cancelled => {
            teardown(scheduler, &scheduler_id).await;
            PhaseOutcome::Failed("cancelled by user".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_commit_sha_finds_the_reported_line() {
        let logs = vec![
            "cloning repo".to_string(),
            "GIT_COMMIT_SHA=abc123def456".to_string(),
            "build complete".to_string(),
        ];
        assert_eq!(extract_commit_sha(&logs).as_deref(), Some("abc123def456"));
    }

    #[test]
    fn extract_commit_sha_is_none_without_a_reported_line() {
        let logs = vec!["cloning repo".to_string(), "build complete".to_string()];
        assert_eq!(extract_commit_sha(&logs), None);
    }
}
