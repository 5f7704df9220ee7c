//! Nomad HTTP API client implementing `SchedulerAdapter`.

use async_trait::async_trait;
use buildpilot_core::{JobRecord, Phase};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::{Result, SchedulerAdapter, SchedulerError, WaitOutcome, spec};

/// Interval at which `wait_for_completion` polls cluster status.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct NomadScheduler {
    http: reqwest::Client,
    address: String,
    region: Option<String>,
    datacenter: String,
}

impl NomadScheduler {
    pub fn new(address: impl Into<String>, datacenter: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            address: address.into(),
            region: None,
            datacenter: datacenter.into(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    fn url(&self, path: &str) -> String {
        let mut url = format!("{}{}", self.address.trim_end_matches('/'), path);
        if let Some(region) = &self.region {
            url.push_str(if url.contains('?') { "&" } else { "?" });
            url.push_str(&format!("region={region}"));
        }
        url
    }

    async fn register(&self, job_spec: serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(self.url("/v1/jobs"))
            .json(&job_spec)
            .send()
            .await
            .map_err(|e| SchedulerError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::Backend(body));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct JobSummaryResponse {
    #[serde(rename = "Summary")]
    summary: std::collections::HashMap<String, TaskGroupSummary>,
}

#[derive(Debug, Deserialize)]
struct TaskGroupSummary {
    #[serde(rename = "Complete")]
    complete: i64,
    #[serde(rename = "Failed")]
    failed: i64,
    #[serde(rename = "Running")]
    running: i64,
}

#[derive(Debug, Deserialize)]
struct AllocationListEntry {
    #[serde(rename = "ID")]
    id: String,
}

#[async_trait]
impl SchedulerAdapter for NomadScheduler {
    async fn submit_build(&self, job: &JobRecord) -> Result<String> {
        let rendered = spec::build_spec(&job.config, job.id, &self.datacenter);
        self.register(rendered).await?;
        Ok(spec::job_name(Phase::Build, job.id))
    }

    async fn submit_test(&self, job: &JobRecord) -> Result<Option<String>> {
        let Some(rendered) = spec::test_spec(&job.config, job.id, &self.datacenter) else {
            return Ok(None);
        };
        self.register(rendered).await?;
        Ok(Some(spec::job_name(Phase::Test, job.id)))
    }

    async fn submit_publish(&self, job: &JobRecord) -> Result<String> {
        let rendered = spec::publish_spec(&job.config, job.id, &self.datacenter);
        self.register(rendered).await?;
        Ok(spec::job_name(Phase::Publish, job.id))
    }

    async fn wait_for_completion(
        &self,
        scheduler_id: &str,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if *cancel.borrow() {
                return Ok(WaitOutcome::Cancelled);
            }
            if Instant::now() >= deadline {
                self.stop_job(scheduler_id).await.ok();
                self.purge_job(scheduler_id).await.ok();
                return Ok(WaitOutcome::Timeout);
            }

            let response = self
                .http
                .get(self.url(&format!("/v1/job/{scheduler_id}/summary")))
                .send()
                .await
                .map_err(|e| SchedulerError::Backend(e.to_string()))?;

            if response.status().is_success() {
                let summary: JobSummaryResponse = response
                    .json()
                    .await
                    .map_err(|e| SchedulerError::Backend(e.to_string()))?;
                if let Some(group) = summary.summary.values().next() {
                    if group.failed > 0 {
                        return Ok(WaitOutcome::Failed(format!(
                            "{scheduler_id} reported {} failed allocation(s)",
                            group.failed
                        )));
                    }
                    if group.complete > 0 && group.running == 0 {
                        return Ok(WaitOutcome::Completed);
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Ok(WaitOutcome::Cancelled);
                    }
                }
            }
        }
    }

    async fn get_logs(&self, scheduler_id: &str) -> Result<(Vec<String>, Vec<String>)> {
        let response = self
            .http
            .get(self.url(&format!("/v1/job/{scheduler_id}/allocations")))
            .send()
            .await
            .map_err(|e| SchedulerError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Ok((Vec::new(), Vec::new()));
        }
        let allocations: Vec<AllocationListEntry> = response
            .json()
            .await
            .unwrap_or_default();
        let Some(alloc) = allocations.first() else {
            return Ok((Vec::new(), Vec::new()));
        };

        let stdout = self.fetch_log(&alloc.id, "stdout").await.unwrap_or_default();
        let stderr = self.fetch_log(&alloc.id, "stderr").await.unwrap_or_default();
        Ok((stdout, stderr))
    }

    async fn stop_job(&self, scheduler_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/job/{scheduler_id}")))
            .send()
            .await
            .map_err(|e| SchedulerError::Backend(e.to_string()))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(SchedulerError::Backend(format!(
                "stop {scheduler_id} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn purge_job(&self, scheduler_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/job/{scheduler_id}?purge=true")))
            .send()
            .await
            .map_err(|e| SchedulerError::Backend(e.to_string()))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(SchedulerError::Backend(format!(
                "purge {scheduler_id} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn cleanup_image(&self, image_ref: &str) -> Result<()> {
        let name = format!("cleanup-{}", uuid::Uuid::now_v7());
        let rendered = spec::cleanup_image_spec(&name, image_ref, &self.datacenter);
        // Fire-and-forget: dispatched and left to run (and be GC'd by the
        // cluster's batch-job reaper) on its own; we don't wait on it.
        self.register(rendered).await
    }

    async fn health_check(&self) -> Result<()> {
        let response = self
            .http
            .get(self.url("/v1/agent/self"))
            .send()
            .await
            .map_err(|e| SchedulerError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SchedulerError::Backend(format!(
                "agent self check returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl NomadScheduler {
    async fn fetch_log(&self, alloc_id: &str, stream: &str) -> Option<Vec<String>> {
        let response = self
            .http
            .get(self.url(&format!(
                "/v1/client/fs/logs/{alloc_id}?task=pipeline&type={stream}&plain=true"
            )))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let text = response.text().await.ok()?;
        Some(text.lines().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_appends_region_query_param() {
        let scheduler = NomadScheduler::new("http://nomad:4646", "dc1").with_region("global");
        assert_eq!(
            scheduler.url("/v1/jobs"),
            "http://nomad:4646/v1/jobs?region=global"
        );
    }
}
