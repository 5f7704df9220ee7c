//! Posts terminal-state notifications to a job's configured webhook URL.

use buildpilot_core::{JobRecord, JobStatus, WebhookConfig};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    job_id: String,
    status: JobStatus,
    owner: &'a str,
    image_name: &'a str,
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    metrics: &'a buildpilot_core::JobMetrics,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Delivers the notification for one job's terminal transition. Never
/// returns an error the caller needs to act on -- pipeline completion is
/// never blocked by webhook delivery failures.
pub struct WebhookNotifier {
    http: reqwest::Client,
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Fires the webhook if the job carries one and the matching
    /// on_success/on_failure flag is set. Logs and swallows any failure
    /// after the retry budget is exhausted.
    pub async fn notify(&self, record: &JobRecord) {
        let Some(webhook) = &record.config.webhook else {
            return;
        };
        let should_fire = match record.status {
            JobStatus::Succeeded => webhook.on_success,
            JobStatus::Failed => webhook.on_failure,
            _ => false,
        };
        if !should_fire {
            return;
        }

        let payload = WebhookPayload {
            job_id: record.id.to_string(),
            status: record.status,
            owner: &record.config.owner,
            image_name: &record.config.image_name,
            tags: record.config.resolve_tags(record.id),
            error: record.error.as_deref(),
            metrics: &record.metrics,
            timestamp: chrono::Utc::now(),
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(job_id = %record.id, error = %e, "failed to serialize webhook payload");
                return;
            }
        };

        if let Err(e) = self.deliver(webhook, &body).await {
            warn!(job_id = %record.id, error = %e, "webhook delivery exhausted retries");
        }
    }

    async fn deliver(&self, webhook: &WebhookConfig, body: &[u8]) -> Result<(), String> {
        let mut last_err = String::new();
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(RETRY_DELAYS).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            let mut request = self.http.post(&webhook.url).header("Content-Type", "application/json");
            for (key, value) in &webhook.headers {
                request = request.header(key, value);
            }
            if let Some(secret) = &webhook.secret {
                request = request.header("X-Webhook-Signature", sign(secret, body));
            }

            match request.body(body.to_vec()).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => last_err = format!("status {}", response.status()),
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(last_err)
    }
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildpilot_core::{JobConfig, JobId};
    use std::collections::HashMap;

    fn base_config() -> JobConfig {
        JobConfig {
            owner: "acme".into(),
            repo_url: "https://git.example/acme/app".into(),
            git_ref: "main".into(),
            git_credentials_ref: "secret/git/default".into(),
            dockerfile_path: "Dockerfile".into(),
            image_name: "app".into(),
            image_tags: vec![],
            registry_url: "registry.example.com".into(),
            registry_credentials_ref: "secret/registry/default".into(),
            test: None,
            resource_limits: None,
            webhook: None,
        }
    }

    #[test]
    fn sign_matches_known_vector() {
        let sig = sign("secret", b"payload");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, sign("secret", b"payload"));
        assert_ne!(sig, sign("other", b"payload"));
    }

    #[tokio::test]
    async fn notify_skips_when_flag_disabled() {
        let mut config = base_config();
        config.webhook = Some(WebhookConfig {
            url: "http://127.0.0.1:1/unreachable".into(),
            secret: None,
            on_success: false,
            on_failure: true,
            headers: HashMap::new(),
        });
        let mut record = JobRecord::new(JobId::new(), config);
        record.status = JobStatus::Succeeded;

        let notifier = WebhookNotifier::new();
        notifier.notify(&record).await;
    }
}
