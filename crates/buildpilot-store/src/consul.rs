//! Consul KV + session HTTP client backing `RecordStore`.

use async_trait::async_trait;
use buildpilot_core::{HistoryRecord, JobId, JobRecord};
use chrono::Duration;
use serde::Deserialize;

use crate::{RecordStore, Result, StoreError};

/// Talks to a Consul agent/cluster at `address` (e.g. `http://consul:8500`),
/// namespacing every key under `<key_prefix>/...` as described for the
/// persisted layout: `jobs/<id>`, `history/<id>`, `locks/<key>`.
pub struct ConsulStore {
    http: reqwest::Client,
    address: String,
    token: Option<String>,
    datacenter: Option<String>,
    key_prefix: String,
}

impl ConsulStore {
    pub fn new(address: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            address: address.into(),
            token: None,
            datacenter: None,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    fn kv_url(&self, key: &str) -> String {
        let mut url = format!(
            "{}/v1/kv/{}/{}",
            self.address.trim_end_matches('/'),
            self.key_prefix.trim_matches('/'),
            key
        );
        if let Some(dc) = &self.datacenter {
            url.push_str(&format!("?dc={dc}"));
        }
        url
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        let response = self
            .request(self.http.put(self.kv_url(key)))
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Backend(format!(
                "consul PUT {key} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let response = self
            .request(self.http.get(self.kv_url(key)))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::Backend(format!(
                "consul GET {key} returned {}",
                response.status()
            )));
        }
        let entries: Vec<ConsulKvEntry> = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };
        let decoded = base64_decode(&entry.value)?;
        Ok(Some(decoded))
    }

    async fn kv_list(&self, key: &str) -> Result<Vec<String>> {
        let mut url = self.kv_url(key);
        url.push_str(if url.contains('?') { "&recurse" } else { "?recurse" });
        let response = self
            .request(self.http.get(url))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(StoreError::Backend(format!(
                "consul LIST {key} returned {}",
                response.status()
            )));
        }
        let entries: Vec<ConsulKvEntry> = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        entries
            .into_iter()
            .map(|entry| base64_decode(&entry.value))
            .collect()
    }

    async fn kv_delete(&self, key: &str) -> Result<()> {
        let response = self
            .request(self.http.delete(self.kv_url(key)))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Backend(format!(
                "consul DELETE {key} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ConsulKvEntry {
    #[serde(rename = "Value")]
    value: String,
}

fn base64_decode(value: &str) -> Result<String> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| StoreError::Backend(e.to_string()))
}

#[async_trait]
impl RecordStore for ConsulStore {
    async fn put_job(&self, record: &JobRecord) -> Result<()> {
        let body = serde_json::to_string(record)?;
        self.kv_put(&format!("jobs/{}", record.id), &body).await
    }

    async fn get_job(&self, id: JobId) -> Result<JobRecord> {
        let body = self
            .kv_get(&format!("jobs/{id}"))
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn update_job(&self, record: &JobRecord) -> Result<()> {
        self.put_job(record).await
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        self.kv_delete(&format!("jobs/{id}")).await
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.kv_list("jobs")
            .await?
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }

    async fn put_history(&self, record: &HistoryRecord) -> Result<()> {
        let body = serde_json::to_string(record)?;
        self.kv_put(&format!("history/{}", record.id), &body).await
    }

    async fn list_history(&self, limit: usize, offset: usize) -> Result<(Vec<HistoryRecord>, usize)> {
        let mut records: Vec<HistoryRecord> = self
            .kv_list("history")
            .await?
            .iter()
            .map(|body| serde_json::from_str(body))
            .collect::<std::result::Result<_, _>>()?;
        records.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        let total = records.len();
        let page = records.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn cleanup_history(&self, max_age: Duration) -> Result<usize> {
        let cutoff = chrono::Utc::now() - max_age;
        let records: Vec<HistoryRecord> = self
            .kv_list("history")
            .await?
            .iter()
            .map(|body| serde_json::from_str(body))
            .collect::<std::result::Result<_, _>>()?;
        let mut removed = 0;
        for record in records {
            if record.finished_at < cutoff {
                self.kv_delete(&format!("history/{}", record.id)).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<String> {
        #[derive(serde::Serialize)]
        struct SessionCreateRequest {
            #[serde(rename = "TTL")]
            ttl: String,
            #[serde(rename = "Behavior")]
            behavior: &'static str,
        }
        #[derive(Deserialize)]
        struct SessionCreateResponse {
            #[serde(rename = "ID")]
            id: String,
        }

        let create_url = format!("{}/v1/session/create", self.address.trim_end_matches('/'));
        let response = self
            .request(self.http.put(create_url))
            .json(&SessionCreateRequest {
                ttl: format!("{}s", ttl.num_seconds().max(10)),
                behavior: "release",
            })
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Backend(format!(
                "consul session create returned {}",
                response.status()
            )));
        }
        let session: SessionCreateResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut lock_url = self.kv_url(&format!("locks/{key}"));
        lock_url.push_str(if lock_url.contains('?') { "&" } else { "?" });
        lock_url.push_str(&format!("acquire={}", session.id));
        let response = self
            .request(self.http.put(lock_url))
            .body(session.id.clone())
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Backend(format!(
                "consul acquire returned {}",
                response.status()
            )));
        }
        let acquired: bool = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if !acquired {
            // Clean up the session we just created; we don't hold the lock.
            let _ = self
                .request(
                    self.http
                        .put(format!("{}/v1/session/destroy/{}", self.address.trim_end_matches('/'), session.id)),
                )
                .send()
                .await;
            return Err(StoreError::Held);
        }
        Ok(session.id)
    }

    async fn get_config(&self, name: &str) -> Result<Option<String>> {
        self.kv_get(&format!("config/{name}")).await
    }

    async fn put_config(&self, name: &str, value: &str) -> Result<()> {
        self.kv_put(&format!("config/{name}"), value).await
    }

    async fn release_lock(&self, key: &str, session_id: &str) {
        let mut lock_url = self.kv_url(&format!("locks/{key}"));
        lock_url.push_str(if lock_url.contains('?') { "&" } else { "?" });
        lock_url.push_str(&format!("release={session_id}"));
        let _ = self.request(self.http.put(lock_url)).send().await;

        let destroy_url = format!(
            "{}/v1/session/destroy/{}",
            self.address.trim_end_matches('/'),
            session_id
        );
        let _ = self.request(self.http.put(destroy_url)).send().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_url_includes_prefix_and_datacenter() {
        let store = ConsulStore::new("http://consul:8500", "buildpilot")
            .with_datacenter("dc1");
        assert_eq!(
            store.kv_url("jobs/abc"),
            "http://consul:8500/v1/kv/buildpilot/jobs/abc?dc=dc1"
        );
    }
}
