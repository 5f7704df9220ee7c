//! Vault KV v2 HTTP client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{SecretError, SecretStore, SecretValue, Result};

/// Thin client over Vault's KV v2 secrets engine, talking to `addr` with a
/// static token. Paths passed to `SecretStore` methods are the logical
/// secret path (e.g. `secret/git/my-org`), not the `data/`/`metadata/`
/// mount-prefixed HTTP path -- that prefixing happens here.
pub struct VaultClient {
    http: reqwest::Client,
    addr: String,
    token: String,
    mount: String,
}

impl VaultClient {
    pub fn new(addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_mount(addr, token, "secret")
    }

    pub fn with_mount(addr: impl Into<String>, token: impl Into<String>, mount: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr: addr.into(),
            token: token.into(),
            mount: mount.into(),
        }
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/data/{}",
            self.addr.trim_end_matches('/'),
            self.mount,
            path.trim_start_matches('/')
        )
    }

    fn metadata_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/metadata/{}",
            self.addr.trim_end_matches('/'),
            self.mount,
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Deserialize)]
struct VaultReadResponse {
    data: VaultReadData,
}

#[derive(Debug, Deserialize)]
struct VaultReadData {
    data: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct VaultListResponse {
    data: VaultListData,
}

#[derive(Debug, Deserialize)]
struct VaultListData {
    keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct VaultWriteRequest<'a> {
    data: &'a HashMap<String, String>,
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn get(&self, path: &str) -> Result<SecretValue> {
        let response = self
            .http
            .get(self.data_url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| SecretError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SecretError::NotFound(path.to_string()));
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SecretError::Backend(body));
        }

        let parsed: VaultReadResponse = response
            .json()
            .await
            .map_err(|e| SecretError::Parse(e.to_string()))?;

        if parsed.data.data.is_empty() {
            return Err(SecretError::NotFound(path.to_string()));
        }
        if parsed.data.data.len() == 1 {
            if let Some(value) = parsed.data.data.get("value") {
                return Ok(SecretValue::String(value.clone()));
            }
        }
        Ok(SecretValue::Map(parsed.data.data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let response = self
            .http
            .request(
                reqwest::Method::from_bytes(b"LIST").unwrap(),
                self.metadata_url(prefix),
            )
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| SecretError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SecretError::Backend(body));
        }

        let parsed: VaultListResponse = response
            .json()
            .await
            .map_err(|e| SecretError::Parse(e.to_string()))?;
        Ok(parsed.data.keys)
    }

    async fn set(&self, path: &str, value: SecretValue) -> Result<()> {
        let map = match value {
            SecretValue::String(s) => HashMap::from([("value".to_string(), s)]),
            SecretValue::Map(m) => m,
        };
        let response = self
            .http
            .post(self.data_url(path))
            .header("X-Vault-Token", &self.token)
            .json(&VaultWriteRequest { data: &map })
            .send()
            .await
            .map_err(|e| SecretError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SecretError::Backend(body));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.metadata_url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| SecretError::Request(e.to_string()))?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(SecretError::Backend(body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_strips_leading_slash() {
        let client = VaultClient::new("http://vault:8200", "tok");
        assert_eq!(
            client.data_url("/git/my-org"),
            "http://vault:8200/v1/secret/data/git/my-org"
        );
    }

    #[test]
    fn metadata_url_uses_custom_mount() {
        let client = VaultClient::with_mount("http://vault:8200", "tok", "kv");
        assert_eq!(
            client.metadata_url("git/my-org"),
            "http://vault:8200/v1/kv/metadata/git/my-org"
        );
    }
}
