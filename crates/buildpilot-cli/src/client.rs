//! Minimal JSON-RPC 2.0 client: one request, one response, no batching.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(base_url: &str) -> Self {
        let url = format!("{}/rpc", base_url.trim_end_matches('/'));
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    /// Sends `method` with `params` and returns the `result` value, or an
    /// error built from the JSON-RPC `error.message` on failure.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.url))?;

        let envelope: Value = response
            .json()
            .await
            .context("server returned a non-JSON response")?;

        if let Some(error) = envelope.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            bail!("{message}");
        }

        match envelope.get("result") {
            Some(result) => Ok(result.clone()),
            None => bail!("response carried neither \"result\" nor \"error\""),
        }
    }
}
