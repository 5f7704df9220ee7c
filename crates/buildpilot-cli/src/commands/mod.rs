//! CLI command implementations. Each reads its arguments, makes one RPC
//! call and prints the result as pretty JSON to stdout.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::io::Read;

use crate::client::RpcClient;

fn print_result(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap());
}

/// `submit-job <json|->`: `-` reads the job configuration from stdin.
pub async fn submit_job(client: &RpcClient, json_or_dash: &str) -> Result<()> {
    let raw = if json_or_dash == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read job config from stdin")?;
        buf
    } else {
        json_or_dash.to_string()
    };
    let config: Value = serde_json::from_str(&raw).context("job config is not valid JSON")?;
    let result = client.call("submitJob", config).await?;
    print_result(&result);
    Ok(())
}

pub async fn get_status(client: &RpcClient, job_id: &str) -> Result<()> {
    let result = client.call("getStatus", json!({ "job_id": job_id })).await?;
    print_result(&result);
    Ok(())
}

pub async fn get_logs(client: &RpcClient, job_id: &str, phase: Option<&str>) -> Result<()> {
    let mut params = json!({ "job_id": job_id });
    if let Some(phase) = phase {
        params["phase"] = json!(phase);
    }
    let result = client.call("getLogs", params).await?;
    print_result(&result);
    Ok(())
}

pub async fn kill_job(client: &RpcClient, job_id: &str) -> Result<()> {
    let result = client.call("killJob", json!({ "job_id": job_id })).await?;
    print_result(&result);
    Ok(())
}

pub async fn cleanup(client: &RpcClient, job_id: &str) -> Result<()> {
    let result = client.call("cleanup", json!({ "job_id": job_id })).await?;
    print_result(&result);
    Ok(())
}

pub async fn get_history(client: &RpcClient, limit: u64, offset: u64) -> Result<()> {
    let result = client
        .call("getHistory", json!({ "limit": limit, "offset": offset }))
        .await?;
    print_result(&result);
    Ok(())
}
