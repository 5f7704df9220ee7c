//! The process-wide configuration value, read once at startup.

use clap::Parser;
use std::time::Duration;

/// Every key documented for the service's environment, loaded with
/// `clap`'s `env` feature the same way `buildpilot-cli` reads `--url`.
/// One immutable value lives for the life of the process; anything
/// runtime-tunable goes through [`crate::RuntimeConfigStore`] instead.
#[derive(Debug, Clone, Parser)]
#[command(name = "buildpilot-server", about = "Build-orchestration service")]
pub struct Config {
    /// Port the JSON-RPC HTTP surface listens on.
    #[arg(long = "server-port", env = "BUILDPILOT_SERVER_PORT", default_value_t = 8080)]
    pub server_port: u16,

    /// Value returned in `Access-Control-Allow-Origin` for CORS preflight.
    #[arg(
        long = "server-cors-origin",
        env = "BUILDPILOT_SERVER_CORS_ORIGIN",
        default_value = "*"
    )]
    pub server_cors_origin: String,

    /// Base URL of the Nomad HTTP API.
    #[arg(
        long = "scheduler-address",
        env = "BUILDPILOT_SCHEDULER_ADDRESS",
        default_value = "http://127.0.0.1:4646"
    )]
    pub scheduler_address: String,

    /// Nomad region, if the cluster is multi-region.
    #[arg(long = "scheduler-region", env = "BUILDPILOT_SCHEDULER_REGION")]
    pub scheduler_region: Option<String>,

    /// Datacenter the rendered job specs target.
    #[arg(
        long = "scheduler-datacenter",
        env = "BUILDPILOT_SCHEDULER_DATACENTER",
        default_value = "dc1"
    )]
    pub scheduler_datacenter: String,

    /// Base URL of the Consul agent/cluster backing the record store.
    #[arg(
        long = "kv-address",
        env = "BUILDPILOT_KV_ADDRESS",
        default_value = "http://127.0.0.1:8500"
    )]
    pub kv_address: String,

    /// Consul ACL token, if the cluster requires one.
    #[arg(long = "kv-token", env = "BUILDPILOT_KV_TOKEN")]
    pub kv_token: Option<String>,

    /// Consul datacenter to address.
    #[arg(long = "kv-datacenter", env = "BUILDPILOT_KV_DATACENTER")]
    pub kv_datacenter: Option<String>,

    /// Prefix under which every job/history/lock/config key is namespaced.
    #[arg(
        long = "kv-key-prefix",
        env = "BUILDPILOT_KV_KEY_PREFIX",
        default_value = "buildpilot"
    )]
    pub kv_key_prefix: String,

    /// Base URL of the Vault cluster.
    #[arg(
        long = "secret-store-address",
        env = "BUILDPILOT_SECRET_STORE_ADDRESS",
        default_value = "http://127.0.0.1:8200"
    )]
    pub secret_store_address: String,

    /// Vault token used to read/write secrets.
    #[arg(long = "secret-store-token", env = "BUILDPILOT_SECRET_STORE_TOKEN")]
    pub secret_store_token: Option<String>,

    /// Ceiling, in seconds, for the build phase.
    #[arg(
        long = "build-timeout",
        env = "BUILDPILOT_BUILD_TIMEOUT_SECS",
        default_value_t = 1800
    )]
    pub build_timeout_secs: u64,

    /// Ceiling, in seconds, for the test phase.
    #[arg(
        long = "test-timeout",
        env = "BUILDPILOT_TEST_TIMEOUT_SECS",
        default_value_t = 900
    )]
    pub test_timeout_secs: u64,

    /// Ceiling, in seconds, for the publish phase.
    #[arg(
        long = "publish-timeout",
        env = "BUILDPILOT_PUBLISH_TIMEOUT_SECS",
        default_value_t = 600
    )]
    pub publish_timeout_secs: u64,

    /// Whether the metrics endpoint is exposed.
    #[arg(
        long = "monitoring-enabled",
        env = "BUILDPILOT_MONITORING_ENABLED",
        default_value_t = true
    )]
    pub monitoring_enabled: bool,

    /// Port the metrics endpoint listens on, when enabled.
    #[arg(
        long = "monitoring-metrics-port",
        env = "BUILDPILOT_MONITORING_METRICS_PORT",
        default_value_t = 9090
    )]
    pub monitoring_metrics_port: u16,

    /// Age, in days, after which a terminal history record is eligible for cleanup.
    #[arg(
        long = "history-max-age-days",
        env = "BUILDPILOT_HISTORY_MAX_AGE_DAYS",
        default_value_t = 90
    )]
    pub history_max_age_days: i64,
}

impl Config {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn history_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.history_max_age_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_with_no_args() {
        let config = Config::parse_from(["buildpilot-server"]);
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.kv_key_prefix, "buildpilot");
        assert_eq!(config.build_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn env_overrides_defaults() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("BUILDPILOT_SERVER_PORT", "9999");
        }
        let config = Config::parse_from(["buildpilot-server"]);
        assert_eq!(config.server_port, 9999);
        unsafe {
            std::env::remove_var("BUILDPILOT_SERVER_PORT");
        }
    }
}
