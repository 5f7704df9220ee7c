//! Job configuration and job record types — the data model driven by the
//! pipeline engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::id::JobId;
use crate::{Error, Result};

/// Immutable build request, as accepted at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub owner: String,
    pub repo_url: String,
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
    #[serde(default = "default_git_credentials_ref")]
    pub git_credentials_ref: String,
    #[serde(default = "default_dockerfile_path")]
    pub dockerfile_path: String,
    pub image_name: String,
    #[serde(default)]
    pub image_tags: Vec<String>,
    pub registry_url: String,
    pub registry_credentials_ref: String,
    #[serde(default)]
    pub test: Option<TestConfig>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

fn default_git_ref() -> String {
    "main".to_string()
}

fn default_git_credentials_ref() -> String {
    "secret/git/default".to_string()
}

fn default_dockerfile_path() -> String {
    "Dockerfile".to_string()
}

impl JobConfig {
    /// Validate the invariants spelled out for `JobConfig`. Called once at
    /// submission; nothing downstream re-checks these fields.
    pub fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            return Err(Error::Validation("owner is required".into()));
        }
        if self.repo_url.trim().is_empty() {
            return Err(Error::Validation("repo_url is required".into()));
        }
        if self.image_name.trim().is_empty() {
            return Err(Error::Validation("image_name is required".into()));
        }
        if self.registry_url.trim().is_empty() {
            return Err(Error::Validation("registry_url is required".into()));
        }
        if let Some(test) = &self.test {
            if !test.secret_bindings.is_empty() && test.secret_policies.is_empty() {
                return Err(Error::Validation(
                    "test.secret_policies must be set when secret_bindings is non-empty".into(),
                ));
            }
            for binding in &test.secret_bindings {
                if binding.path.trim().is_empty() {
                    return Err(Error::Validation(
                        "secret binding path must not be empty".into(),
                    ));
                }
                if binding.env.is_empty() {
                    return Err(Error::Validation(
                        "secret binding must map at least one field to an env var".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Resolve the tags to publish: explicit tags, or `[job_id]` when none given.
    pub fn resolve_tags(&self, job_id: JobId) -> Vec<String> {
        if self.image_tags.is_empty() {
            vec![job_id.to_string()]
        } else {
            self.image_tags.clone()
        }
    }
}

/// Test-phase configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestConfig {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub entry_point: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub secret_policies: Vec<String>,
    #[serde(default)]
    pub secret_bindings: Vec<SecretBinding>,
}

impl TestConfig {
    /// The test phase is skipped entirely when no commands are configured
    /// and the entry-point probe is disabled.
    pub fn is_skipped(&self) -> bool {
        self.commands.is_empty() && !self.entry_point
    }
}

/// A single secret-store binding mounted as environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretBinding {
    pub path: String,
    /// secret field name -> environment variable name
    pub env: HashMap<String, String>,
}

/// CPU/Memory/Disk limits, either global or for one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub disk: Option<String>,
}

/// Global resource limits plus optional per-phase overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub global: ResourceSpec,
    #[serde(default)]
    pub build: Option<ResourceSpec>,
    #[serde(default)]
    pub test: Option<ResourceSpec>,
    #[serde(default)]
    pub publish: Option<ResourceSpec>,
}

/// Which phase a resource/timeout lookup is resolving for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Build,
    Test,
    Publish,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::Test => "test",
            Phase::Publish => "publish",
        }
    }
}

/// Resolve an effective resource spec for a phase: per-phase override, then
/// the global override, then a built-in default. One function, no scattered
/// precedence logic (see DESIGN.md).
pub fn resolve_resources(
    phase: Phase,
    limits: Option<&ResourceLimits>,
    defaults: &ResourceSpec,
) -> ResourceSpec {
    let Some(limits) = limits else {
        return defaults.clone();
    };
    let per_phase = match phase {
        Phase::Build => &limits.build,
        Phase::Test => &limits.test,
        Phase::Publish => &limits.publish,
    };
    let mut resolved = defaults.clone();
    // Global overrides the built-in default per present field.
    if limits.global.cpu.is_some() {
        resolved.cpu = limits.global.cpu.clone();
    }
    if limits.global.memory.is_some() {
        resolved.memory = limits.global.memory.clone();
    }
    if limits.global.disk.is_some() {
        resolved.disk = limits.global.disk.clone();
    }
    // Per-phase overrides the global.
    if let Some(spec) = per_phase {
        if spec.cpu.is_some() {
            resolved.cpu = spec.cpu.clone();
        }
        if spec.memory.is_some() {
            resolved.memory = spec.memory.clone();
        }
        if spec.disk.is_some() {
            resolved.disk = spec.disk.clone();
        }
    }
    resolved
}

/// Webhook delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_true")]
    pub on_success: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// Pipeline status. Transitions are strictly monotonic except that any
/// non-terminal state may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Building,
    Testing,
    Publishing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Building)
                | (Building, Testing)
                | (Testing, Publishing)
                | (Publishing, Succeeded)
        )
    }
}

/// Ordered log lines for one phase (stdout and stderr interleaved).
pub type PhaseLogs = Vec<String>;

/// Log snapshot for all three phases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobLogs {
    #[serde(default)]
    pub build: PhaseLogs,
    #[serde(default)]
    pub test: PhaseLogs,
    #[serde(default)]
    pub publish: PhaseLogs,
}

impl JobLogs {
    pub fn for_phase(&self, phase: Phase) -> &PhaseLogs {
        match phase {
            Phase::Build => &self.build,
            Phase::Test => &self.test,
            Phase::Publish => &self.publish,
        }
    }

    pub fn for_phase_mut(&mut self, phase: Phase) -> &mut PhaseLogs {
        match phase {
            Phase::Build => &mut self.build,
            Phase::Test => &mut self.test,
            Phase::Publish => &mut self.publish,
        }
    }
}

/// Timing metrics recorded across the lifetime of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetrics {
    pub queue_time: Option<chrono::Duration>,
    pub build_duration: Option<chrono::Duration>,
    pub test_duration: Option<chrono::Duration>,
    pub publish_duration: Option<chrono::Duration>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Scheduler identifiers assigned to each phase, once submitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerIds {
    pub build: Option<String>,
    pub test: Option<String>,
    pub publish: Option<String>,
}

impl SchedulerIds {
    pub fn for_phase(&self, phase: Phase) -> Option<&str> {
        match phase {
            Phase::Build => self.build.as_deref(),
            Phase::Test => self.test.as_deref(),
            Phase::Publish => self.publish.as_deref(),
        }
    }
}

/// The durable record for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub config: JobConfig,
    pub status: JobStatus,
    pub error: Option<String>,
    #[serde(default)]
    pub logs: JobLogs,
    #[serde(default)]
    pub metrics: JobMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduler_ids: SchedulerIds,
    pub commit_sha: Option<String>,
    pub lock_session_id: Option<String>,
}

impl JobRecord {
    pub fn new(id: JobId, config: JobConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            config,
            status: JobStatus::Pending,
            error: None,
            logs: JobLogs::default(),
            metrics: JobMetrics::default(),
            created_at: now,
            updated_at: now,
            scheduler_ids: SchedulerIds::default(),
            commit_sha: None,
            lock_session_id: None,
        }
    }

    /// Move to a new status, enforcing the monotonic-state invariant.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "illegal transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Immutable snapshot of a job retained after the live record is purged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: JobId,
    pub config: JobConfig,
    pub status: JobStatus,
    pub error: Option<String>,
    pub metrics: JobMetrics,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl From<&JobRecord> for HistoryRecord {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            config: record.config.clone(),
            status: record.status,
            error: record.error.clone(),
            metrics: record.metrics.clone(),
            created_at: record.created_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config() -> JobConfig {
        JobConfig {
            owner: "t".into(),
            repo_url: "https://example/r.git".into(),
            git_ref: default_git_ref(),
            git_credentials_ref: default_git_credentials_ref(),
            dockerfile_path: default_dockerfile_path(),
            image_name: "x".into(),
            image_tags: vec!["v1".into()],
            registry_url: "reg/x".into(),
            registry_credentials_ref: "secret/registry/default".into(),
            test: None,
            resource_limits: None,
            webhook: None,
        }
    }

    #[test]
    fn validate_requires_core_fields() {
        let mut config = make_config();
        config.registry_url = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("registry_url"));
    }

    #[test]
    fn validate_requires_policy_when_bindings_present() {
        let mut config = make_config();
        config.test = Some(TestConfig {
            secret_bindings: vec![SecretBinding {
                path: "secret/x".into(),
                env: HashMap::from([("token".into(), "TOKEN".into())]),
            }],
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("secret_policies"));
    }

    #[test]
    fn resolve_tags_defaults_to_job_id() {
        let mut config = make_config();
        config.image_tags.clear();
        let id = JobId::new();
        assert_eq!(config.resolve_tags(id), vec![id.to_string()]);
    }

    #[test]
    fn test_config_skip_detection() {
        let empty = TestConfig::default();
        assert!(empty.is_skipped());

        let with_probe = TestConfig {
            entry_point: true,
            ..Default::default()
        };
        assert!(!with_probe.is_skipped());
    }

    #[test]
    fn status_transitions_are_monotonic() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Building));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Publishing));
        assert!(JobStatus::Testing.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn record_transition_enforces_state_machine() {
        let mut record = JobRecord::new(JobId::new(), make_config());
        record.transition(JobStatus::Building).unwrap();
        assert!(record.transition(JobStatus::Pending).is_err());
        record.transition(JobStatus::Testing).unwrap();
        record.transition(JobStatus::Publishing).unwrap();
        record.transition(JobStatus::Succeeded).unwrap();
    }

    #[test]
    fn resource_resolution_precedence() {
        let defaults = ResourceSpec {
            cpu: Some("500m".into()),
            memory: Some("256Mi".into()),
            disk: None,
        };
        let limits = ResourceLimits {
            global: ResourceSpec {
                cpu: Some("1000m".into()),
                memory: None,
                disk: None,
            },
            build: Some(ResourceSpec {
                cpu: Some("2000m".into()),
                memory: None,
                disk: None,
            }),
            test: None,
            publish: None,
        };
        let build = resolve_resources(Phase::Build, Some(&limits), &defaults);
        assert_eq!(build.cpu.as_deref(), Some("2000m"));
        assert_eq!(build.memory.as_deref(), Some("256Mi"));

        let test = resolve_resources(Phase::Test, Some(&limits), &defaults);
        assert_eq!(test.cpu.as_deref(), Some("1000m"));
    }
}
