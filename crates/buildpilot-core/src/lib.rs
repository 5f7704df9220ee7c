//! Core domain types and error taxonomy for BuildPilot.
//!
//! This crate contains:
//! - Job identifiers
//! - Job configuration, job record and pipeline status types
//! - The error taxonomy shared by every other crate in the workspace

pub mod error;
pub mod id;
pub mod job;

pub use error::{Error, Result};
pub use id::JobId;
pub use job::{
    HistoryRecord, JobConfig, JobLogs, JobMetrics, JobRecord, JobStatus, Phase, PhaseLogs,
    ResourceLimits, ResourceSpec, SchedulerIds, SecretBinding, TestConfig, WebhookConfig,
    resolve_resources,
};
