//! The per-job pipeline state machine and the process-wide coordinator that
//! dispatches, tracks and tears down pipelines.

pub mod coordinator;
pub mod phase;
pub mod pipeline;

pub use coordinator::{Coordinator, JobStatusView};
pub use pipeline::PipelineDeps;
