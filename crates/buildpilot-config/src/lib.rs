//! Process-wide configuration for BuildPilot.
//!
//! A single immutable [`Config`] is read once at startup (see
//! [`Config::parse`], built on `clap`'s `env` feature the same way
//! `buildpilot-cli` reads its own flags). Anything that needs to change
//! without a restart lives in the record store under `<prefix>/config/<name>`
//! and is reached through [`RuntimeConfigStore`] instead.

pub mod error;
pub mod runtime;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use runtime::RuntimeConfigStore;
pub use system::Config;
