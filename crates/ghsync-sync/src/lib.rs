//! Reconciliation of normalized GitHub records into Notion databases.
//!
//! The [`engine::ReconciliationEngine`] is the only component that writes to
//! the target; everything else in this crate feeds it: schema introspection,
//! property coercion, identity resolution and the run pipeline around it.

use ghsync_adapters::SourceFetchError;
use thiserror::Error;

pub mod coerce;
pub mod config;
pub mod engine;
pub mod jobs;
pub mod layout;
pub mod pipeline;
pub mod reports;
pub mod resolve;
pub mod schema;
pub mod target;

pub use config::{ConfigError, JobRequest, SyncConfig};
pub use engine::ReconciliationEngine;
pub use pipeline::{JobReport, SyncPipeline};
pub use schema::SchemaUnavailableError;
pub use target::{NotionApi, TargetApi, TargetError};

pub const CRATE_NAME: &str = "ghsync-sync";

/// Failures that abort a whole job run. Per-item failures never surface here;
/// they are recorded in the run's summary instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    SourceFetch(#[from] SourceFetchError),
    #[error(transparent)]
    SchemaUnavailable(#[from] SchemaUnavailableError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}
