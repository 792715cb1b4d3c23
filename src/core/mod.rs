//! Core data types: sessions, artifacts, reports and their writers.

pub mod artifacts;
pub mod report;
pub mod session;
pub mod writers;

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

pub use artifacts::{ArtifactResolver, ArtifactSet, Eligibility, IneligibleReason};
pub use report::{
    BatchReport, SessionOutcome, SessionRecord, StageFailure, StageKind, StageRecord, StageResult,
};
pub use session::{locate_sessions, Session, SessionIter};
pub use writers::{write_report, write_report_csv, write_report_yaml, WriteError};

/// Errors that abort a whole batch.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Batch root not found or not a directory: {0}")]
    RootNotFound(PathBuf),

    #[error("Failed to read batch root: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(String),
}
