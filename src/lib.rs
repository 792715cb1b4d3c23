//! Batch pipeline for handheld LiDAR capture sessions.
//!
//! This crate provides tools for:
//! - Locating capture sessions (one directory each) under a batch root
//! - Resolving per-session inputs: native point cloud, prior LAS, odometry log
//! - Driving external convert, filter and rotate tools in a fixed stage order
//! - Reporting what ran, what was skipped and what failed, per session
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use lidar_pipeline::{processors::{BatchRunner, ProcessInvoker}, PipelineConfig};
//!
//! let config = PipelineConfig::default();
//! let invoker = ProcessInvoker::new();
//! let report = BatchRunner::new(&config, &invoker)
//!     .unwrap()
//!     .run(Path::new("captures"))
//!     .unwrap();
//! print!("{}", report.render_trace());
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;

pub use config::{FailurePolicy, PipelineConfig, ToolSpec};
pub use crate::core::{BatchReport, PipelineError, Session, SessionOutcome, StageKind, StageResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
