//! Per-session artifact discovery.
//!
//! The resolver probes a session directory (read-only, non-recursive) for:
//! - a prior LAS file, matched by extension, never one of the canonical outputs
//! - the native point cloud at a fixed relative path
//! - an odometry log, matched by a case-insensitive name pattern
//!
//! When several files match, the first in lexicographic order wins.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::config::{ConfigError, LayoutConfig};

/// Why a session cannot be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligibleReason {
    MissingOdometry,
    MissingPointCloud,
    MissingAll,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::MissingOdometry => "missing odometry log",
            Self::MissingPointCloud => "missing LAS/PCD",
            Self::MissingAll => "missing LAS/PCD and odometry log",
        };
        f.write_str(text)
    }
}

/// Result of the eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

/// Snapshot of the inputs and outputs present in one session directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactSet {
    /// Prior LAS input, if any.
    pub las: Option<PathBuf>,
    /// Native point cloud, if any.
    pub point_cloud: Option<PathBuf>,
    /// Odometry log, if any.
    pub odometry: Option<PathBuf>,
    /// Whether the canonical filtered output already exists.
    pub filtered_output_exists: bool,
    /// Whether the canonical rotated output already exists.
    pub rotated_output_exists: bool,
}

impl ArtifactSet {
    /// A session is eligible when it has an odometry log and at least one
    /// point cloud source (prior LAS or native).
    pub fn eligibility(&self) -> Eligibility {
        let has_cloud = self.las.is_some() || self.point_cloud.is_some();
        match (has_cloud, self.odometry.is_some()) {
            (true, true) => Eligibility::Eligible,
            (true, false) => Eligibility::Ineligible(IneligibleReason::MissingOdometry),
            (false, true) => Eligibility::Ineligible(IneligibleReason::MissingPointCloud),
            (false, false) => Eligibility::Ineligible(IneligibleReason::MissingAll),
        }
    }

    #[inline]
    pub fn is_eligible(&self) -> bool {
        self.eligibility() == Eligibility::Eligible
    }
}

/// Probes session directories according to a [`LayoutConfig`].
#[derive(Debug, Clone)]
pub struct ArtifactResolver {
    layout: LayoutConfig,
    odometry_pattern: Regex,
}

impl ArtifactResolver {
    pub fn new(layout: &LayoutConfig) -> Result<Self, ConfigError> {
        let pattern = format!(
            r"^{}.*\.{}$",
            regex::escape(&layout.odometry_prefix),
            regex::escape(&layout.odometry_extension)
        );
        let odometry_pattern = RegexBuilder::new(&pattern).case_insensitive(true).build()?;

        Ok(Self {
            layout: layout.clone(),
            odometry_pattern,
        })
    }

    pub fn layout(&self) -> &LayoutConfig {
        &self.layout
    }

    /// Probe `session_dir` and return what it contains.
    ///
    /// An unreadable directory yields an empty set, which makes the session
    /// ineligible rather than aborting the batch.
    pub fn resolve(&self, session_dir: &Path) -> ArtifactSet {
        let files = list_files(session_dir);
        let layout = &self.layout;

        let is_canonical_output = |name: &str| {
            name.eq_ignore_ascii_case(&layout.filtered_name)
                || name.eq_ignore_ascii_case(&layout.rotated_name)
        };

        let las = files
            .iter()
            .find(|(name, path)| {
                has_extension(path, &layout.las_extension) && !is_canonical_output(name)
            })
            .map(|(_, path)| path.clone());

        let point_cloud = Some(session_dir.join(&layout.point_cloud_name)).filter(|p| p.is_file());

        let odometry_candidates: Vec<&(String, PathBuf)> = files
            .iter()
            .filter(|(name, _)| self.odometry_pattern.is_match(name))
            .collect();

        // The canonical copy only counts when nothing else matches.
        let odometry = odometry_candidates
            .iter()
            .find(|(name, _)| *name != layout.odometry_copy_name)
            .or_else(|| odometry_candidates.first())
            .map(|(_, path)| path.clone());

        ArtifactSet {
            las,
            point_cloud,
            odometry,
            filtered_output_exists: session_dir.join(&layout.filtered_name).is_file(),
            rotated_output_exists: session_dir.join(&layout.rotated_name).is_file(),
        }
    }
}

/// Regular files directly inside `dir`, sorted by name.
fn list_files(dir: &Path) -> Vec<(String, PathBuf)> {
    let mut files: Vec<(String, PathBuf)> = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            Some((name, path))
        })
        .collect();

    files.sort();
    files
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}
