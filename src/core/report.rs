//! Per-session stage outcomes and the batch-level report.

use std::fmt::{self, Write as _};
use std::path::PathBuf;
use std::time::Duration;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

use super::artifacts::{ArtifactSet, IneligibleReason};
use super::session::Session;
use crate::processors::invoker::ToolError;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Convert,
    Filter,
    Finalize,
    Rotate,
    Cleanup,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Convert => "convert",
            Self::Filter => "filter",
            Self::Finalize => "finalize",
            Self::Rotate => "rotate",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why a stage that ran did not succeed.
#[derive(Debug, Error)]
pub enum StageFailure {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("tool exited successfully but did not produce {0}")]
    MissingOutput(PathBuf),

    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove previous output {path}: {source}")]
    StaleOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove temporary {path}: {source}")]
    TemporaryCleanupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session deadline exceeded before stage started")]
    DeadlineExceeded,
}

/// Outcome of one stage. Written once, never mutated.
#[derive(Debug)]
pub enum StageResult {
    Skipped(String),
    Succeeded,
    Failed(StageFailure),
}

impl StageResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Skipped(_) => "skipped",
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Self::Skipped(reason) => reason.clone(),
            Self::Succeeded => String::new(),
            Self::Failed(failure) => failure.to_string(),
        }
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    #[inline]
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl Serialize for StageResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("StageResult", 2)?;
        state.serialize_field("status", self.status())?;
        state.serialize_field("detail", &self.detail())?;
        state.end()
    }
}

#[derive(Debug, Serialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub result: StageResult,
}

/// What happened to a session as a whole.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionOutcome {
    Ineligible(IneligibleReason),
    Processed(Vec<StageRecord>),
    Cancelled,
}

impl SessionOutcome {
    pub fn stages(&self) -> &[StageRecord] {
        match self {
            Self::Processed(stages) => stages,
            _ => &[],
        }
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stages()
            .iter()
            .find(|r| r.stage == kind)
            .map(|r| &r.result)
    }

    pub fn has_failure(&self) -> bool {
        self.stages().iter().any(|r| r.result.is_failed())
    }
}

/// One line of the batch report.
#[derive(Debug, Serialize)]
pub struct SessionRecord {
    pub name: String,
    pub path: PathBuf,
    pub artifacts: Option<ArtifactSet>,
    pub outcome: SessionOutcome,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl SessionRecord {
    pub fn new(
        session: &Session,
        artifacts: Option<ArtifactSet>,
        outcome: SessionOutcome,
        elapsed: Duration,
    ) -> Self {
        Self {
            name: session.name.clone(),
            path: session.path.clone(),
            artifacts,
            outcome,
            elapsed,
        }
    }

    pub fn cancelled(session: &Session) -> Self {
        Self::new(session, None, SessionOutcome::Cancelled, Duration::ZERO)
    }
}

/// Aggregated outcome of a batch run.
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub root: PathBuf,
    pub sessions: Vec<SessionRecord>,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            sessions: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Append a finished session.
    pub fn push(&mut self, record: SessionRecord) {
        self.sessions.push(record);
    }

    /// Order sessions by name, matching locator order.
    pub fn sort(&mut self) {
        self.sessions.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn session(&self, name: &str) -> Option<&SessionRecord> {
        self.sessions.iter().find(|s| s.name == name)
    }

    pub fn processed_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| matches!(s.outcome, SessionOutcome::Processed(_)))
            .count()
    }

    pub fn ineligible_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| matches!(s.outcome, SessionOutcome::Ineligible(_)))
            .count()
    }

    pub fn cancelled_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| matches!(s.outcome, SessionOutcome::Cancelled))
            .count()
    }

    /// Sessions with at least one failed stage.
    pub fn failed_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.outcome.has_failure())
            .count()
    }

    /// Human-readable per-session, per-stage trace.
    pub fn render_trace(&self) -> String {
        let mut out = String::new();

        for record in &self.sessions {
            match &record.outcome {
                SessionOutcome::Ineligible(reason) => {
                    let _ = writeln!(out, "[{}] skipped: {}", record.name, reason);
                }
                SessionOutcome::Cancelled => {
                    let _ = writeln!(out, "[{}] cancelled", record.name);
                }
                SessionOutcome::Processed(stages) => {
                    let failed = stages.iter().filter(|s| s.result.is_failed()).count();
                    let ok = stages.iter().filter(|s| s.result.is_succeeded()).count();
                    let _ = writeln!(
                        out,
                        "[{}] processed in {:.2?} ({} ok, {} skipped, {} failed)",
                        record.name,
                        record.elapsed,
                        ok,
                        stages.len() - ok - failed,
                        failed
                    );
                    for stage in stages {
                        let detail = stage.result.detail();
                        if detail.is_empty() {
                            let _ = writeln!(out, "    {:<9} {}", stage.stage, stage.result.status());
                        } else {
                            let _ = writeln!(
                                out,
                                "    {:<9} {}: {}",
                                stage.stage,
                                stage.result.status(),
                                detail
                            );
                        }
                    }
                }
            }
        }

        out
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}
