//! Per-session stage pipeline.
//!
//! Eligible sessions go through a fixed sequence:
//!
//! ```text
//! Start -> (Convert | skip) -> Filter -> Finalize -> [Rotate] -> Cleanup -> End
//! ```
//!
//! Every stage decides on its own whether to run, and its outcome is recorded
//! exactly once. Cleanup always runs and removes only a temporary LAS that
//! Convert produced during this run.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{FailurePolicy, PipelineConfig};
use crate::core::artifacts::{ArtifactSet, Eligibility};
use crate::core::report::{SessionOutcome, StageFailure, StageKind, StageRecord, StageResult};
use crate::core::session::Session;
use crate::processors::invoker::{ToolInvocation, ToolInvoker, ToolKind};

const PRIOR_LAS_PRESENT: &str = "prior LAS present";
const FILTERED_EXISTS: &str = "filtered output already exists";
const NO_POINT_CLOUD: &str = "no native point cloud";
const NO_LAS_INPUT: &str = "no LAS input available";
const ODOMETRY_CANONICAL: &str = "odometry already canonical";
const ROTATED_EXISTS: &str = "rotated output already exists";
const NO_FILTERED_INPUT: &str = "no filtered output to rotate";
const NO_TEMPORARY: &str = "no temporary LAS";

/// One planned step, used by dry inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
    pub stage: StageKind,
    /// `None` when the stage would run, otherwise the skip reason.
    pub skip: Option<String>,
}

/// Runs the stage sequence for one session at a time.
pub struct SessionPipeline<'a> {
    config: &'a PipelineConfig,
    invoker: &'a dyn ToolInvoker,
}

impl<'a> SessionPipeline<'a> {
    pub fn new(config: &'a PipelineConfig, invoker: &'a dyn ToolInvoker) -> Self {
        Self { config, invoker }
    }

    /// Process one session. Ineligible sessions perform no stage actions.
    pub fn run(&self, session: &Session, artifacts: &ArtifactSet) -> SessionOutcome {
        if let Eligibility::Ineligible(reason) = artifacts.eligibility() {
            info!("[{}] skipped: {}", session.name, reason);
            return SessionOutcome::Ineligible(reason);
        }

        let mut run = SessionRun::new(self, session, artifacts);

        run.stage(StageKind::Convert, SessionRun::convert);
        run.stage(StageKind::Filter, SessionRun::filter);
        run.stage(StageKind::Finalize, SessionRun::finalize);
        if self.config.run.rotate {
            run.stage(StageKind::Rotate, SessionRun::rotate);
        }
        run.cleanup();

        SessionOutcome::Processed(run.records)
    }

    /// Secondary pipeline: rotate the canonical filtered output only.
    pub fn run_rotation(&self, session: &Session, artifacts: &ArtifactSet) -> SessionOutcome {
        let mut run = SessionRun::new(self, session, artifacts);
        run.stage(StageKind::Rotate, SessionRun::rotate);
        SessionOutcome::Processed(run.records)
    }

    /// Describe what `run` would do without modifying the filesystem.
    pub fn plan(&self, session: &Session, artifacts: &ArtifactSet) -> Vec<PlannedStage> {
        if !artifacts.is_eligible() {
            return Vec::new();
        }

        let las_after_convert =
            artifacts.las.is_some() || self.convert_skip(artifacts).is_none();

        let mut plan = vec![
            PlannedStage {
                stage: StageKind::Convert,
                skip: self.convert_skip(artifacts).map(str::to_string),
            },
            PlannedStage {
                stage: StageKind::Filter,
                skip: self
                    .filter_skip(artifacts, las_after_convert)
                    .map(str::to_string),
            },
            PlannedStage {
                stage: StageKind::Finalize,
                skip: self.finalize_skip(session, artifacts).map(str::to_string),
            },
        ];

        if self.config.run.rotate {
            let filtered_after = artifacts.filtered_output_exists
                || self.filter_skip(artifacts, las_after_convert).is_none();
            plan.push(PlannedStage {
                stage: StageKind::Rotate,
                skip: self.rotate_skip(artifacts, filtered_after).map(str::to_string),
            });
        }

        let produces_temporary = artifacts.las.is_none() && self.convert_skip(artifacts).is_none();
        plan.push(PlannedStage {
            stage: StageKind::Cleanup,
            skip: (!produces_temporary).then(|| NO_TEMPORARY.to_string()),
        });

        debug!("[{}] planned {} stages", session.name, plan.len());
        plan
    }

    fn overwrite(&self) -> bool {
        self.config.run.overwrite
    }

    fn convert_skip(&self, artifacts: &ArtifactSet) -> Option<&'static str> {
        if artifacts.las.is_some() {
            Some(PRIOR_LAS_PRESENT)
        } else if artifacts.filtered_output_exists && !self.overwrite() {
            Some(FILTERED_EXISTS)
        } else if artifacts.point_cloud.is_none() {
            Some(NO_POINT_CLOUD)
        } else {
            None
        }
    }

    fn filter_skip(&self, artifacts: &ArtifactSet, has_las: bool) -> Option<&'static str> {
        if artifacts.filtered_output_exists && !self.overwrite() {
            Some(FILTERED_EXISTS)
        } else if !has_las {
            Some(NO_LAS_INPUT)
        } else {
            None
        }
    }

    /// Skip only when the odometry source already is the canonical file.
    fn finalize_skip(
        &self,
        session: &Session,
        artifacts: &ArtifactSet,
    ) -> Option<&'static str> {
        let source = artifacts.odometry.as_deref()?;
        let dest = session.file(&self.config.layout.odometry_copy_name);

        let same_file = source == dest
            || matches!(
                (fs::canonicalize(source), fs::canonicalize(&dest)),
                (Ok(a), Ok(b)) if a == b
            );

        same_file.then_some(ODOMETRY_CANONICAL)
    }

    fn rotate_skip(&self, artifacts: &ArtifactSet, has_filtered: bool) -> Option<&'static str> {
        if artifacts.rotated_output_exists && !self.overwrite() {
            Some(ROTATED_EXISTS)
        } else if !has_filtered {
            Some(NO_FILTERED_INPUT)
        } else {
            None
        }
    }
}

/// Mutable state of one session while its stages execute.
struct SessionRun<'p, 'a> {
    pipeline: &'p SessionPipeline<'a>,
    session: &'p Session,
    artifacts: &'p ArtifactSet,
    records: Vec<StageRecord>,
    deadline: Option<Instant>,
    halted_after: Option<StageKind>,
    /// LAS produced by Convert in this run; owned and removed by Cleanup.
    temporary_las: Option<PathBuf>,
}

impl<'p, 'a> SessionRun<'p, 'a> {
    fn new(
        pipeline: &'p SessionPipeline<'a>,
        session: &'p Session,
        artifacts: &'p ArtifactSet,
    ) -> Self {
        let deadline = pipeline
            .config
            .run
            .session_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        Self {
            pipeline,
            session,
            artifacts,
            records: Vec::with_capacity(5),
            deadline,
            halted_after: None,
            temporary_las: None,
        }
    }

    fn config(&self) -> &'a PipelineConfig {
        self.pipeline.config
    }

    /// Run (or refuse to run) one stage and record its result.
    fn stage(&mut self, kind: StageKind, body: fn(&mut Self) -> StageResult) {
        let result = if let Some(failed) = self.halted_after {
            StageResult::skipped(format!("halted after {} failure", failed))
        } else if self.deadline.map_or(false, |d| Instant::now() >= d) {
            StageResult::Failed(StageFailure::DeadlineExceeded)
        } else {
            body(self)
        };

        self.record(kind, result);
    }

    fn record(&mut self, kind: StageKind, result: StageResult) {
        match &result {
            StageResult::Succeeded => info!("[{}] {} succeeded", self.session.name, kind),
            StageResult::Skipped(reason) => {
                info!("[{}] {} skipped: {}", self.session.name, kind, reason)
            }
            StageResult::Failed(failure) => {
                warn!("[{}] {} failed: {}", self.session.name, kind, failure);
                if self.config().run.failure_policy == FailurePolicy::HaltSession
                    && kind != StageKind::Cleanup
                    && self.halted_after.is_none()
                {
                    self.halted_after = Some(kind);
                }
            }
        }

        self.records.push(StageRecord {
            stage: kind,
            result,
        });
    }

    /// Timeout for the next tool call: the tool limit capped by what is left
    /// of the session budget.
    fn tool_timeout(&self) -> Option<Duration> {
        let tool = self.config().run.tool_timeout_secs.map(Duration::from_secs);
        let remaining = self
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()));

        match (tool, remaining) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (t, r) => t.or(r),
        }
    }

    /// Invoke a tool and require a fresh `output` afterwards. A previous
    /// output is removed first so it cannot stand in for the tool's own.
    fn invoke(&self, invocation: ToolInvocation, output: &Path) -> StageResult {
        match fs::remove_file(output) {
            Ok(()) => debug!("[{}] removed previous {}", self.session.name, output.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return StageResult::Failed(StageFailure::StaleOutput {
                    path: output.to_path_buf(),
                    source,
                })
            }
        }

        let invocation = invocation.with_timeout(self.tool_timeout());
        let tool = invocation.tool;

        match self.pipeline.invoker.invoke(&invocation).into_result(tool) {
            Err(e) => StageResult::Failed(e.into()),
            Ok(()) if !output.is_file() => {
                StageResult::Failed(StageFailure::MissingOutput(output.to_path_buf()))
            }
            Ok(()) => StageResult::Succeeded,
        }
    }

    fn convert(&mut self) -> StageResult {
        if let Some(reason) = self.pipeline.convert_skip(self.artifacts) {
            return StageResult::skipped(reason);
        }
        let Some(point_cloud) = self.artifacts.point_cloud.as_deref() else {
            return StageResult::skipped(NO_POINT_CLOUD);
        };

        let temporary = temporary_las_path(self.session, self.config());
        let existed_before = temporary.exists();

        let invocation = ToolInvocation::render(
            ToolKind::Convert,
            &self.config().tools.convert,
            point_cloud,
            &temporary,
            None,
        );
        let result = self.invoke(invocation, &temporary);

        // Anything this stage left behind, even partial output, is ours to remove.
        if !existed_before && temporary.exists() {
            self.temporary_las = Some(temporary);
        }

        result
    }

    fn filter(&mut self) -> StageResult {
        let source = self
            .artifacts
            .las
            .clone()
            .or_else(|| self.converted_las());

        if let Some(reason) = self.pipeline.filter_skip(self.artifacts, source.is_some()) {
            return StageResult::skipped(reason);
        }
        let (Some(source), Some(odometry)) = (source, self.artifacts.odometry.as_deref()) else {
            return StageResult::skipped(NO_LAS_INPUT);
        };

        let config = self.config();
        let output = self.session.file(&config.layout.filtered_name);

        let mut invocation = ToolInvocation::render(
            ToolKind::Filter,
            &config.tools.filter,
            &source,
            &output,
            Some(odometry),
        );
        if config.filter.plane_normal {
            invocation = invocation.arg(config.filter.plane_flag.clone());
        }
        if let Some(min) = config.filter.min_height {
            invocation = invocation.arg("--min-height").arg(min.to_string());
        }
        if let Some(max) = config.filter.max_height {
            invocation = invocation.arg("--max-height").arg(max.to_string());
        }

        self.invoke(invocation, &output)
    }

    fn finalize(&mut self) -> StageResult {
        if let Some(reason) = self.pipeline.finalize_skip(self.session, self.artifacts) {
            return StageResult::skipped(reason);
        }
        let Some(odometry) = self.artifacts.odometry.as_deref() else {
            return StageResult::skipped("no odometry log");
        };

        let dest = self.session.file(&self.config().layout.odometry_copy_name);
        match fs::copy(odometry, &dest) {
            Ok(_) => StageResult::Succeeded,
            Err(source) => StageResult::Failed(StageFailure::Copy {
                from: odometry.to_path_buf(),
                to: dest,
                source,
            }),
        }
    }

    fn rotate(&mut self) -> StageResult {
        let config = self.config();
        let input = self.session.file(&config.layout.filtered_name);
        let output = self.session.file(&config.layout.rotated_name);

        if let Some(reason) = self.pipeline.rotate_skip(self.artifacts, input.is_file()) {
            return StageResult::skipped(reason);
        }

        let mut invocation = ToolInvocation::render(
            ToolKind::Rotate,
            &config.tools.rotate,
            &input,
            &output,
            None,
        );
        if let Some(angle) = config.rotate.angle_degrees {
            invocation = invocation.arg("--angle").arg(angle.to_string());
        }

        self.invoke(invocation, &output)
    }

    /// Remove the temporary LAS if, and only if, Convert produced it.
    fn cleanup(&mut self) {
        let result = match self.temporary_las.take() {
            None => StageResult::skipped(NO_TEMPORARY),
            Some(path) => match fs::remove_file(&path) {
                Ok(()) => StageResult::Succeeded,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    StageResult::skipped("temporary LAS already removed")
                }
                Err(source) => {
                    StageResult::Failed(StageFailure::TemporaryCleanupFailed { path, source })
                }
            },
        };

        self.record(StageKind::Cleanup, result);
    }

    /// The temporary LAS, but only once Convert reported success.
    fn converted_las(&self) -> Option<PathBuf> {
        let converted = self
            .records
            .iter()
            .any(|r| r.stage == StageKind::Convert && r.result.is_succeeded());
        if converted {
            self.temporary_las.clone()
        } else {
            None
        }
    }
}

/// `<session>/<session name>.las`, renamed if it would collide with a
/// canonical output.
fn temporary_las_path(session: &Session, config: &PipelineConfig) -> PathBuf {
    let layout = &config.layout;
    let name = format!("{}.{}", session.name, layout.las_extension);

    let collides = name.eq_ignore_ascii_case(&layout.filtered_name)
        || name.eq_ignore_ascii_case(&layout.rotated_name);

    if collides {
        session.file(&format!("{}_converted.{}", session.name, layout.las_extension))
    } else {
        session.file(&name)
    }
}
