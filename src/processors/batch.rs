//! Batch execution across all sessions under a root.
//!
//! Sessions are independent, so with `jobs > 1` they run on a dedicated rayon
//! pool. Each finished session is appended to the report exactly once.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use indicatif::ProgressBar;
use log::{debug, info};
use rayon::prelude::*;

use crate::config::PipelineConfig;
use crate::core::artifacts::ArtifactResolver;
use crate::core::report::{BatchReport, SessionRecord};
use crate::core::session::{locate_sessions, Session};
use crate::core::PipelineError;
use crate::processors::invoker::ToolInvoker;
use crate::processors::pipeline::SessionPipeline;

/// Which stage sequence to run for each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Convert, filter, finalize, optional rotate, cleanup
    Full,
    /// Rotate existing filtered outputs only
    RotateOnly,
}

/// Drives the session pipeline over every session under a root.
pub struct BatchRunner<'a> {
    config: &'a PipelineConfig,
    invoker: &'a dyn ToolInvoker,
    resolver: ArtifactResolver,
    mode: BatchMode,
    cancel: Arc<AtomicBool>,
    progress: Option<ProgressBar>,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        invoker: &'a dyn ToolInvoker,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let resolver = ArtifactResolver::new(&config.layout)?;

        Ok(Self {
            config,
            invoker,
            resolver,
            mode: BatchMode::Full,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        })
    }

    pub fn mode(mut self, mode: BatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Share a cancellation flag; once set, sessions that have not started
    /// are recorded as cancelled. Running tools are left to finish.
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Advance `progress` by one per finished session.
    pub fn progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Process every session under `root`.
    ///
    /// # Errors
    ///
    /// Only batch-level failures abort: a missing root, an unreadable root,
    /// or a worker pool that cannot be built. Per-session problems end up in
    /// the report.
    pub fn run(&self, root: &Path) -> Result<BatchReport, PipelineError> {
        let start = Instant::now();
        let sessions = locate_sessions(root)?;
        let jobs = self.config.run.jobs.max(1);

        if let Some(pb) = &self.progress {
            pb.set_length(sessions.len() as u64);
        }
        info!(
            "Processing {} sessions under {} ({} job{})",
            sessions.len(),
            root.display(),
            jobs,
            if jobs == 1 { "" } else { "s" }
        );

        let mut report = BatchReport::new(root.to_path_buf());

        if jobs == 1 {
            for session in sessions {
                report.push(self.process(&session));
            }
        } else {
            let sessions: Vec<Session> = sessions.collect();
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(jobs)
                .build()
                .map_err(|e| PipelineError::ThreadPool(e.to_string()))?;

            let shared = Mutex::new(report);
            pool.install(|| {
                sessions.par_iter().for_each(|session| {
                    let record = self.process(session);
                    shared
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(record);
                });
            });

            report = shared
                .into_inner()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            report.sort();
        }

        report.elapsed = start.elapsed();
        Ok(report)
    }

    fn process(&self, session: &Session) -> SessionRecord {
        if self.cancel.load(Ordering::SeqCst) {
            debug!("[{}] cancelled before start", session.name);
            return SessionRecord::cancelled(session);
        }

        if let Some(pb) = &self.progress {
            pb.set_message(session.name.clone());
        }

        let start = Instant::now();
        let artifacts = self.resolver.resolve(&session.path);
        debug!("[{}] artifacts: {:?}", session.name, artifacts);

        let pipeline = SessionPipeline::new(self.config, self.invoker);
        let outcome = match self.mode {
            BatchMode::Full => pipeline.run(session, &artifacts),
            BatchMode::RotateOnly => pipeline.run_rotation(session, &artifacts),
        };

        if let Some(pb) = &self.progress {
            pb.inc(1);
        }

        SessionRecord::new(session, Some(artifacts), outcome, start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::{SessionOutcome, StageKind};
    use crate::processors::invoker::{ToolInvocation, ToolKind, ToolStatus};
    use std::fs::{self, File};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Writes each tool's output (third argument of the default templates,
    /// or the one after `-o`) and counts calls.
    #[derive(Default)]
    struct WritingInvoker {
        calls: AtomicUsize,
    }

    impl ToolInvoker for WritingInvoker {
        fn invoke(&self, invocation: &ToolInvocation) -> ToolStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let output = match invocation.tool {
                ToolKind::Filter => {
                    let idx = invocation.args.iter().position(|a| a == "-o").unwrap();
                    PathBuf::from(&invocation.args[idx + 1])
                }
                _ => PathBuf::from(&invocation.args[2]),
            };
            fs::write(output, b"LASF").unwrap();
            ToolStatus::Exited(0)
        }
    }

    fn make_root() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let layout: [(&str, &[&str]); 4] = [
            ("A", &["scans.pcd", "odom_1.txt"]),
            ("B", &["odom.txt"]),
            ("C", &["prior.las", "ODOM.TXT"]),
            ("D", &["scans.pcd"]),
        ];
        for (name, files) in layout {
            let dir = temp_dir.path().join(name);
            fs::create_dir(&dir).unwrap();
            for file in files {
                File::create(dir.join(file)).unwrap();
            }
        }
        File::create(temp_dir.path().join("readme.txt")).unwrap();
        temp_dir
    }

    #[test]
    fn test_batch_scenarios() {
        let root = make_root();
        let config = PipelineConfig::default();
        let invoker = WritingInvoker::default();

        let report = BatchRunner::new(&config, &invoker)
            .unwrap()
            .run(root.path())
            .unwrap();

        assert_eq!(report.sessions.len(), 4);
        assert_eq!(report.processed_count(), 2);
        assert_eq!(report.ineligible_count(), 2);
        assert_eq!(report.failed_count(), 0);

        let a = report.session("A").unwrap();
        assert!(a.outcome.stage(StageKind::Cleanup).unwrap().is_succeeded());
        assert!(root.path().join("A/filtered.las").is_file());
        assert!(root.path().join("A/Odom.txt").is_file());
        assert!(!root.path().join("A/A.las").exists());

        let b = report.session("B").unwrap();
        match &b.outcome {
            SessionOutcome::Ineligible(reason) => assert_eq!(reason.to_string(), "missing LAS/PCD"),
            other => panic!("unexpected outcome {:?}", other),
        }

        // A: convert + filter, C: filter only
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_batch_rerun_makes_no_calls() {
        let root = make_root();
        let config = PipelineConfig::default();

        let first = WritingInvoker::default();
        BatchRunner::new(&config, &first)
            .unwrap()
            .run(root.path())
            .unwrap();

        let second = WritingInvoker::default();
        let report = BatchRunner::new(&config, &second)
            .unwrap()
            .run(root.path())
            .unwrap();

        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.failed_count(), 0);
        assert!(!root.path().join("A/A.las").exists());
    }

    #[test]
    fn test_pooled_matches_sequential_order() {
        let root = make_root();
        let mut config = PipelineConfig::default();
        config.run.jobs = 4;
        let invoker = WritingInvoker::default();

        let report = BatchRunner::new(&config, &invoker)
            .unwrap()
            .run(root.path())
            .unwrap();

        let names: Vec<&str> = report.sessions.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C", "D"]);
        assert_eq!(report.processed_count(), 2);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancelled_before_start() {
        let root = make_root();
        let config = PipelineConfig::default();
        let invoker = WritingInvoker::default();
        let flag = Arc::new(AtomicBool::new(true));

        let report = BatchRunner::new(&config, &invoker)
            .unwrap()
            .cancel_flag(flag)
            .run(root.path())
            .unwrap();

        assert_eq!(report.cancelled_count(), 4);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_root_aborts() {
        let temp_dir = TempDir::new().unwrap();
        let config = PipelineConfig::default();
        let invoker = WritingInvoker::default();

        let result = BatchRunner::new(&config, &invoker)
            .unwrap()
            .run(&temp_dir.path().join("missing"));

        assert!(matches!(result, Err(PipelineError::RootNotFound(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.run.jobs = 0;
        let invoker = WritingInvoker::default();

        assert!(matches!(
            BatchRunner::new(&config, &invoker),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_rotate_only_mode() {
        let root = make_root();
        fs::write(root.path().join("B/filtered.las"), b"LASF").unwrap();
        let config = PipelineConfig::default();
        let invoker = WritingInvoker::default();

        let report = BatchRunner::new(&config, &invoker)
            .unwrap()
            .mode(BatchMode::RotateOnly)
            .run(root.path())
            .unwrap();

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
        assert!(root.path().join("B/Pointcloud.las").is_file());
        let a = report.session("A").unwrap();
        assert_eq!(
            a.outcome.stage(StageKind::Rotate).unwrap().detail(),
            "no filtered output to rotate"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_end_to_end_with_shell_tools() {
        use crate::config::ToolSpec;
        use crate::processors::invoker::ProcessInvoker;

        let root = make_root();
        fs::write(root.path().join("A/scans.pcd"), b"PCD").unwrap();
        let mut config = PipelineConfig::default();
        config.tools.convert = ToolSpec::new(
            "sh",
            &["-c", "cp \"$1\" \"$2\"", "sh", "{input}", "{output}"],
        );
        config.tools.filter = ToolSpec::new(
            "sh",
            &["-c", "cat \"$1\" \"$2\" > \"$3\"", "sh", "{input}", "{odom}", "{output}"],
        );
        config.tools.rotate = ToolSpec::new("sh", &["-c", "exit 4", "sh", "{input}", "{output}"]);
        config.run.rotate = true;
        config.run.tool_timeout_secs = Some(30);
        let invoker = ProcessInvoker::new();

        let report = BatchRunner::new(&config, &invoker)
            .unwrap()
            .run(root.path())
            .unwrap();

        let filtered = fs::read(root.path().join("A/filtered.las")).unwrap();
        assert_eq!(filtered, b"PCD");
        assert!(root.path().join("A/Odom.txt").is_file());
        assert!(!root.path().join("A/A.las").exists());

        let a = report.session("A").unwrap();
        assert_eq!(
            a.outcome.stage(StageKind::Rotate).unwrap().detail(),
            "rotate tool exited with status 4"
        );
        assert!(a.outcome.stage(StageKind::Cleanup).unwrap().is_succeeded());
        assert_eq!(report.failed_count(), 2);
    }
}
