//! Command-line interface for the session pipeline.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use crate::config::FailurePolicy;
use crate::core::{
    locate_sessions, write_report, ArtifactResolver, BatchReport, Eligibility,
};
use crate::processors::{BatchMode, BatchRunner, ProcessInvoker, SessionPipeline};
use crate::PipelineConfig;

/// Exit code when at least one session recorded a failed stage.
const EXIT_SESSION_FAILURES: i32 = 2;
/// Exit code when the batch was interrupted.
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "lidar-pipeline")]
#[command(about = "Batch pipeline for handheld LiDAR capture sessions", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert, filter and finalize every session under a root
    Run {
        /// Batch root containing one directory per session
        root: PathBuf,
        /// Sessions processed concurrently
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Skip a session's remaining stages after its first failure
        #[arg(long)]
        halt_on_failure: bool,
        /// Re-run stages whose canonical output already exists
        #[arg(long)]
        overwrite: bool,
        /// Also rotate the filtered output
        #[arg(long)]
        rotate: bool,
        /// Do not pass the plane-normal flag to the filter tool
        #[arg(long)]
        no_plane_normal: bool,
        /// Minimum height kept by the filter tool
        #[arg(long)]
        min_height: Option<f64>,
        /// Maximum height kept by the filter tool
        #[arg(long)]
        max_height: Option<f64>,
        /// Timeout in seconds for a single tool invocation
        #[arg(long)]
        tool_timeout: Option<u64>,
        /// Timeout in seconds for all stages of one session
        #[arg(long)]
        session_timeout: Option<u64>,
        /// Write the report to this file (.csv, .yaml or .yml)
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Rotate existing filtered outputs into the secondary point cloud
    Rotate {
        /// Batch root containing one directory per session
        root: PathBuf,
        /// Sessions processed concurrently
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Re-run rotation even if the output already exists
        #[arg(long)]
        overwrite: bool,
        /// Fixed rotation angle in degrees
        #[arg(long)]
        angle: Option<f64>,
        /// Timeout in seconds for a single tool invocation
        #[arg(long)]
        tool_timeout: Option<u64>,
        /// Write the report to this file (.csv, .yaml or .yml)
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show discovered artifacts and planned stages without running tools
    Inspect {
        /// Batch root containing one directory per session
        root: PathBuf,
    },

    /// Write the default configuration as YAML
    GenerateConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "pipeline.yaml")]
        output: PathBuf,
    },
}

/// Create a progress bar over sessions. Hidden when logging is verbose so
/// the two do not interleave.
fn create_progress(verbose: u8) -> ProgressBar {
    if verbose > 0 {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<60} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 38 {
            let head: String = value.chars().take(35).collect();
            format!("{}...", head)
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<38} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Install SIGINT/SIGTERM handlers that raise `flag`. A second signal
/// terminates immediately.
fn install_cancel_flag() -> Arc<AtomicBool> {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::flag;

    let cancel = Arc::new(AtomicBool::new(false));
    for &signal in TERM_SIGNALS {
        let registered =
            flag::register_conditional_shutdown(signal, EXIT_CANCELLED, Arc::clone(&cancel))
            .and_then(|_| flag::register(signal, Arc::clone(&cancel)));
        if let Err(e) = registered {
            warn!("Failed to install handler for signal {}: {}", signal, e);
        }
    }
    cancel
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => {
            let config = PipelineConfig::from_yaml(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!("Loaded config from: {}", path.display());
            Ok(config)
        }
        None => Ok(PipelineConfig::default()),
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    if let Commands::GenerateConfig { output } = &cli.command {
        return cmd_generate_config(output);
    }

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            root,
            jobs,
            halt_on_failure,
            overwrite,
            rotate,
            no_plane_normal,
            min_height,
            max_height,
            tool_timeout,
            session_timeout,
            report,
        } => {
            // CLI flags override the YAML values
            if let Some(jobs) = jobs {
                config.run.jobs = jobs;
            }
            if halt_on_failure {
                config.run.failure_policy = FailurePolicy::HaltSession;
            }
            config.run.overwrite |= overwrite;
            config.run.rotate |= rotate;
            if no_plane_normal {
                config.filter.plane_normal = false;
            }
            config.filter.min_height = min_height.or(config.filter.min_height);
            config.filter.max_height = max_height.or(config.filter.max_height);
            config.run.tool_timeout_secs = tool_timeout.or(config.run.tool_timeout_secs);
            config.run.session_timeout_secs = session_timeout.or(config.run.session_timeout_secs);

            cmd_batch(&root, &config, BatchMode::Full, report.as_deref(), cli.verbose)
        }
        Commands::Rotate {
            root,
            jobs,
            overwrite,
            angle,
            tool_timeout,
            report,
        } => {
            if let Some(jobs) = jobs {
                config.run.jobs = jobs;
            }
            config.run.overwrite |= overwrite;
            config.rotate.angle_degrees = angle.or(config.rotate.angle_degrees);
            config.run.tool_timeout_secs = tool_timeout.or(config.run.tool_timeout_secs);

            cmd_batch(&root, &config, BatchMode::RotateOnly, report.as_deref(), cli.verbose)
        }
        Commands::Inspect { root } => cmd_inspect(&root, &config),
        Commands::GenerateConfig { .. } => Ok(0),
    }
}

fn cmd_batch(
    root: &Path,
    config: &PipelineConfig,
    mode: BatchMode,
    report_path: Option<&Path>,
    verbose: u8,
) -> Result<i32> {
    let start = Instant::now();

    println!(
        "{} sessions under {}",
        match mode {
            BatchMode::Full => "Processing",
            BatchMode::RotateOnly => "Rotating",
        },
        root.display()
    );

    let invoker = ProcessInvoker::new();
    let cancel = install_cancel_flag();
    let progress = create_progress(verbose);

    let result = BatchRunner::new(config, &invoker)
        .context("Invalid pipeline configuration")?
        .mode(mode)
        .cancel_flag(Arc::clone(&cancel))
        .progress(progress.clone())
        .run(root);

    progress.finish_and_clear();
    let report = result.with_context(|| format!("Batch aborted for {}", root.display()))?;

    print!("{}", report.render_trace());

    if let Some(path) = report_path {
        write_report(path, &report)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Report -> {}", path.display());
    }

    print_batch_summary(&report, report_path, start);

    let cancelled = cancel.load(Ordering::SeqCst);
    if cancelled {
        warn!("Batch interrupted; {} sessions not started", report.cancelled_count());
    }
    Ok(exit_code(&report, cancelled))
}

/// Cancellation wins over stage failures.
fn exit_code(report: &BatchReport, cancelled: bool) -> i32 {
    if cancelled {
        EXIT_CANCELLED
    } else if report.failed_count() > 0 {
        EXIT_SESSION_FAILURES
    } else {
        0
    }
}

fn print_batch_summary(report: &BatchReport, report_path: Option<&Path>, start: Instant) {
    let mut items = vec![
        ("Root", report.root.display().to_string()),
        ("Sessions", report.sessions.len().to_string()),
        ("Processed", report.processed_count().to_string()),
        ("Skipped", report.ineligible_count().to_string()),
        ("With failures", report.failed_count().to_string()),
    ];
    if report.cancelled_count() > 0 {
        items.push(("Cancelled", report.cancelled_count().to_string()));
    }
    if let Some(path) = report_path {
        items.push(("Report", path.display().to_string()));
    }
    items.push(("Duration", format!("{:.2?}", start.elapsed())));

    print_summary("Batch Complete", &items);
}

fn cmd_inspect(root: &Path, config: &PipelineConfig) -> Result<i32> {
    config.validate().context("Invalid pipeline configuration")?;

    let resolver = ArtifactResolver::new(&config.layout)?;
    let invoker = ProcessInvoker::new();
    let pipeline = SessionPipeline::new(config, &invoker);

    let sessions = locate_sessions(root)?;
    let total = sessions.len();
    let mut eligible = 0;

    for session in sessions {
        let artifacts = resolver.resolve(&session.path);
        let show = |p: &Option<PathBuf>| {
            p.as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "-".to_string())
        };

        match artifacts.eligibility() {
            Eligibility::Ineligible(reason) => {
                println!("[{}] skipped: {}", session.name, reason);
            }
            Eligibility::Eligible => {
                eligible += 1;
                println!(
                    "[{}] las={} pcd={} odom={}",
                    session.name,
                    show(&artifacts.las),
                    show(&artifacts.point_cloud),
                    show(&artifacts.odometry)
                );
                for step in pipeline.plan(&session, &artifacts) {
                    match step.skip {
                        None => println!("    {:<9} run", step.stage),
                        Some(reason) => println!("    {:<9} skip: {}", step.stage, reason),
                    }
                }
            }
        }
    }

    print_summary(
        "Inspection Complete",
        &[
            ("Root", root.display().to_string()),
            ("Sessions", total.to_string()),
            ("Eligible", eligible.to_string()),
            ("Skipped", (total - eligible).to_string()),
        ],
    );

    Ok(0)
}

fn cmd_generate_config(output: &Path) -> Result<i32> {
    PipelineConfig::default()
        .to_yaml(output)
        .with_context(|| format!("Failed to write config to {}", output.display()))?;
    println!("Wrote default configuration to {}", output.display());
    Ok(0)
}
