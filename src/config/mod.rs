//! Configuration types for the session pipeline.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholders a tool argument template may reference.
pub const PLACEHOLDERS: [&str; 3] = ["{input}", "{output}", "{odom}"];

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Tool '{tool}' has an empty program")]
    EmptyProgram { tool: String },

    #[error("Tool '{tool}' references unknown placeholder in argument '{arg}'")]
    UnknownPlaceholder { tool: String, arg: String },

    #[error("Layout name '{field}' must be a plain file name, got '{value}'")]
    InvalidName { field: String, value: String },

    #[error("Number of jobs must be at least 1")]
    InvalidJobs,

    #[error("Invalid odometry name pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Command template for one external tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Executable to launch (looked up on PATH)
    pub program: String,

    /// Argument template; `{input}`, `{output}` and `{odom}` are substituted
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn validate(&self, tool: &str) -> Result<(), ConfigError> {
        if self.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram {
                tool: tool.to_string(),
            });
        }

        for arg in &self.args {
            let mut rest = arg.as_str();
            while let Some(open) = rest.find('{') {
                let tail = &rest[open..];
                let known = PLACEHOLDERS.iter().find(|p| tail.starts_with(*p));
                match known {
                    Some(p) => rest = &tail[p.len()..],
                    None => {
                        return Err(ConfigError::UnknownPlaceholder {
                            tool: tool.to_string(),
                            arg: arg.clone(),
                        })
                    }
                }
            }
        }

        Ok(())
    }
}

/// External collaborators invoked by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Native point cloud -> LAS conversion
    #[serde(default = "default_convert_tool")]
    pub convert: ToolSpec,

    /// LAS + odometry -> filtered LAS
    #[serde(default = "default_filter_tool")]
    pub filter: ToolSpec,

    /// Filtered LAS -> rotated LAS
    #[serde(default = "default_rotate_tool")]
    pub rotate: ToolSpec,
}

fn default_convert_tool() -> ToolSpec {
    ToolSpec::new("python3", &["convert_pcd_to_las.py", "{input}", "{output}"])
}

fn default_filter_tool() -> ToolSpec {
    ToolSpec::new(
        "python3",
        &["filter_pointcloud_by_odom.py", "{input}", "{odom}", "-o", "{output}"],
    )
}

fn default_rotate_tool() -> ToolSpec {
    ToolSpec::new("python3", &["rotate_pointcloud.py", "{input}", "{output}"])
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            convert: default_convert_tool(),
            filter: default_filter_tool(),
            rotate: default_rotate_tool(),
        }
    }
}

/// File naming conventions inside a session directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Native point cloud, relative to the session directory
    #[serde(default = "default_point_cloud_name")]
    pub point_cloud_name: String,

    /// Extension (without dot) identifying LAS inputs
    #[serde(default = "default_las_extension")]
    pub las_extension: String,

    /// Case-insensitive prefix of odometry logs
    #[serde(default = "default_odometry_prefix")]
    pub odometry_prefix: String,

    /// Extension (without dot) of odometry logs
    #[serde(default = "default_odometry_extension")]
    pub odometry_extension: String,

    /// Canonical filter output
    #[serde(default = "default_filtered_name")]
    pub filtered_name: String,

    /// Canonical odometry copy
    #[serde(default = "default_odometry_copy_name")]
    pub odometry_copy_name: String,

    /// Canonical rotation output
    #[serde(default = "default_rotated_name")]
    pub rotated_name: String,
}

fn default_point_cloud_name() -> String {
    "scans.pcd".to_string()
}

fn default_las_extension() -> String {
    "las".to_string()
}

fn default_odometry_prefix() -> String {
    "odom".to_string()
}

fn default_odometry_extension() -> String {
    "txt".to_string()
}

fn default_filtered_name() -> String {
    "filtered.las".to_string()
}

fn default_odometry_copy_name() -> String {
    "Odom.txt".to_string()
}

fn default_rotated_name() -> String {
    "Pointcloud.las".to_string()
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            point_cloud_name: default_point_cloud_name(),
            las_extension: default_las_extension(),
            odometry_prefix: default_odometry_prefix(),
            odometry_extension: default_odometry_extension(),
            filtered_name: default_filtered_name(),
            odometry_copy_name: default_odometry_copy_name(),
            rotated_name: default_rotated_name(),
        }
    }
}

impl LayoutConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let names = [
            ("filtered_name", &self.filtered_name),
            ("odometry_copy_name", &self.odometry_copy_name),
            ("rotated_name", &self.rotated_name),
            ("las_extension", &self.las_extension),
            ("odometry_prefix", &self.odometry_prefix),
            ("odometry_extension", &self.odometry_extension),
        ];

        for (field, value) in names {
            if value.is_empty() || value.contains('/') || value.contains('\\') {
                return Err(ConfigError::InvalidName {
                    field: field.to_string(),
                    value: value.clone(),
                });
            }
        }

        if self.point_cloud_name.is_empty() || Path::new(&self.point_cloud_name).is_absolute() {
            return Err(ConfigError::InvalidName {
                field: "point_cloud_name".to_string(),
                value: self.point_cloud_name.clone(),
            });
        }

        Ok(())
    }
}

/// Options forwarded to the filter tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Append `plane_flag` to the filter invocation
    #[serde(default = "default_plane_normal")]
    pub plane_normal: bool,

    /// Flag enabling plane-normal alignment in the filter tool
    #[serde(default = "default_plane_flag")]
    pub plane_flag: String,

    /// Minimum height kept after normal alignment
    #[serde(default)]
    pub min_height: Option<f64>,

    /// Maximum height kept after normal alignment
    #[serde(default)]
    pub max_height: Option<f64>,
}

fn default_plane_normal() -> bool {
    true
}

fn default_plane_flag() -> String {
    "--normal-plane".to_string()
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            plane_normal: default_plane_normal(),
            plane_flag: default_plane_flag(),
            min_height: None,
            max_height: None,
        }
    }
}

/// Options forwarded to the rotate tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotateConfig {
    /// Fixed rotation angle in degrees; the tool estimates one when unset
    #[serde(default)]
    pub angle_degrees: Option<f64>,
}

/// What happens to a session's remaining stages after a stage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Record the failure and keep evaluating later stages
    #[default]
    Continue,
    /// Skip every later stage except temporary cleanup
    HaltSession,
}

/// Batch execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Sessions processed concurrently
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Re-run stages whose canonical output already exists
    #[serde(default)]
    pub overwrite: bool,

    /// Run the rotate stage after finalize
    #[serde(default)]
    pub rotate: bool,

    /// Upper bound for a single tool invocation
    #[serde(default)]
    pub tool_timeout_secs: Option<u64>,

    /// Upper bound for all stages of one session
    #[serde(default)]
    pub session_timeout_secs: Option<u64>,
}

fn default_jobs() -> usize {
    1
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            failure_policy: FailurePolicy::default(),
            overwrite: false,
            rotate: false,
            tool_timeout_secs: None,
            session_timeout_secs: None,
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub layout: LayoutConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub rotate: RotateConfig,

    #[serde(default)]
    pub run: RunConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check tool templates, layout names and run policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tools.convert.validate("convert")?;
        self.tools.filter.validate("filter")?;
        self.tools.rotate.validate("rotate")?;
        self.layout.validate()?;

        if self.run.jobs == 0 {
            return Err(ConfigError::InvalidJobs);
        }

        Ok(())
    }
}
