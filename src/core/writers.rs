//! Report writers for CSV and YAML formats.
//!
//! - CSV: one row per stage (or per session when no stage ran)
//! - YAML: the full serialized report tree

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use super::report::{BatchReport, SessionOutcome};

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },

    /// YAML serialization error.
    #[error("YAML write error for '{path}': {source}")]
    YamlError {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// Report path extension is neither csv nor yaml.
    #[error("unsupported report format for '{0}' (expected .csv, .yaml or .yml)")]
    UnsupportedFormat(String),
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Write the report as CSV with columns `session,stage,status,detail`.
///
/// Sessions without stage records get a single row whose stage column is
/// empty and whose status is `ineligible` or `cancelled`.
pub fn write_report_csv(path: &Path, report: &BatchReport) -> Result<()> {
    ensure_parent_dir(path)?;

    let path_str = path.display().to_string();
    let csv_err = |e: csv::Error| WriteError::CsvError {
        path: path_str.clone(),
        source: e,
    };

    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    writer
        .write_record(["session", "stage", "status", "detail"])
        .map_err(csv_err)?;

    for record in &report.sessions {
        match &record.outcome {
            SessionOutcome::Ineligible(reason) => {
                let reason = reason.to_string();
                writer
                    .write_record([record.name.as_str(), "", "ineligible", reason.as_str()])
                    .map_err(csv_err)?;
            }
            SessionOutcome::Cancelled => {
                writer
                    .write_record([record.name.as_str(), "", "cancelled", ""])
                    .map_err(csv_err)?;
            }
            SessionOutcome::Processed(stages) => {
                for stage in stages {
                    let detail = stage.result.detail();
                    writer
                        .write_record([
                            record.name.as_str(),
                            stage.stage.as_str(),
                            stage.result.status(),
                            detail.as_str(),
                        ])
                        .map_err(csv_err)?;
                }
            }
        }
    }

    writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str.clone(),
        source: e,
    })?;

    Ok(())
}

/// Write the full report tree as YAML.
pub fn write_report_yaml(path: &Path, report: &BatchReport) -> Result<()> {
    ensure_parent_dir(path)?;

    let path_str = path.display().to_string();
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path_str.clone(),
        source: e,
    })?;
    let mut writer = BufWriter::new(file);

    serde_yaml::to_writer(&mut writer, report).map_err(|e| WriteError::YamlError {
        path: path_str.clone(),
        source: e,
    })?;

    writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}

/// Write the report in the format implied by the file extension.
pub fn write_report(path: &Path, report: &BatchReport) -> Result<()> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "csv" => write_report_csv(path, report),
        "yaml" | "yml" => write_report_yaml(path, report),
        _ => Err(WriteError::UnsupportedFormat(path.display().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artifacts::IneligibleReason;
    use crate::core::report::{SessionRecord, StageKind, StageRecord, StageResult};
    use crate::core::session::Session;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_report() -> BatchReport {
        let mut report = BatchReport::new(PathBuf::from("/data"));
        report.push(SessionRecord::new(
            &Session::new(PathBuf::from("/data/A")),
            None,
            SessionOutcome::Processed(vec![
                StageRecord {
                    stage: StageKind::Convert,
                    result: StageResult::Succeeded,
                },
                StageRecord {
                    stage: StageKind::Filter,
                    result: StageResult::skipped("filtered output already exists"),
                },
            ]),
            Duration::from_secs(1),
        ));
        report.push(SessionRecord::new(
            &Session::new(PathBuf::from("/data/B")),
            None,
            SessionOutcome::Ineligible(IneligibleReason::MissingPointCloud),
            Duration::ZERO,
        ));
        report
    }

    #[test]
    fn test_write_report_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/report.csv");

        write_report_csv(&path, &sample_report()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "session,stage,status,detail");
        assert_eq!(lines[1], "A,convert,succeeded,");
        assert_eq!(lines[2], "A,filter,skipped,filtered output already exists");
        assert_eq!(lines[3], "B,,ineligible,missing LAS/PCD");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_write_report_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.yaml");

        write_report(&path, &sample_report()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&content).unwrap();
        let sessions = value["sessions"].as_sequence().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1]["outcome"]["kind"].as_str(), Some("ineligible"));
        assert_eq!(
            sessions[1]["outcome"]["detail"].as_str(),
            Some("missing_point_cloud")
        );
    }

    #[test]
    fn test_write_report_unsupported_extension() {
        let dir = tempdir().unwrap();
        let result = write_report(&dir.path().join("report.json"), &sample_report());
        assert!(matches!(result, Err(WriteError::UnsupportedFormat(_))));
    }
}
