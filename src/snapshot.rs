//! Per-lag snapshot persistence: one CSV feature table plus a small JSON
//! run report, both published atomically (temp file, then rename).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::assemble::FeatureFrame;
use crate::tables::TIME_FORMAT;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid output path: {0}")]
    InvalidOutputPath(PathBuf),
}

/// Written beside each snapshot; records what produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagRunReport {
    pub lag_days: i64,
    pub rows: usize,
    pub feature_columns: usize,
    pub schema_fingerprint: String,
    pub snapshot_path: PathBuf,
}

pub fn snapshot_path(output_dir: &Path, lag_days: i64) -> PathBuf {
    output_dir.join(format!("features_lag_{lag_days}d.csv"))
}

pub fn report_path(output_dir: &Path, lag_days: i64) -> PathBuf {
    output_dir.join(format!("features_lag_{lag_days}d.report.json"))
}

/// Writes the assembled table: base columns, then every feature column in
/// merge order. Nulls become empty CSV fields.
pub fn write_snapshot(frame: &FeatureFrame, path: &Path) -> Result<(), SnapshotError> {
    let tmp = tmp_path(path)?;

    {
        let mut writer = csv::Writer::from_path(&tmp)?;

        let mut header: Vec<&str> = vec!["user_id", "impression_id", "impression_time", "is_click"];
        header.extend(frame.column_names());
        writer.write_record(&header)?;

        for (row, base) in frame.base_rows().iter().enumerate() {
            let mut record: Vec<String> = Vec::with_capacity(header.len());
            record.push(base.user_id.to_string());
            record.push(base.impression_id.clone());
            record.push(base.impression_time.format(TIME_FORMAT).to_string());
            record.push(base.is_click.map(|v| v.to_string()).unwrap_or_default());
            for (_, values) in frame.columns() {
                record.push(values[row].map(|v| v.to_string()).unwrap_or_default());
            }
            writer.write_record(&record)?;
        }

        writer.flush()?;
    }

    fs::rename(&tmp, path)?;
    info!(
        component = "snapshot",
        event = "snapshot.written",
        path = %path.display(),
        rows = frame.row_count(),
        feature_columns = frame.column_count()
    );
    Ok(())
}

pub fn write_report(report: &LagRunReport, path: &Path) -> Result<(), SnapshotError> {
    let tmp = tmp_path(path)?;
    fs::write(&tmp, serde_json::to_vec_pretty(report)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> Result<PathBuf, SnapshotError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| SnapshotError::InvalidOutputPath(path.to_path_buf()))?;
    Ok(path.with_file_name(format!("{file_name}.tmp")))
}
