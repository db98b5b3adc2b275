//! Per-lag orchestration of the feature derivation job.
//!
//! One configured run covers an inclusive lag range. Lags are independent
//! tasks: each builds its own join slice, runs every schema column's pass,
//! and publishes its own snapshot, so one failed lag never takes down the
//! others.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate;
use crate::assemble::{FeatureFrame, FrameError};
use crate::ctr::{build_ctr_tables, CtrAttribute, CtrTable};
use crate::log_join::{build_lag_slice, EventLogIndex};
use crate::schema::{assert_frame_matches, build_feature_schema, ColumnKind, FeatureSchema, SchemaError};
use crate::snapshot::{
    report_path, snapshot_path, write_report, write_snapshot, LagRunReport, SnapshotError,
};
use crate::tables::{CategoryDim, Event, Impression, ItemCatalog, LoadError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePipelineConfig {
    /// Window lengths evaluated per lag, in days.
    pub window_days: Vec<i64>,
    /// Inclusive lag range; one snapshot is produced per lag.
    pub min_lag_days: i64,
    pub max_lag_days: i64,
    /// Dimensions expanded into per-category visit counts. Values are
    /// enumerated from the item catalog at run time.
    pub visit_category_dims: Vec<CategoryDim>,
    /// Unit of the recency feature, in seconds per unit.
    pub recency_unit_seconds: f64,
    pub output_dir: PathBuf,
}

impl Default for FeaturePipelineConfig {
    fn default() -> Self {
        Self {
            window_days: vec![1, 3, 7, 14, 30],
            min_lag_days: 1,
            max_lag_days: 7,
            visit_category_dims: vec![CategoryDim::Category1],
            recency_unit_seconds: 300.0,
            output_dir: PathBuf::from("data/features"),
        }
    }
}

/// The three loaded input tables. `impressions` holds labeled and unlabeled
/// rows together; unlabeled rows carry `is_click: None`.
#[derive(Debug, Clone)]
pub struct InputTables {
    pub catalog: ItemCatalog,
    pub events: Vec<Event>,
    pub impressions: Vec<Impression>,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),
    #[error("load error: {0}")]
    Load(#[from] LoadError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of one lag's run; `error` is set when the lag failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagRunSummary {
    pub lag_days: i64,
    pub rows: usize,
    pub feature_columns: usize,
    pub snapshot_path: Option<PathBuf>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub schema_fingerprint: String,
    pub lag_summaries: Vec<LagRunSummary>,
}

impl PipelineReport {
    pub fn failed_lags(&self) -> usize {
        self.lag_summaries
            .iter()
            .filter(|summary| summary.error.is_some())
            .count()
    }
}

/// Runs the whole job: CTR tables and the log index once, then every lag in
/// parallel. Fatal errors (config, duplicate impression keys, output
/// directory) abort before any aggregation; per-lag failures are isolated
/// into that lag's summary.
pub fn run_pipeline(
    tables: &InputTables,
    cfg: &FeaturePipelineConfig,
) -> Result<PipelineReport, FeatureError> {
    validate_config(cfg)?;
    fs::create_dir_all(&cfg.output_dir)?;

    let started = Instant::now();
    let schema = build_feature_schema(cfg, &tables.catalog);
    let base_frame = FeatureFrame::from_impressions(&tables.impressions)?;
    let ctr_tables = build_ctr_tables(&tables.impressions);
    let ctr_columns = ctr_feature_columns(&ctr_tables, &tables.impressions);
    let index = EventLogIndex::build(&tables.events);

    let lags: Vec<i64> = (cfg.min_lag_days..=cfg.max_lag_days).collect();
    info!(
        component = "pipeline",
        event = "pipeline.start",
        impressions = tables.impressions.len(),
        log_rows = tables.events.len(),
        catalog_items = tables.catalog.len(),
        lags = lags.len(),
        windows = ?cfg.window_days,
        schema_fingerprint = schema.fingerprint
    );

    let lag_summaries: Vec<LagRunSummary> = lags
        .par_iter()
        .map(|&lag_days| {
            match run_lag(tables, cfg, &schema, &ctr_columns, &index, &base_frame, lag_days) {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(
                        component = "pipeline",
                        event = "pipeline.lag.failed",
                        lag_days,
                        error = %err
                    );
                    LagRunSummary {
                        lag_days,
                        rows: 0,
                        feature_columns: 0,
                        snapshot_path: None,
                        error: Some(err.to_string()),
                    }
                }
            }
        })
        .collect();

    let report = PipelineReport {
        schema_fingerprint: schema.fingerprint.clone(),
        lag_summaries,
    };

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        lags = report.lag_summaries.len(),
        failed_lags = report.failed_lags(),
        elapsed_ms = started.elapsed().as_millis() as u64
    );
    Ok(report)
}

fn run_lag(
    tables: &InputTables,
    cfg: &FeaturePipelineConfig,
    schema: &FeatureSchema,
    ctr_columns: &HashMap<CtrAttribute, HashMap<usize, f64>>,
    index: &EventLogIndex,
    base_frame: &FeatureFrame,
    lag_days: i64,
) -> Result<LagRunSummary, FeatureError> {
    info!(
        component = "pipeline",
        event = "pipeline.lag.start",
        lag_days
    );

    let max_window_days = cfg.window_days.iter().copied().max().unwrap_or(0);
    let slice = build_lag_slice(
        &tables.impressions,
        index,
        &tables.catalog,
        lag_days,
        max_window_days,
    );

    let mut frame = base_frame.clone();
    let empty = HashMap::new();
    for spec in &schema.columns {
        let computed;
        let values = match &spec.kind {
            ColumnKind::Ctr(attr) => ctr_columns.get(attr).unwrap_or(&empty),
            ColumnKind::Aggregate(feature) => {
                computed = aggregate::evaluate(&slice, *feature, cfg.recency_unit_seconds);
                &computed
            }
        };
        frame.merge_column(&spec.name, values)?;
    }

    assert_frame_matches(schema, &frame)?;

    let path = snapshot_path(&cfg.output_dir, lag_days);
    write_snapshot(&frame, &path)?;
    let report = LagRunReport {
        lag_days,
        rows: frame.row_count(),
        feature_columns: frame.column_count(),
        schema_fingerprint: schema.fingerprint.clone(),
        snapshot_path: path.clone(),
    };
    write_report(&report, &report_path(&cfg.output_dir, lag_days))?;

    info!(
        component = "pipeline",
        event = "pipeline.lag.finish",
        lag_days,
        rows = frame.row_count(),
        feature_columns = frame.column_count(),
        snapshot = %path.display()
    );

    Ok(LagRunSummary {
        lag_days,
        rows: frame.row_count(),
        feature_columns: frame.column_count(),
        snapshot_path: Some(path),
        error: None,
    })
}

fn ctr_feature_columns(
    tables: &[CtrTable],
    impressions: &[Impression],
) -> HashMap<CtrAttribute, HashMap<usize, f64>> {
    tables
        .iter()
        .map(|table| {
            let mut values = HashMap::new();
            for (row, imp) in impressions.iter().enumerate() {
                if let Some(rate) = table.rate_for(imp) {
                    values.insert(row, rate);
                }
            }
            (table.attribute(), values)
        })
        .collect()
}

fn validate_config(cfg: &FeaturePipelineConfig) -> Result<(), FeatureError> {
    if cfg.window_days.is_empty() {
        return Err(FeatureError::InvalidConfig(
            "window_days must not be empty".to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for window in &cfg.window_days {
        if *window <= 0 {
            return Err(FeatureError::InvalidConfig(
                "window_days entries must be > 0".to_string(),
            ));
        }
        if !seen.insert(*window) {
            return Err(FeatureError::InvalidConfig(
                "window_days entries must be unique".to_string(),
            ));
        }
    }

    if cfg.min_lag_days < 0 {
        return Err(FeatureError::InvalidConfig(
            "min_lag_days must be >= 0".to_string(),
        ));
    }
    if cfg.max_lag_days < cfg.min_lag_days {
        return Err(FeatureError::InvalidConfig(
            "max_lag_days must be >= min_lag_days".to_string(),
        ));
    }

    let mut dims = std::collections::HashSet::new();
    for dim in &cfg.visit_category_dims {
        if !dims.insert(*dim) {
            return Err(FeatureError::InvalidConfig(
                "visit_category_dims entries must be unique".to_string(),
            ));
        }
    }

    if !(cfg.recency_unit_seconds.is_finite() && cfg.recency_unit_seconds > 0.0) {
        return Err(FeatureError::InvalidConfig(
            "recency_unit_seconds must be a positive finite number".to_string(),
        ));
    }

    Ok(())
}
