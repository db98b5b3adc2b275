use std::env;
use std::error::Error;
use std::path::PathBuf;

use ctrfeat::{
    init_logging, load_events, load_impressions, load_items, log_job_start,
    logging_config_from_env, run_pipeline, FeaturePipelineConfig, InputTables, LabelPresence,
};

fn main() -> Result<(), Box<dyn Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_job_start(&logging);

    let input_dir = env::var("CTRFEAT_INPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("inputs"));

    let mut cfg = FeaturePipelineConfig::default();
    if let Ok(raw) = env::var("CTRFEAT_OUTPUT_DIR") {
        cfg.output_dir = PathBuf::from(raw);
    }
    if let Some(min_lag) = parse_env_i64("CTRFEAT_MIN_LAG")? {
        cfg.min_lag_days = min_lag;
    }
    if let Some(max_lag) = parse_env_i64("CTRFEAT_MAX_LAG")? {
        cfg.max_lag_days = max_lag;
    }
    if let Some(windows) = parse_env_windows("CTRFEAT_WINDOWS")? {
        cfg.window_days = windows;
    }

    println!(
        "Feature build start | input={} output={} lags={}..={} windows={:?}",
        input_dir.display(),
        cfg.output_dir.display(),
        cfg.min_lag_days,
        cfg.max_lag_days,
        cfg.window_days
    );

    let catalog = load_items(&input_dir.join("item_data.csv"))?;
    let events = load_events(&input_dir.join("view_log.csv"))?;
    let mut impressions = load_impressions(&input_dir.join("train.csv"), LabelPresence::Labeled)?;

    let test_path = input_dir.join("test.csv");
    if test_path.exists() {
        impressions.extend(load_impressions(&test_path, LabelPresence::Unlabeled)?);
    } else {
        println!("No test.csv found; building features for labeled impressions only.");
    }

    let tables = InputTables {
        catalog,
        events,
        impressions,
    };
    let report = run_pipeline(&tables, &cfg)?;

    for summary in &report.lag_summaries {
        match (&summary.snapshot_path, &summary.error) {
            (Some(path), None) => println!(
                "lag {} | rows={} feature_columns={} -> {}",
                summary.lag_days,
                summary.rows,
                summary.feature_columns,
                path.display()
            ),
            (_, Some(err)) => println!("lag {} FAILED: {err}", summary.lag_days),
            _ => {}
        }
    }

    let failed = report.failed_lags();
    if failed > 0 {
        return Err(format!("{failed} lag snapshot(s) failed").into());
    }

    println!("All lag snapshots written.");
    Ok(())
}

fn parse_env_i64(key: &str) -> Result<Option<i64>, Box<dyn Error>> {
    match env::var(key) {
        Ok(raw) => {
            let parsed = raw
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("{key} must be an integer, got '{raw}'"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

fn parse_env_windows(key: &str) -> Result<Option<Vec<i64>>, Box<dyn Error>> {
    match env::var(key) {
        Ok(raw) => {
            let mut windows = Vec::new();
            for part in raw.split(',') {
                let trimmed = part.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let parsed = trimmed
                    .parse::<i64>()
                    .map_err(|_| format!("{key} must be comma-separated integers, got '{raw}'"))?;
                windows.push(parsed);
            }
            Ok(Some(windows))
        }
        Err(_) => Ok(None),
    }
}
