//! CTR feature derivation core crate.
//!
//! Implemented scope:
//! - raw table loading (item catalog, view log, impressions)
//! - historic attribute click rates
//! - lag-windowed view-log aggregation features
//! - per-lag feature table assembly and snapshot persistence

mod aggregate;
mod assemble;
mod ctr;
mod log_join;
mod observability;
mod pipeline;
mod schema;
mod snapshot;
mod tables;

pub use aggregate::{
    avg_price_of_unique_items, avg_session_duration, days_since_last_visit, evaluate,
    unique_count, visit_count, visit_count_in_category, AggregateFeature, UniqueKey,
};
pub use assemble::{BaseRow, FeatureFrame, FrameError};
pub use ctr::{build_ctr_tables, CtrAttribute, CtrTable};
pub use log_join::{
    age_days, build_lag_slice, narrow_lag_slice, EventLogIndex, GroupSlice, LagSlice, SliceEvent,
};
pub use observability::{
    init_logging, log_job_start, logging_config_from_env, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use pipeline::{
    run_pipeline, FeatureError, FeaturePipelineConfig, InputTables, LagRunSummary, PipelineReport,
};
pub use schema::{
    assert_frame_matches, build_feature_schema, ColumnKind, ColumnSpec, FeatureSchema,
    SchemaError, FEATURE_SCHEMA_VERSION,
};
pub use snapshot::{
    report_path, snapshot_path, write_report, write_snapshot, LagRunReport, SnapshotError,
};
pub use tables::{
    load_events, load_impressions, load_items, CategoryDim, Event, Impression, Item, ItemCatalog,
    LabelPresence, LoadError,
};
