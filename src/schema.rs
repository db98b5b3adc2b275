//! Deterministic feature schema: the declarative pass list plus a sha256
//! fingerprint over everything that shapes the output columns.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::aggregate::{AggregateFeature, UniqueKey};
use crate::assemble::FeatureFrame;
use crate::ctr::CtrAttribute;
use crate::pipeline::FeaturePipelineConfig;
use crate::tables::{CategoryDim, ItemCatalog};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// What produces one output column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    Ctr(CtrAttribute),
    Aggregate(AggregateFeature),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<ColumnSpec>,
}

impl FeatureSchema {
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("assembled frame has {actual} feature columns, schema expects {expected}")]
    ColumnCountMismatch { expected: usize, actual: usize },
    #[error("assembled column {index} is {actual}, schema expects {expected}")]
    ColumnMismatch {
        index: usize,
        expected: String,
        actual: String,
    },
}

/// Builds the ordered column list for one configuration and catalog.
///
/// Order: historic CTR columns, overall visit counts per window, per-category
/// visit counts (dimension, then catalog value, then window), unique-item
/// count and average unique-item price per window, unique-category counts
/// (dimension, then window), the recency column, unique-session counts per
/// window, average session durations per window.
pub fn build_feature_schema(cfg: &FeaturePipelineConfig, catalog: &ItemCatalog) -> FeatureSchema {
    let windows = &cfg.window_days;
    let mut columns = Vec::new();

    for attr in CtrAttribute::ALL {
        columns.push(ColumnSpec {
            name: attr.column_name().to_string(),
            kind: ColumnKind::Ctr(attr),
        });
    }

    for &w in windows {
        columns.push(aggregate_column(
            format!("cnt_visit_l{w}d"),
            AggregateFeature::VisitCount { window_days: w },
        ));
    }

    for &dim in &cfg.visit_category_dims {
        for value in catalog.distinct_values(dim) {
            for &w in windows {
                columns.push(aggregate_column(
                    format!("cnt_visit_{}_{value}_l{w}d", dim.as_str()),
                    AggregateFeature::VisitCountInCategory {
                        dim,
                        value,
                        window_days: w,
                    },
                ));
            }
        }
    }

    for &w in windows {
        columns.push(aggregate_column(
            format!("cnt_uniq_item_l{w}d"),
            AggregateFeature::UniqueCount {
                key: UniqueKey::Item,
                window_days: w,
            },
        ));
        columns.push(aggregate_column(
            format!("avg_price_uniq_item_l{w}d"),
            AggregateFeature::AvgPriceOfUniqueItems { window_days: w },
        ));
    }

    for dim in CategoryDim::ALL {
        for &w in windows {
            columns.push(aggregate_column(
                format!("cnt_uniq_{}_l{w}d", dim.as_str()),
                AggregateFeature::UniqueCount {
                    key: UniqueKey::Category(dim),
                    window_days: w,
                },
            ));
        }
    }

    columns.push(aggregate_column(
        "cnt_days_since_last_visit".to_string(),
        AggregateFeature::DaysSinceLastVisit,
    ));

    for &w in windows {
        columns.push(aggregate_column(
            format!("cnt_session_id_l{w}d"),
            AggregateFeature::UniqueCount {
                key: UniqueKey::Session,
                window_days: w,
            },
        ));
    }

    for &w in windows {
        columns.push(aggregate_column(
            format!("avg_session_time_l{w}d"),
            AggregateFeature::AvgSessionDuration { window_days: w },
        ));
    }

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "schema",
        event = "schema.built",
        version = FEATURE_SCHEMA_VERSION,
        windows = ?cfg.window_days,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

/// Verifies an assembled frame's feature columns against the schema.
pub fn assert_frame_matches(schema: &FeatureSchema, frame: &FeatureFrame) -> Result<(), SchemaError> {
    if frame.column_count() != schema.columns.len() {
        return Err(SchemaError::ColumnCountMismatch {
            expected: schema.columns.len(),
            actual: frame.column_count(),
        });
    }

    for (index, (spec, actual)) in schema.columns.iter().zip(frame.column_names()).enumerate() {
        if spec.name != actual {
            return Err(SchemaError::ColumnMismatch {
                index,
                expected: spec.name.clone(),
                actual: actual.to_string(),
            });
        }
    }

    Ok(())
}

fn aggregate_column(name: String, feature: AggregateFeature) -> ColumnSpec {
    ColumnSpec {
        name,
        kind: ColumnKind::Aggregate(feature),
    }
}

fn schema_fingerprint(cfg: &FeaturePipelineConfig, columns: &[ColumnSpec]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update(format!("recency_unit_seconds:{};", cfg.recency_unit_seconds));
    hasher.update("windows:");
    for window in &cfg.window_days {
        hasher.update(format!("{window},"));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::Item;

    fn catalog() -> ItemCatalog {
        ItemCatalog::new(vec![
            Item {
                item_id: 1,
                item_price: 1.0,
                category_1: 3,
                category_2: 20,
                category_3: 300,
                product_type: 9,
            },
            Item {
                item_id: 2,
                item_price: 2.0,
                category_1: 1,
                category_2: 20,
                category_3: 301,
                product_type: 9,
            },
        ])
    }

    fn config() -> FeaturePipelineConfig {
        FeaturePipelineConfig {
            window_days: vec![1, 7],
            ..FeaturePipelineConfig::default()
        }
    }

    #[test]
    fn column_order_and_fingerprint_are_deterministic() {
        let cfg = config();
        let cat = catalog();
        let schema_a = build_feature_schema(&cfg, &cat);
        let schema_b = build_feature_schema(&cfg, &cat);

        assert_eq!(schema_a, schema_b);
        let names: Vec<&str> = schema_a.column_names().collect();
        assert_eq!(names[0], "weekday_ctr");
        assert_eq!(names[5], "weekday_hour_ctr");
        assert_eq!(names[6], "cnt_visit_l1d");
        assert_eq!(names[7], "cnt_visit_l7d");
        // Catalog category_1 values {1, 3} expand in sorted order.
        assert_eq!(names[8], "cnt_visit_category_1_1_l1d");
        assert_eq!(names[9], "cnt_visit_category_1_1_l7d");
        assert_eq!(names[10], "cnt_visit_category_1_3_l1d");
        assert_eq!(names[11], "cnt_visit_category_1_3_l7d");
        assert_eq!(names[12], "cnt_uniq_item_l1d");
        assert_eq!(names[13], "avg_price_uniq_item_l1d");
        assert!(names.contains(&"cnt_uniq_product_type_l7d"));
        assert!(names.contains(&"cnt_days_since_last_visit"));
        assert_eq!(names[names.len() - 1], "avg_session_time_l7d");
        assert_eq!(names[names.len() - 2], "avg_session_time_l1d");
        assert_eq!(names[names.len() - 4], "cnt_session_id_l1d");
    }

    #[test]
    fn fingerprint_changes_with_the_window_set() {
        let cat = catalog();
        let schema_a = build_feature_schema(&config(), &cat);
        let mut other = config();
        other.window_days = vec![1, 14];
        let schema_b = build_feature_schema(&other, &cat);

        assert_ne!(schema_a.fingerprint, schema_b.fingerprint);
    }
}
