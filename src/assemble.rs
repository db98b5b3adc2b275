//! Feature table accumulator.
//!
//! A `FeatureFrame` is an explicit accumulator threaded through the
//! aggregation passes: base columns fixed at construction, one appended
//! column per pass, row count invariant by construction. Every merge input
//! is keyed by row index, so a pass can never duplicate or drop rows.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::tables::Impression;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("duplicate impression key user_id={user_id} impression_id={impression_id}")]
    DuplicateKey { user_id: i64, impression_id: String },
    #[error("feature column {0} merged twice")]
    ColumnExists(String),
    #[error("column {column} references row {row}, frame has {rows} rows")]
    RowOutOfRange {
        column: String,
        row: usize,
        rows: usize,
    },
}

/// Identifying and label columns of one impression.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseRow {
    pub user_id: i64,
    pub impression_id: String,
    pub impression_time: NaiveDateTime,
    pub is_click: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureFrame {
    base: Vec<BaseRow>,
    columns: Vec<(String, Vec<Option<f64>>)>,
}

impl FeatureFrame {
    /// Copies the identifying and label columns, preserving input order.
    /// Duplicate `(user_id, impression_id)` keys are rejected: they would
    /// silently break the one-row-per-impression output contract.
    pub fn from_impressions(impressions: &[Impression]) -> Result<Self, FrameError> {
        let mut seen: HashSet<(i64, &str)> = HashSet::with_capacity(impressions.len());
        let mut base = Vec::with_capacity(impressions.len());
        for imp in impressions {
            if !seen.insert((imp.user_id, imp.impression_id.as_str())) {
                return Err(FrameError::DuplicateKey {
                    user_id: imp.user_id,
                    impression_id: imp.impression_id.clone(),
                });
            }
            base.push(BaseRow {
                user_id: imp.user_id,
                impression_id: imp.impression_id.clone(),
                impression_time: imp.impression_time,
                is_click: imp.is_click,
            });
        }

        Ok(Self {
            base,
            columns: Vec::new(),
        })
    }

    pub fn row_count(&self) -> usize {
        self.base.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn base_rows(&self) -> &[BaseRow] {
        &self.base
    }

    pub fn columns(&self) -> &[(String, Vec<Option<f64>>)] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, values)| values.as_slice())
    }

    /// Appends one feature column. `values` is already deduplicated by
    /// construction (one entry per row index); rows without an entry are
    /// null, exactly like a left join against a unique-keyed right side.
    pub fn merge_column(
        &mut self,
        name: &str,
        values: &HashMap<usize, f64>,
    ) -> Result<(), FrameError> {
        if self.columns.iter().any(|(col, _)| col == name) {
            return Err(FrameError::ColumnExists(name.to_string()));
        }

        let rows = self.base.len();
        let mut column = vec![None; rows];
        for (&row, &value) in values {
            if row >= rows {
                return Err(FrameError::RowOutOfRange {
                    column: name.to_string(),
                    row,
                    rows,
                });
            }
            column[row] = Some(value);
        }

        self.columns.push((name.to_string(), column));
        Ok(())
    }
}
