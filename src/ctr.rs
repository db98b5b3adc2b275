//! Historic click-rate features for categorical impression attributes.
//!
//! Rates are computed from labeled impressions only and then attached to
//! labeled and unlabeled impressions alike; an attribute value never seen in
//! the labeled set has no rate.

use std::collections::HashMap;

use tracing::info;

use crate::tables::Impression;

/// Categorical attribute (or attribute pair) a historic CTR is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtrAttribute {
    Weekday,
    Hour,
    AppCode,
    Is4g,
    OsVersion,
    WeekdayHour,
}

impl CtrAttribute {
    pub const ALL: [CtrAttribute; 6] = [
        Self::Weekday,
        Self::Hour,
        Self::AppCode,
        Self::Is4g,
        Self::OsVersion,
        Self::WeekdayHour,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            Self::Weekday => "weekday_ctr",
            Self::Hour => "hour_ctr",
            Self::AppCode => "app_code_ctr",
            Self::Is4g => "is_4G_ctr",
            Self::OsVersion => "os_version_ctr",
            Self::WeekdayHour => "weekday_hour_ctr",
        }
    }

    /// Canonical grouping key for one impression.
    fn key_of(self, imp: &Impression) -> String {
        match self {
            Self::Weekday => imp.weekday().to_string(),
            Self::Hour => imp.hour().to_string(),
            Self::AppCode => imp.app_code.to_string(),
            Self::Is4g => imp.is_4g.to_string(),
            Self::OsVersion => imp.os_version.clone(),
            Self::WeekdayHour => format!("{}|{}", imp.weekday(), imp.hour()),
        }
    }
}

/// Click rate per attribute value, `clicks(value) / rows(value)`.
#[derive(Debug, Clone)]
pub struct CtrTable {
    attribute: CtrAttribute,
    rates: HashMap<String, f64>,
}

impl CtrTable {
    pub fn from_labeled(attribute: CtrAttribute, impressions: &[Impression]) -> Self {
        let mut counts: HashMap<String, (i64, u64)> = HashMap::new();
        for imp in impressions {
            let Some(label) = imp.is_click else {
                continue;
            };
            let entry = counts.entry(attribute.key_of(imp)).or_insert((0, 0));
            entry.0 += label;
            entry.1 += 1;
        }

        let rates = counts
            .into_iter()
            .map(|(key, (clicks, total))| (key, clicks as f64 / total as f64))
            .collect();

        Self { attribute, rates }
    }

    pub fn attribute(&self) -> CtrAttribute {
        self.attribute
    }

    pub fn column_name(&self) -> &'static str {
        self.attribute.column_name()
    }

    /// Rate for one impression's attribute value; `None` when the value was
    /// never observed in the labeled set.
    pub fn rate_for(&self, imp: &Impression) -> Option<f64> {
        self.rates.get(&self.attribute.key_of(imp)).copied()
    }

    pub fn distinct_values(&self) -> usize {
        self.rates.len()
    }
}

/// Builds the full set of historic CTR tables from the labeled impressions
/// contained in `impressions`.
pub fn build_ctr_tables(impressions: &[Impression]) -> Vec<CtrTable> {
    let labeled_rows = impressions.iter().filter(|imp| imp.is_click.is_some()).count();
    let tables: Vec<CtrTable> = CtrAttribute::ALL
        .iter()
        .map(|attr| CtrTable::from_labeled(*attr, impressions))
        .collect();

    info!(
        component = "ctr",
        event = "ctr.tables.built",
        labeled_rows,
        tables = tables.len()
    );
    tables
}
