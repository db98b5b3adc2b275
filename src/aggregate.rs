//! Windowed aggregation primitives over a lag-filtered join slice.
//!
//! Every primitive returns a map keyed uniquely by frame row. Groups with no
//! matching events are absent from the map, never zero-filled: the null
//! policy belongs to the consumer of the assembled table.

use std::collections::{HashMap, HashSet};

use crate::log_join::{GroupSlice, LagSlice, SliceEvent};
use crate::tables::CategoryDim;

const SECONDS_PER_MINUTE: f64 = 60.0;

/// What a unique-count pass deduplicates on within each group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueKey {
    Item,
    Session,
    Category(CategoryDim),
}

/// One windowed aggregation pass, the declarative unit the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregateFeature {
    VisitCount {
        window_days: i64,
    },
    VisitCountInCategory {
        dim: CategoryDim,
        value: i64,
        window_days: i64,
    },
    UniqueCount {
        key: UniqueKey,
        window_days: i64,
    },
    AvgPriceOfUniqueItems {
        window_days: i64,
    },
    DaysSinceLastVisit,
    AvgSessionDuration {
        window_days: i64,
    },
}

/// Runs one pass over the slice.
pub fn evaluate(
    slice: &LagSlice,
    feature: AggregateFeature,
    recency_unit_seconds: f64,
) -> HashMap<usize, f64> {
    match feature {
        AggregateFeature::VisitCount { window_days } => visit_count(slice, window_days),
        AggregateFeature::VisitCountInCategory {
            dim,
            value,
            window_days,
        } => visit_count_in_category(slice, window_days, dim, value),
        AggregateFeature::UniqueCount { key, window_days } => {
            unique_count(slice, window_days, key)
        }
        AggregateFeature::AvgPriceOfUniqueItems { window_days } => {
            avg_price_of_unique_items(slice, window_days)
        }
        AggregateFeature::DaysSinceLastVisit => {
            days_since_last_visit(slice, recency_unit_seconds)
        }
        AggregateFeature::AvgSessionDuration { window_days } => {
            avg_session_duration(slice, window_days)
        }
    }
}

/// Row count within the window.
pub fn visit_count(slice: &LagSlice, window_days: i64) -> HashMap<usize, f64> {
    per_group(slice, |group| {
        let count = in_window(slice, group, window_days).count();
        (count > 0).then_some(count as f64)
    })
}

/// Row count within the window, restricted to one categorical value.
pub fn visit_count_in_category(
    slice: &LagSlice,
    window_days: i64,
    dim: CategoryDim,
    value: i64,
) -> HashMap<usize, f64> {
    per_group(slice, |group| {
        let count = in_window(slice, group, window_days)
            .filter(|event| event.category_value(dim) == Some(value))
            .count();
        (count > 0).then_some(count as f64)
    })
}

/// Distinct-key count within the window. Null category values (unknown
/// items) never count as a distinct value.
pub fn unique_count(slice: &LagSlice, window_days: i64, key: UniqueKey) -> HashMap<usize, f64> {
    per_group(slice, |group| {
        let mut seen: HashSet<i64> = HashSet::new();
        for event in in_window(slice, group, window_days) {
            match key {
                UniqueKey::Item => {
                    seen.insert(event.item_id);
                }
                UniqueKey::Session => {
                    seen.insert(event.session_id);
                }
                UniqueKey::Category(dim) => {
                    if let Some(value) = event.category_value(dim) {
                        seen.insert(value);
                    }
                }
            }
        }
        (!seen.is_empty()).then_some(seen.len() as f64)
    })
}

/// Price sum over the deduplicated-by-item rows divided by the unique item
/// count. Items missing from the catalog still count toward the denominator
/// but contribute no price; a zero denominator yields no value.
pub fn avg_price_of_unique_items(slice: &LagSlice, window_days: i64) -> HashMap<usize, f64> {
    per_group(slice, |group| {
        let mut seen: HashSet<i64> = HashSet::new();
        let mut price_sum = 0.0;
        for event in in_window(slice, group, window_days) {
            if seen.insert(event.item_id) {
                if let Some(price) = event.item_price {
                    price_sum += price;
                }
            }
        }
        if seen.is_empty() {
            None
        } else {
            Some(price_sum / seen.len() as f64)
        }
    })
}

/// Elapsed time from the most recent event in the whole lag slice to the
/// impression, in `unit_seconds` units. Window-independent by design.
pub fn days_since_last_visit(slice: &LagSlice, unit_seconds: f64) -> HashMap<usize, f64> {
    per_group(slice, |group| {
        // Events are stably time-sorted, so the last maximal timestamp wins
        // ties deterministically.
        let latest = group.events.iter().max_by_key(|event| event.server_time)?;
        let elapsed = (group.impression_time - latest.server_time).num_seconds() as f64;
        Some(elapsed / unit_seconds)
    })
}

/// Per-session duration (latest minus earliest event, minutes) summed over
/// sessions and divided by the distinct session count. Single-event sessions
/// count in the denominator with zero duration.
pub fn avg_session_duration(slice: &LagSlice, window_days: i64) -> HashMap<usize, f64> {
    per_group(slice, |group| {
        let mut bounds: HashMap<i64, (chrono::NaiveDateTime, chrono::NaiveDateTime)> =
            HashMap::new();
        for event in in_window(slice, group, window_days) {
            bounds
                .entry(event.session_id)
                .and_modify(|(first, last)| {
                    if event.server_time < *first {
                        *first = event.server_time;
                    }
                    if event.server_time > *last {
                        *last = event.server_time;
                    }
                })
                .or_insert((event.server_time, event.server_time));
        }

        if bounds.is_empty() {
            return None;
        }

        let total_minutes: f64 = bounds
            .values()
            .map(|(first, last)| (*last - *first).num_seconds() as f64 / SECONDS_PER_MINUTE)
            .sum();
        Some(total_minutes / bounds.len() as f64)
    })
}

fn per_group(
    slice: &LagSlice,
    mut value_of: impl FnMut(&GroupSlice) -> Option<f64>,
) -> HashMap<usize, f64> {
    let mut out = HashMap::with_capacity(slice.groups.len());
    for group in &slice.groups {
        if let Some(value) = value_of(group) {
            out.insert(group.row, value);
        }
    }
    out
}

fn in_window<'s>(
    slice: &LagSlice,
    group: &'s GroupSlice,
    window_days: i64,
) -> impl Iterator<Item = &'s SliceEvent> {
    let max_age = slice.lag_days + window_days;
    group.events.iter().filter(move |event| event.age_days <= max_age)
}
