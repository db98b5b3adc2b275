//! Windowed join of the view log onto impressions.
//!
//! The join never materializes an impression × event cross product: events
//! are indexed by user once, then each impression selects its user's events
//! whose age falls inside the admissible `[lag, lag + max_window]` interval.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::info;

use crate::tables::{CategoryDim, Event, Impression, ItemCatalog};

const SECONDS_PER_DAY: i64 = 86_400;

/// Event age in whole days at impression time.
///
/// True floor (euclidean) of the second delta, so an event dated after the
/// impression gets a negative age and can never satisfy a `lag >= 0` bound.
pub fn age_days(impression_time: NaiveDateTime, server_time: NaiveDateTime) -> i64 {
    (impression_time - server_time)
        .num_seconds()
        .div_euclid(SECONDS_PER_DAY)
}

/// Per-user view of the event log, each user's events stably sorted by
/// `server_time` (deterministic recency tie-break).
#[derive(Debug, Clone, Default)]
pub struct EventLogIndex {
    by_user: HashMap<i64, Vec<Event>>,
}

impl EventLogIndex {
    pub fn build(events: &[Event]) -> Self {
        let mut by_user: HashMap<i64, Vec<Event>> = HashMap::new();
        for event in events {
            by_user.entry(event.user_id).or_default().push(event.clone());
        }
        for list in by_user.values_mut() {
            list.sort_by_key(|event| event.server_time);
        }

        info!(
            component = "log_join",
            event = "log_join.index.built",
            users = by_user.len(),
            rows = by_user.values().map(Vec::len).sum::<usize>()
        );
        Self { by_user }
    }

    pub fn events_for(&self, user_id: i64) -> &[Event] {
        self.by_user.get(&user_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }
}

/// One log event joined with its item attributes, as seen from one
/// impression. Item attributes are null when the catalog has no such item.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceEvent {
    pub server_time: NaiveDateTime,
    pub age_days: i64,
    pub item_id: i64,
    pub session_id: i64,
    pub item_price: Option<f64>,
    pub category_1: Option<i64>,
    pub category_2: Option<i64>,
    pub category_3: Option<i64>,
    pub product_type: Option<i64>,
}

impl SliceEvent {
    pub fn category_value(&self, dim: CategoryDim) -> Option<i64> {
        match dim {
            CategoryDim::Category1 => self.category_1,
            CategoryDim::Category2 => self.category_2,
            CategoryDim::Category3 => self.category_3,
            CategoryDim::ProductType => self.product_type,
        }
    }
}

/// The events admissible for one impression. `row` is the impression's
/// position in the table the slice was built from (the feature frame row).
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSlice {
    pub row: usize,
    pub impression_time: NaiveDateTime,
    pub events: Vec<SliceEvent>,
}

/// Lag-filtered join output: impressions with at least one admissible event.
/// Impressions with none are absent and surface as nulls after assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct LagSlice {
    pub lag_days: i64,
    pub max_window_days: i64,
    pub groups: Vec<GroupSlice>,
}

pub fn build_lag_slice(
    impressions: &[Impression],
    index: &EventLogIndex,
    catalog: &ItemCatalog,
    lag_days: i64,
    max_window_days: i64,
) -> LagSlice {
    let max_age = lag_days + max_window_days;
    let groups: Vec<GroupSlice> = impressions
        .iter()
        .enumerate()
        .filter_map(|(row, imp)| {
            let events: Vec<SliceEvent> = index
                .events_for(imp.user_id)
                .iter()
                .filter_map(|event| {
                    let age = age_days(imp.impression_time, event.server_time);
                    if age < lag_days || age > max_age {
                        return None;
                    }
                    Some(join_item(event, age, catalog))
                })
                .collect();

            if events.is_empty() {
                None
            } else {
                Some(GroupSlice {
                    row,
                    impression_time: imp.impression_time,
                    events,
                })
            }
        })
        .collect();

    info!(
        component = "log_join",
        event = "log_join.slice.built",
        lag_days,
        max_window_days,
        groups = groups.len(),
        rows = groups.iter().map(|g| g.events.len()).sum::<usize>()
    );

    LagSlice {
        lag_days,
        max_window_days,
        groups,
    }
}

/// Re-filters an already-built slice to a larger lag.
///
/// The caller must ensure the target interval is contained in the source
/// interval (`lag_days >= slice.lag_days` and `lag_days + max_window_days <=
/// slice.lag_days + slice.max_window_days`); under that precondition the
/// result equals an independent [`build_lag_slice`] at the new bounds.
pub fn narrow_lag_slice(slice: &LagSlice, lag_days: i64, max_window_days: i64) -> LagSlice {
    let max_age = lag_days + max_window_days;
    let groups: Vec<GroupSlice> = slice
        .groups
        .iter()
        .filter_map(|group| {
            let events: Vec<SliceEvent> = group
                .events
                .iter()
                .filter(|event| event.age_days >= lag_days && event.age_days <= max_age)
                .cloned()
                .collect();

            if events.is_empty() {
                None
            } else {
                Some(GroupSlice {
                    row: group.row,
                    impression_time: group.impression_time,
                    events,
                })
            }
        })
        .collect();

    LagSlice {
        lag_days,
        max_window_days,
        groups,
    }
}

fn join_item(event: &Event, age: i64, catalog: &ItemCatalog) -> SliceEvent {
    let item = catalog.get(event.item_id);
    SliceEvent {
        server_time: event.server_time,
        age_days: age,
        item_id: event.item_id,
        session_id: event.session_id,
        item_price: item.map(|i| i.item_price),
        category_1: item.map(|i| i.category_1),
        category_2: item.map(|i| i.category_2),
        category_3: item.map(|i| i.category_3),
        product_type: item.map(|i| i.product_type),
    }
}
