//! Raw input tables: item catalog, view log, impressions.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::{NaiveDateTime, Timelike};
use csv::StringRecord;
use thiserror::Error;
use tracing::info;

pub(crate) const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Categorical item dimensions the aggregation engine can group by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CategoryDim {
    Category1,
    Category2,
    Category3,
    ProductType,
}

impl CategoryDim {
    pub const ALL: [CategoryDim; 4] = [
        Self::Category1,
        Self::Category2,
        Self::Category3,
        Self::ProductType,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Category1 => "category_1",
            Self::Category2 => "category_2",
            Self::Category3 => "category_3",
            Self::ProductType => "product_type",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub item_id: i64,
    pub item_price: f64,
    pub category_1: i64,
    pub category_2: i64,
    pub category_3: i64,
    pub product_type: i64,
}

impl Item {
    pub fn category_value(&self, dim: CategoryDim) -> i64 {
        match dim {
            CategoryDim::Category1 => self.category_1,
            CategoryDim::Category2 => self.category_2,
            CategoryDim::Category3 => self.category_3,
            CategoryDim::ProductType => self.product_type,
        }
    }
}

/// Item catalog indexed by `item_id`.
///
/// Distinct per-dimension values are enumerated from the loaded data at run
/// time; the per-category feature columns are derived from them.
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    by_id: HashMap<i64, Item>,
}

impl ItemCatalog {
    pub fn new(items: Vec<Item>) -> Self {
        let mut by_id = HashMap::with_capacity(items.len());
        for item in items {
            by_id.insert(item.item_id, item);
        }
        Self { by_id }
    }

    pub fn get(&self, item_id: i64) -> Option<&Item> {
        self.by_id.get(&item_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Sorted distinct values of one categorical dimension.
    pub fn distinct_values(&self, dim: CategoryDim) -> Vec<i64> {
        let set: BTreeSet<i64> = self
            .by_id
            .values()
            .map(|item| item.category_value(dim))
            .collect();
        set.into_iter().collect()
    }
}

/// One browsing event from the view log. Duplicate rows are legal and kept.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub user_id: i64,
    pub item_id: i64,
    pub session_id: i64,
    pub server_time: NaiveDateTime,
}

/// One ad impression; `is_click` is absent for scoring-only rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Impression {
    pub user_id: i64,
    pub impression_id: String,
    pub impression_time: NaiveDateTime,
    pub app_code: i64,
    pub os_version: String,
    pub is_4g: i64,
    pub is_click: Option<i64>,
}

impl Impression {
    /// Monday = 0, matching the historic-CTR weekday attribute.
    pub fn weekday(&self) -> u32 {
        use chrono::Datelike;
        self.impression_time.weekday().num_days_from_monday()
    }

    pub fn hour(&self) -> u32 {
        self.impression_time.hour()
    }
}

/// Whether an impression file carries the `is_click` label column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPresence {
    Labeled,
    Unlabeled,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("table {table} is missing required column {column}")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },
    #[error("table {table} field {field} has unparseable value '{value}'")]
    ParseField {
        table: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("table {table} column {column} has unparseable timestamp '{value}'")]
    InvalidTimestamp {
        table: &'static str,
        column: &'static str,
        value: String,
    },
}

pub fn load_items(path: &Path) -> Result<ItemCatalog, LoadError> {
    const TABLE: &str = "items";
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();

    let item_id = header_index(&headers, TABLE, "item_id")?;
    let item_price = header_index(&headers, TABLE, "item_price")?;
    let category_1 = header_index(&headers, TABLE, "category_1")?;
    let category_2 = header_index(&headers, TABLE, "category_2")?;
    let category_3 = header_index(&headers, TABLE, "category_3")?;
    let product_type = header_index(&headers, TABLE, "product_type")?;

    let mut items = Vec::new();
    for record in reader.records() {
        let record = record?;
        items.push(Item {
            item_id: parse_i64(&record, item_id, TABLE, "item_id")?,
            item_price: parse_f64(&record, item_price, TABLE, "item_price")?,
            category_1: parse_i64(&record, category_1, TABLE, "category_1")?,
            category_2: parse_i64(&record, category_2, TABLE, "category_2")?,
            category_3: parse_i64(&record, category_3, TABLE, "category_3")?,
            product_type: parse_i64(&record, product_type, TABLE, "product_type")?,
        });
    }

    let catalog = ItemCatalog::new(items);
    info!(
        component = "tables",
        event = "tables.items.loaded",
        path = %path.display(),
        rows = catalog.len()
    );
    Ok(catalog)
}

pub fn load_events(path: &Path) -> Result<Vec<Event>, LoadError> {
    const TABLE: &str = "view_log";
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();

    let user_id = header_index(&headers, TABLE, "user_id")?;
    let item_id = header_index(&headers, TABLE, "item_id")?;
    let session_id = header_index(&headers, TABLE, "session_id")?;
    let server_time = header_index(&headers, TABLE, "server_time")?;

    let mut events = Vec::new();
    for record in reader.records() {
        let record = record?;
        events.push(Event {
            user_id: parse_i64(&record, user_id, TABLE, "user_id")?,
            item_id: parse_i64(&record, item_id, TABLE, "item_id")?,
            session_id: parse_i64(&record, session_id, TABLE, "session_id")?,
            server_time: parse_time(&record, server_time, TABLE, "server_time")?,
        });
    }

    info!(
        component = "tables",
        event = "tables.view_log.loaded",
        path = %path.display(),
        rows = events.len()
    );
    Ok(events)
}

pub fn load_impressions(path: &Path, labels: LabelPresence) -> Result<Vec<Impression>, LoadError> {
    const TABLE: &str = "impressions";
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();

    let user_id = header_index(&headers, TABLE, "user_id")?;
    let impression_id = header_index(&headers, TABLE, "impression_id")?;
    let impression_time = header_index(&headers, TABLE, "impression_time")?;
    let app_code = header_index(&headers, TABLE, "app_code")?;
    let os_version = header_index(&headers, TABLE, "os_version")?;
    let is_4g = header_index(&headers, TABLE, "is_4G")?;
    let is_click = match labels {
        LabelPresence::Labeled => Some(header_index(&headers, TABLE, "is_click")?),
        LabelPresence::Unlabeled => None,
    };

    let mut impressions = Vec::new();
    for record in reader.records() {
        let record = record?;
        impressions.push(Impression {
            user_id: parse_i64(&record, user_id, TABLE, "user_id")?,
            impression_id: field(&record, impression_id).to_string(),
            impression_time: parse_time(&record, impression_time, TABLE, "impression_time")?,
            app_code: parse_i64(&record, app_code, TABLE, "app_code")?,
            os_version: field(&record, os_version).to_string(),
            is_4g: parse_i64(&record, is_4g, TABLE, "is_4G")?,
            is_click: match is_click {
                Some(idx) => Some(parse_i64(&record, idx, TABLE, "is_click")?),
                None => None,
            },
        });
    }

    info!(
        component = "tables",
        event = "tables.impressions.loaded",
        path = %path.display(),
        labeled = matches!(labels, LabelPresence::Labeled),
        rows = impressions.len()
    );
    Ok(impressions)
}

fn header_index(
    headers: &StringRecord,
    table: &'static str,
    column: &'static str,
) -> Result<usize, LoadError> {
    headers
        .iter()
        .position(|name| name.trim() == column)
        .ok_or(LoadError::MissingColumn { table, column })
}

fn field<'r>(record: &'r StringRecord, idx: usize) -> &'r str {
    record.get(idx).unwrap_or_default().trim()
}

fn parse_i64(
    record: &StringRecord,
    idx: usize,
    table: &'static str,
    name: &'static str,
) -> Result<i64, LoadError> {
    let raw = field(record, idx);
    raw.parse::<i64>().map_err(|_| LoadError::ParseField {
        table,
        field: name,
        value: raw.to_string(),
    })
}

fn parse_f64(
    record: &StringRecord,
    idx: usize,
    table: &'static str,
    name: &'static str,
) -> Result<f64, LoadError> {
    let raw = field(record, idx);
    raw.parse::<f64>().map_err(|_| LoadError::ParseField {
        table,
        field: name,
        value: raw.to_string(),
    })
}

fn parse_time(
    record: &StringRecord,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<NaiveDateTime, LoadError> {
    let raw = field(record, idx);
    NaiveDateTime::parse_from_str(raw, TIME_FORMAT).map_err(|_| LoadError::InvalidTimestamp {
        table,
        column,
        value: raw.to_string(),
    })
}
