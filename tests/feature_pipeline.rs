use std::fs;
use std::path::{Path, PathBuf};

use ctrfeat::{
    load_events, load_impressions, load_items, run_pipeline, FeatureError, FeaturePipelineConfig,
    InputTables, LabelPresence, LoadError,
};
use tempfile::TempDir;

const ITEMS_CSV: &str = "\
item_id,item_price,category_1,category_2,category_3,product_type
10,100.0,1,11,111,5
20,50.0,2,11,112,5
30,10.0,1,12,113,6
";

// User 1's history relative to imp-a (2018-11-15 00:00:00):
//   age 0: item 10 session 104 (embargoed at lag >= 1)
//   age 1: items 10, 20 in session 100 (10 minutes apart), item 10 in
//          singleton session 101
//   age 3: item 30 session 102
//   age 9: unknown item 999 session 103
const VIEW_LOG_CSV: &str = "\
user_id,item_id,session_id,server_time
1,10,100,2018-11-13 10:00:00
1,20,100,2018-11-13 10:10:00
1,10,101,2018-11-13 12:00:00
1,30,102,2018-11-11 09:00:00
1,999,103,2018-11-05 09:00:00
1,10,104,2018-11-14 23:00:00
";

const TRAIN_CSV: &str = "\
user_id,impression_id,impression_time,app_code,os_version,is_4G,is_click
1,imp-a,2018-11-15 00:00:00,5,latest,1,1
2,imp-b,2018-11-15 00:00:00,5,old,0,0
";

const TEST_CSV: &str = "\
user_id,impression_id,impression_time,app_code,os_version,is_4G
1,imp-c,2018-11-16 00:00:00,99,latest,1
";

fn seed_inputs(dir: &Path) -> InputTables {
    fs::write(dir.join("item_data.csv"), ITEMS_CSV).expect("write items");
    fs::write(dir.join("view_log.csv"), VIEW_LOG_CSV).expect("write view log");
    fs::write(dir.join("train.csv"), TRAIN_CSV).expect("write train");
    fs::write(dir.join("test.csv"), TEST_CSV).expect("write test");

    let catalog = load_items(&dir.join("item_data.csv")).expect("load items");
    let events = load_events(&dir.join("view_log.csv")).expect("load view log");
    let mut impressions =
        load_impressions(&dir.join("train.csv"), LabelPresence::Labeled).expect("load train");
    impressions.extend(
        load_impressions(&dir.join("test.csv"), LabelPresence::Unlabeled).expect("load test"),
    );

    InputTables {
        catalog,
        events,
        impressions,
    }
}

fn config(output_dir: PathBuf, min_lag: i64, max_lag: i64, windows: Vec<i64>) -> FeaturePipelineConfig {
    FeaturePipelineConfig {
        window_days: windows,
        min_lag_days: min_lag,
        max_lag_days: max_lag,
        output_dir,
        ..FeaturePipelineConfig::default()
    }
}

struct Snapshot {
    headers: Vec<String>,
    rows: Vec<csv::StringRecord>,
}

impl Snapshot {
    fn read(path: &Path) -> Self {
        let mut reader = csv::Reader::from_path(path).expect("open snapshot");
        let headers = reader
            .headers()
            .expect("snapshot headers")
            .iter()
            .map(str::to_string)
            .collect();
        let rows = reader
            .records()
            .collect::<Result<_, _>>()
            .expect("snapshot records");
        Self { headers, rows }
    }

    fn column_index(&self, name: &str) -> usize {
        self.headers
            .iter()
            .position(|header| header == name)
            .unwrap_or_else(|| panic!("column {name} must exist"))
    }

    fn cell(&self, row: usize, column: &str) -> &str {
        &self.rows[row][self.column_index(column)]
    }

    fn value(&self, row: usize, column: &str) -> Option<f64> {
        let raw = self.cell(row, column);
        if raw.is_empty() {
            None
        } else {
            Some(raw.parse().expect("numeric snapshot cell"))
        }
    }
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "actual={actual} expected={expected}"
    );
}

#[test]
fn every_lag_snapshot_has_one_row_per_impression_in_input_order() {
    let dir = TempDir::new().expect("temp dir");
    let tables = seed_inputs(dir.path());
    let cfg = config(dir.path().join("out"), 1, 3, vec![1, 3, 7, 14, 30]);

    let report = run_pipeline(&tables, &cfg).expect("pipeline");
    assert_eq!(report.failed_lags(), 0);
    assert_eq!(report.lag_summaries.len(), 3);

    for summary in &report.lag_summaries {
        assert_eq!(summary.rows, 3, "lag {}", summary.lag_days);
        let path = summary.snapshot_path.as_ref().expect("snapshot path");
        let snapshot = Snapshot::read(path);
        assert_eq!(snapshot.rows.len(), 3);

        let ids: Vec<&str> = (0..3).map(|row| snapshot.cell(row, "impression_id")).collect();
        assert_eq!(ids, vec!["imp-a", "imp-b", "imp-c"]);

        let report_raw = fs::read(
            cfg.output_dir
                .join(format!("features_lag_{}d.report.json", summary.lag_days)),
        )
        .expect("run report exists");
        let parsed: serde_json::Value =
            serde_json::from_slice(&report_raw).expect("run report parses");
        assert_eq!(parsed["rows"], 3);
        assert_eq!(parsed["schema_fingerprint"], report.schema_fingerprint.as_str());
    }
}

#[test]
fn windowed_features_match_hand_computed_values_at_lag_one() {
    let dir = TempDir::new().expect("temp dir");
    let tables = seed_inputs(dir.path());
    let cfg = config(dir.path().join("out"), 1, 1, vec![1, 3, 7, 14, 30]);

    run_pipeline(&tables, &cfg).expect("pipeline");
    let snapshot = Snapshot::read(&cfg.output_dir.join("features_lag_1d.csv"));

    // imp-a, window 1: the three age-1 events; the age-0 event is embargoed.
    assert_close(snapshot.value(0, "cnt_visit_l1d").expect("visits"), 3.0);
    assert_close(snapshot.value(0, "cnt_visit_l3d").expect("visits"), 4.0);
    assert_close(snapshot.value(0, "cnt_visit_l7d").expect("visits"), 4.0);
    assert_close(snapshot.value(0, "cnt_visit_l14d").expect("visits"), 5.0);

    // Per-category visit counts over catalog values {1, 2}.
    assert_close(
        snapshot.value(0, "cnt_visit_category_1_1_l1d").expect("cat 1"),
        2.0,
    );
    assert_close(
        snapshot.value(0, "cnt_visit_category_1_2_l1d").expect("cat 2"),
        1.0,
    );

    // Unique items {10, 20} in window 1; the unknown item 999 joins the
    // denominator at window 14 without contributing a price.
    assert_close(snapshot.value(0, "cnt_uniq_item_l1d").expect("uniq"), 2.0);
    assert_close(
        snapshot.value(0, "avg_price_uniq_item_l1d").expect("price"),
        75.0,
    );
    assert_close(snapshot.value(0, "cnt_uniq_item_l14d").expect("uniq"), 4.0);
    assert_close(
        snapshot.value(0, "avg_price_uniq_item_l14d").expect("price"),
        40.0,
    );

    // Unique category values; the unknown item's null never counts.
    assert_close(snapshot.value(0, "cnt_uniq_category_1_l1d").expect("c1"), 2.0);
    assert_close(snapshot.value(0, "cnt_uniq_category_2_l1d").expect("c2"), 1.0);
    assert_close(snapshot.value(0, "cnt_uniq_category_3_l1d").expect("c3"), 2.0);
    assert_close(
        snapshot.value(0, "cnt_uniq_product_type_l1d").expect("pt"),
        1.0,
    );
    assert_close(snapshot.value(0, "cnt_uniq_category_1_l14d").expect("c1"), 2.0);

    // Sessions: {100, 101} in window 1; 10-minute session plus a singleton.
    assert_close(snapshot.value(0, "cnt_session_id_l1d").expect("sessions"), 2.0);
    assert_close(
        snapshot.value(0, "avg_session_time_l1d").expect("session time"),
        5.0,
    );
    assert_close(
        snapshot.value(0, "avg_session_time_l3d").expect("session time"),
        10.0 / 3.0,
    );

    // Latest admissible event is 1.5 days before the impression; the unit is
    // 300 seconds.
    assert_close(
        snapshot
            .value(0, "cnt_days_since_last_visit")
            .expect("recency"),
        1.5 * 86_400.0 / 300.0,
    );
}

#[test]
fn visit_counts_grow_monotonically_with_window_length() {
    let dir = TempDir::new().expect("temp dir");
    let tables = seed_inputs(dir.path());
    let windows = vec![1, 3, 7, 14, 30];
    let cfg = config(dir.path().join("out"), 1, 3, windows.clone());

    run_pipeline(&tables, &cfg).expect("pipeline");

    for lag in 1..=3 {
        let snapshot = Snapshot::read(&cfg.output_dir.join(format!("features_lag_{lag}d.csv")));
        for row in 0..snapshot.rows.len() {
            let mut previous = 0.0;
            for w in &windows {
                let count = snapshot
                    .value(row, &format!("cnt_visit_l{w}d"))
                    .unwrap_or(0.0);
                assert!(
                    count >= previous,
                    "lag {lag} row {row}: cnt_visit_l{w}d regressed"
                );
                previous = count;
            }
        }
    }
}

#[test]
fn zero_event_impressions_have_empty_feature_fields_not_zeros() {
    let dir = TempDir::new().expect("temp dir");
    let tables = seed_inputs(dir.path());
    let cfg = config(dir.path().join("out"), 1, 1, vec![1, 7]);

    run_pipeline(&tables, &cfg).expect("pipeline");
    let snapshot = Snapshot::read(&cfg.output_dir.join("features_lag_1d.csv"));

    // imp-b's user has no log rows at all.
    assert_eq!(snapshot.cell(1, "impression_id"), "imp-b");
    assert_eq!(snapshot.cell(1, "is_click"), "0");
    for column in [
        "cnt_visit_l1d",
        "cnt_uniq_item_l1d",
        "avg_price_uniq_item_l1d",
        "cnt_uniq_category_1_l7d",
        "cnt_session_id_l1d",
        "avg_session_time_l7d",
        "cnt_days_since_last_visit",
    ] {
        assert_eq!(snapshot.cell(1, column), "", "{column} must be null");
    }
}

#[test]
fn ctr_columns_join_onto_test_rows_without_using_their_labels() {
    let dir = TempDir::new().expect("temp dir");
    let tables = seed_inputs(dir.path());
    let cfg = config(dir.path().join("out"), 1, 1, vec![1]);

    run_pipeline(&tables, &cfg).expect("pipeline");
    let snapshot = Snapshot::read(&cfg.output_dir.join("features_lag_1d.csv"));

    // app_code 5 appears in two labeled rows with one click.
    assert_close(snapshot.value(0, "app_code_ctr").expect("ctr"), 0.5);
    assert_close(snapshot.value(1, "app_code_ctr").expect("ctr"), 0.5);
    // imp-c's app_code 99 exists only in the unlabeled set.
    assert_eq!(snapshot.value(2, "app_code_ctr"), None);

    // Both labeled rows share weekday Thursday; imp-c falls on a Friday the
    // labeled set never saw.
    assert_close(snapshot.value(0, "weekday_ctr").expect("ctr"), 0.5);
    assert_eq!(snapshot.value(2, "weekday_ctr"), None);
    assert_eq!(snapshot.value(2, "weekday_hour_ctr"), None);

    // os_version and is_4G rates from the labeled rows attach to imp-c.
    assert_close(snapshot.value(2, "os_version_ctr").expect("ctr"), 1.0);
    assert_close(snapshot.value(2, "is_4G_ctr").expect("ctr"), 1.0);

    // The unlabeled row keeps a null label.
    assert_eq!(snapshot.cell(2, "is_click"), "");
}

#[test]
fn recency_is_window_independent_and_respects_the_embargo() {
    let dir = TempDir::new().expect("temp dir");
    let tables = seed_inputs(dir.path());

    let narrow = config(dir.path().join("narrow"), 1, 1, vec![1]);
    let wide = config(dir.path().join("wide"), 1, 1, vec![1, 3, 7, 14, 30]);
    run_pipeline(&tables, &narrow).expect("pipeline");
    run_pipeline(&tables, &wide).expect("pipeline");

    let expected = 1.5 * 86_400.0 / 300.0;
    for out in [&narrow.output_dir, &wide.output_dir] {
        let snapshot = Snapshot::read(&out.join("features_lag_1d.csv"));
        assert_close(
            snapshot
                .value(0, "cnt_days_since_last_visit")
                .expect("recency"),
            expected,
        );
    }

    // At lag 2 the age-1 events are embargoed too; the latest admissible
    // event is 3 days 15 hours old.
    let lagged = config(dir.path().join("lagged"), 2, 2, vec![1, 3, 7, 14, 30]);
    run_pipeline(&tables, &lagged).expect("pipeline");
    let snapshot = Snapshot::read(&lagged.output_dir.join("features_lag_2d.csv"));
    assert_close(
        snapshot
            .value(0, "cnt_days_since_last_visit")
            .expect("recency"),
        (3.0 * 86_400.0 + 15.0 * 3_600.0) / 300.0,
    );
}

#[test]
fn lag_boundary_is_inclusive_at_age_equal_to_lag() {
    let dir = TempDir::new().expect("temp dir");
    let tables = seed_inputs(dir.path());

    // At lag 0 the age-0 event joins the age-1 events inside window 1.
    let lag0 = config(dir.path().join("lag0"), 0, 0, vec![1]);
    run_pipeline(&tables, &lag0).expect("pipeline");
    let snapshot = Snapshot::read(&lag0.output_dir.join("features_lag_0d.csv"));
    assert_close(snapshot.value(0, "cnt_visit_l1d").expect("visits"), 4.0);

    // At lag 1 the age-0 event is excluded: age == lag - 1.
    let lag1 = config(dir.path().join("lag1"), 1, 1, vec![1]);
    run_pipeline(&tables, &lag1).expect("pipeline");
    let snapshot = Snapshot::read(&lag1.output_dir.join("features_lag_1d.csv"));
    assert_close(snapshot.value(0, "cnt_visit_l1d").expect("visits"), 3.0);
}

#[test]
fn duplicate_impression_keys_abort_before_any_aggregation() {
    let dir = TempDir::new().expect("temp dir");
    let mut tables = seed_inputs(dir.path());
    let duplicate = tables.impressions[0].clone();
    tables.impressions.push(duplicate);
    let cfg = config(dir.path().join("out"), 1, 1, vec![1]);

    let err = run_pipeline(&tables, &cfg).expect_err("must fail");
    assert!(matches!(err, FeatureError::Frame(_)));
    assert!(!cfg.output_dir.join("features_lag_1d.csv").exists());
}

#[test]
fn loader_errors_name_the_offending_table_and_column() {
    let dir = TempDir::new().expect("temp dir");
    fs::write(
        dir.path().join("view_log.csv"),
        "user_id,item_id,server_time\n1,10,2018-11-13 10:00:00\n",
    )
    .expect("write view log");

    let err = load_events(&dir.path().join("view_log.csv")).expect_err("must fail");
    match err {
        LoadError::MissingColumn { table, column } => {
            assert_eq!(table, "view_log");
            assert_eq!(column, "session_id");
        }
        other => panic!("unexpected error: {other}"),
    }

    fs::write(
        dir.path().join("train.csv"),
        "user_id,impression_id,impression_time,app_code,os_version,is_4G,is_click\n\
         1,imp-a,not-a-time,5,latest,1,0\n",
    )
    .expect("write train");

    let err =
        load_impressions(&dir.path().join("train.csv"), LabelPresence::Labeled).expect_err("must fail");
    assert!(matches!(
        err,
        LoadError::InvalidTimestamp {
            table: "impressions",
            column: "impression_time",
            ..
        }
    ));
}
