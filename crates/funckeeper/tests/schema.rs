use std::path::{Path, PathBuf};

use anyhow::Result;
use funckeeper::{function_meta, CallStatus, Keeper, KeeperConfig, KeeperError, SearchQuery};
use rusqlite::Connection;
use serde_json::json;
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("funckeeper-schema-{}", Ulid::new()));
    if let Err(err) = std::fs::create_dir_all(&dir) {
        panic!("failed to create {}: {err}", dir.display());
    }
    dir
}

fn cleanup(dir: &Path) {
    let _ = std::fs::remove_dir_all(dir);
}

fn seed_legacy_store(db_path: &Path) {
    let conn = match Connection::open(db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to create legacy store: {err}"),
    };
    let seeded = conn.execute_batch(
        "CREATE TABLE function_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            func_name TEXT NOT NULL,
            source_code TEXT,
            args TEXT,
            kwargs TEXT,
            return_value TEXT,
            execution_time REAL,
            status TEXT,
            error_message TEXT,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
         );
         INSERT INTO function_records
            (func_name, source_code, args, kwargs, return_value, execution_time, status, timestamp)
         VALUES
            ('legacy_total', 'fn legacy_total() {}', '[1, 2]', '{}', '3', 0.25, 'success',
             '2024-11-27 18:13:47');
         INSERT INTO function_records
            (func_name, args, kwargs, execution_time, status, error_message, timestamp)
         VALUES
            ('legacy_total', '[]', '{}', 0.5, 'error', 'empty input', '2024-11-27 18:14:00');",
    );
    if let Err(err) = seeded {
        panic!("failed to seed legacy store: {err}");
    }
}

fn halve(value: i64) -> i64 {
    value / 2
}

#[test]
fn older_stores_open_and_read_new_columns_as_absent() {
    let dir = temp_dir();
    let db_path = dir.join("legacy.db");
    seed_legacy_store(&db_path);

    let keeper = must(Keeper::from_config(
        &KeeperConfig::new(&db_path).with_timezone_offset_hours(8.0),
    ));

    let hits = must(keeper.query().search(&SearchQuery::new()));
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|hit| hit.documentation.is_none()));
    assert_eq!(hits[0].last_execution.error.as_deref(), Some("empty input"));
    assert_eq!(hits[1].last_execution.return_value, Some(json!(3)));
    assert_eq!(hits[1].last_execution.timestamp, "2024-11-27T18:13:47.000000+08:00");

    let Some(detail) = must(keeper.query().detail(hits[0].id)) else {
        panic!("legacy failure should have a detail view");
    };
    assert_eq!(detail.status, CallStatus::Error);
    assert!(detail.tags.is_empty());
    assert!(detail.dependencies.is_empty());
    assert_eq!(detail.error_type.as_deref(), Some("unknown"));
    assert_eq!(detail.error_message.as_deref(), Some("empty input"));
    assert_eq!(detail.error_state, Some(serde_json::Value::Null));

    let tagged = must(keeper.query().search(&SearchQuery::new().tag("nightly")));
    assert!(tagged.is_empty());

    let info = must(keeper.query().function_info("legacy_total"));
    let Some(info) = info else {
        panic!("legacy function should be known");
    };
    assert!(info.doc_string.is_none());

    cleanup(&dir);
}

#[test]
fn new_calls_append_after_legacy_rows() {
    let dir = temp_dir();
    let db_path = dir.join("legacy.db");
    seed_legacy_store(&db_path);

    let keeper = must(Keeper::open(&db_path));
    let half = keeper.wrap(function_meta!(halve), &["nightly"], halve);
    assert_eq!(must(half.invoke(10_i64)), 5);

    let tagged = must(keeper.query().search(&SearchQuery::new().tag("nightly")));
    assert_eq!(tagged.len(), 1);
    assert!(tagged[0].id > 2);
    assert_eq!(must(keeper.query().search(&SearchQuery::new())).len(), 3);
    drop(keeper);

    let reopened = must(Keeper::open(&db_path));
    assert_eq!(must(reopened.query().search(&SearchQuery::new())).len(), 3);

    cleanup(&dir);
}

#[test]
fn unopenable_store_is_reported_as_a_storage_error() {
    let dir = temp_dir();
    let blocker = dir.join("blocker");
    if let Err(err) = std::fs::write(&blocker, b"not a directory") {
        panic!("failed to write blocker file: {err}");
    }

    let err = match Keeper::open(blocker.join("records.db")) {
        Ok(_) => panic!("a file cannot be used as a parent directory"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<KeeperError>(),
        Some(KeeperError::StorageOpen { .. })
    ));

    cleanup(&dir);
}
