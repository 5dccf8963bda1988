use std::collections::BTreeMap;
use std::num::ParseIntError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use funckeeper::{
    function_meta, CallArgs, CallRecord, CallStatus, ErrorTypeTotal, FunctionAggregate,
    FunctionMeta, IntrospectError, Introspection, Introspector, Keeper, KeeperConfig,
    NewCallRecord, RecordFilter, RecordStore, Recorder, SearchQuery, StatisticsQuery,
};
use serde_json::json;
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn temp_db_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("funckeeper-capture-{}", Ulid::new()))
        .join("records.sqlite3")
}

fn fixture_keeper() -> (Keeper, PathBuf) {
    let db_path = temp_db_path();
    let keeper = must(Keeper::from_config(
        &KeeperConfig::new(&db_path).with_timezone_offset_hours(8.0),
    ));
    (keeper, db_path)
}

fn cleanup(db_path: &std::path::Path) {
    if let Some(dir) = db_path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

fn record_count(keeper: &Keeper) -> usize {
    must(keeper.query().search(&SearchQuery::new())).len()
}

/// Parses an amount of cents.
fn parse_amount(raw: &str) -> Result<u64, ParseIntError> {
    use std::str::FromStr;
    u64::from_str(raw.trim())
}

fn add(pair: (i64, i64)) -> i64 {
    pair.0 + pair.1
}

fn checked_index(values: Vec<u8>) -> u8 {
    values[10]
}

fn to_units(cents: u64) -> u64 {
    cents / 100
}

mod ledger_math {
    /// Whole units, rounding any remainder up.
    pub fn to_units(cents: u64) -> u64 {
        cents.div_ceil(100)
    }
}

struct FailingIntrospector;

impl Introspector for FailingIntrospector {
    fn inspect(&self, function: &FunctionMeta) -> Result<Introspection, IntrospectError> {
        Err(IntrospectError::SourceUnavailable {
            function: function.name.clone(),
            reason: "source stripped".to_string(),
        })
    }
}

struct RejectingStore;

impl RecordStore for RejectingStore {
    fn offset(&self) -> time::UtcOffset {
        time::UtcOffset::UTC
    }

    fn insert(&self, _record: &NewCallRecord) -> Result<i64> {
        Err(anyhow!("disk full"))
    }

    fn get(&self, _id: i64) -> Result<Option<CallRecord>> {
        Ok(None)
    }

    fn query(&self, _filter: &RecordFilter) -> Result<Vec<CallRecord>> {
        Ok(Vec::new())
    }

    fn aggregate(&self, _filter: &RecordFilter) -> Result<Vec<FunctionAggregate>> {
        Ok(Vec::new())
    }

    fn error_type_totals(&self) -> Result<Vec<ErrorTypeTotal>> {
        Ok(Vec::new())
    }

    fn latest_for_function(&self, _func_name: &str) -> Result<Option<CallRecord>> {
        Ok(None)
    }
}

#[test]
fn wrapped_function_returns_the_same_value_and_records_one_success() {
    let (keeper, db_path) = fixture_keeper();
    let parse = keeper.wrap(function_meta!(parse_amount), &["billing", "nightly"], parse_amount);

    let wrapped = must(parse.call(" 125 "));
    assert_eq!(wrapped, parse_amount(" 125 "));
    assert_eq!(record_count(&keeper), 1);

    let hits = must(keeper.query().search(&SearchQuery::new()));
    let Some(detail) = must(keeper.query().detail(hits[0].id)) else {
        panic!("detail should exist for a fresh record");
    };
    assert_eq!(detail.func_name, "parse_amount");
    assert_eq!(detail.status, CallStatus::Success);
    assert_eq!(detail.return_value, Some(json!(125)));
    assert_eq!(detail.args, json!([" 125 "]));
    assert_eq!(detail.kwargs, json!({}));
    assert_eq!(detail.tags, vec!["billing", "nightly"]);
    assert_eq!(detail.doc_string.as_deref(), Some("Parses an amount of cents."));
    assert!(detail.source_code.starts_with("/// Parses an amount of cents."));
    assert!(detail.source_code.contains("fn parse_amount(raw: &str)"));
    assert!(detail.dependencies.contains(&"std::str::FromStr".to_string()));
    assert!(detail.dependencies.contains(&"funckeeper::Keeper".to_string()));
    assert!(detail.timestamp.ends_with("+08:00"), "{}", detail.timestamp);
    assert!(detail.execution_time >= 0.0);
    assert!(detail.module_path.starts_with("capture"));

    cleanup(&db_path);
}

#[test]
fn wrapped_error_is_returned_unchanged_and_recorded_as_failure() {
    let (keeper, db_path) = fixture_keeper();
    let parse = keeper.wrap(function_meta!(parse_amount), &[], parse_amount);

    let wrapped = must(parse.call("12x"));
    let direct = parse_amount("12x");
    let (Err(wrapped_err), Err(direct_err)) = (&wrapped, &direct) else {
        panic!("both calls should fail");
    };
    assert_eq!(wrapped_err, direct_err);
    assert_eq!(wrapped_err.to_string(), direct_err.to_string());

    let failures = must(
        keeper
            .query()
            .search(&SearchQuery::new().status(CallStatus::Error)),
    );
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].last_execution.error.as_deref(),
        Some("invalid digit found in string")
    );

    let Some(detail) = must(keeper.query().detail(failures[0].id)) else {
        panic!("failed call should have a detail view");
    };
    assert_eq!(detail.error_type.as_deref(), Some("ParseIntError"));
    assert_eq!(detail.error_state, Some(json!({"args": ["12x"], "kwargs": {}})));
    let Some(traceback) = detail.error_traceback else {
        panic!("failed call should carry a traceback");
    };
    assert!(traceback.starts_with("ParseIntError: invalid digit found in string"));
    assert!(detail.return_value.is_none());

    cleanup(&db_path);
}

#[test]
fn panics_are_recorded_then_resumed_with_the_original_payload() {
    let (keeper, db_path) = fixture_keeper();
    let index = keeper.wrap(function_meta!(checked_index), &["fragile"], checked_index);

    let outcome = catch_unwind(AssertUnwindSafe(|| index.invoke(vec![1_u8, 2, 3])));
    let payload = match outcome {
        Ok(_) => panic!("out-of-bounds index should panic"),
        Err(payload) => payload,
    };
    let message = payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|text| (*text).to_string()))
        .unwrap_or_default();
    assert!(message.contains("index out of bounds"), "{message}");

    let hits = must(keeper.query().search(&SearchQuery::new()));
    assert_eq!(hits.len(), 1);
    let Some(detail) = must(keeper.query().detail(hits[0].id)) else {
        panic!("panicking call should be recorded");
    };
    assert_eq!(detail.status, CallStatus::Error);
    assert_eq!(detail.error_type.as_deref(), Some("panic"));
    assert_eq!(detail.error_message.as_deref(), Some(message.as_str()));
    assert_eq!(detail.args, json!([[1, 2, 3]]));

    cleanup(&db_path);
}

#[test]
fn every_invocation_writes_exactly_one_record() {
    let (keeper, db_path) = fixture_keeper();
    let parse = keeper.wrap(function_meta!(parse_amount), &[], parse_amount);
    let sum = keeper.wrap(function_meta!(add), &[], add);

    for raw in ["1", "x", "3", "", "5"] {
        let _ = must(parse.call(raw));
    }
    assert_eq!(must(sum.invoke((2, 3))), 5);

    assert_eq!(record_count(&keeper), 6);
    let stats = must(keeper.query().statistics(&StatisticsQuery::new()));
    assert_eq!(stats["parse_amount"].total_calls, 5);
    assert_eq!(stats["parse_amount"].error_count, 2);
    assert_eq!(stats["add"].total_calls, 1);

    cleanup(&db_path);
}

#[test]
fn keyword_arguments_are_captured_by_name() {
    let (keeper, db_path) = fixture_keeper();
    let transfer = keeper.wrap(
        FunctionMeta::new("transfer", module_path!(), file!(), None, line!()),
        &[],
        |args: CallArgs| -> Result<usize, ParseIntError> { Ok(args.keyword.len()) },
    );

    let accounts = BTreeMap::from([("from", "acct-1"), ("to", "acct-2")]);
    let args = CallArgs::new()
        .arg(250_u32)
        .kwarg("accounts", accounts)
        .kwarg("dry_run", true);
    assert_eq!(must(transfer.call(args)), Ok(2));

    let hits = must(keeper.query().search(&SearchQuery::new()));
    assert_eq!(hits[0].last_execution.arguments.args, json!([250]));
    assert_eq!(
        hits[0].last_execution.arguments.kwargs,
        json!({"accounts": {"from": "acct-1", "to": "acct-2"}, "dry_run": true})
    );

    cleanup(&db_path);
}

#[test]
fn introspection_failure_does_not_abort_the_call() {
    let (keeper, db_path) = fixture_keeper();
    let keeper = keeper.with_introspector(Arc::new(FailingIntrospector));
    let sum = keeper.wrap(function_meta!(add), &[], add);

    assert_eq!(must(sum.invoke((40, 2))), 42);

    let info = must(keeper.query().function_info("add"));
    let Some(info) = info else {
        panic!("call should be recorded without source");
    };
    assert!(info.source_code.is_empty());
    assert!(info.doc_string.is_none());
    assert!(info.dependencies.is_empty());

    cleanup(&db_path);
}

#[test]
fn storage_failure_surfaces_on_the_call_path() {
    let recorder = Recorder::new(
        Arc::new(RejectingStore),
        Arc::new(FailingIntrospector),
    );
    let sum = recorder.wrap(function_meta!(add), &[], add);

    let err = match sum.invoke((1, 1)) {
        Ok(value) => panic!("write failure should surface, got {value}"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("disk full"));
}

#[test]
fn one_wrapper_serves_many_threads() {
    let (keeper, db_path) = fixture_keeper();
    let sum = Arc::new(keeper.wrap(function_meta!(add), &["parallel"], add));

    let handles: Vec<_> = (0..8_i64)
        .map(|worker| {
            let sum = Arc::clone(&sum);
            std::thread::spawn(move || {
                (0..5_i64)
                    .map(|call| sum.invoke((worker, call)))
                    .collect::<Result<Vec<i64>>>()
            })
        })
        .collect();

    for (worker, handle) in handles.into_iter().enumerate() {
        let results = match handle.join() {
            Ok(results) => must(results),
            Err(err) => panic!("worker {worker} panicked: {err:?}"),
        };
        assert_eq!(results.len(), 5);
    }

    let stats = must(keeper.query().statistics(&StatisticsQuery::new()));
    assert_eq!(stats["add"].total_calls, 40);
    assert_eq!(stats["add"].success_rate, "100.00%");

    cleanup(&db_path);
}

#[test]
fn module_qualified_paths_record_the_function_they_name() {
    let (keeper, db_path) = fixture_keeper();
    assert_eq!(to_units(250), 2);

    let units = keeper.wrap(
        function_meta!(ledger_math::to_units),
        &[],
        ledger_math::to_units,
    );
    assert_eq!(must(units.invoke(250_u64)), 3);

    let hits = must(keeper.query().search(&SearchQuery::new()));
    let Some(detail) = must(keeper.query().detail(hits[0].id)) else {
        panic!("detail should exist for a fresh record");
    };
    assert_eq!(detail.func_name, "ledger_math::to_units");
    assert!(detail.source_code.contains("div_ceil"), "{}", detail.source_code);
    assert!(!detail.source_code.contains("cents / 100"));
    assert_eq!(
        detail.doc_string.as_deref(),
        Some("Whole units, rounding any remainder up.")
    );
    assert!(
        detail.module_path.ends_with("::ledger_math"),
        "{}",
        detail.module_path
    );

    cleanup(&db_path);
}

#[test]
fn tags_are_split_on_commas_and_trimmed() {
    let (keeper, db_path) = fixture_keeper();
    let sum = keeper.wrap(function_meta!(add), &["billing,nightly", " eu ", ""], add);
    assert_eq!(sum.tags(), ["billing", "nightly", "eu"]);
    assert_eq!(must(sum.invoke((1, 2))), 3);

    let hits = must(keeper.query().search(&SearchQuery::new().tag("nightly")));
    assert_eq!(hits.len(), 1);
    let Some(detail) = must(keeper.query().detail(hits[0].id)) else {
        panic!("detail should exist for a fresh record");
    };
    assert_eq!(detail.tags, sum.tags());

    cleanup(&db_path);
}
