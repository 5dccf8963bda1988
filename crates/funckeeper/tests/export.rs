use std::path::{Path, PathBuf};

use anyhow::Result;
use funckeeper::{
    function_meta, ExportPayload, Exporter, KeeperConfig, KeeperError, Keeper, RecordDetail,
    SearchHit, SearchQuery, Statistics, StatisticsQuery,
};
use serde_json::Value;
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn fixture_keeper() -> (Keeper, PathBuf) {
    let dir = std::env::temp_dir().join(format!("funckeeper-export-{}", Ulid::new()));
    let keeper = must(Keeper::from_config(
        &KeeperConfig::new(dir.join("records.sqlite3")).with_timezone_offset_hours(0.0),
    ));
    (keeper, dir)
}

fn cleanup(dir: &Path) {
    let _ = std::fs::remove_dir_all(dir);
}

fn double(value: i64) -> i64 {
    value * 2
}

fn read_json(path: &Path) -> Value {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) => panic!("export should be readable at {}: {err}", path.display()),
    };
    match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => panic!("export should be valid JSON: {err}"),
    }
}

fn assert_export_name(path: &Path, kind: &str) {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        panic!("export path should have a UTF-8 file name");
    };
    let prefix = format!("funckeeper_{kind}_");
    assert!(name.starts_with(&prefix), "{name}");
    assert!(
        Path::new(name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json")),
        "{name}"
    );

    let stamp = &name[prefix.len()..name.len() - ".json".len()];
    assert_eq!(stamp.len(), "YYYYmmdd_HHMMSS".len(), "{name}");
    assert_eq!(stamp.as_bytes()[8], b'_', "{name}");
    assert!(stamp
        .chars()
        .enumerate()
        .all(|(idx, ch)| idx == 8 || ch.is_ascii_digit()));
}

#[test]
fn list_export_writes_pretty_json_into_a_new_directory() {
    let (keeper, dir) = fixture_keeper();
    let twice = keeper.wrap(function_meta!(double), &["export"], double);
    assert_eq!(must(twice.invoke(21_i64)), 42);

    let hits = must(keeper.query().search(&SearchQuery::new()));
    let out_dir = dir.join("reports").join("nested");
    let path = must(keeper.export("list", &ExportPayload::from(hits.clone()), &out_dir));

    assert!(path.starts_with(&out_dir));
    assert_export_name(&path, "list");
    let written = read_json(&path);
    assert_eq!(written[0]["function"], "double");
    assert_eq!(written[0]["last_execution"]["return_value"], 42);
    let decoded: Vec<SearchHit> = match serde_json::from_value(written) {
        Ok(decoded) => decoded,
        Err(err) => panic!("list export should decode: {err}"),
    };
    assert_eq!(decoded, hits);

    cleanup(&dir);
}

#[test]
fn detail_and_statistics_exports_carry_the_query_output() {
    let (keeper, dir) = fixture_keeper();
    let twice = keeper.wrap(function_meta!(double), &[], double);
    assert_eq!(must(twice.invoke(5_i64)), 10);

    let hits = must(keeper.query().search(&SearchQuery::new()));
    let Some(detail) = must(keeper.query().detail(hits[0].id)) else {
        panic!("fresh record should have a detail view");
    };
    let detail_path = must(keeper.export("detail", &detail.clone().into(), &dir));
    assert_export_name(&detail_path, "detail");
    let written = read_json(&detail_path);
    assert_eq!(written["func_name"], "double");
    assert_eq!(written["args"], serde_json::json!([5]));

    let stats = must(keeper.query().statistics(&StatisticsQuery::new()));
    let stats_path = must(keeper.export("statistics", &stats.clone().into(), &dir));
    assert_export_name(&stats_path, "statistics");
    let decoded: Statistics = match serde_json::from_value(read_json(&stats_path)) {
        Ok(decoded) => decoded,
        Err(err) => panic!("statistics export should decode: {err}"),
    };
    assert_eq!(decoded, stats);
    assert_eq!(decoded["double"].success_rate, "100.00%");

    cleanup(&dir);
}

#[test]
fn unknown_kinds_are_rejected_without_writing() {
    let (keeper, dir) = fixture_keeper();
    let out_dir = dir.join("never-created");

    let err = match keeper.export("html", &ExportPayload::List(Vec::new()), &out_dir) {
        Ok(path) => panic!("unknown kind should fail, wrote {}", path.display()),
        Err(err) => err,
    };
    assert_eq!(
        err.downcast_ref::<KeeperError>(),
        Some(&KeeperError::UnsupportedExportKind("html".to_string()))
    );
    assert!(!out_dir.exists());

    cleanup(&dir);
}

#[test]
fn payload_of_another_kind_is_rejected() {
    let (keeper, dir) = fixture_keeper();

    let err = match keeper.export("detail", &ExportPayload::List(Vec::new()), &dir) {
        Ok(path) => panic!("mismatched payload should fail, wrote {}", path.display()),
        Err(err) => err,
    };
    assert_eq!(
        err.downcast_ref::<KeeperError>(),
        Some(&KeeperError::ExportPayloadMismatch {
            expected: "detail",
            actual: "list",
        })
    );

    cleanup(&dir);
}

struct LineExporter;

impl Exporter for LineExporter {
    fn extension(&self) -> &'static str {
        "txt"
    }

    fn export_detail(&self, data: &RecordDetail, path: &Path) -> Result<()> {
        std::fs::write(path, format!("{} {}", data.id, data.func_name))?;
        Ok(())
    }

    fn export_statistics(&self, data: &Statistics, path: &Path) -> Result<()> {
        let names: Vec<&str> = data.keys().map(String::as_str).collect();
        std::fs::write(path, names.join("\n"))?;
        Ok(())
    }

    fn export_list(&self, data: &[SearchHit], path: &Path) -> Result<()> {
        let names: Vec<&str> = data.iter().map(|hit| hit.function.as_str()).collect();
        std::fs::write(path, names.join("\n"))?;
        Ok(())
    }
}

#[test]
fn custom_exporters_choose_the_file_format() {
    let (keeper, dir) = fixture_keeper();
    let twice = keeper.wrap(function_meta!(double), &[], double);
    assert_eq!(must(twice.invoke(1_i64)), 2);

    let stats = must(keeper.query().statistics(&StatisticsQuery::new()));
    let path = must(keeper.export_with(&LineExporter, "statistics", &stats.into(), &dir));
    assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("txt"));
    let body = match std::fs::read_to_string(&path) {
        Ok(body) => body,
        Err(err) => panic!("custom export should be readable: {err}"),
    };
    assert_eq!(body, "double");

    cleanup(&dir);
}
