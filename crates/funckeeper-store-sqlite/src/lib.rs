#![allow(clippy::missing_errors_doc)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use funckeeper_core::{
    format_timestamp, from_unix_micros, join_tags, normalize_timestamp, now_in, split_tags,
    unix_micros, CallFailure,
    CallOutcome, CallRecord, CallStatus, ErrorTypeTotal, FunctionAggregate, KeeperError,
    NewCallRecord, RecordFilter, RecordStore,
};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use time::UtcOffset;

const TABLE_NAME: &str = "function_records";
const IN_MEMORY_PATH: &str = ":memory:";

const SCHEMA_TABLE_V1: &str = r"
CREATE TABLE IF NOT EXISTS function_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  func_name TEXT NOT NULL,
  module_path TEXT,
  source_code TEXT,
  doc_string TEXT,
  dependencies TEXT,
  args TEXT,
  kwargs TEXT,
  return_value TEXT,
  execution_time REAL,
  status TEXT CHECK (status IN ('success', 'error') OR status IS NULL),
  error_type TEXT,
  error_message TEXT,
  error_traceback TEXT,
  error_state TEXT,
  tags TEXT,
  timestamp TEXT,
  ts_micros INTEGER
);
";

const SCHEMA_GUARDS_V1: &str = r"
CREATE INDEX IF NOT EXISTS idx_function_records_func_name
  ON function_records(func_name);
CREATE INDEX IF NOT EXISTS idx_function_records_ts_micros
  ON function_records(ts_micros);
CREATE INDEX IF NOT EXISTS idx_function_records_status
  ON function_records(status);

CREATE TRIGGER IF NOT EXISTS trg_function_records_no_update
BEFORE UPDATE ON function_records
BEGIN
  SELECT RAISE(FAIL, 'function_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_function_records_no_delete
BEFORE DELETE ON function_records
BEGIN
  SELECT RAISE(FAIL, 'function_records is append-only');
END;
";

/// Columns a store created by an older release may lack, with the type used
/// when adding them.
const MIGRATABLE_COLUMNS: &[(&str, &str)] = &[
    ("func_name", "TEXT"),
    ("module_path", "TEXT"),
    ("source_code", "TEXT"),
    ("doc_string", "TEXT"),
    ("dependencies", "TEXT"),
    ("args", "TEXT"),
    ("kwargs", "TEXT"),
    ("return_value", "TEXT"),
    ("execution_time", "REAL"),
    ("status", "TEXT"),
    ("error_type", "TEXT"),
    ("error_message", "TEXT"),
    ("error_traceback", "TEXT"),
    ("error_state", "TEXT"),
    ("tags", "TEXT"),
    ("timestamp", "TEXT"),
    ("ts_micros", "INTEGER"),
];

const RECORD_COLUMNS: &str = "id, func_name, module_path, source_code, doc_string, dependencies, \
     args, kwargs, return_value, execution_time, status, error_type, error_message, \
     error_traceback, error_state, tags, timestamp";

#[derive(Debug)]
pub struct SqliteRecordStore {
    path: PathBuf,
    offset: UtcOffset,
    writer: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Opens or creates the record store at `path`, creating parent
    /// directories and migrating the schema.
    ///
    /// Every failure here is reported as [`KeeperError::StorageOpen`].
    pub fn open(path: &Path, offset: UtcOffset) -> Result<Self> {
        if !is_in_memory(path) {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|err| storage_open_error(path, &err))?;
            }
        }

        let conn = Connection::open(path).map_err(|err| storage_open_error(path, &err))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| storage_open_error(path, &err))?;

        let store = Self {
            path: path.to_path_buf(),
            offset,
            writer: Mutex::new(conn),
        };
        store
            .migrate()
            .map_err(|err| storage_open_error(path, &format!("{err:#}")))?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the table when absent, otherwise adds any missing columns.
    /// Never drops or renames columns. Safe to run repeatedly.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.writer.lock();

        if table_exists(&conn, TABLE_NAME)? {
            let available = table_columns(&conn, TABLE_NAME)?;
            for (column, column_type) in MIGRATABLE_COLUMNS {
                if available.contains(*column) {
                    continue;
                }
                conn.execute_batch(&format!(
                    "ALTER TABLE {TABLE_NAME} ADD COLUMN {column} {column_type}"
                ))
                .with_context(|| format!("failed to add column {TABLE_NAME}.{column}"))?;
                tracing::info!(table = TABLE_NAME, column, "added missing column");
            }
        } else {
            conn.execute_batch(SCHEMA_TABLE_V1)
                .context("failed to create function_records table")?;
            tracing::info!(table = TABLE_NAME, "created record table");
        }

        conn.execute_batch(SCHEMA_GUARDS_V1)
            .context("failed to apply function_records indexes and triggers")?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if is_in_memory(&self.path) {
            let conn = self.writer.lock();
            return f(&conn);
        }

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open read connection at {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to configure read connection busy timeout")?;
        f(&conn)
    }

    fn select_records(&self, filter: &RecordFilter) -> Result<Vec<CallRecord>> {
        let clause = WhereClause::from_filter(filter, self.offset)?;
        let offset = self.offset;
        let instant = instant_sql(offset);
        self.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {RECORD_COLUMNS}
                     FROM {TABLE_NAME}{}
                     ORDER BY {instant} DESC, id DESC",
                    clause.sql()
                ))
                .context("failed to prepare record query")?;
            let rows = stmt
                .query_map(params_from_iter(clause.params.iter()), |row| {
                    parse_record_row(row, offset)
                })
                .context("failed to query records")?;
            collect_rows(rows)
        })
    }
}

impl RecordStore for SqliteRecordStore {
    fn offset(&self) -> UtcOffset {
        self.offset
    }

    fn insert(&self, record: &NewCallRecord) -> Result<i64> {
        let dependencies = serde_json::to_string(&record.dependencies)
            .context("failed to encode dependencies")?;
        let args = serde_json::to_string(&record.args).context("failed to encode args")?;
        let kwargs = serde_json::to_string(&record.kwargs).context("failed to encode kwargs")?;

        let mut return_value = None;
        let mut error_type = None;
        let mut error_message = None;
        let mut error_traceback = None;
        let mut error_state = None;
        match &record.outcome {
            CallOutcome::Success {
                return_value: value,
            } => {
                return_value =
                    Some(serde_json::to_string(value).context("failed to encode return value")?);
            }
            CallOutcome::Failure(failure) => {
                error_type = Some(failure.error_type.as_str());
                error_message = Some(failure.message.as_str());
                error_traceback = Some(failure.traceback.as_str());
                error_state = Some(
                    serde_json::to_string(&failure.state).context("failed to encode error state")?,
                );
            }
        }

        let conn = self.writer.lock();
        // Stamped under the writer lock so id order and timestamp order agree.
        let stamped = now_in(self.offset);
        let timestamp = format_timestamp(stamped)?;
        let ts_micros = unix_micros(stamped)?;
        conn.execute(
            "INSERT INTO function_records(
                func_name, module_path, source_code, doc_string, dependencies,
                args, kwargs, return_value, execution_time, status,
                error_type, error_message, error_traceback, error_state, tags, timestamp,
                ts_micros
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                record.func_name,
                record.module_path,
                record.source_code,
                record.doc_string,
                dependencies,
                args,
                kwargs,
                return_value,
                record.execution_time,
                record.outcome.status().as_str(),
                error_type,
                error_message,
                error_traceback,
                error_state,
                join_tags(&record.tags),
                timestamp,
                ts_micros,
            ],
        )
        .with_context(|| format!("failed to insert record for {}", record.func_name))?;

        Ok(conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<CallRecord>> {
        let offset = self.offset;
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM {TABLE_NAME} WHERE id = ?1"),
                params![id],
                |row| parse_record_row(row, offset),
            )
            .optional()
            .with_context(|| format!("failed to load record {id}"))
        })
    }

    fn query(&self, filter: &RecordFilter) -> Result<Vec<CallRecord>> {
        self.select_records(filter)
    }

    fn aggregate(&self, filter: &RecordFilter) -> Result<Vec<FunctionAggregate>> {
        let clause = WhereClause::from_filter(filter, self.offset)?;
        let mut error_clause = clause.clone();
        error_clause.push("status = 'error'", std::iter::empty());
        let offset = self.offset;
        let instant = instant_sql(offset);

        self.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT COALESCE(func_name, ''),
                            COUNT(*),
                            COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0),
                            AVG(execution_time),
                            MIN(execution_time),
                            MAX(execution_time),
                            MIN({instant}),
                            MAX({instant})
                     FROM {TABLE_NAME}{}
                     GROUP BY COALESCE(func_name, '')
                     ORDER BY COALESCE(func_name, '')",
                    clause.sql()
                ))
                .context("failed to prepare aggregate query")?;
            let rows = stmt
                .query_map(params_from_iter(clause.params.iter()), |row| {
                    let aggregate = FunctionAggregate {
                        func_name: row.get(0)?,
                        total_calls: to_count(row.get(1)?),
                        success_count: to_count(row.get(2)?),
                        error_count: to_count(row.get(3)?),
                        avg_execution_time: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                        min_execution_time: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                        max_execution_time: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
                        first_call: String::new(),
                        last_call: String::new(),
                        error_types: BTreeMap::new(),
                    };
                    Ok((aggregate, row.get::<_, Option<i64>>(7)?, row.get::<_, Option<i64>>(8)?))
                })
                .context("failed to query aggregates")?;
            let mut aggregates = Vec::new();
            for (mut aggregate, first, last) in collect_rows(rows)? {
                aggregate.first_call = render_instant(first, offset)?;
                aggregate.last_call = render_instant(last, offset)?;
                aggregates.push(aggregate);
            }

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT COALESCE(func_name, ''), COALESCE(error_type, 'unknown'), COUNT(*)
                     FROM {TABLE_NAME}{}
                     GROUP BY COALESCE(func_name, ''), COALESCE(error_type, 'unknown')",
                    error_clause.sql()
                ))
                .context("failed to prepare error breakdown query")?;
            let rows = stmt
                .query_map(params_from_iter(error_clause.params.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        to_count(row.get(2)?),
                    ))
                })
                .context("failed to query error breakdown")?;

            for (func_name, error_type, count) in collect_rows(rows)? {
                if let Some(aggregate) = aggregates
                    .iter_mut()
                    .find(|aggregate| aggregate.func_name == func_name)
                {
                    aggregate.error_types.insert(error_type, count);
                }
            }

            Ok(aggregates)
        })
    }

    fn error_type_totals(&self) -> Result<Vec<ErrorTypeTotal>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT COALESCE(error_type, 'unknown'), COUNT(*), AVG(execution_time)
                     FROM {TABLE_NAME}
                     WHERE status = 'error'
                     GROUP BY COALESCE(error_type, 'unknown')
                     ORDER BY COALESCE(error_type, 'unknown')"
                ))
                .context("failed to prepare error type query")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ErrorTypeTotal {
                        error_type: row.get(0)?,
                        count: to_count(row.get(1)?),
                        avg_execution_time: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    })
                })
                .context("failed to query error types")?;
            collect_rows(rows)
        })
    }

    fn latest_for_function(&self, func_name: &str) -> Result<Option<CallRecord>> {
        let offset = self.offset;
        let instant = instant_sql(offset);
        self.read(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS}
                     FROM {TABLE_NAME}
                     WHERE func_name = ?1
                     ORDER BY {instant} DESC, id DESC
                     LIMIT 1"
                ),
                params![func_name],
                |row| parse_record_row(row, offset),
            )
            .optional()
            .with_context(|| format!("failed to load latest record for {func_name}"))
        })
    }
}

#[derive(Debug, Clone, Default)]
struct WhereClause {
    conditions: Vec<String>,
    params: Vec<SqlValue>,
}

impl WhereClause {
    fn from_filter(filter: &RecordFilter, offset: UtcOffset) -> Result<Self> {
        let mut clause = Self::default();

        if let Some(keyword) = filter.keyword.as_deref() {
            let pattern = like_pattern(keyword);
            clause.push(
                r"(func_name LIKE ? ESCAPE '\'
                   OR source_code LIKE ? ESCAPE '\'
                   OR doc_string LIKE ? ESCAPE '\'
                   OR error_message LIKE ? ESCAPE '\')",
                std::iter::repeat(SqlValue::Text(pattern)).take(4),
            );
        }

        if !filter.tags.is_empty() {
            let any_tag = vec![r"tags LIKE ? ESCAPE '\'"; filter.tags.len()].join(" OR ");
            clause.push(
                &format!("({any_tag})"),
                filter
                    .tags
                    .iter()
                    .map(|tag| SqlValue::Text(like_pattern(tag))),
            );
        }

        if let Some(status) = filter.status {
            clause.push("status = ?", [SqlValue::Text(status.as_str().to_string())]);
        }

        if let Some(function_name) = filter.function_name.as_deref() {
            clause.push("func_name = ?", [SqlValue::Text(function_name.to_string())]);
        }

        if let Some(start) = filter.start {
            clause.push(
                &format!("{} >= ?", instant_sql(offset)),
                [SqlValue::Integer(unix_micros(start)?)],
            );
        }

        if let Some(end) = filter.end {
            clause.push(
                &format!("{} <= ?", instant_sql(offset)),
                [SqlValue::Integer(unix_micros(end)?)],
            );
        }

        Ok(clause)
    }

    fn push(&mut self, condition: &str, params: impl IntoIterator<Item = SqlValue>) {
        self.conditions.push(condition.to_string());
        self.params.extend(params);
    }

    fn sql(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }
}

/// SQL for a row's instant in microseconds since the Unix epoch.
///
/// Rows written by this store carry `ts_micros`. Older rows only have
/// `timestamp` text, read at millisecond precision; text without an offset
/// is taken to be in the store offset.
fn instant_sql(offset: UtcOffset) -> String {
    let naive_shift = i64::from(offset.whole_seconds()) * 1_000_000;
    format!(
        "COALESCE(ts_micros, \
         CAST(round((julianday(timestamp) - 2440587.5) * 86400000.0) AS INTEGER) * 1000 \
         - CASE WHEN timestamp GLOB '*[+-][0-9][0-9]:[0-9][0-9]' OR timestamp GLOB '*[Zz]' \
           THEN 0 ELSE {naive_shift} END)"
    )
}

fn render_instant(micros: Option<i64>, offset: UtcOffset) -> Result<String> {
    match micros {
        Some(micros) => Ok(format_timestamp(from_unix_micros(micros, offset)?)?),
        None => Ok(String::new()),
    }
}

fn like_pattern(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len() + 2);
    escaped.push('%');
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn parse_record_row(row: &rusqlite::Row<'_>, offset: UtcOffset) -> rusqlite::Result<CallRecord> {
    let id: i64 = row.get(0)?;
    let status_raw: Option<String> = row.get(10)?;
    let error_type: Option<String> = row.get(11)?;

    let status = status_raw
        .as_deref()
        .and_then(CallStatus::parse)
        .unwrap_or(if error_type.is_some() {
            CallStatus::Error
        } else {
            CallStatus::Success
        });

    let outcome = match status {
        CallStatus::Success => CallOutcome::Success {
            return_value: parse_json_column(id, "return_value", row.get(8)?),
        },
        CallStatus::Error => CallOutcome::Failure(CallFailure {
            error_type: error_type.unwrap_or_else(|| "unknown".to_string()),
            message: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
            traceback: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
            state: parse_json_column(id, "error_state", row.get(14)?),
        }),
    };

    let timestamp: Option<String> = row.get(16)?;

    Ok(CallRecord {
        id,
        func_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        module_path: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        source_code: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        doc_string: row.get(4)?,
        dependencies: parse_dependencies(id, row.get(5)?),
        args: parse_json_column(id, "args", row.get(6)?),
        kwargs: parse_json_column(id, "kwargs", row.get(7)?),
        outcome,
        execution_time: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
        tags: split_tags(row.get::<_, Option<String>>(15)?.as_deref().unwrap_or_default()),
        timestamp: normalize_timestamp(timestamp.as_deref().unwrap_or_default(), offset),
    })
}

/// Stored JSON that fails to parse is handed back as a JSON string holding
/// the raw text.
fn parse_json_column(id: i64, column: &str, raw: Option<String>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(record_id = id, column, error = %err, "stored JSON is malformed");
            Value::String(raw)
        }
    }
}

fn parse_dependencies(id: i64, raw: Option<String>) -> Vec<String> {
    let listed = match parse_json_column(id, "dependencies", raw) {
        Value::Null => return Vec::new(),
        Value::Array(items) => items,
        Value::Object(mut legacy) => match legacy.remove("imports") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        Value::String(text) => return vec![text],
        other => vec![other],
    };

    listed
        .into_iter()
        .map(|item| match item {
            Value::String(text) => text,
            other => other.to_string(),
        })
        .collect()
}

fn to_count(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or_default()
}

fn is_in_memory(path: &Path) -> bool {
    path.as_os_str() == IN_MEMORY_PATH
}

fn storage_open_error(path: &Path, reason: &impl std::fmt::Display) -> anyhow::Error {
    KeeperError::StorageOpen {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<BTreeSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    Ok(collect_rows(rows)?.into_iter().collect())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
