use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

mod value;

pub use value::{
    serialize, CallArgs, CallValue, Debugged, Json, Opaque, ToCallArgs, ToCallValue,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KeeperError {
    #[error("failed to open record store at {path}: {reason}")]
    StorageOpen { path: String, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error("unsupported export kind: {0}")]
    UnsupportedExportKind(String),
    #[error("export kind {expected} cannot render a {actual} payload")]
    ExportPayloadMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IntrospectError {
    #[error("source unavailable for {function}: {reason}")]
    SourceUnavailable { function: String, reason: String },
    #[error("dependency scan failed for {function}: {reason}")]
    DependencyScan { function: String, reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// Parses a stored or user-supplied status, ignoring ASCII case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl Display for CallStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an instrumented function, as seen from its call site.
///
/// Build it with [`function_meta!`] so the module path and source location
/// are filled in by the compiler.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FunctionMeta {
    pub name: String,
    pub module_path: String,
    pub file: String,
    pub manifest_dir: Option<String>,
    pub line: u32,
}

impl FunctionMeta {
    #[must_use]
    pub fn new(
        path: &str,
        module_path: &str,
        file: &str,
        manifest_dir: Option<&str>,
        line: u32,
    ) -> Self {
        Self {
            name: path.chars().filter(|ch| !ch.is_whitespace()).collect(),
            module_path: module_path.to_string(),
            file: file.to_string(),
            manifest_dir: manifest_dir.map(str::to_string),
            line,
        }
    }

    /// Path segments of the function name, e.g. `["Ledger", "post"]`.
    #[must_use]
    pub fn segments(&self) -> Vec<&str> {
        self.name
            .split("::")
            .filter(|segment| !segment.is_empty())
            .collect()
    }
}

impl Display for FunctionMeta {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.module_path, self.name)
    }
}

/// Builds a [`FunctionMeta`] for a function path visible at the call site.
///
/// The path is resolved the way a `use` path written at the call site would
/// be: from the innermost module enclosing the invocation line, following
/// `self`, `super`, `crate` and module segments, with a trailing type segment
/// naming the impl or trait that holds a method. Only module-level items are
/// found, not fns declared inside another fn's body.
///
/// ```ignore
/// let meta = function_meta!(parse_amount);
/// let method = function_meta!(Ledger::post);
/// ```
#[macro_export]
macro_rules! function_meta {
    ($function:path) => {
        $crate::FunctionMeta::new(
            stringify!($function),
            module_path!(),
            file!(),
            option_env!("CARGO_MANIFEST_DIR"),
            line!(),
        )
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Introspection {
    pub source: String,
    pub doc: Option<String>,
    pub dependencies: Vec<String>,
    /// Module that defines the function, when it differs from or refines the
    /// call site's module.
    #[serde(default)]
    pub module_path: Option<String>,
}

pub trait Introspector: Send + Sync {
    /// Resolves source text, doc text and import dependencies of a function.
    ///
    /// # Errors
    /// Returns [`IntrospectError::SourceUnavailable`] when the function's
    /// source cannot be located. Dependency scan problems degrade to an empty
    /// dependency list instead of failing.
    fn inspect(&self, function: &FunctionMeta) -> Result<Introspection, IntrospectError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallFailure {
    pub error_type: String,
    pub message: String,
    pub traceback: String,
    /// `{"args": [...], "kwargs": {...}}` at the time of failure.
    pub state: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Success { return_value: Value },
    #[serde(rename = "error")]
    Failure(CallFailure),
}

impl CallOutcome {
    #[must_use]
    pub fn status(&self) -> CallStatus {
        match self {
            Self::Success { .. } => CallStatus::Success,
            Self::Failure(_) => CallStatus::Error,
        }
    }

    #[must_use]
    pub fn failure(&self) -> Option<&CallFailure> {
        match self {
            Self::Success { .. } => None,
            Self::Failure(failure) => Some(failure),
        }
    }
}

/// Write-side shape of one invocation; id and timestamp come from the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewCallRecord {
    pub func_name: String,
    pub module_path: String,
    pub source_code: String,
    pub doc_string: Option<String>,
    pub dependencies: Vec<String>,
    pub args: Value,
    pub kwargs: Value,
    pub outcome: CallOutcome,
    pub execution_time: f64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    pub id: i64,
    pub func_name: String,
    pub module_path: String,
    pub source_code: String,
    pub doc_string: Option<String>,
    pub dependencies: Vec<String>,
    pub args: Value,
    pub kwargs: Value,
    pub outcome: CallOutcome,
    pub execution_time: f64,
    pub tags: Vec<String>,
    pub timestamp: String,
}

impl CallRecord {
    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.outcome.status()
    }
}

/// Conditions shared by record queries and aggregates. Every supplied
/// condition must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    /// Case-insensitive substring of name, source, doc or error message.
    pub keyword: Option<String>,
    /// Matches when the stored tag text contains any of these.
    pub tags: Vec<String>,
    pub status: Option<CallStatus>,
    pub function_name: Option<String>,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionAggregate {
    pub func_name: String,
    pub total_calls: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_execution_time: f64,
    pub min_execution_time: f64,
    pub max_execution_time: f64,
    pub first_call: String,
    pub last_call: String,
    pub error_types: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorTypeTotal {
    pub error_type: String,
    pub count: u64,
    pub avg_execution_time: f64,
}

pub trait RecordStore: Send + Sync {
    /// Offset used to stamp inserts and to read offset-less timestamps.
    fn offset(&self) -> UtcOffset;

    #[allow(clippy::missing_errors_doc)]
    fn insert(&self, record: &NewCallRecord) -> anyhow::Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn get(&self, id: i64) -> anyhow::Result<Option<CallRecord>>;

    /// Matching records, newest first.
    #[allow(clippy::missing_errors_doc)]
    fn query(&self, filter: &RecordFilter) -> anyhow::Result<Vec<CallRecord>>;

    /// Per-function summaries ordered by function name.
    #[allow(clippy::missing_errors_doc)]
    fn aggregate(&self, filter: &RecordFilter) -> anyhow::Result<Vec<FunctionAggregate>>;

    #[allow(clippy::missing_errors_doc)]
    fn error_type_totals(&self) -> anyhow::Result<Vec<ErrorTypeTotal>>;

    #[allow(clippy::missing_errors_doc)]
    fn latest_for_function(&self, func_name: &str) -> anyhow::Result<Option<CallRecord>>;
}

/// Tags are stored as one comma-separated column; a tag must not contain `,`.
#[must_use]
pub fn join_tags(tags: &[String]) -> String {
    tags.join(",")
}

#[must_use]
pub fn split_tags(stored: &str) -> Vec<String> {
    stored
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

#[must_use]
pub fn now_in(offset: UtcOffset) -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(offset)
}

/// Formats a timestamp as `YYYY-MM-DDTHH:MM:SS.ffffff+HH:MM`.
///
/// The fixed-width layout keeps text order equal to time order for values
/// sharing one offset.
///
/// # Errors
/// Returns [`KeeperError::Timestamp`] when formatting fails.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, KeeperError> {
    value
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6][offset_hour sign:mandatory]:[offset_minute]"
        ))
        .map_err(|err| KeeperError::Timestamp(format!("failed to format timestamp: {err}")))
}

/// Microseconds since the Unix epoch, the store's ordering key.
///
/// # Errors
/// Returns [`KeeperError::Timestamp`] when the instant does not fit in `i64`.
pub fn unix_micros(value: OffsetDateTime) -> Result<i64, KeeperError> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000)
        .map_err(|err| KeeperError::Timestamp(format!("instant out of range: {err}")))
}

/// Inverse of [`unix_micros`], expressed in `offset`.
///
/// # Errors
/// Returns [`KeeperError::Timestamp`] when the value is outside the supported
/// date range.
pub fn from_unix_micros(micros: i64, offset: UtcOffset) -> Result<OffsetDateTime, KeeperError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map(|value| value.to_offset(offset))
        .map_err(|err| KeeperError::Timestamp(format!("instant out of range: {err}")))
}

/// Parses a stored or user-supplied timestamp. Values without an offset are
/// read in `naive_offset`.
///
/// # Errors
/// Returns [`KeeperError::Timestamp`] when the text is not a timestamp.
pub fn parse_timestamp(raw: &str, naive_offset: UtcOffset) -> Result<OffsetDateTime, KeeperError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(parsed);
    }

    let naive = PrimitiveDateTime::parse(
        trimmed,
        format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
        ),
    )
    .or_else(|_| {
        PrimitiveDateTime::parse(
            trimmed,
            format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"
            ),
        )
    })
    .map_err(|err| KeeperError::Timestamp(format!("invalid timestamp {raw:?}: {err}")))?;

    Ok(naive.assume_offset(naive_offset))
}

/// Re-renders a stored timestamp so it always carries an offset. Text that
/// cannot be parsed is returned unchanged.
#[must_use]
pub fn normalize_timestamp(raw: &str, naive_offset: UtcOffset) -> String {
    match parse_timestamp(raw, naive_offset).and_then(format_timestamp) {
        Ok(normalized) => normalized,
        Err(err) => {
            tracing::warn!(timestamp = raw, error = %err, "keeping unparseable stored timestamp");
            raw.to_string()
        }
    }
}

/// Resolves a configured offset in hours, or the host's local offset.
///
/// # Errors
/// Returns [`KeeperError::Configuration`] when the offset is not finite,
/// exceeds 24 hours, or does not land on a whole second.
pub fn resolve_offset(hours: Option<f64>) -> Result<UtcOffset, KeeperError> {
    let Some(hours) = hours else {
        return Ok(local_offset());
    };

    if !hours.is_finite() || hours.abs() > 24.0 {
        return Err(KeeperError::Configuration(format!(
            "timezone offset MUST be within +/-24 hours, got {hours}"
        )));
    }

    let seconds = hours * 3_600.0;
    if seconds.fract() != 0.0 {
        return Err(KeeperError::Configuration(format!(
            "timezone offset MUST resolve to whole seconds, got {hours} hours"
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let whole_seconds = seconds as i32;
    UtcOffset::from_whole_seconds(whole_seconds)
        .map_err(|err| KeeperError::Configuration(format!("invalid timezone offset: {err}")))
}

#[must_use]
pub fn local_offset() -> UtcOffset {
    match UtcOffset::current_local_offset() {
        Ok(offset) => offset,
        Err(err) => {
            tracing::warn!(error = %err, "local offset unavailable; using UTC");
            UtcOffset::UTC
        }
    }
}
