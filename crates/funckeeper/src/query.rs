#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use funckeeper_core::{
    parse_timestamp, CallOutcome, CallRecord, CallStatus, FunctionAggregate, KeeperError,
    RecordFilter, RecordStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// A query time bound. Naive bounds are read in the store's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBound {
    Aware(OffsetDateTime),
    Naive(PrimitiveDateTime),
}

impl TimeBound {
    /// Parses RFC 3339 text as an aware bound, and `YYYY-MM-DD HH:MM:SS`
    /// (or with a `T` separator) as a naive bound.
    ///
    /// # Errors
    /// Returns [`KeeperError::Timestamp`] for any other text.
    pub fn parse(raw: &str) -> Result<Self, KeeperError> {
        if let Ok(aware) = OffsetDateTime::parse(raw.trim(), &Rfc3339) {
            return Ok(Self::Aware(aware));
        }
        let naive = parse_timestamp(raw, UtcOffset::UTC)?;
        Ok(Self::Naive(PrimitiveDateTime::new(naive.date(), naive.time())))
    }

    #[must_use]
    pub fn resolve(self, offset: UtcOffset) -> OffsetDateTime {
        match self {
            Self::Aware(value) => value,
            Self::Naive(value) => value.assume_offset(offset),
        }
    }
}

impl From<OffsetDateTime> for TimeBound {
    fn from(value: OffsetDateTime) -> Self {
        Self::Aware(value)
    }
}

impl From<PrimitiveDateTime> for TimeBound {
    fn from(value: PrimitiveDateTime) -> Self {
        Self::Naive(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub keyword: Option<String>,
    pub tags: Vec<String>,
    pub status: Option<CallStatus>,
    pub start: Option<TimeBound>,
    pub end: Option<TimeBound>,
}

impl SearchQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: CallStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn start(mut self, start: impl Into<TimeBound>) -> Self {
        self.start = Some(start.into());
        self
    }

    #[must_use]
    pub fn end(mut self, end: impl Into<TimeBound>) -> Self {
        self.end = Some(end.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatisticsQuery {
    pub function_name: Option<String>,
    pub status: Option<CallStatus>,
    pub start: Option<TimeBound>,
    pub end: Option<TimeBound>,
}

impl StatisticsQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn function(mut self, function_name: impl Into<String>) -> Self {
        self.function_name = Some(function_name.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: CallStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn start(mut self, start: impl Into<TimeBound>) -> Self {
        self.start = Some(start.into());
        self
    }

    #[must_use]
    pub fn end(mut self, end: impl Into<TimeBound>) -> Self {
        self.end = Some(end.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub id: i64,
    pub function: String,
    pub documentation: Option<String>,
    pub last_execution: LastExecution,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastExecution {
    pub timestamp: String,
    pub execution_time: String,
    pub arguments: Arguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Arguments {
    pub args: Value,
    pub kwargs: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionStatistics {
    pub total_calls: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub success_rate: String,
    pub avg_execution_time: String,
    pub min_execution_time: String,
    pub max_execution_time: String,
    pub first_call: String,
    pub last_call: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_types: Option<BTreeMap<String, u64>>,
}

pub type Statistics = BTreeMap<String, FunctionStatistics>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordDetail {
    pub id: i64,
    pub func_name: String,
    pub module_path: String,
    pub doc_string: Option<String>,
    pub source_code: String,
    pub timestamp: String,
    pub execution_time: f64,
    pub status: CallStatus,
    pub args: Value,
    pub kwargs: Value,
    pub return_value: Option<Value>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub error_traceback: Option<String>,
    pub error_state: Option<Value>,
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorTypeStats {
    pub count: u64,
    pub avg_execution_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionInfo {
    pub func_name: String,
    pub source_code: String,
    pub doc_string: Option<String>,
    pub dependencies: Vec<String>,
}

/// Read-only reports over a record store.
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn RecordStore>,
}

impl QueryEngine {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Matching calls, newest first. Every supplied condition must hold.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let offset = self.store.offset();
        let filter = RecordFilter {
            keyword: query.keyword.clone(),
            tags: query.tags.clone(),
            status: query.status,
            function_name: None,
            start: query.start.map(|bound| bound.resolve(offset)),
            end: query.end.map(|bound| bound.resolve(offset)),
        };

        Ok(self
            .store
            .query(&filter)?
            .into_iter()
            .map(search_hit)
            .collect())
    }

    /// Per-function summaries keyed by function name.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn statistics(&self, query: &StatisticsQuery) -> Result<Statistics> {
        let offset = self.store.offset();
        let filter = RecordFilter {
            keyword: None,
            tags: Vec::new(),
            status: query.status,
            function_name: query.function_name.clone(),
            start: query.start.map(|bound| bound.resolve(offset)),
            end: query.end.map(|bound| bound.resolve(offset)),
        };

        Ok(self
            .store
            .aggregate(&filter)?
            .into_iter()
            .map(|aggregate| (aggregate.func_name.clone(), function_statistics(aggregate)))
            .collect())
    }

    /// Full projection of one record, or `None` when the id is unknown.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn detail(&self, id: i64) -> Result<Option<RecordDetail>> {
        Ok(self.store.get(id)?.map(record_detail))
    }

    /// Count and mean duration per error type across the whole store.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn error_statistics(&self) -> Result<BTreeMap<String, ErrorTypeStats>> {
        Ok(self
            .store
            .error_type_totals()?
            .into_iter()
            .map(|total| {
                (
                    total.error_type,
                    ErrorTypeStats {
                        count: total.count,
                        avg_execution_time: total.avg_execution_time,
                    },
                )
            })
            .collect())
    }

    /// Latest recorded source, doc and dependencies of a function.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn function_info(&self, func_name: &str) -> Result<Option<FunctionInfo>> {
        Ok(self
            .store
            .latest_for_function(func_name)?
            .map(|record| FunctionInfo {
                func_name: record.func_name,
                source_code: record.source_code,
                doc_string: record.doc_string,
                dependencies: record.dependencies,
            }))
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("offset", &self.store.offset())
            .finish_non_exhaustive()
    }
}

fn search_hit(record: CallRecord) -> SearchHit {
    let (return_value, error) = match record.outcome {
        CallOutcome::Success { return_value } => (Some(return_value), None),
        CallOutcome::Failure(failure) => (None, Some(failure.message)),
    };

    SearchHit {
        id: record.id,
        function: record.func_name,
        documentation: record.doc_string,
        last_execution: LastExecution {
            timestamp: record.timestamp,
            execution_time: format_seconds(record.execution_time),
            arguments: Arguments {
                args: record.args,
                kwargs: record.kwargs,
            },
            return_value,
            error,
        },
    }
}

fn function_statistics(aggregate: FunctionAggregate) -> FunctionStatistics {
    let success_rate = if aggregate.total_calls == 0 {
        "0%".to_string()
    } else {
        format!(
            "{:.2}%",
            aggregate.success_count as f64 / aggregate.total_calls as f64 * 100.0
        )
    };

    FunctionStatistics {
        total_calls: aggregate.total_calls,
        success_count: aggregate.success_count,
        error_count: aggregate.error_count,
        success_rate,
        avg_execution_time: format_seconds(aggregate.avg_execution_time),
        min_execution_time: format_seconds(aggregate.min_execution_time),
        max_execution_time: format_seconds(aggregate.max_execution_time),
        first_call: aggregate.first_call,
        last_call: aggregate.last_call,
        error_types: (aggregate.error_count > 0).then_some(aggregate.error_types),
    }
}

fn record_detail(record: CallRecord) -> RecordDetail {
    let status = record.status();
    let mut detail = RecordDetail {
        id: record.id,
        func_name: record.func_name,
        module_path: record.module_path,
        doc_string: record.doc_string,
        source_code: record.source_code,
        timestamp: record.timestamp,
        execution_time: record.execution_time,
        status,
        args: record.args,
        kwargs: record.kwargs,
        return_value: None,
        error_type: None,
        error_message: None,
        error_traceback: None,
        error_state: None,
        dependencies: record.dependencies,
        tags: record.tags,
    };

    match record.outcome {
        CallOutcome::Success { return_value } => detail.return_value = Some(return_value),
        CallOutcome::Failure(failure) => {
            detail.error_type = Some(failure.error_type);
            detail.error_message = Some(failure.message);
            detail.error_traceback = Some(failure.traceback);
            detail.error_state = Some(failure.state);
        }
    }
    detail
}

fn format_seconds(seconds: f64) -> String {
    format!("{seconds:.4}s")
}
