//! Records every call of instrumented functions into a local SQLite store.
//!
//! Host programs embed funckeeper through [`Keeper`]:
//! - [`Keeper::open`] / [`Keeper::from_config`] to open or create a store.
//! - [`Keeper::wrap`] with [`function_meta!`] to instrument a function.
//! - [`Keeper::query`] for search, statistics, record detail and error reports.
//! - [`Keeper::export`] to write a query output to disk.
//!
//! ```no_run
//! use funckeeper::{function_meta, Keeper, SearchQuery};
//!
//! fn parse_amount(raw: &str) -> Result<u64, std::num::ParseIntError> {
//!     raw.trim().parse()
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let keeper = Keeper::open("funckeeper.db")?;
//! let parse = keeper.wrap(function_meta!(parse_amount), &["billing"], parse_amount);
//! let cents = parse.call("125")??;
//! assert_eq!(cents, 125);
//!
//! let hits = keeper.query().search(&SearchQuery::new().tag("billing"))?;
//! assert!(!hits.is_empty());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use funckeeper_introspect::SourceIntrospector;
use funckeeper_store_sqlite::SqliteRecordStore;
use time::UtcOffset;

mod capture;
mod config;
mod export;
mod query;

pub use capture::{Instrumented, Recorder};
pub use config::{KeeperConfig, DEFAULT_DB_PATH};
pub use export::{ExportKind, ExportPayload, Exporter, JsonExporter};
pub use funckeeper_core::{
    function_meta, CallArgs, CallFailure, CallOutcome, CallRecord, CallStatus, CallValue,
    Debugged, ErrorTypeTotal, FunctionAggregate, FunctionMeta, IntrospectError, Introspection,
    Introspector, Json, KeeperError, NewCallRecord, Opaque, RecordFilter, RecordStore, ToCallArgs,
    ToCallValue,
};
pub use query::{
    Arguments, ErrorTypeStats, FunctionInfo, FunctionStatistics, LastExecution, QueryEngine,
    RecordDetail, SearchHit, SearchQuery, Statistics, StatisticsQuery, TimeBound,
};

/// An open record store together with the recorder and reports built on it.
#[derive(Debug)]
pub struct Keeper {
    store: Arc<SqliteRecordStore>,
    recorder: Recorder,
}

impl Keeper {
    /// Opens the store at `db_path` using the host's local offset.
    ///
    /// # Errors
    /// Fails with [`KeeperError::StorageOpen`] when the store cannot be
    /// opened or created.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::from_config(&KeeperConfig::new(db_path))
    }

    /// # Errors
    /// Fails with [`KeeperError::Configuration`] for an invalid offset, or
    /// [`KeeperError::StorageOpen`] when the store cannot be opened.
    pub fn from_config(config: &KeeperConfig) -> Result<Self> {
        let offset = config.offset()?;
        let store = Arc::new(SqliteRecordStore::open(&config.db_path, offset)?);
        let shared: Arc<dyn RecordStore> = store.clone();
        let recorder = Recorder::new(shared, Arc::new(SourceIntrospector::new()));
        tracing::debug!(path = %config.db_path.display(), %offset, "opened funckeeper store");

        Ok(Self { store, recorder })
    }

    /// Replaces the source introspector used by wrappers created afterwards.
    #[must_use]
    pub fn with_introspector(mut self, introspector: Arc<dyn Introspector>) -> Self {
        self.recorder = Recorder::new(Arc::clone(self.recorder.store()), introspector);
        self
    }

    #[must_use]
    pub fn store(&self) -> &SqliteRecordStore {
        &self.store
    }

    #[must_use]
    pub fn offset(&self) -> UtcOffset {
        self.store.offset()
    }

    #[must_use]
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// See [`Recorder::wrap`] for how tags are normalized.
    #[must_use]
    pub fn wrap<F>(&self, meta: FunctionMeta, tags: &[&str], f: F) -> Instrumented<F> {
        self.recorder.wrap(meta, tags, f)
    }

    #[must_use]
    pub fn query(&self) -> QueryEngine {
        QueryEngine::new(Arc::clone(self.recorder.store()))
    }

    /// Writes `payload` as pretty JSON under `output_dir` and returns the
    /// file path.
    ///
    /// # Errors
    /// Fails with [`KeeperError::UnsupportedExportKind`] for an unknown
    /// `kind`, [`KeeperError::ExportPayloadMismatch`] when `payload` is of a
    /// different kind, or an I/O error.
    pub fn export(
        &self,
        kind: &str,
        payload: &ExportPayload,
        output_dir: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        self.export_with(&JsonExporter, kind, payload, output_dir)
    }

    /// Like [`Keeper::export`] with a caller-supplied renderer.
    ///
    /// # Errors
    /// Same as [`Keeper::export`], plus any error from `exporter`.
    pub fn export_with(
        &self,
        exporter: &dyn Exporter,
        kind: &str,
        payload: &ExportPayload,
        output_dir: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        export::export_payload(exporter, kind, payload, output_dir.as_ref(), self.offset())
    }
}
