use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use funckeeper_core::{now_in, KeeperError};
use serde::Serialize;
use time::macros::format_description;
use time::UtcOffset;

use crate::query::{RecordDetail, SearchHit, Statistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportKind {
    Detail,
    Statistics,
    List,
}

impl ExportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detail => "detail",
            Self::Statistics => "statistics",
            Self::List => "list",
        }
    }

    /// # Errors
    /// Returns [`KeeperError::UnsupportedExportKind`] for anything other than
    /// `detail`, `statistics` or `list`.
    pub fn parse(raw: &str) -> Result<Self, KeeperError> {
        match raw {
            "detail" => Ok(Self::Detail),
            "statistics" => Ok(Self::Statistics),
            "list" => Ok(Self::List),
            other => Err(KeeperError::UnsupportedExportKind(other.to_string())),
        }
    }
}

/// One query output, ready to be written by an [`Exporter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExportPayload {
    Detail(RecordDetail),
    Statistics(Statistics),
    List(Vec<SearchHit>),
}

impl ExportPayload {
    #[must_use]
    pub fn kind(&self) -> ExportKind {
        match self {
            Self::Detail(_) => ExportKind::Detail,
            Self::Statistics(_) => ExportKind::Statistics,
            Self::List(_) => ExportKind::List,
        }
    }
}

impl From<RecordDetail> for ExportPayload {
    fn from(value: RecordDetail) -> Self {
        Self::Detail(value)
    }
}

impl From<Statistics> for ExportPayload {
    fn from(value: Statistics) -> Self {
        Self::Statistics(value)
    }
}

impl From<Vec<SearchHit>> for ExportPayload {
    fn from(value: Vec<SearchHit>) -> Self {
        Self::List(value)
    }
}

/// Renders query outputs to files. Each method writes exactly one file.
pub trait Exporter {
    /// File extension, without the dot.
    fn extension(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn export_detail(&self, data: &RecordDetail, path: &Path) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn export_statistics(&self, data: &Statistics, path: &Path) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn export_list(&self, data: &[SearchHit], path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonExporter;

impl JsonExporter {
    fn write<T: Serialize + ?Sized>(data: &T, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(data).context("failed to encode export")?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write export {}", path.display()))
    }
}

impl Exporter for JsonExporter {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn export_detail(&self, data: &RecordDetail, path: &Path) -> Result<()> {
        Self::write(data, path)
    }

    fn export_statistics(&self, data: &Statistics, path: &Path) -> Result<()> {
        Self::write(data, path)
    }

    fn export_list(&self, data: &[SearchHit], path: &Path) -> Result<()> {
        Self::write(data, path)
    }
}

/// Writes `payload` to `output_dir/funckeeper_<kind>_<YYYYmmdd_HHMMSS>.<ext>`.
/// An export in the same second with the same kind replaces the earlier file.
pub(crate) fn export_payload(
    exporter: &dyn Exporter,
    kind: &str,
    payload: &ExportPayload,
    output_dir: &Path,
    offset: UtcOffset,
) -> Result<PathBuf> {
    let kind = ExportKind::parse(kind)?;
    if payload.kind() != kind {
        return Err(KeeperError::ExportPayloadMismatch {
            expected: kind.as_str(),
            actual: payload.kind().as_str(),
        }
        .into());
    }

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create export directory {}", output_dir.display()))?;

    let stamp = now_in(offset)
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .context("failed to format export timestamp")?;
    let path = output_dir.join(format!(
        "funckeeper_{}_{stamp}.{}",
        kind.as_str(),
        exporter.extension()
    ));

    match payload {
        ExportPayload::Detail(data) => exporter.export_detail(data, &path)?,
        ExportPayload::Statistics(data) => exporter.export_statistics(data, &path)?,
        ExportPayload::List(data) => exporter.export_list(data, &path)?,
    }
    tracing::debug!(kind = kind.as_str(), path = %path.display(), "exported query output");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_kinds_parse_known_names_only() {
        for kind in [ExportKind::Detail, ExportKind::Statistics, ExportKind::List] {
            assert_eq!(ExportKind::parse(kind.as_str()), Ok(kind));
        }
        assert_eq!(
            ExportKind::parse("html"),
            Err(KeeperError::UnsupportedExportKind("html".to_string()))
        );
        assert!(ExportKind::parse("Detail").is_err());
    }

    #[test]
    fn payload_reports_its_kind() {
        assert_eq!(ExportPayload::List(Vec::new()).kind(), ExportKind::List);
        assert_eq!(
            ExportPayload::from(Statistics::new()).kind(),
            ExportKind::Statistics
        );
    }
}
