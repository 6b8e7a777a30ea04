pub mod delimited;
pub mod document;
pub mod relational;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{SourceConfig, SourceKind};
use crate::domain::RawRecord;
use crate::observability::metrics::MetricName;

/// Restart position for an incremental extraction window, supplied by the
/// caller and interpreted by the connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Checkpoint {
    /// Records changed strictly after this instant
    Timestamp { at: DateTime<Utc> },
    /// Records past this source-native position (row id, line number)
    Offset { position: u64 },
}

/// Connector failures, classified for the orchestrator's retry policy.
/// Malformed individual records never surface here; they are skipped and
/// counted in the extraction summary.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Retryable with bounded backoff
    #[error("connection failure: {0}")]
    Connection(String),
    /// Fatal for the job
    #[error("authentication failure: {0}")]
    Auth(String),
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::Connection(_))
    }
}

/// Accounting returned by a completed extraction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionSummary {
    /// Records emitted into the pipeline
    pub extracted: u64,
    /// Malformed source records skipped, surfaced for batch accounting
    pub skipped: u64,
}

/// Per-source adapter producing a uniform stream of raw records.
///
/// Extraction is finite per invocation and restartable from a caller-supplied
/// checkpoint. The bounded channel is the backpressure limit: a full channel
/// pauses extraction until the downstream stages drain.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> &str;

    async fn extract(
        &self,
        since: Option<&Checkpoint>,
        tx: mpsc::Sender<RawRecord>,
    ) -> Result<ExtractionSummary, ConnectorError>;
}

/// Build the connector matching a source descriptor.
pub fn connector_for(source: &SourceConfig) -> Box<dyn SourceConnector> {
    match &source.kind {
        SourceKind::Relational {
            db_path,
            table,
            updated_at_column,
        } => Box::new(relational::RelationalConnector::new(
            &source.source_id,
            db_path.clone(),
            table.clone(),
            updated_at_column.clone(),
        )),
        SourceKind::Document {
            path,
            exclude_fields,
        } => Box::new(document::DocumentConnector::new(
            &source.source_id,
            path.clone(),
            exclude_fields.clone(),
        )),
        SourceKind::Delimited {
            path,
            delimiter,
            has_header,
        } => Box::new(delimited::DelimitedConnector::new(
            &source.source_id,
            path.clone(),
            *delimiter,
            *has_header,
        )),
    }
}

/// Send one record downstream, honoring backpressure. Returns false when the
/// receiver is gone (job cancelled mid-stream); connectors stop emitting then.
pub(crate) async fn send_record(tx: &mpsc::Sender<RawRecord>, record: RawRecord) -> bool {
    if tx.capacity() == 0 {
        crate::observability::metrics::increment(MetricName::ConnectorBackpressurePauses, 1);
    }
    tx.send(record).await.is_ok()
}

/// Blocking-thread counterpart of [`send_record`], for connectors whose
/// cursors are not `Send` and therefore extract on a blocking thread.
pub(crate) fn send_record_blocking(tx: &mpsc::Sender<RawRecord>, record: RawRecord) -> bool {
    if tx.capacity() == 0 {
        crate::observability::metrics::increment(MetricName::ConnectorBackpressurePauses, 1);
    }
    tx.blocking_send(record).is_ok()
}
