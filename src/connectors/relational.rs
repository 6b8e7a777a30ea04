use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{send_record_blocking, Checkpoint, ConnectorError, ExtractionSummary, SourceConnector};
use crate::domain::RawRecord;

/// Connector for a relational table in an embedded SQLite database.
///
/// Incremental pulls compare `updated_at_column` against a timestamp
/// checkpoint; offset checkpoints restart from a rowid position.
pub struct RelationalConnector {
    source_id: String,
    db_path: PathBuf,
    table: String,
    updated_at_column: Option<String>,
}

impl RelationalConnector {
    pub fn new(
        source_id: &str,
        db_path: PathBuf,
        table: String,
        updated_at_column: Option<String>,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            db_path,
            table,
            updated_at_column,
        }
    }

    fn query_for(&self, since: Option<&Checkpoint>) -> Result<(String, Option<String>), ConnectorError> {
        // Table and column names come from operator-owned job descriptors;
        // they are validated as identifiers before interpolation.
        for name in std::iter::once(self.table.as_str())
            .chain(self.updated_at_column.as_deref())
        {
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(ConnectorError::Connection(format!(
                    "invalid identifier in source descriptor: {name}"
                )));
            }
        }
        match since {
            Some(Checkpoint::Timestamp { at }) => {
                let column = self.updated_at_column.as_deref().ok_or_else(|| {
                    ConnectorError::Connection(format!(
                        "source '{}' has no updated_at_column for timestamp checkpoints",
                        self.source_id
                    ))
                })?;
                Ok((
                    format!("SELECT * FROM {} WHERE {} > ?1", self.table, column),
                    Some(at.to_rfc3339()),
                ))
            }
            Some(Checkpoint::Offset { position }) => Ok((
                format!("SELECT * FROM {} WHERE rowid > ?1", self.table),
                Some(position.to_string()),
            )),
            None => Ok((format!("SELECT * FROM {}", self.table), None)),
        }
    }
}

fn column_to_json(value: ValueRef<'_>) -> Option<serde_json::Value> {
    match value {
        ValueRef::Null => Some(serde_json::Value::Null),
        ValueRef::Integer(i) => Some(serde_json::Value::from(i)),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(serde_json::Value::Number),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .ok()
            .map(|s| serde_json::Value::String(s.to_string())),
        // Binary columns have no canonical field representation
        ValueRef::Blob(_) => None,
    }
}

#[async_trait]
impl SourceConnector for RelationalConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn extract(
        &self,
        since: Option<&Checkpoint>,
        tx: mpsc::Sender<RawRecord>,
    ) -> Result<ExtractionSummary, ConnectorError> {
        let (sql, param) = self.query_for(since)?;
        let db_path = self.db_path.clone();
        let source_id = self.source_id.clone();

        // rusqlite cursors are not `Send`, so the read loop runs on a
        // blocking thread; `send_record_blocking` preserves backpressure.
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(|e| {
                ConnectorError::Connection(format!(
                    "failed to open '{}': {}",
                    db_path.display(),
                    e
                ))
            })?;

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| ConnectorError::Connection(format!("prepare failed: {e}")))?;
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(|c| c.to_string())
                .collect();

            let mut rows = match &param {
                Some(p) => stmt.query([p.as_str()]),
                None => stmt.query([]),
            }
            .map_err(|e| ConnectorError::Connection(format!("query failed: {e}")))?;

            let mut summary = ExtractionSummary::default();
            loop {
                let row = match rows.next() {
                    Ok(Some(row)) => row,
                    Ok(None) => break,
                    Err(e) => {
                        // The cursor cannot advance past a corrupt row; account
                        // for it and end the stream rather than spin
                        warn!(source = %source_id, error = %e, "unreadable row, ending extraction");
                        summary.skipped += 1;
                        break;
                    }
                };

                let mut fields = serde_json::Map::new();
                let mut malformed = false;
                for (idx, column) in columns.iter().enumerate() {
                    match row.get_ref(idx) {
                        Ok(value) => match column_to_json(value) {
                            Some(json) => {
                                fields.insert(column.clone(), json);
                            }
                            None => {
                                malformed = true;
                                break;
                            }
                        },
                        Err(_) => {
                            malformed = true;
                            break;
                        }
                    }
                }
                if malformed {
                    warn!(source = %source_id, "skipping row with unrepresentable column value");
                    summary.skipped += 1;
                    continue;
                }

                let record = RawRecord {
                    source_id: source_id.clone(),
                    fields,
                    extracted_at: Utc::now(),
                };
                if !send_record_blocking(&tx, record) {
                    debug!(source = %source_id, "receiver closed, stopping extraction");
                    break;
                }
                summary.extracted += 1;
            }

            debug!(
                source = %source_id,
                extracted = summary.extracted,
                skipped = summary.skipped,
                "relational extraction complete"
            );
            Ok(summary)
        })
        .await
        .map_err(|e| ConnectorError::Connection(format!("extraction task failed: {e}")))?
    }
}
