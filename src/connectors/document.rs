use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{send_record, Checkpoint, ConnectorError, ExtractionSummary, SourceConnector};
use crate::domain::RawRecord;

/// Connector for a document-store collection exported as JSON lines.
///
/// Document databases carry internal bookkeeping fields (`_id`) that have no
/// place in the canonical shape; those are dropped on extraction. Lines that
/// fail to parse as JSON objects are skipped and counted, never fatal.
pub struct DocumentConnector {
    source_id: String,
    path: PathBuf,
    exclude_fields: Vec<String>,
}

impl DocumentConnector {
    pub fn new(source_id: &str, path: PathBuf, mut exclude_fields: Vec<String>) -> Self {
        if !exclude_fields.iter().any(|f| f == "_id") {
            exclude_fields.push("_id".to_string());
        }
        Self {
            source_id: source_id.to_string(),
            path,
            exclude_fields,
        }
    }
}

fn open_error(source_id: &str, path: &std::path::Path, e: std::io::Error) -> ConnectorError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ConnectorError::Auth(format!(
            "source '{}' denied access to '{}': {}",
            source_id,
            path.display(),
            e
        ))
    } else {
        ConnectorError::Connection(format!(
            "source '{}' failed to open '{}': {}",
            source_id,
            path.display(),
            e
        ))
    }
}

#[async_trait]
impl SourceConnector for DocumentConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn extract(
        &self,
        since: Option<&Checkpoint>,
        tx: mpsc::Sender<RawRecord>,
    ) -> Result<ExtractionSummary, ConnectorError> {
        let file = File::open(&self.path).map_err(|e| open_error(&self.source_id, &self.path, e))?;
        let reader = BufReader::new(file);

        let skip_lines = match since {
            Some(Checkpoint::Offset { position }) => *position,
            _ => 0,
        };

        let mut summary = ExtractionSummary::default();
        for (line_no, line) in reader.lines().enumerate() {
            if (line_no as u64) < skip_lines {
                continue;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(source = %self.source_id, line = line_no, error = %e, "unreadable line skipped");
                    summary.skipped += 1;
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let mut fields = match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => {
                    warn!(source = %self.source_id, line = line_no, "non-object document skipped");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(source = %self.source_id, line = line_no, error = %e, "malformed document skipped");
                    summary.skipped += 1;
                    continue;
                }
            };
            for excluded in &self.exclude_fields {
                fields.remove(excluded);
            }

            let record = RawRecord {
                source_id: self.source_id.clone(),
                fields,
                extracted_at: Utc::now(),
            };
            if !send_record(&tx, record).await {
                debug!(source = %self.source_id, "receiver closed, stopping extraction");
                break;
            }
            summary.extracted += 1;
        }

        debug!(
            source = %self.source_id,
            extracted = summary.extracted,
            skipped = summary.skipped,
            "document extraction complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_collection(lines: &[&str]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("departments.jsonl");
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        (dir, path)
    }

    #[tokio::test]
    async fn drops_internal_id_and_skips_malformed_lines() {
        let (_dir, path) = write_collection(&[
            r#"{"_id": "651f", "department_id": "D01", "department_name": "Physics"}"#,
            r#"not json at all"#,
            r#"{"_id": "6520", "department_id": "D02", "department_name": "History"}"#,
        ]);
        let connector = DocumentConnector::new("hr_docs", path, Vec::new());
        let (tx, mut rx) = mpsc::channel(16);
        let summary = connector.extract(None, tx).await.unwrap();
        assert_eq!(summary.extracted, 2);
        assert_eq!(summary.skipped, 1);

        let first = rx.recv().await.unwrap();
        assert!(first.fields.get("_id").is_none());
        assert_eq!(first.fields["department_id"], serde_json::json!("D01"));
    }

    #[tokio::test]
    async fn offset_checkpoint_resumes_past_consumed_lines() {
        let (_dir, path) = write_collection(&[
            r#"{"department_id": "D01"}"#,
            r#"{"department_id": "D02"}"#,
            r#"{"department_id": "D03"}"#,
        ]);
        let connector = DocumentConnector::new("hr_docs", path, Vec::new());
        let since = Checkpoint::Offset { position: 2 };
        let (tx, mut rx) = mpsc::channel(16);
        let summary = connector.extract(Some(&since), tx).await.unwrap();
        assert_eq!(summary.extracted, 1);
        assert_eq!(
            rx.recv().await.unwrap().fields["department_id"],
            serde_json::json!("D03")
        );
    }
}
