use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{send_record, Checkpoint, ConnectorError, ExtractionSummary, SourceConnector};
use crate::domain::RawRecord;

/// Connector for delimited flat files.
///
/// Fields may be quoted with `"`, with `""` as the embedded-quote escape.
/// Without a header row, fields are named by position (`col0`, `col1`, ...).
/// Rows whose field count does not match the header are malformed and
/// skipped, surfaced through the extraction summary.
pub struct DelimitedConnector {
    source_id: String,
    path: PathBuf,
    delimiter: char,
    has_header: bool,
}

impl DelimitedConnector {
    pub fn new(source_id: &str, path: PathBuf, delimiter: char, has_header: bool) -> Self {
        Self {
            source_id: source_id.to_string(),
            path,
            delimiter,
            has_header,
        }
    }
}

/// Split one line into fields, honoring quoting.
fn split_line(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' && current.is_empty() {
            in_quotes = true;
        } else if c == delimiter {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields
}

#[async_trait]
impl SourceConnector for DelimitedConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn extract(
        &self,
        since: Option<&Checkpoint>,
        tx: mpsc::Sender<RawRecord>,
    ) -> Result<ExtractionSummary, ConnectorError> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ConnectorError::Auth(format!(
                    "source '{}' denied access to '{}': {}",
                    self.source_id,
                    self.path.display(),
                    e
                ))
            } else {
                ConnectorError::Connection(format!(
                    "source '{}' failed to read '{}': {}",
                    self.source_id,
                    self.path.display(),
                    e
                ))
            }
        })?;

        let mut lines = content.lines();
        let header: Option<Vec<String>> = if self.has_header {
            match lines.next() {
                Some(line) => Some(split_line(line, self.delimiter)),
                None => None,
            }
        } else {
            None
        };

        let skip_rows = match since {
            Some(Checkpoint::Offset { position }) => *position,
            _ => 0,
        };

        let mut summary = ExtractionSummary::default();
        for (row_no, line) in lines.enumerate() {
            if (row_no as u64) < skip_rows {
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            let values = split_line(line, self.delimiter);
            let names: Vec<String> = match &header {
                Some(names) => {
                    if values.len() != names.len() {
                        warn!(
                            source = %self.source_id,
                            row = row_no,
                            expected = names.len(),
                            found = values.len(),
                            "field count mismatch, row skipped"
                        );
                        summary.skipped += 1;
                        continue;
                    }
                    names.clone()
                }
                None => (0..values.len()).map(|i| format!("col{i}")).collect(),
            };

            let mut fields = serde_json::Map::new();
            for (name, value) in names.into_iter().zip(values) {
                fields.insert(name, serde_json::Value::String(value));
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
            "delimited extraction complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn split_handles_quotes_and_escapes() {
        assert_eq!(split_line("a,b,c", ','), vec!["a", "b", "c"]);
        assert_eq!(
            split_line(r#""Smith, Jane",CS,3.4"#, ','),
            vec!["Smith, Jane", "CS", "3.4"]
        );
        assert_eq!(
            split_line(r#""say ""hi""",x"#, ','),
            vec![r#"say "hi""#, "x"]
        );
        assert_eq!(split_line("a,,c", ','), vec!["a", "", "c"]);
    }

    #[tokio::test]
    async fn header_names_fields_and_bad_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finance.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "account_id,amount,posted_on").unwrap();
        writeln!(file, "A100,250.00,2024-02-01").unwrap();
        writeln!(file, "A101,17.50").unwrap();
        writeln!(file, "A102,99.95,2024-02-03").unwrap();

        let connector = DelimitedConnector::new("finance_csv", path, ',', true);
        let (tx, mut rx) = mpsc::channel(16);
        let summary = connector.extract(None, tx).await.unwrap();
        assert_eq!(summary.extracted, 2);
        assert_eq!(summary.skipped, 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.fields["account_id"], serde_json::json!("A100"));
        assert_eq!(first.fields["amount"], serde_json::json!("250.00"));
    }

    #[tokio::test]
    async fn headerless_files_use_positional_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        fs::write(&path, "x|y\n1|2\n").unwrap();

        let connector = DelimitedConnector::new("flat", path, '|', false);
        let (tx, mut rx) = mpsc::channel(16);
        let summary = connector.extract(None, tx).await.unwrap();
        assert_eq!(summary.extracted, 2);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.fields["col0"], serde_json::json!("x"));
    }
}
