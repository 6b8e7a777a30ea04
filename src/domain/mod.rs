use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A typed value in a canonical staging record.
///
/// Source data arrives untyped (document collections, delimited files); every
/// canonical field carries one of these after normalization, with `Null` as an
/// explicit absent value rather than a missing map entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    Boolean(bool),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Integer(_) => "integer",
            FieldValue::Decimal(_) => "decimal",
            FieldValue::Date(_) => "date",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::Null => "null",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used by range rules; integers widen to decimal.
    pub fn as_decimal(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Stable textual rendering used for natural keys, business keys and
    /// uniqueness checks. `Null` renders empty.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Decimal(d) => d.to_string(),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Boolean(b) => b.to_string(),
            FieldValue::Null => String::new(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A source-tagged record as emitted by a connector, before any mapping.
/// Ephemeral; exists only within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// The source system that provided the data
    pub source_id: String,
    /// Untyped field name → value mapping as found in the source
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// When this record was pulled from the source
    pub extracted_at: DateTime<Utc>,
}

/// Provenance linking a staging record back to its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    /// The source-native identifying value for this record
    pub source_key: String,
    pub extracted_at: DateTime<Utc>,
}

/// A cleansing operation applied before validation, recorded so cleansed
/// values are never silently indistinguishable from original data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleansingAction {
    pub field: String,
    pub op: String,
    pub original: String,
    pub result: String,
}

/// A normalized record in the canonical staging shape. Every canonical field
/// required by the target schema is present, possibly as an explicit null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRecord {
    pub fields: BTreeMap<String, FieldValue>,
    pub provenance: Provenance,
    /// Cleansing actions applied to this record, in application order
    pub cleansing: Vec<CleansingAction>,
}

impl StagingRecord {
    pub fn get(&self, field: &str) -> &FieldValue {
        self.fields.get(field).unwrap_or(&FieldValue::Null)
    }
}

/// Severity of a validation-rule violation. `Error` forces quarantine,
/// `Warning` allows passage with an annotation retained for the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// A single rule outcome attached to a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule_id: String,
    pub severity: Severity,
    pub field: Option<String>,
    pub message: String,
}

/// Per-record verdict from the validation engine. A quarantined record is
/// never forwarded to dimension conformance or fact loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ValidationOutcome {
    Accepted { warnings: Vec<RuleViolation> },
    Quarantined { violations: Vec<RuleViolation> },
}

/// Slowly-changing-dimension policy for a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScdType {
    /// Overwrite descriptive attributes in place
    Type1,
    /// Version with history: close the current row and insert a new one
    Type2,
}

/// Surrogate key reserved for the "unknown member" placeholder row of every
/// dimension. Regular surrogate assignment starts at 1.
pub const UNKNOWN_MEMBER_KEY: i64 = 0;

/// One versioned row of a dimension table.
///
/// Invariant: for a given natural key at most one row has `is_current = true`,
/// and effective intervals for the same natural key never overlap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionRecord {
    /// Warehouse-assigned key, immutable once issued
    pub surrogate_key: i64,
    pub natural_key: String,
    pub attributes: BTreeMap<String, FieldValue>,
    pub effective_from: DateTime<Utc>,
    /// `None` means the row is still in effect
    pub effective_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

impl DimensionRecord {
    /// Whether this row was in effect at the given instant.
    pub fn in_effect_at(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_to.map(|to| at < to).unwrap_or(true)
    }
}

/// One row of a fact table, identified by business key for idempotent upserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactRecord {
    pub business_key: String,
    /// Role name → dimension surrogate key
    pub dimension_keys: BTreeMap<String, i64>,
    pub measures: BTreeMap<String, FieldValue>,
    /// Content fingerprint over dimension keys and measures; equal
    /// fingerprints mean a replay produces no observable change
    pub measure_hash: String,
    pub event_time: Option<DateTime<Utc>>,
    /// The load batch that produced or last updated this row
    pub batch_id: Uuid,
}

/// Terminal status of a load batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Succeeded,
    Failed,
    Partial,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Succeeded => "succeeded",
            BatchStatus::Failed => "failed",
            BatchStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(BatchStatus::Running),
            "succeeded" => Some(BatchStatus::Succeeded),
            "failed" => Some(BatchStatus::Failed),
            "partial" => Some(BatchStatus::Partial),
            _ => None,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record accounting for one batch.
///
/// Invariant: `accepted + quarantined + connector_skipped == extracted`;
/// every input record is accounted for, silent loss is disallowed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchCounts {
    pub extracted: u64,
    pub connector_skipped: u64,
    pub accepted: u64,
    pub quarantined: u64,
    pub dims_inserted: u64,
    pub dims_updated: u64,
    pub facts_inserted: u64,
    pub facts_updated: u64,
    pub facts_unchanged: u64,
}

/// Audit record for one pipeline execution. Created at orchestration start,
/// sealed at completion; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBatch {
    pub id: Uuid,
    pub job_name: String,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub counts: BatchCounts,
    pub failure_reason: Option<String>,
}

impl LoadBatch {
    pub fn start(job_name: &str, source_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            source_id: source_id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: BatchStatus::Running,
            counts: BatchCounts::default(),
            failure_reason: None,
        }
    }

    pub fn seal(&mut self, status: BatchStatus, reason: Option<String>) {
        self.status = status;
        self.failure_reason = reason;
        self.completed_at = Some(Utc::now());
    }
}

/// A rejected staging record retained for operator review, never auto-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub batch_id: Uuid,
    pub record: StagingRecord,
    pub violations: Vec<RuleViolation>,
    pub quarantined_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn render_is_stable_for_key_building() {
        assert_eq!(FieldValue::Text("S001".into()).render(), "S001");
        assert_eq!(FieldValue::Integer(42).render(), "42");
        assert_eq!(
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()).render(),
            "2024-09-01"
        );
        assert_eq!(FieldValue::Null.render(), "");
    }

    #[test]
    fn in_effect_at_respects_half_open_interval() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let row = DimensionRecord {
            surrogate_key: 1,
            natural_key: "S001".into(),
            attributes: BTreeMap::new(),
            effective_from: from,
            effective_to: Some(to),
            is_current: false,
        };
        assert!(row.in_effect_at(from));
        assert!(row.in_effect_at(to - chrono::Duration::seconds(1)));
        assert!(!row.in_effect_at(to));

        let current = DimensionRecord {
            effective_to: None,
            is_current: true,
            ..row.clone()
        };
        assert!(current.in_effect_at(to));
    }

    #[test]
    fn batch_status_round_trips() {
        for s in [
            BatchStatus::Running,
            BatchStatus::Succeeded,
            BatchStatus::Failed,
            BatchStatus::Partial,
        ] {
            assert_eq!(BatchStatus::parse(s.as_str()), Some(s));
        }
    }
}
