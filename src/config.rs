use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::domain::{ScdType, Severity};
use crate::error::{EtlError, Result};

/// Full descriptor for one source-to-target job: where to extract from, how
/// to map fields into the canonical shape, which rules gate the records, and
/// which star-schema area they land in.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub job_name: String,
    pub source: SourceConfig,
    /// Backpressure limit: maximum in-flight records between the extractor
    /// and the transform/load stage
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cleansing: Vec<CleanseOp>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,
    pub fact: Option<FactConfig>,
}

impl JobConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            EtlError::Config(format!(
                "failed to read job file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: JobConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that cannot be expressed in serde alone.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions.is_empty() && self.fact.is_none() {
            return Err(EtlError::Config(format!(
                "job '{}' targets no dimension and no fact table",
                self.job_name
            )));
        }
        for dim in &self.dimensions {
            if !self
                .source
                .field_map
                .iter()
                .any(|m| m.canonical_field == dim.natural_key_field)
            {
                return Err(EtlError::Config(format!(
                    "dimension '{}' natural key field '{}' is not produced by the field map",
                    dim.name, dim.natural_key_field
                )));
            }
        }
        if let Some(fact) = &self.fact {
            if fact.business_key_fields.is_empty() {
                return Err(EtlError::Config(format!(
                    "fact table '{}' has no business key fields",
                    fact.table
                )));
            }
        }
        Ok(())
    }
}

fn default_channel_capacity() -> usize {
    256
}

/// Per-source declarative descriptor. Credentials are referenced by name and
/// resolved by the operator environment, never inlined here.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub credentials_ref: Option<String>,
    pub kind: SourceKind,
    pub field_map: Vec<FieldMapping>,
    /// Timeout applied per connector call, not per job
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    /// A relational table in an embedded SQLite database
    Relational {
        db_path: PathBuf,
        table: String,
        /// Column compared against a timestamp checkpoint for incremental pulls
        updated_at_column: Option<String>,
    },
    /// A document-store collection exported as JSON lines
    Document {
        path: PathBuf,
        /// Source-internal fields dropped on extraction; `_id` is always dropped
        #[serde(default)]
        exclude_fields: Vec<String>,
    },
    /// A delimited flat file
    Delimited {
        path: PathBuf,
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default = "default_true")]
        has_header: bool,
    },
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

/// One entry of the declarative source-field → canonical-field mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    pub canonical_field: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Marks the source-native identifying field recorded in provenance.
    /// Key fields are implicitly required.
    #[serde(default)]
    pub key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Date,
    Boolean,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

/// A cleansing operation applied to a canonical field before rule evaluation.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanseOp {
    pub field: String,
    #[serde(flatten)]
    pub kind: CleanseKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CleanseKind {
    Trim,
    TitleCase,
    UpperCase,
    LowerCase,
    /// Substitute a default when the field is null
    Default { value: String },
    /// Remap known variant spellings onto canonical values
    Remap { map: HashMap<String, String> },
}

/// A validation rule with its configured severity.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: RuleKind,
}

fn default_severity() -> Severity {
    Severity::Error
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleKind {
    Required {
        field: String,
    },
    Range {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    Length {
        field: String,
        min: Option<usize>,
        max: Option<usize>,
    },
    Pattern {
        field: String,
        pattern: String,
    },
    UniqueInBatch {
        field: String,
    },
    /// Natural key must resolve to a known dimension member, or be admissible
    /// as a new member when `admit_new` is set
    KnownDimension {
        field: String,
        dimension: String,
        #[serde(default)]
        admit_new: bool,
    },
}

/// Target dimension within the star-schema area this job conforms.
#[derive(Debug, Clone, Deserialize)]
pub struct DimensionConfig {
    pub name: String,
    pub natural_key_field: String,
    pub scd: ScdType,
    /// Canonical staging fields persisted as descriptive attributes
    pub attributes: Vec<String>,
}

/// Target fact table and its dimension references.
#[derive(Debug, Clone, Deserialize)]
pub struct FactConfig {
    pub table: String,
    pub business_key_fields: Vec<String>,
    pub measures: Vec<String>,
    /// When set, Type 2 references marked `as_of` join against the row
    /// effective at this field's value instead of the current row
    pub event_time_field: Option<String>,
    #[serde(default)]
    pub dimension_refs: Vec<DimensionRef>,
    #[serde(default)]
    pub unresolved_policy: UnresolvedPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimensionRef {
    /// Role name the surrogate key is stored under in the fact row
    pub role: String,
    pub dimension: String,
    /// Canonical staging field carrying the natural key
    pub field: String,
    #[serde(default)]
    pub as_of: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// Quarantine the fact record
    #[default]
    Quarantine,
    /// Link the fact to the reserved unknown-member row; attributes are never
    /// fabricated
    UnknownMember,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_job_descriptor() {
        let toml_src = r#"
            job_name = "sis_students"

            [source]
            source_id = "sis"
            credentials_ref = "sis_readonly"
            kind = { type = "document", path = "students.jsonl" }
            field_map = [
                { source_field = "student_id", canonical_field = "student_id", field_type = "text", key = true },
                { source_field = "major", canonical_field = "major", field_type = "text", required = true },
                { source_field = "gpa", canonical_field = "gpa", field_type = "decimal" },
            ]

            [[cleansing]]
            field = "major"
            op = "trim"

            [[rules]]
            id = "gpa_range"
            rule = "range"
            field = "gpa"
            min = 0.0
            max = 4.0

            [[dimensions]]
            name = "student"
            natural_key_field = "student_id"
            scd = "type2"
            attributes = ["major"]

            [fact]
            table = "academics"
            business_key_fields = ["student_id"]
            measures = ["gpa"]
            unresolved_policy = "unknown_member"
            dimension_refs = [
                { role = "student_key", dimension = "student", field = "student_id" },
            ]
        "#;
        let config: JobConfig = toml::from_str(toml_src).unwrap();
        config.validate().unwrap();
        assert_eq!(config.job_name, "sis_students");
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(matches!(config.source.kind, SourceKind::Document { .. }));
        assert_eq!(config.dimensions[0].scd, ScdType::Type2);
        assert_eq!(
            config.fact.as_ref().unwrap().unresolved_policy,
            UnresolvedPolicy::UnknownMember
        );
        assert!(config.source.field_map[0].key);
    }

    #[test]
    fn rejects_dimension_without_mapped_natural_key() {
        let toml_src = r#"
            job_name = "broken"

            [source]
            source_id = "sis"
            kind = { type = "document", path = "x.jsonl" }
            field_map = [
                { source_field = "a", canonical_field = "a", field_type = "text" },
            ]

            [[dimensions]]
            name = "student"
            natural_key_field = "student_id"
            scd = "type1"
            attributes = []
        "#;
        let config: JobConfig = toml::from_str(toml_src).unwrap();
        assert!(config.validate().is_err());
    }
}
