use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::debug;

use crate::config::{CleanseKind, CleanseOp, DimensionConfig, RuleConfig, RuleKind};
use crate::domain::{
    CleansingAction, FieldValue, RuleViolation, Severity, StagingRecord, ValidationOutcome,
};
use crate::error::{EtlError, Result};

/// Membership view the referential rules check against. The conformance
/// overlay implements this so records admitted earlier in the batch count as
/// known members.
pub trait DimensionLookup {
    fn contains_member(&self, dimension: &str, natural_key: &str) -> bool;
}

/// No known members; used where no dimension state is in scope.
pub struct NoDimensions;

impl DimensionLookup for NoDimensions {
    fn contains_member(&self, _dimension: &str, _natural_key: &str) -> bool {
        false
    }
}

enum CompiledKind {
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
        regex: Regex,
    },
    UniqueInBatch {
        field: String,
    },
    KnownDimension {
        field: String,
        dimension: String,
        admit_new: bool,
    },
}

struct CompiledRule {
    id: String,
    severity: Severity,
    kind: CompiledKind,
}

/// Validation and cleansing engine.
///
/// Cleansing actions run before rule evaluation and are recorded on the
/// record. Rules are evaluated independently and all violations collected so
/// the quarantine audit shows every reason a record failed. Holds batch-local
/// state for uniqueness checks; build one per batch.
pub struct Validator {
    cleansing: Vec<CleanseOp>,
    rules: Vec<CompiledRule>,
    /// Natural-key fields of the job's target dimensions; an empty or null
    /// key is a referential violation quarantined before conformance
    natural_key_fields: Vec<(String, String)>,
    seen: HashMap<usize, HashSet<String>>,
}

impl Validator {
    pub fn new(
        cleansing: Vec<CleanseOp>,
        rules: &[RuleConfig],
        dimensions: &[DimensionConfig],
    ) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let kind = match &rule.kind {
                RuleKind::Required { field } => CompiledKind::Required {
                    field: field.clone(),
                },
                RuleKind::Range { field, min, max } => CompiledKind::Range {
                    field: field.clone(),
                    min: *min,
                    max: *max,
                },
                RuleKind::Length { field, min, max } => CompiledKind::Length {
                    field: field.clone(),
                    min: *min,
                    max: *max,
                },
                RuleKind::Pattern { field, pattern } => CompiledKind::Pattern {
                    field: field.clone(),
                    regex: Regex::new(pattern).map_err(|e| {
                        EtlError::Config(format!("rule '{}' has a bad pattern: {}", rule.id, e))
                    })?,
                },
                RuleKind::UniqueInBatch { field } => CompiledKind::UniqueInBatch {
                    field: field.clone(),
                },
                RuleKind::KnownDimension {
                    field,
                    dimension,
                    admit_new,
                } => CompiledKind::KnownDimension {
                    field: field.clone(),
                    dimension: dimension.clone(),
                    admit_new: *admit_new,
                },
            };
            compiled.push(CompiledRule {
                id: rule.id.clone(),
                severity: rule.severity,
                kind,
            });
        }
        Ok(Self {
            cleansing,
            rules: compiled,
            natural_key_fields: dimensions
                .iter()
                .map(|d| (d.name.clone(), d.natural_key_field.clone()))
                .collect(),
            seen: HashMap::new(),
        })
    }

    /// Cleanse the record in place, then evaluate every rule.
    pub fn validate(
        &mut self,
        record: &mut StagingRecord,
        dims: &dyn DimensionLookup,
    ) -> ValidationOutcome {
        self.cleanse(record);

        let mut violations = Vec::new();

        for (dimension, field) in &self.natural_key_fields {
            if record.get(field).render().trim().is_empty() {
                violations.push(RuleViolation {
                    rule_id: "referential_violation".to_string(),
                    severity: Severity::Error,
                    field: Some(field.clone()),
                    message: format!("empty natural key for dimension '{dimension}'"),
                });
            }
        }

        for (idx, rule) in self.rules.iter().enumerate() {
            if let Some(mut violation) = evaluate(rule, record, dims, &mut self.seen, idx) {
                violation.rule_id = rule.id.clone();
                violation.severity = rule.severity;
                violations.push(violation);
            }
        }

        if violations.iter().any(|v| v.severity == Severity::Error) {
            debug!(
                source_key = %record.provenance.source_key,
                violations = violations.len(),
                "record quarantined"
            );
            ValidationOutcome::Quarantined { violations }
        } else {
            ValidationOutcome::Accepted {
                warnings: violations,
            }
        }
    }

    fn cleanse(&self, record: &mut StagingRecord) {
        for op in &self.cleansing {
            let original = record.get(&op.field).clone();
            let cleansed = apply_cleanse(&op.kind, &original);
            if let Some(cleansed) = cleansed {
                if cleansed != original {
                    record.cleansing.push(CleansingAction {
                        field: op.field.clone(),
                        op: cleanse_name(&op.kind).to_string(),
                        original: original.render(),
                        result: cleansed.render(),
                    });
                    record.fields.insert(op.field.clone(), cleansed);
                }
            }
        }
    }
}

fn cleanse_name(kind: &CleanseKind) -> &'static str {
    match kind {
        CleanseKind::Trim => "trim",
        CleanseKind::TitleCase => "title_case",
        CleanseKind::UpperCase => "upper_case",
        CleanseKind::LowerCase => "lower_case",
        CleanseKind::Default { .. } => "default",
        CleanseKind::Remap { .. } => "remap",
    }
}

fn apply_cleanse(kind: &CleanseKind, value: &FieldValue) -> Option<FieldValue> {
    match kind {
        CleanseKind::Default { value: default } => {
            if value.is_null() {
                Some(FieldValue::Text(default.clone()))
            } else {
                None
            }
        }
        CleanseKind::Trim => value
            .as_text()
            .map(|s| FieldValue::Text(s.trim().to_string())),
        CleanseKind::TitleCase => value.as_text().map(|s| FieldValue::Text(title_case(s))),
        CleanseKind::UpperCase => value
            .as_text()
            .map(|s| FieldValue::Text(s.to_uppercase())),
        CleanseKind::LowerCase => value
            .as_text()
            .map(|s| FieldValue::Text(s.to_lowercase())),
        CleanseKind::Remap { map } => value
            .as_text()
            .and_then(|s| map.get(s))
            .map(|replacement| FieldValue::Text(replacement.clone())),
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn evaluate(
    rule: &CompiledRule,
    record: &StagingRecord,
    dims: &dyn DimensionLookup,
    seen: &mut HashMap<usize, HashSet<String>>,
    rule_idx: usize,
) -> Option<RuleViolation> {
    let violation = |field: &str, message: String| {
        Some(RuleViolation {
            rule_id: String::new(),
            severity: Severity::Error,
            field: Some(field.to_string()),
            message,
        })
    };

    match &rule.kind {
        CompiledKind::Required { field } => {
            if record.get(field).is_null() {
                violation(field, format!("'{field}' is required but null"))
            } else {
                None
            }
        }
        CompiledKind::Range { field, min, max } => {
            let value = record.get(field);
            if value.is_null() {
                return None;
            }
            let Some(number) = value.as_decimal() else {
                return violation(
                    field,
                    format!("'{field}' is {} and cannot be range-checked", value.type_name()),
                );
            };
            if min.map(|m| number < m).unwrap_or(false)
                || max.map(|m| number > m).unwrap_or(false)
            {
                violation(field, format!("'{field}' value {number} is out of range"))
            } else {
                None
            }
        }
        CompiledKind::Length { field, min, max } => {
            let value = record.get(field);
            if value.is_null() {
                return None;
            }
            let len = value.render().chars().count();
            if min.map(|m| len < m).unwrap_or(false) || max.map(|m| len > m).unwrap_or(false) {
                violation(field, format!("'{field}' length {len} is out of bounds"))
            } else {
                None
            }
        }
        CompiledKind::Pattern { field, regex } => {
            let value = record.get(field);
            if value.is_null() {
                return None;
            }
            let rendered = value.render();
            if regex.is_match(&rendered) {
                None
            } else {
                violation(field, format!("'{field}' value '{rendered}' does not match pattern"))
            }
        }
        CompiledKind::UniqueInBatch { field } => {
            let value = record.get(field);
            if value.is_null() {
                return None;
            }
            let rendered = value.render();
            let values = seen.entry(rule_idx).or_default();
            if values.insert(rendered.clone()) {
                None
            } else {
                violation(field, format!("'{field}' value '{rendered}' repeats within the batch"))
            }
        }
        CompiledKind::KnownDimension {
            field,
            dimension,
            admit_new,
        } => {
            if *admit_new {
                return None;
            }
            let key = record.get(field).render();
            if key.is_empty() || !dims.contains_member(dimension, &key) {
                violation(
                    field,
                    format!("'{key}' is not a known member of dimension '{dimension}'"),
                )
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Provenance;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(fields: &[(&str, FieldValue)]) -> StagingRecord {
        StagingRecord {
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            provenance: Provenance {
                source_id: "sis".to_string(),
                source_key: "S001".to_string(),
                extracted_at: Utc::now(),
            },
            cleansing: Vec::new(),
        }
    }

    fn rule(id: &str, severity: Severity, kind: RuleKind) -> RuleConfig {
        RuleConfig {
            id: id.to_string(),
            severity,
            kind,
        }
    }

    #[test]
    fn cleansing_is_applied_and_recorded() {
        let cleansing = vec![
            CleanseOp {
                field: "name".to_string(),
                kind: CleanseKind::Trim,
            },
            CleanseOp {
                field: "name".to_string(),
                kind: CleanseKind::TitleCase,
            },
            CleanseOp {
                field: "major".to_string(),
                kind: CleanseKind::Remap {
                    map: [("BS Software Eng".to_string(), "BS Software Engineering".to_string())]
                        .into_iter()
                        .collect(),
                },
            },
        ];
        let mut validator = Validator::new(cleansing, &[], &[]).unwrap();
        let mut rec = record(&[
            ("name", FieldValue::Text("  jane SMITH ".to_string())),
            ("major", FieldValue::Text("BS Software Eng".to_string())),
        ]);

        let outcome = validator.validate(&mut rec, &NoDimensions);
        assert!(matches!(outcome, ValidationOutcome::Accepted { .. }));
        assert_eq!(rec.get("name"), &FieldValue::Text("Jane Smith".to_string()));
        assert_eq!(
            rec.get("major"),
            &FieldValue::Text("BS Software Engineering".to_string())
        );
        // Every change is recorded, never silent
        assert_eq!(rec.cleansing.len(), 3);
        assert_eq!(rec.cleansing[0].op, "trim");
        assert_eq!(rec.cleansing[0].original, "  jane SMITH ");
    }

    #[test]
    fn all_violations_are_collected_not_short_circuited() {
        let rules = vec![
            rule(
                "gpa_range",
                Severity::Error,
                RuleKind::Range {
                    field: "gpa".to_string(),
                    min: Some(0.0),
                    max: Some(4.0),
                },
            ),
            rule(
                "name_required",
                Severity::Error,
                RuleKind::Required {
                    field: "name".to_string(),
                },
            ),
        ];
        let mut validator = Validator::new(Vec::new(), &rules, &[]).unwrap();
        let mut rec = record(&[("gpa", FieldValue::Decimal(5.5)), ("name", FieldValue::Null)]);

        match validator.validate(&mut rec, &NoDimensions) {
            ValidationOutcome::Quarantined { violations } => {
                assert_eq!(violations.len(), 2);
                assert_eq!(violations[0].rule_id, "gpa_range");
                assert_eq!(violations[1].rule_id, "name_required");
            }
            other => panic!("expected quarantine, got {other:?}"),
        }
    }

    #[test]
    fn warnings_pass_with_annotations() {
        let rules = vec![rule(
            "short_name",
            Severity::Warning,
            RuleKind::Length {
                field: "name".to_string(),
                min: Some(2),
                max: None,
            },
        )];
        let mut validator = Validator::new(Vec::new(), &rules, &[]).unwrap();
        let mut rec = record(&[("name", FieldValue::Text("X".to_string()))]);

        match validator.validate(&mut rec, &NoDimensions) {
            ValidationOutcome::Accepted { warnings } => {
                assert_eq!(warnings.len(), 1);
                assert_eq!(warnings[0].severity, Severity::Warning);
            }
            other => panic!("expected accepted with warnings, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_keys_within_batch_are_flagged() {
        let rules = vec![rule(
            "unique_enrollment",
            Severity::Error,
            RuleKind::UniqueInBatch {
                field: "enrollment_id".to_string(),
            },
        )];
        let mut validator = Validator::new(Vec::new(), &rules, &[]).unwrap();

        let mut first = record(&[("enrollment_id", FieldValue::Text("E1".to_string()))]);
        assert!(matches!(
            validator.validate(&mut first, &NoDimensions),
            ValidationOutcome::Accepted { .. }
        ));

        let mut second = record(&[("enrollment_id", FieldValue::Text("E1".to_string()))]);
        assert!(matches!(
            validator.validate(&mut second, &NoDimensions),
            ValidationOutcome::Quarantined { .. }
        ));
    }

    #[test]
    fn empty_natural_key_is_a_referential_violation() {
        let dims = vec![DimensionConfig {
            name: "student".to_string(),
            natural_key_field: "student_id".to_string(),
            scd: crate::domain::ScdType::Type2,
            attributes: vec!["major".to_string()],
        }];
        let mut validator = Validator::new(Vec::new(), &[], &dims).unwrap();
        let mut rec = record(&[("student_id", FieldValue::Text("  ".to_string()))]);

        match validator.validate(&mut rec, &NoDimensions) {
            ValidationOutcome::Quarantined { violations } => {
                assert_eq!(violations[0].rule_id, "referential_violation");
            }
            other => panic!("expected quarantine, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dimension_member_is_rejected_unless_admissible() {
        struct OneMember;
        impl DimensionLookup for OneMember {
            fn contains_member(&self, dimension: &str, natural_key: &str) -> bool {
                dimension == "course" && natural_key == "C100"
            }
        }

        let rules = vec![rule(
            "course_exists",
            Severity::Error,
            RuleKind::KnownDimension {
                field: "course_id".to_string(),
                dimension: "course".to_string(),
                admit_new: false,
            },
        )];
        let mut validator = Validator::new(Vec::new(), &rules, &[]).unwrap();

        let mut known = record(&[("course_id", FieldValue::Text("C100".to_string()))]);
        assert!(matches!(
            validator.validate(&mut known, &OneMember),
            ValidationOutcome::Accepted { .. }
        ));

        let mut unknown = record(&[("course_id", FieldValue::Text("C999".to_string()))]);
        assert!(matches!(
            validator.validate(&mut unknown, &OneMember),
            ValidationOutcome::Quarantined { .. }
        ));
    }
}
