use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::config::{FieldMapping, FieldType};
use crate::domain::{
    FieldValue, Provenance, RawRecord, RuleViolation, Severity, StagingRecord,
};

/// A record the normalizer could not bring into the canonical shape. Carries
/// the best-effort partial staging record so quarantine retains content, and
/// the full violation list so the audit shows every reason at once.
#[derive(Debug)]
pub struct NormalizeFailure {
    pub record: StagingRecord,
    pub violations: Vec<RuleViolation>,
}

/// Map a raw record onto the canonical staging shape.
///
/// Missing source fields map to explicit null for optional canonical fields
/// and produce a `schema_violation` for required ones. Coercion failures are
/// reported as `type_coercion_failure`, never silently dropped or
/// zero-filled. Either failure kind becomes an immediate quarantine in the
/// caller rather than a pipeline-fatal error.
pub fn normalize(
    raw: &RawRecord,
    mappings: &[FieldMapping],
) -> Result<StagingRecord, NormalizeFailure> {
    let mut fields = BTreeMap::new();
    let mut violations = Vec::new();
    let mut source_key = String::new();

    for mapping in mappings {
        let required = mapping.required || mapping.key;
        let source_value = raw.fields.get(&mapping.source_field);
        let value = match source_value {
            None | Some(serde_json::Value::Null) => {
                if required {
                    violations.push(RuleViolation {
                        rule_id: "schema_violation".to_string(),
                        severity: Severity::Error,
                        field: Some(mapping.canonical_field.clone()),
                        message: format!(
                            "required source field '{}' is missing",
                            mapping.source_field
                        ),
                    });
                }
                FieldValue::Null
            }
            Some(value) => match coerce(value, mapping.field_type) {
                Ok(coerced) => coerced,
                Err(reason) => {
                    violations.push(RuleViolation {
                        rule_id: "type_coercion_failure".to_string(),
                        severity: Severity::Error,
                        field: Some(mapping.canonical_field.clone()),
                        message: format!(
                            "cannot coerce '{}' into {}: {}",
                            mapping.source_field,
                            mapping.field_type_name(),
                            reason
                        ),
                    });
                    FieldValue::Null
                }
            },
        };

        if mapping.key {
            source_key = value.render();
        }
        fields.insert(mapping.canonical_field.clone(), value);
    }

    let record = StagingRecord {
        fields,
        provenance: Provenance {
            source_id: raw.source_id.clone(),
            source_key,
            extracted_at: raw.extracted_at,
        },
        cleansing: Vec::new(),
    };

    if violations.is_empty() {
        Ok(record)
    } else {
        Err(NormalizeFailure { record, violations })
    }
}

impl FieldMapping {
    fn field_type_name(&self) -> &'static str {
        match self.field_type {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Date => "date",
            FieldType::Boolean => "boolean",
        }
    }
}

fn coerce(value: &serde_json::Value, target: FieldType) -> Result<FieldValue, String> {
    match target {
        FieldType::Text => match value {
            serde_json::Value::String(s) => Ok(FieldValue::Text(s.clone())),
            serde_json::Value::Number(n) => Ok(FieldValue::Text(n.to_string())),
            serde_json::Value::Bool(b) => Ok(FieldValue::Text(b.to_string())),
            other => Err(format!("unsupported JSON shape {other}")),
        },
        FieldType::Integer => match value {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(FieldValue::Integer(i))
                } else {
                    match n.as_f64() {
                        Some(f) if f.fract() == 0.0 => Ok(FieldValue::Integer(f as i64)),
                        _ => Err(format!("'{n}' is not an integer")),
                    }
                }
            }
            serde_json::Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| format!("'{s}' is not an integer")),
            other => Err(format!("unsupported JSON shape {other}")),
        },
        FieldType::Decimal => match value {
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(FieldValue::Decimal)
                .ok_or_else(|| format!("'{n}' is not a decimal")),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(FieldValue::Decimal)
                .map_err(|_| format!("'{s}' is not a decimal")),
            other => Err(format!("unsupported JSON shape {other}")),
        },
        FieldType::Date => match value {
            serde_json::Value::String(s) => parse_date(s.trim())
                .map(FieldValue::Date)
                .ok_or_else(|| format!("'{s}' matches no supported date format")),
            other => Err(format!("unsupported JSON shape {other}")),
        },
        FieldType::Boolean => match value {
            serde_json::Value::Bool(b) => Ok(FieldValue::Boolean(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(FieldValue::Boolean(false)),
                Some(1) => Ok(FieldValue::Boolean(true)),
                _ => Err(format!("'{n}' is not a boolean")),
            },
            serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(FieldValue::Boolean(true)),
                "false" | "no" | "0" => Ok(FieldValue::Boolean(false)),
                _ => Err(format!("'{s}' is not a boolean")),
            },
            other => Err(format!("unsupported JSON shape {other}")),
        },
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%m/%d/%Y"))
        .or_else(|_| NaiveDate::parse_from_str(s, "%m-%d-%Y"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn mapping(source: &str, canonical: &str, field_type: FieldType) -> FieldMapping {
        FieldMapping {
            source_field: source.to_string(),
            canonical_field: canonical.to_string(),
            field_type,
            required: false,
            key: false,
        }
    }

    fn raw(fields: serde_json::Value) -> RawRecord {
        RawRecord {
            source_id: "sis".to_string(),
            fields: fields.as_object().unwrap().clone(),
            extracted_at: Utc::now(),
        }
    }

    #[test]
    fn maps_and_coerces_into_canonical_shape() {
        let mappings = vec![
            FieldMapping {
                key: true,
                ..mapping("id", "student_id", FieldType::Text)
            },
            mapping("gpa", "gpa", FieldType::Decimal),
            mapping("enrolled", "enrolled_on", FieldType::Date),
            mapping("credits", "credits", FieldType::Integer),
        ];
        let record = normalize(
            &raw(serde_json::json!({
                "id": "S001",
                "gpa": "3.40",
                "enrolled": "09/01/2024",
                "credits": 12
            })),
            &mappings,
        )
        .unwrap();

        assert_eq!(record.provenance.source_key, "S001");
        assert_eq!(record.get("gpa"), &FieldValue::Decimal(3.4));
        assert_eq!(
            record.get("enrolled_on"),
            &FieldValue::Date(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap())
        );
        assert_eq!(record.get("credits"), &FieldValue::Integer(12));
    }

    #[test]
    fn missing_optional_field_is_explicit_null() {
        let mappings = vec![mapping("gpa", "gpa", FieldType::Decimal)];
        let record = normalize(&raw(serde_json::json!({})), &mappings).unwrap();
        assert!(record.fields.contains_key("gpa"));
        assert!(record.get("gpa").is_null());
    }

    #[test]
    fn missing_required_field_reports_schema_violation() {
        let mappings = vec![FieldMapping {
            required: true,
            ..mapping("major", "major", FieldType::Text)
        }];
        let failure = normalize(&raw(serde_json::json!({})), &mappings).unwrap_err();
        assert_eq!(failure.violations.len(), 1);
        assert_eq!(failure.violations[0].rule_id, "schema_violation");
        assert_eq!(failure.violations[0].severity, Severity::Error);
    }

    #[test]
    fn coercion_failure_is_reported_not_zero_filled() {
        let mappings = vec![
            mapping("gpa", "gpa", FieldType::Decimal),
            mapping("enrolled", "enrolled_on", FieldType::Date),
        ];
        let failure = normalize(
            &raw(serde_json::json!({"gpa": "three point four", "enrolled": "soon"})),
            &mappings,
        )
        .unwrap_err();

        // Both violations collected, not short-circuited
        assert_eq!(failure.violations.len(), 2);
        assert!(failure
            .violations
            .iter()
            .all(|v| v.rule_id == "type_coercion_failure"));
        // The partial record carries nulls, not fabricated zeros
        assert!(failure.record.get("gpa").is_null());
    }
}
