use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::config::{FactConfig, UnresolvedPolicy};
use crate::domain::{FactRecord, FieldValue, RuleViolation, Severity, StagingRecord};
use crate::error::Result;
use crate::pipeline::conform::DimensionOverlaySet;

/// Warehouse-level effect of loading one fact record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Inserted,
    Updated,
    /// Same business key, same dimension keys and measures: a replay with no
    /// observable change
    Unchanged,
}

#[derive(Debug)]
pub enum FactOutcome {
    Upserted(UpsertKind),
    /// A dimension reference failed to resolve under the quarantine policy;
    /// the record produces no fact row
    Unresolved(Vec<RuleViolation>),
}

struct PendingFact {
    record: FactRecord,
    kind: UpsertKind,
}

/// Net effect of the batch's pending fact rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactCounts {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

/// Fact loader for one batch.
///
/// Resolves dimension references to surrogate keys (it never creates
/// dimension rows), deduplicates by business key, and holds pending upserts
/// until batch commit. Idempotence comes from a content fingerprint over the
/// dimension keys and measures.
pub struct FactLoader {
    config: FactConfig,
    existing: HashMap<String, FactRecord>,
    pending: BTreeMap<String, PendingFact>,
}

impl FactLoader {
    pub fn new(config: FactConfig, snapshot: Vec<FactRecord>) -> Self {
        Self {
            config,
            existing: snapshot
                .into_iter()
                .map(|fact| (fact.business_key.clone(), fact))
                .collect(),
            pending: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.config.table
    }

    pub fn load(
        &mut self,
        record: &StagingRecord,
        dims: &mut DimensionOverlaySet,
        batch_id: Uuid,
        batch_ts: DateTime<Utc>,
    ) -> Result<FactOutcome> {
        let mut violations = Vec::new();

        let mut key_parts = Vec::with_capacity(self.config.business_key_fields.len());
        for field in &self.config.business_key_fields {
            let rendered = record.get(field).render();
            if rendered.is_empty() {
                violations.push(RuleViolation {
                    rule_id: "missing_business_key".to_string(),
                    severity: Severity::Error,
                    field: Some(field.clone()),
                    message: format!("business key field '{field}' is empty"),
                });
            }
            key_parts.push(rendered);
        }
        let business_key = key_parts.join("|");

        let event_time = self
            .config
            .event_time_field
            .as_ref()
            .and_then(|field| event_time_of(record.get(field)));

        let mut dimension_keys = BTreeMap::new();
        for dim_ref in &self.config.dimension_refs {
            let natural_key = record.get(&dim_ref.field).render();
            let as_of = if dim_ref.as_of { event_time } else { None };
            let resolved = if natural_key.is_empty() {
                None
            } else {
                dims.resolve(&dim_ref.dimension, &natural_key, as_of)
            };
            match resolved {
                Some(surrogate) => {
                    dimension_keys.insert(dim_ref.role.clone(), surrogate);
                }
                None => match self.config.unresolved_policy {
                    UnresolvedPolicy::Quarantine => {
                        violations.push(RuleViolation {
                            rule_id: "unresolved_dimension".to_string(),
                            severity: Severity::Error,
                            field: Some(dim_ref.field.clone()),
                            message: format!(
                                "'{}' does not resolve in dimension '{}'",
                                natural_key, dim_ref.dimension
                            ),
                        });
                    }
                    UnresolvedPolicy::UnknownMember => {
                        let surrogate = dims
                            .unknown_member(&dim_ref.dimension, batch_ts)
                            .unwrap_or(crate::domain::UNKNOWN_MEMBER_KEY);
                        debug!(
                            dimension = %dim_ref.dimension,
                            natural_key = %natural_key,
                            "linking fact to unknown member"
                        );
                        dimension_keys.insert(dim_ref.role.clone(), surrogate);
                    }
                },
            }
        }

        if !violations.is_empty() {
            return Ok(FactOutcome::Unresolved(violations));
        }

        let measures: BTreeMap<String, FieldValue> = self
            .config
            .measures
            .iter()
            .map(|field| (field.clone(), record.get(field).clone()))
            .collect();
        let measure_hash = fingerprint(&dimension_keys, &measures)?;

        let prior_hash = self
            .pending
            .get(&business_key)
            .map(|p| p.record.measure_hash.clone())
            .or_else(|| {
                self.existing
                    .get(&business_key)
                    .map(|f| f.measure_hash.clone())
            });
        let known_to_warehouse = self.existing.contains_key(&business_key);

        let kind = match prior_hash {
            None => UpsertKind::Inserted,
            Some(hash) if hash == measure_hash => UpsertKind::Unchanged,
            Some(_) => UpsertKind::Updated,
        };

        match kind {
            UpsertKind::Unchanged => {
                // Replay: keep whatever is already pending or stored
                if !self.pending.contains_key(&business_key) {
                    if let Some(existing) = self.existing.get(&business_key) {
                        self.pending.insert(
                            business_key,
                            PendingFact {
                                record: existing.clone(),
                                kind: UpsertKind::Unchanged,
                            },
                        );
                    }
                }
            }
            _ => {
                let record = FactRecord {
                    business_key: business_key.clone(),
                    dimension_keys,
                    measures,
                    measure_hash,
                    event_time,
                    batch_id,
                };
                // A row first inserted in this batch stays an insert even if
                // a later record in the batch revises it
                let final_kind = match self.pending.get(&business_key) {
                    Some(p) if p.kind == UpsertKind::Inserted && !known_to_warehouse => {
                        UpsertKind::Inserted
                    }
                    _ => kind,
                };
                self.pending.insert(
                    business_key,
                    PendingFact {
                        record,
                        kind: final_kind,
                    },
                );
            }
        }

        Ok(FactOutcome::Upserted(kind))
    }

    /// Counts per business key, not per record: a row inserted and then
    /// revised within the same batch nets to a single insert.
    pub fn pending_counts(&self) -> FactCounts {
        let mut counts = FactCounts::default();
        for pending in self.pending.values() {
            match pending.kind {
                UpsertKind::Inserted => counts.inserted += 1,
                UpsertKind::Updated => counts.updated += 1,
                UpsertKind::Unchanged => counts.unchanged += 1,
            }
        }
        counts
    }

    /// Pending rows that actually change the warehouse, for batch commit.
    pub fn take_changes(&mut self) -> Vec<FactRecord> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_values()
            .filter(|p| p.kind != UpsertKind::Unchanged)
            .map(|p| p.record)
            .collect()
    }
}

fn event_time_of(value: &FieldValue) -> Option<DateTime<Utc>> {
    value
        .as_date()
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
}

fn fingerprint(
    dimension_keys: &BTreeMap<String, i64>,
    measures: &BTreeMap<String, FieldValue>,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(dimension_keys)?);
    hasher.update(serde_json::to_vec(measures)?);
    Ok(hex::encode(hasher.finalize()))
}
