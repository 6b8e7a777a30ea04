use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{QuarantineRecord, Severity};
use crate::error::{EtlError, Result};
use crate::warehouse::Warehouse;

/// Aggregated rule outcomes for one batch, queryable by operators.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub batch_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub status: crate::domain::BatchStatus,
    pub rule_counts: Vec<RuleCount>,
    pub accepted: u64,
    pub quarantined: u64,
    pub connector_skipped: u64,
    /// Bounded sample of quarantined records for inspection
    pub sample: Vec<QuarantineRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleCount {
    pub rule_id: String,
    pub severity: Severity,
    pub count: u64,
}

/// Read-only aggregator over quarantine and annotation data; never mutates
/// warehouse tables.
pub struct QualityReporter {
    sample_limit: usize,
}

impl Default for QualityReporter {
    fn default() -> Self {
        Self { sample_limit: 10 }
    }
}

impl QualityReporter {
    pub fn with_sample_limit(sample_limit: usize) -> Self {
        Self { sample_limit }
    }

    pub async fn summarize(
        &self,
        warehouse: &dyn Warehouse,
        batch_id: Uuid,
    ) -> Result<QualityReport> {
        let batch = warehouse
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| EtlError::Warehouse(format!("unknown batch {batch_id}")))?;
        let quarantined = warehouse.quarantine_for_batch(batch_id).await?;
        let annotations = warehouse.annotations_for_batch(batch_id).await?;

        let mut counts: BTreeMap<(String, Severity), u64> = BTreeMap::new();
        for record in &quarantined {
            for violation in &record.violations {
                *counts
                    .entry((violation.rule_id.clone(), violation.severity))
                    .or_default() += 1;
            }
        }
        for annotation in &annotations {
            *counts
                .entry((annotation.rule_id.clone(), annotation.severity))
                .or_default() += 1;
        }

        let sample = quarantined.into_iter().take(self.sample_limit).collect();

        Ok(QualityReport {
            batch_id,
            generated_at: Utc::now(),
            status: batch.status,
            rule_counts: counts
                .into_iter()
                .map(|((rule_id, severity), count)| RuleCount {
                    rule_id,
                    severity,
                    count,
                })
                .collect(),
            accepted: batch.counts.accepted,
            quarantined: batch.counts.quarantined,
            connector_skipped: batch.counts.connector_skipped,
            sample,
        })
    }
}
