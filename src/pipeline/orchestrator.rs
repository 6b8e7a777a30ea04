use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{JobConfig, RetryConfig};
use crate::connectors::{
    connector_for, Checkpoint, ConnectorError, ExtractionSummary, SourceConnector,
};
use crate::domain::{
    BatchStatus, LoadBatch, QuarantineRecord, RuleViolation, StagingRecord, ValidationOutcome,
};
use crate::error::{EtlError, Result};
use crate::observability::metrics::{self, MetricName};
use crate::pipeline::conform::{
    ConformChange, DimensionOverlay, DimensionOverlaySet, DIMENSION_LOCKS,
};
use crate::pipeline::facts::{FactLoader, FactOutcome, UpsertKind};
use crate::pipeline::normalize::normalize;
use crate::pipeline::report::{QualityReport, QualityReporter};
use crate::pipeline::validate::Validator;
use crate::warehouse::Warehouse;

/// Cooperative cancellation flag, honored between records. The in-flight
/// record runs to completion before the batch seals as failed.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Coarse job phase, for logging and status surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Extracting,
    Transforming,
    Loading,
    Done(BatchStatus),
}

/// What a completed job hands back to the caller: the sealed audit record
/// and a reference to its quality report.
#[derive(Debug)]
pub struct JobResult {
    pub batch: LoadBatch,
    pub report: QualityReport,
}

/// Sequences one source-to-target job: extraction (with retries), the
/// normalize → validate → conform → load stages over a streaming channel,
/// and batch sealing. Owns the LoadBatch lifecycle; every other component
/// writes into a batch it does not own.
pub struct Orchestrator {
    warehouse: Arc<dyn Warehouse>,
}

impl Orchestrator {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    pub async fn run_job(
        &self,
        config: &JobConfig,
        since: Option<Checkpoint>,
        cancel: CancelFlag,
    ) -> Result<JobResult> {
        let span = info_span!("job", job = %config.job_name, source = %config.source.source_id);
        self.run_job_inner(config, since, cancel).instrument(span).await
    }

    async fn run_job_inner(
        &self,
        config: &JobConfig,
        since: Option<Checkpoint>,
        cancel: CancelFlag,
    ) -> Result<JobResult> {
        config.validate()?;
        let mut batch = LoadBatch::start(&config.job_name, &config.source.source_id);
        let batch_ts = batch.started_at;
        let mut phase = JobPhase::Pending;
        info!(batch_id = %batch.id, ?phase, "starting load batch");

        // Snapshot the dimensions in scope: targets of this job plus any the
        // fact table references
        let mut dims = DimensionOverlaySet::new();
        for dim in &config.dimensions {
            let rows = self.warehouse.dimension_rows(&dim.name).await?;
            dims.insert(DimensionOverlay::new(dim.clone(), rows));
        }
        if let Some(fact) = &config.fact {
            for dim_ref in &fact.dimension_refs {
                if !config.dimensions.iter().any(|d| d.name == dim_ref.dimension) {
                    let rows = self.warehouse.dimension_rows(&dim_ref.dimension).await?;
                    dims.insert(DimensionOverlay::read_only(&dim_ref.dimension, rows));
                }
            }
        }

        let mut validator =
            Validator::new(config.cleansing.clone(), &config.rules, &config.dimensions)?;
        let mut fact_loader = match &config.fact {
            Some(fact) => {
                let snapshot = self.warehouse.fact_rows(&fact.table).await?;
                Some(FactLoader::new(fact.clone(), snapshot))
            }
            None => None,
        };

        phase = JobPhase::Extracting;
        debug!(?phase, "phase transition");
        let (tx, mut rx) = mpsc::channel(config.channel_capacity);
        let producer = spawn_extraction(
            connector_for(&config.source),
            config.retry.clone(),
            Duration::from_secs(config.source.timeout_seconds),
            since,
            tx,
        );

        let mut quarantine: Vec<QuarantineRecord> = Vec::new();
        let mut annotations: Vec<RuleViolation> = Vec::new();
        let mut received: u64 = 0;
        let mut cancelled = false;

        'records: loop {
            // Checked before the receive so an already-received record always
            // runs to completion before cancellation is honored
            if cancel.is_cancelled() {
                cancelled = true;
                // Dropping the receiver stops the producer at its next send
                break;
            }
            let Some(raw) = rx.recv().await else {
                break;
            };
            received += 1;
            if phase == JobPhase::Extracting {
                phase = JobPhase::Transforming;
                debug!(?phase, "phase transition");
            }

            let mut record = match normalize(&raw, &config.source.field_map) {
                Ok(record) => record,
                Err(failure) => {
                    metrics::increment(MetricName::NormalizeFailures, 1);
                    push_quarantine(
                        &mut quarantine,
                        &mut batch,
                        failure.record,
                        failure.violations,
                    );
                    continue;
                }
            };

            match validator.validate(&mut record, &dims) {
                ValidationOutcome::Quarantined { violations } => {
                    metrics::increment(MetricName::ValidateQuarantined, 1);
                    push_quarantine(&mut quarantine, &mut batch, record, violations);
                    continue;
                }
                ValidationOutcome::Accepted { warnings } => {
                    if !warnings.is_empty() {
                        metrics::increment(
                            MetricName::ValidateWarnings,
                            warnings.len() as u64,
                        );
                        annotations.extend(warnings);
                    }
                }
            }

            for dim in &config.dimensions {
                // Advisory lock: serializes conformance writes for this
                // dimension across concurrently running jobs
                let _guard = DIMENSION_LOCKS.handle(&dim.name).lock_owned().await;
                let overlay = dims
                    .get_mut(&dim.name)
                    .ok_or_else(|| EtlError::Warehouse(format!("missing overlay '{}'", dim.name)))?;
                match overlay.conform(&record, batch_ts) {
                    Ok(outcome) => match outcome.change {
                        ConformChange::Inserted => {
                            batch.counts.dims_inserted += 1;
                            metrics::increment(MetricName::DimensionRowsInserted, 1);
                        }
                        ConformChange::Overwritten => {
                            batch.counts.dims_updated += 1;
                            metrics::increment(MetricName::DimensionRowsUpdated, 1);
                        }
                        ConformChange::Versioned { .. } => {
                            batch.counts.dims_updated += 1;
                            metrics::increment(MetricName::DimensionVersionsClosed, 1);
                        }
                        ConformChange::Unchanged | ConformChange::Superseded => {}
                    },
                    Err(e) => {
                        // Defensively routed to quarantine; the validator
                        // normally rejects these upstream
                        warn!(error = %e, "conformance rejected record");
                        push_quarantine(
                            &mut quarantine,
                            &mut batch,
                            record.clone(),
                            vec![RuleViolation {
                                rule_id: "referential_violation".to_string(),
                                severity: crate::domain::Severity::Error,
                                field: Some(dim.natural_key_field.clone()),
                                message: e.to_string(),
                            }],
                        );
                        continue 'records;
                    }
                }
            }

            if let Some(loader) = fact_loader.as_mut() {
                match loader.load(&record, &mut dims, batch.id, batch_ts)? {
                    FactOutcome::Upserted(kind) => {
                        match kind {
                            UpsertKind::Inserted => {
                                metrics::increment(MetricName::FactRowsInserted, 1);
                            }
                            UpsertKind::Updated => {
                                metrics::increment(MetricName::FactRowsUpdated, 1);
                            }
                            UpsertKind::Unchanged => {
                                metrics::increment(MetricName::FactRowsUnchanged, 1);
                            }
                        }
                        batch.counts.accepted += 1;
                        metrics::increment(MetricName::ValidateAccepted, 1);
                    }
                    FactOutcome::Unresolved(violations) => {
                        metrics::increment(MetricName::FactRowsUnresolved, 1);
                        push_quarantine(&mut quarantine, &mut batch, record, violations);
                    }
                }
            } else {
                batch.counts.accepted += 1;
                metrics::increment(MetricName::ValidateAccepted, 1);
            }
        }
        drop(rx);

        let extraction: std::result::Result<ExtractionSummary, ConnectorError> = match producer
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "extraction task panicked");
                Err(ConnectorError::Connection(format!("extraction task failed: {e}")))
            }
        };

        phase = JobPhase::Loading;
        debug!(?phase, "phase transition");

        if let Some(loader) = fact_loader.as_ref() {
            // Batch counters reflect net warehouse effects: a row inserted
            // and revised within one batch is a single insert
            let fact_counts = loader.pending_counts();
            batch.counts.facts_inserted = fact_counts.inserted;
            batch.counts.facts_updated = fact_counts.updated;
            batch.counts.facts_unchanged = fact_counts.unchanged;
        }

        let (status, reason) = match (&extraction, cancelled) {
            (_, true) => (
                BatchStatus::Failed,
                Some("cancelled by operator".to_string()),
            ),
            (Err(e), false) => (BatchStatus::Failed, Some(e.to_string())),
            (Ok(_), false) if batch.counts.quarantined > 0 => (BatchStatus::Partial, None),
            (Ok(_), false) => (BatchStatus::Succeeded, None),
        };

        batch.counts.connector_skipped = extraction.as_ref().map(|s| s.skipped).unwrap_or(0);
        // Every record is accounted for: accepted + quarantined + skipped
        batch.counts.extracted = received + batch.counts.connector_skipped;

        if status != BatchStatus::Failed {
            // Publish this batch's writes; until here no reader has observed
            // partially-updated dimensions or facts
            for (dimension, deltas) in dims.take_all_deltas() {
                self.warehouse
                    .apply_dimension_deltas(&dimension, deltas)
                    .await?;
            }
            if let Some(loader) = fact_loader.as_mut() {
                let changes = loader.take_changes();
                if !changes.is_empty() {
                    let table = loader.table().to_string();
                    self.warehouse.upsert_facts(&table, changes).await?;
                }
            }
        } else {
            // Failed batches leave dimension and fact state untouched
            batch.counts.dims_inserted = 0;
            batch.counts.dims_updated = 0;
            batch.counts.facts_inserted = 0;
            batch.counts.facts_updated = 0;
        }

        if !quarantine.is_empty() {
            self.warehouse.append_quarantine(quarantine).await?;
        }
        if !annotations.is_empty() {
            self.warehouse
                .append_annotations(batch.id, annotations)
                .await?;
        }

        batch.seal(status, reason);
        self.warehouse.put_batch(&batch).await?;
        phase = JobPhase::Done(status);
        metrics::increment(MetricName::BatchesSealed, 1);
        metrics::job_duration(
            (Utc::now() - batch.started_at).num_milliseconds() as f64 / 1000.0,
        );
        info!(
            batch_id = %batch.id,
            status = %status,
            extracted = batch.counts.extracted,
            accepted = batch.counts.accepted,
            quarantined = batch.counts.quarantined,
            skipped = batch.counts.connector_skipped,
            ?phase,
            "load batch sealed"
        );

        let report = QualityReporter::default()
            .summarize(self.warehouse.as_ref(), batch.id)
            .await?;
        Ok(JobResult { batch, report })
    }
}

fn push_quarantine(
    quarantine: &mut Vec<QuarantineRecord>,
    batch: &mut LoadBatch,
    record: StagingRecord,
    violations: Vec<RuleViolation>,
) {
    batch.counts.quarantined += 1;
    quarantine.push(QuarantineRecord {
        batch_id: batch.id,
        record,
        violations,
        quarantined_at: Utc::now(),
    });
}

/// Run extraction in its own task with a per-call timeout and bounded
/// exponential backoff on retryable failures. Exhausting the attempt budget
/// is fatal for the job, not for the warehouse.
fn spawn_extraction(
    connector: Box<dyn SourceConnector>,
    retry: RetryConfig,
    call_timeout: Duration,
    since: Option<Checkpoint>,
    tx: mpsc::Sender<crate::domain::RawRecord>,
) -> tokio::task::JoinHandle<std::result::Result<ExtractionSummary, ConnectorError>> {
    tokio::spawn(async move {
        let source_id = connector.source_id().to_string();
        let mut attempt = 0u32;
        loop {
            let call = tokio::time::timeout(call_timeout, connector.extract(since.as_ref(), tx.clone()));
            let outcome = match call.await {
                Ok(outcome) => outcome,
                // A hung source counts as a retryable connection failure
                Err(_) => Err(ConnectorError::Connection(format!(
                    "extraction timed out after {:.1}s",
                    call_timeout.as_secs_f64()
                ))),
            };
            match outcome {
                Ok(summary) => {
                    metrics::increment(
                        MetricName::ConnectorRecordsExtracted,
                        summary.extracted,
                    );
                    metrics::increment(MetricName::ConnectorRecordsSkipped, summary.skipped);
                    return Ok(summary);
                }
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.base_delay_ms.saturating_mul(1 << attempt.min(16));
                    warn!(
                        source = %source_id,
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "retryable connector failure, backing off"
                    );
                    metrics::increment(MetricName::ConnectorRetries, 1);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    error!(source = %source_id, error = %e, "connector failed");
                    return Err(e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawRecord;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures_before_success` calls, then emits one record.
    struct ScriptedConnector {
        calls: Arc<AtomicU32>,
        failures_before_success: u32,
        fatal: bool,
    }

    #[async_trait]
    impl SourceConnector for ScriptedConnector {
        fn source_id(&self) -> &str {
            "scripted"
        }

        async fn extract(
            &self,
            _since: Option<&Checkpoint>,
            tx: mpsc::Sender<RawRecord>,
        ) -> std::result::Result<ExtractionSummary, ConnectorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures_before_success {
                return if self.fatal {
                    Err(ConnectorError::Auth("credentials rejected".to_string()))
                } else {
                    Err(ConnectorError::Connection("socket reset".to_string()))
                };
            }
            let record = RawRecord {
                source_id: "scripted".to_string(),
                fields: serde_json::Map::new(),
                extracted_at: Utc::now(),
            };
            let _ = tx.send(record).await;
            Ok(ExtractionSummary {
                extracted: 1,
                skipped: 0,
            })
        }
    }

    /// Never completes a call; only the per-call timeout can end it.
    struct HangingConnector;

    #[async_trait]
    impl SourceConnector for HangingConnector {
        fn source_id(&self) -> &str {
            "hung"
        }

        async fn extract(
            &self,
            _since: Option<&Checkpoint>,
            _tx: mpsc::Sender<RawRecord>,
        ) -> std::result::Result<ExtractionSummary, ConnectorError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ExtractionSummary::default())
        }
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn retryable_failures_back_off_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = Box::new(ScriptedConnector {
            calls: calls.clone(),
            failures_before_success: 2,
            fatal: false,
        });
        let (tx, mut rx) = mpsc::channel(4);
        let handle =
            spawn_extraction(connector, retry(3), Duration::from_secs(5), None, tx);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.extracted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn exhausted_attempts_are_fatal() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = Box::new(ScriptedConnector {
            calls: calls.clone(),
            failures_before_success: u32::MAX,
            fatal: false,
        });
        let (tx, _rx) = mpsc::channel(4);
        let handle =
            spawn_extraction(connector, retry(2), Duration::from_secs(5), None, tx);

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_failures_never_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = Box::new(ScriptedConnector {
            calls: calls.clone(),
            failures_before_success: u32::MAX,
            fatal: true,
        });
        let (tx, _rx) = mpsc::channel(4);
        let handle =
            spawn_extraction(connector, retry(5), Duration::from_secs(5), None, tx);

        let err = handle.await.unwrap().unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_connector_times_out_as_retryable() {
        let (tx, _rx) = mpsc::channel(4);
        let handle = spawn_extraction(
            Box::new(HangingConnector),
            retry(1),
            Duration::from_millis(20),
            None,
            tx,
        );

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }
}
