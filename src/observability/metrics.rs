//! Metric names and recording helpers for the pipeline.
//!
//! Every metric the system emits is named here, following Prometheus
//! naming conventions, so call sites never pass magic strings.

use std::fmt;

/// Enum of all metric names emitted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Connector metrics
    ConnectorRecordsExtracted,
    ConnectorRecordsSkipped,
    ConnectorRetries,
    ConnectorBackpressurePauses,

    // Normalize metrics
    NormalizeFailures,

    // Validation metrics
    ValidateAccepted,
    ValidateQuarantined,
    ValidateWarnings,

    // Dimension metrics
    DimensionRowsInserted,
    DimensionRowsUpdated,
    DimensionVersionsClosed,

    // Fact metrics
    FactRowsInserted,
    FactRowsUpdated,
    FactRowsUnchanged,
    FactRowsUnresolved,

    // Batch metrics
    BatchesSealed,
    JobDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            // Connector metrics
            MetricName::ConnectorRecordsExtracted => "granary_connector_records_extracted_total",
            MetricName::ConnectorRecordsSkipped => "granary_connector_records_skipped_total",
            MetricName::ConnectorRetries => "granary_connector_retries_total",
            MetricName::ConnectorBackpressurePauses => "granary_connector_backpressure_pauses_total",

            // Normalize metrics
            MetricName::NormalizeFailures => "granary_normalize_failures_total",

            // Validation metrics
            MetricName::ValidateAccepted => "granary_validate_records_accepted_total",
            MetricName::ValidateQuarantined => "granary_validate_records_quarantined_total",
            MetricName::ValidateWarnings => "granary_validate_warnings_total",

            // Dimension metrics
            MetricName::DimensionRowsInserted => "granary_dimension_rows_inserted_total",
            MetricName::DimensionRowsUpdated => "granary_dimension_rows_updated_total",
            MetricName::DimensionVersionsClosed => "granary_dimension_versions_closed_total",

            // Fact metrics
            MetricName::FactRowsInserted => "granary_fact_rows_inserted_total",
            MetricName::FactRowsUpdated => "granary_fact_rows_updated_total",
            MetricName::FactRowsUnchanged => "granary_fact_rows_unchanged_total",
            MetricName::FactRowsUnresolved => "granary_fact_rows_unresolved_total",

            // Batch metrics
            MetricName::BatchesSealed => "granary_batches_sealed_total",
            MetricName::JobDuration => "granary_job_duration_seconds",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Increment a counter metric.
pub fn increment(name: MetricName, value: u64) {
    ::metrics::counter!(name.as_str()).increment(value);
}

/// Record the wall-clock duration of a completed job run.
pub fn job_duration(seconds: f64) {
    ::metrics::histogram!(MetricName::JobDuration.as_str()).record(seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_prometheus_conventions() {
        let counters = [
            MetricName::ConnectorRecordsExtracted,
            MetricName::ValidateQuarantined,
            MetricName::FactRowsInserted,
            MetricName::BatchesSealed,
        ];
        for name in counters {
            assert!(name.as_str().starts_with("granary_"));
            assert!(name.as_str().ends_with("_total"));
        }
        assert!(MetricName::JobDuration.as_str().ends_with("_seconds"));
    }
}
