pub mod in_memory;
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{
    DimensionRecord, FactRecord, LoadBatch, QuarantineRecord, RuleViolation,
};
use crate::error::Result;

/// A published change to a dimension table, applied at batch commit.
#[derive(Debug, Clone)]
pub enum DimensionDelta {
    Insert(DimensionRecord),
    /// Replace the row carrying this surrogate key (attribute overwrite or
    /// interval close); surrogate keys are immutable once issued
    Update(DimensionRecord),
}

/// The analytical store: dimension tables, fact tables, the load-batch audit
/// trail, and the quarantine area.
///
/// Dimension and fact writes happen only through the batch-commit methods;
/// the read methods double as the consumption interface for downstream
/// collaborators (dashboards, models), which treat the warehouse as
/// read-only.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Every row of a dimension, current and historical.
    async fn dimension_rows(&self, dimension: &str) -> Result<Vec<DimensionRecord>>;

    /// Only the rows with the current flag set, one per natural key.
    async fn current_dimension(&self, dimension: &str) -> Result<Vec<DimensionRecord>>;

    async fn apply_dimension_deltas(
        &self,
        dimension: &str,
        deltas: Vec<DimensionDelta>,
    ) -> Result<()>;

    async fn fact_rows(&self, table: &str) -> Result<Vec<FactRecord>>;

    /// Insert-or-update, atomic per business key.
    async fn upsert_facts(&self, table: &str, facts: Vec<FactRecord>) -> Result<()>;

    async fn put_batch(&self, batch: &LoadBatch) -> Result<()>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<LoadBatch>>;

    async fn list_batches(&self) -> Result<Vec<LoadBatch>>;

    async fn append_quarantine(&self, records: Vec<QuarantineRecord>) -> Result<()>;

    async fn quarantine_for_batch(&self, id: Uuid) -> Result<Vec<QuarantineRecord>>;

    /// Warning annotations retained for records that passed with warnings.
    async fn append_annotations(&self, id: Uuid, annotations: Vec<RuleViolation>) -> Result<()>;

    async fn annotations_for_batch(&self, id: Uuid) -> Result<Vec<RuleViolation>>;
}
