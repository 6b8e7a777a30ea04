use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{DimensionDelta, Warehouse};
use crate::domain::{
    DimensionRecord, FactRecord, LoadBatch, QuarantineRecord, RuleViolation,
};
use crate::error::{EtlError, Result};

/// In-memory warehouse implementation for development/testing.
pub struct InMemoryWarehouse {
    dimensions: Arc<Mutex<HashMap<String, Vec<DimensionRecord>>>>,
    facts: Arc<Mutex<HashMap<String, HashMap<String, FactRecord>>>>,
    batches: Arc<Mutex<HashMap<Uuid, LoadBatch>>>,
    quarantine: Arc<Mutex<Vec<QuarantineRecord>>>,
    annotations: Arc<Mutex<HashMap<Uuid, Vec<RuleViolation>>>>,
}

impl Default for InMemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self {
            dimensions: Arc::new(Mutex::new(HashMap::new())),
            facts: Arc::new(Mutex::new(HashMap::new())),
            batches: Arc::new(Mutex::new(HashMap::new())),
            quarantine: Arc::new(Mutex::new(Vec::new())),
            annotations: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn dimension_rows(&self, dimension: &str) -> Result<Vec<DimensionRecord>> {
        let dimensions = self.dimensions.lock().unwrap();
        Ok(dimensions.get(dimension).cloned().unwrap_or_default())
    }

    async fn current_dimension(&self, dimension: &str) -> Result<Vec<DimensionRecord>> {
        let dimensions = self.dimensions.lock().unwrap();
        let mut rows: Vec<DimensionRecord> = dimensions
            .get(dimension)
            .map(|rows| rows.iter().filter(|r| r.is_current).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        Ok(rows)
    }

    async fn apply_dimension_deltas(
        &self,
        dimension: &str,
        deltas: Vec<DimensionDelta>,
    ) -> Result<()> {
        let mut dimensions = self.dimensions.lock().unwrap();
        let rows = dimensions.entry(dimension.to_string()).or_default();
        for delta in deltas {
            match delta {
                DimensionDelta::Insert(row) => {
                    debug!(dimension, surrogate_key = row.surrogate_key, "dimension row inserted");
                    rows.push(row);
                }
                DimensionDelta::Update(row) => {
                    let existing = rows
                        .iter_mut()
                        .find(|r| r.surrogate_key == row.surrogate_key)
                        .ok_or_else(|| {
                            EtlError::Warehouse(format!(
                                "update for unknown surrogate key {} in '{}'",
                                row.surrogate_key, dimension
                            ))
                        })?;
                    debug!(dimension, surrogate_key = row.surrogate_key, "dimension row updated");
                    *existing = row;
                }
            }
        }
        Ok(())
    }

    async fn fact_rows(&self, table: &str) -> Result<Vec<FactRecord>> {
        let facts = self.facts.lock().unwrap();
        let mut rows: Vec<FactRecord> = facts
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.business_key.cmp(&b.business_key));
        Ok(rows)
    }

    async fn upsert_facts(&self, table: &str, new_facts: Vec<FactRecord>) -> Result<()> {
        let mut facts = self.facts.lock().unwrap();
        let rows = facts.entry(table.to_string()).or_default();
        for fact in new_facts {
            debug!(table, business_key = %fact.business_key, "fact row upserted");
            rows.insert(fact.business_key.clone(), fact);
        }
        Ok(())
    }

    async fn put_batch(&self, batch: &LoadBatch) -> Result<()> {
        let mut batches = self.batches.lock().unwrap();
        batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<LoadBatch>> {
        let batches = self.batches.lock().unwrap();
        Ok(batches.get(&id).cloned())
    }

    async fn list_batches(&self) -> Result<Vec<LoadBatch>> {
        let batches = self.batches.lock().unwrap();
        let mut all: Vec<LoadBatch> = batches.values().cloned().collect();
        all.sort_by_key(|b| b.started_at);
        Ok(all)
    }

    async fn append_quarantine(&self, records: Vec<QuarantineRecord>) -> Result<()> {
        let mut quarantine = self.quarantine.lock().unwrap();
        quarantine.extend(records);
        Ok(())
    }

    async fn quarantine_for_batch(&self, id: Uuid) -> Result<Vec<QuarantineRecord>> {
        let quarantine = self.quarantine.lock().unwrap();
        Ok(quarantine
            .iter()
            .filter(|r| r.batch_id == id)
            .cloned()
            .collect())
    }

    async fn append_annotations(&self, id: Uuid, annotations: Vec<RuleViolation>) -> Result<()> {
        let mut all = self.annotations.lock().unwrap();
        all.entry(id).or_default().extend(annotations);
        Ok(())
    }

    async fn annotations_for_batch(&self, id: Uuid) -> Result<Vec<RuleViolation>> {
        let annotations = self.annotations.lock().unwrap();
        Ok(annotations.get(&id).cloned().unwrap_or_default())
    }
}
