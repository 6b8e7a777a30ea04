use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

use super::{DimensionDelta, Warehouse};
use crate::domain::{
    BatchCounts, BatchStatus, DimensionRecord, FactRecord, LoadBatch, QuarantineRecord,
    RuleViolation,
};
use crate::error::{EtlError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dim_record (
    dimension       TEXT NOT NULL,
    surrogate_key   INTEGER NOT NULL,
    natural_key     TEXT NOT NULL,
    attributes      TEXT NOT NULL,
    effective_from  TEXT NOT NULL,
    effective_to    TEXT,
    is_current      INTEGER NOT NULL,
    PRIMARY KEY (dimension, surrogate_key)
);
CREATE INDEX IF NOT EXISTS idx_dim_natural
    ON dim_record (dimension, natural_key);

CREATE TABLE IF NOT EXISTS fact_record (
    fact_table      TEXT NOT NULL,
    business_key    TEXT NOT NULL,
    dimension_keys  TEXT NOT NULL,
    measures        TEXT NOT NULL,
    measure_hash    TEXT NOT NULL,
    event_time      TEXT,
    batch_id        TEXT NOT NULL,
    PRIMARY KEY (fact_table, business_key)
);

CREATE TABLE IF NOT EXISTS load_batch (
    id              TEXT PRIMARY KEY,
    job_name        TEXT NOT NULL,
    source_id       TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    completed_at    TEXT,
    status          TEXT NOT NULL,
    counts          TEXT NOT NULL,
    failure_reason  TEXT
);

CREATE TABLE IF NOT EXISTS quarantine_record (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id        TEXT NOT NULL,
    record          TEXT NOT NULL,
    violations      TEXT NOT NULL,
    quarantined_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_quarantine_batch
    ON quarantine_record (batch_id);

CREATE TABLE IF NOT EXISTS batch_annotation (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id        TEXT NOT NULL,
    violation       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_annotation_batch
    ON batch_annotation (batch_id);
"#;

/// SQLite-backed warehouse. Structured columns (attributes, measures,
/// violations) are stored as JSON text so the schema stays stable as job
/// configurations evolve.
pub struct SqliteWarehouse {
    conn: Mutex<Connection>,
}

impl SqliteWarehouse {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "opened sqlite warehouse");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EtlError::Warehouse(format!("bad timestamp '{raw}': {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| EtlError::Warehouse(format!("bad batch id '{raw}': {e}")))
}

fn dimension_from_row(row: &Row<'_>) -> Result<DimensionRecord> {
    let surrogate_key: i64 = row.get(0)?;
    let natural_key: String = row.get(1)?;
    let attributes: String = row.get(2)?;
    let effective_from: String = row.get(3)?;
    let effective_to: Option<String> = row.get(4)?;
    let is_current: bool = row.get(5)?;
    Ok(DimensionRecord {
        surrogate_key,
        natural_key,
        attributes: serde_json::from_str(&attributes)?,
        effective_from: parse_ts(&effective_from)?,
        effective_to: effective_to.as_deref().map(parse_ts).transpose()?,
        is_current,
    })
}

fn write_dimension_row(conn: &Connection, dimension: &str, row: &DimensionRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO dim_record
            (dimension, surrogate_key, natural_key, attributes,
             effective_from, effective_to, is_current)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (dimension, surrogate_key) DO UPDATE SET
            natural_key = excluded.natural_key,
            attributes = excluded.attributes,
            effective_from = excluded.effective_from,
            effective_to = excluded.effective_to,
            is_current = excluded.is_current",
        params![
            dimension,
            row.surrogate_key,
            row.natural_key,
            serde_json::to_string(&row.attributes)?,
            row.effective_from.to_rfc3339(),
            row.effective_to.map(|t| t.to_rfc3339()),
            row.is_current,
        ],
    )?;
    Ok(())
}

fn read_dimension_rows(conn: &Connection, sql: &str, dimension: &str) -> Result<Vec<DimensionRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![dimension])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(dimension_from_row(row)?);
    }
    Ok(out)
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn dimension_rows(&self, dimension: &str) -> Result<Vec<DimensionRecord>> {
        let conn = self.lock();
        read_dimension_rows(
            &conn,
            "SELECT surrogate_key, natural_key, attributes,
                    effective_from, effective_to, is_current
             FROM dim_record WHERE dimension = ?1
             ORDER BY surrogate_key",
            dimension,
        )
    }

    async fn current_dimension(&self, dimension: &str) -> Result<Vec<DimensionRecord>> {
        let conn = self.lock();
        read_dimension_rows(
            &conn,
            "SELECT surrogate_key, natural_key, attributes,
                    effective_from, effective_to, is_current
             FROM dim_record WHERE dimension = ?1 AND is_current = 1
             ORDER BY natural_key",
            dimension,
        )
    }

    async fn apply_dimension_deltas(
        &self,
        dimension: &str,
        deltas: Vec<DimensionDelta>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for delta in deltas {
            match delta {
                DimensionDelta::Insert(row) | DimensionDelta::Update(row) => {
                    write_dimension_row(&tx, dimension, &row)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn fact_rows(&self, table: &str) -> Result<Vec<FactRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT business_key, dimension_keys, measures, measure_hash,
                    event_time, batch_id
             FROM fact_record WHERE fact_table = ?1
             ORDER BY business_key",
        )?;
        let mut rows = stmt.query(params![table])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let business_key: String = row.get(0)?;
            let dimension_keys: String = row.get(1)?;
            let measures: String = row.get(2)?;
            let measure_hash: String = row.get(3)?;
            let event_time: Option<String> = row.get(4)?;
            let batch_id: String = row.get(5)?;
            out.push(FactRecord {
                business_key,
                dimension_keys: serde_json::from_str(&dimension_keys)?,
                measures: serde_json::from_str(&measures)?,
                measure_hash,
                event_time: event_time.as_deref().map(parse_ts).transpose()?,
                batch_id: parse_uuid(&batch_id)?,
            });
        }
        Ok(out)
    }

    async fn upsert_facts(&self, table: &str, facts: Vec<FactRecord>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for fact in facts {
            tx.execute(
                "INSERT INTO fact_record
                    (fact_table, business_key, dimension_keys, measures,
                     measure_hash, event_time, batch_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (fact_table, business_key) DO UPDATE SET
                    dimension_keys = excluded.dimension_keys,
                    measures = excluded.measures,
                    measure_hash = excluded.measure_hash,
                    event_time = excluded.event_time,
                    batch_id = excluded.batch_id",
                params![
                    table,
                    fact.business_key,
                    serde_json::to_string(&fact.dimension_keys)?,
                    serde_json::to_string(&fact.measures)?,
                    fact.measure_hash,
                    fact.event_time.map(|t| t.to_rfc3339()),
                    fact.batch_id.to_string(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn put_batch(&self, batch: &LoadBatch) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO load_batch
                (id, job_name, source_id, started_at, completed_at,
                 status, counts, failure_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (id) DO UPDATE SET
                completed_at = excluded.completed_at,
                status = excluded.status,
                counts = excluded.counts,
                failure_reason = excluded.failure_reason",
            params![
                batch.id.to_string(),
                batch.job_name,
                batch.source_id,
                batch.started_at.to_rfc3339(),
                batch.completed_at.map(|t| t.to_rfc3339()),
                batch.status.as_str(),
                serde_json::to_string(&batch.counts)?,
                batch.failure_reason,
            ],
        )?;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<LoadBatch>> {
        let conn = self.lock();
        let row: Option<(String, String, String, Option<String>, String, String, Option<String>)> =
            conn.query_row(
                "SELECT job_name, source_id, started_at, completed_at,
                        status, counts, failure_reason
                 FROM load_batch WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((job_name, source_id, started_at, completed_at, status, counts, failure_reason)) =
            row
        else {
            return Ok(None);
        };
        let counts: BatchCounts = serde_json::from_str(&counts)?;
        Ok(Some(LoadBatch {
            id,
            job_name,
            source_id,
            started_at: parse_ts(&started_at)?,
            completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
            status: BatchStatus::parse(&status)
                .ok_or_else(|| EtlError::Warehouse(format!("bad batch status '{status}'")))?,
            counts,
            failure_reason,
        }))
    }

    async fn list_batches(&self) -> Result<Vec<LoadBatch>> {
        let ids: Vec<Uuid> = {
            let conn = self.lock();
            let mut stmt =
                conn.prepare("SELECT id FROM load_batch ORDER BY started_at, id")?;
            let mut rows = stmt.query([])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                ids.push(parse_uuid(&id)?);
            }
            ids
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(batch) = self.get_batch(id).await? {
                out.push(batch);
            }
        }
        Ok(out)
    }

    async fn append_quarantine(&self, records: Vec<QuarantineRecord>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for record in records {
            tx.execute(
                "INSERT INTO quarantine_record
                    (batch_id, record, violations, quarantined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.batch_id.to_string(),
                    serde_json::to_string(&record.record)?,
                    serde_json::to_string(&record.violations)?,
                    record.quarantined_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn quarantine_for_batch(&self, id: Uuid) -> Result<Vec<QuarantineRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT record, violations, quarantined_at
             FROM quarantine_record WHERE batch_id = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let record: String = row.get(0)?;
            let violations: String = row.get(1)?;
            let quarantined_at: String = row.get(2)?;
            out.push(QuarantineRecord {
                batch_id: id,
                record: serde_json::from_str(&record)?,
                violations: serde_json::from_str(&violations)?,
                quarantined_at: parse_ts(&quarantined_at)?,
            });
        }
        Ok(out)
    }

    async fn append_annotations(&self, id: Uuid, annotations: Vec<RuleViolation>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for annotation in annotations {
            tx.execute(
                "INSERT INTO batch_annotation (batch_id, violation) VALUES (?1, ?2)",
                params![id.to_string(), serde_json::to_string(&annotation)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn annotations_for_batch(&self, id: Uuid) -> Result<Vec<RuleViolation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT violation FROM batch_annotation WHERE batch_id = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let violation: String = row.get(0)?;
            out.push(serde_json::from_str(&violation)?);
        }
        Ok(out)
    }
}
