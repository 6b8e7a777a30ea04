use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tracing::debug;

use crate::config::DimensionConfig;
use crate::domain::{DimensionRecord, FieldValue, ScdType, StagingRecord, UNKNOWN_MEMBER_KEY};
use crate::error::{EtlError, Result};
use crate::pipeline::validate::DimensionLookup;
use crate::warehouse::DimensionDelta;

/// How a conform call changed the dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConformChange {
    /// New natural key, new current row
    Inserted,
    /// Type 1: descriptive attributes overwritten in place
    Overwritten,
    /// Type 2: previous current row closed, new version inserted
    Versioned { closed_key: i64 },
    /// Attributes identical to the current row
    Unchanged,
    /// A record carrying a later provenance timestamp for this natural key
    /// was already applied within the batch; this one is an intermediate
    /// update and does not alter the final current row
    Superseded,
}

#[derive(Debug, Clone, Copy)]
pub struct ConformOutcome {
    pub surrogate_key: i64,
    pub change: ConformChange,
}

struct Pending {
    row_idx: usize,
    is_new: bool,
}

/// Batch-local view of one dimension: the warehouse snapshot plus this
/// batch's pending changes. The dimension builder exclusively owns surrogate
/// assignment and SCD versioning through this type; writes publish to the
/// warehouse only at batch commit, so concurrent readers never observe a
/// partially-updated dimension.
pub struct DimensionOverlay {
    config: DimensionConfig,
    rows: Vec<DimensionRecord>,
    by_natural: HashMap<String, Vec<usize>>,
    current: HashMap<String, usize>,
    pending: BTreeMap<i64, Pending>,
    next_surrogate: i64,
    /// Provenance timestamp of the record whose state currently wins per
    /// natural key, for the same-batch tie-break
    winners: HashMap<String, DateTime<Utc>>,
}

impl DimensionOverlay {
    pub fn new(config: DimensionConfig, snapshot: Vec<DimensionRecord>) -> Self {
        let mut by_natural: HashMap<String, Vec<usize>> = HashMap::new();
        let mut current = HashMap::new();
        let mut next_surrogate = 1;
        for (idx, row) in snapshot.iter().enumerate() {
            by_natural.entry(row.natural_key.clone()).or_default().push(idx);
            if row.is_current {
                current.insert(row.natural_key.clone(), idx);
            }
            if row.surrogate_key >= next_surrogate {
                next_surrogate = row.surrogate_key + 1;
            }
        }
        Self {
            config,
            rows: snapshot,
            by_natural,
            current,
            pending: BTreeMap::new(),
            next_surrogate,
            winners: HashMap::new(),
        }
    }

    /// Read-only overlay for a dimension this job references but does not
    /// conform (its members are maintained by another job).
    pub fn read_only(name: &str, snapshot: Vec<DimensionRecord>) -> Self {
        Self::new(
            DimensionConfig {
                name: name.to_string(),
                natural_key_field: String::new(),
                scd: ScdType::Type1,
                attributes: Vec::new(),
            },
            snapshot,
        )
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn allocate(&mut self) -> i64 {
        let key = self.next_surrogate;
        self.next_surrogate += 1;
        key
    }

    fn mark_pending(&mut self, surrogate_key: i64, row_idx: usize, is_new: bool) {
        self.pending
            .entry(surrogate_key)
            .and_modify(|p| p.row_idx = row_idx)
            .or_insert(Pending { row_idx, is_new });
    }

    /// Resolve a natural key to a surrogate key: the current row, or the row
    /// in effect at `as_of` for point-in-time joins against Type 2 history.
    pub fn resolve(&self, natural_key: &str, as_of: Option<DateTime<Utc>>) -> Option<i64> {
        match as_of {
            None => self
                .current
                .get(natural_key)
                .map(|&idx| self.rows[idx].surrogate_key),
            Some(at) => self
                .by_natural
                .get(natural_key)?
                .iter()
                .map(|&idx| &self.rows[idx])
                .find(|row| row.in_effect_at(at))
                .map(|row| row.surrogate_key),
        }
    }

    /// Surrogate for the reserved unknown-member row, inserting the
    /// placeholder on first use. No attributes are ever fabricated for it.
    pub fn unknown_member(&mut self, batch_ts: DateTime<Utc>) -> i64 {
        let exists = self
            .rows
            .iter()
            .any(|row| row.surrogate_key == UNKNOWN_MEMBER_KEY);
        if !exists {
            let idx = self.rows.len();
            self.rows.push(DimensionRecord {
                surrogate_key: UNKNOWN_MEMBER_KEY,
                natural_key: "?".to_string(),
                attributes: BTreeMap::new(),
                effective_from: batch_ts,
                effective_to: None,
                is_current: true,
            });
            self.by_natural.entry("?".to_string()).or_default().push(idx);
            self.mark_pending(UNKNOWN_MEMBER_KEY, idx, true);
        }
        UNKNOWN_MEMBER_KEY
    }

    /// Conform one accepted staging record into this dimension.
    ///
    /// The batch timestamp stamps effective intervals; within a batch the
    /// record with the later provenance timestamp determines the final
    /// current row, earlier arrivals after it are validated no-ops.
    pub fn conform(
        &mut self,
        record: &StagingRecord,
        batch_ts: DateTime<Utc>,
    ) -> Result<ConformOutcome> {
        let natural_key = record.get(&self.config.natural_key_field).render();
        if natural_key.trim().is_empty() {
            // Guarded upstream by the validator; kept as a hard stop
            return Err(EtlError::ReferentialViolation(format!(
                "empty natural key for dimension '{}'",
                self.config.name
            )));
        }

        let record_ts = record.provenance.extracted_at;
        if let Some(&winner_ts) = self.winners.get(&natural_key) {
            if record_ts < winner_ts {
                let surrogate_key = self
                    .current
                    .get(&natural_key)
                    .map(|&idx| self.rows[idx].surrogate_key)
                    .unwrap_or(UNKNOWN_MEMBER_KEY);
                return Ok(ConformOutcome {
                    surrogate_key,
                    change: ConformChange::Superseded,
                });
            }
        }
        self.winners.insert(natural_key.clone(), record_ts);

        let attributes: BTreeMap<String, FieldValue> = self
            .config
            .attributes
            .iter()
            .map(|field| (field.clone(), record.get(field).clone()))
            .collect();

        let Some(&current_idx) = self.current.get(&natural_key) else {
            let surrogate_key = self.allocate();
            let idx = self.rows.len();
            self.rows.push(DimensionRecord {
                surrogate_key,
                natural_key: natural_key.clone(),
                attributes,
                effective_from: batch_ts,
                effective_to: None,
                is_current: true,
            });
            self.by_natural.entry(natural_key.clone()).or_default().push(idx);
            self.current.insert(natural_key.clone(), idx);
            self.mark_pending(surrogate_key, idx, true);
            debug!(dimension = %self.config.name, natural_key = %natural_key, surrogate_key, "new dimension member");
            return Ok(ConformOutcome {
                surrogate_key,
                change: ConformChange::Inserted,
            });
        };

        if self.rows[current_idx].attributes == attributes {
            return Ok(ConformOutcome {
                surrogate_key: self.rows[current_idx].surrogate_key,
                change: ConformChange::Unchanged,
            });
        }

        match self.config.scd {
            ScdType::Type1 => {
                let surrogate_key = self.rows[current_idx].surrogate_key;
                self.rows[current_idx].attributes = attributes;
                let was_new = self
                    .pending
                    .get(&surrogate_key)
                    .map(|p| p.is_new)
                    .unwrap_or(false);
                self.mark_pending(surrogate_key, current_idx, was_new);
                Ok(ConformOutcome {
                    surrogate_key,
                    change: ConformChange::Overwritten,
                })
            }
            ScdType::Type2 => {
                let closed_key = self.rows[current_idx].surrogate_key;
                self.rows[current_idx].effective_to = Some(batch_ts);
                self.rows[current_idx].is_current = false;
                let closed_was_new = self
                    .pending
                    .get(&closed_key)
                    .map(|p| p.is_new)
                    .unwrap_or(false);
                self.mark_pending(closed_key, current_idx, closed_was_new);

                let surrogate_key = self.allocate();
                let idx = self.rows.len();
                self.rows.push(DimensionRecord {
                    surrogate_key,
                    natural_key: natural_key.clone(),
                    attributes,
                    effective_from: batch_ts,
                    effective_to: None,
                    is_current: true,
                });
                self.by_natural.entry(natural_key.clone()).or_default().push(idx);
                self.current.insert(natural_key.clone(), idx);
                self.mark_pending(surrogate_key, idx, true);
                debug!(
                    dimension = %self.config.name,
                    natural_key = %natural_key,
                    closed_key,
                    surrogate_key,
                    "dimension member versioned"
                );
                Ok(ConformOutcome {
                    surrogate_key,
                    change: ConformChange::Versioned { closed_key },
                })
            }
        }
    }

    /// Drain the pending changes for publication at batch commit.
    pub fn take_deltas(&mut self) -> Vec<DimensionDelta> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_values()
            .map(|p| {
                let row = self.rows[p.row_idx].clone();
                if p.is_new {
                    DimensionDelta::Insert(row)
                } else {
                    DimensionDelta::Update(row)
                }
            })
            .collect()
    }
}

/// All dimension overlays in scope for one job.
pub struct DimensionOverlaySet {
    overlays: HashMap<String, DimensionOverlay>,
}

impl DimensionOverlaySet {
    pub fn new() -> Self {
        Self {
            overlays: HashMap::new(),
        }
    }

    pub fn insert(&mut self, overlay: DimensionOverlay) {
        self.overlays.insert(overlay.name().to_string(), overlay);
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DimensionOverlay> {
        self.overlays.get_mut(name)
    }

    pub fn resolve(
        &self,
        dimension: &str,
        natural_key: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Option<i64> {
        self.overlays.get(dimension)?.resolve(natural_key, as_of)
    }

    pub fn unknown_member(&mut self, dimension: &str, batch_ts: DateTime<Utc>) -> Option<i64> {
        self.overlays
            .get_mut(dimension)
            .map(|overlay| overlay.unknown_member(batch_ts))
    }

    pub fn take_all_deltas(&mut self) -> Vec<(String, Vec<DimensionDelta>)> {
        self.overlays
            .iter_mut()
            .map(|(name, overlay)| (name.clone(), overlay.take_deltas()))
            .filter(|(_, deltas)| !deltas.is_empty())
            .collect()
    }
}

impl Default for DimensionOverlaySet {
    fn default() -> Self {
        Self::new()
    }
}

impl DimensionLookup for DimensionOverlaySet {
    fn contains_member(&self, dimension: &str, natural_key: &str) -> bool {
        self.overlays
            .get(dimension)
            .map(|overlay| overlay.current.contains_key(natural_key))
            .unwrap_or(false)
    }
}

/// Process-wide advisory locks serializing conformance writes per dimension,
/// so jobs touching the same dimension preserve the single-current-row
/// invariant. Held only across a conform call, never across a whole job.
#[derive(Default)]
pub struct DimensionLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DimensionLocks {
    pub fn handle(&self, dimension: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(dimension.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

pub static DIMENSION_LOCKS: Lazy<DimensionLocks> = Lazy::new(DimensionLocks::default);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Provenance;
    use chrono::{Duration, TimeZone};

    fn student_config(scd: ScdType) -> DimensionConfig {
        DimensionConfig {
            name: "student".to_string(),
            natural_key_field: "student_id".to_string(),
            scd,
            attributes: vec!["major".to_string()],
        }
    }

    fn staging(student_id: &str, major: &str, extracted_at: DateTime<Utc>) -> StagingRecord {
        StagingRecord {
            fields: [
                ("student_id".to_string(), FieldValue::Text(student_id.to_string())),
                ("major".to_string(), FieldValue::Text(major.to_string())),
            ]
            .into_iter()
            .collect(),
            provenance: Provenance {
                source_id: "sis".to_string(),
                source_key: student_id.to_string(),
                extracted_at,
            },
            cleansing: Vec::new(),
        }
    }

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn new_member_gets_surrogate_and_current_row() {
        let mut overlay = DimensionOverlay::new(student_config(ScdType::Type2), Vec::new());
        let outcome = overlay.conform(&staging("S001", "CS", ts(1)), ts(12)).unwrap();
        assert_eq!(outcome.surrogate_key, 1);
        assert_eq!(outcome.change, ConformChange::Inserted);
        assert_eq!(overlay.resolve("S001", None), Some(1));
    }

    #[test]
    fn type1_overwrites_in_place_keeping_surrogate() {
        let mut overlay = DimensionOverlay::new(student_config(ScdType::Type1), Vec::new());
        overlay.conform(&staging("S001", "CS", ts(1)), ts(12)).unwrap();
        let outcome = overlay.conform(&staging("S001", "EE", ts(2)), ts(12)).unwrap();
        assert_eq!(outcome.change, ConformChange::Overwritten);
        assert_eq!(outcome.surrogate_key, 1);

        let deltas = overlay.take_deltas();
        // Still one row; the insert subsumes the overwrite
        assert_eq!(deltas.len(), 1);
        match &deltas[0] {
            DimensionDelta::Insert(row) => {
                assert_eq!(row.attributes["major"], FieldValue::Text("EE".to_string()));
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn type2_versions_with_history() {
        // Scenario: major CS, CS, EE for one natural key yields two rows,
        // one closed and one current
        let mut overlay = DimensionOverlay::new(student_config(ScdType::Type2), Vec::new());
        let batch_ts = ts(12);
        overlay.conform(&staging("S001", "CS", ts(1)), batch_ts).unwrap();
        let second = overlay.conform(&staging("S001", "CS", ts(2)), batch_ts).unwrap();
        assert_eq!(second.change, ConformChange::Unchanged);
        let third = overlay.conform(&staging("S001", "EE", ts(3)), batch_ts).unwrap();
        assert!(matches!(third.change, ConformChange::Versioned { closed_key: 1 }));
        assert_eq!(third.surrogate_key, 2);

        let rows: Vec<_> = overlay
            .rows
            .iter()
            .filter(|r| r.natural_key == "S001")
            .collect();
        assert_eq!(rows.len(), 2);
        let closed = rows.iter().find(|r| !r.is_current).unwrap();
        let current = rows.iter().find(|r| r.is_current).unwrap();
        assert_eq!(closed.attributes["major"], FieldValue::Text("CS".to_string()));
        assert_eq!(closed.effective_to, Some(batch_ts));
        assert_eq!(current.attributes["major"], FieldValue::Text("EE".to_string()));
        assert_eq!(current.effective_to, None);
    }

    #[test]
    fn later_provenance_timestamp_wins_within_batch() {
        let mut overlay = DimensionOverlay::new(student_config(ScdType::Type2), Vec::new());
        overlay.conform(&staging("S001", "EE", ts(3)), ts(12)).unwrap();
        // An earlier-stamped record arriving afterwards is an intermediate
        // update and does not disturb the final current row
        let outcome = overlay.conform(&staging("S001", "CS", ts(1)), ts(12)).unwrap();
        assert_eq!(outcome.change, ConformChange::Superseded);

        let idx = overlay.current["S001"];
        assert_eq!(
            overlay.rows[idx].attributes["major"],
            FieldValue::Text("EE".to_string())
        );
    }

    #[test]
    fn at_most_one_current_row_per_natural_key() {
        let mut overlay = DimensionOverlay::new(student_config(ScdType::Type2), Vec::new());
        for (major, hour) in [("CS", 1), ("EE", 2), ("ME", 3), ("CS", 4)] {
            overlay.conform(&staging("S001", major, ts(hour)), ts(12)).unwrap();
        }
        let current_count = overlay
            .rows
            .iter()
            .filter(|r| r.natural_key == "S001" && r.is_current)
            .count();
        assert_eq!(current_count, 1);
    }

    #[test]
    fn as_of_resolution_follows_effective_intervals() {
        let day1 = ts(0);
        let day2 = day1 + Duration::days(30);
        let mut overlay = DimensionOverlay::new(student_config(ScdType::Type2), Vec::new());
        overlay.conform(&staging("S001", "CS", day1), day1).unwrap();
        overlay.conform(&staging("S001", "EE", day2), day2).unwrap();

        assert_eq!(overlay.resolve("S001", Some(day1 + Duration::days(5))), Some(1));
        assert_eq!(overlay.resolve("S001", Some(day2 + Duration::days(5))), Some(2));
        assert_eq!(overlay.resolve("S001", None), Some(2));
    }

    #[test]
    fn surrogates_continue_from_snapshot() {
        let snapshot = vec![DimensionRecord {
            surrogate_key: 7,
            natural_key: "S001".to_string(),
            attributes: [("major".to_string(), FieldValue::Text("CS".to_string()))]
                .into_iter()
                .collect(),
            effective_from: ts(0),
            effective_to: None,
            is_current: true,
        }];
        let mut overlay = DimensionOverlay::new(student_config(ScdType::Type2), snapshot);
        let outcome = overlay.conform(&staging("S002", "EE", ts(1)), ts(12)).unwrap();
        assert_eq!(outcome.surrogate_key, 8);

        // Replaying the snapshot state is a no-op
        let replay = overlay.conform(&staging("S001", "CS", ts(1)), ts(12)).unwrap();
        assert_eq!(replay.change, ConformChange::Unchanged);
        assert!(overlay
            .take_deltas()
            .iter()
            .all(|d| !matches!(d, DimensionDelta::Update(r) if r.natural_key == "S001")));
    }

    #[test]
    fn unknown_member_is_reserved_key_without_attributes() {
        let mut overlay = DimensionOverlay::read_only("course", Vec::new());
        assert_eq!(overlay.unknown_member(ts(12)), UNKNOWN_MEMBER_KEY);
        // Idempotent
        assert_eq!(overlay.unknown_member(ts(12)), UNKNOWN_MEMBER_KEY);
        let deltas = overlay.take_deltas();
        assert_eq!(deltas.len(), 1);
        match &deltas[0] {
            DimensionDelta::Insert(row) => assert!(row.attributes.is_empty()),
            other => panic!("expected insert, got {other:?}"),
        }
    }
}
