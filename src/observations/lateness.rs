//! Minutes-late derivation for the observation sets of one encounter.
//!
//! Sets are ranked by `record_time`; each set is compared with the due time
//! its predecessor announced. The whole encounter is recomputed every time, so
//! a set recorded "in the past" shifts its chronological successor correctly
//! and the result depends only on the final row set.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::model::ObservationSetRecord;
use crate::storage::{StorageEngine, Transaction};

/// Whole minutes between `due` and `recorded`, rounded half away from zero.
/// Negative when the set was recorded early.
pub fn minutes_late(due: DateTime<Utc>, recorded: DateTime<Utc>) -> i64 {
    let elapsed = recorded - due;
    let seconds = match elapsed.num_microseconds() {
        Some(micros) => micros as f64 / 1_000_000.0,
        None => elapsed.num_seconds() as f64,
    };
    (seconds / 60.0).round() as i64
}

/// `mins_late` for every set of one encounter, in record-time order.
pub fn compute(sets: &[ObservationSetRecord]) -> Vec<(Uuid, i64)> {
    let mut ordered: Vec<&ObservationSetRecord> = sets.iter().collect();
    // Ties on record_time fall back to creation order, then uuid.
    ordered.sort_by_key(|s| (s.record_time, s.audit.created, s.uuid));

    let mut values = Vec::with_capacity(ordered.len());
    let mut previous_due: Option<Option<DateTime<Utc>>> = None;
    for set in ordered {
        let mins_late = match previous_due {
            Some(Some(due)) => minutes_late(due, set.record_time),
            // First in the encounter, or the predecessor set no due time.
            Some(None) | None => 0,
        };
        values.push((set.uuid, mins_late));
        previous_due = Some(set.time_next_obs_set_due);
    }
    values
}

/// Recompute and write lateness for `encounter_id` inside an open transaction.
pub fn recompute_in(tx: &mut Transaction<'_>, encounter_id: &str) -> Result<Vec<(Uuid, i64)>> {
    let sets = tx.encounter_sets(encounter_id)?;
    let values = compute(&sets);
    let written = tx.update_mins_late(&values)?;
    debug!(encounter_id, sets = values.len(), written, "lateness recomputed");
    Ok(values)
}

#[derive(Debug, Clone)]
pub struct LatenessCalculator {
    storage: Arc<StorageEngine>,
}

impl LatenessCalculator {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        LatenessCalculator { storage }
    }

    /// Recompute lateness for one encounter in its own transaction.
    pub fn recompute(&self, encounter_id: &str) -> Result<Vec<(Uuid, i64)>> {
        let mut tx = self.storage.begin()?;
        let values = recompute_in(&mut tx, encounter_id)?;
        tx.commit()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SetFilter, SetQuery};
    use crate::test_support::{set_for_encounter, ts};

    fn with_due(mut set: ObservationSetRecord, due: &str) -> ObservationSetRecord {
        set.time_next_obs_set_due = Some(ts(due));
        set
    }

    fn value_for(values: &[(Uuid, i64)], set: &ObservationSetRecord) -> i64 {
        values
            .iter()
            .find(|(id, _)| *id == set.uuid)
            .map(|(_, m)| *m)
            .unwrap()
    }

    #[test]
    fn first_set_is_on_time() {
        let only = with_due(set_for_encounter("e1", ts("2021-01-01T10:00:00Z")), "2021-01-01T11:00:00Z");
        assert_eq!(compute(&[only.clone()]), vec![(only.uuid, 0)]);
    }

    #[test]
    fn successor_is_measured_against_predecessor_due_time() {
        let a = with_due(set_for_encounter("e1", ts("2021-01-01T10:00:00Z")), "2021-01-01T11:00:00Z");
        let b = set_for_encounter("e1", ts("2021-01-01T12:20:00Z"));
        let values = compute(&[b.clone(), a.clone()]);
        assert_eq!(value_for(&values, &a), 0);
        assert_eq!(value_for(&values, &b), 80);
    }

    #[test]
    fn missing_due_time_counts_as_on_time() {
        let a = set_for_encounter("e1", ts("2021-01-01T10:00:00Z"));
        let b = set_for_encounter("e1", ts("2021-01-01T15:00:00Z"));
        let values = compute(&[a, b.clone()]);
        assert_eq!(value_for(&values, &b), 0);
    }

    #[test]
    fn early_sets_are_negative_and_rounding_is_to_nearest_minute() {
        let due = ts("2021-01-01T11:00:00Z");
        assert_eq!(minutes_late(due, ts("2021-01-01T10:45:00Z")), -15);
        assert_eq!(minutes_late(due, ts("2021-01-01T11:00:29Z")), 0);
        assert_eq!(minutes_late(due, ts("2021-01-01T11:00:30Z")), 1);
        assert_eq!(minutes_late(due, ts("2021-01-01T13:01:00Z")), 121);
    }

    #[test]
    fn out_of_order_insert_shifts_the_successor() {
        let storage = Arc::new(StorageEngine::in_memory());
        let calculator = LatenessCalculator::new(Arc::clone(&storage));

        let later = with_due(set_for_encounter("e1", ts("2021-01-01T12:00:00Z")), "2021-01-01T13:00:00Z");
        let mut tx = storage.begin().unwrap();
        tx.bulk_insert(later.clone(), Vec::new(), Vec::new()).unwrap();
        tx.commit().unwrap();
        let values = calculator.recompute("e1").unwrap();
        assert_eq!(value_for(&values, &later), 0);

        // Recorded earlier, inserted afterwards: `later` is no longer first.
        let earlier = with_due(set_for_encounter("e1", ts("2021-01-01T10:00:00Z")), "2021-01-01T11:30:00Z");
        let mut tx = storage.begin().unwrap();
        tx.bulk_insert(earlier.clone(), Vec::new(), Vec::new()).unwrap();
        tx.commit().unwrap();
        let values = calculator.recompute("e1").unwrap();
        assert_eq!(value_for(&values, &earlier), 0);
        assert_eq!(value_for(&values, &later), 30);

        let stored = storage
            .select_sets(&SetQuery::new(SetFilter::ById(later.uuid)))
            .unwrap();
        assert_eq!(stored[0].set.mins_late, Some(30));
    }

    #[test]
    fn recompute_is_idempotent() {
        let storage = Arc::new(StorageEngine::in_memory());
        let calculator = LatenessCalculator::new(Arc::clone(&storage));
        for (at, due) in [
            ("2021-01-01T10:00:00Z", "2021-01-01T11:00:00Z"),
            ("2021-01-01T11:10:00Z", "2021-01-01T12:00:00Z"),
        ] {
            let mut tx = storage.begin().unwrap();
            tx.bulk_insert(with_due(set_for_encounter("e1", ts(at)), due), Vec::new(), Vec::new())
                .unwrap();
            tx.commit().unwrap();
        }
        let first = calculator.recompute("e1").unwrap();
        let second = calculator.recompute("e1").unwrap();
        assert_eq!(first, second);
    }
}
