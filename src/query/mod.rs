//! Query engine
//!
//! Read-side operations over observation sets. Every operation maps onto a
//! single storage statement, whatever the number of encounters requested.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::response::ObservationSetResponse;
use crate::model::LoadedObservationSet;
use crate::storage::{SetFilter, SetOrder, SetQuery, StorageEngine};
use crate::timestamps::format_instant;

/// Identifier-only row returned by a compact location search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservationSetId {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LocationSearchResult {
    Ids(Vec<ObservationSetId>),
    Sets(Vec<ObservationSetResponse>),
}

impl LocationSearchResult {
    pub fn len(&self) -> usize {
        match self {
            LocationSearchResult::Ids(ids) => ids.len(),
            LocationSearchResult::Sets(sets) => sets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct QueryEngine {
    storage: Arc<StorageEngine>,
}

fn render_all(sets: Vec<LoadedObservationSet>, compact: bool) -> Vec<ObservationSetResponse> {
    sets.iter()
        .map(|loaded| ObservationSetResponse::render(loaded, compact))
        .collect()
}

impl QueryEngine {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        QueryEngine { storage }
    }

    pub fn observation_set_by_id(&self, id: Uuid, compact: bool) -> Result<ObservationSetResponse> {
        self.storage
            .select_sets(&SetQuery::new(SetFilter::ById(id)))?
            .first()
            .map(|loaded| ObservationSetResponse::render(loaded, compact))
            .ok_or_else(|| Error::not_found(format!("Observation set with UUID {} not found", id)))
    }

    /// Sets of any of the encounters, newest first. Unknown encounters simply
    /// contribute nothing.
    pub fn observation_sets_for_encounters(
        &self,
        encounter_ids: &[String],
        limit: Option<usize>,
        compact: bool,
    ) -> Result<Vec<ObservationSetResponse>> {
        let query = SetQuery::new(SetFilter::Encounters(encounter_ids.to_vec())).limit(limit);
        Ok(render_all(self.storage.select_sets(&query)?, compact))
    }

    /// The single most recent set across all the given encounters combined.
    pub fn latest_observation_set_for_encounters(
        &self,
        encounter_ids: &[String],
        compact: bool,
    ) -> Result<ObservationSetResponse> {
        self.observation_sets_for_encounters(encounter_ids, Some(1), compact)?
            .pop()
            .ok_or_else(|| {
                Error::not_found(format!(
                    "No observation sets found for encounters {}",
                    encounter_ids.join(", ")
                ))
            })
    }

    /// Most recent set per encounter. Encounters without sets are absent.
    pub fn latest_observation_sets_by_encounter_ids(
        &self,
        encounter_ids: &[String],
        compact: bool,
    ) -> Result<BTreeMap<String, ObservationSetResponse>> {
        let latest = self.storage.select_latest_per_encounter(encounter_ids)?;
        debug!(requested = encounter_ids.len(), found = latest.len(), "latest sets per encounter");
        Ok(latest
            .into_iter()
            .map(|(encounter_id, loaded)| (encounter_id, ObservationSetResponse::render(&loaded, compact)))
            .collect())
    }

    /// Sets created with this patient id, newest first, compact.
    pub fn observation_sets_for_patient(
        &self,
        patient_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ObservationSetResponse>> {
        let query = SetQuery::new(SetFilter::Patient(patient_id.to_string())).limit(limit);
        Ok(render_all(self.storage.select_sets(&query)?, true))
    }

    /// Sets at any of `locations` with `start < record_time <= end`, newest
    /// first. Compact mode returns identifiers only.
    pub fn observation_sets_by_locations_and_date_range(
        &self,
        locations: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
        compact: bool,
    ) -> Result<LocationSearchResult> {
        if start > end {
            return Err(Error::Unprocessable(format!(
                "Start date {} must not be after end date {}",
                format_instant(&start),
                format_instant(&end)
            )));
        }
        let query = SetQuery::new(SetFilter::LocationsBetween {
            locations: locations.to_vec(),
            after: start,
            until: end,
        })
        .limit(limit);

        if compact {
            let ids = self.storage.select_set_ids(&query)?;
            return Ok(LocationSearchResult::Ids(
                ids.into_iter().map(|uuid| ObservationSetId { uuid }).collect(),
            ));
        }
        Ok(LocationSearchResult::Sets(render_all(self.storage.select_sets(&query)?, true)))
    }

    /// Number of sets per encounter, including zero for unknown encounters.
    pub fn observation_set_count_for_encounters(&self, encounter_ids: &[String]) -> Result<BTreeMap<String, usize>> {
        Ok(self.storage.count_sets_by_encounter(encounter_ids)?)
    }

    pub fn observation_sets_modified_since(
        &self,
        cutoff: DateTime<Utc>,
        compact: bool,
    ) -> Result<Vec<ObservationSetResponse>> {
        let query = SetQuery::new(SetFilter::ModifiedAfter(cutoff)).order_by(SetOrder::ModifiedDesc);
        Ok(render_all(self.storage.select_sets(&query)?, compact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObservationSetRecord;
    use crate::test_support::{set_for_encounter, set_for_patient, ts};
    use chrono::Duration;

    fn engine_with(sets: Vec<ObservationSetRecord>) -> (QueryEngine, Arc<StorageEngine>) {
        let storage = Arc::new(StorageEngine::in_memory());
        for set in sets {
            let mut tx = storage.begin().unwrap();
            tx.bulk_insert(set, Vec::new(), Vec::new()).unwrap();
            tx.commit().unwrap();
        }
        (QueryEngine::new(Arc::clone(&storage)), storage)
    }

    fn at_location(location: &str, at: &str) -> ObservationSetRecord {
        let mut set = set_for_encounter("e1", ts(at));
        set.location = Some(location.to_string());
        set
    }

    fn ids(encounters: &[&str]) -> Vec<String> {
        encounters.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn encounter_sets_are_newest_first_and_limited() {
        let (engine, _) = engine_with(vec![
            set_for_encounter("e1", ts("2021-01-01T10:00:00Z")),
            set_for_encounter("e2", ts("2021-01-01T12:00:00Z")),
            set_for_encounter("e1", ts("2021-01-01T11:00:00Z")),
        ]);
        let all = engine.observation_sets_for_encounters(&ids(&["e1", "e2"]), None, false).unwrap();
        let times: Vec<_> = all.iter().map(|s| s.record_time).collect();
        assert_eq!(
            times,
            vec![ts("2021-01-01T12:00:00Z"), ts("2021-01-01T11:00:00Z"), ts("2021-01-01T10:00:00Z")]
        );

        let limited = engine.observation_sets_for_encounters(&ids(&["e1"]), Some(1), true).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].record_time, ts("2021-01-01T11:00:00Z"));

        assert!(engine.observation_sets_for_encounters(&ids(&["nope"]), None, true).unwrap().is_empty());
    }

    #[test]
    fn latest_across_encounters_is_a_single_set() {
        let (engine, _) = engine_with(vec![
            set_for_encounter("e1", ts("2021-01-01T10:00:00Z")),
            set_for_encounter("e2", ts("2021-01-01T12:00:00Z")),
        ]);
        let latest = engine.latest_observation_set_for_encounters(&ids(&["e1", "e2"]), true).unwrap();
        assert_eq!(latest.encounter_id.as_deref(), Some("e2"));

        assert!(matches!(
            engine.latest_observation_set_for_encounters(&ids(&["e3"]), true),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn latest_per_encounter_runs_one_statement() {
        let mut sets = Vec::new();
        for e in 0..100 {
            for minute in 0..10 {
                sets.push(set_for_encounter(
                    &format!("e{}", e),
                    ts("2021-01-01T00:00:00Z") + Duration::minutes(minute),
                ));
            }
        }
        let (engine, storage) = engine_with(sets);
        let encounters: Vec<String> = (0..100).map(|e| format!("e{}", e)).collect();

        let before = storage.statement_count();
        let latest = engine.latest_observation_sets_by_encounter_ids(&encounters, true).unwrap();
        assert_eq!(storage.statement_count() - before, 1);
        assert_eq!(latest.len(), 100);
        assert!(latest.values().all(|s| s.record_time == ts("2021-01-01T00:09:00Z")));
    }

    #[test]
    fn counts_include_unknown_encounters_in_one_statement() {
        let (engine, storage) = engine_with(vec![
            set_for_encounter("e1", ts("2021-01-01T10:00:00Z")),
            set_for_encounter("e1", ts("2021-01-01T11:00:00Z")),
        ]);
        let before = storage.statement_count();
        let counts = engine.observation_set_count_for_encounters(&ids(&["e1", "e2"])).unwrap();
        assert_eq!(storage.statement_count() - before, 1);
        assert_eq!(counts["e1"], 2);
        assert_eq!(counts["e2"], 0);
    }

    #[test]
    fn patient_query_sees_only_patient_sets() {
        let (engine, _) = engine_with(vec![
            set_for_patient("p1", ts("2021-01-01T10:00:00Z")),
            set_for_encounter("e1", ts("2021-01-01T11:00:00Z")),
        ]);
        let found = engine.observation_sets_for_patient("p1", None).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].obx.is_none());
    }

    #[test]
    fn location_range_boundaries() {
        let start = "2021-01-01T00:00:00Z";
        let end = "2021-01-02T00:00:00Z";
        let on_end = at_location("ward-a", end);
        let (engine, _) = engine_with(vec![
            at_location("ward-a", start),
            on_end.clone(),
            at_location("ward-b", "2021-01-01T06:00:00Z"),
        ]);
        let locations = ids(&["ward-a"]);

        let found = engine
            .observation_sets_by_locations_and_date_range(&locations, ts(start), ts(end), None, true)
            .unwrap();
        assert_eq!(found, LocationSearchResult::Ids(vec![ObservationSetId { uuid: on_end.uuid }]));

        let full = engine
            .observation_sets_by_locations_and_date_range(&locations, ts(start), ts(end), None, false)
            .unwrap();
        assert_eq!(full.len(), 1);

        assert!(matches!(
            engine.observation_sets_by_locations_and_date_range(&locations, ts(end), ts(start), None, true),
            Err(Error::Unprocessable(_))
        ));
    }

    #[test]
    fn modified_since_orders_by_modification() {
        let mut older = set_for_encounter("e1", ts("2021-01-01T10:00:00Z"));
        older.audit.modified = ts("2021-02-01T00:00:00Z");
        let mut newer = set_for_encounter("e1", ts("2021-01-01T09:00:00Z"));
        newer.audit.modified = ts("2021-03-01T00:00:00Z");
        let mut stale = set_for_encounter("e1", ts("2021-01-01T08:00:00Z"));
        stale.audit.modified = ts("2020-12-01T00:00:00Z");
        let (engine, _) = engine_with(vec![older.clone(), newer.clone(), stale]);

        let found = engine
            .observation_sets_modified_since(ts("2021-01-01T00:00:00Z"), true)
            .unwrap();
        let uuids: Vec<Uuid> = found.iter().map(|s| s.uuid).collect();
        assert_eq!(uuids, vec![newer.uuid, older.uuid]);
    }

    #[test]
    fn get_by_id_renders_full_or_not_found() {
        let set = set_for_encounter("e1", ts("2021-01-01T10:00:00Z"));
        let (engine, _) = engine_with(vec![set.clone()]);
        assert!(engine.observation_set_by_id(set.uuid, false).unwrap().obx.is_some());
        assert!(matches!(
            engine.observation_set_by_id(Uuid::new_v4(), false),
            Err(Error::NotFound(_))
        ));
    }
}
