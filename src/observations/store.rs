use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use super::lateness;
use crate::error::{Error, Result};
use crate::model::request::{ObservationMetadataRequest, ObservationRequest, ObservationSetRequest, ObservationSetUpdate};
use crate::model::response::ObservationSetResponse;
use crate::model::{
    Audit, LoadedObservationSet, ObservationMetadataRecord, ObservationRecord, ObservationSetRecord,
};
use crate::storage::StorageEngine;

const DEFAULT_SPO2_SCALE: i32 = 1;

/// Creates and mutates observation sets together with their observations and
/// metadata.
#[derive(Debug, Clone)]
pub struct ObservationStore {
    storage: Arc<StorageEngine>,
}

impl ObservationStore {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        ObservationStore { storage }
    }

    /// Insert a set and its children in one statement. The response is
    /// assembled from the rows just written rather than read back.
    pub fn create(&self, request: &ObservationSetRequest, actor_id: &str) -> Result<ObservationSetResponse> {
        request.validate()?;

        let now = Utc::now();
        let audit = Audit::new(actor_id, now);
        let set = ObservationSetRecord {
            uuid: Uuid::new_v4(),
            audit: audit.clone(),
            encounter_id: request.encounter_id().map(str::to_string),
            patient_id: request.patient_id().map(str::to_string),
            record_time: request.record_time,
            score_system: request.score_system.clone(),
            score_value: request.score_value,
            score_string: request.score_string.clone(),
            score_severity: request.score_severity.clone(),
            spo2_scale: Some(request.spo2_scale.unwrap_or(DEFAULT_SPO2_SCALE)),
            location: request.location.clone(),
            is_partial: request.is_partial,
            empty_set: request.empty_set,
            ranking: request.ranking.clone(),
            monitoring_instruction: request.monitoring_instruction.clone(),
            time_next_obs_set_due: request.time_next_obs_set_due,
            obx_reference_range: request.obx_reference_range.clone(),
            obx_abnormal_flags: request.obx_abnormal_flags.clone(),
            mins_late: request.mins_late,
        };

        let mut observations = Vec::with_capacity(request.observations.len());
        let mut metadata = Vec::new();
        for entry in &request.observations {
            let observation = observation_row(entry, set.uuid, &audit);
            if let Some(meta) = &entry.observation_metadata {
                metadata.push(metadata_row(meta, observation.uuid));
            }
            observations.push(observation);
        }

        let response = ObservationSetResponse::assemble(&set, &observations, &metadata);

        let mut tx = self.storage.begin()?;
        tx.bulk_insert(set, observations, metadata)?;
        tx.commit()?;

        info!(
            obs_set_id = %response.uuid,
            encounter_id = response.encounter_id.as_deref().unwrap_or(""),
            observations = response.observations.len(),
            "observation set created"
        );
        Ok(response)
    }

    /// Apply `update` to a stored set in one transaction. Only `score_value`
    /// can change on an individual observation.
    pub fn patch(&self, set_id: Uuid, update: &ObservationSetUpdate, actor_id: &str) -> Result<ObservationSetResponse> {
        let mut tx = self.storage.begin()?;
        let loaded = tx
            .load_set(&set_id)?
            .ok_or_else(|| Error::not_found(format!("Observation set with UUID {} not found", set_id)))?;

        let now = Utc::now();
        for entry in &update.observations {
            let (observation_type, score_value) = entry.target()?;
            let existing = loaded.observation_of_type(observation_type).ok_or_else(|| {
                Error::not_found(format!(
                    "Observation of type {} not found in observation set {}",
                    observation_type, set_id
                ))
            })?;
            let mut observation = existing.observation.clone();
            observation.score_value = Some(score_value);
            observation.audit.touch(actor_id, now);
            tx.update_observation(observation)?;
        }

        let mut set = loaded.set;
        let due_changed = update.apply_to(&mut set);
        set.audit.touch(actor_id, now);
        let encounter_id = set.encounter_id.clone();
        tx.update_set(set)?;

        if let (true, Some(encounter_id)) = (due_changed, encounter_id) {
            lateness::recompute_in(&mut tx, &encounter_id)?;
        }

        let patched = tx
            .load_set(&set_id)?
            .ok_or_else(|| Error::not_found(format!("Observation set with UUID {} not found", set_id)))?;
        tx.commit()?;

        info!(obs_set_id = %set_id, "observation set patched");
        Ok(self.render(&patched, true))
    }

    pub fn render(&self, loaded: &LoadedObservationSet, compact: bool) -> ObservationSetResponse {
        ObservationSetResponse::render(loaded, compact)
    }

    /// Remove every set, observation and metadata row. Failures roll back and
    /// are logged; there is no retry.
    pub fn reset(&self) -> Result<()> {
        let mut tx = self.storage.begin()?;
        if let Err(e) = tx.delete_all() {
            error!(error = %e, "failed to reset observation tables");
            tx.rollback();
            return Err(e.into());
        }
        tx.commit().map_err(|e| {
            error!(error = %e, "failed to reset observation tables");
            Error::from(e)
        })?;
        info!("observation tables reset");
        Ok(())
    }
}

fn observation_row(entry: &ObservationRequest, set_uuid: Uuid, audit: &Audit) -> ObservationRecord {
    ObservationRecord {
        uuid: Uuid::new_v4(),
        observation_set_uuid: set_uuid,
        audit: audit.clone(),
        observation_type: entry.observation_type.clone(),
        measured_time: entry.measured_time,
        patient_refused: entry.patient_refused,
        score_value: entry.score_value,
        observation_value: entry.observation_value,
        observation_string: entry.observation_string.clone(),
        observation_unit: entry.observation_unit.clone(),
    }
}

fn metadata_row(meta: &ObservationMetadataRequest, observation_uuid: Uuid) -> ObservationMetadataRecord {
    ObservationMetadataRecord {
        uuid: Uuid::new_v4(),
        observation_uuid,
        mask: meta.mask.clone(),
        mask_percent: meta.mask_percent,
        gcs_eyes: meta.gcs_eyes,
        gcs_eyes_description: meta.gcs_eyes_description.clone(),
        gcs_verbal: meta.gcs_verbal,
        gcs_verbal_description: meta.gcs_verbal_description.clone(),
        gcs_motor: meta.gcs_motor,
        gcs_motor_description: meta.gcs_motor_description.clone(),
        patient_position: meta.patient_position.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::request::ObservationUpdate;
    use crate::storage::{SetFilter, SetQuery};
    use crate::test_support::{observation, set_for_encounter, set_request, ts, ACTOR};
    use pretty_assertions::assert_eq;

    fn store() -> ObservationStore {
        ObservationStore::new(Arc::new(StorageEngine::in_memory()))
    }

    fn stored(store: &ObservationStore, id: Uuid) -> LoadedObservationSet {
        store
            .storage
            .select_sets(&SetQuery::new(SetFilter::ById(id)))
            .unwrap()
            .remove(0)
    }

    #[test]
    fn create_assembles_response_without_reading_back() {
        let store = store();
        let before = store.storage.statement_count();
        let response = store.create(&set_request("e1", "2021-01-01T10:00:00Z", None), ACTOR).unwrap();
        // One bulk insert and nothing else.
        assert_eq!(store.storage.statement_count() - before, 1);

        assert_eq!(response.created_by, ACTOR);
        assert_eq!(response.obx.as_ref().unwrap().obx_reference_range.as_deref(), Some("0-4"));
        assert_eq!(response.observations.len(), 2);
        assert!(response.observations[0].observation_metadata.is_none());
        let mask = response.observations[1].observation_metadata.as_ref().unwrap();
        assert_eq!(mask.mask.as_deref(), Some("Room air"));

        let loaded = stored(&store, response.uuid);
        assert_eq!(store.render(&loaded, false), response);
    }

    #[test]
    fn create_rejects_invalid_payloads() {
        let store = store();
        let mut request = set_request("e1", "2021-01-01T10:00:00Z", None);
        request.observations.clear();
        assert!(matches!(store.create(&request, ACTOR), Err(Error::Validation(_))));

        let mut request = set_request("e1", "2021-01-01T10:00:00Z", None);
        request.encounter_id = None;
        assert!(matches!(store.create(&request, ACTOR), Err(Error::Validation(_))));
    }

    #[test]
    fn spo2_scale_defaults_to_one() {
        let store = store();
        let mut request = set_request("e1", "2021-01-01T10:00:00Z", None);
        request.spo2_scale = None;
        assert_eq!(store.create(&request, ACTOR).unwrap().spo2_scale, Some(1));
    }

    #[test]
    fn patch_changes_only_the_addressed_score() {
        let store = store();
        let created = store.create(&set_request("e1", "2021-01-01T10:00:00Z", None), ACTOR).unwrap();
        let update = ObservationSetUpdate {
            score_value: Some(5),
            score_severity: Some(Some("medium".to_string())),
            observations: vec![ObservationUpdate {
                observation_type: Some("heart_rate".to_string()),
                score_value: Some(3),
            }],
            ..ObservationSetUpdate::default()
        };

        let patched = store.patch(created.uuid, &update, "clinician-2").unwrap();
        assert_eq!(patched.score_value, Some(5));
        assert_eq!(patched.score_severity.as_deref(), Some("medium"));
        assert_eq!(patched.modified_by, "clinician-2");
        assert!(patched.obx.is_none());

        let heart_rate = &patched.observations[0];
        assert_eq!(heart_rate.score_value, Some(3));
        assert_eq!(heart_rate.observation_value, created.observations[0].observation_value);
        assert_eq!(heart_rate.observation_unit, created.observations[0].observation_unit);
        assert_eq!(patched.observations[1], created.observations[1]);
    }

    #[test]
    fn patch_unknown_targets_is_not_found_and_rolls_back() {
        let store = store();
        let created = store.create(&set_request("e1", "2021-01-01T10:00:00Z", None), ACTOR).unwrap();

        let nothing = ObservationSetUpdate::default();
        assert!(matches!(store.patch(Uuid::new_v4(), &nothing, ACTOR), Err(Error::NotFound(_))));

        let update = ObservationSetUpdate {
            score_value: Some(9),
            observations: vec![ObservationUpdate {
                observation_type: Some("temperature".to_string()),
                score_value: Some(1),
            }],
            ..ObservationSetUpdate::default()
        };
        assert!(matches!(store.patch(created.uuid, &update, ACTOR), Err(Error::NotFound(_))));
        assert_eq!(stored(&store, created.uuid).set.score_value, Some(3));
    }

    #[test]
    fn patch_requires_type_and_score_per_observation() {
        let store = store();
        let created = store.create(&set_request("e1", "2021-01-01T10:00:00Z", None), ACTOR).unwrap();
        let update = ObservationSetUpdate {
            observations: vec![ObservationUpdate {
                observation_type: Some("spo2".to_string()),
                score_value: None,
            }],
            ..ObservationSetUpdate::default()
        };
        assert!(matches!(store.patch(created.uuid, &update, ACTOR), Err(Error::Validation(_))));
    }

    #[test]
    fn unknown_set_wins_over_a_malformed_entry() {
        let store = store();
        let update = ObservationSetUpdate {
            observations: vec![ObservationUpdate {
                observation_type: Some("spo2".to_string()),
                score_value: None,
            }],
            ..ObservationSetUpdate::default()
        };
        assert!(matches!(store.patch(Uuid::new_v4(), &update, ACTOR), Err(Error::NotFound(_))));
    }

    #[test]
    fn patch_addresses_the_last_observation_of_a_repeated_type() {
        let store = store();
        let set = set_for_encounter("e1", ts("2021-01-01T10:00:00Z"));
        let set_id = set.uuid;
        let first = observation(&set, "heart_rate");
        let second = observation(&set, "heart_rate");
        let (first_id, second_id) = (first.uuid, second.uuid);
        let mut tx = store.storage.begin().unwrap();
        tx.bulk_insert(set, vec![first, second], Vec::new()).unwrap();
        tx.commit().unwrap();

        let update = ObservationSetUpdate {
            observations: vec![ObservationUpdate {
                observation_type: Some("heart_rate".to_string()),
                score_value: Some(2),
            }],
            ..ObservationSetUpdate::default()
        };
        store.patch(set_id, &update, ACTOR).unwrap();

        let loaded = stored(&store, set_id);
        let score_of = |id| {
            loaded
                .observations
                .iter()
                .find(|o| o.observation.uuid == id)
                .and_then(|o| o.observation.score_value)
        };
        assert_eq!(score_of(second_id), Some(2));
        assert_eq!(score_of(first_id), Some(0));
    }

    #[test]
    fn moving_the_due_time_recomputes_the_successor() {
        let store = store();
        let first = store
            .create(&set_request("e1", "2021-01-01T10:00:00Z", Some("2021-01-01T11:00:00Z")), ACTOR)
            .unwrap();
        let second = store.create(&set_request("e1", "2021-01-01T12:00:00Z", None), ACTOR).unwrap();
        lateness::LatenessCalculator::new(Arc::clone(&store.storage))
            .recompute("e1")
            .unwrap();
        assert_eq!(stored(&store, second.uuid).set.mins_late, Some(60));

        let update = ObservationSetUpdate {
            time_next_obs_set_due: Some(ts("2021-01-01T11:45:00Z")),
            ..ObservationSetUpdate::default()
        };
        store.patch(first.uuid, &update, ACTOR).unwrap();
        assert_eq!(stored(&store, second.uuid).set.mins_late, Some(15));
    }

    #[test]
    fn reset_clears_everything() {
        let store = store();
        store.create(&set_request("e1", "2021-01-01T10:00:00Z", None), ACTOR).unwrap();
        store.reset().unwrap();
        let counts = store.storage.count_sets_by_encounter(&["e1".to_string()]).unwrap();
        assert_eq!(counts["e1"], 0);
    }
}
