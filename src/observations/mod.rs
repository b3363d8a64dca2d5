//! Observation-set write path
//!
//! `ObservationService` runs a create end to end: the store insert, the
//! encounter's lateness recompute, then the outbound events.

pub mod lateness;
pub mod store;

use std::sync::Arc;

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::events::{EventPublisher, Topic};
use crate::model::request::{ObservationSetRequest, ObservationSetUpdate};
use crate::model::response::ObservationSetResponse;
use crate::storage::StorageEngine;
pub use lateness::LatenessCalculator;
pub use store::ObservationStore;

#[derive(Clone)]
pub struct ObservationService {
    store: ObservationStore,
    lateness: LatenessCalculator,
    publisher: Arc<dyn EventPublisher>,
}

impl ObservationService {
    pub fn new(storage: Arc<StorageEngine>, publisher: Arc<dyn EventPublisher>) -> Self {
        ObservationService {
            store: ObservationStore::new(Arc::clone(&storage)),
            lateness: LatenessCalculator::new(storage),
            publisher,
        }
    }

    pub fn store(&self) -> &ObservationStore {
        &self.store
    }

    pub fn create_observation_set(
        &self,
        request: &ObservationSetRequest,
        actor_id: &str,
        referring_device_id: Option<&str>,
        suppress_publish: bool,
    ) -> Result<ObservationSetResponse> {
        let mut response = self.store.create(request, actor_id)?;

        if let Some(encounter_id) = response.encounter_id.clone() {
            let values = self.lateness.recompute(&encounter_id)?;
            if let Some((_, mins_late)) = values.iter().find(|(id, _)| *id == response.uuid) {
                response.mins_late = Some(*mins_late);
            }
        }

        self.publisher.publish(
            Topic::AuditMessage,
            json!({
                "event_type": "create observation set",
                "event_data": {
                    "device_id": referring_device_id,
                    "clinician_id": actor_id,
                    "encounter_id": response.encounter_id,
                    "patient_id": response.patient_id,
                    "obs_set_id": response.uuid,
                },
            }),
        )?;

        if suppress_publish {
            debug!(obs_set_id = %response.uuid, "observation set events suppressed");
            return Ok(response);
        }

        self.publisher.publish(
            Topic::ObservationSetCreated,
            json!({
                "actions": [{
                    "name": "process_observation_set",
                    "data": {"observation_set": &response},
                }],
            }),
        )?;
        if let Some(encounter_id) = &response.encounter_id {
            self.publisher
                .publish(Topic::EncounterUpdated, json!({ "encounter_id": encounter_id }))?;
        }

        Ok(response)
    }

    pub fn patch_observation_set(
        &self,
        set_id: Uuid,
        update: &ObservationSetUpdate,
        actor_id: &str,
    ) -> Result<ObservationSetResponse> {
        self.store.patch(set_id, update, actor_id)
    }
}
