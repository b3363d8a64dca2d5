//! API-shaped projections of stored observation sets.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{
    LoadedObservation, LoadedObservationSet, ObservationMetadataRecord, ObservationRecord,
    ObservationSetRecord,
};
use crate::timestamps::utc_datetime;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationSetResponse {
    pub uuid: Uuid,
    #[serde(with = "utc_datetime")]
    pub created: DateTime<Utc>,
    pub created_by: String,
    #[serde(with = "utc_datetime")]
    pub modified: DateTime<Utc>,
    pub modified_by: String,
    pub encounter_id: Option<String>,
    pub patient_id: Option<String>,
    pub score_system: Option<String>,
    pub score_string: Option<String>,
    pub score_value: Option<i32>,
    pub score_severity: Option<String>,
    #[serde(with = "utc_datetime")]
    pub record_time: DateTime<Utc>,
    pub spo2_scale: Option<i32>,
    pub observations: Vec<ObservationResponse>,
    pub is_partial: Option<bool>,
    pub empty_set: Option<bool>,
    pub ranking: Option<String>,
    #[serde(with = "utc_datetime::option")]
    pub time_next_obs_set_due: Option<DateTime<Utc>>,
    pub monitoring_instruction: Option<String>,
    pub location: Option<String>,
    pub mins_late: Option<i64>,
    /// Present only in full (non-compact) projections.
    #[serde(flatten)]
    pub obx: Option<ObxFields>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObxFields {
    pub obx_reference_range: Option<String>,
    pub obx_abnormal_flags: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationResponse {
    pub uuid: Uuid,
    pub observation_type: String,
    pub patient_refused: Option<bool>,
    pub score_value: Option<i32>,
    pub observation_value: Option<f64>,
    pub observation_string: Option<String>,
    pub observation_unit: Option<String>,
    pub observation_metadata: Option<ObservationMetadataResponse>,
    #[serde(with = "utc_datetime")]
    pub measured_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationMetadataResponse {
    pub uuid: Uuid,
    pub mask: Option<String>,
    pub mask_percent: Option<i32>,
    pub gcs_eyes: Option<i32>,
    pub gcs_eyes_description: Option<String>,
    pub gcs_verbal: Option<i32>,
    pub gcs_verbal_description: Option<String>,
    pub gcs_motor: Option<i32>,
    pub gcs_motor_description: Option<String>,
    pub patient_position: Option<String>,
}

impl From<&ObservationMetadataRecord> for ObservationMetadataResponse {
    fn from(m: &ObservationMetadataRecord) -> Self {
        ObservationMetadataResponse {
            uuid: m.uuid,
            mask: m.mask.clone(),
            mask_percent: m.mask_percent,
            gcs_eyes: m.gcs_eyes,
            gcs_eyes_description: m.gcs_eyes_description.clone(),
            gcs_verbal: m.gcs_verbal,
            gcs_verbal_description: m.gcs_verbal_description.clone(),
            gcs_motor: m.gcs_motor,
            gcs_motor_description: m.gcs_motor_description.clone(),
            patient_position: m.patient_position.clone(),
        }
    }
}

impl ObservationResponse {
    fn project(observation: &ObservationRecord, metadata: Option<&ObservationMetadataRecord>) -> Self {
        ObservationResponse {
            uuid: observation.uuid,
            observation_type: observation.observation_type.clone(),
            patient_refused: observation.patient_refused,
            score_value: observation.score_value,
            observation_value: observation.observation_value,
            observation_string: observation.observation_string.clone(),
            observation_unit: observation.observation_unit.clone(),
            observation_metadata: metadata.map(ObservationMetadataResponse::from),
            measured_time: observation.measured_time,
        }
    }
}

impl From<&LoadedObservation> for ObservationResponse {
    fn from(loaded: &LoadedObservation) -> Self {
        ObservationResponse::project(&loaded.observation, loaded.metadata.as_ref())
    }
}

impl ObservationSetResponse {
    fn project(set: &ObservationSetRecord, observations: Vec<ObservationResponse>, compact: bool) -> Self {
        let obx = if compact {
            None
        } else {
            Some(ObxFields {
                obx_reference_range: set.obx_reference_range.clone(),
                obx_abnormal_flags: set.obx_abnormal_flags.clone(),
            })
        };
        ObservationSetResponse {
            uuid: set.uuid,
            created: set.audit.created,
            created_by: set.audit.created_by.clone(),
            modified: set.audit.modified,
            modified_by: set.audit.modified_by.clone(),
            encounter_id: set.encounter_id.clone(),
            patient_id: set.patient_id.clone(),
            score_system: set.score_system.clone(),
            score_string: set.score_string.clone(),
            score_value: set.score_value,
            score_severity: set.score_severity.clone(),
            record_time: set.record_time,
            spo2_scale: set.spo2_scale,
            observations,
            is_partial: set.is_partial,
            empty_set: set.empty_set,
            ranking: set.ranking.clone(),
            time_next_obs_set_due: set.time_next_obs_set_due,
            monitoring_instruction: set.monitoring_instruction.clone(),
            location: set.location.clone(),
            mins_late: set.mins_late,
            obx,
        }
    }

    /// Render a stored set with its observations.
    pub fn render(loaded: &LoadedObservationSet, compact: bool) -> Self {
        let observations = loaded.observations.iter().map(ObservationResponse::from).collect();
        ObservationSetResponse::project(&loaded.set, observations, compact)
    }

    /// Build the full projection straight from the rows just written, pairing
    /// metadata with its observation by the generated observation uuid.
    pub fn assemble(
        set: &ObservationSetRecord,
        observations: &[ObservationRecord],
        metadata: &[ObservationMetadataRecord],
    ) -> Self {
        let observations = observations
            .iter()
            .map(|observation| {
                let meta = metadata.iter().find(|m| m.observation_uuid == observation.uuid);
                ObservationResponse::project(observation, meta)
            })
            .collect();
        ObservationSetResponse::project(set, observations, false)
    }
}
