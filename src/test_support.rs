//! Builders shared by the unit tests.

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::model::request::ObservationSetRequest;
use crate::model::{Audit, ObservationRecord, ObservationSetRecord};
use crate::timestamps::parse_instant;

pub const ACTOR: &str = "clinician-1";

pub fn ts(value: &str) -> DateTime<Utc> {
    parse_instant(value).unwrap()
}

fn blank_set(at: DateTime<Utc>) -> ObservationSetRecord {
    ObservationSetRecord {
        uuid: Uuid::new_v4(),
        audit: Audit::new(ACTOR, at),
        encounter_id: None,
        patient_id: None,
        record_time: at,
        score_system: Some("news2".to_string()),
        score_value: Some(2),
        score_string: Some("2".to_string()),
        score_severity: Some("low".to_string()),
        spo2_scale: Some(1),
        location: None,
        is_partial: Some(false),
        empty_set: Some(false),
        ranking: None,
        monitoring_instruction: None,
        time_next_obs_set_due: None,
        obx_reference_range: None,
        obx_abnormal_flags: None,
        mins_late: None,
    }
}

pub fn set_for_encounter(encounter_id: &str, at: DateTime<Utc>) -> ObservationSetRecord {
    ObservationSetRecord {
        encounter_id: Some(encounter_id.to_string()),
        ..blank_set(at)
    }
}

pub fn set_for_patient(patient_id: &str, at: DateTime<Utc>) -> ObservationSetRecord {
    ObservationSetRecord {
        patient_id: Some(patient_id.to_string()),
        ..blank_set(at)
    }
}

pub fn observation(set: &ObservationSetRecord, observation_type: &str) -> ObservationRecord {
    ObservationRecord {
        uuid: Uuid::new_v4(),
        observation_set_uuid: set.uuid,
        audit: set.audit.clone(),
        observation_type: observation_type.to_string(),
        measured_time: set.record_time,
        patient_refused: Some(false),
        score_value: Some(0),
        observation_value: Some(1.0),
        observation_string: None,
        observation_unit: None,
    }
}

/// A create payload for `encounter_id` with a heart rate and an SpO2 reading.
pub fn set_request(encounter_id: &str, record_time: &str, due: Option<&str>) -> ObservationSetRequest {
    serde_json::from_value(json!({
        "encounter_id": encounter_id,
        "record_time": record_time,
        "score_system": "news2",
        "score_value": 3,
        "score_string": "3",
        "score_severity": "low",
        "spo2_scale": 1,
        "location": "ward-a",
        "time_next_obs_set_due": due,
        "obx_reference_range": "0-4",
        "observations": [
            {
                "observation_type": "heart_rate",
                "measured_time": record_time,
                "observation_value": 70,
                "observation_unit": "bpm",
                "score_value": 0
            },
            {
                "observation_type": "spo2",
                "measured_time": record_time,
                "observation_value": 97,
                "observation_unit": "%",
                "score_value": 0,
                "observation_metadata": {"mask": "Room air"}
            }
        ]
    }))
    .unwrap()
}
