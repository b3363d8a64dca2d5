use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::{ObservationRecord, ObservationSetRecord};
use crate::error::{Error, Result};
use crate::timestamps::utc_datetime;

/// Payload for creating an observation set. Shape checking happens during
/// deserialisation; `validate` re-checks the invariants the store relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSetRequest {
    #[serde(with = "utc_datetime")]
    pub record_time: DateTime<Utc>,
    #[serde(default)]
    pub encounter_id: Option<String>,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub score_system: Option<String>,
    #[serde(default)]
    pub score_value: Option<i32>,
    #[serde(default)]
    pub score_string: Option<String>,
    #[serde(default)]
    pub score_severity: Option<String>,
    #[serde(default)]
    pub spo2_scale: Option<i32>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub is_partial: Option<bool>,
    #[serde(default)]
    pub empty_set: Option<bool>,
    #[serde(default)]
    pub ranking: Option<String>,
    #[serde(default)]
    pub monitoring_instruction: Option<String>,
    #[serde(default, with = "utc_datetime::option")]
    pub time_next_obs_set_due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub obx_reference_range: Option<String>,
    #[serde(default)]
    pub obx_abnormal_flags: Option<String>,
    #[serde(default)]
    pub mins_late: Option<i64>,
    pub observations: Vec<ObservationRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRequest {
    pub observation_type: String,
    #[serde(with = "utc_datetime")]
    pub measured_time: DateTime<Utc>,
    #[serde(default)]
    pub patient_refused: Option<bool>,
    #[serde(default)]
    pub score_value: Option<i32>,
    #[serde(default)]
    pub observation_value: Option<f64>,
    #[serde(default)]
    pub observation_string: Option<String>,
    #[serde(default)]
    pub observation_unit: Option<String>,
    #[serde(default)]
    pub observation_metadata: Option<ObservationMetadataRequest>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservationMetadataRequest {
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default)]
    pub mask_percent: Option<i32>,
    #[serde(default)]
    pub gcs_eyes: Option<i32>,
    #[serde(default)]
    pub gcs_eyes_description: Option<String>,
    #[serde(default)]
    pub gcs_verbal: Option<i32>,
    #[serde(default)]
    pub gcs_verbal_description: Option<String>,
    #[serde(default)]
    pub gcs_motor: Option<i32>,
    #[serde(default)]
    pub gcs_motor_description: Option<String>,
    #[serde(default)]
    pub patient_position: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl ObservationSetRequest {
    pub fn encounter_id(&self) -> Option<&str> {
        non_empty(&self.encounter_id)
    }

    pub fn patient_id(&self) -> Option<&str> {
        non_empty(&self.patient_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.observations.is_empty() {
            return Err(Error::validation("Observations should not be empty"));
        }
        if self.encounter_id().is_none() && self.patient_id().is_none() {
            return Err(Error::validation(
                "An encounter_id or patient_id is required to create an observation set",
            ));
        }
        for observation in &self.observations {
            observation.validate()?;
        }
        Ok(())
    }
}

impl ObservationRequest {
    pub fn validate(&self) -> Result<()> {
        if self.observation_type.is_empty() {
            return Err(Error::validation("observation_type must not be empty"));
        }
        ObservationRecord::check_value_exclusivity(
            self.observation_value,
            self.observation_string.as_deref(),
            self.patient_refused.unwrap_or(false),
        )
    }
}

/// Distinguishes an absent field (`None`) from an explicit null (`Some(None)`).
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Changes accepted by a patch. Identity fields (ids, record time, location)
/// cannot be patched; per observation only `score_value` can.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservationSetUpdate {
    #[serde(default)]
    pub score_value: Option<i32>,
    #[serde(default, deserialize_with = "nullable")]
    pub score_string: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub score_severity: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub spo2_scale: Option<Option<i32>>,
    #[serde(default)]
    pub is_partial: Option<bool>,
    #[serde(default)]
    pub empty_set: Option<bool>,
    #[serde(default)]
    pub ranking: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub obx_reference_range: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub obx_abnormal_flags: Option<Option<String>>,
    #[serde(default, with = "utc_datetime::option")]
    pub time_next_obs_set_due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub monitoring_instruction: Option<String>,
    #[serde(default)]
    pub observations: Vec<ObservationUpdate>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservationUpdate {
    #[serde(default)]
    pub observation_type: Option<String>,
    #[serde(default)]
    pub score_value: Option<i32>,
}

impl ObservationUpdate {
    /// Both the type and the new score are required.
    pub fn target(&self) -> Result<(&str, i32)> {
        match (self.observation_type.as_deref(), self.score_value) {
            (Some(observation_type), Some(score_value)) => Ok((observation_type, score_value)),
            _ => Err(Error::validation(
                "Observation object must contain both 'observation_type' and 'score_value'",
            )),
        }
    }
}

impl ObservationSetUpdate {
    /// Apply the top-level changes to `record`. Returns true when the due time
    /// of the next set moved, which invalidates the successor's lateness.
    pub fn apply_to(&self, record: &mut ObservationSetRecord) -> bool {
        if let Some(score_value) = self.score_value {
            record.score_value = Some(score_value);
        }
        if let Some(score_string) = &self.score_string {
            record.score_string = score_string.clone();
        }
        if let Some(score_severity) = &self.score_severity {
            record.score_severity = score_severity.clone();
        }
        if let Some(spo2_scale) = self.spo2_scale {
            record.spo2_scale = spo2_scale;
        }
        if let Some(is_partial) = self.is_partial {
            record.is_partial = Some(is_partial);
        }
        if let Some(empty_set) = self.empty_set {
            record.empty_set = Some(empty_set);
        }
        if let Some(ranking) = &self.ranking {
            record.ranking = Some(ranking.clone());
        }
        if let Some(range) = &self.obx_reference_range {
            record.obx_reference_range = range.clone();
        }
        if let Some(flags) = &self.obx_abnormal_flags {
            record.obx_abnormal_flags = flags.clone();
        }
        if let Some(instruction) = &self.monitoring_instruction {
            record.monitoring_instruction = Some(instruction.clone());
        }
        match self.time_next_obs_set_due {
            Some(due) if record.time_next_obs_set_due != Some(due) => {
                record.time_next_obs_set_due = Some(due);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: serde_json::Value) -> ObservationSetRequest {
        serde_json::from_value(body).unwrap()
    }

    fn spo2() -> serde_json::Value {
        json!({
            "observation_type": "spo2",
            "measured_time": "2019-01-08T00:00:00.000Z",
            "observation_value": 97
        })
    }

    #[test]
    fn either_identifier_is_enough() {
        let by_encounter = request(json!({
            "encounter_id": "e1",
            "record_time": "2019-01-08T00:00:00.000Z",
            "observations": [spo2()]
        }));
        assert!(by_encounter.validate().is_ok());

        let by_patient = request(json!({
            "patient_id": "p1",
            "record_time": "2019-01-08T00:00:00.000Z",
            "observations": [spo2()]
        }));
        assert!(by_patient.validate().is_ok());
    }

    #[test]
    fn missing_both_identifiers_fails() {
        let orphan = request(json!({
            "encounter_id": "",
            "record_time": "2019-01-08T00:00:00.000Z",
            "observations": [spo2()]
        }));
        assert!(matches!(orphan.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn empty_observations_fail() {
        let empty = request(json!({
            "encounter_id": "e1",
            "record_time": "2019-01-08T00:00:00.000Z",
            "observations": []
        }));
        assert!(matches!(empty.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn refused_observation_needs_no_value() {
        let refused = request(json!({
            "patient_id": "p1",
            "record_time": "2019-01-08T00:00:00.000Z",
            "observations": [{
                "observation_type": "temperature",
                "measured_time": "2019-01-08T00:00:00.000Z",
                "patient_refused": true
            }]
        }));
        assert!(refused.validate().is_ok());
    }

    #[test]
    fn explicit_null_differs_from_absent() {
        let update: ObservationSetUpdate =
            serde_json::from_value(json!({"score_value": 3, "score_string": null})).unwrap();
        assert_eq!(update.score_string, Some(None));
        assert_eq!(update.score_severity, None);
    }

    #[test]
    fn observation_update_requires_type_and_score() {
        let partial = ObservationUpdate {
            observation_type: Some("heart_rate".to_string()),
            score_value: None,
        };
        assert!(matches!(partial.target(), Err(Error::Validation(_))));
    }
}
