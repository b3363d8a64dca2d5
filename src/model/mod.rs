//! Observation-set data model
//!
//! Row types as held by the store, plus the joined shapes the store hands back
//! to the query layer. Inbound payloads live in `request`, API projections in
//! `response`.

pub mod request;
pub mod response;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::timestamps::utc_datetime;

/// Creation and modification stamps carried by every row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    #[serde(with = "utc_datetime")]
    pub created: DateTime<Utc>,
    pub created_by: String,
    #[serde(with = "utc_datetime")]
    pub modified: DateTime<Utc>,
    pub modified_by: String,
}

impl Audit {
    pub fn new(actor_id: &str, at: DateTime<Utc>) -> Self {
        Audit {
            created: at,
            created_by: actor_id.to_string(),
            modified: at,
            modified_by: actor_id.to_string(),
        }
    }

    pub fn touch(&mut self, actor_id: &str, at: DateTime<Utc>) {
        self.modified = at;
        self.modified_by = actor_id.to_string();
    }
}

/// One clinical recording episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationSetRecord {
    pub uuid: Uuid,
    #[serde(flatten)]
    pub audit: Audit,
    pub encounter_id: Option<String>,
    pub patient_id: Option<String>,
    #[serde(with = "utc_datetime")]
    pub record_time: DateTime<Utc>,
    pub score_system: Option<String>,
    pub score_value: Option<i32>,
    pub score_string: Option<String>,
    pub score_severity: Option<String>,
    pub spo2_scale: Option<i32>,
    pub location: Option<String>,
    pub is_partial: Option<bool>,
    pub empty_set: Option<bool>,
    pub ranking: Option<String>,
    pub monitoring_instruction: Option<String>,
    #[serde(default, with = "utc_datetime::option")]
    pub time_next_obs_set_due: Option<DateTime<Utc>>,
    // Only populated from ORU messages.
    pub obx_reference_range: Option<String>,
    pub obx_abnormal_flags: Option<String>,
    /// Derived by the lateness calculator; `None` until computed.
    pub mins_late: Option<i64>,
}

/// One measured or scored vital sign within a set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub uuid: Uuid,
    pub observation_set_uuid: Uuid,
    #[serde(flatten)]
    pub audit: Audit,
    pub observation_type: String,
    #[serde(with = "utc_datetime")]
    pub measured_time: DateTime<Utc>,
    pub patient_refused: Option<bool>,
    pub score_value: Option<i32>,
    pub observation_value: Option<f64>,
    pub observation_string: Option<String>,
    pub observation_unit: Option<String>,
}

impl ObservationRecord {
    /// Exactly one of value/string must be present unless the patient refused,
    /// in which case both may be absent.
    pub fn check_value_exclusivity(
        observation_value: Option<f64>,
        observation_string: Option<&str>,
        patient_refused: bool,
    ) -> Result<()> {
        match (observation_value, observation_string) {
            (Some(_), Some(_)) => Err(Error::validation(
                "observation must contain 'observation_value' or 'observation_string', not both",
            )),
            (None, None) if !patient_refused => Err(Error::validation(
                "observation must contain either 'observation_value' or 'observation_string'",
            )),
            _ => Ok(()),
        }
    }
}

/// Mask, GCS and position details for specific observation types.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservationMetadataRecord {
    pub uuid: Uuid,
    pub observation_uuid: Uuid,
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

/// An observation joined with its metadata row, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedObservation {
    pub observation: ObservationRecord,
    pub metadata: Option<ObservationMetadataRecord>,
}

/// An observation set joined with its observations, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedObservationSet {
    pub set: ObservationSetRecord,
    pub observations: Vec<LoadedObservation>,
}

impl LoadedObservationSet {
    /// The last observation of `observation_type` in insertion order.
    pub fn observation_of_type(&self, observation_type: &str) -> Option<&LoadedObservation> {
        self.observations
            .iter()
            .rfind(|o| o.observation.observation_type == observation_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_or_string_but_not_both() {
        assert!(ObservationRecord::check_value_exclusivity(Some(1.0), None, false).is_ok());
        assert!(ObservationRecord::check_value_exclusivity(None, Some("Alert"), false).is_ok());
        assert!(matches!(
            ObservationRecord::check_value_exclusivity(Some(1.0), Some("Alert"), false),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            ObservationRecord::check_value_exclusivity(None, None, false),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn refusal_allows_an_empty_observation() {
        assert!(ObservationRecord::check_value_exclusivity(None, None, true).is_ok());
        // Refusal does not relax the "not both" rule.
        assert!(ObservationRecord::check_value_exclusivity(Some(1.0), Some("x"), true).is_err());
    }
}
