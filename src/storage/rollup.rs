//! Per-day, per-location, per-severity rollup of observation sets.
//!
//! The rollup is derived data. It is rebuilt wholesale from the observation
//! tables on an explicit refresh and never maintained incrementally.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::Tables;
use crate::model::ObservationSetRecord;

/// Vital-sign observation types tracked by the rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VitalSign {
    O2TherapyStatus,
    HeartRate,
    Spo2,
    Temperature,
    DiastolicBloodPressure,
    RespiratoryRate,
    ConsciousnessAcvpu,
    SystolicBloodPressure,
    NurseConcern,
}

impl VitalSign {
    pub const ALL: [VitalSign; 9] = [
        VitalSign::O2TherapyStatus,
        VitalSign::HeartRate,
        VitalSign::Spo2,
        VitalSign::Temperature,
        VitalSign::DiastolicBloodPressure,
        VitalSign::RespiratoryRate,
        VitalSign::ConsciousnessAcvpu,
        VitalSign::SystolicBloodPressure,
        VitalSign::NurseConcern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VitalSign::O2TherapyStatus => "o2_therapy_status",
            VitalSign::HeartRate => "heart_rate",
            VitalSign::Spo2 => "spo2",
            VitalSign::Temperature => "temperature",
            VitalSign::DiastolicBloodPressure => "diastolic_blood_pressure",
            VitalSign::RespiratoryRate => "respiratory_rate",
            VitalSign::ConsciousnessAcvpu => "consciousness_acvpu",
            VitalSign::SystolicBloodPressure => "systolic_blood_pressure",
            VitalSign::NurseConcern => "nurse_concern",
        }
    }

    pub fn from_observation_type(observation_type: &str) -> Option<Self> {
        VitalSign::ALL
            .iter()
            .copied()
            .find(|sign| sign.as_str() == observation_type)
    }

    /// Signs whose absence makes a set count towards `missing_obs`. Nurse
    /// concern is optional free text and does not.
    pub fn is_scored(&self) -> bool {
        !matches!(self, VitalSign::NurseConcern)
    }
}

/// Number of sets with at least one observation of each tracked type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VitalSignCounts {
    pub o2_therapy_status: u64,
    pub heart_rate: u64,
    pub spo2: u64,
    pub temperature: u64,
    pub diastolic_blood_pressure: u64,
    pub respiratory_rate: u64,
    pub consciousness_acvpu: u64,
    pub systolic_blood_pressure: u64,
    pub nurse_concern: u64,
}

impl VitalSignCounts {
    pub fn get(&self, sign: VitalSign) -> u64 {
        match sign {
            VitalSign::O2TherapyStatus => self.o2_therapy_status,
            VitalSign::HeartRate => self.heart_rate,
            VitalSign::Spo2 => self.spo2,
            VitalSign::Temperature => self.temperature,
            VitalSign::DiastolicBloodPressure => self.diastolic_blood_pressure,
            VitalSign::RespiratoryRate => self.respiratory_rate,
            VitalSign::ConsciousnessAcvpu => self.consciousness_acvpu,
            VitalSign::SystolicBloodPressure => self.systolic_blood_pressure,
            VitalSign::NurseConcern => self.nurse_concern,
        }
    }

    pub fn get_mut(&mut self, sign: VitalSign) -> &mut u64 {
        match sign {
            VitalSign::O2TherapyStatus => &mut self.o2_therapy_status,
            VitalSign::HeartRate => &mut self.heart_rate,
            VitalSign::Spo2 => &mut self.spo2,
            VitalSign::Temperature => &mut self.temperature,
            VitalSign::DiastolicBloodPressure => &mut self.diastolic_blood_pressure,
            VitalSign::RespiratoryRate => &mut self.respiratory_rate,
            VitalSign::ConsciousnessAcvpu => &mut self.consciousness_acvpu,
            VitalSign::SystolicBloodPressure => &mut self.systolic_blood_pressure,
            VitalSign::NurseConcern => &mut self.nurse_concern,
        }
    }
}

/// Fifteen-minute lateness interval relative to when a set was due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatenessInterval {
    Minus60,
    Minus45To59,
    Minus30To44,
    Minus15To29,
    Minus0To14,
    Plus1To15,
    Plus16To30,
    Plus31To45,
    Plus46To60,
    Plus61To75,
    Plus76To90,
    Plus91To105,
    Plus106To120,
    Plus121To135,
    Plus136To150,
    Plus151To165,
    Plus166To180,
    Plus180,
}

impl LatenessInterval {
    pub const ALL: [LatenessInterval; 18] = [
        LatenessInterval::Minus60,
        LatenessInterval::Minus45To59,
        LatenessInterval::Minus30To44,
        LatenessInterval::Minus15To29,
        LatenessInterval::Minus0To14,
        LatenessInterval::Plus1To15,
        LatenessInterval::Plus16To30,
        LatenessInterval::Plus31To45,
        LatenessInterval::Plus46To60,
        LatenessInterval::Plus61To75,
        LatenessInterval::Plus76To90,
        LatenessInterval::Plus91To105,
        LatenessInterval::Plus106To120,
        LatenessInterval::Plus121To135,
        LatenessInterval::Plus136To150,
        LatenessInterval::Plus151To165,
        LatenessInterval::Plus166To180,
        LatenessInterval::Plus180,
    ];

    /// Buckets are closed on the right: (-60, -45], ..., (165, 180].
    pub fn from_mins_late(mins_late: i64) -> Self {
        if mins_late <= -60 {
            return LatenessInterval::Minus60;
        }
        if mins_late > 180 {
            return LatenessInterval::Plus180;
        }
        // -59..=180 maps onto indices 1..=16 in steps of 15, with (-15, 0] at 4.
        let steps = (mins_late + 60 + 14).div_euclid(15);
        LatenessInterval::ALL[steps as usize]
    }
}

/// Counters for each lateness interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LatenessBuckets {
    pub minus60: u64,
    pub minus45_59: u64,
    pub minus30_44: u64,
    pub minus15_29: u64,
    pub minus0_14: u64,
    pub plus1_15: u64,
    pub plus16_30: u64,
    pub plus31_45: u64,
    pub plus46_60: u64,
    pub plus61_75: u64,
    pub plus76_90: u64,
    pub plus91_105: u64,
    pub plus106_120: u64,
    pub plus121_135: u64,
    pub plus136_150: u64,
    pub plus151_165: u64,
    pub plus166_180: u64,
    pub plus180: u64,
}

impl LatenessBuckets {
    pub fn get_mut(&mut self, interval: LatenessInterval) -> &mut u64 {
        match interval {
            LatenessInterval::Minus60 => &mut self.minus60,
            LatenessInterval::Minus45To59 => &mut self.minus45_59,
            LatenessInterval::Minus30To44 => &mut self.minus30_44,
            LatenessInterval::Minus15To29 => &mut self.minus15_29,
            LatenessInterval::Minus0To14 => &mut self.minus0_14,
            LatenessInterval::Plus1To15 => &mut self.plus1_15,
            LatenessInterval::Plus16To30 => &mut self.plus16_30,
            LatenessInterval::Plus31To45 => &mut self.plus31_45,
            LatenessInterval::Plus46To60 => &mut self.plus46_60,
            LatenessInterval::Plus61To75 => &mut self.plus61_75,
            LatenessInterval::Plus76To90 => &mut self.plus76_90,
            LatenessInterval::Plus91To105 => &mut self.plus91_105,
            LatenessInterval::Plus106To120 => &mut self.plus106_120,
            LatenessInterval::Plus121To135 => &mut self.plus121_135,
            LatenessInterval::Plus136To150 => &mut self.plus136_150,
            LatenessInterval::Plus151To165 => &mut self.plus151_165,
            LatenessInterval::Plus166To180 => &mut self.plus166_180,
            LatenessInterval::Plus180 => &mut self.plus180,
        }
    }

    pub fn record(&mut self, mins_late: i64) {
        *self.get_mut(LatenessInterval::from_mins_late(mins_late)) += 1;
    }

    pub fn get(&self, interval: LatenessInterval) -> u64 {
        match interval {
            LatenessInterval::Minus60 => self.minus60,
            LatenessInterval::Minus45To59 => self.minus45_59,
            LatenessInterval::Minus30To44 => self.minus30_44,
            LatenessInterval::Minus15To29 => self.minus15_29,
            LatenessInterval::Minus0To14 => self.minus0_14,
            LatenessInterval::Plus1To15 => self.plus1_15,
            LatenessInterval::Plus16To30 => self.plus16_30,
            LatenessInterval::Plus31To45 => self.plus31_45,
            LatenessInterval::Plus46To60 => self.plus46_60,
            LatenessInterval::Plus61To75 => self.plus61_75,
            LatenessInterval::Plus76To90 => self.plus76_90,
            LatenessInterval::Plus91To105 => self.plus91_105,
            LatenessInterval::Plus106To120 => self.plus106_120,
            LatenessInterval::Plus121To135 => self.plus121_135,
            LatenessInterval::Plus136To150 => self.plus136_150,
            LatenessInterval::Plus151To165 => self.plus151_165,
            LatenessInterval::Plus166To180 => self.plus166_180,
            LatenessInterval::Plus180 => self.plus180,
        }
    }

    pub fn add(&mut self, other: &LatenessBuckets) {
        for interval in LatenessInterval::ALL {
            *self.get_mut(interval) += other.get(interval);
        }
    }
}

/// One rollup row, keyed by `(record_day, location_id, score_severity)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateObservationSets {
    pub record_day: NaiveDate,
    pub location_id: Option<String>,
    pub score_severity: Option<String>,
    pub all_obs_sets: u64,
    pub late_obs_sets: u64,
    pub missing_obs: u64,
    #[serde(flatten)]
    pub present: VitalSignCounts,
    #[serde(flatten)]
    pub intervals: LatenessBuckets,
}

impl AggregateObservationSets {
    pub fn new(record_day: NaiveDate, location_id: Option<String>, score_severity: Option<String>) -> Self {
        AggregateObservationSets {
            record_day,
            location_id,
            score_severity,
            all_obs_sets: 0,
            late_obs_sets: 0,
            missing_obs: 0,
            present: VitalSignCounts::default(),
            intervals: LatenessBuckets::default(),
        }
    }

    pub fn on_time_obs_sets(&self) -> u64 {
        self.all_obs_sets.saturating_sub(self.late_obs_sets)
    }

    /// Sets in this row lacking an observation of `sign`.
    pub fn missing(&self, sign: VitalSign) -> u64 {
        self.all_obs_sets.saturating_sub(self.present.get(sign))
    }

    fn add_set(&mut self, set: &ObservationSetRecord, present: &HashSet<VitalSign>) {
        self.all_obs_sets += 1;
        if let Some(mins_late) = set.mins_late {
            if mins_late > 0 {
                self.late_obs_sets += 1;
            }
            self.intervals.record(mins_late);
        }
        for sign in present {
            *self.present.get_mut(*sign) += 1;
        }
        let scored_missing = VitalSign::ALL
            .iter()
            .any(|sign| sign.is_scored() && !present.contains(sign));
        if scored_missing {
            self.missing_obs += 1;
        }
    }
}

/// Filter applied when reading rollup rows. Days are inclusive at both ends.
#[derive(Debug, Clone)]
pub struct RollupQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// `None` reads every location, including rows with no location.
    pub locations: Option<Vec<String>>,
}

impl RollupQuery {
    pub fn matches(&self, row: &AggregateObservationSets) -> bool {
        if row.record_day < self.from || row.record_day > self.to {
            return false;
        }
        match (&self.locations, &row.location_id) {
            (None, _) => true,
            (Some(locations), Some(location)) => locations.contains(location),
            (Some(_), None) => false,
        }
    }
}

type RollupKey = (NaiveDate, Option<String>, Option<String>);

/// Rebuild every rollup row from the current tables, ordered by day.
pub(crate) fn build(tables: &Tables) -> Vec<AggregateObservationSets> {
    let mut rows: BTreeMap<RollupKey, AggregateObservationSets> = BTreeMap::new();

    for set in tables.observation_sets.values() {
        let present: HashSet<VitalSign> = tables
            .observation_ids_for(&set.uuid)
            .iter()
            .filter_map(|id| tables.observations.get(id))
            .filter_map(|o| VitalSign::from_observation_type(&o.observation_type))
            .collect();

        let key = (
            set.record_time.date_naive(),
            set.location.clone(),
            set.score_severity.clone(),
        );
        rows.entry(key.clone())
            .or_insert_with(|| AggregateObservationSets::new(key.0, key.1, key.2))
            .add_set(set, &present);
    }

    rows.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_edges_match_the_closed_right_buckets() {
        use LatenessInterval::*;
        let cases = [
            (-500, Minus60),
            (-60, Minus60),
            (-59, Minus45To59),
            (-45, Minus45To59),
            (-44, Minus30To44),
            (-30, Minus30To44),
            (-16, Minus15To29),
            (-15, Minus15To29),
            (-14, Minus0To14),
            (0, Minus0To14),
            (1, Plus1To15),
            (15, Plus1To15),
            (16, Plus16To30),
            (80, Plus76To90),
            (165, Plus151To165),
            (166, Plus166To180),
            (180, Plus166To180),
            (181, Plus180),
        ];
        for (mins_late, expected) in cases {
            assert_eq!(LatenessInterval::from_mins_late(mins_late), expected, "{}", mins_late);
        }
    }

    #[test]
    fn bucket_addition_is_field_wise() {
        let mut a = LatenessBuckets::default();
        a.record(-70);
        a.record(10);
        let mut b = LatenessBuckets::default();
        b.record(10);
        b.record(200);
        a.add(&b);
        assert_eq!(a.minus60, 1);
        assert_eq!(a.plus1_15, 2);
        assert_eq!(a.plus180, 1);
    }

    #[test]
    fn query_without_locations_includes_unassigned_rows() {
        let day = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let row = AggregateObservationSets::new(day, None, Some("low".to_string()));
        let everywhere = RollupQuery { from: day, to: day, locations: None };
        let ward = RollupQuery { from: day, to: day, locations: Some(vec!["ward".to_string()]) };
        assert!(everywhere.matches(&row));
        assert!(!ward.matches(&row));
    }
}
