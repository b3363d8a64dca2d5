use std::collections::BTreeMap;

use serde::Serialize;

use crate::storage::{AggregateObservationSets, LatenessBuckets, VitalSign, VitalSignCounts};

/// Map key for rollup rows recorded without a location.
pub const UNASSIGNED_LOCATION: &str = "unassigned";
/// Map key for rollup rows without a score severity.
pub const NO_SEVERITY: &str = "none";

fn location_key(row: &AggregateObservationSets) -> String {
    row.location_id
        .clone()
        .unwrap_or_else(|| UNASSIGNED_LOCATION.to_string())
}

fn severity_key(row: &AggregateObservationSets) -> String {
    row.score_severity
        .clone()
        .unwrap_or_else(|| NO_SEVERITY.to_string())
}

/// On-time and late set counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OnTimeCounts {
    pub on_time: u64,
    pub late: u64,
}

impl OnTimeCounts {
    fn add(&mut self, row: &AggregateObservationSets) {
        self.on_time += row.on_time_obs_sets();
        self.late += row.late_obs_sets;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DateOnTime {
    #[serde(flatten)]
    pub counts: OnTimeCounts,
    pub risk: BTreeMap<String, OnTimeCounts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationOnTime {
    #[serde(flatten)]
    pub counts: OnTimeCounts,
    pub risk: BTreeMap<String, OnTimeCounts>,
    pub date: BTreeMap<String, DateOnTime>,
}

/// Grand totals and per-severity totals, with each location's breakdown
/// keyed by location id alongside them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OnTimeStats {
    #[serde(flatten)]
    pub counts: OnTimeCounts,
    pub risk: BTreeMap<String, OnTimeCounts>,
    #[serde(flatten)]
    pub locations: BTreeMap<String, LocationOnTime>,
}

/// Missing-observation counts over a group of sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MissingCounts {
    pub total_obs_sets: u64,
    pub num_obs_missing: u64,
    pub o2_therapy_status_missing: u64,
    pub heart_rate_missing: u64,
    pub spo2_missing: u64,
    pub temperature_missing: u64,
    pub diastolic_blood_pressure_missing: u64,
    pub respiratory_rate_missing: u64,
    pub consciousness_acvpu_missing: u64,
    pub systolic_blood_pressure_missing: u64,
    pub nurse_concern_missing: u64,
}

impl MissingCounts {
    fn missing_mut(&mut self, sign: VitalSign) -> &mut u64 {
        match sign {
            VitalSign::O2TherapyStatus => &mut self.o2_therapy_status_missing,
            VitalSign::HeartRate => &mut self.heart_rate_missing,
            VitalSign::Spo2 => &mut self.spo2_missing,
            VitalSign::Temperature => &mut self.temperature_missing,
            VitalSign::DiastolicBloodPressure => &mut self.diastolic_blood_pressure_missing,
            VitalSign::RespiratoryRate => &mut self.respiratory_rate_missing,
            VitalSign::ConsciousnessAcvpu => &mut self.consciousness_acvpu_missing,
            VitalSign::SystolicBloodPressure => &mut self.systolic_blood_pressure_missing,
            VitalSign::NurseConcern => &mut self.nurse_concern_missing,
        }
    }

    fn add(&mut self, row: &AggregateObservationSets) {
        self.total_obs_sets += row.all_obs_sets;
        self.num_obs_missing += row.missing_obs;
        for sign in VitalSign::ALL {
            *self.missing_mut(sign) += row.missing(sign);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MissingStats {
    #[serde(flatten)]
    pub totals: MissingCounts,
    #[serde(flatten)]
    pub locations: BTreeMap<String, MissingCounts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationIntervals {
    pub risk: BTreeMap<String, LatenessBuckets>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntervalStats {
    pub risk: BTreeMap<String, LatenessBuckets>,
    #[serde(flatten)]
    pub locations: BTreeMap<String, LocationIntervals>,
}

/// Severity bands counted by the monthly report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverityBand {
    Low,
    LowMedium,
    Medium,
    High,
}

impl SeverityBand {
    /// Rollup rows carry the external hyphenated label (`low-medium`).
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "low" => Some(SeverityBand::Low),
            "low-medium" | "low_medium" => Some(SeverityBand::LowMedium),
            "medium" => Some(SeverityBand::Medium),
            "high" => Some(SeverityBand::High),
            _ => None,
        }
    }
}

/// Named counters for one month of the monthly report. The per-sign fields
/// count sets missing that sign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonthlyCounters {
    pub all_obs_sets: u64,
    pub on_time: u64,
    pub low: u64,
    pub low_medium: u64,
    pub medium: u64,
    pub high: u64,
    pub missing_obs: u64,
    #[serde(flatten)]
    pub missing: VitalSignCounts,
}

impl MonthlyCounters {
    fn band_mut(&mut self, band: SeverityBand) -> &mut u64 {
        match band {
            SeverityBand::Low => &mut self.low,
            SeverityBand::LowMedium => &mut self.low_medium,
            SeverityBand::Medium => &mut self.medium,
            SeverityBand::High => &mut self.high,
        }
    }

    fn add(&mut self, row: &AggregateObservationSets) {
        self.all_obs_sets += row.all_obs_sets;
        self.on_time += row.on_time_obs_sets();
        if let Some(band) = row.score_severity.as_deref().and_then(SeverityBand::from_label) {
            *self.band_mut(band) += row.all_obs_sets;
        }
        self.missing_obs += row.missing_obs;
        for sign in VitalSign::ALL {
            *self.missing.get_mut(sign) += row.missing(sign);
        }
    }
}

fn month_key(row: &AggregateObservationSets) -> String {
    row.record_day.format("%Y-%m").to_string()
}

/// Folds rollup rows into the report structures.
pub struct RollupFunctions;

impl RollupFunctions {
    pub fn on_time(rows: &[AggregateObservationSets]) -> OnTimeStats {
        let mut stats = OnTimeStats::default();
        for row in rows {
            let severity = severity_key(row);
            stats.counts.add(row);
            stats.risk.entry(severity.clone()).or_default().add(row);

            let location = stats.locations.entry(location_key(row)).or_default();
            location.counts.add(row);
            location.risk.entry(severity.clone()).or_default().add(row);

            let day = location
                .date
                .entry(row.record_day.format("%Y-%m-%d").to_string())
                .or_default();
            day.counts.add(row);
            day.risk.entry(severity).or_default().add(row);
        }
        stats
    }

    pub fn missing(rows: &[AggregateObservationSets]) -> MissingStats {
        let mut stats = MissingStats::default();
        for row in rows {
            stats.totals.add(row);
            stats.locations.entry(location_key(row)).or_default().add(row);
        }
        stats
    }

    pub fn intervals(rows: &[AggregateObservationSets]) -> IntervalStats {
        let mut stats = IntervalStats::default();
        for row in rows {
            let severity = severity_key(row);
            stats.risk.entry(severity.clone()).or_default().add(&row.intervals);
            stats
                .locations
                .entry(location_key(row))
                .or_default()
                .risk
                .entry(severity)
                .or_default()
                .add(&row.intervals);
        }
        stats
    }

    pub fn monthly(rows: &[AggregateObservationSets]) -> BTreeMap<String, MonthlyCounters> {
        let mut months: BTreeMap<String, MonthlyCounters> = BTreeMap::new();
        for row in rows {
            months.entry(month_key(row)).or_default().add(row);
        }
        months
    }

    pub fn monthly_by_location(
        rows: &[AggregateObservationSets],
    ) -> BTreeMap<String, BTreeMap<String, MonthlyCounters>> {
        let mut locations: BTreeMap<String, BTreeMap<String, MonthlyCounters>> = BTreeMap::new();
        for row in rows {
            locations
                .entry(location_key(row))
                .or_default()
                .entry(month_key(row))
                .or_default()
                .add(row);
        }
        locations
    }
}
