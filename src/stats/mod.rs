//! Aggregation engine
//!
//! Reporting views over the aggregate rollup. The rollup only changes on an
//! explicit `refresh`, which scans the full observation history and is meant
//! to be driven by an external scheduler.

pub mod functions;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::storage::{AggregateObservationSets, RollupQuery, StorageEngine};
pub use functions::{
    IntervalStats, MissingStats, MonthlyCounters, OnTimeStats, RollupFunctions, SeverityBand,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub time_taken: String,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct AggregationEngine {
    storage: Arc<StorageEngine>,
}

impl AggregationEngine {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        AggregationEngine { storage }
    }

    /// Rebuild the rollup from the current observation tables.
    pub fn refresh(&self) -> Result<RefreshReport> {
        let started = Instant::now();
        let rows = self.storage.refresh_rollup()?;
        let time_taken = format!("{:.3} seconds", started.elapsed().as_secs_f64());
        info!(rows, %time_taken, "aggregate observation sets refreshed");
        Ok(RefreshReport { time_taken, rows })
    }

    fn rows(&self, from: NaiveDate, to: NaiveDate, locations: Option<&[String]>) -> Result<Vec<AggregateObservationSets>> {
        if from > to {
            return Err(Error::validation(format!(
                "Start date {} must not be after end date {}",
                from, to
            )));
        }
        let query = RollupQuery {
            from,
            to,
            locations: locations.map(<[String]>::to_vec),
        };
        Ok(self.storage.select_rollup(&query)?)
    }

    pub fn on_time_stats(&self, from: NaiveDate, to: NaiveDate, locations: &[String]) -> Result<OnTimeStats> {
        Ok(RollupFunctions::on_time(&self.rows(from, to, Some(locations))?))
    }

    pub fn missing_stats(&self, from: NaiveDate, to: NaiveDate, locations: &[String]) -> Result<MissingStats> {
        Ok(RollupFunctions::missing(&self.rows(from, to, Some(locations))?))
    }

    pub fn lateness_intervals(&self, from: NaiveDate, to: NaiveDate, locations: &[String]) -> Result<IntervalStats> {
        Ok(RollupFunctions::intervals(&self.rows(from, to, Some(locations))?))
    }

    /// Month-by-month counters for `locations`; an empty list reads every
    /// location.
    pub fn monthly_trends(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        locations: &[String],
    ) -> Result<BTreeMap<String, MonthlyCounters>> {
        let filter = (!locations.is_empty()).then_some(locations);
        Ok(RollupFunctions::monthly(&self.rows(from, to, filter)?))
    }

    pub fn monthly_trends_by_location(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<BTreeMap<String, BTreeMap<String, MonthlyCounters>>> {
        Ok(RollupFunctions::monthly_by_location(&self.rows(from, to, None)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObservationSetRecord;
    use crate::test_support::{observation, set_for_encounter, ts};
    use crate::storage::VitalSign;

    const ALL_SIGNS: [&str; 9] = [
        "o2_therapy_status",
        "heart_rate",
        "spo2",
        "temperature",
        "diastolic_blood_pressure",
        "respiratory_rate",
        "consciousness_acvpu",
        "systolic_blood_pressure",
        "nurse_concern",
    ];

    fn insert(storage: &StorageEngine, set: ObservationSetRecord, types: &[&str]) {
        let observations = types.iter().map(|t| observation(&set, t)).collect();
        let mut tx = storage.begin().unwrap();
        tx.bulk_insert(set, observations, Vec::new()).unwrap();
        tx.commit().unwrap();
    }

    fn located(at: &str, location: Option<&str>, severity: &str, mins_late: Option<i64>) -> ObservationSetRecord {
        let mut set = set_for_encounter("e1", ts(at));
        set.location = location.map(str::to_string);
        set.score_severity = Some(severity.to_string());
        set.mins_late = mins_late;
        set
    }

    fn day(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn refresh_rebuilds_rollup_from_sets() {
        let storage = Arc::new(StorageEngine::in_memory());
        insert(&storage, located("2021-01-01T08:00:00Z", Some("ward"), "low", Some(0)), &ALL_SIGNS);
        insert(&storage, located("2021-01-01T12:00:00Z", Some("ward"), "low", Some(20)), &ALL_SIGNS[..8]);
        insert(&storage, located("2021-01-01T16:00:00Z", Some("ward"), "low", None), &["heart_rate"]);
        insert(&storage, located("2021-01-02T08:00:00Z", Some("ward"), "high", Some(-70)), &ALL_SIGNS);

        let engine = AggregationEngine::new(Arc::clone(&storage));
        // Nothing is visible before the first refresh.
        assert_eq!(engine.on_time_stats(day("2021-01-01"), day("2021-01-02"), &["ward".to_string()]).unwrap(),
            OnTimeStats::default());

        let report = engine.refresh().unwrap();
        assert_eq!(report.rows, 2);
        assert!(report.time_taken.ends_with(" seconds"));

        let rows = storage
            .select_rollup(&RollupQuery { from: day("2021-01-01"), to: day("2021-01-01"), locations: None })
            .unwrap();
        let low = &rows[0];
        assert_eq!(low.all_obs_sets, 3);
        assert_eq!(low.late_obs_sets, 1);
        // Nurse concern alone does not count towards missing_obs.
        assert_eq!(low.missing_obs, 1);
        assert_eq!(low.present.heart_rate, 3);
        assert_eq!(low.missing(VitalSign::NurseConcern), 2);
        assert_eq!(low.intervals.minus0_14, 1);
        assert_eq!(low.intervals.plus16_30, 1);

        let stats = engine
            .on_time_stats(day("2021-01-01"), day("2021-01-02"), &["ward".to_string()])
            .unwrap();
        assert_eq!((stats.counts.on_time, stats.counts.late), (3, 1));

        let intervals = engine
            .lateness_intervals(day("2021-01-02"), day("2021-01-02"), &["ward".to_string()])
            .unwrap();
        assert_eq!(intervals.risk["high"].minus60, 1);
    }

    #[test]
    fn location_filters_and_date_validation() {
        let storage = Arc::new(StorageEngine::in_memory());
        insert(&storage, located("2021-03-01T08:00:00Z", Some("ward"), "low", Some(0)), &ALL_SIGNS);
        insert(&storage, located("2021-03-01T09:00:00Z", None, "medium", Some(5)), &ALL_SIGNS);
        let engine = AggregationEngine::new(Arc::clone(&storage));
        engine.refresh().unwrap();

        let missing = engine
            .missing_stats(day("2021-03-01"), day("2021-03-31"), &["ward".to_string()])
            .unwrap();
        assert_eq!(missing.totals.total_obs_sets, 1);

        let everywhere = engine.monthly_trends(day("2021-03-01"), day("2021-03-31"), &[]).unwrap();
        assert_eq!(everywhere["2021-03"].all_obs_sets, 2);

        let by_location = engine.monthly_trends_by_location(day("2021-03-01"), day("2021-03-31")).unwrap();
        assert_eq!(by_location["unassigned"]["2021-03"].medium, 1);

        assert!(matches!(
            engine.monthly_trends(day("2021-04-01"), day("2021-03-01"), &[]),
            Err(Error::Validation(_))
        ));
    }
}
