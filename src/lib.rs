//! vitalsdb: observation-set storage for early-warning scoring
//!
//! vitalsdb records vital-sign observation sets, keeps each encounter's
//! "minutes late" figures consistent as sets arrive in any order, and rolls
//! the history up into on-time, missing-observation and monthly reports.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod observations;
pub mod query;
pub mod stats;
pub mod storage;
pub mod timestamps;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};
pub use observations::{LatenessCalculator, ObservationService, ObservationStore};
pub use query::QueryEngine;
pub use stats::AggregationEngine;
pub use storage::StorageEngine;
