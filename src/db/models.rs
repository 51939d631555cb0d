//! Database row types.

use crate::model::{Labels, Timestamp};

/// A stored series identity.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    pub id: i64,
    pub labels: Labels,
}

/// Per-series sample count, used for head statistics.
#[derive(Debug, Clone)]
pub struct SeriesCount {
    pub labels: Labels,
    pub samples: u64,
}

/// A time partition of the sample table, reported as a block.
#[derive(Debug, Clone)]
pub struct DayPartition {
    pub day: i64,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub num_samples: u64,
    pub num_series: u64,
}
