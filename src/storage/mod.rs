//! Storage contracts consumed by the gateway.
//!
//! The gateway only ever sees these traits. [`crate::db::Store`] is the
//! bundled implementation.

mod merge;

pub use merge::*;

use crate::context::{Context, ContextError};
use crate::model::{
    serialize_float_str, serialize_unix_seconds, Annotations, Labels, Matcher, Series, Timestamp,
};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("TSDB not ready")]
    NotReady,
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("database error: {0}")]
    Db(String),
    #[error("{0}")]
    Other(String),
}

impl From<ContextError> for StorageError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Canceled => StorageError::Canceled,
            ContextError::DeadlineExceeded => StorageError::DeadlineExceeded,
        }
    }
}

/// Hints passed to `select` so storage can prune early.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectHints {
    pub start: Timestamp,
    pub end: Timestamp,
    /// Query step in milliseconds, 0 for instant queries.
    pub step: i64,
    /// Maximum number of series wanted, 0 for no limit.
    pub limit: usize,
    pub func: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelHints {
    pub limit: usize,
}

/// A stream of series, in label order when requested sorted.
pub trait SeriesSet: Iterator<Item = Result<Series, StorageError>> + Send {
    fn warnings(&self) -> Annotations;
}

/// A fully materialised series set.
pub struct VecSeriesSet {
    series: std::vec::IntoIter<Series>,
    warnings: Annotations,
}

impl VecSeriesSet {
    pub fn new(series: Vec<Series>, warnings: Annotations) -> Self {
        Self {
            series: series.into_iter(),
            warnings,
        }
    }
}

impl Iterator for VecSeriesSet {
    type Item = Result<Series, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.series.next().map(Ok)
    }
}

impl SeriesSet for VecSeriesSet {
    fn warnings(&self) -> Annotations {
        self.warnings.clone()
    }
}

/// Opens time-bounded read views.
#[async_trait]
pub trait Queryable: Send + Sync {
    async fn querier(&self, mint: Timestamp, maxt: Timestamp) -> Result<Box<dyn Querier>, StorageError>;
}

/// A read view over `[mint, maxt]`. Must be closed exactly once.
#[async_trait]
pub trait Querier: Send + Sync {
    async fn label_names(
        &self,
        ctx: &Context,
        hints: &LabelHints,
        matchers: &[Matcher],
    ) -> Result<(Vec<String>, Annotations), StorageError>;

    async fn label_values(
        &self,
        ctx: &Context,
        name: &str,
        hints: &LabelHints,
        matchers: &[Matcher],
    ) -> Result<(Vec<String>, Annotations), StorageError>;

    async fn select(
        &self,
        ctx: &Context,
        sorted: bool,
        hints: &SelectHints,
        matchers: &[Matcher],
    ) -> Result<Box<dyn SeriesSet>, StorageError>;

    fn close(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exemplar {
    pub labels: Labels,
    #[serde(serialize_with = "serialize_float_str")]
    pub value: f64,
    #[serde(serialize_with = "serialize_unix_seconds")]
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExemplarQueryResult {
    #[serde(rename = "seriesLabels")]
    pub series_labels: Labels,
    pub exemplars: Vec<Exemplar>,
}

#[async_trait]
pub trait ExemplarQueryable: Send + Sync {
    /// Exemplars in `[start, end]` of series matching any matcher set.
    async fn select_exemplars(
        &self,
        ctx: &Context,
        start: Timestamp,
        end: Timestamp,
        matcher_sets: &[Vec<Matcher>],
    ) -> Result<Vec<ExemplarQueryResult>, StorageError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadStats {
    pub num_series: u64,
    pub num_label_pairs: u64,
    pub chunk_count: u64,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
}

/// A single cardinality entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stat {
    pub name: String,
    pub value: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TsdbStats {
    pub head_stats: HeadStats,
    pub series_count_by_metric_name: Vec<Stat>,
    pub label_value_count_by_label_name: Vec<Stat>,
    pub memory_in_bytes_by_label_name: Vec<Stat>,
    pub series_count_by_label_value_pair: Vec<Stat>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub num_samples: u64,
    pub num_series: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub ulid: String,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub stats: BlockStats,
    pub version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WalReplayStatus {
    pub min: i64,
    pub max: i64,
    pub current: i64,
}

/// Administrative and introspection operations on the store.
#[async_trait]
pub trait TsdbAdmin: Send + Sync {
    async fn clean_tombstones(&self) -> Result<(), StorageError>;

    async fn delete(
        &self,
        ctx: &Context,
        mint: Timestamp,
        maxt: Timestamp,
        matchers: &[Matcher],
    ) -> Result<(), StorageError>;

    /// Write a consistent copy of the store into `dir`, which already exists.
    async fn snapshot(&self, dir: &Path, with_head: bool) -> Result<(), StorageError>;

    /// Head statistics plus the top `limit` entries of each cardinality list.
    async fn stats(&self, limit: usize) -> Result<TsdbStats, StorageError>;

    async fn wal_replay_status(&self) -> Result<WalReplayStatus, StorageError>;

    async fn block_metas(&self) -> Result<Vec<BlockMeta>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sample;

    #[test]
    fn test_vec_series_set() {
        let s = Series {
            labels: [("job", "x")].into_iter().collect(),
            samples: vec![Sample::new(0, 1.0)],
        };
        let mut warnings = Annotations::new();
        warnings.warn("partial");
        let mut set = VecSeriesSet::new(vec![s.clone()], warnings);

        assert_eq!(set.next(), Some(Ok(s)));
        assert_eq!(set.next(), None);
        assert_eq!(set.warnings().len(), 1);
    }

    #[test]
    fn test_exemplar_rendering() {
        let e = Exemplar {
            labels: [("trace_id", "abc")].into_iter().collect(),
            value: 6.0,
            timestamp: 1_600_096_945_479,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["value"], "6");
        assert_eq!(json["timestamp"], 1_600_096_945.479);
    }

    #[test]
    fn test_context_error_conversion() {
        assert_eq!(StorageError::from(ContextError::Canceled), StorageError::Canceled);
        assert_eq!(
            StorageError::from(ContextError::DeadlineExceeded),
            StorageError::DeadlineExceeded
        );
    }
}
