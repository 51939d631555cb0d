//! Query execution statistics.

use crate::model::{Timestamp, UnixSeconds};
use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;

/// Wall clock spent in each phase of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timings {
    pub eval_total: Duration,
    pub result_sort: Duration,
    pub query_preparation: Duration,
    pub inner_eval: Duration,
    pub exec_queue: Duration,
    pub exec_total: Duration,
}

/// Sample counters. `per_step` is only tracked when per-step stats are on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleStats {
    pub total_queryable_samples: u64,
    pub peak_samples: u64,
    pub per_step: Option<Vec<(Timestamp, u64)>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    pub timings: Timings,
    pub samples: SampleStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingsJson {
    pub eval_total_time: f64,
    pub result_sort_time: f64,
    pub query_preparation_time: f64,
    pub inner_eval_time: f64,
    pub exec_queue_time: f64,
    pub exec_total_time: f64,
}

/// One per-step counter, rendered as `[<unix seconds>, <count>]`.
#[derive(Debug, Clone, Copy)]
pub struct StepStat {
    pub t: Timestamp,
    pub v: u64,
}

impl Serialize for StepStat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&UnixSeconds(self.t))?;
        tup.serialize_element(&self.v)?;
        tup.end()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplesJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_queryable_samples_per_step: Option<Vec<StepStat>>,
    pub total_queryable_samples: u64,
    pub peak_samples: u64,
}

/// The wire form of [`Statistics`].
#[derive(Debug, Clone, Serialize)]
pub struct QueryStats {
    pub timings: TimingsJson,
    pub samples: SamplesJson,
}

impl QueryStats {
    pub fn new(stats: &Statistics) -> Self {
        let t = &stats.timings;
        Self {
            timings: TimingsJson {
                eval_total_time: t.eval_total.as_secs_f64(),
                result_sort_time: t.result_sort.as_secs_f64(),
                query_preparation_time: t.query_preparation.as_secs_f64(),
                inner_eval_time: t.inner_eval.as_secs_f64(),
                exec_queue_time: t.exec_queue.as_secs_f64(),
                exec_total_time: t.exec_total.as_secs_f64(),
            },
            samples: SamplesJson {
                total_queryable_samples_per_step: stats
                    .samples
                    .per_step
                    .as_ref()
                    .map(|steps| steps.iter().map(|&(t, v)| StepStat { t, v }).collect()),
                total_queryable_samples: stats.samples.total_queryable_samples,
                peak_samples: stats.samples.peak_samples,
            },
        }
    }
}

/// Turns engine statistics into the `stats` field of a query response,
/// given the raw `stats` request parameter.
pub type StatsRenderer = Arc<dyn Fn(&Statistics, &str) -> Option<serde_json::Value> + Send + Sync>;

/// Renders statistics whenever the `stats` parameter is non-empty.
pub fn default_stats_renderer() -> StatsRenderer {
    Arc::new(|stats: &Statistics, param: &str| {
        if param.is_empty() {
            return None;
        }
        serde_json::to_value(QueryStats::new(stats)).ok()
    })
}
