use crate::discovery::{global_url, MetricMetadata, ScrapeTarget, TargetHealth};
use crate::error::ApiError;
use crate::expr::parse_metric_selector;
use crate::model::{matches_all, Labels, Matcher};
use crate::web::{ApiFuncResult, ApiRequest, AppState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

const SCRAPE_INTERVAL_LABEL: &str = "__scrape_interval__";
const SCRAPE_TIMEOUT_LABEL: &str = "__scrape_timeout__";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapePoolsDiscovery {
    pub scrape_pools: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTarget {
    pub discovered_labels: Labels,
    pub labels: Labels,
    pub scrape_pool: String,
    pub scrape_url: String,
    pub global_url: String,
    pub last_error: String,
    pub last_scrape: Option<DateTime<Utc>>,
    pub last_scrape_duration: f64,
    pub health: TargetHealth,
    pub scrape_interval: String,
    pub scrape_timeout: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DroppedTarget {
    pub discovered_labels: Labels,
    pub scrape_pool: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDiscovery {
    pub active_targets: Vec<ApiTarget>,
    pub dropped_targets: Vec<DroppedTarget>,
    pub dropped_target_counts: Option<BTreeMap<String, usize>>,
}

#[derive(Debug, Serialize)]
pub struct TargetMetadata {
    pub target: Labels,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub metric: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub help: String,
    pub unit: String,
}

#[derive(Debug, Serialize)]
pub struct AlertmanagerTarget {
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerDiscovery {
    pub active_alertmanagers: Vec<AlertmanagerTarget>,
    pub dropped_alertmanagers: Vec<AlertmanagerTarget>,
}

/// Optional signed count parameter; negative or absent means no limit.
fn count_param(req: &ApiRequest, name: &str) -> Result<Option<usize>, ApiError> {
    match req.value(name) {
        "" => Ok(None),
        s => s
            .parse::<i64>()
            .map(|n| usize::try_from(n).ok())
            .map_err(|_| ApiError::bad_data(format!("{} must be a number", name))),
    }
}

pub async fn scrape_pools(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    let mut pools = state.scrape_pools.scrape_pools();
    pools.sort();
    ApiFuncResult::ok(ScrapePoolsDiscovery {
        scrape_pools: pools,
    })
}

fn active_target(state: &AppState, pool: &str, t: &ScrapeTarget) -> ApiTarget {
    let last_error = t.last_error.clone().unwrap_or_default();
    let (global, last_error) = match global_url(&t.scrape_url, &state.config.global_url_options()) {
        Ok(url) => (url, last_error),
        Err(e) => (t.scrape_url.clone(), format!("{}: {}", last_error, e)),
    };

    ApiTarget {
        discovered_labels: t.discovered_labels.clone(),
        labels: t.labels.without_meta(),
        scrape_pool: pool.to_string(),
        scrape_url: t.scrape_url.clone(),
        global_url: global,
        last_error,
        last_scrape: t.last_scrape,
        last_scrape_duration: t.last_scrape_duration.as_secs_f64(),
        health: t.health,
        scrape_interval: t.labels.get(SCRAPE_INTERVAL_LABEL).to_string(),
        scrape_timeout: t.labels.get(SCRAPE_TIMEOUT_LABEL).to_string(),
    }
}

pub async fn targets(state: AppState, req: ApiRequest) -> ApiFuncResult {
    let pool_filter = req.query_value("scrapePool");
    let wanted = req.query_value("state").to_lowercase();
    let show_active = matches!(wanted.as_str(), "" | "any" | "active");
    let show_dropped = matches!(wanted.as_str(), "" | "any" | "dropped");
    let in_filter = |pool: &str| pool_filter.is_empty() || pool == pool_filter;

    let mut res = TargetDiscovery {
        active_targets: Vec::new(),
        dropped_targets: Vec::new(),
        dropped_target_counts: None,
    };

    if show_active {
        for (pool, targets) in state.targets.targets_active() {
            if !in_filter(&pool) {
                continue;
            }
            for t in &targets {
                res.active_targets.push(active_target(&state, &pool, t));
            }
        }
    }

    if show_dropped {
        res.dropped_target_counts = Some(state.targets.targets_dropped_counts());
        for (pool, targets) in state.targets.targets_dropped() {
            if !in_filter(&pool) {
                continue;
            }
            for t in targets {
                res.dropped_targets.push(DroppedTarget {
                    discovered_labels: t.discovered_labels,
                    scrape_pool: pool.clone(),
                });
            }
        }
    }

    ApiFuncResult::ok(res)
}

// ============================================================================
// Metadata
// ============================================================================

pub async fn target_metadata(state: AppState, req: ApiRequest) -> ApiFuncResult {
    list_target_metadata(&state, &req).unwrap_or_else(ApiFuncResult::from)
}

fn list_target_metadata(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    let limit = count_param(req, "limit")?;

    let match_target = req.value("match_target");
    let matchers: Vec<Matcher> = if match_target.is_empty() {
        Vec::new()
    } else {
        parse_metric_selector(match_target)
            .map_err(|e| ApiError::invalid_param(e, "match_target"))?
    };
    let metric = req.value("metric");

    let mut res: Vec<TargetMetadata> = Vec::new();
    for targets in state.targets.targets_active().into_values() {
        for t in &targets {
            if limit.is_some_and(|l| res.len() >= l) {
                break;
            }
            let target = t.labels.without_meta();
            if !match_target.is_empty() && !matches_all(&matchers, &target) {
                continue;
            }

            if metric.is_empty() {
                for md in &t.metadata {
                    res.push(TargetMetadata {
                        target: target.clone(),
                        metric: md.metric_family.clone(),
                        kind: md.kind.clone(),
                        help: md.help.clone(),
                        unit: md.unit.clone(),
                    });
                }
            } else if let Some(md) = t.get_metadata(metric) {
                res.push(TargetMetadata {
                    target,
                    metric: String::new(),
                    kind: md.kind.clone(),
                    help: md.help.clone(),
                    unit: md.unit.clone(),
                });
            }
        }
    }

    Ok(ApiFuncResult::ok(res))
}

pub async fn metric_metadata(state: AppState, req: ApiRequest) -> ApiFuncResult {
    list_metric_metadata(&state, &req).unwrap_or_else(ApiFuncResult::from)
}

fn list_metric_metadata(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    let limit = count_param(req, "limit")?;
    let limit_per_metric = count_param(req, "limit_per_metric")?.filter(|&l| l > 0);
    let metric = req.value("metric");

    let mut metrics: BTreeMap<String, BTreeSet<MetricMetadata>> = BTreeMap::new();
    let mut add = |md: &MetricMetadata| {
        let set = metrics.entry(md.metric_family.clone()).or_default();
        if limit_per_metric.is_some_and(|l| set.len() >= l) {
            return;
        }
        set.insert(md.clone());
    };

    for targets in state.targets.targets_active().into_values() {
        for t in &targets {
            if metric.is_empty() {
                t.metadata.iter().for_each(&mut add);
            } else if let Some(md) = t.get_metadata(metric) {
                add(md);
            }
        }
    }

    let res: BTreeMap<String, Vec<MetricMetadata>> = metrics
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|(name, set)| (name, set.into_iter().collect()))
        .collect();
    Ok(ApiFuncResult::ok(res))
}

// ============================================================================
// Alertmanagers
// ============================================================================

pub async fn alertmanagers(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    let to_targets = |urls: Vec<String>| {
        urls.into_iter()
            .map(|url| AlertmanagerTarget { url })
            .collect::<Vec<_>>()
    };

    ApiFuncResult::ok(AlertmanagerDiscovery {
        active_alertmanagers: to_targets(state.alertmanagers.alertmanagers()),
        dropped_alertmanagers: to_targets(state.alertmanagers.dropped_alertmanagers()),
    })
}
