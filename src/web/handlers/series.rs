use super::Guard;
use crate::error::ApiError;
use crate::model::{is_valid_label_name, unescape_name, Labels, Matcher, MAX_TIME, MIN_TIME};
use crate::params::to_hint_limit;
use crate::storage::{merge_series_sets, LabelHints, Querier, SelectHints, SeriesSet, StorageError};
use crate::web::{ApiFuncResult, ApiRequest, AppState};
use std::collections::BTreeSet;

/// How many series to read between cancellation checks.
const CHECK_CONTEXT_EVERY: usize = 128;

async fn open_querier(
    state: &AppState,
    start: i64,
    end: i64,
) -> Result<Guard<dyn Querier>, ApiError> {
    let q = state.queryable.querier(start, end).await?;
    Ok(Guard::new(q))
}

/// Union of per-group results, sorted. A single group is passed through.
fn merge_names(groups: Vec<Vec<String>>) -> Vec<String> {
    if groups.len() == 1 {
        return groups.into_iter().flatten().collect();
    }
    groups
        .into_iter()
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// ============================================================================
// Labels
// ============================================================================

pub async fn label_names(state: AppState, req: ApiRequest) -> ApiFuncResult {
    names(&state, &req).await.unwrap_or_else(ApiFuncResult::from)
}

async fn names(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    let limit = req.limit_param()?;
    let start = req.time_param("start", MIN_TIME)?;
    let end = req.time_param("end", MAX_TIME)?;
    let matcher_sets = req
        .matcher_sets()
        .map_err(|e| ApiError::bad_data(e.to_string()))?;
    let hints = LabelHints {
        limit: to_hint_limit(limit),
    };

    let q = open_querier(state, start, end).await?;
    let ctx = req.ctx();
    let mut warnings = crate::model::Annotations::new();

    let mut groups = Vec::new();
    if matcher_sets.is_empty() {
        let (names, w) = q.label_names(ctx, &hints, &[]).await?;
        warnings.merge(w);
        groups.push(names);
    } else {
        for matchers in &matcher_sets {
            let (names, w) = q.label_names(ctx, &hints, matchers).await?;
            warnings.merge(w);
            groups.push(names);
        }
    }

    let mut names = merge_names(groups);
    if limit > 0 && names.len() > limit {
        names.truncate(limit);
        warnings.warn("results truncated due to limit");
    }

    Ok(ApiFuncResult::ok(names)
        .with_warnings(warnings)
        .with_finalizer(q.into_finalizer()))
}

pub async fn label_values(state: AppState, req: ApiRequest) -> ApiFuncResult {
    values(&state, &req).await.unwrap_or_else(ApiFuncResult::from)
}

async fn values(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    let raw = req.path_param("name");
    let name = if raw.starts_with("U__") {
        unescape_name(raw)
    } else {
        raw.to_string()
    };
    if !is_valid_label_name(&name) {
        return Err(ApiError::bad_data(format!("invalid label name: {:?}", name)));
    }

    let limit = req.limit_param()?;
    let start = req.time_param("start", MIN_TIME)?;
    let end = req.time_param("end", MAX_TIME)?;
    let matcher_sets = req
        .matcher_sets()
        .map_err(|e| ApiError::bad_data(e.to_string()))?;
    let hints = LabelHints {
        limit: to_hint_limit(limit),
    };

    let q = open_querier(state, start, end).await?;
    let ctx = req.ctx();
    let mut warnings = crate::model::Annotations::new();

    let mut groups = Vec::new();
    if matcher_sets.is_empty() {
        let (vals, w) = q.label_values(ctx, &name, &hints, &[]).await?;
        warnings.merge(w);
        groups.push(vals);
    } else {
        for matchers in &matcher_sets {
            let (vals, w) = q.label_values(ctx, &name, &hints, matchers).await?;
            warnings.merge(w);
            groups.push(vals);
        }
    }

    let mut vals = merge_names(groups);
    vals.sort();
    if limit > 0 && vals.len() > limit {
        vals.truncate(limit);
        warnings.warn("results truncated due to limit");
    }

    Ok(ApiFuncResult::ok(vals)
        .with_warnings(warnings)
        .with_finalizer(q.into_finalizer()))
}

// ============================================================================
// Series
// ============================================================================

pub async fn series(state: AppState, req: ApiRequest) -> ApiFuncResult {
    find_series(&state, &req).await.unwrap_or_else(ApiFuncResult::from)
}

async fn select_all(
    q: &Guard<dyn Querier>,
    req: &ApiRequest,
    hints: &SelectHints,
    matcher_sets: &[Vec<Matcher>],
) -> Result<Box<dyn SeriesSet>, StorageError> {
    let ctx = req.ctx();
    if matcher_sets.len() == 1 {
        return q.select(ctx, false, hints, &matcher_sets[0]).await;
    }

    // Sorted inputs for the k-way merge.
    let mut sets = Vec::with_capacity(matcher_sets.len());
    for matchers in matcher_sets {
        sets.push(q.select(ctx, true, hints, matchers).await?);
    }
    Ok(Box::new(merge_series_sets(sets)?))
}

async fn find_series(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    if req.values("match[]").is_empty() {
        return Err(ApiError::bad_data("no match[] parameter provided"));
    }

    let limit = req.limit_param()?;
    let start = req.time_param("start", MIN_TIME)?;
    let end = req.time_param("end", MAX_TIME)?;
    let matcher_sets = req
        .matcher_sets()
        .map_err(|e| ApiError::invalid_param(e, "match[]"))?;

    let q = open_querier(state, start, end).await?;
    let hints = SelectHints {
        start,
        end,
        limit: to_hint_limit(limit),
        func: Some("series".to_string()),
        ..Default::default()
    };

    let mut set = select_all(&q, req, &hints, &matcher_sets).await?;

    let ctx = req.ctx();
    let mut metrics: Vec<Labels> = Vec::new();
    let mut warnings = crate::model::Annotations::new();
    for (i, series) in set.by_ref().enumerate() {
        if i % CHECK_CONTEXT_EVERY == 0 {
            if let Some(err) = ctx.err() {
                return Err(StorageError::from(err).into());
            }
        }
        metrics.push(series?.labels);

        if limit > 0 && metrics.len() > limit {
            metrics.truncate(limit);
            warnings.warn("results truncated due to limit");
            break;
        }
    }
    warnings.merge(set.warnings());

    Ok(ApiFuncResult::ok(metrics)
        .with_warnings(warnings)
        .with_finalizer(q.into_finalizer()))
}

pub async fn drop_series(_state: AppState, _req: ApiRequest) -> ApiFuncResult {
    ApiError::internal("not implemented").into()
}
