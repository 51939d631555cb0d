use super::Guard;
use crate::context::{Context, ContextError};
use crate::engine::{EngineError, Query, QueryOpts};
use crate::error::ApiError;
use crate::expr;
use crate::model::{self, Value, ValueType, MAX_TIME, MIN_TIME};
use crate::params::parse_duration;
use crate::web::{ApiFuncResult, ApiRequest, AppState};
use chrono::TimeDelta;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Ceiling on the number of points a range query may produce per series.
pub const MAX_POINTS_PER_SERIES: i128 = 11_000;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryData {
    pub result_type: ValueType,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

fn to_std(d: TimeDelta) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

/// Context for the whole query, preparation included.
fn query_context(req: &ApiRequest) -> Result<Context, ApiError> {
    match req.value("timeout") {
        "" => Ok(req.ctx().clone()),
        t => {
            let t = parse_duration(t).map_err(|e| ApiError::invalid_param(e, "timeout"))?;
            Ok(req.ctx().with_timeout(to_std(t)))
        }
    }
}

fn context_error(err: ContextError) -> ApiError {
    match err {
        ContextError::Canceled => EngineError::Canceled("query preparation".to_string()),
        ContextError::DeadlineExceeded => EngineError::Timeout("query preparation".to_string()),
    }
    .into()
}

/// Running out of time while compiling is a timeout, not a bad query.
fn compile_error(e: EngineError) -> ApiError {
    match e {
        EngineError::Canceled(_) | EngineError::Timeout(_) => e.into(),
        e => ApiError::invalid_param(e, "query"),
    }
}

fn query_opts(req: &ApiRequest) -> Result<QueryOpts, ApiError> {
    let mut opts = QueryOpts {
        enable_per_step_stats: req.value("stats") == "all",
        lookback_delta: None,
    };

    let lookback = req.value("lookback_delta");
    if !lookback.is_empty() {
        let d = parse_duration(lookback).map_err(|e| {
            ApiError::bad_data(format!("error parsing lookback delta duration: {}", e))
        })?;
        opts.lookback_delta = Some(d.num_milliseconds());
    }
    Ok(opts)
}

/// Run a prepared query and shape its result. The query is released by the
/// returned finalizer, or right here when the result is an error.
async fn run_query(
    state: &AppState,
    req: &ApiRequest,
    ctx: &Context,
    query: Box<dyn Query>,
    limit: usize,
) -> ApiFuncResult {
    let query = Guard::new(query);
    if let Some(err) = ctx.err() {
        debug!("query {:?} expired before execution", query.statement());
        return context_error(err).into();
    }

    let res = query.exec(ctx).await;
    let mut value = match res.value {
        Ok(value) => value,
        Err(e) => {
            debug!("query {:?} failed: {}", query.statement(), e);
            return ApiFuncResult::from(ApiError::from(e)).with_warnings(res.warnings);
        }
    };

    let mut warnings = res.warnings;
    if limit > 0 && value.truncate(limit) {
        warnings.warn("results truncated due to limit");
    }

    let stats = (state.stats_renderer)(&query.stats(), req.value("stats"));
    ApiFuncResult::ok(QueryData {
        result_type: value.value_type(),
        result: value,
        stats,
    })
    .with_warnings(warnings)
    .with_finalizer(query.into_finalizer())
}

// ============================================================================
// Instant and range queries
// ============================================================================

pub async fn query(state: AppState, req: ApiRequest) -> ApiFuncResult {
    instant_query(&state, &req).await.unwrap_or_else(ApiFuncResult::from)
}

async fn instant_query(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    let limit = req.limit_param()?;
    let ts = req.time_param("time", model::now())?;
    let ctx = query_context(req)?;

    let opts = query_opts(req)?;
    let q = state
        .engine
        .new_instant_query(&ctx, state.queryable.clone(), &opts, req.value("query"), ts)
        .await
        .map_err(compile_error)?;

    Ok(run_query(state, req, &ctx, q, limit).await)
}

pub async fn query_range(state: AppState, req: ApiRequest) -> ApiFuncResult {
    range_query(&state, &req).await.unwrap_or_else(ApiFuncResult::from)
}

async fn range_query(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    let limit = req.limit_param()?;

    let start = crate::params::parse_time(req.value("start"))
        .map_err(|e| ApiError::invalid_param(e, "start"))?;
    let end = crate::params::parse_time(req.value("end"))
        .map_err(|e| ApiError::invalid_param(e, "end"))?;
    if end < start {
        return Err(ApiError::invalid_param(
            "end timestamp must not be before start time",
            "end",
        ));
    }

    let step = parse_duration(req.value("step")).map_err(|e| ApiError::invalid_param(e, "step"))?;
    let step_ns = step.num_nanoseconds().unwrap_or(i64::MAX);
    if step_ns <= 0 {
        return Err(ApiError::invalid_param(
            "zero or negative query resolution step widths are not accepted. Try a positive integer",
            "step",
        ));
    }

    // Whole nanoseconds, so sub-millisecond steps are still counted right.
    let span_ns = (end as i128 - start as i128) * 1_000_000;
    if span_ns / step_ns as i128 > MAX_POINTS_PER_SERIES {
        return Err(ApiError::bad_data(
            "exceeded maximum resolution of 11,000 points per timeseries. Try decreasing the query resolution (?step=XX)",
        ));
    }

    let ctx = query_context(req)?;

    let opts = query_opts(req)?;
    let q = state
        .engine
        .new_range_query(
            &ctx,
            state.queryable.clone(),
            &opts,
            req.value("query"),
            start,
            end,
            step.num_milliseconds().max(1),
        )
        .await
        .map_err(compile_error)?;

    Ok(run_query(state, req, &ctx, q, limit).await)
}

// ============================================================================
// Exemplars and query utilities
// ============================================================================

pub async fn query_exemplars(state: AppState, req: ApiRequest) -> ApiFuncResult {
    exemplars(&state, &req).await.unwrap_or_else(ApiFuncResult::from)
}

async fn exemplars(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    let start = req.time_param("start", MIN_TIME)?;
    let end = req.time_param("end", MAX_TIME)?;
    if end < start {
        return Err(ApiError::bad_data(
            "end timestamp must not be before start timestamp",
        ));
    }

    let expr = expr::parse(req.value("query")).map_err(|e| ApiError::bad_data(e.to_string()))?;
    let selectors = expr.selectors();
    if selectors.is_empty() {
        return Ok(ApiFuncResult::empty());
    }

    let res = state
        .exemplar_queryable
        .select_exemplars(req.ctx(), start, end, &selectors)
        .await?;
    Ok(ApiFuncResult::ok(res))
}

pub async fn format_query(_state: AppState, req: ApiRequest) -> ApiFuncResult {
    match expr::pretty(req.value("query")) {
        Ok(pretty) => ApiFuncResult::ok(pretty),
        Err(e) => ApiError::invalid_param(e, "query").into(),
    }
}

pub async fn parse_query(_state: AppState, req: ApiRequest) -> ApiFuncResult {
    match expr::parse(req.value("query")) {
        Ok(expr) => ApiFuncResult::ok(expr.to_json()),
        Err(e) => ApiError::invalid_param(e, "query").into(),
    }
}
