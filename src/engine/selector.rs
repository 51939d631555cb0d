//! Reference engine evaluating selector expressions.

use super::{EngineError, Query, QueryEngine, QueryOpts, QueryResult, Statistics};
use crate::context::{Context, ContextError};
use crate::expr::{self, Expr, VectorSelector};
use crate::model::{Annotations, Labels, MatrixSeries, Sample, Series, Timestamp, Value, VectorSample};
use crate::storage::{Querier, Queryable, SelectHints};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How often long loops look at the context.
const CHECK_CONTEXT_EVERY: usize = 128;

fn context_error(err: ContextError) -> EngineError {
    match err {
        ContextError::Canceled => EngineError::Canceled("expression evaluation".to_string()),
        ContextError::DeadlineExceeded => EngineError::Timeout("expression evaluation".to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Shape {
    Instant(Timestamp),
    Range {
        start: Timestamp,
        end: Timestamp,
        step: i64,
    },
}

impl Shape {
    fn bounds(&self) -> (Timestamp, Timestamp) {
        match *self {
            Shape::Instant(t) => (t, t),
            Shape::Range { start, end, .. } => (start, end),
        }
    }

    fn steps(&self) -> Vec<Timestamp> {
        match *self {
            Shape::Instant(t) => vec![t],
            Shape::Range { start, end, step } => {
                let mut out = Vec::new();
                let mut t = start;
                while t <= end {
                    out.push(t);
                    match t.checked_add(step) {
                        Some(next) => t = next,
                        None => break,
                    }
                }
                out
            }
        }
    }
}

/// Evaluates number and string literals, vector selectors and range
/// selectors directly against storage.
pub struct SelectorEngine {
    lookback_delta: i64,
    timeout: Option<Duration>,
}

impl SelectorEngine {
    /// `lookback_delta` is in milliseconds. `timeout` caps every execution.
    pub fn new(lookback_delta: i64, timeout: Option<Duration>) -> Self {
        Self {
            lookback_delta,
            timeout,
        }
    }

    async fn prepare(
        &self,
        ctx: &Context,
        queryable: Arc<dyn Queryable>,
        opts: &QueryOpts,
        qs: &str,
        shape: Shape,
    ) -> Result<Box<dyn Query>, EngineError> {
        let started = Instant::now();
        let expr = expr::parse(qs)?;

        if matches!(shape, Shape::Range { .. }) {
            let kind = match &expr {
                Expr::String(_) => Some("string"),
                Expr::Matrix { .. } => Some("range vector"),
                _ => None,
            };
            if let Some(kind) = kind {
                return Err(EngineError::Execution(format!(
                    "invalid expression type {:?} for range query, must be Scalar or instant Vector",
                    kind
                )));
            }
        }

        let lookback = opts
            .lookback_delta
            .filter(|d| *d > 0)
            .unwrap_or(self.lookback_delta);

        let (first, last) = shape.bounds();
        let (mint, maxt) = match &expr {
            Expr::Vector(sel) => (
                first.saturating_sub(sel.offset).saturating_sub(lookback),
                last.saturating_sub(sel.offset),
            ),
            Expr::Matrix { selector, range } => (
                first.saturating_sub(selector.offset).saturating_sub(*range),
                last.saturating_sub(selector.offset),
            ),
            _ => (first, last),
        };

        let querier = tokio::select! {
            q = queryable.querier(mint, maxt) => q?,
            err = ctx.done() => return Err(context_error(err)),
        };
        let querier: Arc<dyn Querier> = Arc::from(querier);

        let mut stats = Statistics::default();
        stats.timings.query_preparation = started.elapsed();
        if opts.enable_per_step_stats {
            stats.samples.per_step = Some(Vec::new());
        }

        Ok(Box::new(SelectorQuery {
            expr,
            statement: qs.to_string(),
            shape,
            lookback,
            timeout: self.timeout,
            querier: Mutex::new(Some(querier)),
            stats: Mutex::new(stats),
        }))
    }
}

#[async_trait]
impl QueryEngine for SelectorEngine {
    async fn new_instant_query(
        &self,
        ctx: &Context,
        queryable: Arc<dyn Queryable>,
        opts: &QueryOpts,
        qs: &str,
        ts: Timestamp,
    ) -> Result<Box<dyn Query>, EngineError> {
        self.prepare(ctx, queryable, opts, qs, Shape::Instant(ts)).await
    }

    async fn new_range_query(
        &self,
        ctx: &Context,
        queryable: Arc<dyn Queryable>,
        opts: &QueryOpts,
        qs: &str,
        start: Timestamp,
        end: Timestamp,
        step: i64,
    ) -> Result<Box<dyn Query>, EngineError> {
        if step <= 0 {
            return Err(EngineError::Execution("step must be positive".to_string()));
        }
        self.prepare(ctx, queryable, opts, qs, Shape::Range { start, end, step })
            .await
    }
}

pub struct SelectorQuery {
    expr: Expr,
    statement: String,
    shape: Shape,
    lookback: i64,
    timeout: Option<Duration>,
    querier: Mutex<Option<Arc<dyn Querier>>>,
    stats: Mutex<Statistics>,
}

impl SelectorQuery {
    fn querier(&self) -> Result<Arc<dyn Querier>, EngineError> {
        self.querier
            .lock()
            .map_err(|_| EngineError::Execution("query state poisoned".to_string()))?
            .clone()
            .ok_or_else(|| EngineError::Execution("query already closed".to_string()))
    }

    async fn select(
        &self,
        ctx: &Context,
        sel: &VectorSelector,
        mint: Timestamp,
        maxt: Timestamp,
        warnings: &mut Annotations,
    ) -> Result<Vec<Series>, EngineError> {
        let querier = self.querier()?;
        let (first, last) = self.shape.bounds();
        let hints = SelectHints {
            start: mint,
            end: maxt,
            step: match self.shape {
                Shape::Range { step, .. } => step,
                Shape::Instant(_) => 0,
            },
            limit: 0,
            func: None,
        };
        tracing::debug!("selecting {} over [{}, {}] for [{}, {}]", sel, mint, maxt, first, last);

        let mut set = tokio::select! {
            res = querier.select(ctx, true, &hints, &sel.matchers) => res?,
            err = ctx.done() => return Err(context_error(err)),
        };

        let mut out = Vec::new();
        for (i, series) in set.by_ref().enumerate() {
            if i % CHECK_CONTEXT_EVERY == 0 {
                if let Some(err) = ctx.err() {
                    return Err(context_error(err));
                }
            }
            out.push(series?);
        }
        warnings.merge(set.warnings());
        Ok(out)
    }

    fn record(&self, per_step: &[(Timestamp, u64)]) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        let total: u64 = per_step.iter().map(|(_, n)| n).sum();
        stats.samples.total_queryable_samples += total;
        let peak = per_step.iter().map(|(_, n)| *n).max().unwrap_or(0);
        stats.samples.peak_samples = stats.samples.peak_samples.max(peak);
        if let Some(steps) = stats.samples.per_step.as_mut() {
            steps.extend_from_slice(per_step);
        }
    }

    async fn eval(&self, ctx: &Context, warnings: &mut Annotations) -> Result<Value, EngineError> {
        match &self.expr {
            Expr::Number(v) => Ok(match self.shape {
                Shape::Instant(t) => Value::Scalar(Sample::new(t, *v)),
                Shape::Range { .. } => Value::Matrix(vec![MatrixSeries {
                    metric: Labels::new(),
                    values: self.shape.steps().into_iter().map(|t| Sample::new(t, *v)).collect(),
                }]),
            }),
            Expr::String(s) => {
                let (t, _) = self.shape.bounds();
                Ok(Value::String {
                    t,
                    value: s.clone(),
                })
            }
            Expr::Vector(sel) => self.eval_vector(ctx, sel, warnings).await,
            Expr::Matrix { selector, range } => {
                let (t, _) = self.shape.bounds();
                let maxt = t.saturating_sub(selector.offset);
                let mint = maxt.saturating_sub(*range);
                let series = self.select(ctx, selector, mint, maxt, warnings).await?;

                let mut result = Vec::with_capacity(series.len());
                let mut count = 0u64;
                for s in series {
                    // Left-open window
                    let values: Vec<Sample> = s.samples.into_iter().filter(|p| p.t > mint).collect();
                    if values.is_empty() {
                        continue;
                    }
                    count += values.len() as u64;
                    result.push(MatrixSeries {
                        metric: s.labels,
                        values,
                    });
                }
                self.record(&[(t, count)]);
                Ok(Value::Matrix(result))
            }
        }
    }

    async fn eval_vector(
        &self,
        ctx: &Context,
        sel: &VectorSelector,
        warnings: &mut Annotations,
    ) -> Result<Value, EngineError> {
        let (first, last) = self.shape.bounds();
        let mint = first.saturating_sub(sel.offset).saturating_sub(self.lookback);
        let maxt = last.saturating_sub(sel.offset);
        let series = self.select(ctx, sel, mint, maxt, warnings).await?;
        let steps = self.shape.steps();
        let mut per_step: Vec<(Timestamp, u64)> = steps.iter().map(|&t| (t, 0)).collect();

        let mut points: Vec<(Labels, Vec<Sample>)> = Vec::with_capacity(series.len());
        for s in series {
            if let Some(err) = ctx.err() {
                return Err(context_error(err));
            }
            let mut values = Vec::new();
            for (i, &t) in steps.iter().enumerate() {
                let ref_t = t.saturating_sub(sel.offset);
                let idx = s.samples.partition_point(|p| p.t <= ref_t);
                if idx == 0 {
                    continue;
                }
                let p = s.samples[idx - 1];
                if p.t > ref_t.saturating_sub(self.lookback) {
                    values.push(Sample::new(t, p.v));
                    per_step[i].1 += 1;
                }
            }
            if !values.is_empty() {
                points.push((s.labels, values));
            }
        }
        self.record(&per_step);

        Ok(match self.shape {
            Shape::Instant(_) => Value::Vector(
                points
                    .into_iter()
                    .filter_map(|(metric, values)| {
                        values.first().map(|&sample| VectorSample { metric, sample })
                    })
                    .collect(),
            ),
            Shape::Range { .. } => Value::Matrix(
                points
                    .into_iter()
                    .map(|(metric, values)| MatrixSeries { metric, values })
                    .collect(),
            ),
        })
    }
}

#[async_trait]
impl Query for SelectorQuery {
    async fn exec(&self, ctx: &Context) -> QueryResult {
        let ctx = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.child(),
        };

        let started = Instant::now();
        let mut warnings = Annotations::new();
        let value = self.eval(&ctx, &mut warnings).await;
        let elapsed = started.elapsed();

        if let Ok(mut stats) = self.stats.lock() {
            stats.timings.eval_total = elapsed;
            stats.timings.inner_eval = elapsed;
            stats.timings.exec_total = elapsed;
        }

        QueryResult { value, warnings }
    }

    fn close(&self) {
        let querier = match self.querier.lock() {
            Ok(mut q) => q.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match querier {
            Some(q) => {
                if let Err(e) = q.close() {
                    tracing::warn!("failed to close querier for {:?}: {}", self.statement, e);
                }
            }
            None => tracing::warn!("query {:?} closed twice", self.statement),
        }
    }

    fn statement(&self) -> String {
        self.statement.clone()
    }

    fn stats(&self) -> Statistics {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::model::METRIC_NAME;
    use crate::storage::{LabelHints, SeriesSet, StorageError};
    use tempfile::NamedTempFile;

    fn engine() -> SelectorEngine {
        SelectorEngine::new(5 * 60 * 1000, None)
    }

    fn store() -> (NamedTempFile, Arc<dyn Queryable>) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let up: Labels = [(METRIC_NAME, "up"), ("job", "x")].into_iter().collect();
        store.append(&up, 100_000, 1.0).unwrap();
        store.append(&up, 160_000, 2.0).unwrap();
        (tmp, Arc::new(store))
    }

    #[tokio::test]
    async fn test_instant_vector() {
        let (_tmp, q) = store();
        let query = engine()
            .new_instant_query(
                &Context::background(),
                q,
                &QueryOpts::default(),
                "up",
                123_456,
            )
            .await
            .unwrap();
        let res = query.exec(&Context::background()).await;
        query.close();

        match res.value.unwrap() {
            Value::Vector(v) => {
                assert_eq!(v.len(), 1);
                assert_eq!(v[0].sample, Sample::new(123_456, 1.0));
                assert_eq!(v[0].metric.get("job"), "x");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookback_expires() {
        let (_tmp, q) = store();
        let opts = QueryOpts {
            lookback_delta: Some(10_000),
            ..Default::default()
        };
        let query = engine()
            .new_instant_query(&Context::background(), q, &opts, "up", 150_000)
            .await
            .unwrap();
        let res = query.exec(&Context::background()).await;
        query.close();
        assert_eq!(res.value.unwrap(), Value::Vector(vec![]));
    }

    #[tokio::test]
    async fn test_range_query_with_per_step_stats() {
        let (_tmp, q) = store();
        let opts = QueryOpts {
            enable_per_step_stats: true,
            ..Default::default()
        };
        let query = engine()
            .new_range_query(
                &Context::background(),
                q,
                &opts,
                "up",
                100_000,
                160_000,
                30_000,
            )
            .await
            .unwrap();
        let res = query.exec(&Context::background()).await;
        let stats = query.stats();
        query.close();

        match res.value.unwrap() {
            Value::Matrix(m) => {
                let values: Vec<f64> = m[0].values.iter().map(|s| s.v).collect();
                assert_eq!(values, vec![1.0, 1.0, 2.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(stats.samples.total_queryable_samples, 3);
        assert_eq!(stats.samples.per_step.map(|s| s.len()), Some(3));
    }

    #[tokio::test]
    async fn test_matrix_rejected_for_range_query() {
        let (_tmp, q) = store();
        let err = engine()
            .new_range_query(
                &Context::background(),
                q,
                &QueryOpts::default(),
                "up[5m]",
                0,
                10,
                1,
            )
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("range vector"));
    }

    #[tokio::test]
    async fn test_scalar_and_string() {
        let (_tmp, q) = store();
        let query = engine()
            .new_instant_query(
                &Context::background(),
                q.clone(),
                &QueryOpts::default(),
                "42",
                1000,
            )
            .await
            .unwrap();
        assert_eq!(
            query.exec(&Context::background()).await.value.unwrap(),
            Value::Scalar(Sample::new(1000, 42.0))
        );
        query.close();

        let query = engine()
            .new_instant_query(
                &Context::background(),
                q,
                &QueryOpts::default(),
                "\"hi\"",
                1000,
            )
            .await
            .unwrap();
        assert_eq!(
            query.exec(&Context::background()).await.value.unwrap(),
            Value::String {
                t: 1000,
                value: "hi".to_string()
            }
        );
        query.close();
    }

    struct SlowQueryable;
    struct SlowQuerier;

    #[async_trait]
    impl Queryable for SlowQueryable {
        async fn querier(&self, _: Timestamp, _: Timestamp) -> Result<Box<dyn Querier>, StorageError> {
            Ok(Box::new(SlowQuerier))
        }
    }

    #[async_trait]
    impl Querier for SlowQuerier {
        async fn label_names(
            &self,
            _: &Context,
            _: &LabelHints,
            _: &[crate::model::Matcher],
        ) -> Result<(Vec<String>, Annotations), StorageError> {
            Ok((vec![], Annotations::new()))
        }

        async fn label_values(
            &self,
            _: &Context,
            _: &str,
            _: &LabelHints,
            _: &[crate::model::Matcher],
        ) -> Result<(Vec<String>, Annotations), StorageError> {
            Ok((vec![], Annotations::new()))
        }

        async fn select(
            &self,
            _: &Context,
            _: bool,
            _: &SelectHints,
            _: &[crate::model::Matcher],
        ) -> Result<Box<dyn SeriesSet>, StorageError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(StorageError::Other("unreachable".to_string()))
        }

        fn close(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_timeout_and_cancel() {
        let bounded = SelectorEngine::new(300_000, Some(Duration::from_millis(10)));
        let query = bounded
            .new_instant_query(
                &Context::background(),
                Arc::new(SlowQueryable),
                &QueryOpts::default(),
                "up",
                0,
            )
            .await
            .unwrap();
        let err = query.exec(&Context::background()).await.value.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        query.close();

        let query = engine()
            .new_instant_query(
                &Context::background(),
                Arc::new(SlowQueryable),
                &QueryOpts::default(),
                "up",
                0,
            )
            .await
            .unwrap();
        let ctx = Context::background();
        ctx.cancel();
        let err = query.exec(&ctx).await.value.unwrap_err();
        assert_eq!(err.to_string(), "query was canceled in expression evaluation");
        query.close();
    }
}
