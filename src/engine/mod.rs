//! Query engine contract.
//!
//! The gateway creates a query, executes it under a context and must close
//! it exactly once. [`SelectorEngine`] is the bundled implementation.

mod selector;
mod stats;

pub use selector::*;
pub use stats::*;

use crate::context::Context;
use crate::expr::ParseError;
use crate::model::{Annotations, Timestamp, Value};
use crate::storage::{Queryable, StorageError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("query was canceled in {0}")]
    Canceled(String),
    #[error("query timed out in {0}")]
    Timeout(String),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Execution(String),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Canceled => EngineError::Canceled("expression evaluation".to_string()),
            StorageError::DeadlineExceeded => {
                EngineError::Timeout("expression evaluation".to_string())
            }
            other => EngineError::Storage(other),
        }
    }
}

/// Per-query options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOpts {
    pub enable_per_step_stats: bool,
    /// Overrides the engine's lookback delta, in milliseconds.
    pub lookback_delta: Option<i64>,
}

/// Outcome of executing a query.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub value: Result<Value, EngineError>,
    pub warnings: Annotations,
}

/// A prepared query. Holds storage resources until [`Query::close`].
#[async_trait]
pub trait Query: Send + Sync {
    async fn exec(&self, ctx: &Context) -> QueryResult;

    /// Release storage resources. Calling it more than once is a bug.
    fn close(&self);

    /// The original query string.
    fn statement(&self) -> String;

    fn stats(&self) -> Statistics;
}

/// `ctx` bounds query preparation; execution gets its own context.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn new_instant_query(
        &self,
        ctx: &Context,
        queryable: Arc<dyn Queryable>,
        opts: &QueryOpts,
        qs: &str,
        ts: Timestamp,
    ) -> Result<Box<dyn Query>, EngineError>;

    /// `step` is in milliseconds and positive.
    async fn new_range_query(
        &self,
        ctx: &Context,
        queryable: Arc<dyn Queryable>,
        opts: &QueryOpts,
        qs: &str,
        start: Timestamp,
        end: Timestamp,
        step: i64,
    ) -> Result<Box<dyn Query>, EngineError>;
}
