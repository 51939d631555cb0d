//! Storage contract implementations for [`Store`].
//!
//! SQLite calls block, so every operation runs on the blocking pool.

use super::store::{DbError, Store};
use crate::context::Context;
use crate::model::{Annotations, Matcher, Timestamp};
use crate::storage::{
    BlockMeta, ExemplarQueryResult, ExemplarQueryable, LabelHints, Querier, Queryable,
    SelectHints, SeriesSet, StorageError, TsdbAdmin, TsdbStats, VecSeriesSet, WalReplayStatus,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

const SNAPSHOT_FILE: &str = "querygate.db";

async fn run_blocking<T, F>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, DbError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Other(format!("storage task failed: {}", e)))?
        .map_err(StorageError::from)
}

fn check(ctx: &Context) -> Result<(), StorageError> {
    match ctx.err() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// A read view over `[mint, maxt]` of the SQLite store.
pub struct StoreQuerier {
    store: Store,
    mint: Timestamp,
    maxt: Timestamp,
    closed: AtomicBool,
}

impl StoreQuerier {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Queryable for Store {
    async fn querier(&self, mint: Timestamp, maxt: Timestamp) -> Result<Box<dyn Querier>, StorageError> {
        Ok(Box::new(StoreQuerier {
            store: self.clone(),
            mint,
            maxt,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Querier for StoreQuerier {
    async fn label_names(
        &self,
        ctx: &Context,
        hints: &LabelHints,
        matchers: &[Matcher],
    ) -> Result<(Vec<String>, Annotations), StorageError> {
        check(ctx)?;
        let (store, matchers) = (self.store.clone(), matchers.to_vec());
        let (mint, maxt, limit) = (self.mint, self.maxt, hints.limit);
        let names = run_blocking(move || store.label_names(&matchers, mint, maxt, limit)).await?;
        Ok((names, Annotations::new()))
    }

    async fn label_values(
        &self,
        ctx: &Context,
        name: &str,
        hints: &LabelHints,
        matchers: &[Matcher],
    ) -> Result<(Vec<String>, Annotations), StorageError> {
        check(ctx)?;
        let (store, matchers, name) = (self.store.clone(), matchers.to_vec(), name.to_string());
        let (mint, maxt, limit) = (self.mint, self.maxt, hints.limit);
        let values =
            run_blocking(move || store.label_values(&name, &matchers, mint, maxt, limit)).await?;
        Ok((values, Annotations::new()))
    }

    async fn select(
        &self,
        ctx: &Context,
        _sorted: bool,
        hints: &SelectHints,
        matchers: &[Matcher],
    ) -> Result<Box<dyn SeriesSet>, StorageError> {
        check(ctx)?;
        let (store, matchers) = (self.store.clone(), matchers.to_vec());
        // Hints narrow the window but never widen it past the view.
        let mint = hints.start.max(self.mint);
        let maxt = hints.end.min(self.maxt);
        let limit = hints.limit;
        let series = run_blocking(move || store.select(&matchers, mint, maxt, limit)).await?;
        // Results are always label-sorted.
        Ok(Box::new(VecSeriesSet::new(series, Annotations::new())))
    }

    fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!("querier over [{}, {}] closed twice", self.mint, self.maxt);
        }
        Ok(())
    }
}

#[async_trait]
impl ExemplarQueryable for Store {
    async fn select_exemplars(
        &self,
        ctx: &Context,
        start: Timestamp,
        end: Timestamp,
        matcher_sets: &[Vec<Matcher>],
    ) -> Result<Vec<ExemplarQueryResult>, StorageError> {
        check(ctx)?;
        let (store, sets) = (self.clone(), matcher_sets.to_vec());
        run_blocking(move || store.exemplars(&sets, start, end)).await
    }
}

#[async_trait]
impl TsdbAdmin for Store {
    async fn clean_tombstones(&self) -> Result<(), StorageError> {
        let store = self.clone();
        run_blocking(move || store.clean_tombstones()).await
    }

    async fn delete(
        &self,
        ctx: &Context,
        mint: Timestamp,
        maxt: Timestamp,
        matchers: &[Matcher],
    ) -> Result<(), StorageError> {
        check(ctx)?;
        let (store, matchers) = (self.clone(), matchers.to_vec());
        let deleted = run_blocking(move || store.delete(&matchers, mint, maxt)).await?;
        tracing::debug!("tombstoned {} series over [{}, {}]", deleted, mint, maxt);
        Ok(())
    }

    async fn snapshot(&self, dir: &Path, with_head: bool) -> Result<(), StorageError> {
        // Everything lives in one file; there is no separate head to skip.
        tracing::debug!("writing snapshot to {} (with_head={})", dir.display(), with_head);
        let (store, target) = (self.clone(), dir.join(SNAPSHOT_FILE));
        run_blocking(move || store.snapshot_to(&target)).await
    }

    async fn stats(&self, limit: usize) -> Result<TsdbStats, StorageError> {
        let store = self.clone();
        run_blocking(move || store.stats(limit)).await
    }

    async fn wal_replay_status(&self) -> Result<WalReplayStatus, StorageError> {
        // Nothing is replayed on open.
        Ok(WalReplayStatus::default())
    }

    async fn block_metas(&self) -> Result<Vec<BlockMeta>, StorageError> {
        let store = self.clone();
        run_blocking(move || store.block_metas()).await
    }
}
