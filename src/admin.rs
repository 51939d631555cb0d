//! Administrative storage operations behind the admin switch.

use crate::context::Context;
use crate::error::ApiError;
use crate::model::{Matcher, Timestamp};
use crate::storage::TsdbAdmin;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

const SNAPSHOT_SUBDIR: &str = "snapshots";

pub struct AdminFacade {
    enabled: bool,
    data_dir: PathBuf,
    tsdb: Arc<dyn TsdbAdmin>,
}

impl AdminFacade {
    pub fn new(enabled: bool, data_dir: impl Into<PathBuf>, tsdb: Arc<dyn TsdbAdmin>) -> Self {
        Self {
            enabled,
            data_dir: data_dir.into(),
            tsdb,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Fails with `unavailable` while admin APIs are switched off. Handlers
    /// call this before looking at any parameter.
    pub fn check(&self) -> Result<(), ApiError> {
        if self.enabled {
            Ok(())
        } else {
            Err(ApiError::unavailable("admin APIs disabled"))
        }
    }

    /// Tombstone every series matched by any of the sets over `[start, end]`.
    pub async fn delete_series(
        &self,
        ctx: &Context,
        start: Timestamp,
        end: Timestamp,
        matcher_sets: &[Vec<Matcher>],
    ) -> Result<(), ApiError> {
        self.check()?;
        if matcher_sets.is_empty() {
            return Err(ApiError::bad_data("no match[] parameter provided"));
        }
        for matchers in matcher_sets {
            self.tsdb
                .delete(ctx, start, end, matchers)
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?;
        }
        Ok(())
    }

    /// Write a snapshot into a fresh directory under `<data dir>/snapshots`
    /// and return the directory name.
    pub async fn snapshot(&self, skip_head: bool) -> Result<String, ApiError> {
        self.check()?;
        let name = format!(
            "{}-{:016x}",
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            rand::random::<u64>() >> 1
        );
        let dir = self.data_dir.join(SNAPSHOT_SUBDIR).join(&name);

        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            error!("Failed to create snapshot directory {}: {}", dir.display(), e);
            ApiError::internal(format!("create snapshot directory: {}", e))
        })?;
        self.tsdb.snapshot(&dir, !skip_head).await.map_err(|e| {
            error!("Failed to create snapshot {}: {}", name, e);
            ApiError::internal(format!("create snapshot: {}", e))
        })?;

        info!("Created snapshot {}", name);
        Ok(name)
    }

    pub async fn clean_tombstones(&self) -> Result<(), ApiError> {
        self.check()?;
        self.tsdb
            .clean_tombstones()
            .await
            .map_err(|e| ApiError::internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::error::ErrorType;
    use crate::model::{Labels, MAX_TIME, METRIC_NAME, MIN_TIME};
    use tempfile::tempdir;

    fn facade(enabled: bool) -> (tempfile::TempDir, Store, AdminFacade) {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db")).unwrap();
        let admin = AdminFacade::new(enabled, dir.path(), Arc::new(store.clone()));
        (dir, store, admin)
    }

    #[tokio::test]
    async fn test_disabled() {
        let (_dir, _store, admin) = facade(false);

        let err = admin.snapshot(false).await.unwrap_err();
        assert_eq!(err.kind, ErrorType::Unavailable);
        assert_eq!(err.message, "admin APIs disabled");

        // Disabled wins over argument validation.
        let err = admin
            .delete_series(&Context::background(), 0, 1, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorType::Unavailable);
        assert!(admin.clean_tombstones().await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_directory() {
        let (dir, _store, admin) = facade(true);
        let name = admin.snapshot(true).await.unwrap();

        // 20240101T000000Z-0123456789abcdef
        let (stamp, suffix) = name.split_once('-').unwrap();
        assert_eq!(stamp.len(), 16);
        assert!(stamp.ends_with('Z'));
        assert_eq!(suffix.len(), 16);
        assert!(dir.path().join("snapshots").join(&name).is_dir());
    }

    #[tokio::test]
    async fn test_delete_series() {
        let (_dir, store, admin) = facade(true);
        let up: Labels = [(METRIC_NAME, "up"), ("job", "x")].into_iter().collect();
        store.append(&up, 1_000, 1.0).unwrap();

        let err = admin
            .delete_series(&Context::background(), MIN_TIME, MAX_TIME, &[])
            .await
            .unwrap_err();
        assert_eq!(err.message, "no match[] parameter provided");

        let sets = vec![vec![Matcher::equal("job", "x")]];
        admin
            .delete_series(&Context::background(), MIN_TIME, MAX_TIME, &sets)
            .await
            .unwrap();
        admin.clean_tombstones().await.unwrap();
        let left = store.select(&sets[0], MIN_TIME, MAX_TIME, 0).unwrap();
        assert!(left.is_empty());
    }
}
