use crate::error::ApiError;
use crate::web::{ApiFuncResult, ApiRequest, AppState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Default number of entries per cardinality list in `/status/tsdb`.
const DEFAULT_STATS_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub version: String,
    pub revision: String,
    pub branch: String,
    pub build_user: String,
    pub build_date: String,
    pub rust_version: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            revision: option_env!("QUERYGATE_REVISION").unwrap_or("unknown").to_string(),
            branch: option_env!("QUERYGATE_BRANCH").unwrap_or("unknown").to_string(),
            build_user: option_env!("QUERYGATE_BUILD_USER").unwrap_or("unknown").to_string(),
            build_date: option_env!("QUERYGATE_BUILD_DATE").unwrap_or("unknown").to_string(),
            rust_version: option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub start_time: DateTime<Utc>,
    #[serde(rename = "CWD")]
    pub cwd: String,
    pub hostname: String,
    pub server_time: DateTime<Utc>,
    pub reload_config_success: bool,
    pub last_config_time: DateTime<Utc>,
    pub corruption_count: u64,
    pub available_parallelism: usize,
    pub storage_retention: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigStatus {
    pub yaml: String,
}

#[derive(Debug, Serialize)]
pub struct BlocksStatus {
    pub blocks: Vec<crate::storage::BlockMeta>,
}

fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

// ============================================================================
// Static information
// ============================================================================

pub async fn status_config(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    ApiFuncResult::ok(ConfigStatus {
        yaml: state.config.to_yaml(),
    })
}

pub async fn runtime_info(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir.to_string_lossy().to_string(),
        Err(e) => {
            return ApiError::internal(format!("Error getting working directory: {}", e)).into()
        }
    };

    ApiFuncResult::ok(RuntimeInfo {
        start_time: state.start_time,
        cwd,
        hostname: hostname(),
        server_time: Utc::now(),
        reload_config_success: true,
        last_config_time: state.start_time,
        corruption_count: 0,
        available_parallelism: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        storage_retention: "unlimited".to_string(),
    })
}

pub async fn build_info(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    ApiFuncResult::ok(&state.build_info)
}

pub async fn flags(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    let flags: BTreeMap<String, String> = state.config.flags();
    ApiFuncResult::ok(flags)
}

// ============================================================================
// Storage introspection
// ============================================================================

pub async fn tsdb_status(state: AppState, req: ApiRequest) -> ApiFuncResult {
    let limit = match req.value("limit") {
        "" => DEFAULT_STATS_LIMIT,
        s => match s.parse::<i64>() {
            Ok(n) if n >= 1 => n as usize,
            _ => return ApiError::bad_data("limit must be a positive number").into(),
        },
    };

    match state.tsdb.stats(limit).await {
        Ok(stats) => ApiFuncResult::ok(stats),
        Err(e) => ApiError::internal(format!("error getting head stats: {}", e)).into(),
    }
}

pub async fn tsdb_blocks(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    match state.tsdb.block_metas().await {
        Ok(blocks) => ApiFuncResult::ok(BlocksStatus { blocks }),
        Err(e) => ApiError::internal(format!("error getting block metadata: {}", e)).into(),
    }
}

pub async fn wal_replay(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    match state.tsdb.wal_replay_status().await {
        Ok(status) => ApiFuncResult::ok(status),
        Err(e) => ApiError::internal(e.to_string()).into(),
    }
}

#[cfg(test)]
mod tests {
    use crate::model::Labels;
    use crate::web::handlers::testing::{get, router, test_api};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_static_status_endpoints() {
        let (api, _store, _dir) = test_api();
        let app = router(api);

        let (status, json) = get(&app, "/api/v1/status/buildinfo").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["version"], env!("CARGO_PKG_VERSION"));

        let (_, json) = get(&app, "/api/v1/status/flags").await;
        assert_eq!(json["data"]["web.enable-admin-api"], "false");

        let (_, json) = get(&app, "/api/v1/status/config").await;
        assert!(json["data"]["yaml"].as_str().unwrap().starts_with("web:"));

        let (status, json) = get(&app, "/api/v1/status/runtimeinfo").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["data"]["CWD"].is_string());
        assert_eq!(json["data"]["reloadConfigSuccess"], true);
    }

    #[tokio::test]
    async fn test_tsdb_status() {
        let (api, store, _dir) = test_api();
        for job in ["a", "b", "c"] {
            let labels: Labels = [("__name__", "up"), ("job", job)].into_iter().collect();
            store.append(&labels, 1000, 1.0).unwrap();
        }
        let app = router(api);

        let (status, json) = get(&app, "/api/v1/status/tsdb").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["headStats"]["numSeries"], 3);
        assert_eq!(json["data"]["seriesCountByMetricName"][0]["name"], "up");
        assert_eq!(json["data"]["seriesCountByMetricName"][0]["value"], 3);

        let (_, json) = get(&app, "/api/v1/status/tsdb?limit=1").await;
        assert_eq!(json["data"]["labelValueCountByLabelName"].as_array().unwrap().len(), 1);

        for bad in ["0", "-3", "ten"] {
            let (status, json) = get(&app, &format!("/api/v1/status/tsdb?limit={}", bad)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["error"], "limit must be a positive number");
        }
    }

    #[tokio::test]
    async fn test_blocks_and_wal_replay() {
        let (api, store, _dir) = test_api();
        let labels: Labels = [("__name__", "up")].into_iter().collect();
        store.append(&labels, 1000, 1.0).unwrap();
        let app = router(api);

        let (status, json) = get(&app, "/api/v1/status/tsdb/blocks").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["blocks"][0]["ulid"], "day-19700101");

        let (status, json) = get(&app, "/api/v1/status/walreplay").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"], serde_json::json!({"min": 0, "max": 0, "current": 0}));
    }
}
