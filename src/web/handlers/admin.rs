use crate::error::ApiError;
use crate::expr;
use crate::model::{MAX_TIME, MIN_TIME};
use crate::params::parse_bool;
use crate::web::{ApiFuncResult, ApiRequest, AppState};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct SnapshotData {
    name: String,
}

pub async fn delete_series(state: AppState, req: ApiRequest) -> ApiFuncResult {
    tombstone(&state, &req).await.unwrap_or_else(ApiFuncResult::from)
}

async fn tombstone(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    state.admin.check()?;

    let selectors = req.values("match[]");
    if selectors.is_empty() {
        return Err(ApiError::bad_data("no match[] parameter provided"));
    }
    let start = req.time_param("start", MIN_TIME)?;
    let end = req.time_param("end", MAX_TIME)?;

    let mut sets = Vec::with_capacity(selectors.len());
    for s in &selectors {
        sets.push(expr::parse_metric_selector(s).map_err(|e| ApiError::invalid_param(e, "match[]"))?);
    }

    state.admin.delete_series(req.ctx(), start, end, &sets).await?;
    Ok(ApiFuncResult::empty())
}

pub async fn snapshot(state: AppState, req: ApiRequest) -> ApiFuncResult {
    take_snapshot(&state, &req).await.unwrap_or_else(ApiFuncResult::from)
}

async fn take_snapshot(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    state.admin.check()?;

    let skip_head = match req.value("skip_head") {
        "" => false,
        s => parse_bool(s).map_err(|e| {
            ApiError::invalid_param(format!("unable to parse boolean: {}", e), "skip_head")
        })?,
    };

    let name = state.admin.snapshot(skip_head).await?;
    Ok(ApiFuncResult::ok(SnapshotData { name }))
}

pub async fn clean_tombstones(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    match state.admin.clean_tombstones().await {
        Ok(()) => ApiFuncResult::empty(),
        Err(e) => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use crate::admin::AdminFacade;
    use crate::model::Labels;
    use crate::web::handlers::testing::{get, router, send, test_api};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn post_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let (status, body) = send(app, post(uri)).await;
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&body).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_admin_disabled() {
        let (api, _store, _dir) = test_api();
        let app = router(api);

        for uri in [
            "/api/v1/admin/tsdb/snapshot",
            "/api/v1/admin/tsdb/clean_tombstones",
            "/api/v1/admin/tsdb/delete_series",
        ] {
            let (status, json) = post_json(&app, uri).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
            assert_eq!(json["errorType"], "unavailable");
            assert_eq!(json["error"], "admin APIs disabled");
        }
    }

    #[tokio::test]
    async fn test_snapshot() {
        let (mut api, _store, dir) = test_api();
        api.admin = AdminFacade::new(true, dir.path(), api.tsdb.clone());
        let app = router(api);

        let (status, json) = post_json(&app, "/api/v1/admin/tsdb/snapshot?skip_head=true").await;
        assert_eq!(status, StatusCode::OK);
        let name = json["data"]["name"].as_str().unwrap();
        assert!(dir.path().join("snapshots").join(name).is_dir());

        let (status, json) = post_json(&app, "/api/v1/admin/tsdb/snapshot?skip_head=maybe").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid parameter \"skip_head\": unable to parse boolean"));
    }

    #[tokio::test]
    async fn test_delete_series_and_clean_tombstones() {
        let (mut api, store, dir) = test_api();
        api.admin = AdminFacade::new(true, dir.path(), api.tsdb.clone());
        let up: Labels = [("__name__", "up"), ("job", "api")].into_iter().collect();
        store.append(&up, 1000, 1.0).unwrap();
        let app = router(api);

        let (status, json) = post_json(&app, "/api/v1/admin/tsdb/delete_series").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "no match[] parameter provided");

        let (status, json) = post_json(&app, "/api/v1/admin/tsdb/delete_series?match%5B%5D=up%7B").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid parameter \"match[]\""));

        let (status, _) = post_json(&app, "/api/v1/admin/tsdb/delete_series?match%5B%5D=up").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = post_json(&app, "/api/v1/admin/tsdb/clean_tombstones").await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, json) = get(&app, "/api/v1/series?match%5B%5D=up").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"], serde_json::json!([]));
    }
}
