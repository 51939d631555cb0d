use crate::error::ApiError;
use crate::params::parse_bool;
use crate::rules::{aggregate, AggregateError, AlertDiscovery, ApiAlert, Page, RuleFilter, RuleKindFilter};
use crate::web::{ApiFuncResult, ApiRequest, AppState};
use std::collections::HashSet;

pub async fn alerts(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    let alerts = state
        .rules
        .alerting_rules()
        .iter()
        .flat_map(|rule| rule.active_alerts().map(ApiAlert::from).collect::<Vec<_>>())
        .collect();
    ApiFuncResult::ok(AlertDiscovery { alerts })
}

pub async fn rules(state: AppState, req: ApiRequest) -> ApiFuncResult {
    list_rules(&state, &req).unwrap_or_else(ApiFuncResult::from)
}

fn value_set(req: &ApiRequest, name: &str) -> HashSet<String> {
    req.values(name).into_iter().collect()
}

fn page_param(req: &ApiRequest) -> Result<Page, ApiError> {
    let limit = req.query_value("group_limit");
    let token = req.query_value("group_next_token");

    if limit.is_empty() {
        if !token.is_empty() {
            return Err(ApiError::invalid_param(
                "group_limit needs to be present in order to paginate over the groups",
                "group_next_token",
            ));
        }
        return Ok(Page::default());
    }

    let n: i32 = limit.parse().map_err(|e| {
        ApiError::invalid_param(
            format!("group_limit needs to be a valid number: {}", e),
            "group_limit",
        )
    })?;
    if n <= 0 {
        return Err(ApiError::invalid_param(
            "group_limit needs to be greater than 0",
            "group_limit",
        ));
    }

    Ok(Page {
        limit: Some(n as usize),
        next_token: token.to_string(),
    })
}

fn list_rules(state: &AppState, req: &ApiRequest) -> Result<ApiFuncResult, ApiError> {
    let matchers = req
        .matcher_sets()
        .map_err(|e| ApiError::bad_data(e.to_string()))?;
    let groups = state.rules.rule_groups();

    let kind = req.query_value("type");
    let kind = RuleKindFilter::parse(kind).ok_or_else(|| {
        ApiError::invalid_param(format!("not supported value {:?}", kind.to_lowercase()), "type")
    })?;

    let exclude_alerts = match req.query_value("exclude_alerts").to_lowercase().as_str() {
        "" => false,
        s => parse_bool(s).map_err(|e| {
            ApiError::invalid_param(format!("error converting exclude_alerts: {}", e), "exclude_alerts")
        })?,
    };

    let filter = RuleFilter {
        rule_names: value_set(req, "rule_name[]"),
        groups: value_set(req, "rule_group[]"),
        files: value_set(req, "file[]"),
        matchers,
        kind,
        exclude_alerts,
    };
    let page = page_param(req)?;

    match aggregate(&groups, &filter, &page) {
        Ok(res) => Ok(ApiFuncResult::ok(res)),
        Err(e @ AggregateError::TokenNotFound(_)) => Err(ApiError::invalid_param(e, "group_next_token")),
        Err(e @ AggregateError::UnknownRule(_)) => Err(ApiError::internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use crate::rules::{Alert, AlertState, AlertingRule, RecordingRule, Rule, RuleGroup, StaticRules};
    use crate::web::handlers::testing::{get, router, test_api};
    use axum::http::StatusCode;
    use std::sync::Arc;

    fn groups() -> Vec<RuleGroup> {
        let high_load: Arc<dyn Rule> = Arc::new(AlertingRule {
            name: "HighLoad".to_string(),
            query: "load > 1".to_string(),
            labels: [("severity", "page")].into_iter().collect(),
            alerts: vec![
                Alert {
                    labels: [("instance", "a")].into_iter().collect(),
                    state: AlertState::Firing,
                    value: 2.5,
                    ..Default::default()
                },
                Alert {
                    labels: [("instance", "b")].into_iter().collect(),
                    state: AlertState::Inactive,
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        let rate: Arc<dyn Rule> = Arc::new(RecordingRule {
            name: "job:rate5m".to_string(),
            query: "rate(x[5m])".to_string(),
            ..Default::default()
        });
        let other: Arc<dyn Rule> = Arc::new(RecordingRule {
            name: "other".to_string(),
            ..Default::default()
        });

        vec![
            RuleGroup {
                name: "node".to_string(),
                file: "node.yml".to_string(),
                rules: vec![high_load, rate],
                ..Default::default()
            },
            RuleGroup {
                name: "misc".to_string(),
                file: "misc.yml".to_string(),
                rules: vec![other],
                ..Default::default()
            },
        ]
    }

    fn app() -> (axum::Router, tempfile::TempDir) {
        let (mut api, _store, dir) = test_api();
        api.rules = Arc::new(StaticRules::new(groups()));
        (router(api), dir)
    }

    #[tokio::test]
    async fn test_alerts_lists_active_only() {
        let (app, _dir) = app();
        let (status, json) = get(&app, "/api/v1/alerts").await;
        assert_eq!(status, StatusCode::OK);
        let alerts = json["data"]["alerts"].as_array().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["labels"]["instance"], "a");
        assert_eq!(alerts[0]["state"], "firing");
        assert_eq!(alerts[0]["value"], "2.5e+00");
    }

    #[tokio::test]
    async fn test_rules_pagination() {
        let (app, _dir) = app();

        let (status, json) = get(&app, "/api/v1/rules?group_limit=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["groups"][0]["name"], "node");
        let token = json["data"]["groupNextToken"].as_str().unwrap().to_string();

        let (_, json) = get(
            &app,
            &format!("/api/v1/rules?group_limit=1&group_next_token={}", token),
        )
        .await;
        assert_eq!(json["data"]["groups"][0]["name"], "misc");
        assert!(json["data"].get("groupNextToken").is_none());
    }

    #[tokio::test]
    async fn test_rules_filters() {
        let (app, _dir) = app();

        let (_, json) = get(&app, "/api/v1/rules?type=ALERT").await;
        let groups = json["data"]["groups"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["rules"].as_array().unwrap().len(), 1);

        let (_, json) = get(&app, "/api/v1/rules?type=alert&exclude_alerts=true").await;
        assert_eq!(json["data"]["groups"][0]["rules"][0]["alerts"], serde_json::json!([]));

        let (_, json) = get(&app, "/api/v1/rules?rule_name%5B%5D=other").await;
        assert_eq!(json["data"]["groups"][0]["name"], "misc");

        let (_, json) = get(&app, "/api/v1/rules?match%5B%5D=%7Bseverity%3D%22page%22%7D").await;
        let groups = json["data"]["groups"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["rules"][0]["name"], "HighLoad");
    }

    #[tokio::test]
    async fn test_rules_parameter_errors() {
        let (app, _dir) = app();

        let cases = [
            (
                "/api/v1/rules?group_next_token=abc",
                "invalid parameter \"group_next_token\": group_limit needs to be present in order to paginate over the groups",
            ),
            (
                "/api/v1/rules?group_limit=0",
                "invalid parameter \"group_limit\": group_limit needs to be greater than 0",
            ),
            (
                "/api/v1/rules?type=bogus",
                "invalid parameter \"type\": not supported value \"bogus\"",
            ),
            (
                "/api/v1/rules?group_limit=1&group_next_token=abc",
                "invalid parameter \"group_next_token\": invalid group_next_token 'abc'. were rule groups changed?",
            ),
        ];
        for (uri, message) in cases {
            let (status, json) = get(&app, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(json["error"], message, "{}", uri);
        }

        let (status, json) = get(&app, "/api/v1/rules?exclude_alerts=maybe").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid parameter \"exclude_alerts\": error converting exclude_alerts"));
    }
}
