//! Filtering and pagination of rule groups for `/rules`.

use super::{Alert, AlertingRule, RecordingRule, RuleGroup, RuleHealth};
use crate::model::{format_float_exp, Labels, Matcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("invalid group_next_token '{0}'. were rule groups changed?")]
    TokenNotFound(String),
    #[error("failed to assert type of rule '{0}'")]
    UnknownRule(String),
}

/// Which rule kinds to return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuleKindFilter {
    #[default]
    Any,
    Alert,
    Record,
}

impl RuleKindFilter {
    /// Case-insensitive; empty means any.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "" => Some(RuleKindFilter::Any),
            "alert" => Some(RuleKindFilter::Alert),
            "record" => Some(RuleKindFilter::Record),
            _ => None,
        }
    }

    fn alerts(self) -> bool {
        self != RuleKindFilter::Record
    }

    fn records(self) -> bool {
        self != RuleKindFilter::Alert
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub rule_names: HashSet<String>,
    pub groups: HashSet<String>,
    pub files: HashSet<String>,
    pub matchers: Vec<Vec<Matcher>>,
    pub kind: RuleKindFilter,
    pub exclude_alerts: bool,
}

/// A page request. `limit` of `None` returns every group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<usize>,
    pub next_token: String,
}

/// Opaque continuation token for a group.
pub fn next_token(file: &str, group: &str) -> String {
    format!("{:x}", Sha256::digest(format!("{};{}", file, group).as_bytes()))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAlert {
    pub labels: Labels,
    pub annotations: Labels,
    pub state: String,
    pub active_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_firing_since: Option<DateTime<Utc>>,
    pub value: String,
}

impl From<&Alert> for ApiAlert {
    fn from(a: &Alert) -> Self {
        Self {
            labels: a.labels.clone(),
            annotations: a.annotations.clone(),
            state: a.state.to_string(),
            active_at: a.active_at,
            keep_firing_since: a.keep_firing_since,
            value: format_float_exp(a.value),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertDiscovery {
    pub alerts: Vec<ApiAlert>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAlertingRule {
    pub state: String,
    pub name: String,
    pub query: String,
    pub duration: f64,
    pub keep_firing_for: f64,
    pub labels: Labels,
    pub annotations: Labels,
    pub alerts: Vec<ApiAlert>,
    pub health: RuleHealth,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub evaluation_time: f64,
    pub last_evaluation: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRecordingRule {
    pub name: String,
    pub query: String,
    #[serde(skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
    pub health: RuleHealth,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub evaluation_time: f64,
    pub last_evaluation: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ApiRule {
    #[serde(rename = "alerting")]
    Alerting(ApiAlertingRule),
    #[serde(rename = "recording")]
    Recording(ApiRecordingRule),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRuleGroup {
    pub name: String,
    pub file: String,
    pub rules: Vec<ApiRule>,
    pub interval: f64,
    pub limit: usize,
    pub evaluation_time: f64,
    pub last_evaluation: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDiscovery {
    pub groups: Vec<ApiRuleGroup>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group_next_token: String,
}

fn alerting_rule(rule: &AlertingRule, exclude_alerts: bool) -> ApiAlertingRule {
    let alerts = if exclude_alerts {
        Vec::new()
    } else {
        rule.active_alerts().map(ApiAlert::from).collect()
    };
    ApiAlertingRule {
        state: rule.state().to_string(),
        name: rule.name.clone(),
        query: rule.query.clone(),
        duration: rule.hold_duration.as_secs_f64(),
        keep_firing_for: rule.keep_firing_for.as_secs_f64(),
        labels: rule.labels.clone(),
        annotations: rule.annotations.clone(),
        alerts,
        health: rule.status.health,
        last_error: rule.status.last_error.clone().unwrap_or_default(),
        evaluation_time: rule.status.evaluation_time.as_secs_f64(),
        last_evaluation: rule.status.last_evaluation,
    }
}

fn recording_rule(rule: &RecordingRule) -> ApiRecordingRule {
    ApiRecordingRule {
        name: rule.name.clone(),
        query: rule.query.clone(),
        labels: rule.labels.clone(),
        health: rule.status.health,
        last_error: rule.status.last_error.clone().unwrap_or_default(),
        evaluation_time: rule.status.evaluation_time.as_secs_f64(),
        last_evaluation: rule.status.last_evaluation,
    }
}

/// Filter `groups` and cut one page out of them.
///
/// Groups keep the retriever's order. A group left without rules after
/// filtering is skipped and does not count against the page. When a page is
/// full the token of the first group that did not fit is returned so the
/// next request resumes there.
pub fn aggregate(
    groups: &[RuleGroup],
    filter: &RuleFilter,
    page: &Page,
) -> Result<RuleDiscovery, AggregateError> {
    let paginating = page.limit.is_some() && !page.next_token.is_empty();
    let mut found_token = false;
    let mut res = RuleDiscovery::default();

    for grp in groups {
        if paginating && !found_token {
            if page.next_token != next_token(&grp.file, &grp.name) {
                continue;
            }
            found_token = true;
        }

        if !filter.groups.is_empty() && !filter.groups.contains(&grp.name) {
            continue;
        }
        if !filter.files.is_empty() && !filter.files.contains(&grp.file) {
            continue;
        }

        let mut rules = Vec::new();
        for rule in grp.rules(&filter.matchers) {
            if !filter.rule_names.is_empty() && !filter.rule_names.contains(rule.name()) {
                continue;
            }

            let any = rule.as_any();
            if let Some(alerting) = any.downcast_ref::<AlertingRule>() {
                if filter.kind.alerts() {
                    rules.push(ApiRule::Alerting(alerting_rule(alerting, filter.exclude_alerts)));
                }
            } else if let Some(recording) = any.downcast_ref::<RecordingRule>() {
                if filter.kind.records() {
                    rules.push(ApiRule::Recording(recording_rule(recording)));
                }
            } else {
                return Err(AggregateError::UnknownRule(rule.name().to_string()));
            }
        }

        if rules.is_empty() {
            continue;
        }
        if page.limit == Some(res.groups.len()) {
            res.group_next_token = next_token(&grp.file, &grp.name);
            break;
        }
        res.groups.push(ApiRuleGroup {
            name: grp.name.clone(),
            file: grp.file.clone(),
            rules,
            interval: grp.interval.as_secs_f64(),
            limit: grp.limit,
            evaluation_time: grp.evaluation_time.as_secs_f64(),
            last_evaluation: grp.last_evaluation,
        });
    }

    if paginating && !found_token {
        return Err(AggregateError::TokenNotFound(page.next_token.clone()));
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{AlertState, Rule};
    use std::any::Any;
    use std::sync::Arc;

    struct OddRule(Labels);

    impl Rule for OddRule {
        fn name(&self) -> &str {
            "odd"
        }

        fn labels(&self) -> &Labels {
            &self.0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn alert(name: &str) -> Arc<dyn Rule> {
        Arc::new(AlertingRule {
            name: name.to_string(),
            alerts: vec![Alert {
                state: AlertState::Firing,
                value: 1.0,
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    fn record(name: &str) -> Arc<dyn Rule> {
        Arc::new(RecordingRule {
            name: name.to_string(),
            ..Default::default()
        })
    }

    fn group(file: &str, name: &str, rules: Vec<Arc<dyn Rule>>) -> RuleGroup {
        RuleGroup {
            name: name.to_string(),
            file: file.to_string(),
            rules,
            ..Default::default()
        }
    }

    fn groups() -> Vec<RuleGroup> {
        vec![
            group("a.yml", "g1", vec![alert("A1"), record("r1")]),
            group("a.yml", "g2", vec![record("r2")]),
            group("b.yml", "g3", vec![alert("A3")]),
        ]
    }

    #[test]
    fn test_token_is_deterministic() {
        assert_eq!(next_token("a.yml", "g1"), next_token("a.yml", "g1"));
        assert_ne!(next_token("a.yml", "g1"), next_token("a.yml", "g2"));
        assert_eq!(next_token("a", "b").len(), 64);
    }

    #[test]
    fn test_pagination_visits_each_group_once() {
        let groups = groups();
        let mut page = Page {
            limit: Some(1),
            next_token: String::new(),
        };
        let mut seen = Vec::new();

        loop {
            let res = aggregate(&groups, &RuleFilter::default(), &page).unwrap();
            assert_eq!(res.groups.len(), 1);
            seen.push(res.groups[0].name.clone());
            if res.group_next_token.is_empty() {
                break;
            }
            page.next_token = res.group_next_token;
        }
        assert_eq!(seen, vec!["g1", "g2", "g3"]);
    }

    #[test]
    fn test_filtered_groups_do_not_count() {
        let filter = RuleFilter {
            kind: RuleKindFilter::Alert,
            ..Default::default()
        };
        let page = Page {
            limit: Some(1),
            next_token: String::new(),
        };
        let res = aggregate(&groups(), &filter, &page).unwrap();
        assert_eq!(res.groups[0].name, "g1");
        assert_eq!(res.groups[0].rules.len(), 1);
        // g2 has no alerting rules, so the next page starts at g3.
        assert_eq!(res.group_next_token, next_token("b.yml", "g3"));
    }

    #[test]
    fn test_unknown_token() {
        let page = Page {
            limit: Some(1),
            next_token: "deadbeef".to_string(),
        };
        let err = aggregate(&groups(), &RuleFilter::default(), &page).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid group_next_token 'deadbeef'. were rule groups changed?"
        );
    }

    #[test]
    fn test_name_file_and_group_filters() {
        let filter = RuleFilter {
            files: ["a.yml".to_string()].into_iter().collect(),
            rule_names: ["r2".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let res = aggregate(&groups(), &filter, &Page::default()).unwrap();
        assert_eq!(res.groups.len(), 1);
        assert_eq!(res.groups[0].name, "g2");

        let filter = RuleFilter {
            groups: ["g3".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let res = aggregate(&groups(), &filter, &Page::default()).unwrap();
        assert_eq!(res.groups.len(), 1);
        assert!(res.group_next_token.is_empty());
    }

    #[test]
    fn test_rendering_and_exclude_alerts() {
        let res = aggregate(&groups(), &RuleFilter::default(), &Page::default()).unwrap();
        let json = serde_json::to_value(&res).unwrap();
        let rule = &json["groups"][0]["rules"][0];
        assert_eq!(rule["type"], "alerting");
        assert_eq!(rule["state"], "firing");
        assert_eq!(rule["alerts"][0]["value"], "1e+00");
        assert!(rule.get("lastError").is_none());
        assert_eq!(json["groups"][0]["rules"][1]["type"], "recording");
        assert!(json.get("groupNextToken").is_none());

        let filter = RuleFilter {
            exclude_alerts: true,
            ..Default::default()
        };
        let res = aggregate(&groups(), &filter, &Page::default()).unwrap();
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["groups"][0]["rules"][0]["alerts"], serde_json::json!([]));
    }

    #[test]
    fn test_unknown_rule_kind() {
        let odd: Arc<dyn Rule> = Arc::new(OddRule(Labels::new()));
        let groups = vec![group("c.yml", "g", vec![odd])];
        let err = aggregate(&groups, &RuleFilter::default(), &Page::default()).unwrap_err();
        assert_eq!(err, AggregateError::UnknownRule("odd".to_string()));
    }

    #[test]
    fn test_kind_filter_parse() {
        assert_eq!(RuleKindFilter::parse("ALERT"), Some(RuleKindFilter::Alert));
        assert_eq!(RuleKindFilter::parse(""), Some(RuleKindFilter::Any));
        assert_eq!(RuleKindFilter::parse("both"), None);
    }
}
