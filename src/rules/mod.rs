//! Rule groups as seen by the gateway.
//!
//! Rule evaluation happens elsewhere; a [`RulesRetriever`] hands over the
//! current groups with their last evaluation results.

mod aggregator;

pub use aggregator::*;

use crate::model::{matches_all, Labels, Matcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleHealth {
    #[default]
    Unknown,
    Ok,
    Err,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertState {
    #[default]
    Inactive,
    Pending,
    Firing,
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertState::Inactive => "inactive",
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
        };
        write!(f, "{}", s)
    }
}

/// One active alert of an alerting rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Alert {
    pub labels: Labels,
    pub annotations: Labels,
    pub state: AlertState,
    pub active_at: DateTime<Utc>,
    pub keep_firing_since: Option<DateTime<Utc>>,
    pub value: f64,
}

/// Evaluation status shared by every rule kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleStatus {
    pub health: RuleHealth,
    pub last_error: Option<String>,
    pub evaluation_time: Duration,
    pub last_evaluation: DateTime<Utc>,
}

pub trait Rule: Any + Send + Sync {
    fn name(&self) -> &str;
    fn labels(&self) -> &Labels;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Default)]
pub struct AlertingRule {
    pub name: String,
    pub query: String,
    pub hold_duration: Duration,
    pub keep_firing_for: Duration,
    pub labels: Labels,
    pub annotations: Labels,
    pub alerts: Vec<Alert>,
    pub status: RuleStatus,
}

impl AlertingRule {
    /// The most severe state among the active alerts.
    pub fn state(&self) -> AlertState {
        self.alerts.iter().map(|a| a.state).max().unwrap_or_default()
    }

    /// Alerts that are pending or firing.
    pub fn active_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| a.state != AlertState::Inactive)
    }
}

impl Rule for AlertingRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &Labels {
        &self.labels
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingRule {
    pub name: String,
    pub query: String,
    pub labels: Labels,
    pub status: RuleStatus,
}

impl Rule for RecordingRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &Labels {
        &self.labels
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone, Default)]
pub struct RuleGroup {
    pub name: String,
    pub file: String,
    pub interval: Duration,
    pub limit: usize,
    pub evaluation_time: Duration,
    pub last_evaluation: DateTime<Utc>,
    pub rules: Vec<Arc<dyn Rule>>,
}

impl RuleGroup {
    /// Rules whose labels satisfy at least one matcher set. No sets means
    /// every rule.
    pub fn rules(&self, matcher_sets: &[Vec<Matcher>]) -> Vec<Arc<dyn Rule>> {
        if matcher_sets.is_empty() {
            return self.rules.clone();
        }
        self.rules
            .iter()
            .filter(|r| matcher_sets.iter().any(|set| matches_all(set, r.labels())))
            .cloned()
            .collect()
    }
}

pub trait RulesRetriever: Send + Sync {
    fn rule_groups(&self) -> Vec<RuleGroup>;

    fn alerting_rules(&self) -> Vec<AlertingRule> {
        self.rule_groups()
            .iter()
            .flat_map(|g| g.rules.iter())
            .filter_map(|r| r.as_any().downcast_ref::<AlertingRule>().cloned())
            .collect()
    }
}

/// Rule groups fixed at startup.
#[derive(Clone, Default)]
pub struct StaticRules {
    groups: Vec<RuleGroup>,
}

impl StaticRules {
    pub fn new(groups: Vec<RuleGroup>) -> Self {
        Self { groups }
    }
}

impl RulesRetriever for StaticRules {
    fn rule_groups(&self) -> Vec<RuleGroup> {
        self.groups.clone()
    }
}
