//! Read-only registries of scrape targets and alertmanagers.
//!
//! Collecting targets is someone else's job; the gateway only projects what
//! these retrievers hand it.

use crate::model::Labels;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::{Host, Url};

/// Hostnames that only make sense from inside this machine.
pub const LOCALHOST_REPRESENTATIONS: [&str; 3] = ["127.0.0.1", "localhost", "::1"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetHealth {
    #[default]
    Unknown,
    Up,
    Down,
}

/// Metadata a target exposed for one metric family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricMetadata {
    #[serde(skip)]
    pub metric_family: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub help: String,
    pub unit: String,
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeTarget {
    /// Labels before relabelling.
    pub discovered_labels: Labels,
    pub labels: Labels,
    pub scrape_url: String,
    pub last_error: Option<String>,
    pub last_scrape: Option<DateTime<Utc>>,
    pub last_scrape_duration: Duration,
    pub health: TargetHealth,
    pub metadata: Vec<MetricMetadata>,
}

impl ScrapeTarget {
    pub fn get_metadata(&self, metric: &str) -> Option<&MetricMetadata> {
        self.metadata.iter().find(|m| m.metric_family == metric)
    }
}

pub trait ScrapePoolsRetriever: Send + Sync {
    fn scrape_pools(&self) -> Vec<String>;
}

/// Targets keyed by scrape pool.
pub trait TargetRetriever: Send + Sync {
    fn targets_active(&self) -> BTreeMap<String, Vec<ScrapeTarget>>;
    fn targets_dropped(&self) -> BTreeMap<String, Vec<ScrapeTarget>>;
    fn targets_dropped_counts(&self) -> BTreeMap<String, usize>;
}

pub trait AlertmanagerRetriever: Send + Sync {
    fn alertmanagers(&self) -> Vec<String>;
    fn dropped_alertmanagers(&self) -> Vec<String>;
}

/// A fixed set of targets and alertmanagers, configured at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    active: BTreeMap<String, Vec<ScrapeTarget>>,
    dropped: BTreeMap<String, Vec<ScrapeTarget>>,
    alertmanagers: Vec<String>,
    dropped_alertmanagers: Vec<String>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_active(mut self, pool: &str, target: ScrapeTarget) -> Self {
        self.active.entry(pool.to_string()).or_default().push(target);
        self
    }

    pub fn with_dropped(mut self, pool: &str, target: ScrapeTarget) -> Self {
        self.dropped.entry(pool.to_string()).or_default().push(target);
        self
    }

    pub fn with_alertmanager(mut self, url: &str, active: bool) -> Self {
        if active {
            self.alertmanagers.push(url.to_string());
        } else {
            self.dropped_alertmanagers.push(url.to_string());
        }
        self
    }
}

impl ScrapePoolsRetriever for StaticDiscovery {
    fn scrape_pools(&self) -> Vec<String> {
        let mut pools: Vec<String> = self
            .active
            .keys()
            .chain(self.dropped.keys())
            .cloned()
            .collect();
        pools.sort();
        pools.dedup();
        pools
    }
}

impl TargetRetriever for StaticDiscovery {
    fn targets_active(&self) -> BTreeMap<String, Vec<ScrapeTarget>> {
        self.active.clone()
    }

    fn targets_dropped(&self) -> BTreeMap<String, Vec<ScrapeTarget>> {
        self.dropped.clone()
    }

    fn targets_dropped_counts(&self) -> BTreeMap<String, usize> {
        self.dropped
            .iter()
            .map(|(pool, targets)| (pool.clone(), targets.len()))
            .collect()
    }
}

impl AlertmanagerRetriever for StaticDiscovery {
    fn alertmanagers(&self) -> Vec<String> {
        self.alertmanagers.clone()
    }

    fn dropped_alertmanagers(&self) -> Vec<String> {
        self.dropped_alertmanagers.clone()
    }
}

// ============================================================================
// Global URL
// ============================================================================

/// How this server is reachable from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalUrlOptions {
    pub listen_address: String,
    pub host: String,
    pub scheme: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    #[error(transparent)]
    Parse(#[from] url::ParseError),
    #[error("missing host in URL {0:?}")]
    MissingHost(String),
    #[error("address {0}: missing port in address")]
    MissingPort(String),
    #[error("cannot rewrite URL {0:?} to {1}")]
    Rewrite(String, String),
}

/// Host of `url` without IPv6 brackets.
fn bare_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(d) => Some(d.to_string()),
        Host::Ipv4(a) => Some(a.to_string()),
        Host::Ipv6(a) => Some(a.to_string()),
    }
}

/// Port of a `host:port` listen address. `:9090` binds every interface.
fn listen_port(listen_address: &str) -> Result<u16, UrlError> {
    let addr = if listen_address.starts_with(':') {
        format!("http://0.0.0.0{}", listen_address)
    } else {
        format!("http://{}", listen_address)
    };
    Url::parse(&addr)
        .ok()
        .and_then(|u| u.port())
        .ok_or_else(|| UrlError::MissingPort(listen_address.to_string()))
}

/// Rewrite a loopback scrape URL into one that is reachable from outside.
///
/// When the target is this very server (loopback host on our listen port)
/// scheme, host and port all come from `opts`. Any other loopback target
/// only gets its hostname replaced; its port is kept as we cannot know the
/// external one.
pub fn global_url(scrape_url: &str, opts: &GlobalUrlOptions) -> Result<String, UrlError> {
    let mut url = Url::parse(scrape_url)?;
    let host = bare_host(&url).ok_or_else(|| UrlError::MissingHost(scrape_url.to_string()))?;
    if !LOCALHOST_REPRESENTATIONS.contains(&host.as_str()) {
        return Ok(scrape_url.to_string());
    }

    let own_port = listen_port(&opts.listen_address)?;
    let external = Url::parse(&format!("{}://{}", opts.scheme, opts.host))?;
    let rewrite_err = || UrlError::Rewrite(scrape_url.to_string(), external.to_string());

    url.set_host(external.host_str())?;
    if url.port_or_known_default() == Some(own_port) {
        url.set_scheme(external.scheme()).map_err(|_| rewrite_err())?;
        url.set_port(external.port()).map_err(|_| rewrite_err())?;
    }
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> GlobalUrlOptions {
        GlobalUrlOptions {
            listen_address: "0.0.0.0:9090".to_string(),
            host: "prom.example.com:8443".to_string(),
            scheme: "https".to_string(),
        }
    }

    #[test]
    fn test_global_url_self_scrape() {
        let url = global_url("http://localhost:9090/metrics", &opts()).unwrap();
        assert_eq!(url, "https://prom.example.com:8443/metrics");

        let url = global_url("http://[::1]:9090/metrics", &opts()).unwrap();
        assert_eq!(url, "https://prom.example.com:8443/metrics");
    }

    #[test]
    fn test_global_url_other_loopback_port() {
        let url = global_url("http://127.0.0.1:9100/metrics?x=1", &opts()).unwrap();
        assert_eq!(url, "http://prom.example.com:9100/metrics?x=1");

        let url = global_url("http://localhost/metrics", &opts()).unwrap();
        assert_eq!(url, "http://prom.example.com/metrics");
    }

    #[test]
    fn test_global_url_leaves_remote_hosts() {
        let url = global_url("http://node1:9100/metrics", &opts()).unwrap();
        assert_eq!(url, "http://node1:9100/metrics");
    }

    #[test]
    fn test_global_url_default_external_port() {
        let opts = GlobalUrlOptions {
            host: "prom.example.com".to_string(),
            ..opts()
        };
        let url = global_url("http://localhost:9090/metrics", &opts).unwrap();
        assert_eq!(url, "https://prom.example.com/metrics");
    }

    #[test]
    fn test_global_url_errors() {
        assert!(matches!(
            global_url("localhost:9100", &opts()),
            Err(UrlError::MissingHost(_))
        ));
        assert!(matches!(
            global_url("/metrics", &opts()),
            Err(UrlError::Parse(_))
        ));

        let bad = GlobalUrlOptions {
            listen_address: "0.0.0.0".to_string(),
            ..opts()
        };
        assert!(matches!(
            global_url("http://localhost:9100/metrics", &bad),
            Err(UrlError::MissingPort(_))
        ));
    }

    #[test]
    fn test_static_discovery() {
        let discovery = StaticDiscovery::new()
            .with_active("b", ScrapeTarget::default())
            .with_active("a", ScrapeTarget::default())
            .with_dropped("b", ScrapeTarget::default())
            .with_dropped("b", ScrapeTarget::default());

        assert_eq!(discovery.scrape_pools(), vec!["a", "b"]);
        assert_eq!(discovery.targets_dropped_counts()["b"], 2);
        assert_eq!(discovery.targets_active().len(), 2);
    }
}
