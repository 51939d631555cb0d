//! Configuration module for querygate.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::discovery::GlobalUrlOptions;
use crate::model::{format_compact_duration, parse_compact_duration};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to (default: "0.0.0.0:9090")
    pub listen_address: String,
    /// Path to the SQLite database file (default: "data/querygate.db")
    pub db_path: String,
    /// Directory holding snapshots (default: "data")
    pub data_dir: String,
    /// Enable the admin endpoints (default: false)
    pub enable_admin: bool,
    /// Regex of origins allowed by CORS (default: ".*")
    pub cors_origin: String,
    /// URL under which this server is reachable from outside
    pub external_url: String,
    /// Run without local storage (default: false)
    pub agent_mode: bool,
    pub lookback_delta: Duration,
    pub query_timeout: Duration,
    pub max_notification_subscribers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9090".to_string(),
            db_path: "data/querygate.db".to_string(),
            data_dir: "data".to_string(),
            enable_admin: false,
            cors_origin: ".*".to_string(),
            external_url: "http://localhost:9090".to_string(),
            agent_mode: false,
            lookback_delta: Duration::from_secs(5 * 60),
            query_timeout: Duration::from_secs(2 * 60),
            max_notification_subscribers: 16,
        }
    }
}

fn env_parsed<T>(name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = env::var(name).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!("Ignoring invalid value {:?} for {}", raw, name);
    }
    parsed
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    parse_compact_duration(s).ok()?.to_std().ok()
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `QUERYGATE_LISTEN_ADDRESS`: bind address (default: "0.0.0.0:9090")
    /// - `QUERYGATE_DB_PATH`: database file path (default: "data/querygate.db")
    /// - `QUERYGATE_DATA_DIR`: data directory (default: "data")
    /// - `QUERYGATE_ENABLE_ADMIN`: enable admin APIs (default: false)
    /// - `QUERYGATE_CORS_ORIGIN`: CORS origin regex (default: ".*")
    /// - `QUERYGATE_EXTERNAL_URL`: external URL (default: "http://localhost:9090")
    /// - `QUERYGATE_AGENT_MODE`: run without local storage (default: false)
    /// - `QUERYGATE_LOOKBACK_DELTA`: instant vector lookback (default: "5m")
    /// - `QUERYGATE_QUERY_TIMEOUT`: maximum query duration (default: "2m")
    /// - `QUERYGATE_MAX_NOTIFICATION_SUBSCRIBERS`: live notification
    ///   listeners (default: 16)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(addr) = env::var("QUERYGATE_LISTEN_ADDRESS") {
            cfg.listen_address = addr;
        }
        if let Ok(db_path) = env::var("QUERYGATE_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(data_dir) = env::var("QUERYGATE_DATA_DIR") {
            cfg.data_dir = data_dir;
        }
        if let Some(v) = env_parsed("QUERYGATE_ENABLE_ADMIN", parse_bool) {
            cfg.enable_admin = v;
        }
        if let Some(v) = env_parsed("QUERYGATE_CORS_ORIGIN", |s| {
            regex::Regex::new(s).ok().map(|_| s.to_string())
        }) {
            cfg.cors_origin = v;
        }
        if let Some(v) = env_parsed("QUERYGATE_EXTERNAL_URL", |s| {
            Url::parse(s)
                .ok()
                .filter(|u| u.has_host())
                .map(|_| s.trim_end_matches('/').to_string())
        }) {
            cfg.external_url = v;
        }
        if let Some(v) = env_parsed("QUERYGATE_AGENT_MODE", parse_bool) {
            cfg.agent_mode = v;
        }
        if let Some(v) = env_parsed("QUERYGATE_LOOKBACK_DELTA", parse_duration) {
            cfg.lookback_delta = v;
        }
        if let Some(v) = env_parsed("QUERYGATE_QUERY_TIMEOUT", parse_duration) {
            cfg.query_timeout = v;
        }
        if let Some(v) = env_parsed("QUERYGATE_MAX_NOTIFICATION_SUBSCRIBERS", |s| s.parse().ok()) {
            cfg.max_notification_subscribers = v;
        }

        cfg
    }

    /// The effective configuration as served by `/status/flags`.
    pub fn flags(&self) -> BTreeMap<String, String> {
        let mut flags = BTreeMap::new();
        let mut set = |k: &str, v: String| {
            flags.insert(k.to_string(), v);
        };
        set("web.listen-address", self.listen_address.clone());
        set("web.external-url", self.external_url.clone());
        set("web.cors.origin", self.cors_origin.clone());
        set("web.enable-admin-api", self.enable_admin.to_string());
        set(
            "web.max-notifications-subscribers",
            self.max_notification_subscribers.to_string(),
        );
        set("storage.tsdb.path", self.db_path.clone());
        set("storage.data-dir", self.data_dir.clone());
        set("agent", self.agent_mode.to_string());
        set(
            "query.lookback-delta",
            format_compact_duration(self.lookback_delta.as_millis() as i64),
        );
        set(
            "query.timeout",
            format_compact_duration(self.query_timeout.as_millis() as i64),
        );
        flags
    }

    /// The configuration as a YAML document, for `/status/config`.
    pub fn to_yaml(&self) -> String {
        let mut out = String::new();
        out.push_str("web:\n");
        out.push_str(&format!("  listen_address: {:?}\n", self.listen_address));
        out.push_str(&format!("  external_url: {:?}\n", self.external_url));
        out.push_str(&format!("  cors_origin: {:?}\n", self.cors_origin));
        out.push_str(&format!("  enable_admin: {}\n", self.enable_admin));
        out.push_str(&format!(
            "  max_notification_subscribers: {}\n",
            self.max_notification_subscribers
        ));
        out.push_str("storage:\n");
        out.push_str(&format!("  db_path: {:?}\n", self.db_path));
        out.push_str(&format!("  data_dir: {:?}\n", self.data_dir));
        out.push_str(&format!("  agent_mode: {}\n", self.agent_mode));
        out.push_str("query:\n");
        out.push_str(&format!(
            "  lookback_delta: {}\n",
            format_compact_duration(self.lookback_delta.as_millis() as i64)
        ));
        out.push_str(&format!(
            "  timeout: {}\n",
            format_compact_duration(self.query_timeout.as_millis() as i64)
        ));
        out
    }

    /// Scheme and host of the external URL, plus our own listen address.
    pub fn global_url_options(&self) -> GlobalUrlOptions {
        let (scheme, host) = match Url::parse(&self.external_url) {
            Ok(url) => {
                let host = url.host_str().unwrap_or_default();
                let host = match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                (url.scheme().to_string(), host)
            }
            Err(e) => {
                warn!("Cannot parse external URL {:?}: {}", self.external_url, e);
                ("http".to_string(), self.external_url.clone())
            }
        };
        GlobalUrlOptions {
            listen_address: self.listen_address.clone(),
            host,
            scheme,
        }
    }
}
