//! Web server module.

mod codec;
mod cors;
mod handlers;
mod request;
mod response;

pub use codec::*;
pub use cors::*;
pub use handlers::*;
pub use request::*;
pub use response::*;

use crate::admin::AdminFacade;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::discovery::{AlertmanagerRetriever, ScrapePoolsRetriever, StaticDiscovery, TargetRetriever};
use crate::engine::{default_stats_renderer, QueryEngine, SelectorEngine, StatsRenderer};
use crate::error::ApiError;
use crate::notifications::NotificationHub;
use crate::rules::{RulesRetriever, StaticRules};
use crate::storage::{ExemplarQueryable, Queryable, TsdbAdmin};

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Every collaborator the API handlers talk to.
pub struct Api {
    pub config: ServerConfig,
    pub queryable: Arc<dyn Queryable>,
    pub exemplar_queryable: Arc<dyn ExemplarQueryable>,
    pub tsdb: Arc<dyn TsdbAdmin>,
    pub engine: Arc<dyn QueryEngine>,
    pub admin: AdminFacade,
    pub scrape_pools: Arc<dyn ScrapePoolsRetriever>,
    pub targets: Arc<dyn TargetRetriever>,
    pub alertmanagers: Arc<dyn AlertmanagerRetriever>,
    pub rules: Arc<dyn RulesRetriever>,
    pub notifications: NotificationHub,
    pub remote_read: Option<Arc<dyn IngestHandler>>,
    pub remote_write: Option<Arc<dyn IngestHandler>>,
    pub otlp_write: Option<Arc<dyn IngestHandler>>,
    pub stats_renderer: StatsRenderer,
    pub build_info: BuildInfo,
    pub start_time: DateTime<Utc>,
    codecs: CodecRegistry,
    ready: AtomicBool,
}

impl Api {
    /// Wire an API around the SQLite store with the bundled engine, no
    /// targets and no rules. Must be called inside a tokio runtime.
    pub fn new(config: ServerConfig, store: Store) -> Self {
        let store = Arc::new(store);
        let discovery = Arc::new(StaticDiscovery::new());
        let engine = SelectorEngine::new(
            config.lookback_delta.as_millis() as i64,
            Some(config.query_timeout),
        );

        Self {
            admin: AdminFacade::new(config.enable_admin, &config.data_dir, store.clone()),
            notifications: NotificationHub::new(config.max_notification_subscribers),
            queryable: store.clone(),
            exemplar_queryable: store.clone(),
            tsdb: store,
            engine: Arc::new(engine),
            scrape_pools: discovery.clone(),
            targets: discovery.clone(),
            alertmanagers: discovery,
            rules: Arc::new(StaticRules::default()),
            remote_read: None,
            remote_write: None,
            otlp_write: None,
            stats_renderer: default_stats_renderer(),
            build_info: BuildInfo::default(),
            start_time: Utc::now(),
            codecs: CodecRegistry::new(),
            ready: AtomicBool::new(false),
            config,
        }
    }

    /// Append a codec. Only call this before serving.
    pub fn install_codec(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.install(codec);
    }

    /// Drop every codec, including the default JSON one.
    pub fn clear_codecs(&mut self) {
        self.codecs.clear();
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState(Arc<Api>);

impl Deref for AppState {
    type Target = Api;

    fn deref(&self) -> &Api {
        &self.0
    }
}

/// Which checks run before a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// No checks.
    Open,
    /// Refuse until the server is ready.
    Ready,
    /// Also refuse in agent mode, where there is no local storage.
    Storage,
}

pub(crate) fn not_ready() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
}

/// Run one API handler: apply the gate, shape the result into a response
/// and release whatever the handler left behind.
pub async fn dispatch<F, Fut>(state: AppState, req: ApiRequest, gate: Gate, f: F) -> Response
where
    F: FnOnce(AppState, ApiRequest) -> Fut,
    Fut: Future<Output = ApiFuncResult>,
{
    if gate != Gate::Open && !state.is_ready() {
        return not_ready();
    }

    let accept = req.accept().to_string();
    let result = if gate == Gate::Storage && state.config.agent_mode {
        ApiError::execution("unavailable in agent mode").into()
    } else {
        f(state.clone(), req).await
    };
    render(&state.codecs, &accept, result)
}

/// Adapt an API handler into an axum handler.
fn wrap<F, Fut>(
    gate: Gate,
    f: F,
) -> impl Fn(State<AppState>, ApiRequest) -> BoxFuture<'static, Response> + Clone + Send + Sync + 'static
where
    F: Fn(AppState, ApiRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ApiFuncResult> + Send + 'static,
{
    move |State(state): State<AppState>, req: ApiRequest| -> BoxFuture<'static, Response> {
        let f = f.clone();
        Box::pin(dispatch(state, req, gate, f))
    }
}

/// Web server for querygate.
pub struct Server {
    state: AppState,
    cors: CorsLayer,
}

impl Server {
    /// Create a new server around a fully wired API.
    pub fn new(api: Api) -> Result<Self, regex::Error> {
        let cors = cors_layer(&api.config.cors_origin)?;
        Ok(Self {
            state: AppState(Arc::new(api)),
            cors,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router with all routes.
    pub fn router(&self) -> Router {
        use handlers as h;
        use Gate::{Open, Ready, Storage};

        let api = Router::new()
            // Queries
            .route("/query", get(wrap(Storage, h::query)).post(wrap(Storage, h::query)))
            .route(
                "/query_range",
                get(wrap(Storage, h::query_range)).post(wrap(Storage, h::query_range)),
            )
            .route(
                "/query_exemplars",
                get(wrap(Storage, h::query_exemplars)).post(wrap(Storage, h::query_exemplars)),
            )
            .route(
                "/format_query",
                get(wrap(Storage, h::format_query)).post(wrap(Storage, h::format_query)),
            )
            .route(
                "/parse_query",
                get(wrap(Storage, h::parse_query)).post(wrap(Storage, h::parse_query)),
            )
            // Labels and series
            .route("/labels", get(wrap(Storage, h::label_names)).post(wrap(Storage, h::label_names)))
            .route("/label/{name}/values", get(wrap(Storage, h::label_values)))
            .route(
                "/series",
                get(wrap(Storage, h::series))
                    .post(wrap(Storage, h::series))
                    .delete(wrap(Storage, h::drop_series)),
            )
            // Discovery
            .route("/scrape_pools", get(wrap(Ready, h::scrape_pools)))
            .route("/targets", get(wrap(Ready, h::targets)))
            .route("/targets/metadata", get(wrap(Ready, h::target_metadata)))
            .route("/alertmanagers", get(wrap(Storage, h::alertmanagers)))
            .route("/metadata", get(wrap(Ready, h::metric_metadata)))
            // Status
            .route("/status/config", get(wrap(Ready, h::status_config)))
            .route("/status/runtimeinfo", get(wrap(Ready, h::runtime_info)))
            .route("/status/buildinfo", get(wrap(Ready, h::build_info)))
            .route("/status/flags", get(wrap(Ready, h::flags)))
            .route("/status/tsdb", get(wrap(Storage, h::tsdb_status)))
            .route("/status/tsdb/blocks", get(wrap(Storage, h::tsdb_blocks)))
            .route("/status/walreplay", get(wrap(Open, h::wal_replay)))
            .route("/notifications", get(wrap(Open, h::notifications)))
            .route("/notifications/live", get(h::notifications_live))
            // Ingestion
            .route("/read", post(h::remote_read))
            .route("/write", post(h::remote_write))
            .route("/otlp/v1/metrics", post(h::otlp_write))
            // Rules
            .route("/alerts", get(wrap(Storage, h::alerts)))
            .route("/rules", get(wrap(Storage, h::rules)))
            // Admin
            .route(
                "/admin/tsdb/delete_series",
                post(wrap(Storage, h::delete_series)).put(wrap(Storage, h::delete_series)),
            )
            .route(
                "/admin/tsdb/clean_tombstones",
                post(wrap(Storage, h::clean_tombstones)).put(wrap(Storage, h::clean_tombstones)),
            )
            .route(
                "/admin/tsdb/snapshot",
                post(wrap(Storage, h::snapshot)).put(wrap(Storage, h::snapshot)),
            )
            .with_state(self.state.clone());

        Router::new()
            .nest("/api/v1", api)
            .layer(self.cors.clone())
            .layer(middleware::from_fn(options_no_content))
            .layer(CompressionLayer::new())
            .layer(TraceLayer::new_for_http())
    }

    /// Start the server on the configured address.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = &self.state.config.listen_address;
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web server listening on {}", addr);
        self.state.set_ready(true);

        axum::serve(listener, router).await?;

        Ok(())
    }
}
