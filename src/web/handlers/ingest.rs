//! Mount points for pluggable ingestion receivers. Decoding the payloads is
//! the receiver's business; the gateway only routes and gates.

use crate::web::{not_ready, AppState};
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

#[async_trait]
pub trait IngestHandler: Send + Sync {
    async fn handle(&self, req: Request) -> Response;
}

async fn delegate(
    state: &AppState,
    handler: Option<&Arc<dyn IngestHandler>>,
    disabled: &'static str,
    req: Request,
) -> Response {
    if !state.is_ready() {
        return not_ready();
    }
    match handler {
        Some(h) => h.handle(req).await,
        None => (StatusCode::NOT_FOUND, disabled).into_response(),
    }
}

pub async fn remote_read(State(state): State<AppState>, req: Request) -> Response {
    delegate(
        &state,
        state.remote_read.as_ref(),
        "remote read endpoint needs a read handler to be mounted",
        req,
    )
    .await
}

pub async fn remote_write(State(state): State<AppState>, req: Request) -> Response {
    delegate(
        &state,
        state.remote_write.as_ref(),
        "remote write receiver needs to be enabled by mounting a write handler",
        req,
    )
    .await
}

pub async fn otlp_write(State(state): State<AppState>, req: Request) -> Response {
    delegate(
        &state,
        state.otlp_write.as_ref(),
        "otlp write receiver needs to be enabled by mounting an OTLP handler",
        req,
    )
    .await
}
