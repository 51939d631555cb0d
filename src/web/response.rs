//! The response envelope and the handler result type.

use super::codec::CodecRegistry;
use crate::error::{ApiError, ErrorType};
use crate::model::Annotations;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

/// Warnings and infos kept per response.
pub const MAX_ANNOTATIONS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub infos: Vec<String>,
}

impl ApiResponse {
    pub fn success(data: Option<serde_json::Value>, warnings: Vec<String>, infos: Vec<String>) -> Self {
        Self {
            status: Status::Success,
            data,
            error_type: None,
            error: None,
            warnings,
            infos,
        }
    }

    pub fn error(err: &ApiError, data: Option<serde_json::Value>) -> Self {
        Self {
            status: Status::Error,
            data,
            error_type: Some(err.kind),
            error: Some(err.message.clone()),
            warnings: Vec::new(),
            infos: Vec::new(),
        }
    }
}

/// A release action that runs exactly once: explicitly through
/// [`Finalizer::run`], or when dropped.
pub struct Finalizer(Option<Box<dyn FnOnce() + Send>>);

impl Finalizer {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn run(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// What every API handler returns. At most one of `data` and `err` is
/// meaningful; neither means "204 No Content".
#[derive(Default)]
pub struct ApiFuncResult {
    pub data: Option<serde_json::Value>,
    pub err: Option<ApiError>,
    pub warnings: Annotations,
    pub finalizer: Option<Finalizer>,
}

impl ApiFuncResult {
    /// Successful result. Serialization failures become internal errors.
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(v) => Self {
                data: Some(v),
                ..Default::default()
            },
            Err(e) => ApiError::internal(format!("error marshaling response: {}", e)).into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_warnings(mut self, warnings: Annotations) -> Self {
        self.warnings.merge(warnings);
        self
    }

    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }
}

impl From<ApiError> for ApiFuncResult {
    fn from(err: ApiError) -> Self {
        Self {
            err: Some(err),
            ..Default::default()
        }
    }
}

/// Render an error envelope. Always JSON, whatever was negotiated.
pub fn error_response(err: &ApiError, data: Option<serde_json::Value>) -> Response {
    match serde_json::to_vec(&ApiResponse::error(err, data)) {
        Ok(body) => (
            err.kind.status_code(),
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("error marshaling json response: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Render a success envelope with the negotiated codec.
pub fn success_response(
    codecs: &CodecRegistry,
    accept: &str,
    data: serde_json::Value,
    warnings: &Annotations,
) -> Response {
    let (warnings, infos) = warnings.as_strings(MAX_ANNOTATIONS, MAX_ANNOTATIONS);
    let resp = ApiResponse::success(Some(data), warnings, infos);

    let codec = match codecs.negotiate(accept, &resp) {
        Ok(codec) => codec,
        Err(err) => return error_response(&err, None),
    };

    match codec.encode(&resp) {
        Ok(body) => {
            let content_type = HeaderValue::from_str(&codec.content_type().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!("error marshaling response: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Turn a handler result into a response, then release its resources.
pub fn render(codecs: &CodecRegistry, accept: &str, result: ApiFuncResult) -> Response {
    let ApiFuncResult {
        data,
        err,
        warnings,
        finalizer,
    } = result;

    let response = match (err, data) {
        (Some(err), data) => error_response(&err, data),
        (None, Some(data)) => success_response(codecs, accept, data, &warnings),
        (None, None) => StatusCode::NO_CONTENT.into_response(),
    };

    if let Some(finalizer) = finalizer {
        finalizer.run();
    }
    response
}
