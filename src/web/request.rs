//! Request extraction for API handlers.

use super::response::error_response;
use crate::context::Context;
use crate::error::ApiError;
use crate::model::Timestamp;
use crate::params::{self, ParamError};
use axum::extract::{Form, FromRequest, FromRequestParts, Query, RawPathParams, Request};
use axum::http::{header, HeaderMap, Method};
use axum::response::Response;
use std::collections::HashMap;
use tokio_util::sync::DropGuard;

/// Everything a handler may look at: form and query values, path
/// parameters, a few headers, and a context that is cancelled once the
/// request is dropped.
pub struct ApiRequest {
    pub method: Method,
    /// Body values first, then URL query values.
    params: Vec<(String, String)>,
    query: Vec<(String, String)>,
    path: HashMap<String, String>,
    headers: HeaderMap,
    ctx: Context,
    _cancel: DropGuard,
}

impl ApiRequest {
    /// Build a request by hand. Used by tests and internal callers.
    pub fn new(method: Method, params: Vec<(String, String)>) -> Self {
        let ctx = Context::background();
        let cancel = ctx.cancel_on_drop();
        Self {
            method,
            query: params.clone(),
            params,
            path: HashMap::new(),
            headers: HeaderMap::new(),
            ctx,
            _cancel: cancel,
        }
    }

    pub fn with_path_param(mut self, name: &str, value: &str) -> Self {
        self.path.insert(name.to_string(), value.to_string());
        self
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    /// First value for `name` across body and URL, or "".
    pub fn value(&self, name: &str) -> &str {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    /// Every value for `name` across body and URL.
    pub fn values(&self, name: &str) -> Vec<String> {
        self.params
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// First value for `name` in the URL query string only, or "".
    pub fn query_value(&self, name: &str) -> &str {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn path_param(&self, name: &str) -> &str {
        self.path.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn header(&self, name: header::HeaderName) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn accept(&self) -> &str {
        self.header(header::ACCEPT)
    }

    /// Parse an optional time parameter, falling back to `default`.
    pub fn time_param(&self, name: &str, default: Timestamp) -> Result<Timestamp, ApiError> {
        params::parse_time_param(name, Some(self.value(name)), default)
            .map_err(|e| ApiError::invalid_param(e, name))
    }

    pub fn limit_param(&self) -> Result<usize, ApiError> {
        params::parse_limit(self.value("limit")).map_err(|e| ApiError::invalid_param(e, "limit"))
    }

    /// `match[]` selectors. Parse errors are plain `bad_data`.
    pub fn matcher_sets(&self) -> Result<Vec<Vec<crate::model::Matcher>>, ParamError> {
        params::parse_matchers(&self.values("match[]"))
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

impl<S> FromRequest<S> for ApiRequest
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let (mut parts, body) = req.into_parts();

        let query = match Query::<Vec<(String, String)>>::try_from_uri(&parts.uri) {
            Ok(Query(q)) => q,
            Err(e) => {
                let err = ApiError::bad_data(format!("error parsing form values: {}", e));
                return Err(error_response(&err, None));
            }
        };

        let mut path = HashMap::new();
        if let Ok(raw) = RawPathParams::from_request_parts(&mut parts, state).await {
            for (k, v) in raw.iter() {
                path.insert(k.to_string(), v.to_string());
            }
        }

        let method = parts.method.clone();
        let headers = parts.headers.clone();
        let mut params = Vec::new();
        if method != Method::GET && method != Method::HEAD && is_form(&headers) {
            let req = Request::from_parts(parts, body);
            match Form::<Vec<(String, String)>>::from_request(req, state).await {
                Ok(Form(form)) => params = form,
                Err(e) => {
                    let err = ApiError::bad_data(format!("error parsing form values: {}", e.body_text()));
                    return Err(error_response(&err, None));
                }
            }
        }
        params.extend(query.iter().cloned());

        let ctx = Context::background();
        let cancel = ctx.cancel_on_drop();
        Ok(Self {
            method,
            params,
            query,
            path,
            headers,
            ctx,
            _cancel: cancel,
        })
    }
}
