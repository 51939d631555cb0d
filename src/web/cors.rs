//! CORS for every API response.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, DATE, ORIGIN};
use axum::http::{request::Parts, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use regex::Regex;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// CORS layer for the configured origin pattern. `.*` allows any origin;
/// anything else must match the whole `Origin` header.
pub fn cors_layer(pattern: &str) -> Result<CorsLayer, regex::Error> {
    let origin = if pattern == ".*" {
        AllowOrigin::any()
    } else {
        let re = Regex::new(&format!("^(?:{})$", pattern))?;
        AllowOrigin::predicate(move |origin: &HeaderValue, _: &Parts| {
            origin.to_str().is_ok_and(|o| re.is_match(o))
        })
    };

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_headers([ACCEPT, AUTHORIZATION, CONTENT_TYPE, ORIGIN])
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .expose_headers([DATE]))
}

/// Every OPTIONS request ends in an empty 204, preflight or not. Headers
/// added further in (CORS) are kept.
pub async fn options_no_content(req: Request, next: Next) -> Response {
    if req.method() != Method::OPTIONS {
        return next.run(req).await;
    }

    let (mut parts, _) = next.run(req).await.into_parts();
    parts.status = StatusCode::NO_CONTENT;
    parts.headers.remove(CONTENT_LENGTH);
    Response::from_parts(parts, Body::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use axum::routing::get;
    use axum::{middleware, Router};
    use tower::ServiceExt;

    fn app(pattern: &str) -> Router {
        Router::new()
            .route("/x", get(|| async { "ok" }))
            .layer(cors_layer(pattern).unwrap())
            .layer(middleware::from_fn(options_no_content))
    }

    fn request(method: Method, origin: &str) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri("/x")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_any_origin() {
        let resp = app(".*").oneshot(request(Method::GET, "https://a.example")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_EXPOSE_HEADERS], "date");
    }

    #[tokio::test]
    async fn test_origin_pattern() {
        let app = app(r"https://.*\.example\.com");

        let resp = app
            .clone()
            .oneshot(request(Method::GET, "https://grafana.example.com"))
            .await
            .unwrap();
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://grafana.example.com"
        );

        // Anchored: a prefix match is not enough.
        let resp = app
            .oneshot(request(Method::GET, "https://grafana.example.com.evil.net"))
            .await
            .unwrap();
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_options_always_no_content() {
        let resp = app(".*").oneshot(request(Method::OPTIONS, "https://a.example")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_METHODS], "GET,POST,OPTIONS");

        // Not a preflight and not a route: still 204.
        let req = axum::http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/missing")
            .body(Body::empty())
            .unwrap();
        let resp = app(".*").oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
