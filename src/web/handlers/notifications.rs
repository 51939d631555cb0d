use crate::web::{ApiFuncResult, ApiRequest, AppState};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use tracing::{debug, warn};

pub async fn notifications(state: AppState, _req: ApiRequest) -> ApiFuncResult {
    ApiFuncResult::ok(state.notifications.notifications().await)
}

/// Server-sent stream of notification updates. Current notifications are
/// sent first. Answers 204 when the subscriber limit is reached. Only data
/// frames are written; there are no keep-alive comments.
pub async fn notifications_live(State(state): State<AppState>) -> Response {
    let Some(sub) = state.notifications.subscribe().await else {
        debug!("Rejecting notification subscriber: limit reached");
        return StatusCode::NO_CONTENT.into_response();
    };

    // The subscription is dropped with the stream when the client goes away.
    let events = stream::unfold(sub, |mut sub| async move {
        let n = sub.recv().await?;
        let event = Event::default().json_data(&n).map_err(|e| {
            warn!("Error encoding notification: {}", e);
            e
        });
        Some((event, sub))
    });

    Sse::new(events).into_response()
}

#[cfg(test)]
mod tests {
    use crate::notifications::NotificationHub;
    use crate::web::handlers::testing::{get, router, test_api};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_notifications_list() {
        let (api, _store, _dir) = test_api();
        api.notifications.add("config reload failed");
        let app = router(api);

        let (status, json) = get(&app, "/api/v1/notifications").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"][0]["text"], "config reload failed");
        assert_eq!(json["data"][0]["active"], true);
    }

    #[tokio::test]
    async fn test_live_stream_sends_current_notifications() {
        let (api, _store, _dir) = test_api();
        api.notifications.add("disk almost full");
        let app = router(api);

        let req = Request::builder()
            .uri("/api/v1/notifications/live")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");

        let mut body = resp.into_body().into_data_stream();
        let frame = body.next().await.unwrap().unwrap();
        let frame = String::from_utf8(frame.to_vec()).unwrap();
        assert!(frame.starts_with("data: "), "{}", frame);
        assert!(frame.contains("disk almost full"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_stream_sends_only_data_frames() {
        let (api, _store, _dir) = test_api();
        let hub = api.notifications.clone();
        let app = router(api);

        let req = Request::builder()
            .uri("/api/v1/notifications/live")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let mut body = resp.into_body().into_data_stream();
        let first = tokio::spawn(async move { body.next().await });

        // Idle for a minute before anything happens.
        tokio::time::sleep(Duration::from_secs(60)).await;
        hub.add("rule evaluation slow");

        let frame = first.await.unwrap().unwrap().unwrap();
        let frame = String::from_utf8(frame.to_vec()).unwrap();
        assert!(frame.starts_with("data: "), "{}", frame);
        assert!(frame.contains("rule evaluation slow"));
    }

    #[tokio::test]
    async fn test_live_stream_subscriber_limit() {
        let (mut api, _store, _dir) = test_api();
        api.notifications = NotificationHub::new(0);
        let app = router(api);

        let req = Request::builder()
            .uri("/api/v1/notifications/live")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
