/// HTTP surface: routing, status mapping, media headers and the SSE stream
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use inbox_core::memory::{InMemoryRecords, InMemoryUpstream};
use inbox_core::messenger_api::{route, Resp};
use inbox_core::upstream::{MediaPayload, Role, Viewer};
use inbox_core::{Config, InboxService};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn setup() -> (InboxService, Arc<InMemoryUpstream>) {
    let upstream = Arc::new(InMemoryUpstream::new());
    upstream.add_conversation("c1", "Alice");
    upstream.add_conversation("c2", "Bob");
    upstream.receive_text("c1", "hi there");

    let records = Arc::new(InMemoryRecords::new());
    for (id, role) in [("admin", Role::Admin), ("agent", Role::Agent)] {
        records.add_viewer(Viewer {
            id: id.to_string(),
            role,
            first_name: id.to_string(),
            last_name: String::new(),
            email: String::new(),
        });
    }
    records.assign("c2", "agent");
    let service = InboxService::new(Config::default(), upstream.clone(), records);
    (service, upstream)
}

fn get(uri: &str, viewer: Option<&str>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(viewer) = viewer {
        builder = builder.header("X-Viewer-Id", viewer);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

fn post(uri: &str, viewer: &str, body: serde_json::Value) -> Request<Full<Bytes>> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("X-Viewer-Id", viewer)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn json_body(resp: Resp) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_status_needs_no_viewer() {
    let (service, _upstream) = setup();
    let resp = route(get("/api/status", None), &service).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["connected"], true);
}

#[tokio::test]
async fn test_viewer_header_required_and_checked() {
    let (service, _upstream) = setup();
    let resp = route(get("/api/conversations", None), &service).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = route(get("/api/conversations", Some("stranger")), &service).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_conversations_and_messages() {
    let (service, _upstream) = setup();
    let resp = route(get("/api/conversations", Some("admin")), &service).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["conversations"].as_array().unwrap().len(), 2);

    let resp = route(get("/api/messages?conversation=c1&limit=10", Some("admin")), &service).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["items"][0]["content"]["text"], "hi there");
    assert_eq!(body["has_more"], false);

    let resp = route(get("/api/messages", Some("admin")), &service).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_send_text_echoes_correlation_id() {
    let (service, _upstream) = setup();
    let resp = route(
        post(
            "/api/send-text",
            "admin",
            serde_json::json!({"conversation_id": "c1", "text": "hello", "correlation_id": "abc-123"}),
        ),
        &service,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["correlation_id"], "abc-123");
    assert_eq!(body["message"]["correlation_id"], "abc-123");
    assert_eq!(body["message"]["status"], "sent");
}

#[tokio::test]
async fn test_error_classes_map_to_status_codes() {
    let (service, upstream) = setup();

    // Agent writing to an unassigned chat
    let resp = route(
        post("/api/send-text", "agent", serde_json::json!({"conversation_id": "c1", "text": "hi"})),
        &service,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // Upstream rejects the recipient
    upstream.fail_next_send("invalid-jid");
    let resp = route(
        post("/api/send-text", "admin", serde_json::json!({"conversation_id": "c1", "text": "hi"})),
        &service,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["retryable"], false);

    // Session down
    upstream.set_connected(false);
    let resp = route(
        post("/api/send-text", "admin", serde_json::json!({"conversation_id": "c1", "text": "hi"})),
        &service,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(resp).await;
    assert_eq!(body["retryable"], true);
    assert!(body["message"].as_str().unwrap().contains("try again"));

    // Malformed body
    let bad = Request::builder()
        .method("POST")
        .uri("/api/send-text")
        .header("X-Viewer-Id", "admin")
        .body(Full::new(Bytes::from_static(b"{not json")))
        .unwrap();
    assert_eq!(route(bad, &service).await.status(), StatusCode::BAD_REQUEST);

    let resp = route(get("/api/nope", Some("admin")), &service).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_media_served_with_cache_headers() {
    let (service, upstream) = setup();
    upstream.put_media(
        "c1",
        "m-doc",
        MediaPayload {
            bytes: Bytes::from_static(b"%PDF-1.7"),
            mime_type: Some("application/pdf".to_string()),
            file_name: Some("invoice.pdf".to_string()),
        },
    );

    let resp = route(get("/api/media?conversation=c1&id=m-doc", Some("admin")), &service).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers().clone();
    assert_eq!(headers["content-type"], "application/pdf");
    assert_eq!(headers["content-length"], "8");
    assert!(headers["cache-control"].to_str().unwrap().ends_with("immutable"));
    let etag = headers["etag"].to_str().unwrap().to_string();

    let revalidate = Request::builder()
        .method("GET")
        .uri("/api/media?conversation=c1&id=m-doc")
        .header("X-Viewer-Id", "admin")
        .header("If-None-Match", etag)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = route(revalidate, &service).await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(upstream.media_fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_media_is_404() {
    let (service, _upstream) = setup();
    let resp = route(get("/api/media?conversation=c1&id=ghost", Some("admin")), &service).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_send_voice_and_media() {
    let (service, upstream) = setup();
    let audio = base64::engine::general_purpose::STANDARD.encode(vec![7u8; 2048]);
    let resp = route(
        post(
            "/api/send-voice",
            "admin",
            serde_json::json!({"conversation_id": "c1", "mime_type": "audio/ogg", "data": audio}),
        ),
        &service,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = route(
        post(
            "/api/send-voice",
            "admin",
            serde_json::json!({"conversation_id": "c1", "mime_type": "audio/ogg", "data": "!!"}),
        ),
        &service,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let image = base64::engine::general_purpose::STANDARD.encode(b"jpeg");
    let resp = route(
        post(
            "/api/send-media",
            "admin",
            serde_json::json!({"conversation_id": "c2", "files": [
                {"file_name": "a.jpg", "mime_type": "image/jpeg", "data": image},
                {"file_name": "b.jpg", "mime_type": "image/jpeg", "data": image}
            ]}),
        ),
        &service,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["messages"].as_array().unwrap().len(), 2);
    assert_eq!(upstream.sends(), 3);
}

#[tokio::test]
async fn test_sse_stream_delivers_events() {
    let (service, _upstream) = setup();
    let resp = route(get("/events?session=tab-1", Some("admin")), &service).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/event-stream; charset=utf-8");
    let mut body = resp.into_body();

    let hello = body.frame().await.unwrap().unwrap().into_data().unwrap();
    assert_eq!(&hello[..], b": connected\n\n");

    let admin = service.viewer("admin").await.unwrap();
    service
        .send_text(&admin, "c1", "ping", Some("corr-9".to_string()))
        .await
        .unwrap();

    let frame = timeout(Duration::from_secs(2), body.frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .into_data()
        .unwrap();
    let text = String::from_utf8(frame.to_vec()).unwrap();
    assert!(text.starts_with("data: "));
    assert!(text.contains("\"type\":\"message.new\""));
    assert!(text.contains("corr-9"));
}
