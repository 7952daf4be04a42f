/// Inbox REST API + SSE: HTTP server for the dashboard
///
/// Endpoints:
///   GET  /api/status
///   GET  /api/conversations
///   GET  /api/messages      ?conversation=<id>&limit=N&before=<message id>
///   POST /api/send-text     body: {"conversation_id":"...","text":"...","correlation_id":"..."}
///   POST /api/send-media    body: {"conversation_id":"...","files":[{"file_name","mime_type","data"}]}
///   POST /api/send-voice    body: {"conversation_id":"...","mime_type":"...","data":"...","correlation_id":"..."}
///   GET  /api/media         ?conversation=<id>&id=<message id>
///   GET  /events            ?session=<id>  SSE stream of MessengerEvent JSON
///
/// Binary payloads travel as standard base64. The viewer is named by the
/// `X-Viewer-Id` header; authentication happens in front of this server.
use crate::error::{ErrorClass, GatewayError, Result};
use crate::inbox::InboxService;
use crate::media_store::MediaBlob;
use crate::realtime::Subscription;
use crate::upstream::{OutgoingFile, Viewer, VoiceNote};
use crate::utils::query::{param, parse_param};
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Body, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub const VIEWER_HEADER: &str = "x-viewer-id";

/// Largest accepted request body (base64 media included)
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Idle SSE streams get a comment frame this often
const SSE_KEEPALIVE: Duration = Duration::from_secs(25);

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, Infallible>;
pub type Resp = Response<BoxBody>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn empty_body() -> BoxBody {
    Full::new(Bytes::new()).boxed_unsync()
}

fn cors_headers(builder: http::response::Builder) -> http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, X-Viewer-Id, If-None-Match")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).boxed_unsync())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn json_ok<T: serde::Serialize>(value: &T) -> Resp {
    match serde_json::to_vec(value) {
        Ok(body) => json_resp(StatusCode::OK, body),
        Err(e) => error_resp(&GatewayError::from(e)),
    }
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg, "retryable": false }))
            .unwrap_or_default(),
    )
}

/// Map a classified error onto the wire
pub fn error_resp(e: &GatewayError) -> Resp {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match e.class() {
        ErrorClass::Internal => error!("Request failed: {}", e),
        _ => debug!("Request refused ({}): {}", status, e),
    }
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({
            "error": e.to_string(),
            "retryable": e.is_retryable(),
            "message": e.user_message(),
        }))
        .unwrap_or_default(),
    )
}

fn media_resp(blob: &MediaBlob, cache_control: &str, if_none_match: Option<&str>) -> Resp {
    let etag = blob.etag();
    let builder = cors_headers(Response::builder())
        .header("Cache-Control", cache_control)
        .header("ETag", &etag);

    if if_none_match == Some(etag.as_str()) {
        return builder
            .status(StatusCode::NOT_MODIFIED)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body()));
    }

    let mut builder = builder
        .status(StatusCode::OK)
        .header("Content-Type", &blob.mime_type)
        .header("Content-Length", blob.bytes.len());
    if let Some(name) = &blob.file_name {
        let name = name.replace(['"', '\\', '\r', '\n'], "_");
        builder = builder.header("Content-Disposition", format!("inline; filename=\"{}\"", name));
    }
    builder
        .body(Full::new(blob.bytes.clone()).boxed_unsync())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn sse_resp(subscription: Subscription) -> Resp {
    // Keepalive comment sent immediately so the client knows the connection is live
    let initial = Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(subscription, |mut sub| async move {
        tokio::select! {
            event = sub.recv() => {
                // None: superseded by a newer stream of this session, or hub gone
                let event = event?;
                let json = serde_json::to_string(&event).unwrap_or_default();
                let frame = Frame::data(Bytes::from(format!("data: {}\n\n", json)));
                Some((Ok::<_, Infallible>(frame), sub))
            }
            _ = tokio::time::sleep(SSE_KEEPALIVE) => {
                Some((Ok(Frame::data(Bytes::from(": keepalive\n\n"))), sub))
            }
        }
    });

    let stream = first.chain(events);
    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no") // disable nginx buffering
        .body(StreamBody::new(stream).boxed_unsync())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_inbox_api(service: InboxService, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Inbox API started on http://{}", listener.local_addr()?);
    serve(listener, service).await
}

/// Accept loop over an already bound listener
pub async fn serve(listener: TcpListener, service: InboxService) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let service = service.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let service = service.clone();
                        async move { Ok::<_, Infallible>(route(req, &service).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Ignore client-disconnect errors (normal for SSE)
                        if !e.is_incomplete_message() {
                            error!("Inbox API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Inbox API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub async fn route<B>(req: Request<B>, service: &InboxService) -> Resp
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    // CORS preflight
    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body()));
    }

    if method == Method::GET && path == "/api/status" {
        return get_status(service).await;
    }

    let viewer = match resolve_viewer(header_value(&req, VIEWER_HEADER), service).await {
        Ok(viewer) => viewer,
        Err(resp) => return resp,
    };

    match (method, path.as_str()) {
        (Method::GET, "/api/conversations") => get_conversations(&viewer, service).await,
        (Method::GET, "/api/messages") => get_messages(&viewer, &query, service).await,
        (Method::POST, "/api/send-text") => post_send_text(req, &viewer, service).await,
        (Method::POST, "/api/send-media") => post_send_media(req, &viewer, service).await,
        (Method::POST, "/api/send-voice") => post_send_voice(req, &viewer, service).await,
        (Method::GET, "/api/media") => {
            let if_none_match = header_value(&req, "if-none-match");
            get_media(if_none_match.as_deref(), &viewer, &query, service).await
        }
        (Method::GET, "/events") => get_sse(&req, viewer, &query, service),
        _ => json_err(StatusCode::NOT_FOUND, "not found"),
    }
}

fn header_value<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn resolve_viewer(
    viewer_id: Option<String>,
    service: &InboxService,
) -> std::result::Result<Viewer, Resp> {
    let viewer_id =
        viewer_id.ok_or_else(|| json_err(StatusCode::UNAUTHORIZED, "missing viewer"))?;
    service.viewer(&viewer_id).await.map_err(|e| error_resp(&e))
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn get_status(service: &InboxService) -> Resp {
    match service.status().await {
        Ok(status) => json_ok(&status),
        Err(e) => error_resp(&e),
    }
}

async fn get_conversations(viewer: &Viewer, service: &InboxService) -> Resp {
    match service.list_conversations(viewer).await {
        Ok(conversations) => json_ok(&serde_json::json!({ "conversations": &*conversations })),
        Err(e) => error_resp(&e),
    }
}

async fn get_messages(viewer: &Viewer, query: &str, service: &InboxService) -> Resp {
    let Some(conversation_id) = param(query, "conversation") else {
        return json_err(StatusCode::BAD_REQUEST, "conversation required");
    };
    let limit = parse_param::<usize>(query, "limit");
    let before = param(query, "before");
    match service
        .list_messages(viewer, &conversation_id, limit, before.as_deref())
        .await
    {
        Ok(page) => json_ok(&*page),
        Err(e) => error_resp(&e),
    }
}

#[derive(Deserialize)]
struct SendTextRequest {
    conversation_id: String,
    text: String,
    correlation_id: Option<String>,
}

async fn post_send_text<B>(req: Request<B>, viewer: &Viewer, service: &InboxService) -> Resp
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let r: SendTextRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match service
        .send_text(viewer, &r.conversation_id, &r.text, r.correlation_id.clone())
        .await
    {
        Ok(message) => json_ok(&serde_json::json!({
            "message": message,
            "correlation_id": r.correlation_id,
        })),
        Err(e) => error_resp(&e),
    }
}

#[derive(Deserialize)]
struct MediaFileRequest {
    file_name: String,
    mime_type: String,
    /// base64
    data: String,
}

#[derive(Deserialize)]
struct SendMediaRequest {
    conversation_id: String,
    files: Vec<MediaFileRequest>,
}

async fn post_send_media<B>(req: Request<B>, viewer: &Viewer, service: &InboxService) -> Resp
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let r: SendMediaRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let mut files = Vec::with_capacity(r.files.len());
    for file in r.files {
        let bytes = match decode_base64(&file.data) {
            Ok(bytes) => bytes,
            Err(e) => return error_resp(&e),
        };
        files.push(OutgoingFile {
            file_name: file.file_name,
            mime_type: file.mime_type,
            bytes,
        });
    }
    match service.send_media(viewer, &r.conversation_id, files).await {
        Ok(messages) => json_ok(&serde_json::json!({ "messages": messages })),
        Err(e) => error_resp(&e),
    }
}

#[derive(Deserialize)]
struct SendVoiceRequest {
    conversation_id: String,
    mime_type: String,
    /// base64
    data: String,
    correlation_id: Option<String>,
}

async fn post_send_voice<B>(req: Request<B>, viewer: &Viewer, service: &InboxService) -> Resp
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let r: SendVoiceRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let bytes = match decode_base64(&r.data) {
        Ok(bytes) => bytes,
        Err(e) => return error_resp(&e),
    };
    let voice = VoiceNote {
        mime_type: r.mime_type,
        bytes,
    };
    match service
        .send_voice(viewer, &r.conversation_id, voice, r.correlation_id.clone())
        .await
    {
        Ok(message) => json_ok(&serde_json::json!({
            "message": message,
            "correlation_id": r.correlation_id,
        })),
        Err(e) => error_resp(&e),
    }
}

async fn get_media(
    if_none_match: Option<&str>,
    viewer: &Viewer,
    query: &str,
    service: &InboxService,
) -> Resp {
    let (Some(conversation_id), Some(message_id)) = (param(query, "conversation"), param(query, "id"))
    else {
        return json_err(StatusCode::BAD_REQUEST, "conversation and id required");
    };
    match service.fetch_media(viewer, &conversation_id, &message_id).await {
        Ok(blob) => media_resp(&blob, &service.media_cache_control(), if_none_match),
        Err(e) => error_resp(&e),
    }
}

fn get_sse<B>(req: &Request<B>, viewer: Viewer, query: &str, service: &InboxService) -> Resp {
    let session_id = param(query, "session")
        .or_else(|| header_value(req, "x-session-id"))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!("SSE session {} opened by {}", session_id, viewer.id);
    sse_resp(service.subscribe(&session_id, viewer))
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_body<B>(req: Request<B>) -> std::result::Result<Bytes, String>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

async fn read_json<B, T>(req: Request<B>) -> std::result::Result<T, Resp>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: serde::de::DeserializeOwned,
{
    let body = read_body(req)
        .await
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)))
}

fn decode_base64(data: &str) -> Result<Bytes> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map(Bytes::from)
        .map_err(|e| GatewayError::InvalidPayload(format!("invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let resp = error_resp(&GatewayError::NotConnected);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_resp(&GatewayError::Forbidden).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            error_resp(&GatewayError::NotFound("media".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_resp(&GatewayError::Upstream("bad shape".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_media_response_headers() {
        let blob = MediaBlob::new(
            "c1",
            "m1",
            Bytes::from_static(b"abc"),
            Some("image/png".into()),
            Some("a\"b.png".into()),
        );
        let resp = media_resp(&blob, "public, max-age=60, immutable", None);
        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers();
        assert_eq!(headers["content-type"], "image/png");
        assert_eq!(headers["content-length"], "3");
        assert_eq!(headers["content-disposition"], "inline; filename=\"a_b.png\"");
        assert_eq!(headers["cache-control"], "public, max-age=60, immutable");

        let etag = blob.etag();
        let resp = media_resp(&blob, "public, max-age=60, immutable", Some(&etag));
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn test_decode_base64() {
        assert_eq!(&decode_base64("aGk=").unwrap()[..], b"hi");
        assert!(decode_base64("***").is_err());
    }
}
