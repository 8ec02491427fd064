/// Messenger REST API + SSE for UI clients
///
/// Endpoints:
///   GET    /api/status
///   POST   /api/login
///   POST   /api/logout
///   GET    /api/conversations
///   POST   /api/conversations                 body: {"listing_id":"..","buyer_id":"..","seller_id":".."}
///   DELETE /api/conversations/:id
///   GET    /api/conversations/:id/messages    opens the conversation and returns its timeline
///   POST   /api/conversations/:id/older       body: {"first_visible_index":0} (optional)
///   POST   /api/conversations/:id/read
///   POST   /api/conversations/:id/release
///   POST   /api/conversations/:id/typing
///   POST   /api/send                          body: {"conversation_id":N,"body":"..."}
///   GET    /api/presence/:contact
///   PUT    /api/presence                      body: {"status":"away","status_text":".."}
///   GET    /events                            SSE stream of MessengerEvent JSON
use crate::client::ChatClient;
use crate::error::{ChatError, Result};
use crate::message_store::DurableStore;
use crate::messenger_types::MessengerEvent;
use crate::model::PresenceStatus;
use crate::viewport::should_load_older;
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

/// Client plus the conversations this API holds open on behalf of the UI
struct ApiState<S: DurableStore> {
    client: ChatClient<S>,
    opened: RwLock<HashSet<u64>>,
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

fn status_for(e: &ChatError) -> StatusCode {
    match e {
        ChatError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
        ChatError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ChatError::Credentials(_) | ChatError::Config(_) | ChatError::Protocol(_) => {
            StatusCode::BAD_REQUEST
        }
        ChatError::SendFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error body carries `retryable` so the UI knows whether to offer a retry.
fn chat_err(e: &ChatError) -> Resp {
    json_resp(
        status_for(e),
        serde_json::to_vec(&serde_json::json!({
            "error": e.to_string(),
            "retryable": e.is_retryable(),
        }))
        .unwrap_or_default(),
    )
}

fn sse_resp(rx: tokio::sync::broadcast::Receiver<MessengerEvent>) -> Resp {
    // Comment frame first so the client knows the stream is live
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    let data = format!("data: {}\n\n", json);
                    let frame = Frame::data(bytes::Bytes::from(data));
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged {} events", n);
                    continue;
                }
                Err(_) => return None,
            }
        }
    });

    let stream = first.chain(events);
    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(StreamBody::new(stream).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_messenger_api<S: DurableStore>(client: ChatClient<S>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(ChatError::Io)?;
    info!("Messenger API started on http://{}", addr);
    serve_messenger_api(client, listener).await
}

/// Serve on an already bound listener.
pub async fn serve_messenger_api<S: DurableStore>(client: ChatClient<S>, listener: TcpListener) -> Result<()> {
    let state = Arc::new(ApiState {
        client,
        opened: RwLock::new(HashSet::new()),
    });
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let state = state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Client disconnects are normal for SSE
                        if !e.is_incomplete_message() {
                            error!("Messenger API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Messenger API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// `/api/conversations/{id}[/{action}]`
fn conversation_route(path: &str) -> Option<(u64, Option<&str>)> {
    let rest = path.strip_prefix("/api/conversations/")?;
    let (id, action) = match rest.split_once('/') {
        Some((id, action)) => (id, Some(action)),
        None => (rest, None),
    };
    Some((id.parse().ok()?, action))
}

async fn handle<S: DurableStore>(req: Request<hyper::body::Incoming>, state: Arc<ApiState<S>>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
    }

    match (method.clone(), path.as_str()) {
        (Method::GET, "/api/status") => get_status(&state).await,
        (Method::POST, "/api/login") => post_login(&state).await,
        (Method::POST, "/api/logout") => post_logout(&state).await,
        (Method::GET, "/api/conversations") => get_conversations(&state).await,
        (Method::POST, "/api/conversations") => post_conversation(req, &state).await,
        (Method::POST, "/api/send") => post_send(req, &state).await,
        (Method::PUT, "/api/presence") => put_presence(req, &state).await,
        (Method::GET, "/events") => sse_resp(state.client.events()),
        _ => {
            if method == Method::GET && path.starts_with("/api/presence/") {
                let raw = path.trim_start_matches("/api/presence/");
                return get_presence(raw, &state).await;
            }
            match (method, conversation_route(&path)) {
                (Method::DELETE, Some((id, None))) => delete_conversation(id, &state).await,
                (Method::GET, Some((id, Some("messages")))) => get_messages(id, &state).await,
                (Method::POST, Some((id, Some("older")))) => post_older(req, id, &state).await,
                (Method::POST, Some((id, Some("read")))) => post_read(id, &state).await,
                (Method::POST, Some((id, Some("release")))) => post_release(id, &state).await,
                (Method::POST, Some((id, Some("typing")))) => {
                    state.client.notify_typing(id).await;
                    json_ok(serde_json::json!({ "success": true }))
                }
                _ => json_err(StatusCode::NOT_FOUND, "not found"),
            }
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn get_status<S: DurableStore>(state: &ApiState<S>) -> Resp {
    let client = &state.client;
    let opened: Vec<u64> = state.opened.read().await.iter().copied().collect();
    json_ok(serde_json::json!({
        "user": client.local_user(),
        "connection": client.connection_state(),
        "presence": client.own_presence().await,
        "open_conversations": opened,
    }))
}

async fn post_login<S: DurableStore>(state: &ApiState<S>) -> Resp {
    match state.client.login().await {
        Ok(()) => json_ok(serde_json::json!({ "success": true })),
        Err(e) => chat_err(&e),
    }
}

async fn post_logout<S: DurableStore>(state: &ApiState<S>) -> Resp {
    match state.client.logout().await {
        Ok(()) => json_ok(serde_json::json!({ "success": true })),
        Err(e) => chat_err(&e),
    }
}

async fn get_conversations<S: DurableStore>(state: &ApiState<S>) -> Resp {
    match state.client.list_conversations().await {
        Ok(conversations) => json_ok(serde_json::json!({ "conversations": conversations })),
        Err(e) => chat_err(&e),
    }
}

#[derive(Deserialize)]
struct ConversationRequest {
    listing_id: String,
    buyer_id: String,
    seller_id: String,
}

async fn post_conversation<S: DurableStore>(
    req: Request<hyper::body::Incoming>,
    state: &ApiState<S>,
) -> Resp {
    let r: ConversationRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state
        .client
        .find_or_create_conversation(&r.listing_id, &r.buyer_id, &r.seller_id)
        .await
    {
        Ok(conversation) => json_ok(serde_json::json!({ "conversation": conversation })),
        Err(e) => chat_err(&e),
    }
}

async fn delete_conversation<S: DurableStore>(id: u64, state: &ApiState<S>) -> Resp {
    state.opened.write().await.remove(&id);
    match state.client.delete_conversation(id).await {
        Ok(removed) => json_ok(serde_json::json!({ "removed": removed })),
        Err(e) => chat_err(&e),
    }
}

async fn timeline_json<S: DurableStore>(id: u64, state: &ApiState<S>) -> serde_json::Value {
    let client = &state.client;
    serde_json::json!({
        "conversation_id": id,
        "messages": client.timeline(id).await.unwrap_or_default(),
        "has_more": client.has_more(id).await,
        "typing": client.typing_in(id).await,
    })
}

async fn get_messages<S: DurableStore>(id: u64, state: &ApiState<S>) -> Resp {
    // One subscription per conversation for the API, however often the UI polls
    let already_open = state.opened.read().await.contains(&id);
    if !already_open {
        if let Err(e) = state.client.subscribe(id).await {
            return chat_err(&e);
        }
        if !state.opened.write().await.insert(id) {
            state.client.release(id).await;
        }
    }
    json_ok(timeline_json(id, state).await)
}

#[derive(Deserialize, Default)]
struct OlderRequest {
    #[serde(default)]
    first_visible_index: usize,
}

async fn post_older<S: DurableStore>(
    req: Request<hyper::body::Incoming>,
    id: u64,
    state: &ApiState<S>,
) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let r: OlderRequest = if body.is_empty() {
        OlderRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
        }
    };

    if !state.opened.read().await.contains(&id) {
        return chat_err(&ChatError::ConversationNotFound(id));
    }
    let has_more = state.client.has_more(id).await;
    if !should_load_older(r.first_visible_index, has_more, false) {
        return json_ok(serde_json::json!({ "added": 0, "has_more": has_more }));
    }
    match state.client.load_older(id).await {
        Ok(outcome) => {
            let mut body = timeline_json(id, state).await;
            body["added"] = serde_json::json!(outcome.added);
            json_ok(body)
        }
        Err(e) => chat_err(&e),
    }
}

async fn post_read<S: DurableStore>(id: u64, state: &ApiState<S>) -> Resp {
    match state.client.mark_read(id).await {
        Ok(updated) => json_ok(serde_json::json!({ "updated": updated })),
        Err(e) => chat_err(&e),
    }
}

async fn post_release<S: DurableStore>(id: u64, state: &ApiState<S>) -> Resp {
    let held = state.opened.write().await.remove(&id);
    let released = held && state.client.release(id).await;
    json_ok(serde_json::json!({ "released": released }))
}

#[derive(Deserialize)]
struct SendRequest {
    conversation_id: u64,
    body: String,
}

async fn post_send<S: DurableStore>(req: Request<hyper::body::Incoming>, state: &ApiState<S>) -> Resp {
    let r: SendRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.client.send(r.conversation_id, &r.body).await {
        Ok(message) => json_ok(serde_json::json!({ "message": message })),
        Err(e) => chat_err(&e),
    }
}

async fn get_presence<S: DurableStore>(raw: &str, state: &ApiState<S>) -> Resp {
    let contact = match urlencoding::decode(raw) {
        Ok(c) => c.into_owned(),
        Err(_) => return json_err(StatusCode::BAD_REQUEST, "invalid contact"),
    };
    let lookup = state.client.lookup(&contact).await;
    json_ok(serde_json::json!({ "contact": contact, "presence": lookup }))
}

#[derive(Deserialize)]
struct PresenceRequest {
    status: PresenceStatus,
    status_text: Option<String>,
}

async fn put_presence<S: DurableStore>(req: Request<hyper::body::Incoming>, state: &ApiState<S>) -> Resp {
    let r: PresenceRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    state.client.set_presence(r.status, r.status_text).await;
    json_ok(serde_json::json!({ "success": true }))
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_body(req: Request<hyper::body::Incoming>) -> std::result::Result<bytes::Bytes, String> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<T, Resp> {
    let body = read_body(req)
        .await
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)))
}
