//! Axum HTTP handlers for the inbound MCP surface
//!
//! Three endpoint groups: `/mcp` (streamable HTTP keyed by the
//! `Mcp-Session-Id` header, POST/GET/DELETE), the `/sse` + `/messages` pair,
//! and the OAuth callback that finishes a parked upstream authorization.
//! Handlers stay thin; all routing decisions live in the session router.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::protocol::{JsonRpcMessage, JsonRpcRequest, SUPPORTED_PROTOCOL_VERSIONS};
use crate::session::{
    DownstreamTransportKind, FilterParams, Session, SessionContext, SessionRouter,
};

/// Header carrying the streamable HTTP session id
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Query parameters recognized on the MCP endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpQueryParams {
    /// Paginate list results
    pub pagination: Option<bool>,

    /// Named preset (highest priority)
    pub preset: Option<String>,

    /// Boolean tag expression
    pub filter: Option<String>,

    /// Comma-separated tag list
    pub tags: Option<String>,

    /// Opaque instruction template
    pub template: Option<String>,

    /// Session id for the SSE `/messages` endpoint
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

impl McpQueryParams {
    fn filter_params(&self) -> FilterParams {
        FilterParams {
            preset: self.preset.clone(),
            filter: self.filter.clone(),
            tag_query: None,
            tags: self.tags.clone(),
            pagination: self.pagination,
            template: self.template.clone(),
        }
    }
}

/// OAuth callback query
#[derive(Debug, Deserialize)]
pub struct OauthCallbackParams {
    pub code: String,
}

fn header_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn context_from_headers(headers: &HeaderMap) -> SessionContext {
    SessionContext {
        client_name: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        timestamp: Some(chrono::Utc::now()),
        proxy_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        ..Default::default()
    }
}

/// Build the MCP routes over a shared session router
pub fn mcp_routes() -> Router<Arc<SessionRouter>> {
    Router::new()
        .route(
            "/mcp",
            get(mcp_get_handler)
                .post(mcp_post_handler)
                .delete(mcp_delete_handler),
        )
        .route("/sse", get(sse_get_handler))
        .route("/messages", post(messages_post_handler))
        .route("/oauth/callback/{server}", get(oauth_callback_handler))
}

/// MCP routes with a permissive CORS layer for browser-based clients
pub fn mcp_routes_with_cors() -> Router<Arc<SessionRouter>> {
    mcp_routes().layer(tower_http::cors::CorsLayer::permissive())
}

/// POST /mcp: JSON-RPC over streamable HTTP
pub async fn mcp_post_handler(
    State(router): State<Arc<SessionRouter>>,
    Query(params): Query<McpQueryParams>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let filter_params = params.filter_params();
    let session = match header_session_id(&headers) {
        Some(id) => {
            router
                .resume_or_create(&id, DownstreamTransportKind::StreamableHttp, &filter_params)
                .await
        }
        None => {
            router
                .create_session(
                    None,
                    DownstreamTransportKind::StreamableHttp,
                    &filter_params,
                    Some(context_from_headers(&headers)),
                )
                .await
        }
    };
    let session = match session {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    debug!(session = %session.id, method = %request.method, "streamable HTTP request");
    let cancel = CancellationToken::new();
    let response = router.dispatch(&session, request, &cancel).await;

    let mut http_response = match response {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&session.id) {
        http_response
            .headers_mut()
            .insert(MCP_SESSION_ID_HEADER, value);
    }
    http_response
}

/// GET /mcp: the session's server-to-client event stream, or endpoint info
/// for plain requests
pub async fn mcp_get_handler(
    State(router): State<Arc<SessionRouter>>,
    headers: HeaderMap,
) -> Response {
    let wants_stream = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));

    let session_id = header_session_id(&headers);
    if let (true, Some(id)) = (wants_stream, session_id) {
        let Some(session) = router.get_session(&id).await else {
            return ProxyError::invalid_params(format!("unknown session id '{}'", id))
                .into_response();
        };
        return session_event_stream(&router, &session).into_response();
    }

    // Discovery / health view.
    let snapshots = router.manager().snapshots().await;
    Json(json!({
        "name": router.manager().server_info().name,
        "version": router.manager().server_info().version,
        "protocolVersions": SUPPORTED_PROTOCOL_VERSIONS,
        "transports": ["stdio", "sse", "streamable_http"],
        "sessionSupport": true,
        "upstreams": snapshots,
    }))
    .into_response()
}

/// DELETE /mcp: explicit session termination
pub async fn mcp_delete_handler(
    State(router): State<Arc<SessionRouter>>,
    headers: HeaderMap,
) -> Response {
    let Some(id) = header_session_id(&headers) else {
        return ProxyError::invalid_params("missing Mcp-Session-Id header").into_response();
    };
    match router.close_session(&id).await {
        Ok(()) => Json(json!({"status": "terminated"})).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /sse: establish an SSE session; the first event announces the paired
/// message endpoint
pub async fn sse_get_handler(
    State(router): State<Arc<SessionRouter>>,
    Query(params): Query<McpQueryParams>,
    headers: HeaderMap,
) -> Response {
    let session = match router
        .create_session(
            None,
            DownstreamTransportKind::Sse,
            &params.filter_params(),
            Some(context_from_headers(&headers)),
        )
        .await
    {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };

    let keep_alive = router.config().keep_alive_interval;
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?sessionId={}", session.id));
    // SSE sessions die with their stream; the guard runs when the peer goes
    // away and the stream is dropped.
    let cleanup = SessionCleanup {
        router: Arc::downgrade(&router),
        id: session.id.clone(),
    };
    let stream = futures_util::stream::once(async move { Ok::<_, Infallible>(endpoint) })
        .chain(message_stream(&router, &session))
        .map(move |event| {
            let _ = &cleanup;
            event
        });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(keep_alive)
                .text("keep-alive"),
        )
        .into_response()
}

/// Closes an SSE session once its event stream is dropped
struct SessionCleanup {
    router: std::sync::Weak<SessionRouter>,
    id: String,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            let id = std::mem::take(&mut self.id);
            tokio::spawn(async move {
                if let Err(e) = router.close_session(&id).await {
                    debug!(session = %id, "session cleanup failed: {}", e);
                }
            });
        }
    }
}

/// POST /messages?sessionId=…: inbound frames for an SSE session
pub async fn messages_post_handler(
    State(router): State<Arc<SessionRouter>>,
    Query(params): Query<McpQueryParams>,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let Some(id) = params.session_id else {
        return ProxyError::invalid_params("missing sessionId query parameter").into_response();
    };
    let Some(session) = router.get_session(&id).await else {
        return ProxyError::not_found("session", &id).into_response();
    };
    if session.transport != DownstreamTransportKind::Sse {
        return ProxyError::invalid_params(format!(
            "session '{}' is bound to the {} transport, not sse",
            id, session.transport
        ))
        .into_response();
    }

    let cancel = CancellationToken::new();
    match router.dispatch(&session, request, &cancel).await {
        None => StatusCode::ACCEPTED.into_response(),
        Some(response) => {
            // Responses ride the SSE stream; fall back to the HTTP body if
            // the peer never opened one.
            if session.send_outbound(JsonRpcMessage::Response(response.clone())) {
                StatusCode::ACCEPTED.into_response()
            } else {
                Json(response).into_response()
            }
        }
    }
}

/// GET /oauth/callback/{server}: finish a parked upstream authorization
pub async fn oauth_callback_handler(
    State(router): State<Arc<SessionRouter>>,
    Path(server): Path<String>,
    Query(params): Query<OauthCallbackParams>,
) -> Response {
    match router
        .manager()
        .complete_oauth_and_reconnect(&server, &params.code)
        .await
    {
        Ok(status) => {
            info!(upstream = %server, status = %status, "authorization completed");
            Json(json!({"upstream": server, "status": status})).into_response()
        }
        Err(e) => {
            warn!(upstream = %server, "authorization completion failed: {}", e);
            e.into_response()
        }
    }
}

/// Merge the session's outbound messages with relayed upstream notifications
fn session_event_stream(
    router: &Arc<SessionRouter>,
    session: &Arc<Session>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let keep_alive = KeepAlive::new()
        .interval(router.config().keep_alive_interval)
        .text("keep-alive");
    Sse::new(message_stream(router, session)).keep_alive(keep_alive)
}

fn message_stream(
    router: &Arc<SessionRouter>,
    session: &Arc<Session>,
) -> impl futures_util::Stream<Item = Result<Event, Infallible>> {
    let outbound = UnboundedReceiverStream::new(session.attach_outbound())
        .map(|message| serde_json::to_string(&message).unwrap_or_default());
    let notifications = BroadcastStream::new(router.subscribe_notifications())
        .filter_map(|result| async move {
            match result {
                Ok(notification) => serde_json::to_string(&notification).ok(),
                Err(_) => None,
            }
        });

    futures_util::stream::select(outbound, notifications)
        .map(|data| Ok(Event::default().event("message").data(data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SchemaCache;
    use crate::server::config::ServerConfig;
    use crate::session::{InMemorySessionRepository, SessionRepository};
    use crate::upstream::testing::{stub_upstream_config, MockBehavior, MockFactory};
    use crate::upstream::{ManagerConfig, UpstreamManager};
    use axum::body::to_bytes;
    use serde_json::Value;
    use std::collections::BTreeMap;

    async fn test_router() -> Arc<SessionRouter> {
        let factory = MockFactory::new();
        factory.register("files", MockBehavior::default());
        let manager = UpstreamManager::new(ManagerConfig::default(), Arc::new(factory));
        let mut configs = BTreeMap::new();
        configs.insert("files".to_string(), stub_upstream_config(&["fs"]));
        manager.create_all(&configs).await;

        let router = Arc::new(SessionRouter::new(
            manager,
            Arc::new(SchemaCache::default()),
            Arc::new(InMemorySessionRepository::new()) as Arc<dyn SessionRepository>,
            ServerConfig::default(),
        ));
        router.refresh_registry().await.unwrap();
        router
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_routes_compile_with_state() {
        let router = test_router().await;
        let app: Router = mcp_routes().with_state(router);
        let _ = app;
    }

    #[tokio::test]
    async fn test_post_creates_session_and_sets_header() {
        let router = test_router().await;
        let request = JsonRpcRequest::new("ping", None, json!(1));

        let response = mcp_post_handler(
            State(Arc::clone(&router)),
            Query(McpQueryParams::default()),
            HeaderMap::new(),
            Json(request),
        )
        .await;

        let session_id = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(session_id.starts_with("stream-"));

        let body = body_json(response).await;
        assert_eq!(body["result"], json!({}));

        // The session is live and reusable.
        assert!(router.get_session(&session_id).await.is_some());
    }

    #[tokio::test]
    async fn test_post_reuses_session_from_header() {
        let router = test_router().await;

        let first = mcp_post_handler(
            State(Arc::clone(&router)),
            Query(McpQueryParams::default()),
            HeaderMap::new(),
            Json(JsonRpcRequest::new("ping", None, json!(1))),
        )
        .await;
        let session_id = first
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(
            MCP_SESSION_ID_HEADER,
            HeaderValue::from_str(&session_id).unwrap(),
        );
        let second = mcp_post_handler(
            State(Arc::clone(&router)),
            Query(McpQueryParams::default()),
            headers,
            Json(JsonRpcRequest::new("ping", None, json!(2))),
        )
        .await;

        let echoed = second
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(echoed, session_id);
    }

    #[tokio::test]
    async fn test_get_without_stream_returns_endpoint_info() {
        let router = test_router().await;
        let response = mcp_get_handler(State(router), HeaderMap::new()).await;
        let body = body_json(response).await;
        assert_eq!(body["name"], "manifold");
        assert_eq!(body["upstreams"][0]["status"], "connected");
    }

    #[tokio::test]
    async fn test_delete_requires_session_header() {
        let router = test_router().await;
        let response = mcp_delete_handler(State(Arc::clone(&router)), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_messages_requires_known_sse_session() {
        let router = test_router().await;

        let response = messages_post_handler(
            State(Arc::clone(&router)),
            Query(McpQueryParams::default()),
            Json(JsonRpcRequest::new("ping", None, json!(1))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // A streamable HTTP session cannot be driven through /messages.
        let session = router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();
        let response = messages_post_handler(
            State(Arc::clone(&router)),
            Query(McpQueryParams {
                session_id: Some(session.id.clone()),
                ..Default::default()
            }),
            Json(JsonRpcRequest::new("ping", None, json!(1))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_messages_delivers_response_over_stream() {
        let router = test_router().await;
        let session = router
            .create_session(
                None,
                DownstreamTransportKind::Sse,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();
        let mut outbound = session.attach_outbound();

        let response = messages_post_handler(
            State(Arc::clone(&router)),
            Query(McpQueryParams {
                session_id: Some(session.id.clone()),
                ..Default::default()
            }),
            Json(JsonRpcRequest::new("ping", None, json!(7))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        match outbound.recv().await {
            Some(JsonRpcMessage::Response(delivered)) => {
                assert_eq!(delivered.id, Some(json!(7)));
                assert!(delivered.result.is_some());
            }
            other => panic!("expected response on stream, got {:?}", other),
        }
    }
}
