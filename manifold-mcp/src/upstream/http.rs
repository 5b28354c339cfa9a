//! HTTP-based upstream transports: streamable HTTP and SSE
//!
//! Both ride on `reqwest`. The streamable HTTP transport POSTs each frame to
//! the MCP endpoint and accepts either a JSON body or an SSE body in the
//! response, tracking the `Mcp-Session-Id` the server assigns. The SSE
//! transport holds a long-lived GET stream and POSTs frames to the paired
//! endpoint announced by the server. A 401 from either surfaces as
//! `OauthRequired` with the challenge URL, parking the upstream until the
//! authorization flow completes.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::JsonRpcMessage;
use crate::upstream::transport::{TransportEvent, TransportKind, UpstreamTransport};

/// Header carrying the streamable HTTP session id
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// How long `send` waits for the SSE endpoint announcement
const ENDPOINT_WAIT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One parsed Server-Sent Event
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Drain complete events (terminated by a blank line) from an SSE buffer.
///
/// Comment lines (leading `:`) are heartbeats and are skipped. Incomplete
/// trailing data stays in the buffer for the next chunk.
pub(crate) fn drain_sse_events(buffer: &mut String) -> Vec<SseEvent> {
    let mut events = Vec::new();

    while let Some(split) = buffer.find("\n\n") {
        let raw: String = buffer.drain(..split + 2).collect();
        let mut event_type = "message".to_string();
        let mut data_lines = Vec::new();

        for line in raw.lines() {
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("event:") {
                event_type = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.trim_start().to_string());
            }
        }

        if !data_lines.is_empty() {
            events.push(SseEvent {
                event: event_type,
                data: data_lines.join("\n"),
            });
        }
    }

    events
}

fn build_header_map(headers: &HashMap<String, String>) -> ProxyResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| ProxyError::Configuration {
            message: format!("invalid header name '{}': {}", key, e),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| ProxyError::Configuration {
            message: format!("invalid header value for '{}': {}", key, e),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

fn oauth_challenge(response: &reqwest::Response) -> ProxyError {
    let authorization_url = response
        .headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    ProxyError::OauthRequired {
        upstream: response.url().to_string(),
        authorization_url,
    }
}

/// Pump the body of an SSE response into the event channel as JSON-RPC frames
async fn pump_sse_body(response: reqwest::Response, tx: mpsc::Sender<TransportEvent>, notify_close: bool) {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                for event in drain_sse_events(&mut buffer) {
                    match JsonRpcMessage::parse(&event.data) {
                        Ok(message) => {
                            if tx.send(TransportEvent::Message(message)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!("discarding unparseable SSE frame: {}", e);
                        }
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(TransportEvent::Error(e.to_string())).await;
                break;
            }
        }
    }

    if notify_close {
        let _ = tx.send(TransportEvent::Closed).await;
    }
}

/// Streamable HTTP transport: POST per frame, optional SSE response bodies
pub struct StreamableHttpTransport {
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: Option<String>,
    events_tx: Option<mpsc::Sender<TransportEvent>>,
    authorization_url: Option<String>,
    auth_code: Option<String>,
}

impl StreamableHttpTransport {
    /// Create a transport for the given MCP endpoint
    pub fn new(url: String, headers: HashMap<String, String>) -> ProxyResult<Self> {
        url::Url::parse(&url)?;
        Ok(Self {
            url,
            client: reqwest::Client::new(),
            headers: build_header_map(&headers)?,
            session_id: None,
            events_tx: None,
            authorization_url: None,
            auth_code: None,
        })
    }

    fn sender(&self) -> ProxyResult<mpsc::Sender<TransportEvent>> {
        self.events_tx.clone().ok_or_else(|| ProxyError::Transport {
            message: "transport not started".to_string(),
        })
    }
}

#[async_trait]
impl UpstreamTransport for StreamableHttpTransport {
    async fn start(&mut self) -> ProxyResult<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.events_tx = Some(tx);
        Ok(rx)
    }

    async fn send(&mut self, message: JsonRpcMessage) -> ProxyResult<()> {
        let tx = self.sender()?;

        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&message);
        if let Some(session_id) = &self.session_id {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }
        if let Some(code) = &self.auth_code {
            request = request.header("mcp-authorization-code", code);
        }

        let response = request.send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let err = oauth_challenge(&response);
            if let ProxyError::OauthRequired {
                authorization_url, ..
            } = &err
            {
                self.authorization_url = authorization_url.clone();
            }
            return Err(err);
        }
        if !response.status().is_success() {
            return Err(ProxyError::Transport {
                message: format!("upstream returned {}", response.status()),
            });
        }

        if let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            tokio::spawn(pump_sse_body(response, tx, false));
        } else if content_type.starts_with("application/json") {
            let body = response.text().await?;
            if !body.trim().is_empty() {
                let parsed = JsonRpcMessage::parse(&body).map_err(|e| ProxyError::Protocol {
                    message: format!("invalid response body: {}", e),
                })?;
                tx.send(TransportEvent::Message(parsed))
                    .await
                    .map_err(|_| ProxyError::transport("event channel closed"))?;
            }
        }
        // 202-style empty bodies (notification acks) produce no event.

        Ok(())
    }

    async fn close(&mut self) -> ProxyResult<()> {
        if let Some(session_id) = self.session_id.take() {
            let _ = self
                .client
                .delete(&self.url)
                .headers(self.headers.clone())
                .header(MCP_SESSION_ID_HEADER, session_id)
                .send()
                .await;
        }
        self.events_tx = None;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn authorization_url(&self) -> Option<String> {
        self.authorization_url.clone()
    }

    async fn finish_auth(&mut self, code: &str) -> ProxyResult<()> {
        self.auth_code = Some(code.to_string());
        self.authorization_url = None;
        Ok(())
    }
}

/// SSE transport: long-lived GET stream plus POSTs to the announced endpoint
pub struct SseTransport {
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    endpoint_rx: Option<watch::Receiver<Option<String>>>,
    listen_task: Option<tokio::task::JoinHandle<()>>,
    authorization_url: Option<String>,
    auth_code: Option<String>,
}

impl SseTransport {
    /// Create a transport for the given SSE endpoint
    pub fn new(url: String, headers: HashMap<String, String>) -> ProxyResult<Self> {
        url::Url::parse(&url)?;
        Ok(Self {
            url,
            client: reqwest::Client::new(),
            headers: build_header_map(&headers)?,
            endpoint_rx: None,
            listen_task: None,
            authorization_url: None,
            auth_code: None,
        })
    }

    /// Resolve the message endpoint announced by the server, waiting for the
    /// announcement if the stream only just opened
    async fn message_endpoint(&self) -> ProxyResult<String> {
        let mut rx = self
            .endpoint_rx
            .clone()
            .ok_or_else(|| ProxyError::transport("transport not started"))?;

        let wait = async {
            loop {
                if let Some(endpoint) = rx.borrow().clone() {
                    return endpoint;
                }
                if rx.changed().await.is_err() {
                    // Sender gone; fall back to the base URL below.
                    return String::new();
                }
            }
        };

        match tokio::time::timeout(ENDPOINT_WAIT, wait).await {
            Ok(endpoint) if !endpoint.is_empty() => Ok(endpoint),
            _ => Err(ProxyError::transport(
                "SSE server did not announce a message endpoint",
            )),
        }
    }

    fn resolve_endpoint(base: &str, announced: &str) -> String {
        match url::Url::parse(base).and_then(|b| b.join(announced)) {
            Ok(joined) => joined.to_string(),
            Err(_) => announced.to_string(),
        }
    }
}

#[async_trait]
impl UpstreamTransport for SseTransport {
    async fn start(&mut self) -> ProxyResult<mpsc::Receiver<TransportEvent>> {
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let err = oauth_challenge(&response);
            if let ProxyError::OauthRequired {
                authorization_url, ..
            } = &err
            {
                self.authorization_url = authorization_url.clone();
            }
            return Err(err);
        }
        if !response.status().is_success() {
            return Err(ProxyError::Transport {
                message: format!("SSE endpoint returned {}", response.status()),
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        self.endpoint_rx = Some(endpoint_rx);

        let base_url = self.url.clone();
        self.listen_task = Some(tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for event in drain_sse_events(&mut buffer) {
                            if event.event == "endpoint" {
                                let endpoint =
                                    SseTransport::resolve_endpoint(&base_url, &event.data);
                                let _ = endpoint_tx.send(Some(endpoint));
                                continue;
                            }
                            match JsonRpcMessage::parse(&event.data) {
                                Ok(message) => {
                                    if tx.send(TransportEvent::Message(message)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    debug!("discarding unparseable SSE frame: {}", e);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("SSE stream error: {}", e);
                        let _ = tx.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
            let _ = tx.send(TransportEvent::Closed).await;
        }));

        Ok(rx)
    }

    async fn send(&mut self, message: JsonRpcMessage) -> ProxyResult<()> {
        let endpoint = self.message_endpoint().await?;

        let mut request = self
            .client
            .post(&endpoint)
            .headers(self.headers.clone())
            .json(&message);
        if let Some(code) = &self.auth_code {
            request = request.header("mcp-authorization-code", code);
        }

        let response = request.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(oauth_challenge(&response));
        }
        if !response.status().is_success() {
            return Err(ProxyError::Transport {
                message: format!("message endpoint returned {}", response.status()),
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> ProxyResult<()> {
        if let Some(task) = self.listen_task.take() {
            task.abort();
        }
        self.endpoint_rx = None;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn authorization_url(&self) -> Option<String> {
        self.authorization_url.clone()
    }

    async fn finish_auth(&mut self, code: &str) -> ProxyResult<()> {
        self.auth_code = Some(code.to_string());
        self.authorization_url = None;
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(task) = self.listen_task.take() {
            task.abort();
        }
    }
}
