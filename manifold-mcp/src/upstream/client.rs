//! MCP client for one upstream connection
//!
//! The client owns its transport exclusively. Outgoing requests are numbered
//! and matched to responses through a pending map; incoming notifications fan
//! out on a broadcast channel so the session layer can forward them
//! downstream. Connection state is observable through a watch channel, which
//! the manager uses to notice transport loss.

use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tracing::debug;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{
    methods, notifications, CallToolParams, CallToolResult, CapabilitySet, GetPromptParams,
    GetPromptResult, InitializeParams, InitializeResult, JsonRpcMessage, JsonRpcRequest,
    JsonRpcResponse, ListPromptsResult, ListResourcesResult, ListToolsResult, ReadResourceResult,
    ResourceParams, ServerInfo,
};
use crate::upstream::transport::{TransportEvent, TransportKind, UpstreamTransport};

/// Broadcast capacity for upstream notifications
const NOTIFICATION_CAPACITY: usize = 128;

type PendingMap = Arc<SyncMutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

/// Client for a single upstream MCP server
pub struct UpstreamClient {
    name: String,
    kind: TransportKind,
    transport: Mutex<Box<dyn UpstreamTransport>>,
    pending: PendingMap,
    next_id: AtomicI64,
    request_timeout: Option<Duration>,

    server_info: SyncRwLock<Option<ServerInfo>>,
    capabilities: SyncRwLock<Option<CapabilitySet>>,
    instructions: SyncRwLock<Option<String>>,

    notifications_tx: broadcast::Sender<JsonRpcRequest>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    reader_task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl UpstreamClient {
    /// Wrap a transport; the connection opens on `connect`
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn UpstreamTransport>,
        request_timeout: Option<Duration>,
    ) -> Self {
        let (notifications_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);
        Self {
            name: name.into(),
            kind: transport.kind(),
            transport: Mutex::new(transport),
            pending: Arc::new(SyncMutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            request_timeout,
            server_info: SyncRwLock::new(None),
            capabilities: SyncRwLock::new(None),
            instructions: SyncRwLock::new(None),
            notifications_tx,
            connected_tx,
            connected_rx,
            reader_task: SyncMutex::new(None),
        }
    }

    /// Upstream name this client serves
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport kind backing this client
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Open the transport and start demultiplexing inbound frames
    pub async fn connect(&self, connection_timeout: Option<Duration>) -> ProxyResult<()> {
        let mut transport = self.transport.lock().await;
        let events = match connection_timeout {
            Some(timeout) => tokio::time::timeout(timeout, transport.start())
                .await
                .map_err(|_| ProxyError::Timeout { timeout })??,
            None => transport.start().await?,
        };
        drop(transport);

        let pending = Arc::clone(&self.pending);
        let notifications_tx = self.notifications_tx.clone();
        let connected_tx = self.connected_tx.clone();
        let name = self.name.clone();

        let _ = connected_tx.send(true);
        let task = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message(JsonRpcMessage::Response(response)) => {
                        let key = response
                            .id
                            .as_ref()
                            .map(value_key)
                            .unwrap_or_default();
                        let sender = pending.lock().remove(&key);
                        match sender {
                            Some(sender) => {
                                let _ = sender.send(response);
                            }
                            None => {
                                debug!(upstream = %name, id = %key, "response without pending request");
                            }
                        }
                    }
                    TransportEvent::Message(JsonRpcMessage::Request(request)) => {
                        if request.is_notification() {
                            let _ = notifications_tx.send(request);
                        } else {
                            debug!(
                                upstream = %name,
                                method = %request.method,
                                "dropping unsupported server-initiated request"
                            );
                        }
                    }
                    TransportEvent::Error(message) => {
                        debug!(upstream = %name, "transport error: {}", message);
                    }
                    TransportEvent::Closed => break,
                }
            }
            let _ = connected_tx.send(false);
            // Dropping the map wakes every pending caller with a closed channel.
            pending.lock().clear();
        });
        *self.reader_task.lock() = Some(task);

        Ok(())
    }

    /// Run the MCP handshake and record what the upstream reports
    pub async fn initialize(&self, client_info: ServerInfo) -> ProxyResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: crate::protocol::MCP_PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info,
        };
        let raw = self
            .request(methods::INITIALIZE, Some(serde_json::to_value(&params)?))
            .await?;
        let result: InitializeResult =
            serde_json::from_value(raw).map_err(|e| ProxyError::Protocol {
                message: format!("invalid initialize result: {}", e),
            })?;

        *self.server_info.write() = Some(result.server_info.clone());
        *self.capabilities.write() = Some(result.capabilities.clone());
        *self.instructions.write() = result.instructions.clone();

        self.notify(notifications::INITIALIZED, None).await?;
        Ok(result)
    }

    /// Issue a request and await the correlated response
    pub async fn request(&self, method: &str, params: Option<Value>) -> ProxyResult<Value> {
        if !self.is_connected() {
            return Err(ProxyError::not_connected(&self.name));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.clone(), tx);

        let request = JsonRpcRequest::new(method, params, json!(id));
        let send_result = {
            let mut transport = self.transport.lock().await;
            transport.send(JsonRpcMessage::Request(request)).await
        };
        if let Err(e) = send_result {
            self.pending.lock().remove(&key);
            return Err(e);
        }

        let response = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(result) => result,
                Err(_) => {
                    self.pending.lock().remove(&key);
                    return Err(ProxyError::Timeout { timeout });
                }
            },
            None => rx.await,
        };

        let response = response.map_err(|_| ProxyError::not_connected(&self.name))?;
        if let Some(error) = response.error {
            return Err(ProxyError::Protocol {
                message: format!("upstream error {}: {}", error.code, error.message),
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> ProxyResult<()> {
        let mut transport = self.transport.lock().await;
        transport
            .send(JsonRpcMessage::Request(JsonRpcRequest::notification(
                method, params,
            )))
            .await
    }

    /// Close the transport and stop the reader
    pub async fn close(&self) -> ProxyResult<()> {
        let result = {
            let mut transport = self.transport.lock().await;
            transport.close().await
        };
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        let _ = self.connected_tx.send(false);
        self.pending.lock().clear();
        result
    }

    /// Whether the transport is currently live
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Wait until the transport reports closed
    pub async fn wait_disconnected(&self) {
        let mut rx = self.connected_rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Server info reported during the handshake
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().clone()
    }

    /// Capabilities reported during the handshake
    pub fn server_capabilities(&self) -> Option<CapabilitySet> {
        self.capabilities.read().clone()
    }

    /// Instruction text reported during the handshake, forwarded verbatim
    pub fn instructions(&self) -> Option<String> {
        self.instructions.read().clone()
    }

    /// Subscribe to notifications forwarded from this upstream
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<JsonRpcRequest> {
        self.notifications_tx.subscribe()
    }

    /// Authorization URL captured from an OAuth challenge
    pub async fn authorization_url(&self) -> Option<String> {
        self.transport.lock().await.authorization_url()
    }

    /// Complete a pending OAuth exchange on the underlying transport
    pub async fn finish_auth(&self, code: &str) -> ProxyResult<()> {
        self.transport.lock().await.finish_auth(code).await
    }

    // Typed operations used by the router.

    pub async fn list_tools(&self, cursor: Option<String>) -> ProxyResult<ListToolsResult> {
        let params = cursor.map(|c| json!({ "cursor": c }));
        let raw = self.request(methods::TOOLS_LIST, params).await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> ProxyResult<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let raw = self
            .request(methods::TOOLS_CALL, Some(serde_json::to_value(&params)?))
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> ProxyResult<ListResourcesResult> {
        let params = cursor.map(|c| json!({ "cursor": c }));
        let raw = self.request(methods::RESOURCES_LIST, params).await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn read_resource(&self, uri: &str) -> ProxyResult<ReadResourceResult> {
        let params = ResourceParams {
            uri: uri.to_string(),
        };
        let raw = self
            .request(methods::RESOURCES_READ, Some(serde_json::to_value(&params)?))
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn subscribe_resource(&self, uri: &str) -> ProxyResult<Value> {
        let params = ResourceParams {
            uri: uri.to_string(),
        };
        self.request(
            methods::RESOURCES_SUBSCRIBE,
            Some(serde_json::to_value(&params)?),
        )
        .await
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> ProxyResult<ListPromptsResult> {
        let params = cursor.map(|c| json!({ "cursor": c }));
        let raw = self.request(methods::PROMPTS_LIST, params).await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> ProxyResult<GetPromptResult> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        let raw = self
            .request(methods::PROMPTS_GET, Some(serde_json::to_value(&params)?))
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    pub async fn ping(&self) -> ProxyResult<()> {
        self.request(methods::PING, None).await?;
        Ok(())
    }
}

impl Drop for UpstreamClient {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}

/// Canonical map key for a JSON-RPC id value
fn value_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
