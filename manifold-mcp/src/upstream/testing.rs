//! Scripted transports for exercising the connection stack without real
//! processes or sockets

use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use async_trait::async_trait;
use manifold_config::UpstreamTransportConfig;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, PromptDescriptor,
    ResourceDescriptor, ToolDefinition,
};
use crate::upstream::transport::{
    TransportEvent, TransportFactory, TransportKind, UpstreamTransport,
};

/// Scripted behavior for a mock upstream
#[derive(Clone)]
pub(crate) struct MockBehavior {
    /// Fail this many `start` calls before succeeding
    pub fail_connects: u32,

    /// Refuse with an OAuth challenge until `finish_auth` runs
    pub unauthorized_until_auth: bool,

    /// Respond to this method with a JSON-RPC error
    pub fail_method: Option<String>,

    /// Accept requests but never answer them
    pub swallow_requests: bool,

    /// Delay inside `start`, for concurrency-bound assertions
    pub connect_delay: Option<Duration>,

    /// Server name reported by `initialize`
    pub server_name: Option<String>,

    /// Capabilities reported by `initialize`
    pub capabilities: Value,

    /// Instructions reported by `initialize`
    pub instructions: Option<String>,

    pub tools: Vec<ToolDefinition>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_connects: 0,
            unauthorized_until_auth: false,
            fail_method: None,
            swallow_requests: false,
            connect_delay: None,
            server_name: None,
            capabilities: Value::Null,
            instructions: None,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
        }
    }
}

/// Observable counters shared between a mock upstream's transports
#[derive(Default)]
pub(crate) struct MockState {
    pub connect_calls: AtomicU32,
    pub created_transports: AtomicU32,
    pub closed_transports: AtomicU32,
    pub remaining_failures: AtomicU32,
    pub authorized: AtomicBool,
    pub finish_auth_codes: SyncMutex<Vec<String>>,
}

/// Concurrency gauge shared across every mock upstream of a factory
#[derive(Default)]
pub(crate) struct MockGauge {
    pub current: AtomicU32,
    pub peak: AtomicU32,
}

pub(crate) struct MockTransport {
    server_name: String,
    behavior: MockBehavior,
    kind: TransportKind,
    state: Arc<MockState>,
    gauge: Option<Arc<MockGauge>>,
    events_tx: Option<mpsc::Sender<TransportEvent>>,
}

impl MockTransport {
    pub fn new(server_name: impl Into<String>, behavior: MockBehavior) -> Self {
        let state = Arc::new(MockState::default());
        state
            .remaining_failures
            .store(behavior.fail_connects, Ordering::SeqCst);
        Self {
            server_name: server_name.into(),
            behavior,
            kind: TransportKind::Stdio,
            state,
            gauge: None,
            events_tx: None,
        }
    }

    pub fn with_state(
        server_name: impl Into<String>,
        behavior: MockBehavior,
        kind: TransportKind,
        state: Arc<MockState>,
        gauge: Option<Arc<MockGauge>>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            behavior,
            kind,
            state,
            gauge,
            events_tx: None,
        }
    }

    fn respond(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        if self
            .behavior
            .fail_method
            .as_deref()
            .is_some_and(|m| m == request.method)
        {
            return JsonRpcResponse::failure(
                JsonRpcError::internal(format!("scripted failure for {}", request.method)),
                request.id.clone(),
            );
        }

        let capabilities = if self.behavior.capabilities.is_null() {
            json!({})
        } else {
            self.behavior.capabilities.clone()
        };

        let result = match request.method.as_str() {
            "initialize" => json!({
                "protocolVersion": crate::protocol::MCP_PROTOCOL_VERSION,
                "capabilities": capabilities,
                "serverInfo": {"name": self.server_name, "version": "1.0.0"},
                "instructions": self.behavior.instructions,
            }),
            "ping" => json!({}),
            "tools/list" => json!({ "tools": self.behavior.tools }),
            "tools/call" => {
                let name = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or("");
                json!({
                    "content": [{"type": "text", "text": format!("{}:{}", self.server_name, name)}],
                    "isError": false
                })
            }
            "resources/list" => json!({ "resources": self.behavior.resources }),
            "resources/read" => {
                let uri = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(|u| u.as_str())
                    .unwrap_or("");
                json!({ "contents": [{"uri": uri, "text": format!("{} content", self.server_name)}] })
            }
            "resources/subscribe" => json!({}),
            "prompts/list" => json!({ "prompts": self.behavior.prompts }),
            "prompts/get" => json!({ "messages": [] }),
            other => {
                return JsonRpcResponse::failure(
                    JsonRpcError::method_not_found(other),
                    request.id.clone(),
                )
            }
        };

        JsonRpcResponse::success(result, request.id.clone())
    }
}

#[async_trait]
impl UpstreamTransport for MockTransport {
    async fn start(&mut self) -> ProxyResult<mpsc::Receiver<TransportEvent>> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gauge) = &self.gauge {
            let current = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
            gauge.peak.fetch_max(current, Ordering::SeqCst);
        }
        if let Some(delay) = self.behavior.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gauge) = &self.gauge {
            gauge.current.fetch_sub(1, Ordering::SeqCst);
        }

        let failures = self.state.remaining_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.state
                .remaining_failures
                .store(failures - 1, Ordering::SeqCst);
            return Err(ProxyError::transport("scripted connect failure"));
        }

        if self.behavior.unauthorized_until_auth && !self.state.authorized.load(Ordering::SeqCst) {
            return Err(ProxyError::OauthRequired {
                upstream: self.server_name.clone(),
                authorization_url: Some("https://auth.example.com/authorize".to_string()),
            });
        }

        let (tx, rx) = mpsc::channel(64);
        self.events_tx = Some(tx);
        Ok(rx)
    }

    async fn send(&mut self, message: JsonRpcMessage) -> ProxyResult<()> {
        let tx = self
            .events_tx
            .clone()
            .ok_or_else(|| ProxyError::transport("mock not started"))?;

        if let JsonRpcMessage::Request(request) = message {
            if request.is_notification() || self.behavior.swallow_requests {
                return Ok(());
            }
            let response = self.respond(&request);
            tx.send(TransportEvent::Message(JsonRpcMessage::Response(response)))
                .await
                .map_err(|_| ProxyError::transport("mock event channel closed"))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> ProxyResult<()> {
        self.state.closed_transports.fetch_add(1, Ordering::SeqCst);
        self.events_tx = None;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn authorization_url(&self) -> Option<String> {
        if self.behavior.unauthorized_until_auth && !self.state.authorized.load(Ordering::SeqCst) {
            Some("https://auth.example.com/authorize".to_string())
        } else {
            None
        }
    }

    async fn finish_auth(&mut self, code: &str) -> ProxyResult<()> {
        self.state.finish_auth_codes.lock().push(code.to_string());
        self.state.authorized.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory wiring named mock upstreams into the connection manager
#[derive(Default)]
pub(crate) struct MockFactory {
    upstreams: SyncMutex<HashMap<String, (MockBehavior, TransportKind, Arc<MockState>)>>,
    pub gauge: Arc<MockGauge>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scripted upstream; returns its state handle for assertions
    pub fn register(&self, name: &str, behavior: MockBehavior) -> Arc<MockState> {
        self.register_kind(name, behavior, TransportKind::Stdio)
    }

    pub fn register_kind(
        &self,
        name: &str,
        behavior: MockBehavior,
        kind: TransportKind,
    ) -> Arc<MockState> {
        let state = Arc::new(MockState::default());
        state
            .remaining_failures
            .store(behavior.fail_connects, Ordering::SeqCst);
        self.upstreams
            .lock()
            .insert(name.to_string(), (behavior, kind, Arc::clone(&state)));
        state
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        name: &str,
        _config: &UpstreamTransportConfig,
    ) -> ProxyResult<Box<dyn UpstreamTransport>> {
        let (behavior, kind, state) = self.upstreams.lock().get(name).cloned().unwrap_or_else(|| {
            (
                MockBehavior::default(),
                TransportKind::Stdio,
                Arc::new(MockState::default()),
            )
        });

        state.created_transports.fetch_add(1, Ordering::SeqCst);
        let server_name = behavior
            .server_name
            .clone()
            .unwrap_or_else(|| format!("{}-server", name));

        Ok(Box::new(MockTransport::with_state(
            server_name,
            behavior,
            kind,
            state,
            Some(Arc::clone(&self.gauge)),
        )))
    }
}

/// Stdio transport config stub for tests that never spawn a real process
pub(crate) fn stub_transport_config() -> UpstreamTransportConfig {
    UpstreamTransportConfig::Stdio {
        command: "mock".to_string(),
        args: vec![],
        cwd: None,
        env: HashMap::new(),
        inherit_parent_env: true,
        env_filter: vec![],
        restart_on_exit: false,
        max_restarts: None,
        restart_delay: Duration::from_secs(1),
    }
}

/// Upstream config stub with the given tags
pub(crate) fn stub_upstream_config(tags: &[&str]) -> manifold_config::UpstreamConfig {
    manifold_config::UpstreamConfig::new(stub_transport_config()).with_tags(tags.iter().copied())
}
