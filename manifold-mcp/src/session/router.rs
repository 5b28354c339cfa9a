//! Request routing for inbound sessions
//!
//! The router terminates every downstream MCP request. List operations fan
//! out across the session's filtered upstream set, skipping unavailable
//! upstreams with a structured warning; invoke operations resolve exactly
//! one upstream from the server-qualified name and forward once. Tool
//! discovery pages through the registry and resolves full schemas through
//! the coalescing schema cache.

use parking_lot::RwLock as SyncRwLock;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::CapabilityAggregator;
use crate::cache::SchemaCache;
use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{
    methods, notifications, CallToolParams, GetPromptParams, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, ListPromptsResult, ListResourcesResult, PromptDescriptor,
    ResourceDescriptor, ResourceParams, ToolDefinition, MCP_PROTOCOL_VERSION,
};
use crate::registry::{ToolNameFormatter, ToolQuery, ToolRegistry};
use crate::server::config::ServerConfig;
use crate::server::instructions::{InstructionRenderer, PassthroughInstructions};
use crate::session::repository::SessionRepository;
use crate::session::{
    DownstreamTransportKind, FilterParams, NoPresets, PresetResolver, Session, SessionContext,
    SessionFilter,
};
use crate::upstream::{UpstreamManager, UpstreamRecord, UpstreamStatus};

/// Broadcast capacity for notifications relayed downstream
const NOTIFICATION_RELAY_CAPACITY: usize = 256;

/// Failures collected while fanning a list operation out
#[derive(Debug, Default)]
struct PartialFailures(Vec<(String, String)>);

impl PartialFailures {
    fn push(&mut self, server: impl Into<String>, error: impl Into<String>) {
        self.0.push((server.into(), error.into()));
    }

    /// Attach failures to a result object under `_meta`
    fn decorate(self, mut result: Map<String, Value>) -> Value {
        if !self.0.is_empty() {
            let entries: Vec<Value> = self
                .0
                .into_iter()
                .map(|(server, error)| json!({"server": server, "error": error}))
                .collect();
            result.insert("_meta".to_string(), json!({"partialFailures": entries}));
        }
        Value::Object(result)
    }
}

/// Per-session request router
pub struct SessionRouter {
    manager: Arc<UpstreamManager>,
    cache: Arc<SchemaCache>,
    repository: Arc<dyn SessionRepository>,
    presets: Arc<dyn PresetResolver>,
    renderer: Arc<dyn InstructionRenderer>,
    formatter: ToolNameFormatter,
    config: ServerConfig,
    sessions: RwLock<std::collections::HashMap<String, Arc<Session>>>,
    registry: SyncRwLock<Arc<ToolRegistry>>,
    relay_tx: broadcast::Sender<JsonRpcRequest>,
}

impl SessionRouter {
    /// Create a router over the given manager, schema cache, and repository
    pub fn new(
        manager: Arc<UpstreamManager>,
        cache: Arc<SchemaCache>,
        repository: Arc<dyn SessionRepository>,
        config: ServerConfig,
    ) -> Self {
        let formatter = ToolNameFormatter::new(&config.tool_name_pattern).unwrap_or_else(|e| {
            warn!("invalid tool name pattern, using default: {}", e);
            ToolNameFormatter::default()
        });
        let (relay_tx, _) = broadcast::channel(NOTIFICATION_RELAY_CAPACITY);
        Self {
            manager,
            cache,
            repository,
            presets: Arc::new(NoPresets),
            renderer: Arc::new(PassthroughInstructions),
            formatter,
            config,
            sessions: RwLock::new(std::collections::HashMap::new()),
            registry: SyncRwLock::new(Arc::new(ToolRegistry::default())),
            relay_tx,
        }
    }

    /// Use an external preset resolver
    pub fn with_presets(mut self, presets: Arc<dyn PresetResolver>) -> Self {
        self.presets = presets;
        self
    }

    /// Use an external instruction renderer
    pub fn with_instruction_renderer(mut self, renderer: Arc<dyn InstructionRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Connection manager this router dispatches through
    pub fn manager(&self) -> &Arc<UpstreamManager> {
        &self.manager
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Subscribe to upstream notifications relayed downstream
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<JsonRpcRequest> {
        self.relay_tx.subscribe()
    }

    /// Forward notifications from every connected upstream into the relay
    /// channel, refreshing the registry on tool list changes
    pub fn spawn_notification_forwarders(self: &Arc<Self>) {
        let router = Arc::downgrade(self);
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            for record in manager.all().await {
                let Some(client) = record.client().await else {
                    continue;
                };
                let Some(router) = router.upgrade() else {
                    return;
                };
                let mut notifications_rx = client.subscribe_notifications();
                let router = Arc::downgrade(&router);
                tokio::spawn(async move {
                    while let Ok(notification) = notifications_rx.recv().await {
                        let Some(router) = router.upgrade() else {
                            return;
                        };
                        if notification.method == notifications::TOOLS_LIST_CHANGED {
                            if let Err(e) = router.refresh_registry().await {
                                warn!("registry refresh after list change failed: {}", e);
                            }
                        }
                        let _ = router.relay_tx.send(notification);
                    }
                });
            }
        });
    }

    /// Rebuild the tool metadata index from every connected upstream.
    ///
    /// Full definitions seen here warm the schema cache so subsequent pages
    /// rarely touch the upstream again.
    pub async fn refresh_registry(&self) -> ProxyResult<()> {
        let mut join_set = JoinSet::new();
        for record in self.manager.all().await {
            if record.status().await != UpstreamStatus::Connected {
                continue;
            }
            let Some(client) = record.client().await else {
                continue;
            };
            let name = record.name().to_string();
            let tags = record.tags();
            join_set
                .spawn(async move { (name, tags, client.list_tools(None).await) });
        }

        let mut servers = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, tags, Ok(listing))) => {
                    for tool in &listing.tools {
                        self.cache.insert(&name, tool.clone());
                    }
                    servers.push((name, tags, listing.tools));
                }
                Ok((name, _, Err(e))) => {
                    warn!(upstream = %name, "tool listing failed during refresh: {}", e);
                }
                Err(e) => warn!("tool listing task failed: {}", e),
            }
        }

        let registry = ToolRegistry::from_server_tools(servers);
        debug!(tools = registry.len(), "tool registry rebuilt");
        *self.registry.write() = Arc::new(registry);
        Ok(())
    }

    /// Current registry snapshot
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry.read())
    }

    async fn resolved_filter(&self, session: &Session) -> ProxyResult<SessionFilter> {
        match &session.filter {
            SessionFilter::Preset { name } => {
                let resolved = self.presets.resolve(name).await?;
                if matches!(resolved, SessionFilter::Preset { .. }) {
                    return Err(ProxyError::Configuration {
                        message: format!("preset '{}' resolves to another preset", name),
                    });
                }
                Ok(resolved)
            }
            other => Ok(other.clone()),
        }
    }

    /// Upstream records matching the session's filter, in name order
    pub async fn matching_upstreams(
        &self,
        session: &Session,
    ) -> ProxyResult<Vec<Arc<UpstreamRecord>>> {
        let filter = self.resolved_filter(session).await?;
        let mut matching = Vec::new();
        for record in self.manager.all().await {
            if filter.matches(&record.tags())? {
                matching.push(record);
            }
        }
        Ok(matching)
    }

    async fn connected_upstreams(
        &self,
        session: &Session,
    ) -> ProxyResult<(Vec<Arc<UpstreamRecord>>, PartialFailures)> {
        let mut connected = Vec::new();
        let mut failures = PartialFailures::default();
        for record in self.matching_upstreams(session).await? {
            if record.status().await == UpstreamStatus::Connected {
                connected.push(record);
            } else {
                warn!(upstream = %record.name(), "skipping unavailable upstream in list operation");
                failures.push(record.name(), "not connected");
            }
        }
        Ok((connected, failures))
    }

    // Session lifecycle -----------------------------------------------------

    /// Create a session. A missing id is generated as `stream-<uuid>` for
    /// streamable HTTP and a bare uuid otherwise.
    pub async fn create_session(
        &self,
        id: Option<String>,
        kind: DownstreamTransportKind,
        params: &FilterParams,
        context: Option<SessionContext>,
    ) -> ProxyResult<Arc<Session>> {
        let filter = params.resolve_filter()?;
        if let SessionFilter::Preset { name } = &filter {
            // Fail unknown presets at creation, not on first request.
            self.presets.resolve(name).await?;
        }

        let id = id.unwrap_or_else(|| match kind {
            DownstreamTransportKind::StreamableHttp => format!("stream-{}", Uuid::new_v4()),
            _ => Uuid::new_v4().to_string(),
        });
        let pagination = params.pagination.unwrap_or(self.config.default_pagination);
        let session = Arc::new(Session::new(
            id.clone(),
            filter,
            pagination,
            params.template.clone(),
            context,
            kind,
        ));

        self.ensure_upstreams(&session).await?;

        if kind == DownstreamTransportKind::StreamableHttp {
            self.repository.create(&id, session.to_persisted()).await?;
        }
        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&session));

        info!(session = %id, transport = %kind, "session created");
        Ok(session)
    }

    /// Resolve an id to a live session, restoring from the repository or —
    /// when permitted — creating a session under the client's id verbatim.
    pub async fn resume_or_create(
        &self,
        id: &str,
        kind: DownstreamTransportKind,
        params: &FilterParams,
    ) -> ProxyResult<Arc<Session>> {
        if let Some(existing) = self.sessions.read().await.get(id).cloned() {
            if existing.transport != kind {
                return Err(ProxyError::invalid_params(format!(
                    "session '{}' is bound to the {} transport, not {}",
                    id, existing.transport, kind
                )));
            }
            self.repository.update_access(id).await?;
            return Ok(existing);
        }

        if let Some(state) = self.repository.get(id).await? {
            if state.transport_kind != kind {
                return Err(ProxyError::invalid_params(format!(
                    "session '{}' is bound to the {} transport, not {}",
                    id, state.transport_kind, kind
                )));
            }
            let session = Arc::new(Session::from_persisted(id.to_string(), state));
            self.ensure_upstreams(&session).await?;
            self.repository.update_access(id).await?;
            self.sessions
                .write()
                .await
                .insert(id.to_string(), Arc::clone(&session));
            info!(session = %id, "session restored from repository");
            return Ok(session);
        }

        if !self.config.accept_client_session_ids {
            return Err(ProxyError::invalid_params(format!(
                "unknown session id '{}'",
                id
            )));
        }
        self.create_session(Some(id.to_string()), kind, params, None)
            .await
    }

    /// Look up a live session
    pub async fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Drop a session from memory and the repository
    pub async fn close_session(&self, id: &str) -> ProxyResult<()> {
        self.sessions.write().await.remove(id);
        self.repository.delete(id).await?;
        info!(session = %id, "session closed");
        Ok(())
    }

    /// Kick off connection attempts for matching upstreams that are down;
    /// attempts already in flight are joined, not duplicated.
    async fn ensure_upstreams(&self, session: &Session) -> ProxyResult<()> {
        for record in self.matching_upstreams(session).await? {
            let status = record.status().await;
            if matches!(status, UpstreamStatus::Disconnected | UpstreamStatus::Error) {
                let manager = Arc::clone(&self.manager);
                let name = record.name().to_string();
                let config = record.config();
                tokio::spawn(async move {
                    if let Err(e) = manager.create_one(&name, config, None).await {
                        debug!(upstream = %name, "background connect failed: {}", e);
                    }
                });
            }
        }
        Ok(())
    }

    // Dispatch --------------------------------------------------------------

    /// Dispatch one inbound request for a session. Notifications return
    /// `None`; requests always produce a response, errors included.
    pub async fn dispatch(
        &self,
        session: &Arc<Session>,
        request: JsonRpcRequest,
        cancel: &CancellationToken,
    ) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            if request.method == notifications::INITIALIZED {
                session.mark_initialized();
            }
            return None;
        }

        let id = request.id.clone();
        let result = self.route(session, &request, cancel).await;

        Some(match result {
            Ok(value) => JsonRpcResponse::success(value, id),
            Err(e) => {
                if e != ProxyError::Cancelled {
                    debug!(session = %session.id, method = %request.method, error = %e, "request failed");
                }
                JsonRpcResponse::failure(e.into(), id)
            }
        })
    }

    async fn route(
        &self,
        session: &Arc<Session>,
        request: &JsonRpcRequest,
        cancel: &CancellationToken,
    ) -> ProxyResult<Value> {
        let params = request.params.clone();
        match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(session).await,
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => self.handle_list_tools(session, params, cancel).await,
            methods::TOOLS_CALL => {
                let call = parse_params::<CallToolParams>(params)?;
                cancellable(cancel, self.handle_call_tool(session, call)).await
            }
            methods::RESOURCES_LIST => self.handle_list_resources(session, cancel).await,
            methods::RESOURCES_READ => {
                let read = parse_params::<ResourceParams>(params)?;
                cancellable(cancel, self.handle_resource(session, read, false)).await
            }
            methods::RESOURCES_SUBSCRIBE => {
                let subscribe = parse_params::<ResourceParams>(params)?;
                cancellable(cancel, self.handle_resource(session, subscribe, true)).await
            }
            methods::PROMPTS_LIST => self.handle_list_prompts(session, cancel).await,
            methods::PROMPTS_GET => {
                let get = parse_params::<GetPromptParams>(params)?;
                cancellable(cancel, self.handle_get_prompt(session, get)).await
            }
            other => Err(ProxyError::not_found("method", other)),
        }
    }

    async fn handle_initialize(&self, session: &Arc<Session>) -> ProxyResult<Value> {
        session.mark_initialized();

        let aggregated = CapabilityAggregator::aggregate(&self.manager).await;
        let instructions = self.renderer.render(
            &aggregated.instructions,
            session.custom_template.as_deref(),
        );

        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: aggregated.capabilities,
            server_info: self.manager.server_info(),
            instructions: (!instructions.is_empty()).then_some(instructions),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_list_tools(
        &self,
        session: &Arc<Session>,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> ProxyResult<Value> {
        #[derive(serde::Deserialize, Default)]
        struct ListParams {
            cursor: Option<String>,
            limit: Option<usize>,
        }
        let list_params: ListParams = match params {
            Some(params) => serde_json::from_value(params)
                .map_err(|e| ProxyError::invalid_params(format!("bad list params: {}", e)))?,
            None => ListParams::default(),
        };

        let (connected, mut failures) = self.connected_upstreams(session).await?;
        if self.registry.read().is_empty() && !connected.is_empty() {
            self.refresh_registry().await?;
        }

        let allowed: HashSet<String> = connected
            .iter()
            .map(|record| record.name().to_string())
            .collect();
        let scoped = self.registry().filter_by_servers(&allowed);

        let query = if session.enable_pagination {
            ToolQuery {
                limit: Some(
                    list_params
                        .limit
                        .unwrap_or(self.config.default_page_size),
                ),
                cursor: list_params.cursor,
                ..Default::default()
            }
        } else {
            ToolQuery::default()
        };
        let page = scoped.list_tools(&query);

        let mut tools = Vec::with_capacity(page.tools.len());
        for metadata in &page.tools {
            if cancel.is_cancelled() {
                failures.push("*", "listing cancelled before completion");
                break;
            }
            match self.load_tool_schema(&metadata.server, &metadata.name).await {
                Ok(tool) => tools.push(serde_json::to_value(ToolDefinition {
                    name: self.formatter.format(&metadata.server, &metadata.name),
                    description: tool.description,
                    input_schema: tool.input_schema,
                    annotations: tool.annotations,
                })?),
                Err(e) => {
                    warn!(
                        server = %metadata.server,
                        tool = %metadata.name,
                        "schema load failed: {}", e
                    );
                    failures.push(metadata.server.clone(), e.to_string());
                }
            }
        }

        let mut result = Map::new();
        result.insert("tools".to_string(), Value::Array(tools));
        if let Some(next_cursor) = page.next_cursor {
            result.insert("nextCursor".to_string(), Value::String(next_cursor));
        }
        Ok(failures.decorate(result))
    }

    /// Load one tool's full definition through the coalescing schema cache
    pub async fn load_tool_schema(&self, server: &str, tool: &str) -> ProxyResult<ToolDefinition> {
        let manager = Arc::clone(&self.manager);
        let server_owned = server.to_string();
        let tool_owned = tool.to_string();
        self.cache
            .get_or_load(server, tool, move || async move {
                let listing = manager
                    .execute_on(&server_owned, |client| async move {
                        client.list_tools(None).await
                    })
                    .await?;
                listing
                    .tools
                    .into_iter()
                    .find(|t| t.name == tool_owned)
                    .ok_or_else(|| ProxyError::not_found("tool", &tool_owned))
            })
            .await
    }

    async fn handle_call_tool(
        &self,
        session: &Arc<Session>,
        params: CallToolParams,
    ) -> ProxyResult<Value> {
        let (server, tool) = self
            .formatter
            .parse(&params.name)
            .ok_or_else(|| ProxyError::not_found("tool", &params.name))?;

        let record = self.allowed_record(session, server).await?;
        let tool = tool.to_string();
        let result = self
            .manager
            .execute_on(record.name(), |client| async move {
                client.call_tool(&tool, params.arguments).await
            })
            .await
            .map_err(unavailable_on_not_connected)?;
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_list_resources(
        &self,
        session: &Arc<Session>,
        cancel: &CancellationToken,
    ) -> ProxyResult<Value> {
        let (connected, mut failures) = self.connected_upstreams(session).await?;

        let mut join_set = JoinSet::new();
        for record in &connected {
            let Some(client) = record.client().await else {
                failures.push(record.name(), "not connected");
                continue;
            };
            let name = record.name().to_string();
            join_set.spawn(async move { (name, client.list_resources(None).await) });
        }

        let mut by_server: BTreeMap<String, Vec<ResourceDescriptor>> = BTreeMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    failures.push("*", "listing cancelled before completion");
                    break;
                }
                joined = join_set.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(listing)))) => {
                        by_server.insert(name, listing.resources);
                    }
                    Some(Ok((name, Err(e)))) => {
                        warn!(upstream = %name, "resource listing failed: {}", e);
                        failures.push(name, e.to_string());
                    }
                    Some(Err(e)) => {
                        if !e.is_cancelled() {
                            warn!("resource listing task failed: {}", e);
                        }
                    }
                },
            }
        }

        // Duplicate URIs keep the first owner in server order.
        let mut seen = HashSet::new();
        let mut resources = Vec::new();
        for (server, listing) in by_server {
            for resource in listing {
                if !seen.insert(resource.uri.clone()) {
                    warn!(uri = %resource.uri, server = %server, "duplicate resource URI skipped");
                    continue;
                }
                session.index_resource(&resource.uri, &server);
                resources.push(resource);
            }
        }

        let listing = ListResourcesResult {
            resources,
            next_cursor: None,
        };
        let Value::Object(result) = serde_json::to_value(listing)? else {
            return Err(ProxyError::internal("resource listing is not an object"));
        };
        Ok(failures.decorate(result))
    }

    async fn handle_resource(
        &self,
        session: &Arc<Session>,
        params: ResourceParams,
        subscribe: bool,
    ) -> ProxyResult<Value> {
        let server = session
            .resolve_resource(&params.uri)
            .ok_or_else(|| ProxyError::not_found("resource", &params.uri))?;

        let record = self.allowed_record(session, &server).await?;
        let uri = params.uri.clone();
        let result = self
            .manager
            .execute_on(record.name(), |client| async move {
                if subscribe {
                    client.subscribe_resource(&uri).await
                } else {
                    let contents = client.read_resource(&uri).await?;
                    Ok(serde_json::to_value(contents)?)
                }
            })
            .await
            .map_err(unavailable_on_not_connected)?;
        Ok(result)
    }

    async fn handle_list_prompts(
        &self,
        session: &Arc<Session>,
        cancel: &CancellationToken,
    ) -> ProxyResult<Value> {
        let (connected, mut failures) = self.connected_upstreams(session).await?;

        let mut join_set = JoinSet::new();
        for record in &connected {
            let Some(client) = record.client().await else {
                failures.push(record.name(), "not connected");
                continue;
            };
            let name = record.name().to_string();
            join_set.spawn(async move { (name, client.list_prompts(None).await) });
        }

        let mut by_server: BTreeMap<String, Vec<PromptDescriptor>> = BTreeMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    failures.push("*", "listing cancelled before completion");
                    break;
                }
                joined = join_set.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(listing)))) => {
                        by_server.insert(name, listing.prompts);
                    }
                    Some(Ok((name, Err(e)))) => {
                        warn!(upstream = %name, "prompt listing failed: {}", e);
                        failures.push(name, e.to_string());
                    }
                    Some(Err(e)) => {
                        if !e.is_cancelled() {
                            warn!("prompt listing task failed: {}", e);
                        }
                    }
                },
            }
        }

        let mut prompts = Vec::new();
        for (server, listing) in by_server {
            for mut prompt in listing {
                prompt.name = self.formatter.format(&server, &prompt.name);
                prompts.push(prompt);
            }
        }

        let listing = ListPromptsResult {
            prompts,
            next_cursor: None,
        };
        let Value::Object(result) = serde_json::to_value(listing)? else {
            return Err(ProxyError::internal("prompt listing is not an object"));
        };
        Ok(failures.decorate(result))
    }

    async fn handle_get_prompt(
        &self,
        session: &Arc<Session>,
        params: GetPromptParams,
    ) -> ProxyResult<Value> {
        let (server, prompt) = self
            .formatter
            .parse(&params.name)
            .ok_or_else(|| ProxyError::not_found("prompt", &params.name))?;

        let record = self.allowed_record(session, server).await?;
        let prompt = prompt.to_string();
        let result = self
            .manager
            .execute_on(record.name(), |client| async move {
                client.get_prompt(&prompt, params.arguments).await
            })
            .await
            .map_err(unavailable_on_not_connected)?;
        Ok(serde_json::to_value(result)?)
    }

    /// Resolve an upstream by name, enforcing the session's filter. Upstreams
    /// outside the filter read as not found so sessions cannot probe them.
    async fn allowed_record(
        &self,
        session: &Session,
        server: &str,
    ) -> ProxyResult<Arc<UpstreamRecord>> {
        let record = self
            .manager
            .get(server)
            .await
            .ok_or_else(|| ProxyError::not_found("upstream", server))?;
        let filter = self.resolved_filter(session).await?;
        if !filter.matches(&record.tags())? {
            return Err(ProxyError::not_found("upstream", server));
        }
        Ok(record)
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> ProxyResult<T> {
    let params = params.ok_or_else(|| ProxyError::invalid_params("missing params"))?;
    serde_json::from_value(params)
        .map_err(|e| ProxyError::invalid_params(format!("invalid params: {}", e)))
}

/// Map `NotConnected` to the invoke-path error; list paths skip instead
fn unavailable_on_not_connected(error: ProxyError) -> ProxyError {
    match error {
        ProxyError::NotConnected { upstream } => ProxyError::UpstreamUnavailable { upstream },
        other => other,
    }
}

async fn cancellable<F>(cancel: &CancellationToken, fut: F) -> ProxyResult<Value>
where
    F: std::future::Future<Output = ProxyResult<Value>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{SchemaCache, SchemaCacheConfig};
    use crate::protocol::ToolContent;
    use crate::session::InMemorySessionRepository;
    use crate::upstream::testing::{stub_upstream_config, MockBehavior, MockFactory};
    use crate::upstream::{ConnectPolicy, ManagerConfig};
    use serde_json::json;

    fn tool_def(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: Some(format!("{} tool", name)),
            input_schema: json!({"type": "object"}),
            annotations: None,
        }
    }

    struct Fixture {
        router: Arc<SessionRouter>,
        repository: Arc<InMemorySessionRepository>,
    }

    async fn fixture(upstreams: Vec<(&str, &[&str], MockBehavior)>) -> Fixture {
        fixture_with_config(upstreams, ServerConfig::default()).await
    }

    async fn fixture_with_config(
        upstreams: Vec<(&str, &[&str], MockBehavior)>,
        config: ServerConfig,
    ) -> Fixture {
        let factory = MockFactory::new();
        let mut configs = BTreeMap::new();
        for (name, tags, behavior) in upstreams {
            factory.register(name, behavior);
            configs.insert(name.to_string(), stub_upstream_config(tags));
        }
        let manager = UpstreamManager::new(
            ManagerConfig {
                connect: ConnectPolicy {
                    max_attempts: 2,
                    initial_delay: std::time::Duration::from_millis(5),
                },
                ..Default::default()
            },
            Arc::new(factory),
        );
        manager.create_all(&configs).await;

        let repository = Arc::new(InMemorySessionRepository::new());
        let router = Arc::new(SessionRouter::new(
            Arc::clone(&manager),
            Arc::new(SchemaCache::new(SchemaCacheConfig::default())),
            Arc::clone(&repository) as Arc<dyn SessionRepository>,
            config,
        ));
        router.refresh_registry().await.unwrap();
        Fixture { router, repository }
    }

    async fn dispatch(
        router: &Arc<SessionRouter>,
        session: &Arc<Session>,
        method: &str,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        let request = JsonRpcRequest::new(method, params, json!(1));
        router
            .dispatch(session, request, &CancellationToken::new())
            .await
            .expect("requests produce responses")
    }

    fn files_behavior() -> MockBehavior {
        MockBehavior {
            tools: vec![tool_def("read_file"), tool_def("write_file")],
            instructions: Some("files help".to_string()),
            capabilities: json!({"tools": {"listChanged": true}}),
            ..Default::default()
        }
    }

    fn search_behavior() -> MockBehavior {
        MockBehavior {
            tools: vec![tool_def("web_search")],
            resources: vec![ResourceDescriptor {
                uri: "search://recent".to_string(),
                name: Some("recent".to_string()),
                description: None,
                mime_type: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_merges_capabilities_and_instructions() {
        let fx = fixture(vec![
            ("files", &["fs"], files_behavior()),
            ("search", &["web"], search_behavior()),
        ])
        .await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        let response = dispatch(&fx.router, &session, methods::INITIALIZE, None).await;
        let result = response.result.unwrap();
        assert_eq!(result["capabilities"]["tools"]["listChanged"], json!(true));
        assert_eq!(result["serverInfo"]["name"], "manifold");
        assert!(result["instructions"]
            .as_str()
            .unwrap()
            .contains("files help"));
        assert!(session.is_initialized());
    }

    #[tokio::test]
    async fn test_list_tools_qualifies_and_sorts() {
        let fx = fixture(vec![
            ("files", &["fs"], files_behavior()),
            ("search", &["web"], search_behavior()),
        ])
        .await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        let response = dispatch(&fx.router, &session, methods::TOOLS_LIST, None).await;
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec![
                "files_1mcp_read_file",
                "files_1mcp_write_file",
                "search_1mcp_web_search"
            ]
        );
        assert!(tools[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn test_tag_filter_scopes_listing() {
        let fx = fixture(vec![
            ("files", &["fs"], files_behavior()),
            ("search", &["web"], search_behavior()),
        ])
        .await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams {
                    tags: Some("web".to_string()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let response = dispatch(&fx.router, &session, methods::TOOLS_LIST, None).await;
        let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "search_1mcp_web_search");
    }

    #[tokio::test]
    async fn test_paginated_listing_round_trips() {
        let fx = fixture(vec![
            ("files", &["fs"], files_behavior()),
            ("search", &["web"], search_behavior()),
        ])
        .await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams {
                    pagination: Some(true),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({"cursor": cursor, "limit": 2}),
                None => json!({"limit": 2}),
            };
            let response =
                dispatch(&fx.router, &session, methods::TOOLS_LIST, Some(params)).await;
            let result = response.result.unwrap();
            for tool in result["tools"].as_array().unwrap() {
                collected.push(tool["name"].as_str().unwrap().to_string());
            }
            match result.get("nextCursor").and_then(|c| c.as_str()) {
                Some(next) => cursor = Some(next.to_string()),
                None => break,
            }
        }

        assert_eq!(
            collected,
            vec![
                "files_1mcp_read_file",
                "files_1mcp_write_file",
                "search_1mcp_web_search"
            ]
        );
    }

    #[tokio::test]
    async fn test_call_tool_routes_to_owner() {
        let fx = fixture(vec![
            ("files", &["fs"], files_behavior()),
            ("search", &["web"], search_behavior()),
        ])
        .await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        let response = dispatch(
            &fx.router,
            &session,
            methods::TOOLS_CALL,
            Some(json!({"name": "search_1mcp_web_search", "arguments": {"q": "rust"}})),
        )
        .await;
        let result: crate::protocol::CallToolResult =
            serde_json::from_value(response.result.unwrap()).unwrap();
        // The scripted upstream echoes "<server>:<tool>".
        assert_eq!(
            result.content,
            vec![ToolContent::Text {
                text: "search-server:web_search".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_call_tool_outside_filter_is_not_found() {
        let fx = fixture(vec![
            ("files", &["fs"], files_behavior()),
            ("search", &["web"], search_behavior()),
        ])
        .await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams {
                    tags: Some("fs".to_string()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let response = dispatch(
            &fx.router,
            &session,
            methods::TOOLS_CALL,
            Some(json!({"name": "search_1mcp_web_search"})),
        )
        .await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_invoke_on_down_upstream_is_unavailable() {
        let fx = fixture(vec![
            ("files", &["fs"], files_behavior()),
            (
                "broken",
                &[],
                MockBehavior {
                    fail_connects: 99,
                    ..Default::default()
                },
            ),
        ])
        .await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        let response = dispatch(
            &fx.router,
            &session,
            methods::TOOLS_CALL,
            Some(json!({"name": "broken_1mcp_anything"})),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, -32000);
        assert!(error.message.contains("unavailable"));
    }

    #[tokio::test]
    async fn test_list_skips_down_upstreams_with_warning() {
        let fx = fixture(vec![
            ("files", &["fs"], files_behavior()),
            (
                "broken",
                &[],
                MockBehavior {
                    fail_connects: 99,
                    ..Default::default()
                },
            ),
        ])
        .await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        let response = dispatch(&fx.router, &session, methods::TOOLS_LIST, None).await;
        let result = response.result.unwrap();
        assert_eq!(result["tools"].as_array().unwrap().len(), 2);
        let failures = result["_meta"]["partialFailures"].as_array().unwrap();
        assert_eq!(failures[0]["server"], "broken");
    }

    #[tokio::test]
    async fn test_resources_list_and_read() {
        let fx = fixture(vec![
            ("files", &["fs"], files_behavior()),
            ("search", &["web"], search_behavior()),
        ])
        .await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        let response = dispatch(&fx.router, &session, methods::RESOURCES_LIST, None).await;
        let resources = response.result.unwrap()["resources"].as_array().unwrap().clone();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0]["uri"], "search://recent");

        let response = dispatch(
            &fx.router,
            &session,
            methods::RESOURCES_READ,
            Some(json!({"uri": "search://recent"})),
        )
        .await;
        assert!(response.result.is_some());

        let response = dispatch(
            &fx.router,
            &session,
            methods::RESOURCES_READ,
            Some(json!({"uri": "search://unknown"})),
        )
        .await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_session_restoration_skips_handshake() {
        let fx = fixture(vec![("files", &["fs"], files_behavior())]).await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams {
                    tags: Some("fs".to_string()),
                    pagination: Some(true),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        let id = session.id.clone();
        assert!(id.starts_with("stream-"));

        // Simulate a restart: a fresh router over the same repository.
        let fx2 = Fixture {
            router: Arc::new(SessionRouter::new(
                Arc::clone(fx.router.manager()),
                Arc::new(SchemaCache::default()),
                Arc::clone(&fx.repository) as Arc<dyn SessionRepository>,
                ServerConfig::default(),
            )),
            repository: Arc::clone(&fx.repository),
        };
        fx2.router.refresh_registry().await.unwrap();

        let restored = fx2
            .router
            .resume_or_create(
                &id,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
            )
            .await
            .unwrap();

        assert!(restored.is_initialized(), "no handshake replay on restore");
        assert!(restored.enable_pagination);
        assert_eq!(
            restored.filter,
            SessionFilter::Tags {
                tags: vec!["fs".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_transport_kind_mismatch_is_rejected() {
        let fx = fixture(vec![("files", &["fs"], files_behavior())]).await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        let err = fx
            .router
            .resume_or_create(
                &session.id,
                DownstreamTransportKind::Sse,
                &FilterParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_unknown_id_policy() {
        let fx = fixture(vec![("files", &["fs"], files_behavior())]).await;

        // Default: the client-supplied id is adopted verbatim.
        let session = fx
            .router
            .resume_or_create(
                "client-chosen-id",
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(session.id, "client-chosen-id");

        // Strict mode refuses unknown ids.
        let strict = fixture_with_config(
            vec![("files", &["fs"], files_behavior())],
            ServerConfig::default().strict_session_ids(),
        )
        .await;
        let err = strict
            .router
            .resume_or_create(
                "client-chosen-id",
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_close_session_deletes_persisted_state() {
        let fx = fixture(vec![("files", &["fs"], files_behavior())]).await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        assert!(fx.repository.get(&session.id).await.unwrap().is_some());
        fx.router.close_session(&session.id).await.unwrap();
        assert!(fx.router.get_session(&session.id).await.is_none());
        assert!(fx.repository.get(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_invoke_reports_cancellation() {
        let fx = fixture(vec![("files", &["fs"], files_behavior())]).await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = JsonRpcRequest::new(
            methods::TOOLS_CALL,
            Some(json!({"name": "files_1mcp_read_file"})),
            json!(9),
        );
        let response = fx
            .router
            .dispatch(&session, request, &cancel)
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32800);
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let fx = fixture(vec![("files", &["fs"], files_behavior())]).await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        let response = dispatch(&fx.router, &session, "sampling/createMessage", None).await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_notifications_produce_no_response() {
        let fx = fixture(vec![("files", &["fs"], files_behavior())]).await;
        let session = fx
            .router
            .create_session(
                None,
                DownstreamTransportKind::StreamableHttp,
                &FilterParams::default(),
                None,
            )
            .await
            .unwrap();

        let note = JsonRpcRequest::notification(notifications::INITIALIZED, None);
        let response = fx
            .router
            .dispatch(&session, note, &CancellationToken::new())
            .await;
        assert!(response.is_none());
        assert!(session.is_initialized());
    }
}
