//! MCP Client Manager: connects/reconnects transports, aggregates the
//! tool catalog, routes calls, and tracks pending-request state (spec
//! §4.3). Generalizes the teacher's `UnifiedMcpServer` registration and
//! first-registration-wins routing pattern (`mcp_server.rs`) from an
//! in-process `ToolProtocol` aggregator to real out-of-process JSON-RPC
//! transports.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};

use crate::error::AgentError;
use crate::mcp::protocol::{
    ClientInfo, InitializeParams, JsonRpcInbound, JsonRpcNotification, JsonRpcRequest, RequestId,
    ToolsCallParams, ToolsCallResult, ToolsListResult, METHOD_INITIALIZE, METHOD_TOOLS_CALL,
    METHOD_TOOLS_LIST, NOTIFICATION_INITIALIZED, NOTIFICATION_TOOLS_LIST_CHANGED,
};
use crate::mcp::transport::{
    bind_inbound_listener, StdioTransport, Transport, WsClientTransport, WsServerConnectionTransport,
};
use crate::model::{ConnectionStatus, ServerConnection, ToolDescriptor, TransportKind};
use crate::retry::BackoffPolicy;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum TransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cwd: Option<String>,
    },
    WebsocketClient {
        url: String,
    },
    /// Bookkeeping only: marks a connection accepted by `serve_inbound`.
    /// Not a valid argument to `connect()` — the transport for this kind
    /// is established by accepting on a shared listener, not by dialing.
    WebsocketServer {
        addr: String,
    },
}

#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub id: String,
    pub transport: TransportConfig,
}

/// Events the Engine polls via `subscribe()` — the one-direction
/// ownership chosen to break the Engine/Manager circular reference (spec
/// §9; decision recorded in DESIGN.md).
#[derive(Debug, Clone)]
pub enum McpEvent {
    ServerConnected { id: String },
    ServerDisconnected { id: String },
    ServerReconnecting { id: String, attempt: u32 },
    ToolsChanged { id: String },
}

struct Connection {
    info: RwLock<ServerConnection>,
    transport: Arc<dyn Transport>,
    tools: RwLock<Vec<ToolDescriptor>>,
    config: TransportConfig,
}

pub struct McpClientManager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    pending: Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, AgentError>>>>>,
    name_index: RwLock<HashMap<String, String>>,
    next_id: AtomicI64,
    events_tx: broadcast::Sender<McpEvent>,
}

impl Default for McpClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClientManager {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            connections: RwLock::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            name_index: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.events_tx.subscribe()
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Establishes a transport, performs the `initialize` handshake,
    /// caches `tools/list`, and marks the connection `connected`.
    pub async fn connect(&self, config: McpServerConfig) -> Result<(), AgentError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let (transport, kind): (Arc<dyn Transport>, TransportKind) = match &config.transport {
            TransportConfig::Stdio { command, args, env, cwd } => {
                let t = StdioTransport::spawn(command, args, env, cwd.as_deref(), inbound_tx).await?;
                (Arc::new(t), TransportKind::Stdio)
            }
            TransportConfig::WebsocketClient { url } => {
                let t = WsClientTransport::connect(url, inbound_tx).await?;
                (Arc::new(t), TransportKind::WebsocketClient)
            }
            TransportConfig::WebsocketServer { .. } => {
                return Err(AgentError::tool_execution_error(
                    "inbound websocket connections are registered via serve_inbound(), not connect()",
                ));
            }
        };

        let mut info = ServerConnection::new(config.id.clone(), kind);
        info.status = ConnectionStatus::Connecting;

        let connection = Arc::new(Connection {
            info: RwLock::new(info),
            transport,
            tools: RwLock::new(Vec::new()),
            config: config.transport.clone(),
        });

        self.connections
            .write()
            .await
            .insert(config.id.clone(), connection.clone());

        self.spawn_inbound_dispatcher(config.id.clone(), connection.clone(), inbound_rx);

        self.handshake(&config.id, &connection).await?;

        Ok(())
    }

    async fn handshake(&self, id: &str, connection: &Arc<Connection>) -> Result<(), AgentError> {
        self.request(
            connection,
            METHOD_INITIALIZE,
            Some(serde_json::to_value(InitializeParams {
                protocol_version: "2024-11-05".to_string(),
                capabilities: serde_json::json!({}),
                client_info: ClientInfo {
                    name: "agent-core".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            })?),
            DEFAULT_CALL_TIMEOUT,
        )
        .await?;

        self.notify(connection, NOTIFICATION_INITIALIZED, None).await?;

        self.refresh_tools(id, connection).await?;

        {
            let mut info = connection.info.write().await;
            info.status = ConnectionStatus::Connected;
            info.last_connected_at = Some(chrono::Utc::now());
            info.reconnect_attempt_count = 0;
        }
        let _ = self.events_tx.send(McpEvent::ServerConnected { id: id.to_string() });

        Ok(())
    }

    async fn refresh_tools(&self, id: &str, connection: &Arc<Connection>) -> Result<(), AgentError> {
        let result: ToolsListResult = self
            .request_typed(connection, METHOD_TOOLS_LIST, None, DEFAULT_CALL_TIMEOUT)
            .await?;

        let descriptors: Vec<ToolDescriptor> = result
            .tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t.input_schema,
                owning_client_id: id.to_string(),
            })
            .collect();

        {
            let mut tools = connection.tools.write().await;
            *tools = descriptors.clone();
        }
        {
            let mut info = connection.info.write().await;
            info.tool_count = descriptors.len();
        }

        let mut index = self.name_index.write().await;
        for d in &descriptors {
            // First-registration-wins (spec §4.3 / open question decision
            // recorded in DESIGN.md): later registrations of the same
            // bare name are shadowed, with a warning.
            index.entry(d.name.clone()).or_insert_with(|| {
                id.to_string()
            });
            if index.get(&d.name).map(|owner| owner != id).unwrap_or(false) {
                log::warn!(
                    "tools:collision: '{}' already owned by another client; keeping existing owner",
                    d.name
                );
            }
        }

        Ok(())
    }

    fn spawn_inbound_dispatcher(
        &self,
        id: String,
        connection: Arc<Connection>,
        mut inbound_rx: mpsc::UnboundedReceiver<JsonRpcInbound>,
    ) {
        let pending = self.pending.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound_rx.recv().await {
                match msg {
                    JsonRpcInbound::Response { id: req_id, result, error } => {
                        let mut pending = pending.lock().await;
                        if let Some(sender) = pending.remove(&req_id) {
                            let outcome = if let Some(err) = error {
                                Err(AgentError::tool_execution_error(err.message))
                            } else {
                                Ok(result.unwrap_or(Value::Null))
                            };
                            let _ = sender.send(outcome);
                        }
                    }
                    JsonRpcInbound::Notification { method, .. } => {
                        if method == NOTIFICATION_TOOLS_LIST_CHANGED {
                            let _ = events_tx.send(McpEvent::ToolsChanged { id: id.clone() });
                        }
                    }
                }
            }
            // Channel closed: transport's reader task ended, meaning the
            // peer disconnected.
            {
                let mut info = connection.info.write().await;
                info.status = ConnectionStatus::Disconnected;
            }
            let _ = events_tx.send(McpEvent::ServerDisconnected { id: id.clone() });
        });
    }

    async fn request(
        &self,
        connection: &Arc<Connection>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let request = JsonRpcRequest::new(id.clone(), method, params);
        let raw = serde_json::to_string(&request)?;
        if let Err(e) = connection.transport.send_line(raw).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(AgentError::network_error("transport closed before response arrived"))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(AgentError::timeout(format!("{method} timed out")))
            }
        }
    }

    async fn request_typed<T: serde::de::DeserializeOwned>(
        &self,
        connection: &Arc<Connection>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<T, AgentError> {
        let value = self.request(connection, method, params, timeout).await?;
        serde_json::from_value(value).map_err(AgentError::from)
    }

    async fn notify(
        &self,
        connection: &Arc<Connection>,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), AgentError> {
        let notification = JsonRpcNotification::new(method, params);
        let raw = serde_json::to_string(&notification)?;
        connection.transport.send_line(raw).await
    }

    /// Union of cached tool descriptors across all connected servers.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let connections = self.connections.read().await;
        let mut all = Vec::new();
        for conn in connections.values() {
            all.extend(conn.tools.read().await.iter().cloned());
        }
        all
    }

    /// Dispatches `tools/call` to the owning connection. Falls back to a
    /// linear search (refreshing each connection's catalog) if the name
    /// is not in the index, per spec §4.3.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, AgentError> {
        let owner_id = {
            let index = self.name_index.read().await;
            index.get(name).cloned()
        };

        let owner_id = match owner_id {
            Some(id) => id,
            None => self.find_owner_by_linear_search(name).await?,
        };

        let connection = {
            let connections = self.connections.read().await;
            connections
                .get(&owner_id)
                .cloned()
                .ok_or_else(|| AgentError::tool_execution_error(format!("connection '{owner_id}' not found")))?
        };

        let result: ToolsCallResult = self
            .request_typed(
                &connection,
                METHOD_TOOLS_CALL,
                Some(serde_json::to_value(ToolsCallParams {
                    name: name.to_string(),
                    arguments,
                })?),
                DEFAULT_CALL_TIMEOUT,
            )
            .await?;

        if result.is_error.unwrap_or(false) {
            return Err(AgentError::tool_execution_error(result.as_text()));
        }
        Ok(result.as_text())
    }

    async fn find_owner_by_linear_search(&self, name: &str) -> Result<String, AgentError> {
        let ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for id in ids {
            let connection = {
                let connections = self.connections.read().await;
                connections.get(&id).cloned()
            };
            if let Some(connection) = connection {
                let _ = self.refresh_tools(&id, &connection).await;
                if connection.tools.read().await.iter().any(|t| t.name == name) {
                    return Ok(id);
                }
            }
        }
        Err(AgentError::tool_execution_error(format!("NOT_FOUND: {name}")))
    }

    /// Binds an inbound WebSocket listener and accepts connections in a
    /// loop, registering each accepted peer as its own `ServerConnection`
    /// (spec §4.3 transport (c), §6 "Inbound WebSocket server"). Runs
    /// until the listener errors; intended to be driven from a
    /// caller-owned background task (e.g. `tokio::spawn`).
    pub async fn serve_inbound(&self, addr: &str) -> Result<(), AgentError> {
        let listener = bind_inbound_listener(addr).await?;
        let mut next = 0u64;
        loop {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let transport = WsServerConnectionTransport::accept(&listener, inbound_tx).await?;

            let id = format!("inbound-{next}");
            next += 1;

            let mut info = ServerConnection::new(id.clone(), TransportKind::WebsocketServer);
            info.status = ConnectionStatus::Connecting;

            let connection = Arc::new(Connection {
                info: RwLock::new(info),
                transport: Arc::new(transport),
                tools: RwLock::new(Vec::new()),
                config: TransportConfig::WebsocketServer { addr: addr.to_string() },
            });

            self.connections.write().await.insert(id.clone(), connection.clone());
            self.spawn_inbound_dispatcher(id.clone(), connection.clone(), inbound_rx);

            if let Err(e) = self.handshake(&id, &connection).await {
                log::error!("inbound connection '{id}' handshake failed: {e}");
                self.connections.write().await.remove(&id);
            }
        }
    }

    pub async fn disconnect(&self, id: &str) -> Result<(), AgentError> {
        if let Some(connection) = self.connections.write().await.remove(id) {
            connection.transport.close().await?;
            self.name_index.write().await.retain(|_, owner| owner != id);
            let _ = self.events_tx.send(McpEvent::ServerDisconnected { id: id.to_string() });
        }
        Ok(())
    }

    pub async fn connection_status(&self, id: &str) -> Option<ConnectionStatus> {
        let connections = self.connections.read().await;
        let conn = connections.get(id)?;
        Some(conn.info.read().await.status)
    }

    /// Reconnects a disconnected server with exponential backoff up to
    /// the configured attempt ceiling (default 10, base 3s per spec
    /// §4.3). Intended to be driven by a caller-owned loop that watches
    /// `ServerDisconnected` events from `subscribe()`.
    pub async fn reconnect_with_backoff(&self, id: &str) -> Result<(), AgentError> {
        let config = {
            let connections = self.connections.read().await;
            connections.get(id).map(|c| c.config.clone())
        };
        let Some(transport_config) = config else {
            return Err(AgentError::tool_execution_error(format!("unknown connection '{id}'")));
        };

        let backoff = BackoffPolicy::mcp_reconnect();
        let mut attempt = 0u32;
        loop {
            let _ = self.events_tx.send(McpEvent::ServerReconnecting {
                id: id.to_string(),
                attempt,
            });
            match self
                .connect(McpServerConfig {
                    id: id.to_string(),
                    transport: transport_config.clone(),
                })
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= backoff.max_attempts => return Err(e),
                Err(_) => {
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_tools_is_empty_before_any_connection() {
        let manager = McpClientManager::new();
        assert!(manager.list_tools().await.is_empty());
    }

    #[tokio::test]
    async fn call_tool_on_unknown_name_reports_not_found() {
        let manager = McpClientManager::new();
        let result = manager.call_tool("nonexistent", serde_json::json!({})).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("NOT_FOUND"));
    }

    #[tokio::test]
    async fn disconnect_on_unknown_id_is_a_no_op() {
        let manager = McpClientManager::new();
        assert!(manager.disconnect("nope").await.is_ok());
    }
}
