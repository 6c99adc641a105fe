use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{McpError, Result};
use crate::protocol::models::*;
use crate::types::{Catalogue, ResourceDescriptor, ToolDescriptor};

/// Transport trait for MCP communication
#[async_trait]
pub trait McpTransport: Send {
    async fn send(&self, message: JsonRpcMessage) -> Result<()>;
    /// Next inbound message; `None` once both directions are closed.
    async fn receive(&mut self) -> Option<Result<JsonRpcMessage>>;
    /// Session id the server handed out on this connection, if any.
    fn session_id(&self) -> Option<String>;
    fn closed_reason(&self) -> McpError {
        McpError::Disconnected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Initialized,
    Catalogued,
}

/// MCP protocol client over one transport connection
pub struct McpProtocolClient<T: McpTransport> {
    transport: T,
    state: ClientState,
    server: Option<McpInitializeResult>,
}

impl<T: McpTransport> McpProtocolClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: ClientState::Uninitialized,
            server: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn server(&self) -> Option<&McpInitializeResult> {
        self.server.as_ref()
    }

    pub fn session_id(&self) -> Option<String> {
        self.transport.session_id()
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Waits for the response carrying `id`. Responses for other ids and
    /// notifications are dropped; the first transport error is returned.
    pub async fn await_response(&mut self, id: u64) -> Result<JsonRpcResponse> {
        loop {
            match self.transport.receive().await {
                Some(Ok(JsonRpcMessage::Response(response))) => {
                    if response.matches(id) {
                        return Ok(response);
                    }
                    debug!("Dropping response for id {} while awaiting {}", response.id, id);
                }
                Some(Ok(JsonRpcMessage::Request(request))) => {
                    self.answer_server_request(request).await?;
                }
                Some(Ok(JsonRpcMessage::Notification(notification))) => {
                    debug!("Ignoring notification {}", notification.method);
                }
                Some(Err(e)) => return Err(e),
                None => return Err(self.transport.closed_reason()),
            }
        }
    }

    async fn answer_server_request(&self, request: JsonRpcRequest) -> Result<()> {
        let response = if request.method == "ping" {
            JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: Value::from(request.id),
                result: Some(Value::Object(Map::new())),
                error: None,
            }
        } else {
            debug!("Rejecting server request {}", request.method);
            JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: Value::from(request.id),
                result: None,
                error: Some(JsonRpcError {
                    code: -32601,
                    message: format!("Method not supported: {}", request.method),
                    data: None,
                }),
            }
        };
        self.transport.send(JsonRpcMessage::Response(response)).await
    }

    async fn send_request(
        &mut self,
        id: u64,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let request = JsonRpcRequest::new(id, method, params);
        let exchange = async {
            self.transport.send(JsonRpcMessage::Request(request)).await?;
            self.await_response(id).await
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(response) => response?.into_result(),
            Err(_) => Err(McpError::Timeout(format!(
                "{} (id {}) got no response within {:?}",
                method, id, timeout
            ))),
        }
    }

    /// `Uninitialized -> Initialized`
    pub async fn initialize(&mut self, timeout: Duration) -> Result<McpInitializeResult> {
        let params = serde_json::to_value(McpInitializeRequest::default())?;
        let result = self
            .send_request(INITIALIZE_ID, "initialize", Some(params), timeout)
            .await?;
        let result: McpInitializeResult = serde_json::from_value(result)?;

        self.transport
            .send(JsonRpcMessage::Notification(JsonRpcNotification::initialized()))
            .await?;

        debug!(
            "Initialized against {} v{}",
            result.server_info.name, result.server_info.version
        );
        self.server = Some(result.clone());
        self.state = ClientState::Initialized;
        Ok(result)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.state == ClientState::Uninitialized {
            return Err(McpError::Protocol {
                code: -32002,
                message: "client not initialized".to_string(),
            });
        }
        Ok(())
    }

    pub async fn list_tools(&mut self, timeout: Duration) -> Result<Vec<McpToolInfo>> {
        self.ensure_initialized()?;
        let result = self
            .send_request(LIST_TOOLS_ID, "tools/list", None, timeout)
            .await?;
        let result: McpToolListResult = serde_json::from_value(result)?;
        Ok(result.tools)
    }

    pub async fn list_resources(&mut self, timeout: Duration) -> Result<Vec<McpResourceInfo>> {
        self.ensure_initialized()?;
        let result = self
            .send_request(LIST_RESOURCES_ID, "resources/list", None, timeout)
            .await?;
        let result: McpResourceListResult = serde_json::from_value(result)?;
        Ok(result.resources)
    }

    /// `Initialized -> Catalogued`. Resource listing is best-effort.
    pub async fn discover(&mut self, endpoint: &str, timeout: Duration) -> Result<Catalogue> {
        let tools = self.list_tools(timeout).await?;

        let advertises_resources = self
            .server
            .as_ref()
            .map_or(true, |s| s.capabilities.supports_resources());
        let resources = if advertises_resources {
            match self.list_resources(timeout).await {
                Ok(resources) => resources,
                Err(e) => {
                    warn!("Listing resources on {} failed: {}", endpoint, e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let catalogue = Catalogue {
            endpoint: endpoint.to_string(),
            tools: tools.into_iter().map(ToolDescriptor::from).collect(),
            resources: resources.into_iter().map(ResourceDescriptor::from).collect(),
        };
        info!(
            "{} has {} tools and {} resources",
            endpoint,
            catalogue.tools.len(),
            catalogue.resources.len()
        );
        self.state = ClientState::Catalogued;
        Ok(catalogue)
    }

    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<McpToolCallResult> {
        self.ensure_initialized()?;
        let params = serde_json::to_value(McpToolCallRequest {
            name: name.to_string(),
            arguments,
        })?;
        let result = self
            .send_request(CALL_TOOL_ID, "tools/call", Some(params), timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn read_resource(
        &mut self,
        uri: &str,
        timeout: Duration,
    ) -> Result<McpReadResourceResult> {
        self.ensure_initialized()?;
        let params = serde_json::to_value(McpReadResourceRequest {
            uri: uri.to_string(),
        })?;
        let result = self
            .send_request(READ_RESOURCE_ID, "resources/read", Some(params), timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}
