use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{McpError, Result};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

// Request ids are scoped to one transport connection
pub const INITIALIZE_ID: u64 = 1;
pub const LIST_TOOLS_ID: u64 = 2;
pub const CALL_TOOL_ID: u64 = 3;
pub const LIST_RESOURCES_ID: u64 = 4;
pub const READ_RESOURCE_ID: u64 = 5;

// JSON-RPC 2.0 base types

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Servers echo our integer ids; some stringify them.
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn matches(&self, id: u64) -> bool {
        match &self.id {
            Value::Number(n) => n.as_u64() == Some(id),
            Value::String(s) => s.parse::<u64>().ok() == Some(id),
            _ => false,
        }
    }

    /// Turns the envelope into its `result`, mapping an `error` member to
    /// [`McpError::Protocol`].
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(McpError::Protocol {
                code: error.code,
                message: error.message,
            });
        }
        self.result
            .ok_or_else(|| McpError::Protocol {
                code: -32603,
                message: "Missing result".to_string(),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn initialized() -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: "notifications/initialized".to_string(),
            params: None,
        }
    }
}

/// Anything that travels over the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    pub fn from_value(value: Value) -> Result<Self> {
        let has = |key: &str| value.get(key).is_some();
        if has("result") || has("error") {
            Ok(JsonRpcMessage::Response(serde_json::from_value(value)?))
        } else if has("method") && has("id") {
            Ok(JsonRpcMessage::Request(serde_json::from_value(value)?))
        } else if has("method") {
            Ok(JsonRpcMessage::Notification(serde_json::from_value(value)?))
        } else {
            Err(McpError::Serialization(format!(
                "Not a JSON-RPC message: {}",
                value
            )))
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            JsonRpcMessage::Request(r) => serde_json::to_value(r)?,
            JsonRpcMessage::Response(r) => serde_json::to_value(r)?,
            JsonRpcMessage::Notification(n) => serde_json::to_value(n)?,
        })
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }
}

// MCP Protocol types

/// Initialize request sent by client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpInitializeRequest {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

impl Default for McpInitializeRequest {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "tool-hub-client".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Initialize result from server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpInitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
}

impl ServerCapabilities {
    pub fn supports_resources(&self) -> bool {
        self.resources.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolListResult {
    pub tools: Vec<McpToolInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResourceListResult {
    pub resources: Vec<McpResourceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResourceInfo {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Tool call request/result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolCallRequest {
    pub name: String,
    pub arguments: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct McpToolCallResult {
    /// Ordered content items; shapes other than text are kept verbatim
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpReadResourceRequest {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpReadResourceResult {
    #[serde(default)]
    pub contents: Vec<Value>,
}

/// Joins text segments with newlines; other item shapes are stringified.
pub fn render_content(items: &[Value]) -> String {
    items
        .iter()
        .map(|item| match item.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
