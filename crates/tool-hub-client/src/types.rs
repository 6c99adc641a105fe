use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::models::{McpResourceInfo, McpToolInfo};
use crate::schema::ArgumentModel;

/// Tool metadata from the server, with its derived argument model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub arguments: ArgumentModel,
}

impl From<McpToolInfo> for ToolDescriptor {
    fn from(info: McpToolInfo) -> Self {
        let input_schema = info
            .input_schema
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
        let description = info
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("Tool {} from MCP", info.name));
        Self {
            arguments: ArgumentModel::from_schema(&input_schema),
            name: info.name,
            description,
            input_schema,
        }
    }
}

/// A static named resource ("knowledge base" entry)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub name: String,
    pub uri: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl From<McpResourceInfo> for ResourceDescriptor {
    fn from(info: McpResourceInfo) -> Self {
        Self {
            name: info.name,
            uri: info.uri,
            description: info.description.unwrap_or_default(),
            mime_type: info.mime_type,
        }
    }
}

/// Discovered tools and resources for one endpoint, valid until the next
/// discovery.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Catalogue {
    pub endpoint: String,
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
}

impl Catalogue {
    pub fn empty(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tools: Vec::new(),
            resources: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.resources.is_empty()
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }
}

/// Outcome of one invocation. Remote failures are values, never panics or
/// errors the caller has to catch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Success(String),
    Failure {
        tool: String,
        reason: String,
        attempts: u32,
    },
}

impl ToolOutput {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutput::Success(_))
    }

    /// Result text, or `Error executing tool <name>: ...` on failure.
    pub fn text(&self) -> String {
        self.to_string()
    }

    pub fn into_text(self) -> String {
        match self {
            ToolOutput::Success(text) => text,
            failure => failure.to_string(),
        }
    }
}

impl std::fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolOutput::Success(text) => f.write_str(text),
            ToolOutput::Failure {
                tool,
                reason,
                attempts,
            } => {
                let noun = if *attempts == 1 { "attempt" } else { "attempts" };
                write!(
                    f,
                    "Error executing tool {}: {} (failed after {} {})",
                    tool, reason, attempts, noun
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_text_format() {
        let output = ToolOutput::Failure {
            tool: "flights.prices".to_string(),
            reason: "Timeout error: no answer".to_string(),
            attempts: 3,
        };
        let text = output.text();
        assert!(text.starts_with("Error executing tool flights.prices: "));
        assert!(text.contains("Timeout error: no answer"));
        assert!(text.contains("3 attempts"));
        assert!(!output.is_success());
    }

    #[test]
    fn test_descriptor_defaults_description() {
        let info = McpToolInfo {
            name: "health.ping".to_string(),
            description: None,
            input_schema: None,
        };
        let tool = ToolDescriptor::from(info);
        assert_eq!(tool.description, "Tool health.ping from MCP");
        assert!(tool.arguments.fields.is_empty());
    }
}
