use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::Result;
use crate::executor::ToolInvoker;
use crate::resource::ResourceReader;
use crate::schema::ArgumentModel;
use crate::types::{Catalogue, ResourceDescriptor, ToolDescriptor, ToolOutput};

/// Registered tools and resources, by name
pub struct ToolIndex {
    tools: DashMap<String, ToolDescriptor>,
    resources: DashMap<String, ResourceDescriptor>,
    /// endpoint -> list of tool names
    endpoint_tools: DashMap<String, Vec<String>>,
    /// endpoint -> list of resource names
    endpoint_resources: DashMap<String, Vec<String>>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
            resources: DashMap::new(),
            endpoint_tools: DashMap::new(),
            endpoint_resources: DashMap::new(),
        }
    }

    fn permitted(name: &str, allowed_tools: &[String], denied_tools: &[String]) -> bool {
        (allowed_tools.is_empty() || allowed_tools.iter().any(|t| t == name))
            && !denied_tools.iter().any(|t| t == name)
    }

    /// Replaces whatever the catalogue's endpoint had registered. Returns the
    /// catalogue as registered, after filtering.
    pub fn register_catalogue(
        &self,
        catalogue: &Catalogue,
        allowed_tools: &[String],
        denied_tools: &[String],
    ) -> Catalogue {
        self.remove_endpoint(&catalogue.endpoint);

        let tools: Vec<ToolDescriptor> = catalogue
            .tools
            .iter()
            .filter(|tool| Self::permitted(&tool.name, allowed_tools, denied_tools))
            .cloned()
            .collect();
        for tool in &tools {
            self.tools.insert(tool.name.clone(), tool.clone());
        }
        self.endpoint_tools.insert(
            catalogue.endpoint.clone(),
            tools.iter().map(|t| t.name.clone()).collect(),
        );

        for resource in &catalogue.resources {
            self.resources
                .insert(resource.name.clone(), resource.clone());
        }
        self.endpoint_resources.insert(
            catalogue.endpoint.clone(),
            catalogue.resources.iter().map(|r| r.name.clone()).collect(),
        );

        Catalogue {
            endpoint: catalogue.endpoint.clone(),
            tools,
            resources: catalogue.resources.clone(),
        }
    }

    /// Remove everything registered for an endpoint
    pub fn remove_endpoint(&self, endpoint: &str) {
        if let Some((_, names)) = self.endpoint_tools.remove(endpoint) {
            for name in names {
                self.tools.remove(&name);
            }
        }
        if let Some((_, names)) = self.endpoint_resources.remove(endpoint) {
            for name in names {
                self.resources.remove(&name);
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    /// Finds a resource by name, falling back to its URI.
    pub fn resource(&self, name_or_uri: &str) -> Option<ResourceDescriptor> {
        if let Some(entry) = self.resources.get(name_or_uri) {
            return Some(entry.value().clone());
        }
        self.resources
            .iter()
            .find(|entry| entry.value().uri == name_or_uri)
            .map(|entry| entry.value().clone())
    }

    /// Sorted tool names
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn clear(&self) {
        self.tools.clear();
        self.resources.clear();
        self.endpoint_tools.clear();
        self.endpoint_resources.clear();
    }
}

impl Default for ToolIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// A discovered tool bound to the invocation engine.
#[derive(Clone)]
pub struct ToolHandle {
    descriptor: ToolDescriptor,
    invoker: Arc<ToolInvoker>,
}

impl ToolHandle {
    pub fn new(descriptor: ToolDescriptor, invoker: Arc<ToolInvoker>) -> Self {
        Self {
            descriptor,
            invoker,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn description(&self) -> &str {
        &self.descriptor.description
    }

    pub fn arguments(&self) -> &ArgumentModel {
        &self.descriptor.arguments
    }

    /// Validates `arguments` against the argument model, then invokes.
    /// Only a malformed local call is an `Err`; remote failures are values.
    pub async fn call(&self, mut arguments: Map<String, Value>) -> Result<ToolOutput> {
        self.descriptor.arguments.validate(&arguments)?;
        self.descriptor.arguments.apply_defaults(&mut arguments);
        Ok(self.invoker.invoke(&self.descriptor.name, arguments).await)
    }
}

/// A resource exposed as a zero-argument callable.
#[derive(Clone)]
pub struct ResourceHandle {
    descriptor: ResourceDescriptor,
    reader: Arc<ResourceReader>,
}

impl ResourceHandle {
    pub fn new(descriptor: ResourceDescriptor, reader: Arc<ResourceReader>) -> Self {
        Self { descriptor, reader }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn uri(&self) -> &str {
        &self.descriptor.uri
    }

    pub fn description(&self) -> &str {
        &self.descriptor.description
    }

    pub async fn read(&self) -> ToolOutput {
        self.reader
            .read(&self.descriptor.name, &self.descriptor.uri)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::models::{McpResourceInfo, McpToolInfo};
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor::from(McpToolInfo {
            name: name.to_string(),
            description: Some(format!("{} tool", name)),
            input_schema: Some(json!({"type": "object", "properties": {}})),
        })
    }

    fn catalogue(endpoint: &str, names: &[&str]) -> Catalogue {
        Catalogue {
            endpoint: endpoint.to_string(),
            tools: names.iter().map(|n| tool(n)).collect(),
            resources: vec![ResourceDescriptor::from(McpResourceInfo {
                uri: "kb://visa-rules".to_string(),
                name: "visa_rules".to_string(),
                description: None,
                mime_type: None,
            })],
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let index = ToolIndex::new();
        let registered =
            index.register_catalogue(&catalogue("hub", &["geo.text_to_place", "weather.brief"]), &[], &[]);
        assert_eq!(registered.tools.len(), 2);

        let lookup = index.lookup("weather.brief").unwrap();
        assert_eq!(lookup.description, "weather.brief tool");
        assert_eq!(index.tool_names(), vec!["geo.text_to_place", "weather.brief"]);
        assert_eq!(index.resource("kb://visa-rules").unwrap().name, "visa_rules");
        assert_eq!(index.resource("visa_rules").unwrap().uri, "kb://visa-rules");
    }

    #[test]
    fn test_allowed_tools_filter() {
        let index = ToolIndex::new();
        let registered = index.register_catalogue(
            &catalogue("hub", &["flights.prices", "booking.search"]),
            &["flights.prices".to_string()],
            &[],
        );
        assert_eq!(registered.tool_names(), vec!["flights.prices"]);
        assert!(!index.contains("booking.search"));
    }

    #[test]
    fn test_denied_tools_filter() {
        let index = ToolIndex::new();
        let registered = index.register_catalogue(
            &catalogue("hub", &["flights.prices", "booking.search"]),
            &[],
            &["booking.search".to_string()],
        );
        assert_eq!(registered.tool_names(), vec!["flights.prices"]);
    }

    #[test]
    fn test_reregistering_replaces_endpoint_tools() {
        let index = ToolIndex::new();
        index.register_catalogue(&catalogue("hub", &["old.tool"]), &[], &[]);
        index.register_catalogue(&catalogue("hub", &["new.tool"]), &[], &[]);
        assert!(!index.contains("old.tool"));
        assert!(index.contains("new.tool"));

        index.remove_endpoint("hub");
        assert!(index.tool_names().is_empty());
        assert!(index.resource("visa_rules").is_none());
    }
}
