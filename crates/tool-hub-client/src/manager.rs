use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::{McpError, Result};
use crate::executor::{bounded, ToolBackend, ToolInvoker};
use crate::protocol::backend::HubConnector;
use crate::resource::ResourceReader;
use crate::session::{SessionProbe, SessionStore};
use crate::tool_index::{ResourceHandle, ToolHandle, ToolIndex};
use crate::types::{Catalogue, ToolOutput};

/// Entry point: discovery, tool calls and resource reads against one hub.
pub struct ToolClient {
    config: Arc<ClientConfig>,
    backend: Arc<dyn ToolBackend>,
    sessions: Arc<SessionStore>,
    invoker: Arc<ToolInvoker>,
    reader: Arc<ResourceReader>,
    index: Arc<ToolIndex>,
    catalogue: RwLock<Catalogue>,
    shutdown: CancellationToken,
}

impl ToolClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let connector = Arc::new(HubConnector::new(config.clone(), shutdown.clone())?);
        Ok(Self::assemble(config, connector.clone(), connector, shutdown))
    }

    /// Builds a client over any backend, e.g. a scripted one in tests.
    pub fn with_backend<B>(config: ClientConfig, backend: Arc<B>) -> Self
    where
        B: ToolBackend + SessionProbe + 'static,
    {
        Self::assemble(
            Arc::new(config),
            backend.clone(),
            backend,
            CancellationToken::new(),
        )
    }

    fn assemble(
        config: Arc<ClientConfig>,
        backend: Arc<dyn ToolBackend>,
        probe: Arc<dyn SessionProbe>,
        shutdown: CancellationToken,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(probe, &config.session));
        let invoker = Arc::new(ToolInvoker::new(
            config.clone(),
            sessions.clone(),
            backend.clone(),
            shutdown.clone(),
        ));
        let reader = Arc::new(ResourceReader::new(
            config.clone(),
            sessions.clone(),
            backend.clone(),
            shutdown.clone(),
        ));
        Self {
            catalogue: RwLock::new(Catalogue::empty(config.endpoint.clone())),
            config,
            backend,
            sessions,
            invoker,
            reader,
            index: Arc::new(ToolIndex::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    pub fn tool_index(&self) -> Arc<ToolIndex> {
        self.index.clone()
    }

    /// Runs the handshake and listing. Any failure yields an empty catalogue.
    pub async fn discover(&self) -> Catalogue {
        let endpoint = self.config.endpoint.clone();
        let discovered = bounded(
            &self.shutdown,
            self.config.bootstrap_timeout(),
            "discovery",
            self.backend.discover(),
        )
        .await;

        let catalogue = match discovered {
            Ok((catalogue, session)) => {
                if let Some(id) = session {
                    self.sessions.record_server(&endpoint, id);
                }
                self.index.register_catalogue(
                    &catalogue,
                    &self.config.allowed_tools,
                    &self.config.denied_tools,
                )
            }
            Err(e) => {
                warn!(
                    "Discovery against {} failed, continuing without tools: {}",
                    endpoint,
                    e.root_cause()
                );
                self.index.remove_endpoint(&endpoint);
                Catalogue::empty(endpoint)
            }
        };

        info!(
            "Registered {} tools and {} resources",
            catalogue.tools.len(),
            catalogue.resources.len()
        );
        *self.catalogue.write() = catalogue.clone();
        catalogue
    }

    /// Last discovered catalogue
    pub fn catalogue(&self) -> Catalogue {
        self.catalogue.read().clone()
    }

    pub async fn call(&self, tool: &str, arguments: Map<String, Value>) -> ToolOutput {
        self.invoker.invoke(tool, arguments).await
    }

    /// Calls `tool` and parses its text as JSON. An object carrying a
    /// `results` member yields just that member.
    pub async fn call_json(&self, tool: &str, arguments: Map<String, Value>) -> Result<Value> {
        let text = match self.call(tool, arguments).await {
            ToolOutput::Success(text) => text,
            failure => return Err(McpError::ToolReported(failure.into_text())),
        };
        let mut value: Value = serde_json::from_str(&text)?;
        Ok(match value.get_mut("results") {
            Some(results) => results.take(),
            None => value,
        })
    }

    pub async fn read_resource(&self, uri: &str) -> ToolOutput {
        let label = self
            .index
            .resource(uri)
            .map(|r| r.name)
            .unwrap_or_else(|| uri.to_string());
        self.reader.read(&label, uri).await
    }

    pub fn tool(&self, name: &str) -> Option<ToolHandle> {
        self.index
            .lookup(name)
            .map(|descriptor| ToolHandle::new(descriptor, self.invoker.clone()))
    }

    pub fn tools(&self) -> Vec<ToolHandle> {
        self.index
            .tool_names()
            .iter()
            .filter_map(|name| self.tool(name))
            .collect()
    }

    /// Finds a resource by name or URI
    pub fn resource(&self, name: &str) -> Option<ResourceHandle> {
        self.index
            .resource(name)
            .map(|descriptor| ResourceHandle::new(descriptor, self.reader.clone()))
    }

    /// Cancels every open connection; in-flight calls resolve as failures.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down tool hub client for {}", self.config.endpoint);
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for ToolClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
