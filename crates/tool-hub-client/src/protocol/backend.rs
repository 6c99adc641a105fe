use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{McpError, Result};
use crate::executor::{CallReply, CallRequest, ResourceRequest, ToolBackend};
use crate::protocol::client::McpProtocolClient;
use crate::protocol::models::{
    render_content, JsonRpcRequest, McpInitializeRequest, INITIALIZE_ID,
};
use crate::session::SessionProbe;
use crate::transports::sse::{SseTransport, TransportOptions, ACCEPT_BOTH};
use crate::types::Catalogue;

/// Opens a fresh connection per logical call against the configured hub.
pub struct HubConnector {
    client: Client,
    config: Arc<ClientConfig>,
    base: TransportOptions,
    shutdown: CancellationToken,
}

impl HubConnector {
    pub fn new(config: Arc<ClientConfig>, shutdown: CancellationToken) -> Result<Self> {
        let url = Url::parse(&config.endpoint)?;
        let override_url = config
            .override_endpoint_url
            .as_deref()
            .map(Url::parse)
            .transpose()?;
        let base = TransportOptions::new(url, &config.session.header)?
            .with_headers(&config.headers)?
            .with_override_endpoint(override_url)
            .with_connect_timeout(config.bootstrap_timeout());
        let client = Client::builder().build()?;

        Ok(Self {
            client,
            config,
            base,
            shutdown,
        })
    }

    /// Opens a transport and completes the handshake.
    pub async fn connect(
        &self,
        session: Option<String>,
    ) -> Result<McpProtocolClient<SseTransport>> {
        let options = self.base.clone().with_session(session);
        let transport = SseTransport::open(&self.client, options, &self.shutdown).await?;
        let mut client = McpProtocolClient::new(transport);
        client.initialize(self.config.bootstrap_timeout()).await?;
        Ok(client)
    }

    fn session_header_value(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.base.session_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
impl ToolBackend for HubConnector {
    async fn discover(&self) -> Result<(Catalogue, Option<String>)> {
        let mut client = self.connect(None).await?;
        let catalogue = client
            .discover(&self.config.endpoint, self.config.bootstrap_timeout())
            .await?;
        let session = client.session_id();
        client.into_transport().close().await;
        Ok((catalogue, session))
    }

    async fn call_tool(&self, request: CallRequest) -> Result<CallReply> {
        let mut client = self.connect(Some(request.session.as_str().to_string())).await?;
        let result = client
            .call_tool(&request.tool, request.arguments, request.timeout)
            .await?;
        let session_id = client.session_id();
        client.into_transport().close().await;

        let text = render_content(&result.content);
        if result.is_error {
            return Err(McpError::ToolReported(text));
        }
        Ok(CallReply { text, session_id })
    }

    async fn read_resource(&self, request: ResourceRequest) -> Result<CallReply> {
        let mut client = self.connect(Some(request.session.as_str().to_string())).await?;
        let result = client.read_resource(&request.uri, request.timeout).await?;
        let session_id = client.session_id();
        client.into_transport().close().await;

        Ok(CallReply {
            text: render_content(&result.contents),
            session_id,
        })
    }
}

#[async_trait]
impl SessionProbe for HubConnector {
    /// Plain GET first; if that carries no session header, a bootstrap
    /// `initialize` POST.
    async fn probe(&self, endpoint: &str) -> Result<Option<String>> {
        let url = Url::parse(endpoint)?;

        match self
            .client
            .get(url.clone())
            .headers(self.base.headers.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .send()
            .await
        {
            Ok(response) => {
                if let Some(id) = self.session_header_value(response.headers()) {
                    return Ok(Some(id));
                }
                debug!("GET {} returned {} without a session", url, response.status());
            }
            Err(e) => debug!("GET probe of {} failed: {}", url, e),
        }

        let initialize = JsonRpcRequest::new(
            INITIALIZE_ID,
            "initialize",
            Some(serde_json::to_value(McpInitializeRequest::default())?),
        );
        let response = self
            .client
            .post(url)
            .headers(self.base.headers.clone())
            .header(ACCEPT, ACCEPT_BOTH)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.config.session.probe_timeout())
            .json(&initialize)
            .send()
            .await?;
        Ok(self.session_header_value(response.headers()))
    }
}

impl std::fmt::Debug for HubConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConnector")
            .field("endpoint", &self.config.endpoint)
            .finish()
    }
}
