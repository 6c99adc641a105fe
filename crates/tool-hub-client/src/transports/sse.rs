use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::HeaderConfig;
use crate::error::{McpError, Result};
use crate::protocol::client::McpTransport;
use crate::protocol::models::JsonRpcMessage;
use crate::transports::decode::{decode_post_body, SseFrame};

pub const ACCEPT_BOTH: &str = "application/json, text/event-stream";

type Inbound = Result<JsonRpcMessage>;

/// Everything needed to open one connection.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub url: Url,
    pub headers: HeaderMap,
    pub session_header: HeaderName,
    pub session_id: Option<String>,
    /// Skip waiting for the `endpoint` event and POST here.
    pub override_endpoint_url: Option<Url>,
    pub connect_timeout: Duration,
}

impl TransportOptions {
    pub fn new(url: Url, session_header: &str) -> Result<Self> {
        Ok(Self {
            url,
            headers: HeaderMap::new(),
            session_header: parse_header_name(session_header)?,
            session_id: None,
            override_endpoint_url: None,
            connect_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_headers(mut self, headers: &[HeaderConfig]) -> Result<Self> {
        for HeaderConfig { name, value } in headers {
            let header_value = value
                .parse()
                .map_err(|e| McpError::InvalidConfig(format!("Invalid header value: {}", e)))?;
            self.headers.insert(parse_header_name(name)?, header_value);
        }
        Ok(self)
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_override_endpoint(mut self, url: Option<Url>) -> Self {
        self.override_endpoint_url = url;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| McpError::InvalidConfig(format!("Invalid header name: {}", e)))
}

/// State shared by the reader and writer tasks.
struct Shared {
    session_header: HeaderName,
    session_id: Mutex<Option<String>>,
    failures: Mutex<Vec<McpError>>,
}

impl Shared {
    fn capture_session(&self, headers: &HeaderMap) {
        let Some(id) = headers
            .get(&self.session_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        else {
            return;
        };
        let mut current = self.session_id.lock();
        if current.as_deref() != Some(id) {
            debug!("Server assigned session {}", id);
            *current = Some(id.to_string());
        }
    }

    fn record_failure(&self, error: McpError) {
        self.failures.lock().push(error);
    }
}

/// SSE read stream plus POST write channel, bridged into one message channel.
///
/// The reader and writer tasks live under one cancellation token; dropping
/// the transport cancels both and releases the HTTP connection.
pub struct SseTransport {
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<JsonRpcMessage>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SseTransport {
    /// Opens the GET stream and starts both tasks. `parent` lets a process
    /// level shutdown reach this connection.
    pub async fn open(
        client: &Client,
        options: TransportOptions,
        parent: &CancellationToken,
    ) -> Result<Self> {
        debug!("Opening SSE stream to {}", options.url);

        let shared = Arc::new(Shared {
            session_header: options.session_header.clone(),
            session_id: Mutex::new(options.session_id.clone()),
            failures: Mutex::new(Vec::new()),
        });

        let mut request = client
            .get(options.url.clone())
            .headers(options.headers.clone())
            .header(ACCEPT, ACCEPT_BOTH);
        if let Some(id) = &options.session_id {
            request = request.header(&options.session_header, id);
        }

        let response = tokio::time::timeout(options.connect_timeout, request.send())
            .await
            .map_err(|_| {
                McpError::Timeout(format!(
                    "Connecting to {} took longer than {:?}",
                    options.url, options.connect_timeout
                ))
            })??;

        let status = response.status();
        shared.capture_session(response.headers());

        let cancel = parent.child_token();
        let (inbound_tx, inbound_rx) = mpsc::channel(100);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let (endpoint_tx, endpoint_rx) = watch::channel(options.override_endpoint_url.clone());

        let mut tasks = Vec::with_capacity(2);

        if status.is_success() {
            let endpoint_tx = options.override_endpoint_url.is_none().then_some(endpoint_tx);
            tasks.push(tokio::spawn(read_stream(
                response,
                options.url.clone(),
                inbound_tx.clone(),
                endpoint_tx,
                shared.clone(),
                cancel.clone(),
            )));
        } else if status == StatusCode::METHOD_NOT_ALLOWED {
            // No standalone stream: every answer comes back inline
            info!("{} has no SSE stream, using inline POST responses", options.url);
            if options.override_endpoint_url.is_none() {
                endpoint_tx.send_replace(Some(options.url.clone()));
            }
        } else {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body: excerpt(&body),
            });
        }

        tasks.push(tokio::spawn(write_loop(
            client.clone(),
            options,
            outbound_rx,
            inbound_tx,
            endpoint_rx,
            shared.clone(),
            cancel.clone(),
        )));

        Ok(Self {
            inbound: inbound_rx,
            outbound: outbound_tx,
            shared,
            cancel,
            tasks,
        })
    }

    /// Cancels both tasks and waits for them to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(McpError::Cancelled);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| McpError::Disconnected)
    }

    async fn receive(&mut self) -> Option<Result<JsonRpcMessage>> {
        self.inbound.recv().await
    }

    fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().clone()
    }

    fn closed_reason(&self) -> McpError {
        if self.cancel.is_cancelled() && self.shared.failures.lock().is_empty() {
            return McpError::Cancelled;
        }
        McpError::from_group(std::mem::take(&mut *self.shared.failures.lock()))
    }
}

async fn read_stream(
    response: reqwest::Response,
    base: Url,
    inbound: mpsc::Sender<Inbound>,
    // None when the caller already supplied the write endpoint
    endpoint: Option<watch::Sender<Option<Url>>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut stream = response.bytes_stream().eventsource();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };

        match event {
            Some(Ok(event)) => {
                let frame = SseFrame::from(event);
                debug!("SSE event: {}", frame.event);
                if frame.is_endpoint() {
                    let Some(endpoint) = &endpoint else {
                        continue;
                    };
                    match base.join(frame.data.trim()) {
                        Ok(url) => {
                            debug!("Got endpoint: {}", url);
                            endpoint.send_replace(Some(url));
                        }
                        Err(e) => {
                            let error = McpError::Transport(format!(
                                "Invalid endpoint event '{}': {}",
                                frame.data, e
                            ));
                            if inbound.send(Err(error)).await.is_err() {
                                break;
                            }
                        }
                    }
                } else if frame.is_message() {
                    let parsed = frame.json().and_then(JsonRpcMessage::from_value);
                    if inbound.send(parsed).await.is_err() {
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                warn!("SSE stream error: {}", e);
                let error = McpError::Transport(format!("SSE stream error: {}", e));
                shared.record_failure(error.clone());
                let _ = inbound.send(Err(error)).await;
                break;
            }
            None => {
                debug!("SSE stream ended for {}", base);
                break;
            }
        }
    }
}

async fn write_loop(
    client: Client,
    options: TransportOptions,
    mut outbound: mpsc::Receiver<JsonRpcMessage>,
    inbound: mpsc::Sender<Inbound>,
    mut endpoint: watch::Receiver<Option<Url>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = post_message(&client, &options, &message, &mut endpoint, &shared, &inbound) => result,
        };

        if let Err(error) = result {
            warn!("POST failed: {}", error);
            shared.record_failure(error.clone());
            if inbound.send(Err(error)).await.is_err() {
                break;
            }
        }
    }
}

async fn wait_for_endpoint(
    endpoint: &mut watch::Receiver<Option<Url>>,
    timeout: Duration,
) -> Result<Url> {
    let waited = tokio::time::timeout(timeout, endpoint.wait_for(|url| url.is_some())).await;
    match waited {
        Ok(Ok(url)) => url
            .clone()
            .ok_or_else(|| McpError::Transport("endpoint vanished".to_string())),
        Ok(Err(_)) => Err(McpError::Transport(
            "SSE stream closed before announcing an endpoint".to_string(),
        )),
        Err(_) => Err(McpError::Timeout(format!(
            "No endpoint event within {:?}",
            timeout
        ))),
    }
}

async fn post_message(
    client: &Client,
    options: &TransportOptions,
    message: &JsonRpcMessage,
    endpoint: &mut watch::Receiver<Option<Url>>,
    shared: &Shared,
    inbound: &mpsc::Sender<Inbound>,
) -> Result<()> {
    let post_url = wait_for_endpoint(endpoint, options.connect_timeout).await?;
    let body = message.to_value()?;

    let mut request = client
        .post(post_url.clone())
        .headers(options.headers.clone())
        .header(ACCEPT, ACCEPT_BOTH)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .json(&body);
    let session_id = shared.session_id.lock().clone();
    if let Some(id) = session_id {
        request = request.header(&shared.session_header, id);
    }

    let response = request.send().await?;
    let status = response.status();
    shared.capture_session(response.headers());

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let text = response.text().await?;

    if !status.is_success() {
        return Err(McpError::Http {
            status: status.as_u16(),
            body: excerpt(&text),
        });
    }

    debug!("Sent {} via POST to {} ({})", message.method().unwrap_or("response"), post_url, status);

    // Inline answers are forwarded as if they came over the stream
    for value in decode_post_body(content_type.as_deref(), &text).await? {
        let forwarded = JsonRpcMessage::from_value(value);
        if inbound.send(forwarded).await.is_err() {
            break;
        }
    }
    Ok(())
}

fn excerpt(body: &str) -> String {
    const MAX: usize = 300;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_truncates_long_bodies() {
        let long = "x".repeat(400);
        let cut = excerpt(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.len(), 303);
        assert_eq!(excerpt("  short  "), "short");
    }

    #[test]
    fn test_options_reject_bad_header_names() {
        let url = Url::parse("http://localhost/mcp").unwrap();
        let options = TransportOptions::new(url, "Mcp-Session-Id").unwrap();
        let bad = vec![HeaderConfig {
            name: "bad header".to_string(),
            value: "x".to_string(),
        }];
        assert!(matches!(
            options.with_headers(&bad),
            Err(McpError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_endpoint_uses_preset_url() {
        let url = Url::parse("http://localhost/mcp/messages").unwrap();
        let (_tx, mut rx) = watch::channel(Some(url.clone()));
        let got = wait_for_endpoint(&mut rx, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got, url);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_endpoint_times_out() {
        let (_tx, mut rx) = watch::channel(None);
        let err = wait_for_endpoint(&mut rx, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout(_)));
    }
}
