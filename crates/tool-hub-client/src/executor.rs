use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ClientConfig;
use crate::error::{classify, FailureClass, McpError, Result};
use crate::session::{CallerId, SessionId, SessionStore};
use crate::types::{Catalogue, ToolOutput};

/// One `tools/call` exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub endpoint: String,
    pub session: SessionId,
    pub tool: String,
    pub arguments: Map<String, Value>,
    pub timeout: Duration,
}

/// One `resources/read` exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    pub endpoint: String,
    pub session: SessionId,
    pub uri: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallReply {
    /// Rendered content items
    pub text: String,
    /// Session header the server answered with, if any
    pub session_id: Option<String>,
}

/// What the engine needs from a live server. Each call owns its connection.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Handshake plus listing. Also returns the session header seen during
    /// the handshake.
    async fn discover(&self) -> Result<(Catalogue, Option<String>)>;
    async fn call_tool(&self, request: CallRequest) -> Result<CallReply>;
    async fn read_resource(&self, request: ResourceRequest) -> Result<CallReply>;
}

/// Drops `null` entries and injects configured flag defaults.
pub fn normalize_arguments(
    config: &ClientConfig,
    tool: &str,
    mut arguments: Map<String, Value>,
) -> Map<String, Value> {
    arguments.retain(|_, value| !value.is_null());
    for flag in config.flags_for(tool) {
        arguments
            .entry(flag.to_string())
            .or_insert(Value::Bool(false));
    }
    arguments
}

/// Runs `future` under a hard deadline that a shutdown can cut short.
pub(crate) async fn bounded<T>(
    cancel: &CancellationToken,
    deadline: Duration,
    what: &str,
    future: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(McpError::Cancelled),
        outcome = tokio::time::timeout(deadline, future) => match outcome {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout(format!(
                "{} exceeded {:?}",
                what, deadline
            ))),
        },
    }
}

/// Executes tool calls with timeout tiers, retries and session repair.
pub struct ToolInvoker {
    config: Arc<ClientConfig>,
    sessions: Arc<SessionStore>,
    backend: Arc<dyn ToolBackend>,
    cancel: CancellationToken,
}

impl ToolInvoker {
    pub fn new(
        config: Arc<ClientConfig>,
        sessions: Arc<SessionStore>,
        backend: Arc<dyn ToolBackend>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            sessions,
            backend,
            cancel,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Invokes `tool`. Remote failures come back as [`ToolOutput::Failure`].
    ///
    /// Runs as the enclosing [`CallerId`], or as a fresh one, so concurrent
    /// tasks never share a local session.
    pub async fn invoke(&self, tool: &str, arguments: Map<String, Value>) -> ToolOutput {
        CallerId::scoped(self.invoke_as_caller(tool, arguments)).await
    }

    async fn invoke_as_caller(&self, tool: &str, arguments: Map<String, Value>) -> ToolOutput {
        let arguments = normalize_arguments(&self.config, tool, arguments);
        let timeout = self.config.timeout_for(tool);
        let max_attempts = self.config.retry.max_retries.max(1);
        let endpoint = self.config.endpoint.as_str();

        let mut attempt = 1;
        let mut force_refresh = false;
        let mut session_repaired = false;

        loop {
            if self.cancel.is_cancelled() {
                return failure(tool, &McpError::Cancelled, attempt - 1);
            }

            let session = self.sessions.acquire(endpoint, force_refresh).await;
            force_refresh = false;
            debug!(
                "Calling {} (attempt {}/{}, session {}, timeout {:?})",
                tool, attempt, max_attempts, session, timeout
            );

            let request = CallRequest {
                endpoint: endpoint.to_string(),
                session: session.clone(),
                tool: tool.to_string(),
                arguments: arguments.clone(),
                timeout,
            };
            let outcome = bounded(
                &self.cancel,
                timeout,
                &format!("tools/call {}", tool),
                self.backend.call_tool(request),
            )
            .await;

            let error = match outcome {
                Ok(reply) => {
                    self.sessions
                        .record(endpoint, &session, reply.session_id.as_deref());
                    return ToolOutput::Success(reply.text);
                }
                Err(error) => error.root_cause(),
            };

            match classify(&error) {
                FailureClass::UnknownTool => {
                    error!("{} is not known to {}: {}", tool, endpoint, error);
                    return failure(tool, &error, attempt);
                }
                FailureClass::Session => {
                    self.sessions.invalidate(endpoint);
                    if !session_repaired {
                        // Same attempt number, outside the retry budget
                        warn!("{} rejected session {}, refreshing: {}", endpoint, session, error);
                        session_repaired = true;
                        force_refresh = true;
                        continue;
                    }
                }
                FailureClass::Conflict => {
                    warn!(
                        "Session conflict (409) on {} for {}, rotating session: {}",
                        tool, endpoint, error
                    );
                    self.sessions.invalidate(endpoint);
                }
                FailureClass::Transport | FailureClass::Timeout | FailureClass::Protocol => {}
            }

            if matches!(error, McpError::Cancelled) {
                return failure(tool, &error, attempt);
            }

            if attempt >= max_attempts {
                error!(
                    "{} failed after {} attempt(s): {}",
                    tool, attempt, error
                );
                return failure(tool, &error, attempt);
            }

            let delay = self.config.retry.backoff(attempt);
            warn!(
                "{} attempt {}/{} failed: {}. Retrying in {:?}",
                tool, attempt, max_attempts, error, delay
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return failure(tool, &McpError::Cancelled, attempt);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

fn failure(tool: &str, error: &McpError, attempts: u32) -> ToolOutput {
    ToolOutput::Failure {
        tool: tool.to_string(),
        reason: error.to_string(),
        attempts,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::{CallerId, SessionProbe};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    pub(crate) const ENDPOINT: &str = "http://hub.local/mcp";

    /// Backend answering from a script; once the script is empty every call
    /// gets `fallback`.
    pub(crate) struct ScriptedBackend {
        pub calls: Mutex<Vec<CallRequest>>,
        pub reads: Mutex<Vec<ResourceRequest>>,
        pub probes: AtomicUsize,
        script: Mutex<VecDeque<Result<CallReply>>>,
        fallback: Result<CallReply>,
        assigns_sessions: bool,
        delay: Duration,
        catalogue: Option<Catalogue>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(fallback: Result<CallReply>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                reads: Mutex::new(Vec::new()),
                probes: AtomicUsize::new(0),
                script: Mutex::new(VecDeque::new()),
                fallback,
                assigns_sessions: false,
                delay: Duration::ZERO,
                catalogue: None,
            }
        }

        pub(crate) fn succeeding(text: &str) -> Self {
            Self::new(Ok(reply(text)))
        }

        pub(crate) fn then(self, step: Result<CallReply>) -> Self {
            self.script.lock().unwrap().push_back(step);
            self
        }

        pub(crate) fn with_server_sessions(mut self) -> Self {
            self.assigns_sessions = true;
            self
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn with_catalogue(mut self, catalogue: Catalogue) -> Self {
            self.catalogue = Some(catalogue);
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub(crate) fn probe_count(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<CallReply> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    pub(crate) fn reply(text: &str) -> CallReply {
        CallReply {
            text: text.to_string(),
            session_id: None,
        }
    }

    #[async_trait]
    impl ToolBackend for ScriptedBackend {
        async fn discover(&self) -> Result<(Catalogue, Option<String>)> {
            match &self.catalogue {
                Some(catalogue) => Ok((catalogue.clone(), Some("srv-discovery".to_string()))),
                None => Err(McpError::Connection("connection refused".to_string())),
            }
        }

        async fn call_tool(&self, request: CallRequest) -> Result<CallReply> {
            self.calls.lock().unwrap().push(request);
            tokio::time::sleep(self.delay).await;
            self.next()
        }

        async fn read_resource(&self, request: ResourceRequest) -> Result<CallReply> {
            self.reads.lock().unwrap().push(request);
            tokio::time::sleep(self.delay).await;
            self.next()
        }
    }

    #[async_trait]
    impl SessionProbe for ScriptedBackend {
        async fn probe(&self, _endpoint: &str) -> Result<Option<String>> {
            let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.assigns_sessions.then(|| format!("srv-{}", n)))
        }
    }

    pub(crate) fn test_config() -> ClientConfig {
        let mut config = ClientConfig::new(ENDPOINT);
        config.retry.base_delay_ms = 100;
        config
    }

    fn invoker(config: ClientConfig, backend: Arc<ScriptedBackend>) -> ToolInvoker {
        let sessions = Arc::new(SessionStore::new(backend.clone(), &config.session));
        ToolInvoker::new(
            Arc::new(config),
            sessions,
            backend,
            CancellationToken::new(),
        )
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_and_backoff() {
        let backend = Arc::new(ScriptedBackend::new(Err(McpError::Transport(
            "connection reset".to_string(),
        ))));
        let invoker = invoker(test_config(), backend.clone());

        let started = Instant::now();
        let output = invoker.invoke("weather.brief", Map::new()).await;
        let elapsed = started.elapsed();

        assert_eq!(backend.call_count(), 3);
        // 2*base + 4*base, nothing after the last attempt
        assert!(elapsed >= Duration::from_millis(600), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(800), "{:?}", elapsed);

        let text = output.text();
        assert!(text.starts_with("Error executing tool weather.brief: "));
        assert!(text.contains('3'));
        assert!(text.contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failure() {
        let backend = Arc::new(
            ScriptedBackend::succeeding("sunny")
                .then(Err(McpError::Timeout("slow".to_string()))),
        );
        let invoker = invoker(test_config(), backend.clone());

        let output = invoker.invoke("weather.brief", Map::new()).await;
        assert_eq!(output, ToolOutput::Success("sunny".to_string()));
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_error_refreshes_once_outside_budget() {
        let backend = Arc::new(
            ScriptedBackend::succeeding("ok")
                .with_server_sessions()
                .then(Err(McpError::Http {
                    status: 400,
                    body: "Bad Request: No valid session ID provided".to_string(),
                })),
        );
        let mut config = test_config();
        config.retry.max_retries = 1;
        let invoker = invoker(config, backend.clone());

        let output = invoker.invoke("health.ping", Map::new()).await;
        assert!(output.is_success());
        assert_eq!(backend.call_count(), 2);
        assert_eq!(backend.probe_count(), 2);

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls[0].session.as_str(), "srv-1");
        assert_eq!(calls[1].session.as_str(), "srv-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_session_errors_use_normal_retries() {
        let backend = Arc::new(
            ScriptedBackend::new(Err(McpError::Http {
                status: 400,
                body: "bad session".to_string(),
            }))
            .with_server_sessions(),
        );
        let invoker = invoker(test_config(), backend.clone());

        let output = invoker.invoke("health.ping", Map::new()).await;
        assert!(!output.is_success());
        // 3 budgeted attempts plus the single refresh retry
        assert_eq!(backend.call_count(), 4);
        assert!(output.text().contains("3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_rotates_session() {
        let backend = Arc::new(
            ScriptedBackend::succeeding("done")
                .with_server_sessions()
                .then(Err(McpError::Transport(
                    "Client error '409 Conflict' for url".to_string(),
                ))),
        );
        let invoker = invoker(test_config(), backend.clone());

        assert!(invoker.invoke("booking.search", Map::new()).await.is_success());
        let calls = backend.calls.lock().unwrap();
        assert_ne!(calls[0].session, calls[1].session);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_tool_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(Err(McpError::Protocol {
            code: -32601,
            message: "Unknown tool: nope".to_string(),
        })));
        let invoker = invoker(test_config(), backend.clone());

        let output = invoker.invoke("nope", Map::new()).await;
        assert_eq!(backend.call_count(), 1);
        assert!(output.text().contains("1 attempt"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_is_unwrapped_in_message() {
        let backend = Arc::new(ScriptedBackend::new(Err(McpError::Aggregate(vec![
            McpError::Connection("refused".to_string()),
            McpError::Transport("stream closed".to_string()),
        ]))));
        let mut config = test_config();
        config.retry.max_retries = 1;
        let invoker = invoker(config, backend);

        let text = invoker.invoke("health.ping", Map::new()).await.text();
        assert!(text.contains("Connection error: refused"));
        assert!(!text.contains("concurrent failures"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_tier_bounds_each_attempt() {
        let backend = Arc::new(
            ScriptedBackend::succeeding("late").with_delay(Duration::from_secs(3600)),
        );
        let mut config = test_config();
        config.apply_profile(crate::config::Profile::FastTest);
        let invoker = invoker(config, backend.clone());

        let started = Instant::now();
        let output = invoker.invoke("geo.text_to_place", Map::new()).await;
        assert!(output.text().contains("Timeout"));
        assert_eq!(backend.call_count(), 1);
        assert!(started.elapsed() < Duration::from_secs(46));
    }

    #[tokio::test]
    async fn test_arguments_are_normalized() {
        let backend = Arc::new(ScriptedBackend::succeeding("ok"));
        let invoker = invoker(test_config(), backend.clone());

        invoker
            .invoke("images.hero", args(json!({"a": 1, "b": null})))
            .await;
        invoker
            .invoke("images.hero", args(json!({"force_refresh": true})))
            .await;
        invoker.invoke("weather.brief", args(json!({"a": 1, "b": null}))).await;

        let calls = backend.calls.lock().unwrap();
        assert_eq!(Value::Object(calls[0].arguments.clone()), json!({"a": 1, "force_refresh": false}));
        assert_eq!(Value::Object(calls[1].arguments.clone()), json!({"force_refresh": true}));
        assert_eq!(Value::Object(calls[2].arguments.clone()), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_concurrent_callers_keep_separate_local_sessions() {
        let backend = Arc::new(ScriptedBackend::succeeding("ok"));
        let invoker = invoker(test_config(), backend.clone());

        tokio::join!(
            CallerId::new().scope(invoker.invoke("health.ping", Map::new())),
            CallerId::new().scope(invoker.invoke("health.ping", Map::new())),
        );

        let calls = backend.calls.lock().unwrap();
        assert!(!calls[0].session.is_server());
        assert!(!calls[1].session.is_server());
        assert_ne!(calls[0].session, calls[1].session);
    }

    #[tokio::test]
    async fn test_cancelled_invoker_fails_fast() {
        let backend = Arc::new(ScriptedBackend::succeeding("ok"));
        let config = Arc::new(test_config());
        let sessions = Arc::new(SessionStore::new(backend.clone(), &config.session));
        let cancel = CancellationToken::new();
        let invoker = ToolInvoker::new(config, sessions, backend.clone(), cancel.clone());

        cancel.cancel();
        let output = invoker.invoke("health.ping", Map::new()).await;
        assert!(!output.is_success());
        assert_eq!(backend.call_count(), 0);
    }
}
