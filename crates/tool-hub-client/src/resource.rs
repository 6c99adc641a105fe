use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{classify, FailureClass};
use crate::executor::{bounded, ResourceRequest, ToolBackend};
use crate::session::{CallerId, SessionStore};
use crate::types::ToolOutput;

/// Reads static resources as zero-argument calls. Single attempt.
pub struct ResourceReader {
    config: Arc<ClientConfig>,
    sessions: Arc<SessionStore>,
    backend: Arc<dyn ToolBackend>,
    cancel: CancellationToken,
}

impl ResourceReader {
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

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeouts.default_ms)
    }

    /// Reads `uri`; failures are reported under `label`.
    pub async fn read(&self, label: &str, uri: &str) -> ToolOutput {
        CallerId::scoped(self.read_as_caller(label, uri)).await
    }

    async fn read_as_caller(&self, label: &str, uri: &str) -> ToolOutput {
        let endpoint = self.config.endpoint.as_str();
        let session = self.sessions.acquire(endpoint, false).await;
        let timeout = self.timeout();
        debug!("Reading {} ({}) with session {}", label, uri, session);

        let request = ResourceRequest {
            endpoint: endpoint.to_string(),
            session: session.clone(),
            uri: uri.to_string(),
            timeout,
        };
        let outcome = bounded(
            &self.cancel,
            timeout,
            &format!("resources/read {}", uri),
            self.backend.read_resource(request),
        )
        .await;

        match outcome {
            Ok(reply) => {
                self.sessions
                    .record(endpoint, &session, reply.session_id.as_deref());
                ToolOutput::Success(reply.text)
            }
            Err(error) => {
                let error = error.root_cause();
                if matches!(classify(&error), FailureClass::Session | FailureClass::Conflict) {
                    self.sessions.invalidate(endpoint);
                }
                warn!("Reading {} failed: {}", uri, error);
                ToolOutput::Failure {
                    tool: label.to_string(),
                    reason: error.to_string(),
                    attempts: 1,
                }
            }
        }
    }
}
