//! Session cache keyed by endpoint.
//!
//! A server-assigned session is shared by every caller of an endpoint until
//! it reaches the TTL. When the server hands out none, each caller gets its
//! own stable local id, which never enters the shared cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::Result;

const LOCAL_PREFIX: &str = "local-";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionId {
    /// Handed out by the server; shared per endpoint.
    Server(String),
    /// Generated for one caller; never shared.
    Local(String),
}

impl SessionId {
    pub fn as_str(&self) -> &str {
        match self {
            SessionId::Server(id) | SessionId::Local(id) => id,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, SessionId::Server(_))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

tokio::task_local! {
    static CURRENT_CALLER: CallerId;
}

/// Identity of one concurrent caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerId(Uuid);

impl CallerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The caller of the running task, if it runs inside a [`CallerId::scope`].
    pub fn current() -> Option<Self> {
        CURRENT_CALLER.try_with(|caller| *caller).ok()
    }

    /// Runs `fut` as this caller.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT_CALLER.scope(self, fut).await
    }

    /// Runs `fut` as the enclosing caller, or as a new one when there is
    /// none. Every public call path goes through here, so a task keeps one
    /// identity for the whole call no matter which worker thread polls it.
    pub async fn scoped<F: Future>(fut: F) -> F::Output {
        match Self::current() {
            Some(_) => fut.await,
            None => Self::new().scope(fut).await,
        }
    }

    /// Local session id for this caller, namespaced by endpoint.
    pub fn local_session(&self, endpoint: &str) -> String {
        let mut hasher = DefaultHasher::new();
        endpoint.hash(&mut hasher);
        format!(
            "{}{}-{:08x}",
            LOCAL_PREFIX,
            self.0.simple(),
            hasher.finish() as u32
        )
    }
}

impl Default for CallerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Asks an endpoint for a server-assigned session.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    /// `Ok(None)` when the endpoint answers without a session header.
    async fn probe(&self, endpoint: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
struct CachedSession {
    id: String,
    created_at: Instant,
    issued_at: DateTime<Utc>,
}

/// Snapshot of a cached server session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub issued_at: DateTime<Utc>,
    pub age: Duration,
}

pub struct SessionStore {
    sessions: DashMap<String, CachedSession>,
    /// Serializes refreshes per endpoint without blocking other endpoints.
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    probe: Arc<dyn SessionProbe>,
    ttl: Duration,
    probe_timeout: Duration,
}

impl SessionStore {
    pub fn new(probe: Arc<dyn SessionProbe>, config: &SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            refresh_locks: DashMap::new(),
            probe,
            ttl: config.ttl(),
            probe_timeout: config.probe_timeout(),
        }
    }

    fn fresh(&self, endpoint: &str) -> Option<String> {
        let entry = self.sessions.get(endpoint)?;
        if entry.created_at.elapsed() < self.ttl {
            Some(entry.id.clone())
        } else {
            None
        }
    }

    fn refresh_lock(&self, endpoint: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns a usable session for `endpoint`. Expired sessions are
    /// replaced here; when the endpoint hands out none, the current caller's
    /// local id is used.
    pub async fn acquire(&self, endpoint: &str, force_refresh: bool) -> SessionId {
        if !force_refresh {
            if let Some(id) = self.fresh(endpoint) {
                return SessionId::Server(id);
            }
        }

        let lock = self.refresh_lock(endpoint);
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited
        if !force_refresh {
            if let Some(id) = self.fresh(endpoint) {
                return SessionId::Server(id);
            }
        }

        if self.sessions.remove(endpoint).is_some() {
            debug!("Dropped stale session for {}", endpoint);
        }

        match tokio::time::timeout(self.probe_timeout, self.probe.probe(endpoint)).await {
            Ok(Ok(Some(id))) if !id.starts_with(LOCAL_PREFIX) => {
                info!("Acquired session {} for {}", id, endpoint);
                self.insert(endpoint, id.clone());
                return SessionId::Server(id);
            }
            Ok(Ok(_)) => debug!("{} did not assign a session", endpoint),
            Ok(Err(e)) => warn!("Session probe against {} failed: {}", endpoint, e),
            Err(_) => warn!(
                "Session probe against {} timed out after {:?}",
                endpoint, self.probe_timeout
            ),
        }

        // Outside of any scope there is no caller to be stable for
        let caller = CallerId::current().unwrap_or_default();
        SessionId::Local(caller.local_session(endpoint))
    }

    /// Drops the cached server session so the next `acquire` re-probes.
    pub fn invalidate(&self, endpoint: &str) -> bool {
        let removed = self.sessions.remove(endpoint).is_some();
        if removed {
            info!("Invalidated session for {}", endpoint);
        }
        removed
    }

    /// Records a session id the server returned on a call made with `sent`.
    pub fn record(&self, endpoint: &str, sent: &SessionId, returned: Option<&str>) {
        let Some(id) = returned.filter(|id| !id.is_empty()) else {
            return;
        };
        if id == sent.as_str() || id.starts_with(LOCAL_PREFIX) {
            return;
        }
        if self.fresh(endpoint).as_deref() == Some(id) {
            return;
        }
        info!("Server rotated session for {} to {}", endpoint, id);
        self.insert(endpoint, id.to_string());
    }

    /// Caches a session learned outside of `acquire`, e.g. during discovery.
    pub fn record_server(&self, endpoint: &str, id: impl Into<String>) {
        let id = id.into();
        if id.is_empty() || id.starts_with(LOCAL_PREFIX) {
            return;
        }
        self.insert(endpoint, id);
    }

    fn insert(&self, endpoint: &str, id: String) {
        self.sessions.insert(
            endpoint.to_string(),
            CachedSession {
                id,
                created_at: Instant::now(),
                issued_at: Utc::now(),
            },
        );
    }

    pub fn cached(&self, endpoint: &str) -> Option<SessionInfo> {
        self.sessions.get(endpoint).map(|entry| SessionInfo {
            id: entry.id.clone(),
            issued_at: entry.issued_at,
            age: entry.created_at.elapsed(),
        })
    }
}
