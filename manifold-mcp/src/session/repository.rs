//! Session persistence
//!
//! Streamable HTTP sessions survive process restarts by serializing their
//! filter and context into an external repository. The trait is the
//! integration point; the in-memory implementation backs tests and
//! single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::ProxyResult;
use crate::session::{DownstreamTransportKind, SessionContext, SessionFilter};

/// Serialized session state held by a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub filter: SessionFilter,
    pub enable_pagination: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<SessionContext>,
    pub transport_kind: DownstreamTransportKind,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

/// External store for session state
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persist a new session
    async fn create(&self, id: &str, state: PersistedSession) -> ProxyResult<()>;

    /// Load a session, if known
    async fn get(&self, id: &str) -> ProxyResult<Option<PersistedSession>>;

    /// Touch the last-access timestamp
    async fn update_access(&self, id: &str) -> ProxyResult<()>;

    /// Forget a session; unknown ids are not an error
    async fn delete(&self, id: &str) -> ProxyResult<()>;
}

/// Process-local repository
#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, PersistedSession>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the repository is empty
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, id: &str, state: PersistedSession) -> ProxyResult<()> {
        self.sessions.write().await.insert(id.to_string(), state);
        Ok(())
    }

    async fn get(&self, id: &str) -> ProxyResult<Option<PersistedSession>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn update_access(&self, id: &str) -> ProxyResult<()> {
        if let Some(state) = self.sessions.write().await.get_mut(id) {
            state.last_access = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> ProxyResult<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(kind: DownstreamTransportKind) -> PersistedSession {
        PersistedSession {
            filter: SessionFilter::Tags {
                tags: vec!["web".to_string()],
            },
            enable_pagination: true,
            custom_template: None,
            context: None,
            transport_kind: kind,
            created_at: Utc::now(),
            last_access: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let repo = InMemorySessionRepository::new();
        assert!(repo.get("s1").await.unwrap().is_none());

        repo.create("s1", state(DownstreamTransportKind::StreamableHttp))
            .await
            .unwrap();
        let loaded = repo.get("s1").await.unwrap().unwrap();
        assert!(loaded.enable_pagination);
        assert_eq!(
            loaded.transport_kind,
            DownstreamTransportKind::StreamableHttp
        );

        repo.delete("s1").await.unwrap();
        assert!(repo.get("s1").await.unwrap().is_none());

        // Deleting again is a no-op.
        repo.delete("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_access_touches_timestamp() {
        let repo = InMemorySessionRepository::new();
        let mut stale = state(DownstreamTransportKind::Sse);
        stale.last_access = Utc::now() - chrono::Duration::hours(1);
        repo.create("s1", stale.clone()).await.unwrap();

        repo.update_access("s1").await.unwrap();
        let loaded = repo.get("s1").await.unwrap().unwrap();
        assert!(loaded.last_access > stale.last_access);
    }

    #[test]
    fn test_persisted_state_round_trips_as_json() {
        let original = state(DownstreamTransportKind::StreamableHttp);
        let raw = serde_json::to_string(&original).unwrap();
        let back: PersistedSession = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.transport_kind, original.transport_kind);
        assert!(matches!(back.filter, SessionFilter::Tags { .. }));
    }
}
