use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use channel_plugin::{ChannelId, SessionId};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use tracing::info;

use crate::io::error::IoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    Active,
    Suspended,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Active) | (Pending, Closed) | (Active, Suspended) | (Active, Closed) | (Suspended, Active) | (Suspended, Closed)
        )
    }
}

/// A conversation on one channel, keyed by the platform's own id for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Session {
    pub id: SessionId,
    pub channel_id: ChannelId,
    pub remote_id: String,
    pub display_name: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(channel_id: ChannelId, remote_id: impl Into<String>) -> Result<Self, IoError> {
        let remote_id = remote_id.into();
        if remote_id.trim().is_empty() {
            return Err(IoError::InvalidInput("session remote id must not be blank".into()));
        }
        let now = Utc::now();
        Ok(Self {
            id: SessionId::random(),
            channel_id,
            remote_id,
            display_name: None,
            state: SessionState::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_state(&self, next: SessionState) -> Result<Self, IoError> {
        if !self.state.can_transition_to(next) {
            return Err(IoError::InvalidInput(format!(
                "session {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        Ok(Self {
            state: next,
            updated_at: Utc::now(),
            ..self.clone()
        })
    }
}

/// Lookup of host sessions, owned outside the I/O layer.
#[async_trait]
pub trait SessionStore: Send + Sync + Debug + 'static {
    /// Resolves a platform-native conversation id to the host session.
    async fn find_by_remote(&self, channel_id: &ChannelId, remote_id: &str) -> Option<Session>;

    async fn find_by_id(&self, session_id: &SessionId) -> Option<Session>;

    /// Inserts or replaces a session.
    async fn save(&self, session: Session);

    async fn remove(&self, session_id: &SessionId) -> Option<Session>;
}

fn remote_key(channel_id: &ChannelId, remote_id: &str) -> String {
    format!("{channel_id}|{remote_id}")
}

#[derive(Clone, Debug)]
pub struct InMemorySessionStore {
    by_id: Cache<SessionId, Session>,
    by_remote: Cache<String, SessionId>, // channel|remote -> session id
}

impl InMemorySessionStore {
    /// Sessions idle for longer than `ttl` are dropped.
    pub fn new(ttl: Duration) -> Arc<Self> {
        let by_id = Cache::builder()
            .time_to_idle(ttl)
            .eviction_listener(|key: Arc<SessionId>, _value: Session, cause| {
                info!(session_id = %key, ?cause, "session evicted");
            })
            .build();
        let by_remote = Cache::builder().time_to_idle(ttl).build();
        Arc::new(Self { by_id, by_remote })
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn find_by_remote(&self, channel_id: &ChannelId, remote_id: &str) -> Option<Session> {
        let id = self.by_remote.get(&remote_key(channel_id, remote_id)).await?;
        self.by_id.get(&id).await
    }

    async fn find_by_id(&self, session_id: &SessionId) -> Option<Session> {
        self.by_id.get(session_id).await
    }

    async fn save(&self, session: Session) {
        self.by_remote
            .insert(remote_key(&session.channel_id, &session.remote_id), session.id.clone())
            .await;
        self.by_id.insert(session.id.clone(), session).await;
    }

    async fn remove(&self, session_id: &SessionId) -> Option<Session> {
        let session = self.by_id.remove(session_id).await?;
        self.by_remote
            .invalidate(&remote_key(&session.channel_id, &session.remote_id))
            .await;
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn ch() -> ChannelId {
        ChannelId::new("acme.chat").unwrap()
    }

    #[test]
    fn session_state_adjacency() {
        use SessionState::*;
        let allowed = [
            (Pending, Active),
            (Pending, Closed),
            (Active, Suspended),
            (Active, Closed),
            (Suspended, Active),
            (Suspended, Closed),
        ];
        for from in SessionState::iter() {
            for to in SessionState::iter() {
                assert_eq!(from.can_transition_to(to), allowed.contains(&(from, to)), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn with_state_validates() {
        let session = Session::new(ch(), "chat-42").unwrap();
        let active = session.with_state(SessionState::Active).unwrap();
        assert_eq!(active.id, session.id);
        assert!(active.with_state(SessionState::Pending).is_err());
        assert!(Session::new(ch(), " ").is_err());
    }

    #[tokio::test]
    async fn finds_by_remote_and_id() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        let session = Session::new(ch(), "chat-42").unwrap();
        store.save(session.clone()).await;

        assert_eq!(store.find_by_remote(&ch(), "chat-42").await, Some(session.clone()));
        assert_eq!(store.find_by_id(&session.id).await, Some(session.clone()));
        assert!(store.find_by_remote(&ch(), "chat-43").await.is_none());

        let other = ChannelId::new("acme.other").unwrap();
        assert!(store.find_by_remote(&other, "chat-42").await.is_none());

        assert_eq!(store.remove(&session.id).await, Some(session.clone()));
        assert!(store.find_by_remote(&ch(), "chat-42").await.is_none());
        assert!(store.remove(&session.id).await.is_none());
    }
}
