use std::fmt;
use std::sync::{Arc, Weak};

use channel_plugin::{ChannelId, ChannelMetadata, ChannelState};
use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::bridge::{ChannelBridge, EVENT_CAPACITY};
use crate::channel::error::ChannelError;
use crate::channel::event::ChannelEvent;
use crate::channel::registration::ChannelRegistration;

struct RegistryEntry {
    registration: ChannelRegistration,
    bridge: Arc<dyn ChannelBridge>,
    relay: JoinHandle<()>,
}

struct RegistryShared {
    entries: Mutex<Vec<RegistryEntry>>,
    snapshot: watch::Sender<Vec<ChannelRegistration>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl RegistryShared {
    fn publish_snapshot(&self, entries: &[RegistryEntry]) {
        self.snapshot
            .send_replace(entries.iter().map(|e| e.registration.clone()).collect());
    }

    /// Applies a state change a bridge reported about itself, if it is legal here too.
    async fn mirror_state(&self, channel_id: &ChannelId, new: ChannelState, error_message: Option<String>) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.iter_mut().find(|e| e.registration.channel_id() == channel_id) else {
            return;
        };
        match entry.registration.with_state(new, Utc::now(), error_message) {
            Ok(updated) => {
                entry.registration = updated;
                self.publish_snapshot(&entries);
            }
            Err(e) => debug!(channel_id = %channel_id, error = %e, "bridge state not mirrored"),
        }
    }
}

/// Central table of registered channels and their bridges.
///
/// ```text
///   bridge A events ──relay──┐
///   bridge B events ──relay──┼──▶ subscribe()   (merged bus)
///   update_state ────────────┘
///   every mutation ─────────────▶ observe_all() (latest snapshot)
/// ```
#[derive(Clone)]
pub struct ChannelRegistry {
    shared: Arc<RegistryShared>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self
            .shared
            .snapshot
            .borrow()
            .iter()
            .map(|r| r.channel_id().to_string())
            .collect();
        f.debug_struct("ChannelRegistry").field("channels", &ids).finish()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(RegistryShared {
                entries: Mutex::new(Vec::new()),
                snapshot,
                events,
            }),
        }
    }

    pub async fn register(
        &self,
        metadata: ChannelMetadata,
        bridge: Arc<dyn ChannelBridge>,
    ) -> Result<ChannelRegistration, ChannelError> {
        metadata.validate()?;
        if bridge.channel_id() != &metadata.channel_id {
            return Err(ChannelError::ChannelMismatch {
                bridge: bridge.channel_id().clone(),
                metadata: metadata.channel_id.clone(),
            });
        }
        let channel_id = metadata.channel_id.clone();

        let mut entries = self.shared.entries.lock().await;
        if entries.iter().any(|e| e.registration.channel_id() == &channel_id) {
            return Err(ChannelError::AlreadyRegistered(channel_id));
        }
        let registration = ChannelRegistration::new(metadata, Utc::now());
        let relay = tokio::spawn(relay_bridge_events(
            Arc::downgrade(&self.shared),
            channel_id.clone(),
            bridge.subscribe(),
        ));
        entries.push(RegistryEntry {
            registration: registration.clone(),
            bridge,
            relay,
        });
        self.shared.publish_snapshot(&entries);
        info!(channel_id = %channel_id, "channel registered");
        Ok(registration)
    }

    /// Removes the channel and closes its bridge. Unknown ids are a no-op.
    pub async fn unregister(&self, channel_id: &ChannelId) -> Option<ChannelRegistration> {
        let entry = {
            let mut entries = self.shared.entries.lock().await;
            let index = entries.iter().position(|e| e.registration.channel_id() == channel_id)?;
            let entry = entries.remove(index);
            entry.relay.abort();
            self.shared.publish_snapshot(&entries);
            entry
        };
        entry.bridge.close().await;
        info!(channel_id = %channel_id, "channel unregistered");
        Some(entry.registration)
    }

    /// Moves a registered channel to `new_state` and announces it on the merged bus.
    pub async fn update_state(
        &self,
        channel_id: &ChannelId,
        new_state: ChannelState,
        error_message: Option<String>,
    ) -> Result<ChannelRegistration, ChannelError> {
        let mut entries = self.shared.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.registration.channel_id() == channel_id)
            .ok_or_else(|| ChannelError::NotFound(channel_id.clone()))?;
        let previous = entry.registration.state;
        let updated = entry.registration.with_state(new_state, Utc::now(), error_message)?;
        entry.registration = updated.clone();
        self.shared.publish_snapshot(&entries);
        let _ = self.shared.events.send(ChannelEvent::StateChanged {
            channel_id: channel_id.clone(),
            previous,
            new: new_state,
            error_message: updated.error_message.clone(),
        });
        if new_state == ChannelState::Error {
            warn!(channel_id = %channel_id, error = ?updated.error_message, "channel entered error state");
        }
        Ok(updated)
    }

    pub async fn find(&self, channel_id: &ChannelId) -> Option<ChannelRegistration> {
        self.shared
            .entries
            .lock()
            .await
            .iter()
            .find(|e| e.registration.channel_id() == channel_id)
            .map(|e| e.registration.clone())
    }

    pub async fn find_all(&self) -> Vec<ChannelRegistration> {
        self.shared
            .entries
            .lock()
            .await
            .iter()
            .map(|e| e.registration.clone())
            .collect()
    }

    pub async fn find_by_state(&self, state: ChannelState) -> Vec<ChannelRegistration> {
        self.shared
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.registration.state == state)
            .map(|e| e.registration.clone())
            .collect()
    }

    pub async fn get_bridge(&self, channel_id: &ChannelId) -> Option<Arc<dyn ChannelBridge>> {
        self.shared
            .entries
            .lock()
            .await
            .iter()
            .find(|e| e.registration.channel_id() == channel_id)
            .map(|e| e.bridge.clone())
    }

    /// Latest list of registrations, re-sent on every change.
    pub fn observe_all(&self) -> watch::Receiver<Vec<ChannelRegistration>> {
        self.shared.snapshot.subscribe()
    }

    /// Events of every registered bridge plus the registry's own state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Puts a host-side event (session lifecycle and the like) on the merged bus.
    pub fn publish(&self, event: ChannelEvent) {
        let _ = self.shared.events.send(event);
    }

    pub async fn shutdown(&self) {
        let ids: Vec<ChannelId> = self
            .find_all()
            .await
            .into_iter()
            .map(|r| r.channel_id().clone())
            .collect();
        for id in ids {
            self.unregister(&id).await;
        }
    }
}

async fn relay_bridge_events(
    shared: Weak<RegistryShared>,
    channel_id: ChannelId,
    mut events: broadcast::Receiver<ChannelEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(channel_id = %channel_id, skipped, "registry relay fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if let ChannelEvent::StateChanged { new, error_message, .. } = &event {
            shared.mirror_state(&channel_id, *new, error_message.clone()).await;
        }
        let _ = shared.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::pipe_bridge::PipeChannelBridge;
    use crate::session::SessionState;
    use channel_plugin::{ChannelAuthType, SessionId};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn ch(name: &str) -> ChannelId {
        ChannelId::new(format!("acme.{name}")).unwrap()
    }

    fn metadata(name: &str) -> ChannelMetadata {
        ChannelMetadata::new(ch(name), name, "test channel", ChannelAuthType::None).unwrap()
    }

    async fn register(registry: &ChannelRegistry, name: &str) -> Arc<PipeChannelBridge> {
        let bridge = Arc::new(PipeChannelBridge::new(ch(name)));
        registry.register(metadata(name), bridge.clone()).await.unwrap();
        bridge
    }

    #[tokio::test]
    async fn register_rejects_mismatch_and_duplicates() {
        let registry = ChannelRegistry::new();
        let err = registry
            .register(metadata("one"), Arc::new(PipeChannelBridge::new(ch("two"))))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ChannelMismatch { .. }));
        assert!(registry.find_all().await.is_empty());

        register(&registry, "one").await;
        let err = registry
            .register(metadata("one"), Arc::new(PipeChannelBridge::new(ch("one"))))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::AlreadyRegistered(_)));

        let reg = registry.find(&ch("one")).await.unwrap();
        assert_eq!(reg.state, ChannelState::Registered);
        assert!(registry.get_bridge(&ch("one")).await.is_some());
    }

    #[tokio::test]
    async fn update_state_validates_without_mutating() {
        let registry = ChannelRegistry::new();
        register(&registry, "one").await;
        let mut events = registry.subscribe();

        let err = registry
            .update_state(&ch("one"), ChannelState::Connected, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidTransition { .. }));
        assert_eq!(registry.find(&ch("one")).await.unwrap().state, ChannelState::Registered);

        let err = registry
            .update_state(&ch("ghost"), ChannelState::Connecting, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotFound(_)));

        registry
            .update_state(&ch("one"), ChannelState::Connecting, None)
            .await
            .unwrap();
        let updated = registry
            .update_state(&ch("one"), ChannelState::Error, None)
            .await
            .unwrap();
        assert_eq!(updated.error_message.as_deref(), Some("unspecified error"));
        assert_eq!(registry.find_by_state(ChannelState::Error).await.len(), 1);

        let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(
            first,
            ChannelEvent::StateChanged {
                channel_id: ch("one"),
                previous: ChannelState::Registered,
                new: ChannelState::Connecting,
                error_message: None,
            }
        );
    }

    #[tokio::test]
    async fn snapshots_follow_mutations_in_order() {
        let registry = ChannelRegistry::new();
        let mut snapshots = registry.observe_all();
        assert!(snapshots.borrow_and_update().is_empty());

        register(&registry, "b").await;
        register(&registry, "a").await;
        timeout(WAIT, snapshots.changed()).await.unwrap().unwrap();
        let ids: Vec<String> = snapshots
            .borrow_and_update()
            .iter()
            .map(|r| r.channel_id().to_string())
            .collect();
        assert_eq!(ids, vec!["acme.b", "acme.a"]);

        assert!(registry.unregister(&ch("b")).await.is_some());
        timeout(WAIT, snapshots.changed()).await.unwrap().unwrap();
        assert_eq!(snapshots.borrow().len(), 1);
    }

    #[tokio::test]
    async fn bridge_events_are_relayed_and_mirrored() {
        let registry = ChannelRegistry::new();
        let bridge = register(&registry, "one").await;
        let mut events = registry.subscribe();

        bridge.report_state_change(ChannelState::Connecting, None).await.unwrap();
        let relayed = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(relayed, ChannelEvent::StateChanged { new: ChannelState::Connecting, .. }));
        assert_eq!(registry.find(&ch("one")).await.unwrap().state, ChannelState::Connecting);

        registry.publish(ChannelEvent::SessionCreated {
            session_id: SessionId::from("s1"),
            channel_id: ch("one"),
        });
        registry.publish(ChannelEvent::SessionStateChanged {
            session_id: SessionId::from("s1"),
            channel_id: ch("one"),
            new_state: SessionState::Active,
        });
        assert!(matches!(
            timeout(WAIT, events.recv()).await.unwrap().unwrap(),
            ChannelEvent::SessionCreated { .. }
        ));
        assert!(matches!(
            timeout(WAIT, events.recv()).await.unwrap().unwrap(),
            ChannelEvent::SessionStateChanged { .. }
        ));
    }

    #[tokio::test]
    async fn unregister_closes_bridge_and_is_idempotent() {
        let registry = ChannelRegistry::new();
        let bridge = register(&registry, "one").await;
        register(&registry, "two").await;

        let removed = registry.unregister(&ch("one")).await.unwrap();
        assert_eq!(removed.channel_id(), &ch("one"));
        assert_eq!(bridge.state().await, ChannelState::Unregistered);
        assert!(registry.find(&ch("one")).await.is_none());
        assert!(registry.unregister(&ch("one")).await.is_none());

        // after unregister the bridge's events no longer reach the bus
        let mut events = registry.subscribe();
        let _ = bridge.report_state_change(ChannelState::Registered, None).await;
        assert!(timeout(Duration::from_millis(50), events.recv()).await.is_err());

        registry.shutdown().await;
        assert!(registry.find_all().await.is_empty());
    }
}
