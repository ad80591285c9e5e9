use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use channel_plugin::{ChannelId, ChannelMessage, SessionId};
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::io::queue::InboundMessageQueue;
use crate::logger::metrics;
use crate::session::SessionStore;

/// Signal to the agent runtime that a session has input waiting.
///
/// Must not block. Repeated wakes before the runtime drains may collapse into one.
pub trait RuntimeWaker: Send + Sync + 'static {
    fn wake(&self, session_id: &SessionId, channel_id: &ChannelId);
}

/// Collapsing waker for runtimes that poll from an async loop.
#[derive(Debug, Default)]
pub struct NotifyRuntimeWaker {
    pending: Mutex<Vec<(SessionId, ChannelId)>>,
    notify: Notify,
}

impl NotifyRuntimeWaker {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, Vec<(SessionId, ChannelId)>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits for at least one wake and returns every distinct pair seen since the last call.
    pub async fn next_wakes(&self) -> Vec<(SessionId, ChannelId)> {
        loop {
            let batch = std::mem::take(&mut *self.pending());
            if !batch.is_empty() {
                return batch;
            }
            self.notify.notified().await;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

impl RuntimeWaker for NotifyRuntimeWaker {
    fn wake(&self, session_id: &SessionId, channel_id: &ChannelId) {
        {
            let mut pending = self.pending();
            if !pending.iter().any(|(s, c)| s == session_id && c == channel_id) {
                pending.push((session_id.clone(), channel_id.clone()));
            }
        }
        self.notify.notify_one();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub session_id: SessionId,
    /// An older message of the session was dropped to make room.
    pub evicted: bool,
}

/// Moves decoded inbound messages into their session queue and wakes the runtime.
pub struct IoMessageDispatcher {
    queue: Arc<InboundMessageQueue>,
    waker: Arc<dyn RuntimeWaker>,
    sessions: Arc<dyn SessionStore>,
}

impl fmt::Debug for IoMessageDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoMessageDispatcher")
            .field("queue", &self.queue)
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl IoMessageDispatcher {
    pub fn new(
        queue: Arc<InboundMessageQueue>,
        waker: Arc<dyn RuntimeWaker>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self { queue, waker, sessions }
    }

    pub fn queue(&self) -> &Arc<InboundMessageQueue> {
        &self.queue
    }

    /// The message's session id is first treated as the platform's conversation
    /// id; if the store knows it, the host session id wins.
    pub async fn dispatch(&self, channel_id: &ChannelId, message: ChannelMessage) -> DispatchOutcome {
        let session_id = match self
            .sessions
            .find_by_remote(channel_id, message.session_id.as_str())
            .await
        {
            Some(session) => session.id,
            None => message.session_id.clone(),
        };

        let kept_all = self.queue.enqueue(&session_id, message);
        let attrs = [KeyValue::new("channel_id", channel_id.to_string())];
        metrics().messages_dispatched.add(1, &attrs);
        if !kept_all {
            metrics().messages_evicted.add(1, &attrs);
            warn!(session_id = %session_id, channel_id = %channel_id, "session queue full, dropped oldest message");
        }
        debug!(session_id = %session_id, channel_id = %channel_id, "inbound message queued");

        self.waker.wake(&session_id, channel_id);
        DispatchOutcome {
            session_id,
            evicted: !kept_all,
        }
    }
}
