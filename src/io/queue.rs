use std::collections::VecDeque;

use channel_plugin::{ChannelMessage, SessionId};
use dashmap::DashMap;

use crate::io::error::IoError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Bounded FIFO of inbound messages per session; overflow drops the oldest.
#[derive(Debug)]
pub struct InboundMessageQueue {
    capacity: usize,
    queues: DashMap<SessionId, VecDeque<ChannelMessage>>,
}

impl Default for InboundMessageQueue {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            queues: DashMap::new(),
        }
    }
}

impl InboundMessageQueue {
    pub fn new(capacity: usize) -> Result<Self, IoError> {
        if capacity == 0 {
            return Err(IoError::InvalidInput("queue capacity must be positive".into()));
        }
        Ok(Self {
            capacity,
            queues: DashMap::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `message`; returns `false` when the oldest entry had to be evicted.
    pub fn enqueue(&self, session_id: &SessionId, message: ChannelMessage) -> bool {
        let mut queue = self.queues.entry(session_id.clone()).or_default();
        let mut kept_all = true;
        while queue.len() >= self.capacity {
            queue.pop_front();
            kept_all = false;
        }
        queue.push_back(message);
        kept_all
    }

    /// Removes and returns everything queued for the session, oldest first.
    pub fn drain(&self, session_id: &SessionId) -> Vec<ChannelMessage> {
        self.queues
            .remove(session_id)
            .map(|(_, queue)| queue.into())
            .unwrap_or_default()
    }

    pub fn size(&self, session_id: &SessionId) -> usize {
        self.queues.get(session_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn clear(&self, session_id: &SessionId) {
        self.queues.remove(session_id);
    }

    /// Sessions that currently have queued messages.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.queues
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel_plugin::plugin_helpers::build_text_message;
    use channel_plugin::{ChannelId, MessageDirection};

    fn msg(body: &str) -> ChannelMessage {
        build_text_message(
            &ChannelId::new("acme.chat").unwrap(),
            &SessionId::from("s1"),
            MessageDirection::Inbound,
            body,
        )
    }

    fn bodies(messages: &[ChannelMessage]) -> Vec<String> {
        messages
            .iter()
            .map(|m| match &m.content {
                channel_plugin::MessageContent::Text { body } => body.clone(),
                other => panic!("unexpected content {other:?}"),
            })
            .collect()
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(InboundMessageQueue::new(0).is_err());
        assert_eq!(InboundMessageQueue::default().capacity(), 100);
    }

    #[test]
    fn overflow_keeps_most_recent() {
        let queue = InboundMessageQueue::new(3).unwrap();
        let s = SessionId::from("s1");
        for body in ["a", "b", "c"] {
            assert!(queue.enqueue(&s, msg(body)));
        }
        assert!(!queue.enqueue(&s, msg("d")));
        assert_eq!(queue.size(&s), 3);
        assert_eq!(bodies(&queue.drain(&s)), vec!["b", "c", "d"]);
        assert_eq!(queue.size(&s), 0);
        assert!(queue.drain(&s).is_empty());
    }

    #[test]
    fn sessions_are_independent() {
        let queue = InboundMessageQueue::new(2).unwrap();
        let s1 = SessionId::from("s1");
        let s2 = SessionId::from("s2");
        queue.enqueue(&s1, msg("one"));
        queue.enqueue(&s2, msg("two"));
        queue.enqueue(&s2, msg("three"));

        let mut sessions = queue.sessions();
        sessions.sort();
        assert_eq!(sessions, vec![s1.clone(), s2.clone()]);

        queue.clear(&s2);
        assert_eq!(queue.size(&s2), 0);
        assert_eq!(bodies(&queue.drain(&s1)), vec!["one"]);
        assert!(queue.sessions().is_empty());
    }
}
