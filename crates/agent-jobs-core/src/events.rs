//! Publish/subscribe bus for agent lifecycle events.
//!
//! The bus is process-wide and shared by every active relay. Listeners are
//! registered per [`EventKind`] and identified by a [`SubscriptionId`] token,
//! so removal is explicit and can be checked.

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Kind of lifecycle event, used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Incremental output chunk.
    Stream,
    /// Task finished with a result.
    Completed,
    /// Task finished with an error.
    Failed,
}

impl EventKind {
    /// All kinds, in the order relays subscribe to them.
    pub const ALL: [Self; 3] = [Self::Stream, Self::Completed, Self::Failed];
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventPayload {
    Stream { content: String },
    Completed { result: Value },
    Failed { error: String },
}

/// Event emitted by the engine, tagged with the agent that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub agent_id: String,
    pub payload: AgentEventPayload,
}

impl AgentEvent {
    pub fn stream(agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            payload: AgentEventPayload::Stream {
                content: content.into(),
            },
        }
    }

    pub fn completed(agent_id: impl Into<String>, result: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            payload: AgentEventPayload::Completed { result },
        }
    }

    pub fn failed(agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            payload: AgentEventPayload::Failed {
                error: error.into(),
            },
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self.payload {
            AgentEventPayload::Stream { .. } => EventKind::Stream,
            AgentEventPayload::Completed { .. } => EventKind::Completed,
            AgentEventPayload::Failed { .. } => EventKind::Failed,
        }
    }
}

/// Token identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Listener {
    id: SubscriptionId,
    sender: mpsc::UnboundedSender<AgentEvent>,
}

#[derive(Default)]
struct Inner {
    listeners: HashMap<EventKind, Vec<Listener>>,
}

/// Event bus keyed by event kind.
#[derive(Default)]
pub struct EventBus {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind.
    pub fn subscribe(
        &self,
        kind: EventKind,
        sender: mpsc::UnboundedSender<AgentEvent>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .entry(kind)
            .or_default()
            .push(Listener { id, sender });
        id
    }

    /// Register one listener per kind, all feeding the same channel.
    ///
    /// Events reach the returned set in publish order regardless of kind.
    #[must_use]
    pub fn subscribe_all(self: &Arc<Self>, kinds: &[EventKind]) -> SubscriptionSet {
        let (tx, rx) = mpsc::unbounded_channel();
        let ids = kinds
            .iter()
            .map(|kind| self.subscribe(*kind, tx.clone()))
            .collect();
        SubscriptionSet {
            bus: Arc::clone(self),
            ids,
            rx,
            released: false,
        }
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for listeners in inner.listeners.values_mut() {
            if let Some(pos) = listeners.iter().position(|l| l.id == id) {
                listeners.swap_remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver an event to every listener of its kind.
    ///
    /// Returns the number of listeners the event reached. Listeners whose
    /// receiving side is gone are dropped.
    pub fn publish(&self, event: &AgentEvent) -> usize {
        let kind = event.kind();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(listeners) = inner.listeners.get_mut(&kind) else {
            return 0;
        };

        let mut delivered = 0;
        listeners.retain(|listener| {
            if listener.sender.send(event.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                tracing::debug!(subscription = %listener.id, ?kind, "dropping closed listener");
                false
            }
        });
        delivered
    }

    /// Number of listeners registered for a kind.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Number of listeners across all kinds.
    #[must_use]
    pub fn total_listeners(&self) -> usize {
        EventKind::ALL
            .iter()
            .map(|kind| self.listener_count(*kind))
            .sum()
    }
}

/// A group of subscriptions sharing one receiving channel.
///
/// Releasing is idempotent and also happens on drop.
pub struct SubscriptionSet {
    bus: Arc<EventBus>,
    ids: Vec<SubscriptionId>,
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    released: bool,
}

impl SubscriptionSet {
    /// Wait for the next event. Returns `None` once released and drained.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        if self.released {
            return self.rx.try_recv().ok();
        }
        self.rx.recv().await
    }

    /// Take an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.rx.try_recv().ok()
    }

    #[must_use]
    pub fn ids(&self) -> &[SubscriptionId] {
        &self.ids
    }

    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Deregister every subscription in the set.
    ///
    /// Returns how many listeners this call removed; a second call removes none.
    pub fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        let removed = self
            .ids
            .iter()
            .filter(|id| self.bus.unsubscribe(**id))
            .count();
        tracing::debug!(removed, "released subscriptions");
        removed
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_routes_by_kind() {
        let bus = Arc::new(EventBus::new());
        let mut set = bus.subscribe_all(&[EventKind::Completed]);

        assert_eq!(bus.publish(&AgentEvent::stream("a", "chunk")), 0);
        assert_eq!(bus.publish(&AgentEvent::completed("a", json!("done"))), 1);

        let event = set.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::Completed);
        assert!(set.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_events_keep_publish_order_across_kinds() {
        let bus = Arc::new(EventBus::new());
        let mut set = bus.subscribe_all(&EventKind::ALL);

        bus.publish(&AgentEvent::stream("a", "1"));
        bus.publish(&AgentEvent::stream("a", "2"));
        bus.publish(&AgentEvent::failed("a", "x"));

        let kinds: Vec<_> = std::iter::from_fn(|| set.try_recv())
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, vec![EventKind::Stream, EventKind::Stream, EventKind::Failed]);
    }

    #[test]
    fn test_recv_wakes_on_publish() {
        let bus = Arc::new(EventBus::new());
        let mut set = bus.subscribe_all(&[EventKind::Stream]);
        let mut recv = tokio_test::task::spawn(set.recv());
        tokio_test::assert_pending!(recv.poll());

        bus.publish(&AgentEvent::stream("a", "x"));
        assert!(recv.is_woken());
        let event = tokio_test::assert_ready!(recv.poll());
        assert_eq!(event.map(|e| e.agent_id), Some("a".to_string()));
    }

    #[test]
    fn test_release_is_idempotent() {
        let bus = Arc::new(EventBus::new());
        let mut set = bus.subscribe_all(&EventKind::ALL);
        assert_eq!(bus.total_listeners(), 3);

        assert_eq!(set.release(), 3);
        assert_eq!(set.release(), 0);
        assert!(set.is_released());
        assert_eq!(bus.total_listeners(), 0);
        assert_eq!(bus.publish(&AgentEvent::completed("a", json!(null))), 0);
    }

    #[test]
    fn test_drop_releases() {
        let bus = Arc::new(EventBus::new());
        let other = bus.subscribe_all(&[EventKind::Stream]);
        {
            let _set = bus.subscribe_all(&EventKind::ALL);
            assert_eq!(bus.total_listeners(), 4);
        }
        assert_eq!(bus.total_listeners(), 1);
        assert_eq!(other.ids().len(), 1);
    }

    #[test]
    fn test_unsubscribe_unknown_token() {
        let bus = EventBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = bus.subscribe(EventKind::Failed, tx);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
    }
}
