use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::spawn;
use tokio::sync::RwLock;
use uuid::Uuid;

/// why a channel was closed
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CloseCause {
    /// closed by the connector tier itself, e.g. when a duplicate registration
    ///  replaces the channel
    System,
    /// no activity within the heartbeat threshold
    Timeout,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProtocolEvent {
    ChannelRegistered { channel: String },
    /// raw frame handed over by the transport, before any decoding
    Received { channel: String, data: Bytes },
    ReceiveSuccess { channel: String, data: Bytes },
    ReceiveError { channel: String, data: Bytes, error: String },
    Sent { channel: String, data: Bytes },
    Discarded { channel: String, data: Bytes },
    ChannelClosed { channel: String, cause: CloseCause },
    /// protocol extensions publish their own events without widening this enum
    Custom { name: String, data: Bytes },
}

#[async_trait::async_trait]
pub trait ProtocolEventListener: Sync + Send {
    async fn on_event(&self, event: ProtocolEvent);
}

/// Observability sink for everything the connector tier does. Implementations must be
///  thread safe, and `publish` must never block on a listener: protocol actions do not
///  wait for observability.
#[async_trait::async_trait]
pub trait EventBus: Sync + Send + 'static {
    async fn publish(&self, event: ProtocolEvent);

    async fn add_listener(&self, listener: Arc<dyn ProtocolEventListener>) -> Uuid;

    async fn try_remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()>;
}

/// Default bus used when the caller does not supply one: events are fanned out to a
///  snapshot of the registered listeners, each notification on its own task.
pub struct InProcessEventBus {
    listeners: RwLock<FxHashMap<Uuid, Arc<dyn ProtocolEventListener>>>,
}

impl InProcessEventBus {
    pub fn new() -> InProcessEventBus {
        InProcessEventBus {
            listeners: Default::default(),
        }
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventBus for InProcessEventBus {
    async fn publish(&self, event: ProtocolEvent) {
        let listeners = self.listeners.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for listener in listeners {
            let evt = event.clone();
            spawn(async move { listener.on_event(evt).await });
        }
    }

    async fn add_listener(&self, listener: Arc<dyn ProtocolEventListener>) -> Uuid {
        let id = Uuid::new_v4();
        self.listeners.write().await
            .insert(id, listener);
        id
    }

    async fn try_remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()> {
        match self.listeners.write().await
            .remove(listener_id)
        {
            None => Err(anyhow!("tried to remove a listener that was not (no longer?) registered: {}", listener_id)),
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::listener::CollectingEventListener;
    use std::time::Duration;
    use tokio::time;

    #[tokio::test]
    async fn test_publish_reaches_all_listeners() {
        let bus = InProcessEventBus::new();
        let first = Arc::new(CollectingEventListener::new());
        let second = Arc::new(CollectingEventListener::new());
        bus.add_listener(first.clone()).await;
        bus.add_listener(second.clone()).await;

        bus.publish(ProtocolEvent::ChannelRegistered { channel: "c1".to_string() }).await;
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(first.events(), vec![ProtocolEvent::ChannelRegistered { channel: "c1".to_string() }]);
        assert_eq!(second.events(), vec![ProtocolEvent::ChannelRegistered { channel: "c1".to_string() }]);
    }

    #[tokio::test]
    async fn test_removed_listener_is_not_notified() {
        let bus = InProcessEventBus::new();
        let listener = Arc::new(CollectingEventListener::new());
        let id = bus.add_listener(listener.clone()).await;

        bus.try_remove_listener(&id).await.unwrap();
        bus.publish(ProtocolEvent::ChannelRegistered { channel: "c1".to_string() }).await;
        time::sleep(Duration::from_millis(10)).await;

        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_listener_is_an_error() {
        let bus = InProcessEventBus::new();
        assert!(bus.try_remove_listener(&Uuid::new_v4()).await.is_err());
    }
}
