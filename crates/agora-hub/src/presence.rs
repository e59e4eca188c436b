use crate::fanout::{Broadcaster, FanoutReport};
use agora_core::wire::{BroadcastMessage, OutboundEvent, WireError};
use tracing::{info, warn};

impl Broadcaster {
    /// Presence event built from the registry as it is right now.
    pub async fn presence_message(&self) -> Result<BroadcastMessage, WireError> {
        let users = self.registry().snapshot().await;
        BroadcastMessage::encode(&OutboundEvent::presence(users))
    }

    /// Broadcasts the current participant list. Called after every
    /// registration and unregistration.
    pub async fn publish_presence(&self) -> FanoutReport {
        match self.presence_message().await {
            Ok(message) => {
                let report = self.broadcast(&message).await;
                info!(
                    event = "presence_published",
                    recipients = report.delivered,
                    pruned = report.pruned.len()
                );
                report
            }
            Err(err) => {
                warn!(event = "presence_encode_failed", error = %err);
                FanoutReport::default()
            }
        }
    }

    /// Room-wide system notice, e.g. join/leave announcements.
    pub async fn announce(&self, content: impl Into<String>) -> FanoutReport {
        match BroadcastMessage::encode(&OutboundEvent::system(content)) {
            Ok(message) => self.broadcast(&message).await,
            Err(err) => {
                warn!(event = "system_encode_failed", error = %err);
                FanoutReport::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionRegistry, TransportHandle};
    use serde_json::Value;
    use std::sync::Arc;

    #[tokio::test]
    async fn publish_sends_full_snapshot_to_everyone() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let (a, mut rx_a) = TransportHandle::channel(8);
        let (b, mut rx_b) = TransportHandle::channel(8);
        registry.register("a", "Ann", a).await;
        registry.register("b", "Bo", b).await;

        let report = broadcaster.publish_presence().await;
        assert_eq!(report.delivered, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = rx.try_recv().expect("presence frame");
            let value: Value = serde_json::from_str(&frame).expect("json");
            assert_eq!(
                value,
                serde_json::json!({
                    "type": "user_list_update",
                    "users": [{"id": "a", "name": "Ann"}, {"id": "b", "name": "Bo"}]
                })
            );
        }
    }

    #[tokio::test]
    async fn publish_on_empty_room_is_harmless() {
        let broadcaster = Broadcaster::new(Arc::new(ConnectionRegistry::new()));
        assert_eq!(broadcaster.publish_presence().await, FanoutReport::default());
    }

    #[tokio::test]
    async fn announce_sends_system_event() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let (a, mut rx_a) = TransportHandle::channel(8);
        registry.register("a", "Ann", a).await;

        broadcaster.announce("Ann joined the chat").await;
        let frame = rx_a.try_recv().expect("system frame");
        let value: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["type"], "system");
        assert_eq!(value["content"], "Ann joined the chat");
    }
}
